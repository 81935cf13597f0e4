//! `agentcore init-shared-fs`

use std::path::Path;

use anyhow::{Context, Result};

use agentcore::config::{AppConfig, agentcore_dir};
use agentcore::profiles;

const LAYOUT: [&str; 4] = ["profiles", "repos", "jobs", "job-state"];

pub fn cmd_init_shared_fs(shared_root: Option<&Path>) -> Result<()> {
    let root = shared_root
        .map(Path::to_path_buf)
        .unwrap_or_else(agentcore_dir);
    let written = init_layout(&root)?;

    println!("Initialized shared layout at {}", root.display());
    for dir in LAYOUT {
        println!("  {}/", root.join(dir).display());
    }
    if written.is_empty() {
        println!("Bundled profiles already present.");
    } else {
        println!("Wrote {} bundled profile file(s).", written.len());
    }

    let config = AppConfig::rooted_at(&root);
    println!();
    println!("Point workers at it with:");
    println!("  AGENTCORE_REPOS_ROOT={}", config.repos.root.display());
    println!("  AGENTCORE_STORE_ROOT={}", config.store.root.display());
    println!("  AGENTCORE_JOB_CONFIG_ROOT={}", config.agent.job_config_root.display());
    println!(
        "  AGENTCORE_PROFILE_DIRS={}",
        root.join("profiles").display()
    );
    Ok(())
}

/// Create the directory layout and copy bundled profiles. Idempotent.
fn init_layout(root: &Path) -> Result<Vec<std::path::PathBuf>> {
    for dir in LAYOUT {
        let path = root.join(dir);
        std::fs::create_dir_all(&path)
            .with_context(|| format!("Failed to create {}", path.display()))?;
    }
    profiles::write_bundled(&root.join("profiles")).context("Failed to write bundled profiles")
}
