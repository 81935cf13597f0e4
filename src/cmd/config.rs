//! `agentcore config`: print the effective configuration.

use std::path::Path;

use anyhow::{Context, Result};

use agentcore::config::AppConfig;

pub fn cmd_config(config_path: Option<&Path>) -> Result<()> {
    let config = AppConfig::load(config_path).context("Failed to load configuration")?;
    println!("# worker: {}", config.worker_id());
    println!("{}", render(&config)?);
    Ok(())
}

/// TOML view with secrets masked.
fn render(config: &AppConfig) -> Result<String> {
    let mut shown = config.clone();
    let mask = |value: &mut Option<String>| {
        if value.is_some() {
            *value = Some("****".to_string());
        }
    };
    mask(&mut shown.github.token);
    mask(&mut shown.telemetry.langfuse_secret_key);
    shown.server.api_keys = shown.server.api_keys.iter().map(|_| "****".to_string()).collect();
    toml::to_string_pretty(&shown).context("Failed to render configuration")
}
