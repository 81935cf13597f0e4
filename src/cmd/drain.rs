//! `agentcore drain`: run on the worker itself, typically from a pre-stop hook.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};

use agentcore::config::AppConfig;
use agentcore::drain::DrainCoordinator;
use agentcore::server::open_job_store;

pub async fn cmd_drain(config_path: Option<&Path>, timeout_secs: u64) -> Result<()> {
    let config = AppConfig::load(config_path).context("Failed to load configuration")?;
    let (jobs, _) = open_job_store(&config).await?;
    let worker = config.worker_id();
    let coordinator = DrainCoordinator::new(jobs, worker.clone());

    println!("Draining worker {} (timeout {}s)...", worker, timeout_secs);
    let report = coordinator
        .drain(Duration::from_secs(timeout_secs))
        .await
        .context("Drain failed")?;

    if report.idle {
        println!("Worker {} is idle.", worker);
    } else {
        println!(
            "Timed out with {} job(s) still running on {}.",
            report.remaining, worker
        );
    }
    Ok(())
}
