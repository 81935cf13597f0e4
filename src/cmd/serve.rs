//! `agentcore serve`

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use agentcore::config::AppConfig;
use agentcore::server;

pub async fn cmd_serve(config_path: Option<&Path>) -> Result<()> {
    let config = AppConfig::load(config_path).context("Failed to load configuration")?;
    info!(
        worker = %config.worker_id(),
        repos = %config.repos.root.display(),
        store = %config.store.root.display(),
        "starting agentcore"
    );
    server::serve(Arc::new(config)).await
}
