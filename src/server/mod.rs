//! HTTP server bootstrap: wires configuration into the job services and
//! serves the REST API until Ctrl-C or SIGTERM.

pub mod api;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use axum::Router;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::config::{AppConfig, LockStrategy};
use crate::drain::DrainCoordinator;
use crate::jobs::JobStore;
use crate::lock::{CacheLock, FileLock, SharedLock};
use crate::orchestrator::Orchestrator;
use crate::pr::GhPullRequests;
use crate::profiles::ProfileRegistry;
use crate::repos::RepoCache;
use crate::runner::{Runner, RunnerDeps};
use crate::store::{FileBackend, KvStore, RedisCache, SharedCache};
use crate::telemetry;

pub use api::{AppState, SharedState, api_router};

/// How long shutdown waits for in-flight jobs after the listener closes.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// Connect the fast cache if one is configured.
///
/// An unreachable cache downgrades to durable-only unless repository locks
/// depend on it.
pub async fn connect_cache(config: &AppConfig) -> Result<Option<SharedCache>> {
    let Some(url) = config.cache.redis_url.as_deref().filter(|u| !u.is_empty()) else {
        if config.locking.strategy == LockStrategy::Cache {
            bail!("locking.strategy = \"cache\" requires cache.redis_url");
        }
        return Ok(None);
    };
    match RedisCache::connect(url, &config.cache).await {
        Ok(cache) => {
            info!("connected to fast cache");
            Ok(Some(Arc::new(cache)))
        }
        Err(e) if config.locking.strategy == LockStrategy::Cache => {
            Err(e).context("Fast cache is required for cache-based locking")
        }
        Err(e) => {
            warn!(error = %e, "fast cache unreachable, running with the durable store only");
            Ok(None)
        }
    }
}

/// Open the job store described by `config`.
pub async fn open_job_store(config: &AppConfig) -> Result<(JobStore, Option<SharedCache>)> {
    let cache = connect_cache(config).await?;
    let kv = KvStore::new(cache.clone(), FileBackend::new(&config.store.root));
    Ok((JobStore::new(kv), cache))
}

fn repository_lock(config: &AppConfig, cache: Option<SharedCache>) -> Result<SharedLock> {
    match (config.locking.strategy, cache) {
        (LockStrategy::File, _) => Ok(Arc::new(FileLock::new(config.repos.root.clone()))),
        (LockStrategy::Cache, Some(cache)) => Ok(Arc::new(CacheLock::new(cache))),
        (LockStrategy::Cache, None) => bail!("cache-based locking needs a reachable fast cache"),
    }
}

/// Build the shared application state from configuration.
pub async fn build_state(config: Arc<AppConfig>) -> Result<SharedState> {
    let (jobs, cache) = open_job_store(&config).await?;
    let lock = repository_lock(&config, cache)?;
    let profiles = Arc::new(ProfileRegistry::load(&config).context("Failed to load profiles")?);
    info!(profiles = ?profiles.names(), "profiles loaded");

    let runner = Arc::new(Runner::new(RunnerDeps {
        config: config.clone(),
        jobs: jobs.clone(),
        profiles: profiles.clone(),
        repos: Arc::new(RepoCache::new(&config, lock)),
        telemetry: telemetry::from_config(&config.telemetry),
        pull_requests: Arc::new(GhPullRequests::new(&config)?),
    }));
    let drain = DrainCoordinator::new(jobs, runner.worker());
    Ok(Arc::new(AppState {
        orchestrator: Orchestrator::new(config.clone(), runner, drain),
        profiles,
        api_keys: config.server.api_keys.clone(),
    }))
}

pub fn build_router(state: SharedState) -> Router {
    api_router(state).layer(TraceLayer::new_for_http())
}

/// Serve until a shutdown signal, then wait for in-flight jobs.
pub async fn serve(config: Arc<AppConfig>) -> Result<()> {
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let state = build_state(config).await?;
    let app = build_router(state.clone());

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;
    let local_addr = listener.local_addr()?;
    info!(addr = %local_addr, worker = %state.orchestrator.worker(), "agentcore listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!(in_flight = state.orchestrator.in_flight(), "server stopped, finishing jobs");
    if !state.orchestrator.shutdown(SHUTDOWN_GRACE).await {
        warn!("exiting with jobs still running");
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown signal received");
}
