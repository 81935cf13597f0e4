use std::sync::Arc;

use agentcore_common::{
    CancelResponse, HealthStatus, Job, JobList, JobListQuery, ProfileSummary, SubmitJobRequest,
};
use axum::{
    Json, Router,
    extract::{Path, Query, Request, State},
    http::{HeaderMap, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
};
use serde::Deserialize;
use tracing::{error, warn};

use crate::errors::OrchestratorError;
use crate::orchestrator::Orchestrator;
use crate::profiles::ProfileRegistry;

const SERVICE_NAME: &str = "agentcore";
const DEFAULT_LIST_LIMIT: usize = 50;
const MAX_LIST_LIMIT: usize = 500;
const API_KEY_HEADER: &str = "x-api-key";

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub orchestrator: Orchestrator,
    pub profiles: Arc<ProfileRegistry>,
    /// Accepted API keys. Empty disables authentication.
    pub api_keys: Vec<String>,
}

pub type SharedState = Arc<AppState>;

// ── Error handling ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Unauthorized,
    Unavailable(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                "missing or invalid API key".to_string(),
            ),
            ApiError::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(serde_json::json!({"error": message}))).into_response()
    }
}

impl From<OrchestratorError> for ApiError {
    fn from(err: OrchestratorError) -> Self {
        match err {
            OrchestratorError::JobNotFound(_) => ApiError::NotFound(err.to_string()),
            OrchestratorError::BadRequest(msg) => ApiError::BadRequest(msg),
            OrchestratorError::Draining { .. } => ApiError::Unavailable(err.to_string()),
            OrchestratorError::RunAborted { .. } | OrchestratorError::Store(_) => {
                error!(error = %err, "request failed");
                ApiError::Internal(err.to_string())
            }
        }
    }
}

// ── Router ────────────────────────────────────────────────────────────

/// All REST routes. `/health` and `/ready` stay open for health checks; the rest
/// require an API key when any are configured.
pub fn api_router(state: SharedState) -> Router {
    let protected = Router::new()
        .route("/jobs", get(list_jobs).post(submit_job))
        .route("/jobs/{id}", get(get_job).delete(cancel_job))
        .route("/profiles", get(list_profiles))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_api_key));

    Router::new()
        .route("/health", get(health))
        .route("/ready", get(ready))
        .merge(protected)
        .with_state(state)
}

#[derive(Deserialize)]
struct ApiKeyQuery {
    api_key: Option<String>,
}

async fn require_api_key(
    State(state): State<SharedState>,
    Query(query): Query<ApiKeyQuery>,
    headers: HeaderMap,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    if state.api_keys.is_empty() {
        return Ok(next.run(request).await);
    }
    let presented = headers
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .or(query.api_key);
    match presented {
        Some(key) if state.api_keys.iter().any(|k| *k == key) => Ok(next.run(request).await),
        _ => {
            warn!(path = %request.uri().path(), "rejected request without valid API key");
            Err(ApiError::Unauthorized)
        }
    }
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_status(state: &AppState) -> HealthStatus {
    let draining = state.orchestrator.drain().is_draining().await;
    HealthStatus {
        status: if draining { "draining" } else { "ok" }.to_string(),
        service: SERVICE_NAME.to_string(),
        worker: state.orchestrator.worker().to_string(),
        draining,
    }
}

async fn health(State(state): State<SharedState>) -> Json<HealthStatus> {
    Json(health_status(&state).await)
}

async fn ready(State(state): State<SharedState>) -> (StatusCode, Json<HealthStatus>) {
    let status = health_status(&state).await;
    let code = if status.draining {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };
    (code, Json(status))
}

async fn submit_job(
    State(state): State<SharedState>,
    Json(request): Json<SubmitJobRequest>,
) -> Result<(StatusCode, Json<Job>), ApiError> {
    let wait = request.wait;
    let job = state.orchestrator.submit(request).await?;
    let code = if wait {
        StatusCode::OK
    } else {
        StatusCode::ACCEPTED
    };
    Ok((code, Json(job)))
}

async fn list_jobs(
    State(state): State<SharedState>,
    Query(query): Query<JobListQuery>,
) -> Result<Json<JobList>, ApiError> {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_LIST_LIMIT)
        .clamp(1, MAX_LIST_LIMIT);
    let jobs = state.orchestrator.list(limit, query.status).await?;
    Ok(Json(JobList::new(jobs)))
}

async fn get_job(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Json<Job>, ApiError> {
    Ok(Json(state.orchestrator.get(&id).await?))
}

async fn cancel_job(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Json<CancelResponse>, ApiError> {
    Ok(Json(state.orchestrator.cancel(&id).await?))
}

async fn list_profiles(State(state): State<SharedState>) -> Json<Vec<ProfileSummary>> {
    Json(state.profiles.list())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::drain::DrainCoordinator;
    use crate::jobs::JobStore;
    use crate::lock::FileLock;
    use crate::pr::{PrRequest, PullRequestCreator};
    use crate::repos::RepoCache;
    use crate::runner::{Runner, RunnerDeps};
    use crate::store::{FileBackend, KvStore};
    use crate::telemetry::NoopTelemetry;
    use agentcore_common::JobStatus;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use std::os::unix::fs::PermissionsExt;
    use std::time::Duration;
    use tempfile::TempDir;
    use tower::ServiceExt;

    struct NoPrs;

    #[async_trait]
    impl PullRequestCreator for NoPrs {
        async fn create(&self, _request: PrRequest<'_>) -> anyhow::Result<Option<String>> {
            Ok(None)
        }
    }

    fn test_state(api_keys: Vec<String>) -> (TempDir, SharedState) {
        let dir = tempfile::tempdir().unwrap();
        let agent = dir.path().join("agent.sh");
        std::fs::write(&agent, "#!/bin/sh\necho '{\"session_id\":\"s-1\"}'\n").unwrap();
        std::fs::set_permissions(&agent, std::fs::Permissions::from_mode(0o755)).unwrap();

        let mut config = AppConfig::rooted_at(dir.path());
        config.agent.binary = agent.display().to_string();
        config.worker.name = Some("api-test".into());
        let config = Arc::new(config);

        let jobs = JobStore::new(KvStore::durable_only(FileBackend::new(&config.store.root)));
        let profiles = Arc::new(ProfileRegistry::load(&config).unwrap());
        let runner = Arc::new(Runner::new(RunnerDeps {
            config: config.clone(),
            jobs: jobs.clone(),
            profiles: profiles.clone(),
            repos: Arc::new(RepoCache::new(
                &config,
                Arc::new(FileLock::new(config.repos.root.clone())),
            )),
            telemetry: Arc::new(NoopTelemetry),
            pull_requests: Arc::new(NoPrs),
        }));
        let drain = DrainCoordinator::new(jobs, "api-test");
        let state = Arc::new(AppState {
            orchestrator: Orchestrator::new(config, runner, drain),
            profiles,
            api_keys,
        });
        (dir, state)
    }

    fn test_app() -> (TempDir, SharedState, Router) {
        let (dir, state) = test_state(Vec::new());
        let app = api_router(state.clone());
        (dir, state, app)
    }

    async fn body_json<T: serde::de::DeserializeOwned>(body: Body) -> T {
        let bytes = body.collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder()
            .method("GET")
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_health_reports_worker() {
        let (_dir, _state, app) = test_app();
        let response = app.oneshot(get("/health")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let health: HealthStatus = body_json(response.into_body()).await;
        assert_eq!(health.status, "ok");
        assert_eq!(health.service, "agentcore");
        assert_eq!(health.worker, "api-test");
        assert!(!health.draining);
    }

    #[tokio::test]
    async fn test_ready_is_unavailable_while_draining() {
        let (_dir, state, app) = test_app();
        let response = app.clone().oneshot(get("/ready")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        state
            .orchestrator
            .drain()
            .mark(Duration::from_secs(30))
            .await
            .unwrap();
        let response = app.oneshot(get("/ready")).await.unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let health: HealthStatus = body_json(response.into_body()).await;
        assert!(health.draining);
    }

    #[tokio::test]
    async fn test_submit_wait_then_get() {
        let (_dir, _state, app) = test_app();
        let response = app
            .clone()
            .oneshot(post_json(
                "/jobs",
                serde_json::json!({"task": "summarize", "profile": "review", "wait": true}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let job: Job = body_json(response.into_body()).await;
        assert_eq!(job.status(), JobStatus::Succeeded);
        assert_eq!(job.session_id(), Some("s-1"));

        let response = app
            .oneshot(get(&format!("/jobs/{}", job.id())))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let fetched: Job = body_json(response.into_body()).await;
        assert_eq!(fetched.id(), job.id());
    }

    #[tokio::test]
    async fn test_submit_async_is_accepted() {
        let (_dir, state, app) = test_app();
        let response = app
            .oneshot(post_json("/jobs", serde_json::json!({"task": "summarize"})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let job: Job = body_json(response.into_body()).await;
        assert_eq!(job.status(), JobStatus::Queued);
        assert!(state.orchestrator.shutdown(Duration::from_secs(10)).await);
    }

    #[tokio::test]
    async fn test_submit_empty_task_is_bad_request() {
        let (_dir, _state, app) = test_app();
        let response = app
            .oneshot(post_json("/jobs", serde_json::json!({"task": ""})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body: serde_json::Value = body_json(response.into_body()).await;
        assert!(body["error"].as_str().unwrap().contains("task"));
    }

    #[tokio::test]
    async fn test_submit_while_draining_is_unavailable() {
        let (_dir, state, app) = test_app();
        state
            .orchestrator
            .drain()
            .mark(Duration::from_secs(30))
            .await
            .unwrap();
        let response = app
            .oneshot(post_json("/jobs", serde_json::json!({"task": "x"})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_get_unknown_job_is_404() {
        let (_dir, _state, app) = test_app();
        let response = app.oneshot(get("/jobs/nope")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body: serde_json::Value = body_json(response.into_body()).await;
        assert!(body["error"].as_str().unwrap().contains("nope"));
    }

    #[tokio::test]
    async fn test_list_jobs_filters_by_status() {
        let (_dir, state, app) = test_app();
        let queued = state
            .orchestrator
            .jobs()
            .create(agentcore_common::NewJob::new("queued", "code"))
            .await
            .unwrap();
        state
            .orchestrator
            .submit(SubmitJobRequest {
                task: "done".into(),
                wait: true,
                ..Default::default()
            })
            .await
            .unwrap();

        let response = app.clone().oneshot(get("/jobs")).await.unwrap();
        let list: JobList = body_json(response.into_body()).await;
        assert_eq!(list.count, 2);

        let response = app.oneshot(get("/jobs?status=queued&limit=10")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let list: JobList = body_json(response.into_body()).await;
        assert_eq!(list.count, 1);
        assert_eq!(list.jobs[0].id(), queued.id());
    }

    #[tokio::test]
    async fn test_cancel_twice_is_idempotent() {
        let (_dir, state, app) = test_app();
        let job = state
            .orchestrator
            .jobs()
            .create(agentcore_common::NewJob::new("queued", "code"))
            .await
            .unwrap();
        let delete = || {
            Request::builder()
                .method("DELETE")
                .uri(format!("/jobs/{}", job.id()))
                .body(Body::empty())
                .unwrap()
        };

        let response = app.clone().oneshot(delete()).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let first: CancelResponse = body_json(response.into_body()).await;
        assert!(first.cancelled);
        assert_eq!(first.status, JobStatus::Cancelled);

        let response = app.oneshot(delete()).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let second: CancelResponse = body_json(response.into_body()).await;
        assert!(!second.cancelled);
        assert_eq!(second.status, JobStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_list_profiles_includes_bundled() {
        let (_dir, _state, app) = test_app();
        let response = app.oneshot(get("/profiles")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let profiles: Vec<ProfileSummary> = body_json(response.into_body()).await;
        let names: Vec<&str> = profiles.iter().map(|p| p.name.as_str()).collect();
        assert!(names.contains(&"code"));
        assert!(names.contains(&"review"));
    }

    #[tokio::test]
    async fn test_api_key_required_when_configured() {
        let (_dir, state) = test_state(vec!["secret".into()]);
        let app = api_router(state);

        let response = app.clone().oneshot(get("/jobs")).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let request = Request::builder()
            .uri("/jobs")
            .header("X-Api-Key", "secret")
            .body(Body::empty())
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app.clone().oneshot(get("/jobs?api_key=secret")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app.clone().oneshot(get("/jobs?api_key=wrong")).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = app.oneshot(get("/health")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
