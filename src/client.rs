//! HTTP client for a running agentcore server, used by the CLI.

use agentcore_common::{
    CancelResponse, ErrorBody, HealthStatus, Job, JobList, JobListQuery, ProfileSummary,
    SubmitJobRequest,
};
use anyhow::{Context, Result, bail};
use serde::de::DeserializeOwned;

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 8200;

pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl ApiClient {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.filter(|k| !k.is_empty()),
        }
    }

    /// Target from `AGENTCORE_HOST`, `AGENTCORE_PORT` and `AGENTCORE_API_KEY`.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let host = env("AGENTCORE_HOST").unwrap_or_else(|| DEFAULT_HOST.to_string());
        let port = match env("AGENTCORE_PORT") {
            Some(raw) => raw
                .trim()
                .parse::<u16>()
                .with_context(|| format!("Invalid AGENTCORE_PORT '{}'", raw))?,
            None => DEFAULT_PORT,
        };
        let base = if host.starts_with("http://") || host.starts_with("https://") {
            format!("{}:{}", host.trim_end_matches('/'), port)
        } else {
            format!("http://{}:{}", host, port)
        };
        Ok(Self::new(base, env("AGENTCORE_API_KEY")))
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => request.header("X-Api-Key", key),
            None => request,
        }
    }

    async fn send<T: DeserializeOwned>(&self, request: reqwest::RequestBuilder) -> Result<T> {
        let response = self
            .authorized(request)
            .send()
            .await
            .with_context(|| format!("Failed to reach agentcore server at {}", self.base_url))?;
        let status = response.status();
        if !status.is_success() {
            let message = match response.json::<ErrorBody>().await {
                Ok(body) => body.error,
                Err(_) => status
                    .canonical_reason()
                    .unwrap_or("request failed")
                    .to_string(),
            };
            bail!("Server returned {}: {}", status.as_u16(), message);
        }
        response
            .json::<T>()
            .await
            .context("Failed to decode server response")
    }

    pub async fn health(&self) -> Result<HealthStatus> {
        self.send(self.http.get(self.url("/health"))).await
    }

    pub async fn submit(&self, request: &SubmitJobRequest) -> Result<Job> {
        self.send(self.http.post(self.url("/jobs")).json(request))
            .await
    }

    pub async fn job(&self, id: &str) -> Result<Job> {
        self.send(self.http.get(self.url(&format!("/jobs/{}", id))))
            .await
    }

    pub async fn jobs(&self, query: &JobListQuery) -> Result<JobList> {
        self.send(self.http.get(self.url("/jobs")).query(query))
            .await
    }

    pub async fn cancel(&self, id: &str) -> Result<CancelResponse> {
        self.send(self.http.delete(self.url(&format!("/jobs/{}", id))))
            .await
    }

    pub async fn profiles(&self) -> Result<Vec<ProfileSummary>> {
        self.send(self.http.get(self.url("/profiles"))).await
    }
}
