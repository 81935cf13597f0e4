//! Process configuration for agentcore.
//!
//! One [`AppConfig`] is built at startup and passed (as `Arc<AppConfig>`) into
//! every component constructor. Values come from three layers, later layers
//! winning:
//!
//! 1. built-in defaults
//! 2. the TOML file (`~/.agentcore/config.toml` unless `--config` is given)
//! 3. environment variables (empty values count as unset)
//!
//! # Configuration File Format
//!
//! ```toml
//! [repos]
//! root = "/shared/repos"
//! lock_wait_secs = 300
//! lock_timeout_policy = "proceed"
//!
//! [agent]
//! binary = "claude"
//! default_profile = "code"
//! isolate_config_dir = true
//!
//! [server]
//! port = 8200
//! api_keys = ["secret"]
//!
//! [cache]
//! redis_url = "redis://localhost:6379/0"
//! response_timeout_ms = 1000
//!
//! [locking]
//! strategy = "cache"
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// How repository acquisition reacts to a lock wait timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockTimeoutPolicy {
    /// Run the idempotent clone/fetch without the lock and log it.
    #[default]
    Proceed,
    /// Surface the timeout as a job failure.
    Fail,
}

impl std::str::FromStr for LockTimeoutPolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "proceed" => Ok(Self::Proceed),
            "fail" => Ok(Self::Fail),
            _ => anyhow::bail!(
                "Invalid lock timeout policy '{}'. Valid values: proceed, fail",
                s
            ),
        }
    }
}

/// Which mutual-exclusion backend guards repository clones.
///
/// Chosen at deployment time; the two strategies must not be mixed against
/// the same repository root.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockStrategy {
    /// OS advisory lock on `{root}/{hash}/.lock`. Single host only.
    #[default]
    File,
    /// Set-if-absent lease in the shared fast cache.
    Cache,
}

impl std::str::FromStr for LockStrategy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "file" => Ok(Self::File),
            "cache" => Ok(Self::Cache),
            _ => anyhow::bail!("Invalid lock strategy '{}'. Valid values: file, cache", s),
        }
    }
}

/// Output format for the tracing subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Compact,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReposConfig {
    /// Root of the repository clone cache.
    #[serde(default = "default_repos_root")]
    pub root: PathBuf,
    #[serde(default = "default_git_binary")]
    pub git_binary: String,
    /// How long to wait for the clone lock.
    #[serde(default = "default_lock_wait_secs")]
    pub lock_wait_secs: u64,
    /// Lease length for cache-backed locks.
    #[serde(default = "default_lock_lease_secs")]
    pub lock_lease_secs: u64,
    /// Ceiling for a single clone or fetch.
    #[serde(default = "default_git_timeout_secs")]
    pub git_timeout_secs: u64,
    #[serde(default)]
    pub lock_timeout_policy: LockTimeoutPolicy,
    #[serde(default = "default_job_ttl_seconds")]
    pub job_ttl_seconds: u64,
}

fn default_repos_root() -> PathBuf {
    home_dir().join("agentcore-repos")
}

fn default_git_binary() -> String {
    "git".to_string()
}

fn default_lock_wait_secs() -> u64 {
    300
}

fn default_lock_lease_secs() -> u64 {
    600
}

fn default_git_timeout_secs() -> u64 {
    300
}

fn default_job_ttl_seconds() -> u64 {
    agentcore_common::DEFAULT_TTL_SECONDS
}

impl Default for ReposConfig {
    fn default() -> Self {
        Self {
            root: default_repos_root(),
            git_binary: default_git_binary(),
            lock_wait_secs: default_lock_wait_secs(),
            lock_lease_secs: default_lock_lease_secs(),
            git_timeout_secs: default_git_timeout_secs(),
            lock_timeout_policy: LockTimeoutPolicy::default(),
            job_ttl_seconds: default_job_ttl_seconds(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Coding-agent CLI executable.
    #[serde(default = "default_agent_binary")]
    pub binary: String,
    /// Timeout used when a profile does not set one.
    #[serde(default = "default_agent_timeout_secs")]
    pub timeout_secs: u64,
    /// Profile used when the requested one is unknown. Empty disables fallback.
    #[serde(default = "default_profile_name")]
    pub default_profile: String,
    /// Materialize profiles into a per-job config directory instead of the clone.
    #[serde(default)]
    pub isolate_config_dir: bool,
    #[serde(default = "default_job_config_root")]
    pub job_config_root: PathBuf,
    /// Shared agent config dir exported when isolation is off.
    #[serde(default)]
    pub home_path: Option<PathBuf>,
    /// Time between SIGTERM and SIGKILL on timeout.
    #[serde(default = "default_termination_grace_secs")]
    pub termination_grace_secs: u64,
    /// How often a running job's record is re-read to notice a cancellation
    /// made on another worker.
    #[serde(default = "default_cancel_poll_ms")]
    pub cancel_poll_ms: u64,
}

fn default_agent_binary() -> String {
    "claude".to_string()
}

fn default_agent_timeout_secs() -> u64 {
    3600
}

fn default_profile_name() -> String {
    "code".to_string()
}

fn default_job_config_root() -> PathBuf {
    agentcore_dir().join("job-state")
}

fn default_termination_grace_secs() -> u64 {
    5
}

fn default_cancel_poll_ms() -> u64 {
    2000
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            binary: default_agent_binary(),
            timeout_secs: default_agent_timeout_secs(),
            default_profile: default_profile_name(),
            isolate_config_dir: false,
            job_config_root: default_job_config_root(),
            home_path: None,
            termination_grace_secs: default_termination_grace_secs(),
            cancel_poll_ms: default_cancel_poll_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Accepted `X-Api-Key` values. Empty disables authentication.
    #[serde(default)]
    pub api_keys: Vec<String>,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8200
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            api_keys: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Redis connection URL. Unset means no fast cache.
    #[serde(default)]
    pub redis_url: Option<String>,
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
    /// Per-attempt limit on establishing a connection.
    #[serde(default = "default_cache_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Limit on a single command; a stalled server counts as unavailable.
    #[serde(default = "default_cache_response_timeout_ms")]
    pub response_timeout_ms: u64,
    /// Reconnect attempts before a command gives up.
    #[serde(default = "default_cache_retries")]
    pub retries: usize,
}

fn default_key_prefix() -> String {
    "agentcore".to_string()
}

fn default_cache_connect_timeout_ms() -> u64 {
    2000
}

fn default_cache_response_timeout_ms() -> u64 {
    1000
}

fn default_cache_retries() -> usize {
    1
}

impl CacheConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms.max(1))
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms.max(1))
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            redis_url: None,
            key_prefix: default_key_prefix(),
            connect_timeout_ms: default_cache_connect_timeout_ms(),
            response_timeout_ms: default_cache_response_timeout_ms(),
            retries: default_cache_retries(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Root of the durable one-file-per-key store.
    #[serde(default = "default_store_root")]
    pub root: PathBuf,
}

fn default_store_root() -> PathBuf {
    agentcore_dir().join("store")
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            root: default_store_root(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LockingConfig {
    #[serde(default)]
    pub strategy: LockStrategy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OtelConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_otel_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_otel_protocol")]
    pub protocol: String,
    #[serde(default)]
    pub log_prompts: bool,
    #[serde(default = "default_true")]
    pub log_tool_details: bool,
}

fn default_true() -> bool {
    true
}

fn default_otel_endpoint() -> String {
    "http://otel-collector:4317".to_string()
}

fn default_otel_protocol() -> String {
    "grpc".to_string()
}

impl Default for OtelConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            endpoint: default_otel_endpoint(),
            protocol: default_otel_protocol(),
            log_prompts: false,
            log_tool_details: true,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GithubConfig {
    #[serde(default)]
    pub token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    #[serde(default)]
    pub langfuse_host: Option<String>,
    #[serde(default)]
    pub langfuse_public_key: Option<String>,
    #[serde(default)]
    pub langfuse_secret_key: Option<String>,
    /// Where the agent writes session transcripts.
    #[serde(default = "default_transcripts_dir")]
    pub transcripts_dir: PathBuf,
}

fn default_transcripts_dir() -> PathBuf {
    home_dir().join(".claude").join("projects")
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            langfuse_host: None,
            langfuse_public_key: None,
            langfuse_secret_key: None,
            transcripts_dir: default_transcripts_dir(),
        }
    }
}

impl TelemetryConfig {
    /// Langfuse is enabled only when host and both keys are present.
    pub fn langfuse_enabled(&self) -> bool {
        self.langfuse_host.is_some()
            && self.langfuse_public_key.is_some()
            && self.langfuse_secret_key.is_some()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfilesConfig {
    /// Extra profile directories, searched after the bundled defaults.
    /// Later entries override earlier ones by name.
    #[serde(default = "default_profile_dirs")]
    pub dirs: Vec<PathBuf>,
}

fn default_profile_dirs() -> Vec<PathBuf> {
    vec![agentcore_dir().join("profiles")]
}

impl Default for ProfilesConfig {
    fn default() -> Self {
        Self {
            dirs: default_profile_dirs(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Identity recorded on jobs and used for drain flags.
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrConfig {
    /// Glob matching branches the agent creates in worktree mode.
    #[serde(default = "default_branch_pattern")]
    pub branch_pattern: String,
    #[serde(default = "default_gh_binary")]
    pub gh_binary: String,
}

fn default_branch_pattern() -> String {
    "cc-*".to_string()
}

fn default_gh_binary() -> String {
    "gh".to_string()
}

impl Default for PrConfig {
    fn default() -> Self {
        Self {
            branch_pattern: default_branch_pattern(),
            gh_binary: default_gh_binary(),
        }
    }
}

/// The complete agentcore configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub repos: ReposConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub locking: LockingConfig,
    #[serde(default)]
    pub otel: OtelConfig,
    #[serde(default)]
    pub github: GithubConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
    #[serde(default)]
    pub profiles: ProfilesConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub pr: PrConfig,
}

impl AppConfig {
    /// Load from `path` (or the default location) and apply the process
    /// environment. A missing file yields defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = path
            .map(Path::to_path_buf)
            .unwrap_or_else(|| agentcore_dir().join("config.toml"));
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            Self::parse(&content)?
        } else {
            Self::default()
        };
        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse config.toml")
    }

    /// Defaults with every filesystem location placed under `dir`.
    ///
    /// Used by tests and by `init-shared-fs` to build a self-contained layout.
    pub fn rooted_at(dir: &Path) -> Self {
        let mut config = Self::default();
        config.repos.root = dir.join("repos");
        config.store.root = dir.join("jobs");
        config.agent.job_config_root = dir.join("job-state");
        config.profiles.dirs = vec![dir.join("profiles")];
        config.telemetry.transcripts_dir = dir.join("transcripts");
        config.otel.enabled = false;
        config
    }

    /// Overlay environment variables read through `lookup`.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = env("AGENTCORE_REPOS_ROOT") {
            self.repos.root = expand_home(&v);
        }
        if let Some(v) = env("AGENTCORE_GIT_BINARY") {
            self.repos.git_binary = v;
        }
        if let Some(v) = env("AGENTCORE_LOCK_WAIT_SECS") {
            self.repos.lock_wait_secs = parse_num("AGENTCORE_LOCK_WAIT_SECS", &v)?;
        }
        if let Some(v) = env("AGENTCORE_LOCK_TIMEOUT_POLICY") {
            self.repos.lock_timeout_policy = v.parse()?;
        }
        if let Some(v) = env("AGENTCORE_JOB_TTL") {
            self.repos.job_ttl_seconds = parse_num("AGENTCORE_JOB_TTL", &v)?;
        }

        if let Some(v) = env("AGENTCORE_AGENT_BINARY") {
            self.agent.binary = v;
        }
        if let Some(v) = env("AGENTCORE_AGENT_TIMEOUT") {
            self.agent.timeout_secs = parse_num("AGENTCORE_AGENT_TIMEOUT", &v)?;
        }
        if let Some(v) = env("AGENTCORE_DEFAULT_PROFILE") {
            self.agent.default_profile = v;
        }
        if let Some(v) = env("AGENTCORE_ISOLATE_CONFIG_DIR") {
            self.agent.isolate_config_dir = parse_bool(&v);
        }
        if let Some(v) = env("AGENTCORE_JOB_CONFIG_ROOT") {
            self.agent.job_config_root = expand_home(&v);
        }
        if let Some(v) = env("AGENTCORE_AGENT_HOME_PATH") {
            self.agent.home_path = Some(expand_home(&v));
        }

        if let Some(v) = env("AGENTCORE_HOST") {
            self.server.host = v;
        }
        if let Some(v) = env("AGENTCORE_PORT") {
            self.server.port = parse_num("AGENTCORE_PORT", &v)?;
        }
        if let Some(v) = env("AGENTCORE_API_KEYS") {
            self.server.api_keys = v
                .split(',')
                .map(str::trim)
                .filter(|k| !k.is_empty())
                .map(String::from)
                .collect();
        }

        if let Some(v) = env("REDIS_URL") {
            self.cache.redis_url = Some(v);
        }
        if let Some(v) = env("REDIS_KEY_PREFIX") {
            self.cache.key_prefix = v;
        }
        if let Some(v) = env("AGENTCORE_CACHE_TIMEOUT_MS") {
            let ms = parse_num("AGENTCORE_CACHE_TIMEOUT_MS", &v)?;
            self.cache.connect_timeout_ms = ms;
            self.cache.response_timeout_ms = ms;
        }
        if let Some(v) = env("AGENTCORE_STORE_ROOT") {
            self.store.root = expand_home(&v);
        }
        if let Some(v) = env("AGENTCORE_LOCK_STRATEGY") {
            self.locking.strategy = v.parse()?;
        }

        if let Some(v) = env("AGENTCORE_OTEL_ENABLED") {
            self.otel.enabled = parse_bool(&v);
        }
        if let Some(v) = env("OTEL_EXPORTER_OTLP_ENDPOINT") {
            self.otel.endpoint = v;
        }
        if let Some(v) = env("OTEL_EXPORTER_OTLP_PROTOCOL") {
            self.otel.protocol = v;
        }
        if let Some(v) = env("AGENTCORE_OTEL_LOG_PROMPTS") {
            self.otel.log_prompts = parse_bool(&v);
        }
        if let Some(v) = env("AGENTCORE_OTEL_LOG_TOOL_DETAILS") {
            self.otel.log_tool_details = parse_bool(&v);
        }

        if let Some(v) = env("GITHUB_TOKEN") {
            self.github.token = Some(v);
        }

        if let Some(v) = env("LANGFUSE_HOST") {
            self.telemetry.langfuse_host = Some(v);
        }
        if let Some(v) = env("LANGFUSE_PUBLIC_KEY") {
            self.telemetry.langfuse_public_key = Some(v);
        }
        if let Some(v) = env("LANGFUSE_SECRET_KEY") {
            self.telemetry.langfuse_secret_key = Some(v);
        }

        if let Some(v) = env("AGENTCORE_PROFILE_DIRS") {
            self.profiles.dirs = v
                .split(':')
                .filter(|d| !d.is_empty())
                .map(expand_home)
                .collect();
        }

        if let Some(v) = env("AGENTCORE_POD_NAME").or_else(|| env("HOSTNAME")) {
            self.worker.name = Some(v);
        }

        Ok(())
    }

    /// Worker identity: configured name, else the host name, else "local".
    pub fn worker_id(&self) -> String {
        if let Some(name) = self.worker.name.as_ref().filter(|n| !n.is_empty()) {
            return name.clone();
        }
        std::fs::read_to_string("/etc/hostname")
            .ok()
            .map(|h| h.trim().to_string())
            .filter(|h| !h.is_empty())
            .unwrap_or_else(|| "local".to_string())
    }

    pub fn lock_wait(&self) -> Duration {
        Duration::from_secs(self.repos.lock_wait_secs)
    }

    pub fn lock_lease(&self) -> Duration {
        Duration::from_secs(self.repos.lock_lease_secs)
    }

    /// Default profile name, `None` when fallback is disabled.
    pub fn default_profile(&self) -> Option<&str> {
        Some(self.agent.default_profile.as_str()).filter(|p| !p.is_empty())
    }
}

/// `~/.agentcore`
pub fn agentcore_dir() -> PathBuf {
    home_dir().join(".agentcore")
}

fn home_dir() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| PathBuf::from("."))
}

fn expand_home(path: &str) -> PathBuf {
    match path.strip_prefix("~/") {
        Some(rest) => home_dir().join(rest),
        None => PathBuf::from(path),
    }
}

fn parse_bool(value: &str) -> bool {
    matches!(value.to_lowercase().as_str(), "true" | "1" | "yes")
}

fn parse_num<T: std::str::FromStr>(key: &str, value: &str) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    value
        .trim()
        .parse()
        .with_context(|| format!("Invalid value for {}: '{}'", key, value))
}
