//! Profiles: named, inheritable bundles of agent flags and config files.
//!
//! A profile is a directory:
//!
//! ```text
//! code/
//! ├── profile.yml   # agentcore metadata and agent CLI flags
//! ├── .claude/      # agent-native settings, instructions, subagents
//! └── .mcp.json     # agent-native MCP server config
//! ```
//!
//! Bundled defaults are compiled in (flags only, no config package). Directories
//! from `profiles.dirs` are scanned afterwards and override bundled profiles
//! by name. `extends` is resolved field by field, child over parent.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use agentcore_common::ProfileSummary;
use rust_embed::RustEmbed;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::config::AppConfig;
use crate::errors::ProfileError;

const PROFILE_FILE: &str = "profile.yml";
const SETTINGS_FILE: &str = "settings.json";
const MCP_FILE: &str = ".mcp.json";
const AGENT_DIR: &str = ".claude";
const SKIP_PERMISSIONS_MODE: &str = "dangerously-skip-permissions";

#[derive(RustEmbed)]
#[folder = "$CARGO_MANIFEST_DIR/defaults/profiles/"]
struct BundledProfiles;

// ── profile.yml ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Deserialize)]
struct ProfileFile {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default, alias = "claude")]
    agent: AgentOverrides,
    #[serde(default)]
    auto_pr: Option<bool>,
    #[serde(default)]
    extends: Option<String>,
}

/// Flags as written in one `profile.yml`; unset fields inherit.
#[derive(Debug, Clone, Default, Deserialize)]
struct AgentOverrides {
    model: Option<String>,
    max_turns: Option<u32>,
    permission_mode: Option<String>,
    no_session_persistence: Option<bool>,
    output_format: Option<String>,
    worktree: Option<bool>,
    effort: Option<String>,
    timeout: Option<u64>,
    max_budget_usd: Option<f64>,
    fallback_model: Option<String>,
}

impl AgentOverrides {
    fn over(self, parent: AgentOverrides) -> AgentOverrides {
        AgentOverrides {
            model: self.model.or(parent.model),
            max_turns: self.max_turns.or(parent.max_turns),
            permission_mode: self.permission_mode.or(parent.permission_mode),
            no_session_persistence: self.no_session_persistence.or(parent.no_session_persistence),
            output_format: self.output_format.or(parent.output_format),
            worktree: self.worktree.or(parent.worktree),
            effort: self.effort.or(parent.effort),
            timeout: self.timeout.or(parent.timeout),
            max_budget_usd: self.max_budget_usd.or(parent.max_budget_usd),
            fallback_model: self.fallback_model.or(parent.fallback_model),
        }
    }

    fn settle(self, default_timeout: u64) -> AgentSettings {
        AgentSettings {
            model: self.model.unwrap_or_else(|| "sonnet".to_string()),
            max_turns: self.max_turns.unwrap_or(80),
            permission_mode: self
                .permission_mode
                .unwrap_or_else(|| "bypassPermissions".to_string()),
            no_session_persistence: self.no_session_persistence.unwrap_or(true),
            output_format: self.output_format.unwrap_or_else(|| "json".to_string()),
            worktree: self.worktree.unwrap_or(true),
            effort: self.effort,
            timeout_secs: self.timeout.unwrap_or(default_timeout),
            max_budget_usd: self.max_budget_usd,
            fallback_model: self.fallback_model,
        }
    }
}

#[derive(Debug, Clone)]
struct ProfileEntry {
    file: ProfileFile,
    /// Package directory; `None` for bundled profiles.
    package: Option<PathBuf>,
}

// ── Resolved profile ──────────────────────────────────────────────────

/// Agent CLI settings after inheritance and defaults.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentSettings {
    pub model: String,
    pub max_turns: u32,
    pub permission_mode: String,
    pub no_session_persistence: bool,
    pub output_format: String,
    pub worktree: bool,
    pub effort: Option<String>,
    pub timeout_secs: u64,
    pub max_budget_usd: Option<f64>,
    pub fallback_model: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Profile {
    pub name: String,
    pub description: String,
    pub agent: AgentSettings,
    pub auto_pr: bool,
    pub extends: Option<String>,
    /// Package directories along the `extends` chain, base first.
    packages: Vec<PathBuf>,
}

impl Profile {
    pub fn packages(&self) -> &[PathBuf] {
        &self.packages
    }

    pub fn summary(&self) -> ProfileSummary {
        ProfileSummary {
            name: self.name.clone(),
            description: self.description.clone(),
            model: self.agent.model.clone(),
            max_turns: self.agent.max_turns,
            worktree: self.agent.worktree,
            auto_pr: self.auto_pr,
            permission_mode: self.agent.permission_mode.clone(),
            extends: self.extends.clone(),
            effort: self.agent.effort.clone(),
        }
    }
}

// ── Registry ──────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ProfileRegistry {
    entries: BTreeMap<String, ProfileEntry>,
    default_timeout: u64,
}

impl ProfileRegistry {
    /// Bundled defaults plus every configured profile directory.
    pub fn load(config: &AppConfig) -> Result<Self, ProfileError> {
        let mut registry = Self::bundled(config.agent.timeout_secs)?;
        for dir in &config.profiles.dirs {
            registry.add_dir(dir)?;
        }
        Ok(registry)
    }

    /// Only the profiles compiled into the binary.
    pub fn bundled(default_timeout: u64) -> Result<Self, ProfileError> {
        let mut registry = Self::empty(default_timeout);
        for path in BundledProfiles::iter() {
            let Some((dir_name, file)) = path.split_once('/') else {
                continue;
            };
            if file != PROFILE_FILE {
                continue;
            }
            let Some(asset) = BundledProfiles::get(&path) else {
                continue;
            };
            let parsed = parse_profile(&asset.data, Path::new(path.as_ref()))?;
            let name = parsed.name.clone().unwrap_or_else(|| dir_name.to_string());
            registry.entries.insert(
                name,
                ProfileEntry {
                    file: parsed,
                    package: None,
                },
            );
        }
        Ok(registry)
    }

    pub fn empty(default_timeout: u64) -> Self {
        Self {
            entries: BTreeMap::new(),
            default_timeout,
        }
    }

    /// Add every `*/profile.yml` package under `dir`. Returns how many loaded.
    ///
    /// A missing directory adds nothing; an unparsable profile is skipped with
    /// a warning.
    pub fn add_dir(&mut self, dir: &Path) -> Result<usize, ProfileError> {
        if !dir.is_dir() {
            return Ok(0);
        }
        let read = std::fs::read_dir(dir).map_err(|source| ProfileError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
        let mut children: Vec<PathBuf> = read
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| p.join(PROFILE_FILE).is_file())
            .collect();
        children.sort();

        let mut loaded = 0;
        for child in children {
            let yml = child.join(PROFILE_FILE);
            let parsed = std::fs::read(&yml)
                .map_err(|source| ProfileError::Io {
                    path: yml.clone(),
                    source,
                })
                .and_then(|bytes| parse_profile(&bytes, &yml));
            match parsed {
                Ok(file) => {
                    let name = file.name.clone().unwrap_or_else(|| {
                        child
                            .file_name()
                            .map(|n| n.to_string_lossy().to_string())
                            .unwrap_or_default()
                    });
                    debug!(profile = %name, path = %child.display(), "loaded profile");
                    self.entries.insert(
                        name,
                        ProfileEntry {
                            file,
                            package: Some(child),
                        },
                    );
                    loaded += 1;
                }
                Err(e) => warn!(path = %yml.display(), error = %e, "skipping unreadable profile"),
            }
        }
        Ok(loaded)
    }

    pub fn names(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    /// Resolve `name` with its full `extends` chain.
    pub fn get(&self, name: &str) -> Option<Profile> {
        let entry = self.entries.get(name)?;
        let chain = self.chain(name);

        let mut agent = AgentOverrides::default();
        let mut description = None;
        let mut auto_pr = None;
        // Walk child first so the child's fields win.
        for link in chain.iter().rev() {
            agent = agent.over(link.file.agent.clone());
            description = description.or_else(|| {
                link.file
                    .description
                    .clone()
                    .filter(|d| !d.is_empty())
            });
            auto_pr = auto_pr.or(link.file.auto_pr);
        }

        Some(Profile {
            name: name.to_string(),
            description: description.unwrap_or_default(),
            agent: agent.settle(self.default_timeout),
            auto_pr: auto_pr.unwrap_or(true),
            extends: entry.file.extends.clone(),
            packages: chain.iter().filter_map(|l| l.package.clone()).collect(),
        })
    }

    /// Resolve `name`, falling back to `fallback` when `name` is unknown.
    pub fn resolve(&self, name: &str, fallback: Option<&str>) -> Result<Profile, ProfileError> {
        if let Some(profile) = self.get(name) {
            return Ok(profile);
        }
        if let Some(fallback) = fallback.filter(|f| *f != name) {
            if let Some(profile) = self.get(fallback) {
                warn!(requested = %name, using = %fallback, "unknown profile, using default");
                return Ok(profile);
            }
        }
        Err(ProfileError::NotFound(name.to_string()))
    }

    pub fn list(&self) -> Vec<ProfileSummary> {
        self.entries
            .keys()
            .filter_map(|name| self.get(name))
            .map(|p| p.summary())
            .collect()
    }

    /// `name` and its ancestors, base first. Stops at cycles and unknown parents.
    fn chain(&self, name: &str) -> Vec<&ProfileEntry> {
        let mut chain = Vec::new();
        let mut seen = HashSet::new();
        let mut current = Some(name.to_string());
        while let Some(n) = current {
            if !seen.insert(n.clone()) {
                warn!(profile = %name, at = %n, "profile inheritance cycle");
                break;
            }
            let Some(entry) = self.entries.get(&n) else {
                warn!(profile = %name, parent = %n, "profile extends unknown profile");
                break;
            };
            chain.push(entry);
            current = entry.file.extends.clone();
        }
        chain.reverse();
        chain
    }
}

fn parse_profile(bytes: &[u8], path: &Path) -> Result<ProfileFile, ProfileError> {
    if bytes.iter().all(|b| b.is_ascii_whitespace()) {
        return Ok(ProfileFile::default());
    }
    serde_yaml::from_slice(bytes).map_err(|source| ProfileError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Write the bundled profiles under `dest` without overwriting existing files.
pub fn write_bundled(dest: &Path) -> Result<Vec<PathBuf>, ProfileError> {
    let mut written = Vec::new();
    for path in BundledProfiles::iter() {
        let target = dest.join(path.as_ref());
        if target.exists() {
            continue;
        }
        let Some(asset) = BundledProfiles::get(&path) else {
            continue;
        };
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent).map_err(|source| ProfileError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        std::fs::write(&target, &asset.data).map_err(|source| ProfileError::Io {
            path: target.clone(),
            source,
        })?;
        written.push(target);
    }
    Ok(written)
}

// ── Materialization ───────────────────────────────────────────────────

/// Where a profile's config package is written.
#[derive(Debug, Clone, Copy)]
pub enum MaterializeTarget<'a> {
    /// `{dir}/.claude/...` and `{dir}/.mcp.json` inside the working tree.
    Project(&'a Path),
    /// `{dir}/...` as the agent's dedicated config directory.
    ConfigDir(&'a Path),
}

/// Copy the profile's packages into `target`, base first.
///
/// `settings.json` and `.mcp.json` are deep-merged into existing files so
/// parent and child permission structures combine. Returns written paths.
pub fn materialize(
    profile: &Profile,
    target: MaterializeTarget<'_>,
) -> Result<Vec<PathBuf>, ProfileError> {
    let (agent_dest, mcp_dest) = match target {
        MaterializeTarget::Project(dir) => (dir.join(AGENT_DIR), dir.join(MCP_FILE)),
        MaterializeTarget::ConfigDir(dir) => (dir.to_path_buf(), dir.join(MCP_FILE)),
    };

    let mut written = Vec::new();
    for package in profile.packages() {
        let src_agent = package.join(AGENT_DIR);
        if src_agent.is_dir() {
            for entry in WalkDir::new(&src_agent).follow_links(false) {
                let entry = entry.map_err(|e| materialize_err(profile, e))?;
                if !entry.file_type().is_file() {
                    continue;
                }
                let rel = entry
                    .path()
                    .strip_prefix(&src_agent)
                    .map_err(|e| materialize_err(profile, e))?;
                let dest = agent_dest.join(rel);
                if rel == Path::new(SETTINGS_FILE) && dest.exists() {
                    merge_json_file(profile, entry.path(), &dest)?;
                } else {
                    copy_file(profile, entry.path(), &dest)?;
                }
                written.push(dest);
            }
        }

        let src_mcp = package.join(MCP_FILE);
        if src_mcp.is_file() {
            if mcp_dest.exists() {
                merge_json_file(profile, &src_mcp, &mcp_dest)?;
            } else {
                copy_file(profile, &src_mcp, &mcp_dest)?;
            }
            written.push(mcp_dest.clone());
        }
    }
    Ok(written)
}

fn copy_file(profile: &Profile, src: &Path, dest: &Path) -> Result<(), ProfileError> {
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent).map_err(|e| materialize_err(profile, e))?;
    }
    std::fs::copy(src, dest).map_err(|e| materialize_err(profile, e))?;
    Ok(())
}

fn merge_json_file(profile: &Profile, src: &Path, dest: &Path) -> Result<(), ProfileError> {
    let read = |path: &Path| -> Result<Value, ProfileError> {
        let text = std::fs::read_to_string(path).map_err(|e| materialize_err(profile, e))?;
        serde_json::from_str(&text)
            .map_err(|e| materialize_err(profile, format!("{}: {}", path.display(), e)))
    };
    let mut existing = read(dest)?;
    deep_merge(&mut existing, read(src)?);
    let rendered =
        serde_json::to_string_pretty(&existing).map_err(|e| materialize_err(profile, e))?;
    std::fs::write(dest, rendered).map_err(|e| materialize_err(profile, e))?;
    Ok(())
}

/// Objects merge recursively, arrays union, anything else is replaced.
pub fn deep_merge(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base), Value::Object(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (Value::Array(base), Value::Array(overlay)) => {
            for item in overlay {
                if !base.contains(&item) {
                    base.push(item);
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

fn materialize_err(profile: &Profile, detail: impl std::fmt::Display) -> ProfileError {
    ProfileError::Materialize {
        name: profile.name.clone(),
        detail: detail.to_string(),
    }
}

// ── Agent CLI arguments ───────────────────────────────────────────────

/// Job facts appended to the agent's system prompt.
#[derive(Debug, Clone, Copy, Default)]
pub struct PromptContext<'a> {
    pub job_id: &'a str,
    pub task: &'a str,
    pub repo_url: Option<&'a str>,
    pub base_ref: Option<&'a str>,
}

impl PromptContext<'_> {
    fn render(&self) -> Option<String> {
        let parts: Vec<String> = [
            ("Job", Some(self.job_id)),
            ("Task", Some(self.task)),
            ("Repo", self.repo_url),
            ("Branch", self.base_ref),
        ]
        .into_iter()
        .filter_map(|(label, value)| {
            value
                .filter(|v| !v.is_empty())
                .map(|v| format!("{}: {}", label, v))
        })
        .collect();
        (!parts.is_empty()).then(|| parts.join(" | "))
    }
}

/// Agent argument vector (without the binary) for running `task`.
pub fn build_cli_args(profile: &Profile, task: &str, context: &PromptContext<'_>) -> Vec<String> {
    let a = &profile.agent;
    let mut args = Vec::new();

    if a.worktree {
        args.push("--worktree".to_string());
    }
    args.extend(["--model".to_string(), a.model.clone()]);
    args.extend(["--max-turns".to_string(), a.max_turns.to_string()]);
    args.extend(["--output-format".to_string(), a.output_format.clone()]);

    if a.permission_mode == SKIP_PERMISSIONS_MODE {
        args.push("--dangerously-skip-permissions".to_string());
    } else if !a.permission_mode.is_empty() {
        args.extend(["--permission-mode".to_string(), a.permission_mode.clone()]);
    }

    if a.no_session_persistence {
        args.push("--no-session-persistence".to_string());
    }
    if let Some(effort) = &a.effort {
        args.extend(["--effort".to_string(), effort.clone()]);
    }
    if let Some(budget) = a.max_budget_usd {
        args.extend(["--max-budget-usd".to_string(), budget.to_string()]);
    }
    if let Some(fallback) = &a.fallback_model {
        args.extend(["--fallback-model".to_string(), fallback.clone()]);
    }

    if let Some(prompt) = context.render() {
        args.extend(["--append-system-prompt".to_string(), prompt]);
    }
    args.extend(["-p".to_string(), task.to_string()]);
    args
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn write_profile(root: &Path, dir: &str, yml: &str) -> PathBuf {
        let path = root.join(dir);
        std::fs::create_dir_all(&path).unwrap();
        std::fs::write(path.join(PROFILE_FILE), yml).unwrap();
        path
    }

    #[test]
    fn test_bundled_profiles_load() {
        let registry = ProfileRegistry::bundled(3600).unwrap();
        let code = registry.get("code").unwrap();
        assert_eq!(code.agent.model, "sonnet");
        assert_eq!(code.agent.max_turns, 80);
        assert!(code.auto_pr);
        assert!(code.packages().is_empty());

        let review = registry.get("review").unwrap();
        assert_eq!(review.extends.as_deref(), Some("code"));
        assert_eq!(review.agent.max_turns, 40);
        assert!(!review.agent.worktree);
        assert!(!review.auto_pr);
        assert_eq!(review.agent.model, "sonnet");
    }

    #[test]
    fn test_directory_profile_overrides_bundled() {
        let dir = tempdir().unwrap();
        write_profile(dir.path(), "code", "claude:\n  model: opus\n");
        let mut registry = ProfileRegistry::bundled(3600).unwrap();
        assert_eq!(registry.add_dir(dir.path()).unwrap(), 1);
        let code = registry.get("code").unwrap();
        assert_eq!(code.agent.model, "opus");
        assert_eq!(code.packages(), &[dir.path().join("code")]);
    }

    #[test]
    fn test_defaults_apply_to_empty_profile() {
        let dir = tempdir().unwrap();
        write_profile(dir.path(), "bare", "");
        let mut registry = ProfileRegistry::empty(1234);
        registry.add_dir(dir.path()).unwrap();
        let bare = registry.get("bare").unwrap();
        assert_eq!(bare.agent.timeout_secs, 1234);
        assert_eq!(bare.agent.permission_mode, "bypassPermissions");
        assert!(bare.agent.worktree);
        assert!(bare.auto_pr);
    }

    #[test]
    fn test_child_overrides_parent_field_by_field() {
        let dir = tempdir().unwrap();
        write_profile(
            dir.path(),
            "base",
            "description: base profile\nclaude:\n  model: opus\n  max_turns: 10\n  effort: high\nauto_pr: false\n",
        );
        write_profile(
            dir.path(),
            "child",
            "extends: base\nclaude:\n  max_turns: 20\n",
        );
        let mut registry = ProfileRegistry::empty(3600);
        registry.add_dir(dir.path()).unwrap();

        let child = registry.get("child").unwrap();
        assert_eq!(child.agent.model, "opus");
        assert_eq!(child.agent.max_turns, 20);
        assert_eq!(child.agent.effort.as_deref(), Some("high"));
        assert_eq!(child.description, "base profile");
        assert!(!child.auto_pr);
        assert_eq!(child.packages().len(), 2);
        assert!(child.packages()[0].ends_with("base"));
    }

    #[test]
    fn test_inheritance_cycle_terminates() {
        let dir = tempdir().unwrap();
        write_profile(dir.path(), "a", "extends: b\nclaude:\n  model: a-model\n");
        write_profile(dir.path(), "b", "extends: a\nclaude:\n  max_turns: 5\n");
        let mut registry = ProfileRegistry::empty(3600);
        registry.add_dir(dir.path()).unwrap();
        let a = registry.get("a").unwrap();
        assert_eq!(a.agent.model, "a-model");
        assert_eq!(a.agent.max_turns, 5);
    }

    #[test]
    fn test_unparsable_profile_is_skipped() {
        let dir = tempdir().unwrap();
        write_profile(dir.path(), "broken", "claude: [not, a, map\n");
        write_profile(dir.path(), "ok", "name: ok\n");
        let mut registry = ProfileRegistry::empty(3600);
        assert_eq!(registry.add_dir(dir.path()).unwrap(), 1);
        assert_eq!(registry.names(), vec!["ok"]);
    }

    #[test]
    fn test_resolve_falls_back_to_default() {
        let registry = ProfileRegistry::bundled(3600).unwrap();
        assert_eq!(registry.resolve("missing", Some("code")).unwrap().name, "code");
        let err = registry.resolve("missing", None).unwrap_err();
        assert!(matches!(err, ProfileError::NotFound(name) if name == "missing"));
        assert!(registry.resolve("missing", Some("also-missing")).is_err());
    }

    #[test]
    fn test_list_returns_summaries() {
        let registry = ProfileRegistry::bundled(3600).unwrap();
        let list = registry.list();
        let review = list.iter().find(|p| p.name == "review").unwrap();
        assert_eq!(review.extends.as_deref(), Some("code"));
        assert!(!review.auto_pr);
    }

    #[test]
    fn test_cli_args_order() {
        let registry = ProfileRegistry::bundled(3600).unwrap();
        let code = registry.get("code").unwrap();
        let ctx = PromptContext {
            job_id: "j1",
            task: "fix it",
            repo_url: Some("https://example.com/r.git"),
            base_ref: Some("main"),
        };
        let args = build_cli_args(&code, "fix it", &ctx);
        assert_eq!(
            args,
            vec![
                "--worktree",
                "--model",
                "sonnet",
                "--max-turns",
                "80",
                "--output-format",
                "json",
                "--permission-mode",
                "bypassPermissions",
                "--no-session-persistence",
                "--append-system-prompt",
                "Job: j1 | Task: fix it | Repo: https://example.com/r.git | Branch: main",
                "-p",
                "fix it",
            ]
        );
    }

    #[test]
    fn test_cli_args_optional_flags() {
        let dir = tempdir().unwrap();
        write_profile(
            dir.path(),
            "full",
            "claude:\n  worktree: false\n  permission_mode: dangerously-skip-permissions\n  no_session_persistence: false\n  effort: high\n  max_budget_usd: 2.5\n  fallback_model: haiku\n",
        );
        let mut registry = ProfileRegistry::empty(3600);
        registry.add_dir(dir.path()).unwrap();
        let full = registry.get("full").unwrap();
        let ctx = PromptContext {
            job_id: "j",
            task: "t",
            ..Default::default()
        };
        let args = build_cli_args(&full, "t", &ctx);
        assert!(!args.contains(&"--worktree".to_string()));
        assert!(args.contains(&"--dangerously-skip-permissions".to_string()));
        assert!(!args.contains(&"--permission-mode".to_string()));
        assert!(!args.contains(&"--no-session-persistence".to_string()));
        let budget = args.iter().position(|a| a == "--max-budget-usd").unwrap();
        assert_eq!(args[budget + 1], "2.5");
        let prompt = args.iter().position(|a| a == "--append-system-prompt").unwrap();
        assert_eq!(args[prompt + 1], "Job: j | Task: t");
        assert_eq!(&args[args.len() - 2..], &["-p", "t"]);
    }

    #[test]
    fn test_materialize_merges_chain_into_project() {
        let dir = tempdir().unwrap();
        let profiles = dir.path().join("profiles");
        let base = write_profile(&profiles, "base", "");
        std::fs::create_dir_all(base.join(".claude/agents")).unwrap();
        std::fs::write(
            base.join(".claude/settings.json"),
            r#"{"permissions":{"allow":["Read"],"deny":["Bash(rm:*)"]},"model":"a"}"#,
        )
        .unwrap();
        std::fs::write(base.join(".claude/agents/helper.md"), "helper").unwrap();
        std::fs::write(
            base.join(".mcp.json"),
            r#"{"mcpServers":{"one":{"command":"a"}}}"#,
        )
        .unwrap();

        let child = write_profile(&profiles, "child", "extends: base\n");
        std::fs::create_dir_all(child.join(".claude")).unwrap();
        std::fs::write(
            child.join(".claude/settings.json"),
            r#"{"permissions":{"allow":["Write","Read"]},"model":"b"}"#,
        )
        .unwrap();
        std::fs::write(
            child.join(".mcp.json"),
            r#"{"mcpServers":{"two":{"command":"b"}}}"#,
        )
        .unwrap();

        let mut registry = ProfileRegistry::empty(3600);
        registry.add_dir(&profiles).unwrap();
        let profile = registry.get("child").unwrap();

        let work = dir.path().join("work");
        std::fs::create_dir_all(&work).unwrap();
        let written = materialize(&profile, MaterializeTarget::Project(&work)).unwrap();
        assert!(!written.is_empty());

        let settings: Value = serde_json::from_str(
            &std::fs::read_to_string(work.join(".claude/settings.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(
            settings["permissions"]["allow"],
            serde_json::json!(["Read", "Write"])
        );
        assert_eq!(settings["permissions"]["deny"], serde_json::json!(["Bash(rm:*)"]));
        assert_eq!(settings["model"], "b");
        assert!(work.join(".claude/agents/helper.md").exists());

        let mcp: Value =
            serde_json::from_str(&std::fs::read_to_string(work.join(".mcp.json")).unwrap())
                .unwrap();
        assert!(mcp["mcpServers"]["one"].is_object());
        assert!(mcp["mcpServers"]["two"].is_object());
    }

    #[test]
    fn test_materialize_into_config_dir() {
        let dir = tempdir().unwrap();
        let profiles = dir.path().join("profiles");
        let pkg = write_profile(&profiles, "iso", "");
        std::fs::create_dir_all(pkg.join(".claude")).unwrap();
        std::fs::write(pkg.join(".claude/CLAUDE.md"), "instructions").unwrap();

        let mut registry = ProfileRegistry::empty(3600);
        registry.add_dir(&profiles).unwrap();
        let profile = registry.get("iso").unwrap();

        let config_dir = dir.path().join("job-state/j1");
        materialize(&profile, MaterializeTarget::ConfigDir(&config_dir)).unwrap();
        assert_eq!(
            std::fs::read_to_string(config_dir.join("CLAUDE.md")).unwrap(),
            "instructions"
        );
    }

    #[test]
    fn test_bundled_profile_materializes_nothing() {
        let dir = tempdir().unwrap();
        let registry = ProfileRegistry::bundled(3600).unwrap();
        let code = registry.get("code").unwrap();
        let written = materialize(&code, MaterializeTarget::Project(dir.path())).unwrap();
        assert!(written.is_empty());
    }

    #[test]
    fn test_write_bundled_does_not_overwrite() {
        let dir = tempdir().unwrap();
        let written = write_bundled(dir.path()).unwrap();
        assert!(written.iter().any(|p| p.ends_with("code/profile.yml")));
        std::fs::write(dir.path().join("code/profile.yml"), "name: code\n").unwrap();
        let again = write_bundled(dir.path()).unwrap();
        assert!(again.is_empty());
        assert_eq!(
            std::fs::read_to_string(dir.path().join("code/profile.yml")).unwrap(),
            "name: code\n"
        );
    }

    #[test]
    fn test_deep_merge_replaces_scalars_and_unions_arrays() {
        let mut base = serde_json::json!({"a": 1, "list": [1, 2], "nested": {"x": true}});
        deep_merge(
            &mut base,
            serde_json::json!({"a": 2, "list": [2, 3], "nested": {"y": false}}),
        );
        assert_eq!(
            base,
            serde_json::json!({"a": 2, "list": [1, 2, 3], "nested": {"x": true, "y": false}})
        );
    }
}
