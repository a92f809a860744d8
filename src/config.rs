//! Configuration for codex-loop.
//!
//! The loop receives an explicit [`LoopConfig`]; nothing is read from
//! ambient state once a run starts. How that struct is filled in is a setup
//! concern handled here:
//!
//! 1. **Defaults** - [`LoopConfig::new`]
//! 2. **User** - `{config_dir}/codex-loop/config.json`
//! 3. **Project** - `<root>/.codex-loop/settings.json`
//! 4. **CLI flags** - applied last by the binary
//!
//! Settings files share one JSON shape, every field optional:
//!
//! ```json
//! {
//!   "minCoverage": 85,
//!   "maxQualityCycles": 10,
//!   "repeatGuardScope": "all",
//!   "verifyCommand": "uv run pytest -q --cov=."
//! }
//! ```

use crate::error::{LoopError, Result};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Default minimum coverage percentage.
pub const DEFAULT_MIN_COVERAGE: f64 = 80.0;
/// Default cycle budget.
pub const DEFAULT_MAX_QUALITY_CYCLES: u32 = 25;
/// Default repeat-guard threshold.
pub const DEFAULT_MAX_BLOCKED_REPEATS: u32 = 5;
/// Default agent executable.
pub const DEFAULT_AGENT_BIN: &str = "codex";
pub const DEFAULT_SANDBOX: &str = "workspace-write";
pub const DEFAULT_APPROVAL: &str = "never";
pub const DEFAULT_AGENT_TIMEOUT: Duration = Duration::from_secs(60 * 60);
pub const DEFAULT_VERIFY_TIMEOUT: Duration = Duration::from_secs(30 * 60);
/// Default tooling detector.
pub const DEFAULT_TOOLING_COMMAND: &str = "node .cursor/scripts/recommend-commands.js --json";
pub const DEFAULT_TOOLING_TIMEOUT: Duration = Duration::from_secs(60);
/// Log directory, relative to the project root.
pub const DEFAULT_LOG_DIR: &str = ".cursor/.hook_state/codex_loop";
/// Project settings file, relative to the project root.
pub const PROJECT_SETTINGS_PATH: &str = ".codex-loop/settings.json";

/// Which failures feed the repeat counter.
///
/// Only blocked categories can stop a run either way; `All` just counts
/// transient failures too.
///
/// # Example
///
/// ```
/// use codex_loop::config::RepeatGuardScope;
///
/// assert_eq!(RepeatGuardScope::default(), RepeatGuardScope::Blocked);
/// assert_eq!(RepeatGuardScope::All.to_string(), "all");
/// ```
#[derive(
    Debug, Clone, Copy, Default, ValueEnum, PartialEq, Eq, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum RepeatGuardScope {
    /// Count blocked categories only
    #[default]
    Blocked,
    /// Count every non-OK category
    All,
}

impl std::fmt::Display for RepeatGuardScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RepeatGuardScope::Blocked => write!(f, "blocked"),
            RepeatGuardScope::All => write!(f, "all"),
        }
    }
}

/// How the agent is invoked.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentConfig {
    /// Executable name or path
    pub binary: String,
    /// Value for `--sandbox`
    pub sandbox: String,
    /// Value for `--ask-for-approval`
    pub approval: String,
    /// Wall-clock limit for one invocation
    pub timeout: Duration,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            binary: DEFAULT_AGENT_BIN.to_string(),
            sandbox: DEFAULT_SANDBOX.to_string(),
            approval: DEFAULT_APPROVAL.to_string(),
            timeout: DEFAULT_AGENT_TIMEOUT,
        }
    }
}

/// Everything one loop run needs.
#[derive(Debug, Clone, PartialEq)]
pub struct LoopConfig {
    /// Repository root; every command runs here
    pub root: PathBuf,
    /// Task request file
    pub request_path: PathBuf,
    pub min_coverage: f64,
    pub max_quality_cycles: u32,
    pub max_blocked_repeats: u32,
    pub repeat_guard_scope: RepeatGuardScope,
    pub agent: AgentConfig,
    /// Explicit verification command; `None` means ask the tooling detector
    pub verify_command: Option<String>,
    pub verify_timeout: Duration,
    pub tooling_command: String,
    pub tooling_timeout: Duration,
    /// Per-cycle logs and the final report
    pub log_dir: PathBuf,
}

impl LoopConfig {
    /// Defaults for a run in `root`. A relative `request_path` is taken
    /// relative to `root`.
    ///
    /// # Example
    ///
    /// ```
    /// use codex_loop::config::LoopConfig;
    /// use std::path::Path;
    ///
    /// let config = LoopConfig::new("/repo", "docs/request.md");
    /// assert_eq!(config.request_path, Path::new("/repo/docs/request.md"));
    /// assert_eq!(config.max_quality_cycles, 25);
    /// ```
    pub fn new(root: impl Into<PathBuf>, request_path: impl AsRef<Path>) -> Self {
        let root = root.into();
        let request_path = root.join(request_path);
        let log_dir = root.join(DEFAULT_LOG_DIR);
        Self {
            root,
            request_path,
            min_coverage: DEFAULT_MIN_COVERAGE,
            max_quality_cycles: DEFAULT_MAX_QUALITY_CYCLES,
            max_blocked_repeats: DEFAULT_MAX_BLOCKED_REPEATS,
            repeat_guard_scope: RepeatGuardScope::default(),
            agent: AgentConfig::default(),
            verify_command: None,
            verify_timeout: DEFAULT_VERIFY_TIMEOUT,
            tooling_command: DEFAULT_TOOLING_COMMAND.to_string(),
            tooling_timeout: DEFAULT_TOOLING_TIMEOUT,
            log_dir,
        }
    }

    #[must_use]
    pub fn with_min_coverage(mut self, min_coverage: f64) -> Self {
        self.min_coverage = min_coverage;
        self
    }

    #[must_use]
    pub fn with_max_quality_cycles(mut self, cycles: u32) -> Self {
        self.max_quality_cycles = cycles;
        self
    }

    #[must_use]
    pub fn with_max_blocked_repeats(mut self, repeats: u32) -> Self {
        self.max_blocked_repeats = repeats;
        self
    }

    #[must_use]
    pub fn with_repeat_guard_scope(mut self, scope: RepeatGuardScope) -> Self {
        self.repeat_guard_scope = scope;
        self
    }

    #[must_use]
    pub fn with_agent(mut self, agent: AgentConfig) -> Self {
        self.agent = agent;
        self
    }

    /// Set the verification command. Blank means "none".
    #[must_use]
    pub fn with_verify_command(mut self, command: impl Into<String>) -> Self {
        let command = command.into();
        self.verify_command = (!command.trim().is_empty()).then_some(command);
        self
    }

    #[must_use]
    pub fn without_verify_command(mut self) -> Self {
        self.verify_command = None;
        self
    }

    #[must_use]
    pub fn with_verify_timeout(mut self, timeout: Duration) -> Self {
        self.verify_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_tooling_command(mut self, command: impl Into<String>) -> Self {
        self.tooling_command = command.into();
        self
    }

    /// Set the log directory. Relative paths are taken relative to the root.
    #[must_use]
    pub fn with_log_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.log_dir = self.root.join(dir);
        self
    }

    /// Check the values before a run starts.
    ///
    /// # Errors
    ///
    /// `LoopError::InvalidConfig` naming the first offending field.
    pub fn validate(&self) -> Result<()> {
        if !self.min_coverage.is_finite() || !(0.0..=100.0).contains(&self.min_coverage) {
            return Err(LoopError::invalid(
                "min_coverage",
                format!("must be between 0 and 100, got {}", self.min_coverage),
            ));
        }
        if self.max_quality_cycles == 0 {
            return Err(LoopError::invalid("max_quality_cycles", "must be at least 1"));
        }
        if self.max_blocked_repeats == 0 {
            return Err(LoopError::invalid("max_blocked_repeats", "must be at least 1"));
        }
        if self.agent.binary.trim().is_empty() {
            return Err(LoopError::invalid("agent_bin", "must not be empty"));
        }
        if self.agent.timeout.is_zero() {
            return Err(LoopError::invalid("agent_timeout", "must be greater than 0"));
        }
        if self.verify_timeout.is_zero() {
            return Err(LoopError::invalid("verify_timeout", "must be greater than 0"));
        }
        Ok(())
    }
}

/// One layer of settings as stored on disk.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoopSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_coverage: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_quality_cycles: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_blocked_repeats: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repeat_guard_scope: Option<RepeatGuardScope>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_bin: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sandbox: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ask_for_approval: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_timeout_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verify_command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verify_timeout_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tooling_command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_dir: Option<PathBuf>,
}

impl LoopSettings {
    /// Read one settings file. A missing file is `Ok(None)`.
    ///
    /// # Errors
    ///
    /// `LoopError::Config` naming the path when the file is unreadable or
    /// not valid JSON.
    pub fn load_file(path: &Path) -> Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(path).map_err(|e| {
            LoopError::config_with_path(format!("failed to read settings: {e}"), path.to_path_buf())
        })?;
        let settings = serde_json::from_str(&content).map_err(|e| {
            LoopError::config_with_path(
                format!("failed to parse {}: {e}", path.display()),
                path.to_path_buf(),
            )
        })?;
        debug!("Loaded settings from {}", path.display());
        Ok(Some(settings))
    }

    /// Load user then project settings, project winning field by field.
    pub fn load_layered(root: &Path, locations: &ConfigLocations) -> Result<Self> {
        let mut merged = Self::default();
        if let Some(user) = locations.user_path() {
            if let Some(settings) = Self::load_file(user)? {
                merged = merged.merge(settings);
            }
        }
        if let Some(project) = Self::load_file(&locations.project_path(root))? {
            merged = merged.merge(project);
        }
        Ok(merged)
    }

    /// Overlay `other` on top of `self`.
    #[must_use]
    pub fn merge(self, other: Self) -> Self {
        Self {
            min_coverage: other.min_coverage.or(self.min_coverage),
            max_quality_cycles: other.max_quality_cycles.or(self.max_quality_cycles),
            max_blocked_repeats: other.max_blocked_repeats.or(self.max_blocked_repeats),
            repeat_guard_scope: other.repeat_guard_scope.or(self.repeat_guard_scope),
            agent_bin: other.agent_bin.or(self.agent_bin),
            sandbox: other.sandbox.or(self.sandbox),
            ask_for_approval: other.ask_for_approval.or(self.ask_for_approval),
            agent_timeout_secs: other.agent_timeout_secs.or(self.agent_timeout_secs),
            verify_command: other.verify_command.or(self.verify_command),
            verify_timeout_secs: other.verify_timeout_secs.or(self.verify_timeout_secs),
            tooling_command: other.tooling_command.or(self.tooling_command),
            log_dir: other.log_dir.or(self.log_dir),
        }
    }

    /// Apply the fields that are set onto `config`.
    #[must_use]
    pub fn apply(&self, mut config: LoopConfig) -> LoopConfig {
        if let Some(v) = self.min_coverage {
            config.min_coverage = v;
        }
        if let Some(v) = self.max_quality_cycles {
            config.max_quality_cycles = v;
        }
        if let Some(v) = self.max_blocked_repeats {
            config.max_blocked_repeats = v;
        }
        if let Some(v) = self.repeat_guard_scope {
            config.repeat_guard_scope = v;
        }
        if let Some(v) = &self.agent_bin {
            config.agent.binary = v.clone();
        }
        if let Some(v) = &self.sandbox {
            config.agent.sandbox = v.clone();
        }
        if let Some(v) = &self.ask_for_approval {
            config.agent.approval = v.clone();
        }
        if let Some(v) = self.agent_timeout_secs {
            config.agent.timeout = Duration::from_secs(v);
        }
        if let Some(v) = &self.verify_command {
            config = config.with_verify_command(v.clone());
        }
        if let Some(v) = self.verify_timeout_secs {
            config.verify_timeout = Duration::from_secs(v);
        }
        if let Some(v) = &self.tooling_command {
            config.tooling_command = v.clone();
        }
        if let Some(v) = &self.log_dir {
            config = config.with_log_dir(v);
        }
        config
    }

    /// Fully populated settings describing `config`, for display.
    #[must_use]
    pub fn from_config(config: &LoopConfig) -> Self {
        Self {
            min_coverage: Some(config.min_coverage),
            max_quality_cycles: Some(config.max_quality_cycles),
            max_blocked_repeats: Some(config.max_blocked_repeats),
            repeat_guard_scope: Some(config.repeat_guard_scope),
            agent_bin: Some(config.agent.binary.clone()),
            sandbox: Some(config.agent.sandbox.clone()),
            ask_for_approval: Some(config.agent.approval.clone()),
            agent_timeout_secs: Some(config.agent.timeout.as_secs()),
            verify_command: config.verify_command.clone(),
            verify_timeout_secs: Some(config.verify_timeout.as_secs()),
            tooling_command: Some(config.tooling_command.clone()),
            log_dir: Some(config.log_dir.clone()),
        }
    }
}

/// Where settings files live.
#[derive(Debug, Clone)]
pub struct ConfigLocations {
    user: Option<PathBuf>,
}

impl Default for ConfigLocations {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigLocations {
    /// Platform defaults.
    #[must_use]
    pub fn new() -> Self {
        Self {
            user: Self::default_user_path(),
        }
    }

    /// No user-level file; project settings only.
    #[must_use]
    pub fn project_only() -> Self {
        Self { user: None }
    }

    /// `{config_dir}/codex-loop/config.json`, if the platform has a config dir.
    #[must_use]
    pub fn default_user_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("codex-loop").join("config.json"))
    }

    #[must_use]
    pub fn user_path(&self) -> Option<&PathBuf> {
        self.user.as_ref()
    }

    #[must_use]
    pub fn with_user_path(mut self, path: PathBuf) -> Self {
        self.user = Some(path);
        self
    }

    /// Project settings path for `root`.
    #[must_use]
    pub fn project_path(&self, root: &Path) -> PathBuf {
        root.join(PROJECT_SETTINGS_PATH)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_settings(path: &Path, json: &str) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, json).unwrap();
    }

    #[test]
    fn test_defaults() {
        let config = LoopConfig::new("/repo", "req.md");
        assert_eq!(config.min_coverage, 80.0);
        assert_eq!(config.max_blocked_repeats, 5);
        assert_eq!(config.repeat_guard_scope, RepeatGuardScope::Blocked);
        assert_eq!(config.agent.binary, "codex");
        assert_eq!(config.agent.sandbox, "workspace-write");
        assert_eq!(config.agent.approval, "never");
        assert_eq!(config.agent.timeout, Duration::from_secs(3600));
        assert_eq!(config.verify_timeout, Duration::from_secs(1800));
        assert_eq!(config.verify_command, None);
        assert_eq!(
            config.log_dir,
            PathBuf::from("/repo/.cursor/.hook_state/codex_loop")
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_absolute_request_path_kept() {
        let config = LoopConfig::new("/repo", "/elsewhere/req.md");
        assert_eq!(config.request_path, PathBuf::from("/elsewhere/req.md"));
    }

    #[test]
    fn test_blank_verify_command_is_none() {
        let config = LoopConfig::new("/repo", "req.md").with_verify_command("   ");
        assert_eq!(config.verify_command, None);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let base = LoopConfig::new("/repo", "req.md");

        let err = base.clone().with_min_coverage(101.0).validate().unwrap_err();
        assert!(err.to_string().contains("min_coverage"));
        assert!(base.clone().with_min_coverage(f64::NAN).validate().is_err());
        assert!(base.clone().with_max_quality_cycles(0).validate().is_err());
        assert!(base.clone().with_max_blocked_repeats(0).validate().is_err());

        let agent = AgentConfig {
            binary: " ".to_string(),
            ..AgentConfig::default()
        };
        assert!(base.clone().with_agent(agent).validate().is_err());
        assert!(base.with_min_coverage(100.0).validate().is_ok());
    }

    #[test]
    fn test_merge_prefers_overlay() {
        let user = LoopSettings {
            min_coverage: Some(70.0),
            agent_bin: Some("codex-beta".to_string()),
            ..LoopSettings::default()
        };
        let project = LoopSettings {
            min_coverage: Some(90.0),
            ..LoopSettings::default()
        };
        let merged = user.merge(project);
        assert_eq!(merged.min_coverage, Some(90.0));
        assert_eq!(merged.agent_bin.as_deref(), Some("codex-beta"));
    }

    #[test]
    fn test_load_layered_project_over_user() {
        let temp = TempDir::new().unwrap();
        let user_path = temp.path().join("user/config.json");
        write_settings(
            &user_path,
            r#"{"minCoverage": 70, "maxQualityCycles": 3, "sandbox": "read-only"}"#,
        );
        let root = temp.path().join("repo");
        write_settings(
            &root.join(PROJECT_SETTINGS_PATH),
            r#"{"maxQualityCycles": 7, "repeatGuardScope": "all", "verifyCommand": "make test"}"#,
        );

        let locations = ConfigLocations::project_only().with_user_path(user_path);
        let settings = LoopSettings::load_layered(&root, &locations).unwrap();
        let config = settings.apply(LoopConfig::new(&root, "req.md"));

        assert_eq!(config.min_coverage, 70.0);
        assert_eq!(config.max_quality_cycles, 7);
        assert_eq!(config.repeat_guard_scope, RepeatGuardScope::All);
        assert_eq!(config.agent.sandbox, "read-only");
        assert_eq!(config.verify_command.as_deref(), Some("make test"));
    }

    #[test]
    fn test_missing_files_yield_defaults() {
        let temp = TempDir::new().unwrap();
        let settings =
            LoopSettings::load_layered(temp.path(), &ConfigLocations::project_only()).unwrap();
        assert_eq!(settings, LoopSettings::default());
    }

    #[test]
    fn test_malformed_file_names_path() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join(PROJECT_SETTINGS_PATH);
        write_settings(&path, "{ not json");
        let err = LoopSettings::load_layered(temp.path(), &ConfigLocations::project_only())
            .unwrap_err();
        match err {
            LoopError::Config { path: Some(p), .. } => assert_eq!(p, path),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_apply_relative_log_dir() {
        let settings = LoopSettings {
            log_dir: Some(PathBuf::from("logs/loop")),
            agent_timeout_secs: Some(10),
            ..LoopSettings::default()
        };
        let config = settings.apply(LoopConfig::new("/repo", "req.md"));
        assert_eq!(config.log_dir, PathBuf::from("/repo/logs/loop"));
        assert_eq!(config.agent.timeout, Duration::from_secs(10));
    }

    #[test]
    fn test_from_config_round_trips_through_apply() {
        let config = LoopConfig::new("/repo", "req.md")
            .with_min_coverage(91.5)
            .with_verify_command("pytest");
        let shown = LoopSettings::from_config(&config);
        let json = serde_json::to_string(&shown).unwrap();
        assert!(json.contains("\"minCoverage\":91.5"));
        assert!(json.contains("\"verifyCommand\":\"pytest\""));
        assert_eq!(shown.apply(LoopConfig::new("/repo", "req.md")), config);
    }
}
