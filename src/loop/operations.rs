//! Real implementations of testable traits.
//!
//! These implementations spawn actual processes. They implement the same
//! traits as the mocks, enabling dependency injection.

use crate::config::AgentConfig;
use crate::fingerprint::worktree_fingerprint;
use crate::runner::{run_args, run_shell, CommandResult};
use crate::testing::{AgentProcess, VerifyRunner, WorktreeProbe};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Real agent process.
///
/// Invoked as `<bin> exec --sandbox <mode> --ask-for-approval <mode> -o <file> -`
/// with the prompt on stdin.
#[derive(Debug, Clone)]
pub struct RealAgentProcess {
    root: PathBuf,
    config: AgentConfig,
}

impl RealAgentProcess {
    #[must_use]
    pub fn new(root: PathBuf, config: AgentConfig) -> Self {
        Self { root, config }
    }

    /// Arguments after the executable name.
    #[must_use]
    pub fn argv(&self, last_message_path: &Path) -> Vec<String> {
        vec![
            "exec".to_string(),
            "--sandbox".to_string(),
            self.config.sandbox.clone(),
            "--ask-for-approval".to_string(),
            self.config.approval.clone(),
            "-o".to_string(),
            last_message_path.display().to_string(),
            "-".to_string(),
        ]
    }
}

#[async_trait]
impl AgentProcess for RealAgentProcess {
    async fn exec(&self, prompt: &str, last_message_path: &Path) -> CommandResult {
        debug!("Prompt is {} bytes", prompt.len());
        run_args(
            &self.config.binary,
            &self.argv(last_message_path),
            &self.root,
            Some(prompt),
            self.config.timeout,
        )
        .await
    }

    fn command_line(&self, last_message_path: &Path) -> String {
        format!(
            "{} {}",
            self.config.binary,
            self.argv(last_message_path).join(" ")
        )
    }
}

/// Real verification runner: the command goes through the shell.
#[derive(Debug, Clone)]
pub struct RealVerifyRunner {
    root: PathBuf,
    timeout: Duration,
}

impl RealVerifyRunner {
    #[must_use]
    pub fn new(root: PathBuf, timeout: Duration) -> Self {
        Self { root, timeout }
    }
}

#[async_trait]
impl VerifyRunner for RealVerifyRunner {
    async fn run(&self, command: &str) -> CommandResult {
        run_shell(command, &self.root, self.timeout).await
    }
}

/// Git-backed working tree probe.
#[derive(Debug, Clone)]
pub struct GitWorktree {
    root: PathBuf,
}

impl GitWorktree {
    #[must_use]
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }
}

#[async_trait]
impl WorktreeProbe for GitWorktree {
    async fn fingerprint(&self) -> String {
        worktree_fingerprint(&self.root).await
    }
}
