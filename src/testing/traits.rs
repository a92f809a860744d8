//! Trait definitions for testable abstractions.
//!
//! The loop talks to the outside world through three seams: the agent
//! process, the verification command and the working tree. Each has a real
//! implementation in [`crate::r#loop::operations`] and a scripted double in
//! [`super::mocks`].

use crate::runner::CommandResult;
use async_trait::async_trait;
use std::path::Path;

/// Abstraction for the code-generation agent.
///
/// Implementations never fail: spawn errors and timeouts come back as a
/// [`CommandResult`] with a sentinel exit code.
///
/// # Example
///
/// ```rust,ignore
/// use codex_loop::testing::AgentProcess;
///
/// async fn attempt(agent: &impl AgentProcess, prompt: &str) -> bool {
///     agent.exec(prompt, Path::new("last.md")).await.success()
/// }
/// ```
#[async_trait]
pub trait AgentProcess: Send + Sync {
    /// Run one agent invocation with `prompt` on stdin, asking it to write
    /// its final message to `last_message_path`.
    async fn exec(&self, prompt: &str, last_message_path: &Path) -> CommandResult;

    /// Human-readable command line, used in reports.
    fn command_line(&self, last_message_path: &Path) -> String;
}

/// Abstraction for the verification command.
#[async_trait]
pub trait VerifyRunner: Send + Sync {
    /// Run `command` through the shell at the project root.
    async fn run(&self, command: &str) -> CommandResult;
}

/// Abstraction for working-tree fingerprinting.
///
/// Two equal fingerprints mean nothing changed in between.
#[async_trait]
pub trait WorktreeProbe: Send + Sync {
    async fn fingerprint(&self) -> String;
}
