//! Mock implementations of testing traits.
//!
//! Each mock replays a script of results in order and repeats the last
//! entry once the script runs out, so "fails the same way forever" is a
//! one-step script.

use super::traits::{AgentProcess, VerifyRunner, WorktreeProbe};
use crate::runner::CommandResult;
use async_trait::async_trait;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn scripted<T: Clone>(script: &[T], index: usize) -> Option<T> {
    script.get(index).or_else(|| script.last()).cloned()
}

/// In-memory working tree.
///
/// The fingerprint is derived from a generation counter shared with any
/// [`MockAgentProcess`] bound to it; an agent step that "changes" the tree
/// bumps the counter.
///
/// # Example
///
/// ```rust,ignore
/// let tree = MockWorktree::new();
/// let before = tree.fingerprint().await;
/// tree.touch();
/// assert_ne!(before, tree.fingerprint().await);
/// ```
#[derive(Debug, Clone, Default)]
pub struct MockWorktree {
    generation: Arc<AtomicU32>,
}

impl MockWorktree {
    /// Create a new mock with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate a file change.
    pub fn touch(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    /// Number of changes so far.
    pub fn generation(&self) -> u32 {
        self.generation.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl WorktreeProbe for MockWorktree {
    async fn fingerprint(&self) -> String {
        format!("mock-tree-{}", self.generation())
    }
}

/// One scripted agent invocation.
#[derive(Debug, Clone)]
pub struct AgentStep {
    pub result: CommandResult,
    /// Whether the invocation modifies the working tree
    pub changes_tree: bool,
}

/// Mock agent process.
///
/// Thread-safe for use in async contexts.
///
/// # Example
///
/// ```rust,ignore
/// let tree = MockWorktree::new();
/// let agent = MockAgentProcess::new()
///     .bound_to(&tree)
///     .with_idle_step(CommandResult::new(0, "", ""));
/// ```
#[derive(Debug, Default)]
pub struct MockAgentProcess {
    script: Vec<AgentStep>,
    worktree: Option<MockWorktree>,
    prompts: Mutex<Vec<String>>,
    call_count: AtomicU32,
}

impl MockAgentProcess {
    /// An agent that always exits 0 and changes the tree.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Change `worktree` whenever a step says so.
    #[must_use]
    pub fn bound_to(mut self, worktree: &MockWorktree) -> Self {
        self.worktree = Some(worktree.clone());
        self
    }

    /// Append a step that modifies the tree.
    #[must_use]
    pub fn with_step(mut self, result: CommandResult) -> Self {
        self.script.push(AgentStep {
            result,
            changes_tree: true,
        });
        self
    }

    /// Append a step that leaves the tree untouched.
    #[must_use]
    pub fn with_idle_step(mut self, result: CommandResult) -> Self {
        self.script.push(AgentStep {
            result,
            changes_tree: false,
        });
        self
    }

    /// Number of `exec` calls so far.
    pub fn call_count(&self) -> u32 {
        self.call_count.load(Ordering::SeqCst)
    }

    /// Prompts received, in order.
    pub fn prompts(&self) -> Vec<String> {
        lock(&self.prompts).clone()
    }
}

#[async_trait]
impl AgentProcess for MockAgentProcess {
    async fn exec(&self, prompt: &str, _last_message_path: &Path) -> CommandResult {
        let index = self.call_count.fetch_add(1, Ordering::SeqCst) as usize;
        lock(&self.prompts).push(prompt.to_string());

        let step = scripted(&self.script, index).unwrap_or(AgentStep {
            result: CommandResult::new(0, "done", ""),
            changes_tree: true,
        });
        if step.changes_tree {
            if let Some(tree) = &self.worktree {
                tree.touch();
            }
        }
        step.result
    }

    fn command_line(&self, last_message_path: &Path) -> String {
        format!("mock-agent exec -o {} -", last_message_path.display())
    }
}

/// Mock verification runner.
///
/// # Example
///
/// ```rust,ignore
/// let verify = MockVerifyRunner::new()
///     .with_result(CommandResult::new(1, "TOTAL 10 6 40%", ""))
///     .with_result(CommandResult::new(0, "TOTAL 10 1 90%", ""));
/// ```
#[derive(Debug, Default)]
pub struct MockVerifyRunner {
    script: Vec<CommandResult>,
    commands: Mutex<Vec<String>>,
    call_count: AtomicU32,
}

impl MockVerifyRunner {
    /// A runner that always passes with 100% coverage.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a scripted result.
    #[must_use]
    pub fn with_result(mut self, result: CommandResult) -> Self {
        self.script.push(result);
        self
    }

    /// Number of `run` calls so far.
    pub fn call_count(&self) -> u32 {
        self.call_count.load(Ordering::SeqCst)
    }

    /// Commands received, in order.
    pub fn commands(&self) -> Vec<String> {
        lock(&self.commands).clone()
    }
}

#[async_trait]
impl VerifyRunner for MockVerifyRunner {
    async fn run(&self, command: &str) -> CommandResult {
        let index = self.call_count.fetch_add(1, Ordering::SeqCst) as usize;
        lock(&self.commands).push(command.to_string());
        scripted(&self.script, index)
            .unwrap_or_else(|| CommandResult::new(0, "TOTAL 10 0 100%", ""))
    }
}
