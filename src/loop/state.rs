//! Loop state types and transitions.
//!
//! This module defines the state the loop manager carries across cycles:
//! the lifecycle status, the repeat counter that drives the blocked-failure
//! guard, and the session identity.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Lifecycle status of a loop run.
///
/// `Running` is the only non-terminal state.
///
/// # Example
///
/// ```
/// use codex_loop::r#loop::state::LoopStatus;
///
/// assert!(!LoopStatus::Running.is_terminal());
/// assert!(LoopStatus::StoppedBlocked.is_terminal());
/// assert_eq!(LoopStatus::StoppedExhausted.to_string(), "STOPPED_EXHAUSTED");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LoopStatus {
    Running,
    /// Tests pass with enough coverage
    Success,
    /// A blocked condition needs an operator
    StoppedBlocked,
    /// Cycle budget spent
    StoppedExhausted,
}

impl LoopStatus {
    /// Stable label.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            LoopStatus::Running => "RUNNING",
            LoopStatus::Success => "SUCCESS",
            LoopStatus::StoppedBlocked => "STOPPED_BLOCKED",
            LoopStatus::StoppedExhausted => "STOPPED_EXHAUSTED",
        }
    }

    /// Whether no further transition is allowed.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        !matches!(self, LoopStatus::Running)
    }
}

impl std::fmt::Display for LoopStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Occurrence count per failure signature, for one run only.
///
/// Counts only ever go up.
#[derive(Debug, Clone, Default)]
pub struct RepeatCounter {
    counts: HashMap<String, u32>,
}

impl RepeatCounter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one more occurrence of `signature`; returns the new count.
    pub fn increment(&mut self, signature: &str) -> u32 {
        let count = self.counts.entry(signature.to_string()).or_insert(0);
        *count = count.saturating_add(1);
        *count
    }

    /// Current count for `signature` (0 if never seen).
    #[must_use]
    pub fn get(&self, signature: &str) -> u32 {
        self.counts.get(signature).copied().unwrap_or(0)
    }

    /// Number of distinct signatures seen.
    #[must_use]
    pub fn len(&self) -> usize {
        self.counts.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }
}

/// State of one loop run.
///
/// # Example
///
/// ```
/// use codex_loop::r#loop::state::{LoopState, LoopStatus};
///
/// let state = LoopState::new();
/// assert_eq!(state.cycle, 0);
/// assert_eq!(state.status, LoopStatus::Running);
/// ```
#[derive(Debug, Clone)]
pub struct LoopState {
    /// Current cycle (1-indexed once the first cycle starts)
    pub cycle: u32,
    pub status: LoopStatus,
    pub repeats: RepeatCounter,
    /// Unique session identifier
    pub session_id: String,
}

impl Default for LoopState {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopState {
    #[must_use]
    pub fn new() -> Self {
        Self {
            cycle: 0,
            status: LoopStatus::Running,
            repeats: RepeatCounter::new(),
            session_id: Utc::now().format("%Y%m%dT%H%M%S%.3fZ").to_string(),
        }
    }

    /// Move to a terminal status. Ignored once the run has already ended.
    pub fn finish(&mut self, status: LoopStatus) {
        if self.status.is_terminal() {
            tracing::debug!("Ignoring transition {} -> {}", self.status, status);
            return;
        }
        self.status = status;
    }
}
