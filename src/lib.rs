//! codex-loop - implement, verify, repair
//!
//! Drives an external code-generation agent against a fixed task request
//! until the project's tests pass with enough coverage, or until the loop
//! can say precisely why it cannot get there.
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - [`runner`] - Subprocess execution that never fails
//! - [`fingerprint`] - Text and working-tree hashes
//! - [`classify`] - Ordered failure classification rules
//! - [`report`] - Failures, stop reports and remediation hints
//! - [`prompt`] - Follow-up prompts for later cycles
//! - [`tooling`] - Verification command discovery
//! - [`config`] - Run configuration and layered settings files
//! - [`lock`] - Single-run guard per working tree
//! - [`r#loop`] - The control loop itself
//! - [`error`] - Setup error types
//! - [`testing`] - Testing infrastructure (traits, mocks)
//!
//! # Example
//!
//! ```rust,ignore
//! use codex_loop::config::LoopConfig;
//! use codex_loop::r#loop::{LoopDependencies, LoopManager};
//!
//! let config = LoopConfig::new(".", "docs/request.md")
//!     .with_verify_command("uv run pytest -q --cov=.");
//! let deps = LoopDependencies::real(&config);
//! let outcome = LoopManager::new(config, deps)?.run().await;
//! if let Some(report) = outcome.report {
//!     println!("{report}");
//! }
//! ```

pub mod classify;
pub mod config;
pub mod error;
pub mod fingerprint;
pub mod lock;
pub mod r#loop;
pub mod prompt;
pub mod report;
pub mod runner;
pub mod testing;
pub mod tooling;

// Re-export commonly used types
pub use error::{LoopError, Result};

pub use classify::{Classification, FailureCategory, FailureKind};

pub use config::{AgentConfig, ConfigLocations, LoopConfig, LoopSettings, RepeatGuardScope};

pub use r#loop::{LoopDependencies, LoopManager, LoopOutcome, LoopStatus};

pub use report::{Failure, StopReason};

pub use runner::{CommandResult, CommandSpec};

pub use testing::{
    AgentProcess, MockAgentProcess, MockVerifyRunner, MockWorktree, VerifyRunner, WorktreeProbe,
};
