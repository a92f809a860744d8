//! Testing infrastructure for codex-loop.
//!
//! The loop manager only sees the outside world through the traits defined
//! here, so whole runs can be scripted without spawning an agent, running a
//! test suite or touching git.
//!
//! - **Traits**: [`AgentProcess`], [`VerifyRunner`], [`WorktreeProbe`]
//! - **Mocks**: scripted doubles with call recording
//!
//! # Example
//!
//! ```rust,ignore
//! use codex_loop::testing::{MockAgentProcess, MockVerifyRunner, MockWorktree};
//!
//! let tree = MockWorktree::new();
//! let agent = MockAgentProcess::new().bound_to(&tree);
//! let verify = MockVerifyRunner::new()
//!     .with_result(CommandResult::new(1, "1 failed\nTOTAL 10 6 40%", ""));
//! ```

pub mod mocks;
pub mod traits;

// Re-export commonly used types
pub use mocks::*;
pub use traits::*;
