//! Loop management module.
//!
//! This module contains the implement-verify-repair loop:
//!
//! - [`manager`] - Drives cycles and decides continue, stop or succeed
//! - [`state`] - Run status, repeat counter and session identity
//! - [`logs`] - Per-cycle log artifacts and the final report file
//! - [`operations`] - Real implementations of the testable traits
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────┐     ┌──────────────┐     ┌─────────────┐
//! │ LoopManager │────>│ LoopState    │────>│RepeatCounter│
//! └─────────────┘     └──────────────┘     └─────────────┘
//!       │
//!       v
//! ┌─────────────┐     ┌──────────────┐     ┌─────────────┐
//! │ Agent       │────>│ Classifier   │────>│ Stop report │
//! │ Verify      │     │              │     │             │
//! └─────────────┘     └──────────────┘     └─────────────┘
//! ```

pub mod logs;
pub mod manager;
pub mod operations;
pub mod state;

// Re-exports for convenience
pub use manager::{LoopDependencies, LoopManager, LoopOutcome};
pub use state::{LoopState, LoopStatus, RepeatCounter};
