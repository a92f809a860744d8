//! Custom error types for codex-loop.
//!
//! Only setup and configuration faults are errors. Anything that happens
//! inside a cycle (missing executables, timeouts, failing tests) is turned
//! into a [`CommandResult`](crate::runner::CommandResult) and classified
//! instead of being raised.

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for codex-loop setup.
#[derive(Error, Debug)]
pub enum LoopError {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Failed to load configuration
    #[error("Configuration error: {message}")]
    Config {
        message: String,
        path: Option<PathBuf>,
    },

    /// Invalid configuration value
    #[error("Invalid configuration: {field} - {reason}")]
    InvalidConfig { field: String, reason: String },

    /// Missing required file
    #[error("Missing required file: {path}")]
    MissingFile { path: PathBuf },

    // =========================================================================
    // Environment Errors
    // =========================================================================
    /// Project root is not inside a git working tree
    #[error("Not inside a git repository: {path}")]
    NotGitRepo { path: PathBuf },

    /// The tooling detector failed or returned something other than JSON
    #[error("Tooling detection failed: {message}")]
    ToolingDetection { message: String },

    /// Another loop holds the run lock for this working tree
    #[error("Another codex-loop run is active (lock: {path})")]
    AlreadyRunning { path: PathBuf },

    // =========================================================================
    // Wrapped Errors
    // =========================================================================
    /// IO error wrapper
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// JSON error wrapper
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// Generic error wrapper
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl LoopError {
    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            path: None,
        }
    }

    /// Create a configuration error with path
    pub fn config_with_path(message: impl Into<String>, path: PathBuf) -> Self {
        Self::Config {
            message: message.into(),
            path: Some(path),
        }
    }

    /// Create an invalid configuration error
    pub fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Create a tooling detection error
    pub fn tooling(message: impl Into<String>) -> Self {
        Self::ToolingDetection {
            message: message.into(),
        }
    }

    /// Check if this error comes from the environment rather than from code
    /// (the operator has to fix something before rerunning).
    pub fn is_setup_fault(&self) -> bool {
        matches!(
            self,
            Self::Config { .. }
                | Self::InvalidConfig { .. }
                | Self::MissingFile { .. }
                | Self::NotGitRepo { .. }
                | Self::ToolingDetection { .. }
                | Self::AlreadyRunning { .. }
        )
    }

    /// Get error code for exit status
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::MissingFile { .. } | Self::NotGitRepo { .. } | Self::ToolingDetection { .. } => {
                6
            }
            Self::Config { .. } | Self::InvalidConfig { .. } => 7,
            Self::AlreadyRunning { .. } => 8,
            _ => 1,
        }
    }
}

/// Type alias for codex-loop results
pub type Result<T> = std::result::Result<T, LoopError>;
