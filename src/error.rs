//! Error types for taskloop.
//!
//! Per-attempt and per-worker failures never travel through these types past
//! their boundary: they are folded into [`Attempt`](crate::iteration::Attempt)
//! and [`Worker`](crate::parallel::Worker) records. What remains here is the
//! vocabulary for failures that stop a driver, plus the classification used to
//! pick a process exit code.

use std::path::PathBuf;
use thiserror::Error;

/// Process exit code: every task is done.
pub const EXIT_COMPLETE: i32 = 0;
/// Process exit code: all blocked, iteration cap hit, or no progress.
pub const EXIT_INCOMPLETE: i32 = 1;
/// Process exit code: configuration or selection error.
pub const EXIT_ERROR: i32 = 2;

/// Main error type for taskloop operations
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

    // =========================================================================
    // Attempt Errors
    // =========================================================================
    /// Agent process exceeded its wall-clock budget
    #[error("Agent timed out after {secs}s")]
    AgentTimeout { secs: u64 },

    /// Agent process exited with a non-zero code or could not be spawned
    #[error("Agent exited with code {code:?}: {message}")]
    AgentNonZeroExit { code: Option<i32>, message: String },

    /// A validation gate returned non-zero
    #[error("Gate '{gate}' failed with code {code:?}")]
    GateFailure { gate: String, code: Option<i32> },

    /// Review agent did not ship the diff
    #[error("Review blocked: {reason}")]
    ReviewBlocked { reason: String },

    // =========================================================================
    // Parallel Errors
    // =========================================================================
    /// Workspace could not be created
    #[error("Workspace creation failed: {message}")]
    WorkspaceCreation { message: String },

    /// Auto-merge hit conflicts
    #[error("Merge conflict on branch {branch}: {files:?}")]
    MergeConflict { branch: String, files: Vec<String> },

    // =========================================================================
    // Loop Errors
    // =========================================================================
    /// No task is selectable yet the tracker is neither done nor blocked
    #[error("Selection anomaly: {detail}")]
    SelectionAnomaly { detail: String },

    /// Loop state document could not be read (recovered by fail-open)
    #[error("State load error: {message}")]
    StateLoad { message: String },

    /// Loop state document could not be written
    #[error("State write failed for {path}: {message}")]
    StateWrite { path: PathBuf, message: String },

    /// Tracker backend failure
    #[error("Tracker error: {message}")]
    Tracker { message: String },

    /// Git operation failed
    #[error("Git operation failed: {operation} - {message}")]
    Git { operation: String, message: String },

    // =========================================================================
    // Wrapped Errors
    // =========================================================================
    /// IO error wrapper
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// JSON error wrapper
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// TOML error wrapper
    #[error(transparent)]
    Toml(#[from] toml::de::Error),
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

    /// Create a tracker error
    pub fn tracker(message: impl Into<String>) -> Self {
        Self::Tracker {
            message: message.into(),
        }
    }

    /// Create a git error
    pub fn git(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Git {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Create a selection anomaly
    pub fn selection(detail: impl Into<String>) -> Self {
        Self::SelectionAnomaly {
            detail: detail.into(),
        }
    }

    /// Check if this error belongs to a single attempt or worker.
    ///
    /// Such errors are recorded as data and never end a run.
    pub fn is_attempt_scoped(&self) -> bool {
        matches!(
            self,
            Self::AgentTimeout { .. }
                | Self::AgentNonZeroExit { .. }
                | Self::GateFailure { .. }
                | Self::ReviewBlocked { .. }
                | Self::MergeConflict { .. }
        )
    }

    /// Get error code for exit status
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Config { .. } | Self::InvalidConfig { .. } | Self::SelectionAnomaly { .. } => {
                EXIT_ERROR
            }
            Self::Toml(_) => EXIT_ERROR,
            _ => EXIT_INCOMPLETE,
        }
    }
}

/// Type alias for taskloop results
pub type Result<T> = std::result::Result<T, LoopError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = LoopError::GateFailure {
            gate: "cargo test".into(),
            code: Some(101),
        };
        assert!(err.to_string().contains("cargo test"));
        assert!(err.to_string().contains("101"));
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(LoopError::config("bad").exit_code(), EXIT_ERROR);
        assert_eq!(LoopError::invalid("agent.argv", "empty").exit_code(), EXIT_ERROR);
        assert_eq!(LoopError::selection("cycle").exit_code(), EXIT_ERROR);
        assert_eq!(
            LoopError::StateWrite {
                path: PathBuf::from("state.json"),
                message: "disk full".into()
            }
            .exit_code(),
            EXIT_INCOMPLETE
        );
    }

    #[test]
    fn test_attempt_scoped() {
        assert!(LoopError::AgentTimeout { secs: 5 }.is_attempt_scoped());
        assert!(LoopError::MergeConflict {
            branch: "b".into(),
            files: vec![]
        }
        .is_attempt_scoped());
        assert!(!LoopError::tracker("io").is_attempt_scoped());
    }

    #[test]
    fn test_config_with_path() {
        let path = PathBuf::from("/test/taskloop.toml");
        let err = LoopError::config_with_path("failed to parse", path.clone());
        if let LoopError::Config {
            message,
            path: opt_path,
        } = err
        {
            assert_eq!(message, "failed to parse");
            assert_eq!(opt_path, Some(path));
        } else {
            panic!("Wrong error variant");
        }
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "access denied");
        let err: LoopError = io_err.into();
        assert!(matches!(err, LoopError::Io(_)));
        assert!(err.to_string().contains("access denied"));
    }
}
