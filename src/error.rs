//! Custom error types for the repair loop.
//!
//! Errors internal to a single repair attempt never appear here: they are
//! captured as [`RepairOutcome`](crate::executor::RepairOutcome) values. This
//! enum covers the conditions that can stop the loop or the CLI.

use std::path::PathBuf;
use thiserror::Error;

use crate::ci::FetchError;

/// Main error type for repair loop operations
#[derive(Error, Debug)]
pub enum AutorepairError {
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
    // Status Source Errors
    // =========================================================================
    /// CI credentials rejected. Never retried.
    #[error("CI authentication failed: {message}")]
    Auth { message: String },

    /// Transient fetch failures outlasted the retry budget
    #[error("CI status unavailable after {attempts} attempts: {message}")]
    FetchExhausted { attempts: u32, message: String },

    /// Required external tool is not installed
    #[error("Missing required tool: {tool}")]
    MissingTool { tool: String },

    // =========================================================================
    // State Store Errors
    // =========================================================================
    /// State file could not be written or locked
    #[error("State store error: {message}")]
    Store { message: String },

    /// A second repair was requested for a run that already has one in flight
    #[error("Repair already in flight for run {run_id}")]
    RepairInFlight { run_id: String },

    // =========================================================================
    // Loop Errors
    // =========================================================================
    /// Coordinator attempted an illegal phase change
    #[error("Invalid loop transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

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

impl AutorepairError {
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

    /// Create a state store error
    pub fn store(message: impl Into<String>) -> Self {
        Self::Store {
            message: message.into(),
        }
    }

    /// Convert the final fetch failure into a loop-stopping error.
    pub fn from_fetch(error: FetchError, attempts: u32) -> Self {
        match error {
            FetchError::Auth { message } => Self::Auth { message },
            FetchError::Transient { message } => Self::FetchExhausted { attempts, message },
        }
    }

    /// Check if this error must abort the loop
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Auth { .. } | Self::FetchExhausted { .. } | Self::MissingTool { .. }
        )
    }

    /// Get error code for exit status
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Auth { .. } => 2,
            Self::FetchExhausted { .. } => 3,
            Self::Store { .. } | Self::RepairInFlight { .. } => 4,
            Self::InvalidTransition { .. } => 5,
            Self::MissingTool { .. } => 6,
            Self::Config { .. } | Self::InvalidConfig { .. } => 7,
            _ => 1,
        }
    }
}

/// Type alias for repair loop results
pub type Result<T> = std::result::Result<T, AutorepairError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = AutorepairError::FetchExhausted {
            attempts: 5,
            message: "connection reset".into(),
        };
        assert!(err.to_string().contains('5'));
        assert!(err.to_string().contains("connection reset"));
    }

    #[test]
    fn test_from_fetch_maps_auth_and_transient() {
        let auth = AutorepairError::from_fetch(
            FetchError::Auth {
                message: "Bad credentials".into(),
            },
            1,
        );
        assert!(matches!(auth, AutorepairError::Auth { .. }));

        let transient = AutorepairError::from_fetch(FetchError::transient("HTTP 502"), 5);
        match transient {
            AutorepairError::FetchExhausted { attempts, message } => {
                assert_eq!(attempts, 5);
                assert_eq!(message, "HTTP 502");
            }
            other => panic!("Wrong error variant: {other:?}"),
        }
    }

    #[test]
    fn test_is_fatal() {
        assert!(AutorepairError::Auth {
            message: "denied".into()
        }
        .is_fatal());
        assert!(AutorepairError::FetchExhausted {
            attempts: 3,
            message: "timeout".into()
        }
        .is_fatal());
        assert!(!AutorepairError::config("bad").is_fatal());
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(
            AutorepairError::Auth {
                message: "x".into()
            }
            .exit_code(),
            2
        );
        assert_eq!(
            AutorepairError::FetchExhausted {
                attempts: 1,
                message: "x".into()
            }
            .exit_code(),
            3
        );
        assert_eq!(AutorepairError::config("test").exit_code(), 7);
        assert_eq!(
            AutorepairError::Other(anyhow::anyhow!("boom")).exit_code(),
            1
        );
    }

    #[test]
    fn test_config_with_path() {
        let path = PathBuf::from("/test/settings.json");
        let err = AutorepairError::config_with_path("failed to parse", path.clone());
        if let AutorepairError::Config {
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
        let err: AutorepairError = io_err.into();
        assert!(matches!(err, AutorepairError::Io(_)));
        assert!(err.to_string().contains("access denied"));
    }
}
