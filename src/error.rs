//! Shardlock Error Types

use thiserror::Error;

use crate::election::{BaseId, Generation};

/// Result type alias for shardlock operations
pub type Result<T> = std::result::Result<T, Error>;

/// Shardlock error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    // Coordination errors
    #[error("Coordination service unavailable: {0}")]
    CoordinationUnavailable(String),

    #[error("Coordination session expired")]
    SessionExpired,

    #[error("Coordination session suspended")]
    SessionSuspended,

    #[error("Coordination node not found: {0}")]
    NodeNotFound(String),

    #[error("Operation not supported by this coordination backend: {0}")]
    Unsupported(String),

    // Election errors
    #[error("Election conflict on base {base} at generation {generation}: peers {peers:?}")]
    ElectionConflict {
        base: BaseId,
        generation: Generation,
        peers: Vec<String>,
    },

    #[error("Base not found: {0}")]
    BaseNotFound(BaseId),

    #[error("Base {base} is in FAILED state and requires administrative reset")]
    BaseFailed { base: BaseId },

    // Admin errors
    #[error("Admin operation failed on base {base}: {reason}")]
    AdminOpFailed { base: BaseId, reason: String },

    // Harness errors
    #[error(
        "Invariant violation on base {base} at generation {generation}: leaders {leaders:?}"
    )]
    InvariantViolation {
        base: BaseId,
        generation: Generation,
        leaders: Vec<String>,
    },

    // Serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Shutdown in progress")]
    ShuttingDown,
}

impl Error {
    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::CoordinationUnavailable(_) | Error::SessionSuspended
        )
    }
}
