//! Huginn error types

use std::time::Duration;

/// Huginn error types
#[derive(Debug, thiserror::Error)]
pub enum HuginnError {
    // Local data errors
    #[error("record not found in store '{store}': {id}")]
    NotFound { store: String, id: String },

    // Network errors
    #[error("network error: {0}")]
    Network(String),

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("server error ({status}): {body}")]
    Server { status: u16, body: String },

    // Dispatch errors
    /// A queued item's tag has no registered handler. Not retryable.
    #[error("no sync handler registered for tag '{0}'")]
    UnknownTag(String),

    #[error("unknown cache bucket: {0}")]
    UnknownBucket(String),

    #[error("unknown store: {0}")]
    UnknownStore(String),

    // Persistence errors
    #[error("storage error: {0}")]
    Storage(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("background task stopped")]
    Stopped,

    // Configuration errors
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl HuginnError {
    /// Whether the failure is worth retrying later.
    ///
    /// Network failures, timeouts, and server responses with status 408, 429
    /// or 5xx are transient. Everything else is permanent.
    pub fn is_transient(&self) -> bool {
        match self {
            HuginnError::Network(_) | HuginnError::Timeout(_) => true,
            HuginnError::Server { status, .. } => {
                matches!(*status, 408 | 429) || (500..600).contains(status)
            }
            _ => false,
        }
    }

    /// HTTP status carried by a server error, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            HuginnError::Server { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub(crate) fn not_found(store: impl Into<String>, id: impl Into<String>) -> Self {
        HuginnError::NotFound {
            store: store.into(),
            id: id.into(),
        }
    }
}

impl From<reqwest::Error> for HuginnError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            HuginnError::Network(format!("timeout: {err}"))
        } else {
            HuginnError::Network(err.to_string())
        }
    }
}

/// Result type alias for Huginn operations
pub type Result<T> = std::result::Result<T, HuginnError>;
