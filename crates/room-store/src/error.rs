//! Store error types.

use thiserror::Error;

/// Errors returned by [`crate::RoomStore`] implementations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Network or transport-level HTTP error.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The backend answered with a non-success status.
    #[error("Store error: {status} - {message}")]
    Backend {
        /// HTTP status code.
        status: u16,
        /// Hashed summary of the response body.
        message: String,
    },

    /// A uniqueness constraint rejected the write.
    #[error("Conflict on {table}: {message}")]
    Conflict { table: &'static str, message: String },

    /// The addressed row does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// No signed-in session to authorize the request.
    #[error("Not signed in")]
    NotSignedIn,

    /// JSON serialization or deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid URL or client setup.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl StoreError {
    /// True for failures worth retrying by hand: network trouble and 5xx.
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::Http(e) => {
                if e.is_connect() || e.is_timeout() {
                    return true;
                }
                e.status().map_or(false, |status| status.is_server_error())
            }
            StoreError::Backend { status, .. } => *status >= 500,
            _ => false,
        }
    }

    /// True when the row is simply gone.
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }
}

/// Result alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;
