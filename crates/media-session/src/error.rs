//! Media error types.

use thiserror::Error;

/// Errors from the media session or the token issuer.
#[derive(Debug, Error)]
pub enum MediaError {
    /// Network error talking to the token function
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The token function refused the request
    #[error("Token request rejected: {status} ({message})")]
    TokenRejected { status: u16, message: String },

    /// No signed-in session to authorize the token request
    #[error("Not signed in")]
    NotSignedIn,

    /// The media server could not be reached or refused the token
    #[error("Media connect failed: {0}")]
    Connect(String),

    /// An operation that needs a live connection found none
    #[error("Media session not connected")]
    NotConnected,

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid URL or client setup
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Result type alias using MediaError.
pub type MediaResult<T> = Result<T, MediaError>;
