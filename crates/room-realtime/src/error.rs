//! Realtime error types.

use thiserror::Error;

/// Realtime error type.
#[derive(Error, Debug)]
pub enum RealtimeError {
    /// WebSocket error
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Invalid endpoint or setup
    #[error("Configuration error: {0}")]
    Config(String),

    /// The client task has stopped
    #[error("Realtime client is shut down")]
    Closed,

    /// The server refused to join a channel
    #[error("Channel {topic} rejected: {reason}")]
    ChannelRejected { topic: String, reason: String },

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Gave up reconnecting
    #[error("Realtime unavailable after {attempts} attempts")]
    Unavailable { attempts: u32 },
}

/// Result type alias using RealtimeError.
pub type RealtimeResult<T> = Result<T, RealtimeError>;
