//! Reconciler error types.

use media_session::MediaError;
use room_realtime::RealtimeError;
use room_store::StoreError;
use thiserror::Error;

/// Errors returned by [`crate::RoomReconciler`] operations.
#[derive(Debug, Error)]
pub enum ReconcilerError {
    #[error("Not signed in")]
    NotSignedIn,

    #[error("Not in a room")]
    NotJoined,

    #[error("Only the room host can do that")]
    NotHost,

    #[error("Room not found: {0}")]
    RoomNotFound(String),

    #[error("Room is closed: {0}")]
    RoomClosed(String),

    #[error("Room {room_id} is full ({capacity} participants)")]
    RoomFull { room_id: String, capacity: i32 },

    #[error("Invalid room: {0}")]
    InvalidRoom(String),

    #[error("Participant not found: {0}")]
    ParticipantNotFound(String),

    /// The target of a host action is not allowed (self, or the host).
    #[error("Invalid target: {0}")]
    InvalidTarget(String),

    #[error("Listeners cannot unmute")]
    ListenerCannotUnmute,

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Message not found: {0}")]
    MessageNotFound(String),

    #[error("Not permitted: {0}")]
    NotPermitted(String),

    /// A later join or leave replaced this operation while it was suspended.
    #[error("Operation superseded by a newer room selection")]
    Superseded,

    #[error("Ownership transfer for {room_id} did not complete: {reason}")]
    TransferIncomplete { room_id: String, reason: String },

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Realtime error: {0}")]
    Realtime(#[from] RealtimeError),

    #[error("Media error: {0}")]
    Media(#[from] MediaError),
}

impl ReconcilerError {
    /// True when retrying the same action by hand may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            ReconcilerError::Store(e) => e.is_transient(),
            ReconcilerError::Realtime(_) => true,
            ReconcilerError::TransferIncomplete { .. } => true,
            _ => false,
        }
    }
}

/// Result alias for reconciler operations.
pub type ReconcilerResult<T> = Result<T, ReconcilerError>;
