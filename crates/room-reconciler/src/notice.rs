//! Transient user notices.

use std::fmt;

/// Something the user should be told about. Notices never carry state;
/// they are broadcast once and may be missed by late subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    /// Membership stands but audio is unavailable.
    DegradedAudio { room_id: String, reason: String },
    /// Playback is waiting for a user gesture.
    NeedsAudioStart { room_id: String },
    /// A user action failed and nothing changed.
    ActionFailed { action: &'static str, reason: String },
    /// The host removed us from the room.
    Removed { room_id: String },
    /// The room was deleted or closed while we were in it.
    RoomClosed { room_id: String },
    /// An ownership transfer failed part way and was rolled back.
    TransferIncomplete { room_id: String, reason: String },
    /// Live updates stopped; the views may go stale.
    RealtimeUnavailable { reason: String },
}

impl fmt::Display for Notice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Notice::DegradedAudio { reason, .. } => {
                write!(f, "joined without audio: {reason}")
            }
            Notice::NeedsAudioStart { .. } => {
                f.write_str("audio is paused until you start it (/audio)")
            }
            Notice::ActionFailed { action, reason } => write!(f, "{action} failed: {reason}"),
            Notice::Removed { .. } => f.write_str("you were removed from the room"),
            Notice::RoomClosed { .. } => f.write_str("the room has ended"),
            Notice::TransferIncomplete { reason, .. } => {
                write!(f, "ownership transfer did not complete: {reason}")
            }
            Notice::RealtimeUnavailable { reason } => {
                write!(f, "live updates unavailable: {reason}")
            }
        }
    }
}
