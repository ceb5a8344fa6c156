use crate::notice::Notice;
use crate::state::LocalRoomState;

/// Log level used by pure handler effects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
}

/// Inputs used by the pure handler.
#[derive(Debug, Clone)]
pub struct HandlerDeps {
    pub local_user_id: String,
}

/// Side effects emitted by the pure handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// Fetch a fresh token with the given scope and reconnect media.
    ReconnectMedia { as_speaker: bool },
    DisconnectMedia,
    SetMediaMute(bool),
    /// Stop listening to the room and drop its cached view.
    ReleaseRoom,
    Notice(Notice),
    Log { level: LogLevel, message: String },
}

/// Result of feeding one change through the handler.
#[derive(Debug, Clone)]
pub struct Transition {
    pub next: Option<LocalRoomState>,
    pub effects: Vec<Effect>,
}

impl Transition {
    pub fn unchanged(current: Option<&LocalRoomState>) -> Self {
        Self {
            next: current.cloned(),
            effects: Vec::new(),
        }
    }
}
