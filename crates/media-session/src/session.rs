//! The media-session seam.

use crate::MediaResult;
use async_trait::async_trait;
use std::collections::BTreeSet;
use tokio::sync::watch;

/// Outcome of asking the session to start playback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioPlayback {
    Started,
    /// Playback needs a user gesture first.
    BlockedByAutoplay,
}

/// A connection to the audio server for one room.
///
/// `connect` on a live session replaces the existing connection.
#[async_trait]
pub trait MediaSession: Send + Sync {
    /// Connect with `token`, publishing the microphone when `publish_audio`.
    async fn connect(&self, server_url: &str, token: &str, publish_audio: bool) -> MediaResult<()>;

    /// Disconnect. Leaving an idle session succeeds.
    async fn leave(&self) -> MediaResult<()>;

    async fn set_mute(&self, muted: bool) -> MediaResult<()>;

    /// Resume playback after a user gesture.
    async fn start_audio(&self) -> MediaResult<AudioPlayback>;

    /// Identities currently speaking.
    fn active_speakers(&self) -> watch::Receiver<BTreeSet<String>>;
}
