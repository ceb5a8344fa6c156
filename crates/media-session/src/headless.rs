//! Signalling-only media session for terminals and headless hosts.
//!
//! There is no audio device behind it. It validates inputs, tracks what a
//! real session would be doing and reports the local identity as speaking
//! while its microphone is open.

use crate::{AudioPlayback, MediaError, MediaResult, MediaSession};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeSet;
use tokio::sync::watch;
use tracing::{debug, info};

/// Snapshot of a headless connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeadlessConnection {
    pub server_url: String,
    pub publishing: bool,
    pub muted: bool,
}

pub struct HeadlessMediaSession {
    identity: String,
    connection: Mutex<Option<HeadlessConnection>>,
    speakers: watch::Sender<BTreeSet<String>>,
}

impl HeadlessMediaSession {
    pub fn new(identity: impl Into<String>) -> Self {
        let (speakers, _) = watch::channel(BTreeSet::new());
        Self {
            identity: identity.into(),
            connection: Mutex::new(None),
            speakers,
        }
    }

    pub fn connection(&self) -> Option<HeadlessConnection> {
        self.connection.lock().clone()
    }

    fn publish_speakers(&self) {
        let speaking = self
            .connection
            .lock()
            .as_ref()
            .map(|c| c.publishing && !c.muted)
            .unwrap_or(false);
        let identity = self.identity.clone();
        self.speakers.send_modify(|set| {
            set.clear();
            if speaking {
                set.insert(identity);
            }
        });
    }
}

#[async_trait]
impl MediaSession for HeadlessMediaSession {
    async fn connect(&self, server_url: &str, token: &str, publish_audio: bool) -> MediaResult<()> {
        if token.trim().is_empty() {
            return Err(MediaError::Connect("empty media token".to_string()));
        }
        if !(server_url.starts_with("wss://") || server_url.starts_with("ws://")) {
            return Err(MediaError::Connect(format!(
                "unsupported media server url: {server_url}"
            )));
        }

        let replaced = self.connection.lock().replace(HeadlessConnection {
            server_url: server_url.to_string(),
            publishing: publish_audio,
            // Publishers start muted until they open the mic.
            muted: publish_audio,
        });
        if replaced.is_some() {
            debug!("Replacing existing media connection");
        }
        info!(server_url, publish_audio, "Media session connected (headless)");
        self.publish_speakers();
        Ok(())
    }

    async fn leave(&self) -> MediaResult<()> {
        if self.connection.lock().take().is_some() {
            info!("Media session left (headless)");
        }
        self.publish_speakers();
        Ok(())
    }

    async fn set_mute(&self, muted: bool) -> MediaResult<()> {
        {
            let mut connection = self.connection.lock();
            let connection = connection.as_mut().ok_or(MediaError::NotConnected)?;
            connection.muted = muted;
        }
        debug!(muted, "Microphone mute changed (headless)");
        self.publish_speakers();
        Ok(())
    }

    async fn start_audio(&self) -> MediaResult<AudioPlayback> {
        if self.connection.lock().is_none() {
            return Err(MediaError::NotConnected);
        }
        Ok(AudioPlayback::Started)
    }

    fn active_speakers(&self) -> watch::Receiver<BTreeSet<String>> {
        self.speakers.subscribe()
    }
}
