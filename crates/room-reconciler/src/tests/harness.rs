//! Test harness for reconciler integration tests.
//!
//! Provides:
//! - EchoStore: a MemoryRoomStore that publishes a row event for every write
//! - RecordingMedia: a media session that records calls and can be gated
//! - ScriptedTokenIssuer: a token issuer that records requests and can fail
//! - FixtureFeed: the in-process feed plus scripted connection events
//! - Fixture: one shared store and feed, plus a client per user

use crate::notice::Notice;
use crate::reconciler::{Collaborators, RoomReconciler};
use async_trait::async_trait;
use chrono::Utc;
use media_session::{
    AudioPlayback, MediaError, MediaGrant, MediaResult, MediaSession, MediaTokenRequest,
    TokenIssuer,
};
use parking_lot::Mutex;
use room_config_and_utils::{AuthContext, SessionHandle};
use room_realtime::{
    ChangeEvent, ChangeFeed, ChangeFilter, LocalChangeFeed, RealtimeEvent, RealtimeResult,
    Subscription,
};
use room_store::{
    tables, MemoryRoomStore, NewParticipant, NewRoom, NewRoomMessage, Participant,
    ParticipantPatch, ParticipantRole, Reaction, ReactionKind, Room, RoomMessage, RoomPatch,
    RoomStore, StoreResult,
};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, oneshot, watch, Notify};

fn row(value: &impl Serialize) -> Value {
    serde_json::to_value(value).unwrap()
}

// =============================================================================
// EchoStore
// =============================================================================

/// Memory store whose writes come back as change events, like the backend.
pub struct EchoStore {
    memory: MemoryRoomStore,
    feed: LocalChangeFeed,
    echo: AtomicBool,
    /// Row to slip in just before the next participant insert.
    race_next_insert: Mutex<Option<Participant>>,
}

impl EchoStore {
    pub fn new(feed: LocalChangeFeed) -> Self {
        Self {
            memory: MemoryRoomStore::new(),
            feed,
            echo: AtomicBool::new(true),
            race_next_insert: Mutex::new(None),
        }
    }

    pub fn memory(&self) -> &MemoryRoomStore {
        &self.memory
    }

    /// Stop or resume publishing events for writes.
    pub fn set_echo(&self, on: bool) {
        self.echo.store(on, Ordering::SeqCst);
    }

    /// Simulate another session inserting the same participant first.
    pub fn race_next_insert(&self, participant: Participant) {
        *self.race_next_insert.lock() = Some(participant);
    }

    fn publish(&self, event: ChangeEvent) {
        if self.echo.load(Ordering::SeqCst) {
            self.feed.publish(event);
        }
    }
}

#[async_trait]
impl RoomStore for EchoStore {
    async fn list_active_rooms(&self, limit: usize) -> StoreResult<Vec<Room>> {
        self.memory.list_active_rooms(limit).await
    }

    async fn fetch_room(&self, room_id: &str) -> StoreResult<Option<Room>> {
        self.memory.fetch_room(room_id).await
    }

    async fn create_room(&self, room: &NewRoom) -> StoreResult<Room> {
        let created = self.memory.create_room(room).await?;
        self.publish(ChangeEvent::insert(tables::ROOMS, row(&created)));
        Ok(created)
    }

    async fn update_room(&self, room_id: &str, patch: &RoomPatch) -> StoreResult<Option<Room>> {
        let updated = self.memory.update_room(room_id, patch).await?;
        if let Some(room) = &updated {
            self.publish(ChangeEvent::update(tables::ROOMS, None, row(room)));
        }
        Ok(updated)
    }

    async fn delete_room(&self, room_id: &str) -> StoreResult<bool> {
        let participants = self.memory.participants(room_id);
        let deleted = self.memory.delete_room(room_id).await?;
        if deleted {
            for participant in participants {
                self.publish(ChangeEvent::delete(tables::PARTICIPANTS, row(&participant)));
            }
            self.publish(ChangeEvent::delete(
                tables::ROOMS,
                serde_json::json!({ "id": room_id }),
            ));
        }
        Ok(deleted)
    }

    async fn fetch_participant(
        &self,
        room_id: &str,
        user_id: &str,
    ) -> StoreResult<Option<Participant>> {
        self.memory.fetch_participant(room_id, user_id).await
    }

    async fn list_participants(&self, room_id: &str) -> StoreResult<Vec<Participant>> {
        self.memory.list_participants(room_id).await
    }

    async fn insert_participant(&self, participant: &NewParticipant) -> StoreResult<Participant> {
        if let Some(racer) = self.race_next_insert.lock().take() {
            self.memory.seed_participant(racer);
        }
        let inserted = self.memory.insert_participant(participant).await?;
        self.publish(ChangeEvent::insert(tables::PARTICIPANTS, row(&inserted)));
        Ok(inserted)
    }

    async fn update_participant(
        &self,
        room_id: &str,
        user_id: &str,
        patch: &ParticipantPatch,
    ) -> StoreResult<Option<Participant>> {
        let updated = self
            .memory
            .update_participant(room_id, user_id, patch)
            .await?;
        if let Some(participant) = &updated {
            self.publish(ChangeEvent::update(
                tables::PARTICIPANTS,
                None,
                row(participant),
            ));
        }
        Ok(updated)
    }

    async fn delete_participant(&self, room_id: &str, user_id: &str) -> StoreResult<bool> {
        let existing = self.memory.participant(room_id, user_id);
        let deleted = self.memory.delete_participant(room_id, user_id).await?;
        if let (true, Some(participant)) = (deleted, existing) {
            self.publish(ChangeEvent::delete(tables::PARTICIPANTS, row(&participant)));
        }
        Ok(deleted)
    }

    async fn delete_room_participants(&self, room_id: &str) -> StoreResult<usize> {
        let participants = self.memory.participants(room_id);
        let removed = self.memory.delete_room_participants(room_id).await?;
        for participant in participants {
            self.publish(ChangeEvent::delete(tables::PARTICIPANTS, row(&participant)));
        }
        Ok(removed)
    }

    async fn fetch_reaction(&self, room_id: &str, user_id: &str) -> StoreResult<Option<Reaction>> {
        self.memory.fetch_reaction(room_id, user_id).await
    }

    async fn list_reactions(&self, room_id: &str) -> StoreResult<Vec<Reaction>> {
        self.memory.list_reactions(room_id).await
    }

    async fn insert_reaction(&self, reaction: &Reaction) -> StoreResult<Reaction> {
        let inserted = self.memory.insert_reaction(reaction).await?;
        self.publish(ChangeEvent::insert(tables::REACTIONS, row(&inserted)));
        Ok(inserted)
    }

    async fn update_reaction(
        &self,
        room_id: &str,
        user_id: &str,
        kind: ReactionKind,
    ) -> StoreResult<Option<Reaction>> {
        let updated = self.memory.update_reaction(room_id, user_id, kind).await?;
        if let Some(reaction) = &updated {
            self.publish(ChangeEvent::update(tables::REACTIONS, None, row(reaction)));
        }
        Ok(updated)
    }

    async fn delete_reaction(&self, room_id: &str, user_id: &str) -> StoreResult<bool> {
        let existing = self
            .memory
            .reactions(room_id)
            .into_iter()
            .find(|r| r.user_id == user_id);
        let deleted = self.memory.delete_reaction(room_id, user_id).await?;
        if let (true, Some(reaction)) = (deleted, existing) {
            self.publish(ChangeEvent::delete(tables::REACTIONS, row(&reaction)));
        }
        Ok(deleted)
    }

    async fn list_messages(&self, room_id: &str, limit: usize) -> StoreResult<Vec<RoomMessage>> {
        self.memory.list_messages(room_id, limit).await
    }

    async fn insert_message(&self, message: &NewRoomMessage) -> StoreResult<RoomMessage> {
        let inserted = self.memory.insert_message(message).await?;
        self.publish(ChangeEvent::insert(tables::MESSAGES, row(&inserted)));
        Ok(inserted)
    }

    async fn soft_delete_message(&self, message_id: &str) -> StoreResult<Option<RoomMessage>> {
        let updated = self.memory.soft_delete_message(message_id).await?;
        if let Some(message) = &updated {
            self.publish(ChangeEvent::update(tables::MESSAGES, None, row(message)));
        }
        Ok(updated)
    }
}

// =============================================================================
// RecordingMedia
// =============================================================================

/// A call made on the media session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaCall {
    Connect { token: String, publish: bool },
    Leave,
    SetMute(bool),
    StartAudio,
}

/// Media session that records every call.
pub struct RecordingMedia {
    calls: Mutex<Vec<MediaCall>>,
    speakers: watch::Sender<BTreeSet<String>>,
    autoplay_blocked: AtomicBool,
    fail_connect: AtomicBool,
    gate: Mutex<Option<oneshot::Receiver<()>>>,
    /// Signalled when a connect call starts.
    pub connect_started: Notify,
}

impl RecordingMedia {
    pub fn new() -> Self {
        let (speakers, _) = watch::channel(BTreeSet::new());
        Self {
            calls: Mutex::new(Vec::new()),
            speakers,
            autoplay_blocked: AtomicBool::new(false),
            fail_connect: AtomicBool::new(false),
            gate: Mutex::new(None),
            connect_started: Notify::new(),
        }
    }

    pub fn calls(&self) -> Vec<MediaCall> {
        self.calls.lock().clone()
    }

    pub fn clear(&self) {
        self.calls.lock().clear();
    }

    /// Connect calls as (token, publish) pairs.
    pub fn connects(&self) -> Vec<(String, bool)> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                MediaCall::Connect { token, publish } => Some((token, publish)),
                _ => None,
            })
            .collect()
    }

    pub fn count(&self, wanted: &MediaCall) -> usize {
        self.calls.lock().iter().filter(|call| *call == wanted).count()
    }

    pub fn block_autoplay(&self, blocked: bool) {
        self.autoplay_blocked.store(blocked, Ordering::SeqCst);
    }

    pub fn fail_connect(&self, fail: bool) {
        self.fail_connect.store(fail, Ordering::SeqCst);
    }

    /// Hold the next connect until the returned sender fires or drops.
    pub fn gate_next_connect(&self) -> oneshot::Sender<()> {
        let (release, gate) = oneshot::channel();
        *self.gate.lock() = Some(gate);
        release
    }

    pub fn set_speaking(&self, speaking: &[&str]) {
        self.speakers
            .send_replace(speaking.iter().map(|s| s.to_string()).collect());
    }
}

#[async_trait]
impl MediaSession for RecordingMedia {
    async fn connect(
        &self,
        _server_url: &str,
        token: &str,
        publish_audio: bool,
    ) -> MediaResult<()> {
        self.calls.lock().push(MediaCall::Connect {
            token: token.to_string(),
            publish: publish_audio,
        });
        self.connect_started.notify_one();

        let gate = self.gate.lock().take();
        if let Some(gate) = gate {
            let _ = gate.await;
        }

        if self.fail_connect.load(Ordering::SeqCst) {
            return Err(MediaError::Connect("media server unreachable".to_string()));
        }
        Ok(())
    }

    async fn leave(&self) -> MediaResult<()> {
        self.calls.lock().push(MediaCall::Leave);
        Ok(())
    }

    async fn set_mute(&self, muted: bool) -> MediaResult<()> {
        self.calls.lock().push(MediaCall::SetMute(muted));
        Ok(())
    }

    async fn start_audio(&self) -> MediaResult<AudioPlayback> {
        self.calls.lock().push(MediaCall::StartAudio);
        if self.autoplay_blocked.load(Ordering::SeqCst) {
            Ok(AudioPlayback::BlockedByAutoplay)
        } else {
            Ok(AudioPlayback::Started)
        }
    }

    fn active_speakers(&self) -> watch::Receiver<BTreeSet<String>> {
        self.speakers.subscribe()
    }
}

// =============================================================================
// ScriptedTokenIssuer
// =============================================================================

/// Token issuer that records requests. Tokens name their scope.
pub struct ScriptedTokenIssuer {
    requests: Mutex<Vec<MediaTokenRequest>>,
    fail: AtomicBool,
}

impl ScriptedTokenIssuer {
    pub fn new() -> Self {
        Self {
            requests: Mutex::new(Vec::new()),
            fail: AtomicBool::new(false),
        }
    }

    pub fn requests(&self) -> Vec<MediaTokenRequest> {
        self.requests.lock().clone()
    }

    pub fn fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl TokenIssuer for ScriptedTokenIssuer {
    async fn issue(&self, request: &MediaTokenRequest) -> MediaResult<MediaGrant> {
        self.requests.lock().push(request.clone());
        if self.fail.load(Ordering::SeqCst) {
            return Err(MediaError::TokenRejected {
                status: 500,
                message: "token service unavailable".to_string(),
            });
        }
        let scope = if request.as_speaker { "speaker" } else { "listener" };
        Ok(MediaGrant {
            token: format!("{}:{}", request.room_id, scope),
            session_url: "wss://media.test".to_string(),
        })
    }
}

// =============================================================================
// FixtureFeed
// =============================================================================

/// In-process feed that also reports scripted connection events.
pub struct FixtureFeed {
    local: LocalChangeFeed,
    connection: broadcast::Sender<RealtimeEvent>,
}

#[async_trait]
impl ChangeFeed for FixtureFeed {
    async fn subscribe(&self, filter: ChangeFilter) -> RealtimeResult<Subscription> {
        self.local.subscribe(filter).await
    }

    fn events(&self) -> Option<broadcast::Receiver<RealtimeEvent>> {
        Some(self.connection.subscribe())
    }
}

// =============================================================================
// Fixture
// =============================================================================

/// One user's reconciler and its collaborators.
pub struct Client {
    pub user_id: String,
    pub reconciler: RoomReconciler,
    pub media: Arc<RecordingMedia>,
    pub tokens: Arc<ScriptedTokenIssuer>,
    notices: broadcast::Receiver<Notice>,
}

impl Client {
    /// Notices received since the last call.
    pub fn notices(&mut self) -> Vec<Notice> {
        let mut notices = Vec::new();
        while let Ok(notice) = self.notices.try_recv() {
            notices.push(notice);
        }
        notices
    }
}

/// Shared backend for several clients.
pub struct Fixture {
    pub store: Arc<EchoStore>,
    pub feed: LocalChangeFeed,
    changes: Arc<FixtureFeed>,
}

impl Fixture {
    pub fn new() -> Self {
        let feed = LocalChangeFeed::new();
        let (connection, _) = broadcast::channel(16);
        Self {
            store: Arc::new(EchoStore::new(feed.clone())),
            changes: Arc::new(FixtureFeed {
                local: feed.clone(),
                connection,
            }),
            feed,
        }
    }

    /// Report a connection event to every client's room pump.
    pub fn connection_event(&self, event: RealtimeEvent) {
        let _ = self.changes.connection.send(event);
    }

    pub fn memory(&self) -> &MemoryRoomStore {
        self.store.memory()
    }

    /// Seed an active room hosted by `host_id`.
    pub fn seed_room(&self, room_id: &str, host_id: &str, capacity: i32) -> Room {
        let room = Room {
            id: room_id.to_string(),
            title: format!("Room {room_id}"),
            description: None,
            topic: Some("testing".to_string()),
            host_id: host_id.to_string(),
            capacity,
            is_active: true,
            like_count: 0,
            dislike_count: 0,
            created_at: Utc::now(),
        };
        self.memory().seed_room(room.clone());
        room
    }

    pub fn seed_participant(&self, room_id: &str, user_id: &str, role: ParticipantRole) {
        self.memory().seed_participant(Participant {
            room_id: room_id.to_string(),
            user_id: user_id.to_string(),
            role,
            is_muted: !role.can_publish(),
            is_hand_raised: false,
            joined_at: Utc::now(),
        });
    }

    pub fn participant(&self, room_id: &str, user_id: &str) -> Option<Participant> {
        self.memory().participant(room_id, user_id)
    }

    /// A signed-in client for `user_id`.
    pub fn client(&self, user_id: &str) -> Client {
        let session = SessionHandle::signed_in(AuthContext::new(user_id, format!("jwt-{user_id}")));
        self.client_with_session(user_id, session)
    }

    pub fn client_with_session(&self, user_id: &str, session: SessionHandle) -> Client {
        let media = Arc::new(RecordingMedia::new());
        let tokens = Arc::new(ScriptedTokenIssuer::new());
        let reconciler = RoomReconciler::new(Collaborators {
            store: self.store.clone(),
            feed: self.changes.clone(),
            media: media.clone(),
            tokens: tokens.clone(),
            session,
        });
        let notices = reconciler.notices();
        Client {
            user_id: user_id.to_string(),
            reconciler,
            media,
            tokens,
            notices,
        }
    }
}

/// Poll `condition` until it holds, panicking after about two seconds.
pub async fn eventually(what: &str, mut condition: impl FnMut() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

/// Give room pumps time to drain pending events.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}
