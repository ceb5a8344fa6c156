//! The room membership reconciler.
//!
//! [`RoomReconciler`] owns the selected room: its local membership state,
//! the row subscriptions that keep the room view current and the media
//! session. User actions go to the store first; row events coming back
//! through the change feed drive local state through the pure handler.
//!
//! Every operation is a series of suspension points. Instead of
//! cancellation, each room selection gets a generation number and work
//! that resumes under an older generation is dropped.

use crate::changes::RoomChange;
use crate::error::{ReconcilerError, ReconcilerResult};
use crate::fsm::{join_input, transition, Membership, MembershipState};
use crate::handler::{
    after_reconnect, handle_change, pick_successor, plan_join_role, plan_reaction_toggle,
    ReactionPlan,
};
use crate::notice::Notice;
use crate::pending::{PendingChanges, Reconciliation, DEFAULT_PENDING_TTL};
use crate::ports::{Effect, HandlerDeps, LogLevel};
use crate::state::{AudioStatus, LocalRoomState, RoomDirectory, RoomView};
use futures_util::stream::{self, BoxStream, StreamExt};
use media_session::{AudioPlayback, MediaResult, MediaSession, MediaTokenRequest, TokenIssuer};
use parking_lot::Mutex;
use room_config_and_utils::SessionHandle;
use room_realtime::{ChangeEvent, ChangeFeed, ChangeFilter, RealtimeEvent, Subscription};
use room_store::{
    tables, NewParticipant, NewRoom, NewRoomMessage, Participant, ParticipantPatch,
    ParticipantRole, Reaction, ReactionCounts, ReactionKind, Room, RoomMessage, RoomPatch,
    RoomStore, StoreError, StoreResult,
};
use std::collections::BTreeSet;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Longest message accepted by [`RoomReconciler::send_message`], in characters.
pub const MAX_MESSAGE_CHARS: usize = 2000;

const NOTICE_CAPACITY: usize = 64;

/// Tunables for [`RoomReconciler`].
#[derive(Debug, Clone)]
pub struct ReconcilerOptions {
    /// How long an optimistic change waits for its echo.
    pub pending_ttl: Duration,
    /// Messages loaded when joining a room.
    pub message_history: usize,
    /// Rooms returned by [`RoomReconciler::list_rooms`].
    pub room_list_limit: usize,
}

impl Default for ReconcilerOptions {
    fn default() -> Self {
        Self {
            pending_ttl: DEFAULT_PENDING_TTL,
            message_history: 50,
            room_list_limit: 50,
        }
    }
}

/// Backend collaborators the reconciler drives.
#[derive(Clone)]
pub struct Collaborators {
    pub store: Arc<dyn RoomStore>,
    pub feed: Arc<dyn ChangeFeed>,
    pub media: Arc<dyn MediaSession>,
    pub tokens: Arc<dyn TokenIssuer>,
    pub session: SessionHandle,
}

/// Keeps the room pump alive. Dropping it stops the pump.
struct RoomPump {
    _shutdown: oneshot::Sender<()>,
    _task: JoinHandle<()>,
}

struct ReconcilerState {
    local: Option<LocalRoomState>,
    user_id: Option<String>,
    /// Room a join in flight is heading for.
    joining: Option<String>,
    /// Room whose deletion is in flight; its events only refresh the view.
    closing: Option<String>,
    directory: RoomDirectory,
    pending: PendingChanges,
    generation: u64,
    pump: Option<RoomPump>,
}

impl ReconcilerState {
    /// Drop the selected room and everything tied to it.
    fn release(&mut self) -> Option<(LocalRoomState, Option<RoomPump>)> {
        let local = self.local.take()?;
        self.generation += 1;
        self.closing = None;
        self.pending.clear_room(&local.room_id);
        self.directory.remove(&local.room_id);
        Some((local, self.pump.take()))
    }

    fn selected_room(&self, generation: u64) -> Option<&LocalRoomState> {
        self.local.as_ref().filter(|_| self.generation == generation)
    }

    fn selected_room_mut(&mut self, generation: u64) -> Option<&mut LocalRoomState> {
        if self.generation != generation {
            return None;
        }
        self.local.as_mut()
    }
}

struct Inner {
    store: Arc<dyn RoomStore>,
    feed: Arc<dyn ChangeFeed>,
    media: Arc<dyn MediaSession>,
    tokens: Arc<dyn TokenIssuer>,
    session: SessionHandle,
    options: ReconcilerOptions,
    state: Mutex<ReconcilerState>,
    /// Serializes connect and disconnect on the media session.
    media_lock: tokio::sync::Mutex<()>,
    notices: broadcast::Sender<Notice>,
}

/// The local room selection as seen by one operation.
struct Selected {
    local: LocalRoomState,
    user_id: String,
    generation: u64,
}

/// Room membership reconciler. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct RoomReconciler {
    inner: Arc<Inner>,
}

impl RoomReconciler {
    pub fn new(collaborators: Collaborators) -> Self {
        Self::with_options(collaborators, ReconcilerOptions::default())
    }

    pub fn with_options(collaborators: Collaborators, options: ReconcilerOptions) -> Self {
        let (notices, _) = broadcast::channel(NOTICE_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                store: collaborators.store,
                feed: collaborators.feed,
                media: collaborators.media,
                tokens: collaborators.tokens,
                session: collaborators.session,
                state: Mutex::new(ReconcilerState {
                    local: None,
                    user_id: None,
                    joining: None,
                    closing: None,
                    directory: RoomDirectory::new(),
                    pending: PendingChanges::new(options.pending_ttl),
                    generation: 0,
                    pump: None,
                }),
                options,
                media_lock: tokio::sync::Mutex::new(()),
                notices,
            }),
        }
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    /// Current local membership, if a room is selected.
    pub fn snapshot(&self) -> Option<LocalRoomState> {
        self.inner.state.lock().local.clone()
    }

    pub fn membership(&self) -> Membership {
        self.inner
            .state
            .lock()
            .local
            .as_ref()
            .map_or(Membership::NotJoined, LocalRoomState::membership)
    }

    /// Cached rows of the selected room.
    pub fn room_view(&self) -> Option<RoomView> {
        let state = self.inner.state.lock();
        let room_id = state.local.as_ref()?.room_id.clone();
        state.directory.view(&room_id).cloned()
    }

    /// Subscribe to transient notices.
    pub fn notices(&self) -> broadcast::Receiver<Notice> {
        self.inner.notices.subscribe()
    }

    pub fn user_id(&self) -> Option<String> {
        self.inner.session.user_id()
    }

    // ------------------------------------------------------------------
    // Rooms
    // ------------------------------------------------------------------

    /// Active rooms, newest first.
    pub async fn list_rooms(&self) -> ReconcilerResult<Vec<Room>> {
        self.inner
            .store
            .list_active_rooms(self.inner.options.room_list_limit)
            .await
            .map_err(|e| self.action_failed("list rooms", e))
    }

    /// Create a room hosted by the signed-in user. Does not join it.
    pub async fn create_room(
        &self,
        title: &str,
        description: Option<&str>,
        topic: Option<&str>,
        capacity: i32,
    ) -> ReconcilerResult<Room> {
        let user_id = self.signed_in_user()?;
        let title = title.trim();
        if title.is_empty() {
            return Err(ReconcilerError::InvalidRoom("title is empty".to_string()));
        }
        if capacity <= 0 {
            return Err(ReconcilerError::InvalidRoom(format!(
                "capacity must be positive, got {capacity}"
            )));
        }

        let room = self
            .inner
            .store
            .create_room(&NewRoom {
                title: title.to_string(),
                description: description.map(str::to_string),
                topic: topic.map(str::to_string),
                host_id: user_id,
                capacity,
                is_active: true,
            })
            .await
            .map_err(|e| self.action_failed("create room", e))?;
        info!(room_id = %room.id, title = %room.title, "Room created");
        Ok(room)
    }

    /// Delete the selected room and all its participants. Host only.
    pub async fn delete_room(&self) -> ReconcilerResult<()> {
        let selected = self.require_host().await?;
        let room_id = selected.local.room_id.clone();
        {
            let mut state = self.inner.state.lock();
            if state.generation != selected.generation {
                return Err(ReconcilerError::Superseded);
            }
            state.closing = Some(room_id.clone());
        }

        match self.purge_room(&room_id).await {
            Ok(deleted) => {
                info!(room_id = %room_id, deleted, "Room deleted");
                let released = {
                    let mut state = self.inner.state.lock();
                    if state.generation == selected.generation {
                        state.release()
                    } else {
                        None
                    }
                };
                drop(released);
                self.disconnect_media().await;
                Ok(())
            }
            Err(e) => {
                let mut state = self.inner.state.lock();
                if state.closing.as_deref() == Some(room_id.as_str()) {
                    state.closing = None;
                }
                drop(state);
                Err(self.action_failed("delete room", e))
            }
        }
    }

    /// Close the room, then delete its rows. Members see the room close
    /// before their own rows disappear.
    async fn purge_room(&self, room_id: &str) -> StoreResult<bool> {
        self.inner
            .store
            .update_room(room_id, &RoomPatch::deactivate())
            .await?;
        let removed = self.inner.store.delete_room_participants(room_id).await?;
        debug!(room_id, removed, "Removed room participants");
        self.inner.store.delete_room(room_id).await
    }

    // ------------------------------------------------------------------
    // Join / leave
    // ------------------------------------------------------------------

    /// Join `room_id`, leaving any other selected room first.
    ///
    /// Membership is established before media: token or connect failures
    /// leave the user joined with [`AudioStatus::Degraded`].
    pub async fn join(&self, room_id: &str) -> ReconcilerResult<LocalRoomState> {
        let user_id = self.signed_in_user()?;

        if let Some(local) = self.snapshot() {
            if local.room_id == room_id {
                return Ok(local);
            }
            if let Err(e) = self.leave().await {
                warn!(room_id = %local.room_id, error = %e, "Leaving previous room failed");
            }
        }

        let generation = self.begin_join(room_id);
        let result = self.join_selected(room_id, &user_id, generation).await;
        if result.is_err() {
            let mut state = self.inner.state.lock();
            if state.generation == generation {
                state.joining = None;
            }
        }
        result
    }

    async fn join_selected(
        &self,
        room_id: &str,
        user_id: &str,
        generation: u64,
    ) -> ReconcilerResult<LocalRoomState> {
        let store = &self.inner.store;

        let room = store
            .fetch_room(room_id)
            .await
            .map_err(|e| self.action_failed("join", e))?
            .ok_or_else(|| ReconcilerError::RoomNotFound(room_id.to_string()))?;
        if !room.is_active {
            return Err(ReconcilerError::RoomClosed(room_id.to_string()));
        }
        self.ensure_current(generation)?;

        let existing = store
            .fetch_participant(room_id, user_id)
            .await
            .map_err(|e| self.action_failed("join", e))?;
        self.ensure_current(generation)?;

        let (row, inserted) = match existing {
            Some(row) => {
                debug!(room_id, user_id, role = %row.role, "Reusing participant row");
                (row, false)
            }
            None => self.insert_membership(&room, user_id).await?,
        };

        if !self.is_current(generation) {
            self.abandon_membership(room_id, user_id, inserted).await;
            return Err(ReconcilerError::Superseded);
        }

        let publishing = row.role.can_publish();
        let membership = transition(&MembershipState::NotJoined, &join_input(publishing))
            .ok_or(ReconcilerError::NotJoined)?;
        let mut local = LocalRoomState::new(room_id, row.role, membership);
        // Listeners never publish, so they are always muted. Publishers
        // keep whatever their row says.
        local.is_muted = !publishing || row.is_muted;
        local.is_hand_raised = false;

        let mut view = self.load_view(room).await;
        view.upsert_participant(row.clone());
        let subscriptions = self.subscribe_room(room_id).await;

        let committed = {
            let mut state = self.inner.state.lock();
            if state.generation == generation {
                state.local = Some(local.clone());
                state.user_id = Some(user_id.to_string());
                state.joining = None;
                state.directory.insert(room_id, view);
                state.pump = Some(self.spawn_pump(room_id.to_string(), generation, subscriptions));
                true
            } else {
                false
            }
        };
        if !committed {
            self.abandon_membership(room_id, user_id, inserted).await;
            return Err(ReconcilerError::Superseded);
        }
        info!(room_id, user_id, role = %local.role, "Joined room");

        self.attach_media(room_id, generation).await;

        let state = self.inner.state.lock();
        state
            .selected_room(generation)
            .cloned()
            .ok_or(ReconcilerError::Superseded)
    }

    /// Insert the participant row for a first join.
    async fn insert_membership(
        &self,
        room: &Room,
        user_id: &str,
    ) -> ReconcilerResult<(Participant, bool)> {
        let store = &self.inner.store;

        if room.capacity > 0 {
            let present = store
                .list_participants(&room.id)
                .await
                .map_err(|e| self.action_failed("join", e))?
                .len();
            if present >= room.capacity as usize {
                return Err(ReconcilerError::RoomFull {
                    room_id: room.id.clone(),
                    capacity: room.capacity,
                });
            }
        }

        let role = plan_join_role(room, None, user_id);
        match store
            .insert_participant(&NewParticipant::new(&room.id, user_id, role))
            .await
        {
            Ok(row) => Ok((row, true)),
            Err(StoreError::Conflict { .. }) => {
                debug!(
                    room_id = %room.id,
                    user_id,
                    "Participant inserted concurrently, reusing it"
                );
                let row = store
                    .fetch_participant(&room.id, user_id)
                    .await
                    .map_err(|e| self.action_failed("join", e))?
                    .ok_or_else(|| ReconcilerError::ParticipantNotFound(user_id.to_string()))?;
                Ok((row, false))
            }
            Err(e) => Err(self.action_failed("join", e)),
        }
    }

    /// Undo the row a superseded join inserted, unless a newer selection
    /// wants the same room.
    async fn abandon_membership(&self, room_id: &str, user_id: &str, inserted: bool) {
        if !inserted || self.room_still_wanted(room_id) {
            return;
        }
        debug!(room_id, user_id, "Join superseded, removing its participant row");
        if let Err(e) = self.inner.store.delete_participant(room_id, user_id).await {
            warn!(room_id, user_id, error = %e, "Failed to remove superseded participant row");
        }
    }

    async fn load_view(&self, room: Room) -> RoomView {
        let store = &self.inner.store;
        let room_id = room.id.clone();

        let participants = store.list_participants(&room_id).await.unwrap_or_else(|e| {
            warn!(room_id = %room_id, error = %e, "Failed to load participants");
            Vec::new()
        });
        let reactions = store.list_reactions(&room_id).await.unwrap_or_else(|e| {
            warn!(room_id = %room_id, error = %e, "Failed to load reactions");
            Vec::new()
        });
        let messages = store
            .list_messages(&room_id, self.inner.options.message_history)
            .await
            .unwrap_or_else(|e| {
                warn!(room_id = %room_id, error = %e, "Failed to load messages");
                Vec::new()
            });

        RoomView {
            room: Some(room),
            participants,
            reactions,
            messages,
        }
    }

    async fn subscribe_room(&self, room_id: &str) -> Vec<Subscription> {
        let filters = [
            ChangeFilter::table(tables::PARTICIPANTS).eq("room_id", room_id),
            ChangeFilter::table(tables::ROOMS).eq("id", room_id),
            ChangeFilter::table(tables::REACTIONS).eq("room_id", room_id),
            ChangeFilter::table(tables::MESSAGES).eq("room_id", room_id),
        ];

        let mut subscriptions = Vec::with_capacity(filters.len());
        let mut failure = None;
        for filter in filters {
            let label = filter.label();
            match self.inner.feed.subscribe(filter).await {
                Ok(subscription) => subscriptions.push(subscription),
                Err(e) => {
                    warn!(room_id, filter = %label, error = %e, "Subscription failed");
                    failure = Some(e.to_string());
                }
            }
        }
        if let Some(reason) = failure {
            self.notify(Notice::RealtimeUnavailable { reason });
        }
        subscriptions
    }

    /// Leave the selected room. A no-op when no room is selected.
    ///
    /// Local state is cleared first and stays cleared even when deleting
    /// the participant row fails. A row that is already gone counts as
    /// success.
    pub async fn leave(&self) -> ReconcilerResult<()> {
        let released = {
            let mut state = self.inner.state.lock();
            let user_id = state.user_id.clone();
            match state.release() {
                Some((local, pump)) => Some((local, user_id, pump)),
                None => {
                    if state.joining.take().is_some() {
                        // Supersede the join in flight.
                        state.generation += 1;
                    }
                    None
                }
            }
        };
        let Some((local, user_id, pump)) = released else {
            debug!("Leave with no selected room");
            return Ok(());
        };
        drop(pump);

        let room_id = local.room_id.as_str();
        let mut result = Ok(());
        if let Some(user_id) = user_id {
            if local.is_host() {
                self.hand_off(room_id, &user_id).await;
            }
            match self.inner.store.delete_participant(room_id, &user_id).await {
                Ok(true) => info!(room_id, user_id = %user_id, "Left room"),
                Ok(false) => debug!(room_id, user_id = %user_id, "Participant row already gone"),
                Err(e) if e.is_not_found() => {
                    debug!(room_id, user_id = %user_id, "Room already gone")
                }
                Err(e) => result = Err(self.action_failed("leave", e)),
            }
        }

        self.disconnect_media().await;
        result
    }

    /// Tear down the selected room. Same as [`RoomReconciler::leave`].
    pub async fn close(&self) -> ReconcilerResult<()> {
        self.leave().await
    }

    /// Pass the room to the next participant, or close it when nobody is left.
    async fn hand_off(&self, room_id: &str, leaving: &str) {
        let store = &self.inner.store;
        let participants = match store.list_participants(room_id).await {
            Ok(participants) => participants,
            Err(e) => {
                self.action_failed("hand off room", e);
                return;
            }
        };

        let result = match pick_successor(&participants, leaving) {
            Some(successor) => {
                info!(room_id, successor = %successor.user_id, "Handing room to next participant");
                match store
                    .update_room(room_id, &RoomPatch::host(&successor.user_id))
                    .await
                {
                    Ok(Some(_)) => store
                        .update_participant(
                            room_id,
                            &successor.user_id,
                            &ParticipantPatch::role(ParticipantRole::Host),
                        )
                        .await
                        .map(|_| ()),
                    Ok(None) => {
                        debug!(room_id, "Room already gone, nothing to hand off");
                        Ok(())
                    }
                    Err(e) => Err(e),
                }
            }
            None => {
                info!(room_id, "No one left to host, closing room");
                store
                    .update_room(room_id, &RoomPatch::deactivate())
                    .await
                    .map(|_| ())
            }
        };

        if let Err(e) = result {
            self.action_failed("hand off room", e);
        }
    }

    // ------------------------------------------------------------------
    // Host-only mutations
    // ------------------------------------------------------------------

    /// Make a listener a speaker: unmuted, hand lowered.
    pub async fn promote(&self, user_id: &str) -> ReconcilerResult<Participant> {
        let selected = self.require_host().await?;
        let room_id = selected.local.room_id.as_str();
        let target = self.host_target("promote", &selected, user_id).await?;
        if target.role == ParticipantRole::Host {
            return Err(ReconcilerError::InvalidTarget(format!("{user_id} is the host")));
        }
        info!(room_id, user_id, "Promoting participant");
        self.patch_participant("promote", room_id, user_id, &ParticipantPatch::promote())
            .await
    }

    /// Make a speaker a listener: muted.
    pub async fn demote(&self, user_id: &str) -> ReconcilerResult<Participant> {
        let selected = self.require_host().await?;
        let room_id = selected.local.room_id.as_str();
        let target = self.host_target("demote", &selected, user_id).await?;
        if target.role == ParticipantRole::Host {
            return Err(ReconcilerError::InvalidTarget(format!("{user_id} is the host")));
        }
        info!(room_id, user_id, "Demoting participant");
        self.patch_participant("demote", room_id, user_id, &ParticipantPatch::demote())
            .await
    }

    pub async fn mute_participant(&self, user_id: &str) -> ReconcilerResult<Participant> {
        let selected = self.require_host().await?;
        let room_id = selected.local.room_id.as_str();
        self.host_target("mute", &selected, user_id).await?;
        info!(room_id, user_id, "Muting participant");
        self.patch_participant("mute", room_id, user_id, &ParticipantPatch::muted(true))
            .await
    }

    /// Remove a participant from the room. Returns false when the row was
    /// already gone.
    pub async fn remove_participant(&self, user_id: &str) -> ReconcilerResult<bool> {
        let selected = self.require_host().await?;
        let room_id = selected.local.room_id.as_str();
        if user_id == selected.user_id {
            return Err(ReconcilerError::InvalidTarget(
                "use leave to exit the room".to_string(),
            ));
        }
        info!(room_id, user_id, "Removing participant");
        let removed = self
            .inner
            .store
            .delete_participant(room_id, user_id)
            .await
            .map_err(|e| self.action_failed("remove", e))?;
        if removed {
            self.remember(&RoomChange::ParticipantDeleted {
                room_id: room_id.to_string(),
                user_id: user_id.to_string(),
            });
        } else {
            debug!(room_id, user_id, "Participant already gone");
        }
        Ok(removed)
    }

    /// Hand the room to `user_id`: room host, their role host, ours speaker.
    ///
    /// The three writes form one unit. When one fails the completed ones
    /// are reverted, the room is re-read, and
    /// [`ReconcilerError::TransferIncomplete`] is returned.
    pub async fn transfer_ownership(&self, user_id: &str) -> ReconcilerResult<()> {
        let selected = self.require_host().await?;
        let room_id = selected.local.room_id.as_str();
        let me = selected.user_id.as_str();
        let target = self.host_target("transfer", &selected, user_id).await?;
        let store = &self.inner.store;

        info!(room_id, from = me, to = user_id, "Transferring ownership");

        let step = store
            .update_room(room_id, &RoomPatch::host(user_id))
            .await
            .and_then(|room| room.ok_or_else(|| StoreError::NotFound(room_id.to_string())));
        if let Err(e) = step {
            return Err(self.transfer_failed(&selected, e.to_string(), &[]).await);
        }

        let step = store
            .update_participant(room_id, user_id, &ParticipantPatch::role(ParticipantRole::Host))
            .await
            .and_then(|row| row.ok_or_else(|| StoreError::NotFound(user_id.to_string())));
        let target_row = match step {
            Ok(row) => row,
            Err(e) => {
                let undo = [TransferUndo::RoomHost];
                return Err(self.transfer_failed(&selected, e.to_string(), &undo).await);
            }
        };

        let step = store
            .update_participant(room_id, me, &ParticipantPatch::role(ParticipantRole::Speaker))
            .await
            .and_then(|row| row.ok_or_else(|| StoreError::NotFound(me.to_string())));
        let my_row = match step {
            Ok(row) => row,
            Err(e) => {
                let undo = [
                    TransferUndo::TargetRole(user_id.to_string(), target.role),
                    TransferUndo::RoomHost,
                ];
                return Err(self.transfer_failed(&selected, e.to_string(), &undo).await);
            }
        };

        let mut state = self.inner.state.lock();
        state
            .directory
            .apply(&RoomChange::ParticipantUpserted(target_row));
        state.directory.apply(&RoomChange::ParticipantUpserted(my_row));
        if let Some(view) = state.directory.view(room_id).cloned() {
            if let Some(mut room) = view.room {
                room.host_id = user_id.to_string();
                state.directory.apply(&RoomChange::RoomUpdated(room));
            }
        }
        if let Some(local) = state.selected_room_mut(selected.generation) {
            local.role = ParticipantRole::Speaker;
        }
        Ok(())
    }

    async fn transfer_failed(
        &self,
        selected: &Selected,
        reason: String,
        undo: &[TransferUndo],
    ) -> ReconcilerError {
        let room_id = selected.local.room_id.as_str();
        let store = &self.inner.store;
        warn!(room_id, reason = %reason, "Ownership transfer failed, compensating");

        for step in undo {
            let result = match step {
                TransferUndo::RoomHost => store
                    .update_room(room_id, &RoomPatch::host(&selected.user_id))
                    .await
                    .map(|_| ()),
                TransferUndo::TargetRole(user_id, role) => store
                    .update_participant(room_id, user_id, &ParticipantPatch::role(*role))
                    .await
                    .map(|_| ()),
            };
            if let Err(e) = result {
                warn!(room_id, ?step, error = %e, "Compensation step failed");
            }
        }

        self.refresh_room(room_id, selected.generation).await;

        self.notify(Notice::TransferIncomplete {
            room_id: room_id.to_string(),
            reason: reason.clone(),
        });
        ReconcilerError::TransferIncomplete {
            room_id: room_id.to_string(),
            reason,
        }
    }

    /// Re-read the room and its participants into the directory.
    async fn refresh_room(&self, room_id: &str, generation: u64) {
        let store = &self.inner.store;
        let room = store.fetch_room(room_id).await;
        let participants = store.list_participants(room_id).await;

        let mut state = self.inner.state.lock();
        if state.generation != generation {
            return;
        }
        let view = state.directory.view_mut(room_id);
        match room {
            Ok(room) => view.room = room,
            Err(e) => warn!(room_id, error = %e, "Failed to re-read room"),
        }
        match participants {
            Ok(participants) => view.participants = participants,
            Err(e) => warn!(room_id, error = %e, "Failed to re-read participants"),
        }
    }

    /// Check that the acting user hosts the selected room.
    async fn require_host(&self) -> ReconcilerResult<Selected> {
        let selected = self.selected()?;
        let room_id = selected.local.room_id.as_str();
        let cached = {
            let state = self.inner.state.lock();
            state
                .directory
                .view(room_id)
                .and_then(|view| view.host_id().map(str::to_string))
        };
        let host_id = match cached {
            Some(host_id) => host_id,
            None => self
                .inner
                .store
                .fetch_room(room_id)
                .await
                .map_err(|e| self.action_failed("host check", e))?
                .map(|room| room.host_id)
                .ok_or_else(|| ReconcilerError::RoomNotFound(room_id.to_string()))?,
        };
        if host_id != selected.user_id {
            return Err(ReconcilerError::NotHost);
        }
        Ok(selected)
    }

    /// Look up the participant a host action targets. The host cannot target
    /// themselves.
    async fn host_target(
        &self,
        action: &'static str,
        selected: &Selected,
        user_id: &str,
    ) -> ReconcilerResult<Participant> {
        if user_id == selected.user_id {
            return Err(ReconcilerError::InvalidTarget(format!(
                "cannot {action} yourself"
            )));
        }
        self.inner
            .store
            .fetch_participant(&selected.local.room_id, user_id)
            .await
            .map_err(|e| self.action_failed(action, e))?
            .ok_or_else(|| ReconcilerError::ParticipantNotFound(user_id.to_string()))
    }

    async fn patch_participant(
        &self,
        action: &'static str,
        room_id: &str,
        user_id: &str,
        patch: &ParticipantPatch,
    ) -> ReconcilerResult<Participant> {
        let row = self
            .inner
            .store
            .update_participant(room_id, user_id, patch)
            .await
            .map_err(|e| self.action_failed(action, e))?
            .ok_or_else(|| ReconcilerError::ParticipantNotFound(user_id.to_string()))?;
        self.remember(&RoomChange::ParticipantUpserted(row.clone()));
        Ok(row)
    }

    // ------------------------------------------------------------------
    // Self actions
    // ------------------------------------------------------------------

    /// Mute or unmute ourselves. Listeners cannot unmute.
    pub async fn set_self_mute(&self, muted: bool) -> ReconcilerResult<()> {
        let selected = self.selected()?;
        let publishing = selected.local.role.can_publish();
        if !muted && !publishing {
            return Err(ReconcilerError::ListenerCannotUnmute);
        }
        if selected.local.is_muted == muted {
            return Ok(());
        }

        let patch = ParticipantPatch::muted(muted);
        self.apply_optimistic(&selected, &patch);
        if publishing {
            self.set_media_mute(muted).await;
        }

        let action = if muted { "mute" } else { "unmute" };
        if let Err(e) = self.write_own_row(action, &selected, &patch).await {
            if publishing {
                self.set_media_mute(selected.local.is_muted).await;
            }
            return Err(e);
        }
        Ok(())
    }

    /// Raise or lower our hand. Returns whether the hand is now raised.
    pub async fn toggle_hand_raise(&self) -> ReconcilerResult<bool> {
        let selected = self.selected()?;
        let raised = !selected.local.is_hand_raised;
        let patch = ParticipantPatch::hand_raised(raised);

        self.apply_optimistic(&selected, &patch);
        let action = if raised { "raise hand" } else { "lower hand" };
        self.write_own_row(action, &selected, &patch).await?;
        Ok(raised)
    }

    fn apply_optimistic(&self, selected: &Selected, patch: &ParticipantPatch) {
        let mut state = self.inner.state.lock();
        let Some(local) = state.selected_room_mut(selected.generation) else {
            return;
        };
        if let Some(muted) = patch.is_muted {
            local.is_muted = muted;
        }
        if let Some(raised) = patch.is_hand_raised {
            local.is_hand_raised = raised;
        }
        state.pending.record(
            &selected.local.room_id,
            &selected.user_id,
            patch,
            Instant::now(),
        );
    }

    /// Write our own row; on failure restore the local fields `selected`
    /// captured and drop the pending entry.
    async fn write_own_row(
        &self,
        action: &'static str,
        selected: &Selected,
        patch: &ParticipantPatch,
    ) -> ReconcilerResult<()> {
        let room_id = selected.local.room_id.as_str();
        let user_id = selected.user_id.as_str();
        let error = match self
            .inner
            .store
            .update_participant(room_id, user_id, patch)
            .await
        {
            Ok(Some(row)) => {
                self.remember(&RoomChange::ParticipantUpserted(row));
                return Ok(());
            }
            Ok(None) => ReconcilerError::ParticipantNotFound(user_id.to_string()),
            Err(e) => ReconcilerError::from(e),
        };

        {
            let mut state = self.inner.state.lock();
            state.pending.forget(room_id, user_id);
            if let Some(local) = state.selected_room_mut(selected.generation) {
                local.is_muted = selected.local.is_muted;
                local.is_hand_raised = selected.local.is_hand_raised;
            }
        }
        Err(self.action_failed(action, error))
    }

    /// Resume playback after a user gesture.
    pub async fn start_audio(&self) -> ReconcilerResult<AudioPlayback> {
        let selected = self.selected()?;
        let playback = self.inner.media.start_audio().await?;
        if playback == AudioPlayback::Started {
            let mut state = self.inner.state.lock();
            if let Some(local) = state.selected_room_mut(selected.generation) {
                local.needs_audio_start = false;
            }
        }
        Ok(playback)
    }

    // ------------------------------------------------------------------
    // Reactions and messages
    // ------------------------------------------------------------------

    /// Toggle our reaction on `room_id`. Returns the reaction now held.
    pub async fn toggle_reaction(
        &self,
        room_id: &str,
        kind: ReactionKind,
    ) -> ReconcilerResult<Option<ReactionKind>> {
        let user_id = self.signed_in_user()?;
        let store = &self.inner.store;

        let current = store
            .fetch_reaction(room_id, &user_id)
            .await
            .map_err(|e| self.action_failed("react", e))?
            .map(|reaction| reaction.reaction_type);
        let plan = plan_reaction_toggle(current, kind);
        debug!(room_id, user_id = %user_id, ?current, ?plan, "Toggling reaction");

        let reaction = Reaction {
            room_id: room_id.to_string(),
            user_id: user_id.clone(),
            reaction_type: kind,
        };
        let result = match plan {
            ReactionPlan::Insert(_) => match store.insert_reaction(&reaction).await {
                Ok(_) => Ok(()),
                Err(StoreError::Conflict { .. }) => store
                    .update_reaction(room_id, &user_id, kind)
                    .await
                    .map(|_| ()),
                Err(e) => Err(e),
            },
            ReactionPlan::Update(kind) => {
                match store.update_reaction(room_id, &user_id, kind).await {
                    Ok(Some(_)) => Ok(()),
                    // Removed concurrently; insert instead.
                    Ok(None) => store.insert_reaction(&reaction).await.map(|_| ()),
                    Err(e) => Err(e),
                }
            }
            ReactionPlan::Delete => store.delete_reaction(room_id, &user_id).await.map(|_| ()),
        };
        result.map_err(|e| self.action_failed("react", e))?;

        self.refresh_counts(room_id).await;
        Ok(plan.outcome())
    }

    /// Recompute the room's like/dislike counters from its reaction rows.
    async fn refresh_counts(&self, room_id: &str) {
        let store = &self.inner.store;
        let reactions = match store.list_reactions(room_id).await {
            Ok(reactions) => reactions,
            Err(e) => {
                warn!(room_id, error = %e, "Failed to read reactions for counters");
                return;
            }
        };
        let counts = ReactionCounts::tally(&reactions);
        if let Err(e) = store.update_room(room_id, &RoomPatch::counts(counts)).await {
            warn!(room_id, error = %e, "Failed to update reaction counters");
        }
    }

    pub async fn send_message(&self, content: &str) -> ReconcilerResult<RoomMessage> {
        let selected = self.selected()?;
        let content = content.trim();
        if content.is_empty() {
            return Err(ReconcilerError::InvalidMessage("message is empty".to_string()));
        }
        if content.chars().count() > MAX_MESSAGE_CHARS {
            return Err(ReconcilerError::InvalidMessage(format!(
                "message is longer than {MAX_MESSAGE_CHARS} characters"
            )));
        }

        let message = self
            .inner
            .store
            .insert_message(&NewRoomMessage {
                room_id: selected.local.room_id.clone(),
                user_id: selected.user_id.clone(),
                content: content.to_string(),
            })
            .await
            .map_err(|e| self.action_failed("send message", e))?;
        self.remember(&RoomChange::MessageUpserted(message.clone()));
        Ok(message)
    }

    /// Soft-delete a message. Allowed for its author and the room host.
    pub async fn delete_message(&self, message_id: &str) -> ReconcilerResult<RoomMessage> {
        let selected = self.selected()?;
        let (author, host_id) = {
            let state = self.inner.state.lock();
            let view = state.directory.view(&selected.local.room_id);
            (
                view.and_then(|view| view.message(message_id))
                    .map(|message| message.user_id.clone()),
                view.and_then(|view| view.host_id().map(str::to_string)),
            )
        };
        let author =
            author.ok_or_else(|| ReconcilerError::MessageNotFound(message_id.to_string()))?;
        if author != selected.user_id && host_id.as_deref() != Some(selected.user_id.as_str()) {
            return Err(ReconcilerError::NotPermitted(
                "only the author or the host can delete a message".to_string(),
            ));
        }

        let message = self
            .inner
            .store
            .soft_delete_message(message_id)
            .await
            .map_err(|e| self.action_failed("delete message", e))?
            .ok_or_else(|| ReconcilerError::MessageNotFound(message_id.to_string()))?;
        self.remember(&RoomChange::MessageUpserted(message.clone()));
        Ok(message)
    }

    // ------------------------------------------------------------------
    // Change events
    // ------------------------------------------------------------------

    async fn on_change_event(&self, room_id: &str, generation: u64, event: ChangeEvent) {
        let Some(change) = RoomChange::decode(&event, room_id) else {
            debug!(room_id, table = %event.table, "Ignoring change event");
            return;
        };

        let (transition, released) = {
            let mut state = self.inner.state.lock();
            if state.generation != generation {
                return;
            }
            state.directory.apply(&change);
            if state.closing.as_deref() == Some(room_id) {
                return;
            }
            let Some(user_id) = state.user_id.clone() else {
                return;
            };

            let now = Instant::now();
            let stale = match &change {
                RoomChange::ParticipantUpserted(row) if row.user_id == user_id => {
                    state.pending.reconcile(row, now) == Reconciliation::Stale
                }
                _ => false,
            };
            let deps = HandlerDeps {
                local_user_id: user_id,
            };
            let transition = handle_change(state.local.as_ref(), &change, stale, &deps);
            let released = if transition.effects.contains(&Effect::ReleaseRoom) {
                state.release()
            } else {
                state.local = transition.next.clone();
                None
            };
            (transition, released)
        };
        // Drops this pump's own handle when the room was released; the pump
        // stops at its next turn.
        drop(released);

        for effect in transition.effects {
            self.run_effect(room_id, generation, effect).await;
        }
    }

    async fn run_effect(&self, room_id: &str, generation: u64, effect: Effect) {
        match effect {
            Effect::ReconnectMedia { as_speaker } => {
                self.reconnect_media(room_id, generation, as_speaker).await
            }
            Effect::DisconnectMedia => self.disconnect_media().await,
            Effect::SetMediaMute(muted) => self.set_media_mute(muted).await,
            Effect::ReleaseRoom => debug!(room_id, "Released room"),
            Effect::Notice(notice) => self.notify(notice),
            Effect::Log { level, message } => match level {
                LogLevel::Debug => debug!(room_id, "{message}"),
                LogLevel::Info => info!(room_id, "{message}"),
                LogLevel::Warn => warn!(room_id, "{message}"),
            },
        }
    }

    fn set_speaking(&self, room_id: &str, generation: u64, speaking: BTreeSet<String>) {
        let mut state = self.inner.state.lock();
        if let Some(local) = state
            .selected_room_mut(generation)
            .filter(|local| local.room_id == room_id)
        {
            local.speaking = speaking;
        }
    }

    /// Apply one of our own writes to the directory ahead of its echo.
    fn remember(&self, change: &RoomChange) {
        self.inner.state.lock().directory.apply(change);
    }

    // ------------------------------------------------------------------
    // Media
    // ------------------------------------------------------------------

    /// First media connection after a join.
    async fn attach_media(&self, room_id: &str, generation: u64) {
        let _media = self.inner.media_lock.lock().await;
        let scope = {
            let state = self.inner.state.lock();
            state
                .selected_room(generation)
                .map(|local| (local.role.can_publish(), local.is_muted))
        };
        let Some((as_speaker, muted)) = scope else {
            return;
        };
        let outcome = self.connect_media(room_id, as_speaker, muted).await;
        self.finish_media(room_id, generation, as_speaker, outcome)
            .await;
    }

    /// Reconnect after a publish-capability flip. Skipped when a newer flip
    /// changed the wanted scope; that flip brings its own reconnect.
    async fn reconnect_media(&self, room_id: &str, generation: u64, as_speaker: bool) {
        let _media = self.inner.media_lock.lock().await;
        let muted = {
            let state = self.inner.state.lock();
            match state.selected_room(generation) {
                Some(local)
                    if local.membership == MembershipState::Reconnecting
                        && local.role.can_publish() == as_speaker =>
                {
                    Some(local.is_muted)
                }
                _ => None,
            }
        };
        let Some(muted) = muted else {
            debug!(room_id, as_speaker, "Media reconnect superseded");
            return;
        };

        info!(room_id, as_speaker, "Reconnecting media session");
        let outcome = self.connect_media(room_id, as_speaker, muted).await;
        self.finish_media(room_id, generation, as_speaker, outcome)
            .await;
    }

    async fn connect_media(
        &self,
        room_id: &str,
        as_speaker: bool,
        muted: bool,
    ) -> MediaResult<AudioPlayback> {
        let request = MediaTokenRequest {
            room_id: room_id.to_string(),
            as_speaker,
        };
        let grant = self.inner.tokens.issue(&request).await?;
        self.inner
            .media
            .connect(&grant.session_url, &grant.token, as_speaker)
            .await?;
        if as_speaker {
            self.inner.media.set_mute(muted).await?;
        }
        self.inner.media.start_audio().await
    }

    /// Record a connect outcome. Called with the media lock held.
    async fn finish_media(
        &self,
        room_id: &str,
        generation: u64,
        as_speaker: bool,
        outcome: MediaResult<AudioPlayback>,
    ) {
        let speaking = self.inner.media.active_speakers().borrow().clone();
        let mut notices = Vec::new();
        let current = {
            let mut state = self.inner.state.lock();
            match state.selected_room_mut(generation) {
                Some(local) => {
                    // The row is authoritative; the role holds even without audio.
                    if let Some(next) = after_reconnect(&local.membership, as_speaker) {
                        local.membership = next;
                    }
                    local.speaking = speaking;
                    match &outcome {
                        Ok(playback) => {
                            local.audio = AudioStatus::Connected {
                                publishing: as_speaker,
                            };
                            local.needs_audio_start =
                                *playback == AudioPlayback::BlockedByAutoplay;
                            if local.needs_audio_start {
                                notices.push(Notice::NeedsAudioStart {
                                    room_id: room_id.to_string(),
                                });
                            }
                        }
                        Err(e) => {
                            local.audio = AudioStatus::Degraded;
                            notices.push(Notice::DegradedAudio {
                                room_id: room_id.to_string(),
                                reason: e.to_string(),
                            });
                        }
                    }
                    true
                }
                None => false,
            }
        };

        match &outcome {
            Ok(playback) => debug!(room_id, as_speaker, ?playback, "Media session connected"),
            Err(e) => warn!(room_id, as_speaker, error = %e, "Media session unavailable"),
        }

        if !current {
            debug!(room_id, "Room left while connecting media");
            if outcome.is_ok() {
                if let Err(e) = self.inner.media.leave().await {
                    warn!(room_id, error = %e, "Failed to leave media session");
                }
            }
            return;
        }
        for notice in notices {
            self.notify(notice);
        }
    }

    /// Leave the media session unless a newer room has taken it over.
    async fn disconnect_media(&self) {
        let _media = self.inner.media_lock.lock().await;
        if self.inner.state.lock().local.is_some() {
            debug!("Media session belongs to a newer room, keeping it");
            return;
        }
        if let Err(e) = self.inner.media.leave().await {
            warn!(error = %e, "Failed to leave media session");
        }
    }

    async fn set_media_mute(&self, muted: bool) {
        if let Err(e) = self.inner.media.set_mute(muted).await {
            warn!(muted, error = %e, "Failed to set media mute");
        }
    }

    // ------------------------------------------------------------------
    // Room pump
    // ------------------------------------------------------------------

    fn spawn_pump(
        &self,
        room_id: String,
        generation: u64,
        subscriptions: Vec<Subscription>,
    ) -> RoomPump {
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let mut speakers = self.inner.media.active_speakers();
        let mut feed_events = self.inner.feed.events();
        let mut changes = stream::select_all(subscriptions.into_iter().map(subscription_stream));

        let task = tokio::spawn(async move {
            debug!(room_id = %room_id, generation, "Room pump started");
            let mut speakers_open = true;
            loop {
                tokio::select! {
                    biased;

                    _ = &mut shutdown_rx => break,

                    Some(event) = changes.next() => {
                        let Some(inner) = weak.upgrade() else { break };
                        RoomReconciler { inner }
                            .on_change_event(&room_id, generation, event)
                            .await;
                    }

                    changed = speakers.changed(), if speakers_open => {
                        if changed.is_err() {
                            speakers_open = false;
                            continue;
                        }
                        let speaking = speakers.borrow_and_update().clone();
                        let Some(inner) = weak.upgrade() else { break };
                        RoomReconciler { inner }.set_speaking(&room_id, generation, speaking);
                    }

                    event = next_feed_event(&mut feed_events), if feed_events.is_some() => {
                        match event {
                            Ok(RealtimeEvent::GaveUp { attempts }) => {
                                let Some(inner) = weak.upgrade() else { break };
                                RoomReconciler { inner }.notify(Notice::RealtimeUnavailable {
                                    reason: format!("gave up after {attempts} reconnect attempts"),
                                });
                            }
                            Ok(event) => debug!(room_id = %room_id, ?event, "Realtime event"),
                            Err(RecvError::Lagged(skipped)) => {
                                warn!(room_id = %room_id, skipped, "Realtime events lagged")
                            }
                            Err(RecvError::Closed) => feed_events = None,
                        }
                    }

                    else => break,
                }
            }
            debug!(room_id = %room_id, generation, "Room pump stopped");
        });

        RoomPump {
            _shutdown: shutdown_tx,
            _task: task,
        }
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    fn signed_in_user(&self) -> ReconcilerResult<String> {
        self.inner
            .session
            .user_id()
            .ok_or(ReconcilerError::NotSignedIn)
    }

    fn selected(&self) -> ReconcilerResult<Selected> {
        let state = self.inner.state.lock();
        let local = state.local.clone().ok_or(ReconcilerError::NotJoined)?;
        let user_id = state.user_id.clone().ok_or(ReconcilerError::NotSignedIn)?;
        Ok(Selected {
            local,
            user_id,
            generation: state.generation,
        })
    }

    fn begin_join(&self, room_id: &str) -> u64 {
        let mut state = self.inner.state.lock();
        state.generation += 1;
        state.joining = Some(room_id.to_string());
        state.generation
    }

    fn is_current(&self, generation: u64) -> bool {
        self.inner.state.lock().generation == generation
    }

    fn ensure_current(&self, generation: u64) -> ReconcilerResult<()> {
        if self.is_current(generation) {
            Ok(())
        } else {
            Err(ReconcilerError::Superseded)
        }
    }

    fn room_still_wanted(&self, room_id: &str) -> bool {
        let state = self.inner.state.lock();
        state.joining.as_deref() == Some(room_id)
            || state
                .local
                .as_ref()
                .map_or(false, |local| local.room_id == room_id)
    }

    fn notify(&self, notice: Notice) {
        info!(notice = %notice, "Notice");
        // No subscribers is fine; notices are transient.
        let _ = self.inner.notices.send(notice);
    }

    /// Log a failed action, surface it as a notice and hand back the error.
    fn action_failed(
        &self,
        action: &'static str,
        error: impl Into<ReconcilerError>,
    ) -> ReconcilerError {
        let error = error.into();
        warn!(action, error = %error, "Action failed");
        self.notify(Notice::ActionFailed {
            action,
            reason: error.to_string(),
        });
        error
    }
}

#[derive(Debug)]
enum TransferUndo {
    RoomHost,
    TargetRole(String, ParticipantRole),
}

fn subscription_stream(subscription: Subscription) -> BoxStream<'static, ChangeEvent> {
    stream::unfold(subscription, |mut subscription| async move {
        subscription
            .recv()
            .await
            .map(|event| (event, subscription))
    })
    .boxed()
}

async fn next_feed_event(
    events: &mut Option<broadcast::Receiver<RealtimeEvent>>,
) -> Result<RealtimeEvent, RecvError> {
    match events {
        Some(receiver) => receiver.recv().await,
        None => std::future::pending().await,
    }
}
