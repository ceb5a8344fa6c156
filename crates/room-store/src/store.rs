//! The store seam.

use crate::{
    NewParticipant, NewRoom, NewRoomMessage, Participant, ParticipantPatch, Reaction,
    ReactionKind, Room, RoomMessage, RoomPatch, StoreResult,
};
use async_trait::async_trait;

/// Typed access to the audio-room tables.
///
/// Every call is a single request; nothing here is transactional. Writes
/// that address a missing row return `Ok(None)` / `Ok(false)` rather than
/// an error so callers can treat "already gone" as success where it fits.
#[async_trait]
pub trait RoomStore: Send + Sync {
    /// Active rooms, newest first.
    async fn list_active_rooms(&self, limit: usize) -> StoreResult<Vec<Room>>;

    async fn fetch_room(&self, room_id: &str) -> StoreResult<Option<Room>>;

    async fn create_room(&self, room: &NewRoom) -> StoreResult<Room>;

    async fn update_room(&self, room_id: &str, patch: &RoomPatch) -> StoreResult<Option<Room>>;

    async fn delete_room(&self, room_id: &str) -> StoreResult<bool>;

    async fn fetch_participant(
        &self,
        room_id: &str,
        user_id: &str,
    ) -> StoreResult<Option<Participant>>;

    /// Participants of a room ordered by join time.
    async fn list_participants(&self, room_id: &str) -> StoreResult<Vec<Participant>>;

    /// Insert a membership row. A second row for the same (room, user)
    /// fails with [`crate::StoreError::Conflict`].
    async fn insert_participant(&self, participant: &NewParticipant) -> StoreResult<Participant>;

    async fn update_participant(
        &self,
        room_id: &str,
        user_id: &str,
        patch: &ParticipantPatch,
    ) -> StoreResult<Option<Participant>>;

    /// Returns `false` when there was no row to delete.
    async fn delete_participant(&self, room_id: &str, user_id: &str) -> StoreResult<bool>;

    /// Remove every membership row for a room. Returns how many went.
    async fn delete_room_participants(&self, room_id: &str) -> StoreResult<usize>;

    async fn fetch_reaction(&self, room_id: &str, user_id: &str) -> StoreResult<Option<Reaction>>;

    async fn list_reactions(&self, room_id: &str) -> StoreResult<Vec<Reaction>>;

    async fn insert_reaction(&self, reaction: &Reaction) -> StoreResult<Reaction>;

    async fn update_reaction(
        &self,
        room_id: &str,
        user_id: &str,
        kind: ReactionKind,
    ) -> StoreResult<Option<Reaction>>;

    async fn delete_reaction(&self, room_id: &str, user_id: &str) -> StoreResult<bool>;

    /// Most recent messages in chronological order.
    async fn list_messages(&self, room_id: &str, limit: usize) -> StoreResult<Vec<RoomMessage>>;

    async fn insert_message(&self, message: &NewRoomMessage) -> StoreResult<RoomMessage>;

    async fn soft_delete_message(&self, message_id: &str) -> StoreResult<Option<RoomMessage>>;
}
