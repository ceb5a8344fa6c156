//! In-process [`RoomStore`].
//!
//! Enforces the same uniqueness rules as the backend tables, records every
//! call, and can be told to fail specific operations.

use crate::types::tables;
use crate::{
    NewParticipant, NewRoom, NewRoomMessage, Participant, ParticipantPatch, Reaction,
    ReactionKind, Room, RoomMessage, RoomPatch, RoomStore, StoreError, StoreResult,
};
use async_trait::async_trait;
use chrono::{Duration, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy)]
enum FailMode {
    Once(u16),
    Always(u16),
}

#[derive(Default)]
struct Tables {
    rooms: Vec<Room>,
    participants: Vec<Participant>,
    reactions: Vec<Reaction>,
    messages: Vec<RoomMessage>,
}

/// Rows held in memory behind one lock.
#[derive(Default)]
pub struct MemoryRoomStore {
    tables: Mutex<Tables>,
    failures: Mutex<HashMap<&'static str, FailMode>>,
    calls: Mutex<Vec<String>>,
}

impl MemoryRoomStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a room row directly.
    pub fn seed_room(&self, room: Room) {
        let mut tables = self.tables.lock();
        tables.rooms.retain(|r| r.id != room.id);
        tables.rooms.push(room);
    }

    /// Insert or replace a participant row directly.
    pub fn seed_participant(&self, participant: Participant) {
        let mut tables = self.tables.lock();
        tables
            .participants
            .retain(|p| !(p.room_id == participant.room_id && p.user_id == participant.user_id));
        tables.participants.push(participant);
    }

    pub fn seed_reaction(&self, reaction: Reaction) {
        let mut tables = self.tables.lock();
        tables
            .reactions
            .retain(|r| !(r.room_id == reaction.room_id && r.user_id == reaction.user_id));
        tables.reactions.push(reaction);
    }

    pub fn room(&self, room_id: &str) -> Option<Room> {
        self.tables
            .lock()
            .rooms
            .iter()
            .find(|r| r.id == room_id)
            .cloned()
    }

    pub fn participant(&self, room_id: &str, user_id: &str) -> Option<Participant> {
        self.tables
            .lock()
            .participants
            .iter()
            .find(|p| p.room_id == room_id && p.user_id == user_id)
            .cloned()
    }

    pub fn participants(&self, room_id: &str) -> Vec<Participant> {
        self.tables
            .lock()
            .participants
            .iter()
            .filter(|p| p.room_id == room_id)
            .cloned()
            .collect()
    }

    pub fn reactions(&self, room_id: &str) -> Vec<Reaction> {
        self.tables
            .lock()
            .reactions
            .iter()
            .filter(|r| r.room_id == room_id)
            .cloned()
            .collect()
    }

    pub fn messages(&self, room_id: &str) -> Vec<RoomMessage> {
        self.tables
            .lock()
            .messages
            .iter()
            .filter(|m| m.room_id == room_id)
            .cloned()
            .collect()
    }

    /// Fail the next call to `operation` with a 503.
    pub fn fail_next(&self, operation: &'static str) {
        self.failures.lock().insert(operation, FailMode::Once(503));
    }

    /// Fail every call to `operation` with `status` until cleared.
    pub fn fail_always(&self, operation: &'static str, status: u16) {
        self.failures
            .lock()
            .insert(operation, FailMode::Always(status));
    }

    pub fn clear_failures(&self) {
        self.failures.lock().clear();
    }

    /// Every call made so far, as `operation` names.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self, operation: &str) -> usize {
        self.calls.lock().iter().filter(|c| *c == operation).count()
    }

    fn enter(&self, operation: &'static str) -> StoreResult<()> {
        self.calls.lock().push(operation.to_string());

        let mut failures = self.failures.lock();
        let status = match failures.get(operation).copied() {
            Some(FailMode::Once(status)) => {
                failures.remove(operation);
                status
            }
            Some(FailMode::Always(status)) => status,
            None => return Ok(()),
        };
        tracing::debug!(operation, status, "Injected store failure");
        Err(StoreError::Backend {
            status,
            message: format!("injected failure for {operation}"),
        })
    }
}

#[async_trait]
impl RoomStore for MemoryRoomStore {
    async fn list_active_rooms(&self, limit: usize) -> StoreResult<Vec<Room>> {
        self.enter("list_active_rooms")?;
        let mut rooms: Vec<Room> = self
            .tables
            .lock()
            .rooms
            .iter()
            .filter(|r| r.is_active)
            .cloned()
            .collect();
        rooms.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        rooms.truncate(limit);
        Ok(rooms)
    }

    async fn fetch_room(&self, room_id: &str) -> StoreResult<Option<Room>> {
        self.enter("fetch_room")?;
        Ok(self.room(room_id))
    }

    async fn create_room(&self, room: &NewRoom) -> StoreResult<Room> {
        self.enter("create_room")?;
        let mut tables = self.tables.lock();
        // Keep created_at strictly increasing so newest-first ordering is stable.
        let created_at = tables
            .rooms
            .iter()
            .map(|r| r.created_at)
            .max()
            .map(|latest| (latest + Duration::microseconds(1)).max(Utc::now()))
            .unwrap_or_else(Utc::now);
        let row = Room {
            id: uuid::Uuid::new_v4().to_string(),
            title: room.title.clone(),
            description: room.description.clone(),
            topic: room.topic.clone(),
            host_id: room.host_id.clone(),
            capacity: room.capacity,
            is_active: room.is_active,
            like_count: 0,
            dislike_count: 0,
            created_at,
        };
        tables.rooms.push(row.clone());
        Ok(row)
    }

    async fn update_room(&self, room_id: &str, patch: &RoomPatch) -> StoreResult<Option<Room>> {
        self.enter("update_room")?;
        let mut tables = self.tables.lock();
        Ok(tables.rooms.iter_mut().find(|r| r.id == room_id).map(|room| {
            patch.apply_to(room);
            room.clone()
        }))
    }

    async fn delete_room(&self, room_id: &str) -> StoreResult<bool> {
        self.enter("delete_room")?;
        let mut tables = self.tables.lock();
        let before = tables.rooms.len();
        tables.rooms.retain(|r| r.id != room_id);
        let removed = tables.rooms.len() != before;
        if removed {
            tables.participants.retain(|p| p.room_id != room_id);
            tables.reactions.retain(|r| r.room_id != room_id);
            tables.messages.retain(|m| m.room_id != room_id);
        }
        Ok(removed)
    }

    async fn fetch_participant(
        &self,
        room_id: &str,
        user_id: &str,
    ) -> StoreResult<Option<Participant>> {
        self.enter("fetch_participant")?;
        Ok(self.participant(room_id, user_id))
    }

    async fn list_participants(&self, room_id: &str) -> StoreResult<Vec<Participant>> {
        self.enter("list_participants")?;
        let mut rows = self.participants(room_id);
        rows.sort_by(|a, b| a.joined_at.cmp(&b.joined_at));
        Ok(rows)
    }

    async fn insert_participant(&self, participant: &NewParticipant) -> StoreResult<Participant> {
        self.enter("insert_participant")?;
        let mut tables = self.tables.lock();
        if tables
            .participants
            .iter()
            .any(|p| p.room_id == participant.room_id && p.user_id == participant.user_id)
        {
            return Err(StoreError::Conflict {
                table: tables::PARTICIPANTS,
                message: format!(
                    "participant {} already in room {}",
                    participant.user_id, participant.room_id
                ),
            });
        }
        let joined_at = tables
            .participants
            .iter()
            .map(|p| p.joined_at)
            .max()
            .map(|latest| (latest + Duration::microseconds(1)).max(Utc::now()))
            .unwrap_or_else(Utc::now);
        let row = Participant {
            room_id: participant.room_id.clone(),
            user_id: participant.user_id.clone(),
            role: participant.role,
            is_muted: participant.is_muted,
            is_hand_raised: participant.is_hand_raised,
            joined_at,
        };
        tables.participants.push(row.clone());
        Ok(row)
    }

    async fn update_participant(
        &self,
        room_id: &str,
        user_id: &str,
        patch: &ParticipantPatch,
    ) -> StoreResult<Option<Participant>> {
        self.enter("update_participant")?;
        let mut tables = self.tables.lock();
        Ok(tables
            .participants
            .iter_mut()
            .find(|p| p.room_id == room_id && p.user_id == user_id)
            .map(|participant| {
                patch.apply_to(participant);
                participant.clone()
            }))
    }

    async fn delete_participant(&self, room_id: &str, user_id: &str) -> StoreResult<bool> {
        self.enter("delete_participant")?;
        let mut tables = self.tables.lock();
        let before = tables.participants.len();
        tables
            .participants
            .retain(|p| !(p.room_id == room_id && p.user_id == user_id));
        Ok(tables.participants.len() != before)
    }

    async fn delete_room_participants(&self, room_id: &str) -> StoreResult<usize> {
        self.enter("delete_room_participants")?;
        let mut tables = self.tables.lock();
        let before = tables.participants.len();
        tables.participants.retain(|p| p.room_id != room_id);
        Ok(before - tables.participants.len())
    }

    async fn fetch_reaction(&self, room_id: &str, user_id: &str) -> StoreResult<Option<Reaction>> {
        self.enter("fetch_reaction")?;
        Ok(self
            .tables
            .lock()
            .reactions
            .iter()
            .find(|r| r.room_id == room_id && r.user_id == user_id)
            .cloned())
    }

    async fn list_reactions(&self, room_id: &str) -> StoreResult<Vec<Reaction>> {
        self.enter("list_reactions")?;
        Ok(self.reactions(room_id))
    }

    async fn insert_reaction(&self, reaction: &Reaction) -> StoreResult<Reaction> {
        self.enter("insert_reaction")?;
        let mut tables = self.tables.lock();
        if tables
            .reactions
            .iter()
            .any(|r| r.room_id == reaction.room_id && r.user_id == reaction.user_id)
        {
            return Err(StoreError::Conflict {
                table: tables::REACTIONS,
                message: format!(
                    "reaction by {} already in room {}",
                    reaction.user_id, reaction.room_id
                ),
            });
        }
        tables.reactions.push(reaction.clone());
        Ok(reaction.clone())
    }

    async fn update_reaction(
        &self,
        room_id: &str,
        user_id: &str,
        kind: ReactionKind,
    ) -> StoreResult<Option<Reaction>> {
        self.enter("update_reaction")?;
        let mut tables = self.tables.lock();
        Ok(tables
            .reactions
            .iter_mut()
            .find(|r| r.room_id == room_id && r.user_id == user_id)
            .map(|reaction| {
                reaction.reaction_type = kind;
                reaction.clone()
            }))
    }

    async fn delete_reaction(&self, room_id: &str, user_id: &str) -> StoreResult<bool> {
        self.enter("delete_reaction")?;
        let mut tables = self.tables.lock();
        let before = tables.reactions.len();
        tables
            .reactions
            .retain(|r| !(r.room_id == room_id && r.user_id == user_id));
        Ok(tables.reactions.len() != before)
    }

    async fn list_messages(&self, room_id: &str, limit: usize) -> StoreResult<Vec<RoomMessage>> {
        self.enter("list_messages")?;
        let rows = self.messages(room_id);
        let skip = rows.len().saturating_sub(limit);
        Ok(rows.into_iter().skip(skip).collect())
    }

    async fn insert_message(&self, message: &NewRoomMessage) -> StoreResult<RoomMessage> {
        self.enter("insert_message")?;
        let row = RoomMessage {
            id: uuid::Uuid::new_v4().to_string(),
            room_id: message.room_id.clone(),
            user_id: message.user_id.clone(),
            content: message.content.clone(),
            is_deleted: false,
            created_at: Utc::now(),
        };
        self.tables.lock().messages.push(row.clone());
        Ok(row)
    }

    async fn soft_delete_message(&self, message_id: &str) -> StoreResult<Option<RoomMessage>> {
        self.enter("soft_delete_message")?;
        let mut tables = self.tables.lock();
        Ok(tables
            .messages
            .iter_mut()
            .find(|m| m.id == message_id)
            .map(|message| {
                message.is_deleted = true;
                message.clone()
            }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ParticipantRole;

    fn new_room(host: &str) -> NewRoom {
        NewRoom {
            title: "Late night".to_string(),
            description: None,
            topic: Some("music".to_string()),
            host_id: host.to_string(),
            capacity: 10,
            is_active: true,
        }
    }

    #[tokio::test]
    async fn duplicate_participant_conflicts() {
        let store = MemoryRoomStore::new();
        let row = NewParticipant::new("r1", "u1", ParticipantRole::Listener);
        store.insert_participant(&row).await.unwrap();

        let err = store.insert_participant(&row).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict { table, .. } if table == tables::PARTICIPANTS));
        assert_eq!(store.participants("r1").len(), 1);
    }

    #[tokio::test]
    async fn delete_missing_participant_returns_false() {
        let store = MemoryRoomStore::new();
        assert!(!store.delete_participant("r1", "ghost").await.unwrap());
    }

    #[tokio::test]
    async fn participants_list_in_join_order() {
        let store = MemoryRoomStore::new();
        for user in ["a", "b", "c"] {
            store
                .insert_participant(&NewParticipant::new("r1", user, ParticipantRole::Listener))
                .await
                .unwrap();
        }
        let users: Vec<String> = store
            .list_participants("r1")
            .await
            .unwrap()
            .into_iter()
            .map(|p| p.user_id)
            .collect();
        assert_eq!(users, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn active_rooms_newest_first() {
        let store = MemoryRoomStore::new();
        let first = store.create_room(&new_room("h1")).await.unwrap();
        let second = store.create_room(&new_room("h2")).await.unwrap();
        store
            .update_room(&first.id, &RoomPatch::deactivate())
            .await
            .unwrap();
        let third = store.create_room(&new_room("h3")).await.unwrap();

        let ids: Vec<String> = store
            .list_active_rooms(10)
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(ids, vec![third.id, second.id]);
    }

    #[tokio::test]
    async fn injected_failure_fires_once() {
        let store = MemoryRoomStore::new();
        store.fail_next("fetch_room");

        let err = store.fetch_room("r1").await.unwrap_err();
        assert!(err.is_transient());
        assert!(store.fetch_room("r1").await.unwrap().is_none());
        assert_eq!(store.call_count("fetch_room"), 2);
    }

    #[tokio::test]
    async fn sticky_failure_until_cleared() {
        let store = MemoryRoomStore::new();
        store.fail_always("list_reactions", 403);
        assert!(store.list_reactions("r1").await.is_err());
        assert!(store.list_reactions("r1").await.is_err());
        store.clear_failures();
        assert!(store.list_reactions("r1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn deleting_room_cascades() {
        let store = MemoryRoomStore::new();
        let room = store.create_room(&new_room("h")).await.unwrap();
        store
            .insert_participant(&NewParticipant::new(&room.id, "h", ParticipantRole::Host))
            .await
            .unwrap();
        store
            .insert_reaction(&Reaction {
                room_id: room.id.clone(),
                user_id: "h".to_string(),
                reaction_type: ReactionKind::Like,
            })
            .await
            .unwrap();

        assert!(store.delete_room(&room.id).await.unwrap());
        assert!(store.participants(&room.id).is_empty());
        assert!(store.reactions(&room.id).is_empty());
    }

    #[tokio::test]
    async fn messages_keep_the_latest() {
        let store = MemoryRoomStore::new();
        for n in 0..5 {
            store
                .insert_message(&NewRoomMessage {
                    room_id: "r1".to_string(),
                    user_id: "u".to_string(),
                    content: format!("m{n}"),
                })
                .await
                .unwrap();
        }
        let contents: Vec<String> = store
            .list_messages("r1", 2)
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.content)
            .collect();
        assert_eq!(contents, vec!["m3", "m4"]);
    }
}
