//! Local room state and the per-room directory of cached rows.

use crate::changes::RoomChange;
use crate::fsm::{Membership, MembershipState};
use room_store::{Participant, ParticipantRole, Reaction, ReactionCounts, Room, RoomMessage};
use std::collections::{BTreeSet, HashMap};

/// Audio side of a membership.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioStatus {
    Idle,
    Connected { publishing: bool },
    /// Token or connect failed; membership stands without audio.
    Degraded,
}

/// What this client believes about its own membership in the selected room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalRoomState {
    pub room_id: String,
    pub membership: MembershipState,
    pub role: ParticipantRole,
    pub is_muted: bool,
    pub is_hand_raised: bool,
    /// Participant ids the media session reports as speaking.
    pub speaking: BTreeSet<String>,
    pub needs_audio_start: bool,
    pub audio: AudioStatus,
}

impl LocalRoomState {
    pub fn new(
        room_id: impl Into<String>,
        role: ParticipantRole,
        membership: MembershipState,
    ) -> Self {
        Self {
            room_id: room_id.into(),
            membership,
            role,
            is_muted: false,
            is_hand_raised: false,
            speaking: BTreeSet::new(),
            needs_audio_start: false,
            audio: AudioStatus::Idle,
        }
    }

    pub fn membership(&self) -> Membership {
        Membership::from(&self.membership)
    }

    pub fn is_host(&self) -> bool {
        self.role == ParticipantRole::Host
    }
}

/// Cached rows for one room, kept current from change events.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RoomView {
    pub room: Option<Room>,
    /// Participants in join order.
    pub participants: Vec<Participant>,
    pub reactions: Vec<Reaction>,
    pub messages: Vec<RoomMessage>,
}

impl RoomView {
    pub fn apply(&mut self, change: &RoomChange) {
        match change {
            RoomChange::ParticipantUpserted(row) => self.upsert_participant(row.clone()),
            RoomChange::ParticipantDeleted { user_id, .. } => {
                self.participants.retain(|p| &p.user_id != user_id)
            }
            RoomChange::RoomUpdated(room) => self.room = Some(room.clone()),
            RoomChange::RoomDeleted { .. } => self.room = None,
            RoomChange::ReactionUpserted(row) => {
                match self
                    .reactions
                    .iter_mut()
                    .find(|r| r.user_id == row.user_id)
                {
                    Some(existing) => *existing = row.clone(),
                    None => self.reactions.push(row.clone()),
                }
            }
            RoomChange::ReactionDeleted { user_id, .. } => {
                self.reactions.retain(|r| &r.user_id != user_id)
            }
            RoomChange::MessageUpserted(row) => {
                match self.messages.iter_mut().find(|m| m.id == row.id) {
                    Some(existing) => *existing = row.clone(),
                    None => self.messages.push(row.clone()),
                }
            }
        }
    }

    pub fn upsert_participant(&mut self, row: Participant) {
        match self
            .participants
            .iter_mut()
            .find(|p| p.user_id == row.user_id)
        {
            Some(existing) => *existing = row,
            None => {
                self.participants.push(row);
                self.participants.sort_by(|a, b| a.joined_at.cmp(&b.joined_at));
            }
        }
    }

    pub fn participant(&self, user_id: &str) -> Option<&Participant> {
        self.participants.iter().find(|p| p.user_id == user_id)
    }

    pub fn host_id(&self) -> Option<&str> {
        self.room.as_ref().map(|room| room.host_id.as_str())
    }

    /// Host and speakers, in join order.
    pub fn speakers(&self) -> Vec<&Participant> {
        self.participants
            .iter()
            .filter(|p| p.role.can_publish())
            .collect()
    }

    pub fn listeners(&self) -> Vec<&Participant> {
        self.participants
            .iter()
            .filter(|p| !p.role.can_publish())
            .collect()
    }

    pub fn raised_hands(&self) -> Vec<&Participant> {
        self.participants
            .iter()
            .filter(|p| p.is_hand_raised)
            .collect()
    }

    pub fn counts(&self) -> ReactionCounts {
        ReactionCounts::tally(&self.reactions)
    }

    pub fn reaction_of(&self, user_id: &str) -> Option<&Reaction> {
        self.reactions.iter().find(|r| r.user_id == user_id)
    }

    pub fn message(&self, message_id: &str) -> Option<&RoomMessage> {
        self.messages.iter().find(|m| m.id == message_id)
    }

    /// Messages that have not been soft-deleted.
    pub fn visible_messages(&self) -> impl Iterator<Item = &RoomMessage> {
        self.messages.iter().filter(|m| !m.is_deleted)
    }
}

/// Room views keyed by room id.
#[derive(Debug, Clone, Default)]
pub struct RoomDirectory {
    rooms: HashMap<String, RoomView>,
}

impl RoomDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn view(&self, room_id: &str) -> Option<&RoomView> {
        self.rooms.get(room_id)
    }

    pub fn view_mut(&mut self, room_id: &str) -> &mut RoomView {
        self.rooms.entry(room_id.to_string()).or_default()
    }

    pub fn insert(&mut self, room_id: impl Into<String>, view: RoomView) {
        self.rooms.insert(room_id.into(), view);
    }

    /// Apply a change to the view it belongs to, if that room is tracked.
    pub fn apply(&mut self, change: &RoomChange) -> bool {
        match self.rooms.get_mut(change.room_id()) {
            Some(view) => {
                view.apply(change);
                true
            }
            None => false,
        }
    }

    pub fn remove(&mut self, room_id: &str) -> Option<RoomView> {
        self.rooms.remove(room_id)
    }

    pub fn len(&self) -> usize {
        self.rooms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rooms.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use room_store::ReactionKind;

    fn participant(user: &str, role: ParticipantRole, offset: i64) -> Participant {
        Participant {
            room_id: "r1".to_string(),
            user_id: user.to_string(),
            role,
            is_muted: false,
            is_hand_raised: false,
            joined_at: Utc::now() + Duration::seconds(offset),
        }
    }

    #[test]
    fn participants_stay_in_join_order() {
        let mut view = RoomView::default();
        view.upsert_participant(participant("late", ParticipantRole::Listener, 10));
        view.upsert_participant(participant("early", ParticipantRole::Speaker, 0));

        let order: Vec<&str> = view.participants.iter().map(|p| p.user_id.as_str()).collect();
        assert_eq!(order, vec!["early", "late"]);
        assert_eq!(view.speakers().len(), 1);
        assert_eq!(view.listeners().len(), 1);
    }

    #[test]
    fn upsert_replaces_in_place() {
        let mut view = RoomView::default();
        view.upsert_participant(participant("u1", ParticipantRole::Listener, 0));
        view.apply(&RoomChange::ParticipantUpserted(participant(
            "u1",
            ParticipantRole::Speaker,
            0,
        )));
        assert_eq!(view.participants.len(), 1);
        assert_eq!(view.participant("u1").unwrap().role, ParticipantRole::Speaker);
    }

    #[test]
    fn reactions_count_and_delete() {
        let mut view = RoomView::default();
        for (user, kind) in [("a", ReactionKind::Like), ("b", ReactionKind::Dislike)] {
            view.apply(&RoomChange::ReactionUpserted(Reaction {
                room_id: "r1".to_string(),
                user_id: user.to_string(),
                reaction_type: kind,
            }));
        }
        assert_eq!(view.counts(), ReactionCounts { likes: 1, dislikes: 1 });

        view.apply(&RoomChange::ReactionDeleted {
            room_id: "r1".to_string(),
            user_id: "a".to_string(),
        });
        assert_eq!(view.counts(), ReactionCounts { likes: 0, dislikes: 1 });
    }

    #[test]
    fn directory_ignores_untracked_rooms() {
        let mut directory = RoomDirectory::new();
        let change = RoomChange::RoomDeleted {
            room_id: "r9".to_string(),
        };
        assert!(!directory.apply(&change));
        assert!(directory.is_empty());

        directory.view_mut("r1");
        assert!(directory.apply(&RoomChange::ParticipantUpserted(participant(
            "u1",
            ParticipantRole::Listener,
            0
        ))));
        assert_eq!(directory.view("r1").unwrap().participants.len(), 1);
    }

    #[test]
    fn soft_deleted_messages_are_hidden() {
        let mut view = RoomView::default();
        let mut message = RoomMessage {
            id: "m1".to_string(),
            room_id: "r1".to_string(),
            user_id: "u1".to_string(),
            content: "hello".to_string(),
            is_deleted: false,
            created_at: Utc::now(),
        };
        view.apply(&RoomChange::MessageUpserted(message.clone()));
        assert_eq!(view.visible_messages().count(), 1);

        message.is_deleted = true;
        view.apply(&RoomChange::MessageUpserted(message));
        assert_eq!(view.messages.len(), 1);
        assert_eq!(view.visible_messages().count(), 0);
    }
}
