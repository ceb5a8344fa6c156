//! Row types for the audio-room tables.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Table names.
pub mod tables {
    pub const ROOMS: &str = "audio_rooms";
    pub const PARTICIPANTS: &str = "room_participants";
    pub const REACTIONS: &str = "room_reactions";
    pub const MESSAGES: &str = "room_messages";
}

/// A live audio room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Room {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub topic: Option<String>,
    pub host_id: String,
    pub capacity: i32,
    pub is_active: bool,
    #[serde(default)]
    pub like_count: i64,
    #[serde(default)]
    pub dislike_count: i64,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl Room {
    pub fn is_hosted_by(&self, user_id: &str) -> bool {
        self.host_id == user_id
    }
}

/// Insert payload for a room. The creator becomes the host.
#[derive(Debug, Clone, Serialize)]
pub struct NewRoom {
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
    pub host_id: String,
    pub capacity: i32,
    pub is_active: bool,
}

/// Partial room update. `None` fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RoomPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_active: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub like_count: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dislike_count: Option<i64>,
}

impl RoomPatch {
    pub fn host(host_id: impl Into<String>) -> Self {
        Self {
            host_id: Some(host_id.into()),
            ..Default::default()
        }
    }

    pub fn deactivate() -> Self {
        Self {
            is_active: Some(false),
            ..Default::default()
        }
    }

    pub fn counts(counts: ReactionCounts) -> Self {
        Self {
            like_count: Some(counts.likes),
            dislike_count: Some(counts.dislikes),
            ..Default::default()
        }
    }

    /// Apply this patch to a room in place.
    pub fn apply_to(&self, room: &mut Room) {
        if let Some(title) = &self.title {
            room.title = title.clone();
        }
        if let Some(host_id) = &self.host_id {
            room.host_id = host_id.clone();
        }
        if let Some(is_active) = self.is_active {
            room.is_active = is_active;
        }
        if let Some(likes) = self.like_count {
            room.like_count = likes;
        }
        if let Some(dislikes) = self.dislike_count {
            room.dislike_count = dislikes;
        }
    }
}

/// Role of a participant within a room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParticipantRole {
    Host,
    Speaker,
    Listener,
}

impl ParticipantRole {
    /// Host and speakers publish audio; listeners only subscribe.
    pub fn can_publish(self) -> bool {
        matches!(self, ParticipantRole::Host | ParticipantRole::Speaker)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ParticipantRole::Host => "host",
            ParticipantRole::Speaker => "speaker",
            ParticipantRole::Listener => "listener",
        }
    }
}

impl fmt::Display for ParticipantRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Membership row for a (room, user) pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub room_id: String,
    pub user_id: String,
    pub role: ParticipantRole,
    #[serde(default)]
    pub is_muted: bool,
    #[serde(default)]
    pub is_hand_raised: bool,
    #[serde(default = "Utc::now")]
    pub joined_at: DateTime<Utc>,
}

/// Insert payload for a participant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NewParticipant {
    pub room_id: String,
    pub user_id: String,
    pub role: ParticipantRole,
    pub is_muted: bool,
    pub is_hand_raised: bool,
}

impl NewParticipant {
    /// A fresh membership row. Listeners start muted; they cannot publish.
    pub fn new(
        room_id: impl Into<String>,
        user_id: impl Into<String>,
        role: ParticipantRole,
    ) -> Self {
        Self {
            room_id: room_id.into(),
            user_id: user_id.into(),
            role,
            is_muted: !role.can_publish(),
            is_hand_raised: false,
        }
    }
}

/// Partial participant update. `None` fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ParticipantPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<ParticipantRole>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_muted: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_hand_raised: Option<bool>,
}

impl ParticipantPatch {
    /// Speaker promotion clears mute and lowers the hand.
    pub fn promote() -> Self {
        Self {
            role: Some(ParticipantRole::Speaker),
            is_muted: Some(false),
            is_hand_raised: Some(false),
        }
    }

    /// Demotion forces mute on.
    pub fn demote() -> Self {
        Self {
            role: Some(ParticipantRole::Listener),
            is_muted: Some(true),
            is_hand_raised: None,
        }
    }

    pub fn role(role: ParticipantRole) -> Self {
        Self {
            role: Some(role),
            ..Default::default()
        }
    }

    pub fn muted(muted: bool) -> Self {
        Self {
            is_muted: Some(muted),
            ..Default::default()
        }
    }

    pub fn hand_raised(raised: bool) -> Self {
        Self {
            is_hand_raised: Some(raised),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.role.is_none() && self.is_muted.is_none() && self.is_hand_raised.is_none()
    }

    /// Apply this patch to a participant in place.
    pub fn apply_to(&self, participant: &mut Participant) {
        if let Some(role) = self.role {
            participant.role = role;
        }
        if let Some(muted) = self.is_muted {
            participant.is_muted = muted;
        }
        if let Some(raised) = self.is_hand_raised {
            participant.is_hand_raised = raised;
        }
    }

    /// Whether `participant` already reflects every field of this patch.
    pub fn is_satisfied_by(&self, participant: &Participant) -> bool {
        self.role.map_or(true, |role| participant.role == role)
            && self.is_muted.map_or(true, |muted| participant.is_muted == muted)
            && self
                .is_hand_raised
                .map_or(true, |raised| participant.is_hand_raised == raised)
    }
}

/// Reaction kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReactionKind {
    Like,
    Dislike,
}

impl ReactionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ReactionKind::Like => "like",
            ReactionKind::Dislike => "dislike",
        }
    }
}

impl FromStr for ReactionKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "like" => Ok(ReactionKind::Like),
            "dislike" => Ok(ReactionKind::Dislike),
            other => Err(format!("unknown reaction: {other}")),
        }
    }
}

impl fmt::Display for ReactionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A user's reaction to a room. At most one per (room, user).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reaction {
    pub room_id: String,
    pub user_id: String,
    pub reaction_type: ReactionKind,
}

/// Like/dislike tallies for a room.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReactionCounts {
    pub likes: i64,
    pub dislikes: i64,
}

impl ReactionCounts {
    pub fn tally<'a>(reactions: impl IntoIterator<Item = &'a Reaction>) -> Self {
        reactions
            .into_iter()
            .fold(Self::default(), |mut counts, reaction| {
                match reaction.reaction_type {
                    ReactionKind::Like => counts.likes += 1,
                    ReactionKind::Dislike => counts.dislikes += 1,
                }
                counts
            })
    }
}

/// A chat message posted in a room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomMessage {
    pub id: String,
    pub room_id: String,
    pub user_id: String,
    pub content: String,
    #[serde(default)]
    pub is_deleted: bool,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

/// Insert payload for a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NewRoomMessage {
    pub room_id: String,
    pub user_id: String,
    pub content: String,
}
