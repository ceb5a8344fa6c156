//! Typed room changes decoded from row events.

use room_realtime::{ChangeEvent, ChangeKind};
use room_store::{tables, Participant, Reaction, Room, RoomMessage};
use serde::de::DeserializeOwned;
use serde_json::Value;

/// A change to one of the room tables, scoped to a room.
#[derive(Debug, Clone, PartialEq)]
pub enum RoomChange {
    ParticipantUpserted(Participant),
    ParticipantDeleted { room_id: String, user_id: String },
    RoomUpdated(Room),
    RoomDeleted { room_id: String },
    ReactionUpserted(Reaction),
    ReactionDeleted { room_id: String, user_id: String },
    MessageUpserted(RoomMessage),
}

impl RoomChange {
    /// Decode `event` received on a subscription for `room_id`.
    ///
    /// Delete events may carry only the primary key; the subscription's
    /// room fills in a missing `room_id`. Returns `None` for rows that do
    /// not decode or belong to another room.
    pub fn decode(event: &ChangeEvent, room_id: &str) -> Option<Self> {
        let change = match (event.table.as_str(), event.kind) {
            (tables::PARTICIPANTS, ChangeKind::Delete) => {
                let old = event.old_row.as_ref()?;
                RoomChange::ParticipantDeleted {
                    room_id: str_field(old, "room_id").unwrap_or_else(|| room_id.to_string()),
                    user_id: str_field(old, "user_id")?,
                }
            }
            (tables::PARTICIPANTS, _) => RoomChange::ParticipantUpserted(row(event)?),
            (tables::ROOMS, ChangeKind::Delete) => RoomChange::RoomDeleted {
                room_id: event
                    .old_row
                    .as_ref()
                    .and_then(|old| str_field(old, "id"))
                    .unwrap_or_else(|| room_id.to_string()),
            },
            (tables::ROOMS, _) => RoomChange::RoomUpdated(row(event)?),
            (tables::REACTIONS, ChangeKind::Delete) => {
                let old = event.old_row.as_ref()?;
                RoomChange::ReactionDeleted {
                    room_id: str_field(old, "room_id").unwrap_or_else(|| room_id.to_string()),
                    user_id: str_field(old, "user_id")?,
                }
            }
            (tables::REACTIONS, _) => RoomChange::ReactionUpserted(row(event)?),
            (tables::MESSAGES, ChangeKind::Delete) => return None,
            (tables::MESSAGES, _) => RoomChange::MessageUpserted(row(event)?),
            _ => return None,
        };

        (change.room_id() == room_id).then_some(change)
    }

    pub fn room_id(&self) -> &str {
        match self {
            RoomChange::ParticipantUpserted(p) => &p.room_id,
            RoomChange::ParticipantDeleted { room_id, .. } => room_id,
            RoomChange::RoomUpdated(room) => &room.id,
            RoomChange::RoomDeleted { room_id } => room_id,
            RoomChange::ReactionUpserted(r) => &r.room_id,
            RoomChange::ReactionDeleted { room_id, .. } => room_id,
            RoomChange::MessageUpserted(m) => &m.room_id,
        }
    }
}

fn row<T: DeserializeOwned>(event: &ChangeEvent) -> Option<T> {
    let value = event.new_row.as_ref()?;
    match serde_json::from_value(value.clone()) {
        Ok(row) => Some(row),
        Err(e) => {
            tracing::warn!(table = %event.table, error = %e, "Undecodable row in change event");
            None
        }
    }
}

fn str_field(row: &Value, field: &str) -> Option<String> {
    row.get(field).and_then(Value::as_str).map(str::to_string)
}
