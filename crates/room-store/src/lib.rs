//! Relational store access for audio rooms.
//!
//! Rows live in four tables: `audio_rooms`, `room_participants`,
//! `room_reactions` and `room_messages`. [`RoomStore`] is the typed surface
//! the reconciler talks to; [`SupabaseRoomStore`] implements it over the
//! PostgREST interface and [`MemoryRoomStore`] keeps rows in process.

mod error;
mod memory;
mod query;
mod store;
mod supabase;
mod types;

pub use error::{StoreError, StoreResult};
pub use memory::MemoryRoomStore;
pub use query::{Filter, Order, Query};
pub use store::RoomStore;
pub use supabase::SupabaseRoomStore;
pub use types::{
    tables, NewParticipant, NewRoom, NewRoomMessage, Participant, ParticipantPatch,
    ParticipantRole, Reaction, ReactionCounts, ReactionKind, Room, RoomMessage, RoomPatch,
};
