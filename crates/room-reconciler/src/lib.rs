//! Room membership reconciler for Murmur.
//!
//! Keeps three things consistent while the user, the host and other
//! clients act concurrently:
//!
//! - the local membership state for the selected room
//! - the remote `room_participants` rows
//! - the media session (token scope, publish permission, mute)
//!
//! # Architecture
//!
//! ```text
//! action ──► RoomStore ──► row commit ──► ChangeFeed ──► room pump
//!                                                          │
//!                 MediaSession ◄── effects ◄── handler ◄───┘
//! ```
//!
//! The handler is pure: it takes the local state and a decoded change and
//! returns the next state plus a list of [`Effect`]s. Membership moves
//! through a `rust-fsm` machine ([`fsm`]); optimistic self actions are
//! tracked in a [`PendingChanges`] ledger until their echo arrives.

pub mod changes;
pub mod error;
pub mod fsm;
pub mod handler;
pub mod notice;
pub mod pending;
pub mod ports;
pub mod reconciler;
pub mod state;

#[cfg(test)]
mod tests;

pub use changes::RoomChange;
pub use error::{ReconcilerError, ReconcilerResult};
pub use fsm::{Membership, MembershipInput, MembershipState};
pub use handler::{
    handle_change, pick_successor, plan_join_role, plan_reaction_toggle, ReactionPlan,
};
pub use notice::Notice;
pub use pending::{PendingChanges, Reconciliation, DEFAULT_PENDING_TTL};
pub use ports::{Effect, HandlerDeps, LogLevel, Transition};
pub use reconciler::{Collaborators, ReconcilerOptions, RoomReconciler, MAX_MESSAGE_CHARS};
pub use state::{AudioStatus, LocalRoomState, RoomDirectory, RoomView};
