//! Row-change subscriptions for the Murmur client.
//!
//! This crate provides:
//! - Channel protocol messages and typed row-change events
//! - The [`ChangeFeed`] seam with RAII [`Subscription`] handles
//! - A WebSocket client with heartbeat, exponential-backoff reconnection
//!   and re-join of registered channels
//! - An in-process feed for local use and tests

mod client;
mod error;
mod feed;
mod messages;

pub use client::{ConnectionState, RealtimeClient, RealtimeConfig, RealtimeEvent};
pub use error::{RealtimeError, RealtimeResult};
pub use feed::{ChangeFeed, LocalChangeFeed, Subscription};
pub use messages::{events, ChangeEvent, ChangeFilter, ChangeKind, PhoenixMessage, PHOENIX_TOPIC};
