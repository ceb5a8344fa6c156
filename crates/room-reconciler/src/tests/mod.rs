//! Integration tests for the room reconciler.
//!
//! Every test runs one or more clients against a shared in-memory store
//! whose writes echo back through the change feed.
//!
//! - `harness.rs`     - Echoing store, recording media, scripted tokens, fixture
//! - `join.rs`        - Join: role choice, row uniqueness, races, capacity, media outcomes
//! - `leave.rs`       - Leave: row removal, rejoin, teardown races, host hand-off
//! - `roles.rs`       - Host mutations and the role-change reaction
//! - `transfer.rs`    - Ownership transfer and its compensation
//! - `reactions.rs`   - Reaction toggle and counters
//! - `self_actions.rs`- Mute, hand raise, pending echoes, audio start
//! - `lifecycle.rs`   - Room creation, deletion, removal notices, realtime loss
//! - `messages.rs`    - Sending and soft-deleting messages

pub(crate) mod harness;
mod lifecycle;
