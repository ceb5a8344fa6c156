//! Ledger of optimistic participant changes awaiting their echo.
//!
//! A self action (mute, hand raise) updates local state first and records
//! the intended fields here. When an update event for the same
//! (room, user) arrives it either confirms the entry or, if it still shows
//! the old values, is reported stale so local fields are not rolled back
//! by an echo of an earlier write.

use room_store::{Participant, ParticipantPatch};
use std::collections::HashMap;
use std::time::{Duration, Instant};

pub const DEFAULT_PENDING_TTL: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
struct Entry {
    patch: ParticipantPatch,
    expires_at: Instant,
}

/// How an incoming row relates to what we are waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconciliation {
    /// Nothing pending for this participant.
    NoPending,
    /// The row shows every pending field; the entry is cleared.
    Confirmed,
    /// The row contradicts a pending field.
    Stale,
}

#[derive(Debug, Clone)]
pub struct PendingChanges {
    ttl: Duration,
    entries: HashMap<(String, String), Entry>,
}

impl Default for PendingChanges {
    fn default() -> Self {
        Self::new(DEFAULT_PENDING_TTL)
    }
}

impl PendingChanges {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: HashMap::new(),
        }
    }

    /// Record an optimistic write. Fields merge into any entry already
    /// pending for the participant, and the deadline restarts.
    pub fn record(&mut self, room_id: &str, user_id: &str, patch: &ParticipantPatch, now: Instant) {
        self.cleanup(now);
        let entry = self
            .entries
            .entry((room_id.to_string(), user_id.to_string()))
            .or_insert_with(|| Entry {
                patch: ParticipantPatch::default(),
                expires_at: now,
            });
        if patch.role.is_some() {
            entry.patch.role = patch.role;
        }
        if patch.is_muted.is_some() {
            entry.patch.is_muted = patch.is_muted;
        }
        if patch.is_hand_raised.is_some() {
            entry.patch.is_hand_raised = patch.is_hand_raised;
        }
        entry.expires_at = now + self.ttl;
    }

    pub fn reconcile(&mut self, row: &Participant, now: Instant) -> Reconciliation {
        self.cleanup(now);
        let key = (row.room_id.clone(), row.user_id.clone());
        let Some(entry) = self.entries.get(&key) else {
            return Reconciliation::NoPending;
        };
        if entry.patch.is_satisfied_by(row) {
            self.entries.remove(&key);
            Reconciliation::Confirmed
        } else {
            Reconciliation::Stale
        }
    }

    /// Drop the entry for a participant, e.g. after its write failed.
    pub fn forget(&mut self, room_id: &str, user_id: &str) {
        self.entries
            .remove(&(room_id.to_string(), user_id.to_string()));
    }

    pub fn clear_room(&mut self, room_id: &str) {
        self.entries.retain(|(room, _), _| room != room_id);
    }

    pub fn is_pending(&self, room_id: &str, user_id: &str, now: Instant) -> bool {
        self.entries
            .get(&(room_id.to_string(), user_id.to_string()))
            .map_or(false, |entry| entry.expires_at > now)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn cleanup(&mut self, now: Instant) {
        self.entries.retain(|_, entry| entry.expires_at > now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use room_store::ParticipantRole;

    fn row(muted: bool, hand: bool) -> Participant {
        Participant {
            room_id: "r1".to_string(),
            user_id: "u1".to_string(),
            role: ParticipantRole::Speaker,
            is_muted: muted,
            is_hand_raised: hand,
            joined_at: Utc::now(),
        }
    }

    #[test]
    fn nothing_pending() {
        let mut ledger = PendingChanges::default();
        assert_eq!(
            ledger.reconcile(&row(false, false), Instant::now()),
            Reconciliation::NoPending
        );
    }

    #[test]
    fn matching_echo_confirms_and_clears() {
        let now = Instant::now();
        let mut ledger = PendingChanges::default();
        ledger.record("r1", "u1", &ParticipantPatch::muted(true), now);

        assert_eq!(ledger.reconcile(&row(true, false), now), Reconciliation::Confirmed);
        assert!(ledger.is_empty());
    }

    #[test]
    fn contradicting_echo_is_stale_and_kept() {
        let now = Instant::now();
        let mut ledger = PendingChanges::default();
        ledger.record("r1", "u1", &ParticipantPatch::muted(true), now);

        assert_eq!(ledger.reconcile(&row(false, false), now), Reconciliation::Stale);
        assert!(ledger.is_pending("r1", "u1", now));
        assert_eq!(ledger.reconcile(&row(true, false), now), Reconciliation::Confirmed);
    }

    #[test]
    fn records_merge_fields() {
        let now = Instant::now();
        let mut ledger = PendingChanges::default();
        ledger.record("r1", "u1", &ParticipantPatch::muted(true), now);
        ledger.record("r1", "u1", &ParticipantPatch::hand_raised(true), now);

        // Mute alone is not enough while the hand raise is outstanding
        assert_eq!(ledger.reconcile(&row(true, false), now), Reconciliation::Stale);
        assert_eq!(ledger.reconcile(&row(true, true), now), Reconciliation::Confirmed);
    }

    #[test]
    fn entries_expire() {
        let now = Instant::now();
        let mut ledger = PendingChanges::new(Duration::from_secs(10));
        ledger.record("r1", "u1", &ParticipantPatch::muted(true), now);

        let later = now + Duration::from_secs(11);
        assert!(!ledger.is_pending("r1", "u1", later));
        assert_eq!(ledger.reconcile(&row(false, false), later), Reconciliation::NoPending);
    }

    #[test]
    fn forget_and_clear_room() {
        let now = Instant::now();
        let mut ledger = PendingChanges::default();
        ledger.record("r1", "u1", &ParticipantPatch::muted(true), now);
        ledger.record("r1", "u2", &ParticipantPatch::muted(true), now);
        ledger.record("r2", "u1", &ParticipantPatch::muted(true), now);

        ledger.forget("r1", "u2");
        assert_eq!(ledger.len(), 2);
        ledger.clear_room("r1");
        assert_eq!(ledger.len(), 1);
        assert!(ledger.is_pending("r2", "u1", now));
    }
}
