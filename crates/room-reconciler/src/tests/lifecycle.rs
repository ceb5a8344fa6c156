//! Room creation, listing, deletion and loss of live updates.

use super::harness::{eventually, settle, Fixture, MediaCall};
use crate::error::ReconcilerError;
use crate::notice::Notice;
use room_config_and_utils::SessionHandle;
use room_realtime::RealtimeEvent;
use room_store::{RoomPatch, RoomStore};

#[tokio::test]
async fn create_room_validates_input() {
    let fx = Fixture::new();
    let alice = fx.client("alice");

    let err = alice.reconciler.create_room("   ", None, None, 10).await.unwrap_err();
    assert!(matches!(err, ReconcilerError::InvalidRoom(_)));
    let err = alice.reconciler.create_room("Talk", None, None, 0).await.unwrap_err();
    assert!(matches!(err, ReconcilerError::InvalidRoom(_)));
    assert_eq!(fx.memory().call_count("create_room"), 0);

    let anon = fx.client_with_session("anon", SessionHandle::new());
    let err = anon.reconciler.create_room("Talk", None, None, 10).await.unwrap_err();
    assert!(matches!(err, ReconcilerError::NotSignedIn));
}

#[tokio::test]
async fn creator_hosts_but_has_not_joined() {
    let fx = Fixture::new();
    let alice = fx.client("alice");

    let room = alice
        .reconciler
        .create_room(" Rust evening ", Some("ownership chat"), Some("rust"), 25)
        .await
        .unwrap();

    assert_eq!(room.title, "Rust evening");
    assert_eq!(room.host_id, "alice");
    assert_eq!(room.capacity, 25);
    assert!(room.is_active);
    assert_eq!(room.topic.as_deref(), Some("rust"));
    assert!(alice.reconciler.snapshot().is_none());
    assert!(fx.memory().participants(&room.id).is_empty());

    let local = alice.reconciler.join(&room.id).await.unwrap();
    assert!(local.is_host());
}

#[tokio::test]
async fn list_rooms_shows_active_rooms_newest_first() {
    let fx = Fixture::new();
    let mut closed = fx.seed_room("old", "carol", 10);
    closed.is_active = false;
    fx.memory().seed_room(closed);
    let alice = fx.client("alice");

    let first = alice.reconciler.create_room("First", None, None, 10).await.unwrap();
    let second = alice.reconciler.create_room("Second", None, None, 10).await.unwrap();

    let ids: Vec<String> = alice
        .reconciler
        .list_rooms()
        .await
        .unwrap()
        .into_iter()
        .map(|room| room.id)
        .collect();
    assert_eq!(ids, vec![second.id, first.id]);
}

#[tokio::test]
async fn host_deletes_room_and_members_are_told() {
    let fx = Fixture::new();
    fx.seed_room("r1", "alice", 10);
    let mut alice = fx.client("alice");
    let mut bob = fx.client("bob");
    alice.reconciler.join("r1").await.unwrap();
    bob.reconciler.join("r1").await.unwrap();

    alice.reconciler.delete_room().await.unwrap();

    assert!(fx.memory().room("r1").is_none());
    assert!(fx.memory().participants("r1").is_empty());
    assert!(alice.reconciler.snapshot().is_none());
    assert_eq!(alice.media.calls().last(), Some(&MediaCall::Leave));

    eventually("bob leaves the closed room", || bob.reconciler.snapshot().is_none()).await;
    settle().await;
    let bob_notices = bob.notices();
    assert!(bob_notices.contains(&Notice::RoomClosed { room_id: "r1".to_string() }));
    assert!(!bob_notices
        .iter()
        .any(|n| matches!(n, Notice::Removed { .. })));
    assert_eq!(bob.media.calls().last(), Some(&MediaCall::Leave));

    // The host's own deletion is not reported back as a removal.
    let alice_notices = alice.notices();
    assert!(!alice_notices
        .iter()
        .any(|n| matches!(n, Notice::Removed { .. } | Notice::RoomClosed { .. })));
}

#[tokio::test]
async fn only_the_host_deletes() {
    let fx = Fixture::new();
    fx.seed_room("r1", "alice", 10);
    let bob = fx.client("bob");

    let err = bob.reconciler.delete_room().await.unwrap_err();
    assert!(matches!(err, ReconcilerError::NotJoined));

    bob.reconciler.join("r1").await.unwrap();
    let err = bob.reconciler.delete_room().await.unwrap_err();
    assert!(matches!(err, ReconcilerError::NotHost));
    assert!(fx.memory().room("r1").unwrap().is_active);
}

#[tokio::test]
async fn failed_delete_keeps_the_host_joined() {
    let fx = Fixture::new();
    fx.seed_room("r1", "alice", 10);
    let mut alice = fx.client("alice");
    alice.reconciler.join("r1").await.unwrap();
    fx.memory().fail_next("update_room");

    let err = alice.reconciler.delete_room().await.unwrap_err();

    assert!(err.is_transient());
    assert!(fx.memory().room("r1").unwrap().is_active);
    assert!(alice.reconciler.snapshot().unwrap().is_host());
    assert!(alice
        .notices()
        .iter()
        .any(|n| matches!(n, Notice::ActionFailed { action: "delete room", .. })));

    // Events for the room are handled normally again.
    alice.reconciler.set_self_mute(true).await.unwrap();
    assert!(alice.reconciler.snapshot().unwrap().is_muted);
}

#[tokio::test]
async fn room_closed_elsewhere_evicts_members() {
    let fx = Fixture::new();
    fx.seed_room("r1", "alice", 10);
    let mut bob = fx.client("bob");
    bob.reconciler.join("r1").await.unwrap();

    fx.store.update_room("r1", &RoomPatch::deactivate()).await.unwrap();

    eventually("bob evicted", || bob.reconciler.snapshot().is_none()).await;
    settle().await;
    assert!(bob
        .notices()
        .contains(&Notice::RoomClosed { room_id: "r1".to_string() }));
    assert_eq!(bob.media.calls().last(), Some(&MediaCall::Leave));
}

#[tokio::test]
async fn realtime_give_up_is_reported() {
    let fx = Fixture::new();
    fx.seed_room("r1", "alice", 10);
    let mut bob = fx.client("bob");
    bob.reconciler.join("r1").await.unwrap();

    fx.connection_event(RealtimeEvent::Disconnected(Some("socket closed".to_string())));
    fx.connection_event(RealtimeEvent::GaveUp { attempts: 10 });

    let mut seen = Vec::new();
    eventually("realtime loss notice", || {
        seen.extend(bob.notices());
        seen.iter()
            .any(|n| matches!(n, Notice::RealtimeUnavailable { .. }))
    })
    .await;
    // Membership itself is unaffected.
    assert!(bob.reconciler.snapshot().is_some());
}
