//! The change-feed seam and subscription handles.

use crate::{ChangeEvent, ChangeFilter, RealtimeEvent, RealtimeResult};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};

/// Source of row-level change events.
#[async_trait]
pub trait ChangeFeed: Send + Sync {
    /// Start listening for changes matching `filter`. Events are delivered
    /// in order for this subscription; dropping the handle unsubscribes.
    async fn subscribe(&self, filter: ChangeFilter) -> RealtimeResult<Subscription>;

    /// Connection-level events, when the feed has a connection to report on.
    fn events(&self) -> Option<broadcast::Receiver<RealtimeEvent>> {
        None
    }
}

struct Release(Option<Box<dyn FnOnce() + Send>>);

impl Drop for Release {
    fn drop(&mut self) {
        if let Some(release) = self.0.take() {
            release();
        }
    }
}

/// A live subscription. Dropping it releases the underlying channel.
pub struct Subscription {
    topic: String,
    receiver: mpsc::UnboundedReceiver<ChangeEvent>,
    _release: Release,
}

impl Subscription {
    /// Wrap a receiver; `release` runs once when the subscription is dropped.
    pub fn new(
        topic: impl Into<String>,
        receiver: mpsc::UnboundedReceiver<ChangeEvent>,
        release: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            topic: topic.into(),
            receiver,
            _release: Release(Some(Box::new(release))),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Next event, or `None` once the feed has closed this subscription.
    pub async fn recv(&mut self) -> Option<ChangeEvent> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<ChangeEvent> {
        self.receiver.try_recv().ok()
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("topic", &self.topic)
            .finish()
    }
}

struct LocalEntry {
    topic: String,
    filter: ChangeFilter,
    sink: mpsc::UnboundedSender<ChangeEvent>,
}

#[derive(Default)]
struct LocalInner {
    entries: Mutex<Vec<LocalEntry>>,
    next_id: AtomicU64,
    released: AtomicU64,
}

/// In-process feed: events handed to [`LocalChangeFeed::publish`] reach
/// every live subscription whose filter matches.
#[derive(Clone, Default)]
pub struct LocalChangeFeed {
    inner: Arc<LocalInner>,
}

impl LocalChangeFeed {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver `event` to matching subscriptions. Returns how many got it.
    pub fn publish(&self, event: ChangeEvent) -> usize {
        let entries = self.inner.entries.lock();
        entries
            .iter()
            .filter(|entry| event.matches(&entry.filter))
            .filter(|entry| entry.sink.send(event.clone()).is_ok())
            .count()
    }

    /// Subscriptions still open.
    pub fn active_subscriptions(&self) -> usize {
        self.inner.entries.lock().len()
    }

    /// Subscriptions opened so far.
    pub fn opened(&self) -> u64 {
        self.inner.next_id.load(Ordering::SeqCst)
    }

    /// Subscriptions released so far.
    pub fn released(&self) -> u64 {
        self.inner.released.load(Ordering::SeqCst)
    }

    pub fn topics(&self) -> Vec<String> {
        self.inner
            .entries
            .lock()
            .iter()
            .map(|entry| entry.topic.clone())
            .collect()
    }
}

#[async_trait]
impl ChangeFeed for LocalChangeFeed {
    async fn subscribe(&self, filter: ChangeFilter) -> RealtimeResult<Subscription> {
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let topic = format!("local:{}-{}", filter.table, id);
        let (sink, receiver) = mpsc::unbounded_channel();
        self.inner.entries.lock().push(LocalEntry {
            topic: topic.clone(),
            filter,
            sink,
        });

        let inner = Arc::clone(&self.inner);
        let release_topic = topic.clone();
        Ok(Subscription::new(topic, receiver, move || {
            inner
                .entries
                .lock()
                .retain(|entry| entry.topic != release_topic);
            inner.released.fetch_add(1, Ordering::SeqCst);
        }))
    }
}
