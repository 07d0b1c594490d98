//! # Change notifier
//!
//! Best-effort fan-out of [`TallyDelta`]s to live result viewers.
//!
//! - One bounded broadcast channel per poll, created by the first
//!   subscriber and dropped with the last one
//! - Publishing never blocks and never fails the vote that triggered it
//! - A subscriber that falls behind gets [`NotifierEvent::Resync`] and is
//!   expected to re-read the tallies
//! - Deltas carry absolute counts, so duplicates and reordering are harmless
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
};

use futures::{stream, Stream};
use serde::Serialize;
use tokio::sync::{
    broadcast::{self, error::RecvError},
    Notify,
};
use tracing::debug;
use uuid::Uuid;

use crate::models::TallyDelta;

pub const DEFAULT_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct SubscriptionId(u64);

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum NotifierEvent {
    Tally(TallyDelta),
    Resync { missed: u64 },
}

struct PollChannel {
    sender: broadcast::Sender<TallyDelta>,
    subscribers: HashMap<SubscriptionId, Arc<Notify>>,
}

struct Inner {
    capacity: usize,
    next_id: AtomicU64,
    sequence: AtomicU64,
    channels: Mutex<HashMap<Uuid, PollChannel>>,
}

impl Inner {
    fn channels(&self) -> MutexGuard<'_, HashMap<Uuid, PollChannel>> {
        self.channels.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn release(&self, poll_id: Uuid, id: SubscriptionId) {
        let mut channels = self.channels();
        let Some(channel) = channels.get_mut(&poll_id) else {
            return;
        };

        if let Some(cancel) = channel.subscribers.remove(&id) {
            cancel.notify_one();
            debug!(%poll_id, subscription = id.0, "Unsubscribed");
        }
        if channel.subscribers.is_empty() {
            channels.remove(&poll_id);
        }
    }
}

#[derive(Clone)]
pub struct ChangeNotifier {
    inner: Arc<Inner>,
}

impl Default for ChangeNotifier {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl ChangeNotifier {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                capacity: capacity.max(1),
                next_id: AtomicU64::new(1),
                sequence: AtomicU64::new(1),
                channels: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn subscribe(&self, poll_id: Uuid) -> Subscription {
        let id = SubscriptionId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let cancelled = Arc::new(Notify::new());

        let mut channels = self.inner.channels();
        let channel = channels.entry(poll_id).or_insert_with(|| PollChannel {
            sender: broadcast::channel(self.inner.capacity).0,
            subscribers: HashMap::new(),
        });
        channel.subscribers.insert(id, cancelled.clone());
        let receiver = channel.sender.subscribe();
        drop(channels);

        debug!(%poll_id, subscription = id.0, "Subscribed");

        Subscription {
            id,
            poll_id,
            receiver,
            cancelled,
            finished: false,
            inner: self.inner.clone(),
        }
    }

    /// Idempotent; also safe after the poll was closed.
    pub fn unsubscribe(&self, subscription: &Subscription) {
        self.inner.release(subscription.poll_id, subscription.id);
    }

    /// Stamps a sequence number and hands the delta to every live
    /// subscriber. Returns how many received it.
    pub fn publish(&self, mut delta: TallyDelta) -> usize {
        let channels = self.inner.channels();
        let Some(channel) = channels.get(&delta.poll_id) else {
            return 0;
        };

        delta.sequence = self.inner.sequence.fetch_add(1, Ordering::Relaxed);
        channel.sender.send(delta).unwrap_or(0)
    }

    /// Ends every stream of a poll, used when the poll is deleted.
    pub fn close(&self, poll_id: Uuid) {
        if let Some(channel) = self.inner.channels().remove(&poll_id) {
            for cancel in channel.subscribers.values() {
                cancel.notify_one();
            }
            debug!(%poll_id, subscribers = channel.subscribers.len(), "Closed poll channel");
        }
    }

    pub fn subscriber_count(&self, poll_id: Uuid) -> usize {
        self.inner
            .channels()
            .get(&poll_id)
            .map_or(0, |channel| channel.subscribers.len())
    }
}

/// A live registration on one poll. Dropping it unsubscribes.
pub struct Subscription {
    id: SubscriptionId,
    poll_id: Uuid,
    receiver: broadcast::Receiver<TallyDelta>,
    cancelled: Arc<Notify>,
    finished: bool,
    inner: Arc<Inner>,
}

impl Subscription {
    /// Next event, or `None` once unsubscribed or the poll is closed.
    pub async fn recv(&mut self) -> Option<NotifierEvent> {
        if self.finished {
            return None;
        }

        let event = tokio::select! {
            biased;
            _ = self.cancelled.notified() => None,
            received = self.receiver.recv() => match received {
                Ok(delta) => Some(NotifierEvent::Tally(delta)),
                Err(RecvError::Lagged(missed)) => Some(NotifierEvent::Resync { missed }),
                Err(RecvError::Closed) => None,
            },
        };

        self.finished = event.is_none();
        event
    }

    pub fn into_stream(self) -> impl Stream<Item = NotifierEvent> + Send + 'static {
        stream::unfold(self, |mut subscription| async move {
            subscription.recv().await.map(|event| (event, subscription))
        })
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.inner.release(self.poll_id, self.id);
    }
}
