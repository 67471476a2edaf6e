//! Live Event Broadcaster: publish/subscribe over typed events with a
//! bounded, drop-oldest buffer per subscriber.
//!
//! Grounded on `watcher/registry.rs`'s `parking_lot::RwLock<HashMap<...>>`
//! registry for the subscriber set, and `api/ws/chat/connection.rs`'s
//! per-connection queue for the buffer shape. `tokio::sync::broadcast`
//! isn't used anywhere in the corpus; a registry of per-subscriber queues
//! is the idiom this codebase reaches for instead, and it's the only way
//! to get newest-wins drop semantics per subscriber rather than one global
//! lag counter.

use crate::model::{Observation, Summary, UserPrompt};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

#[derive(Debug, Clone, Serialize)]
pub struct TokenSummarySnapshot {
    pub total_observations: i64,
    pub total_read_tokens: i64,
    pub total_discovery_tokens: i64,
    pub savings: i64,
    pub savings_percent: i64,
    pub efficiency_gain: f64,
    pub avg_read_tokens_per_obs: i64,
    pub avg_discovery_tokens_per_obs: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
#[allow(clippy::large_enum_variant)]
pub enum LiveEvent {
    InitialLoad { snapshot: serde_json::Value },
    NewObservation { observation: Observation },
    NewSummary { summary: Summary },
    NewPrompt { prompt: UserPrompt },
    ProcessingStatus { is_processing: bool, queue_depth: i64 },
    TokenUpdate { tokens: TokenSummarySnapshot, timestamp: i64 },
}

const DEFAULT_SUBSCRIBER_CAPACITY: usize = 256;

struct SubscriberQueue {
    queue: Mutex<VecDeque<LiveEvent>>,
    notify: Notify,
    capacity: usize,
}

impl SubscriberQueue {
    fn new(capacity: usize) -> Self {
        Self {
            queue: Mutex::new(VecDeque::with_capacity(capacity.min(64))),
            notify: Notify::new(),
            capacity,
        }
    }

    fn push(&self, event: LiveEvent) {
        let mut queue = self.queue.lock();
        if queue.len() >= self.capacity {
            queue.pop_front();
        }
        queue.push_back(event);
        drop(queue);
        self.notify.notify_waiters();
    }
}

/// Per-subscriber handle returned by [`Broadcaster::subscribe`]. Drop it
/// (or call [`Subscription::unsubscribe`]) to stop receiving events.
pub struct Subscription {
    id: u64,
    queue: Arc<SubscriberQueue>,
    broadcaster: Arc<BroadcasterInner>,
}

impl Subscription {
    /// Waits for and returns the next event, or all events queued since
    /// the last call, whichever is ready first.
    pub async fn recv(&self) -> LiveEvent {
        loop {
            {
                let mut queue = self.queue.queue.lock();
                if let Some(event) = queue.pop_front() {
                    return event;
                }
            }
            self.queue.notify.notified().await;
        }
    }

    pub fn unsubscribe(self) {
        self.broadcaster.subscribers.write().remove(&self.id);
    }
}

struct BroadcasterInner {
    subscribers: RwLock<HashMap<u64, Arc<SubscriberQueue>>>,
    next_id: AtomicU64,
}

#[derive(Clone)]
pub struct Broadcaster {
    inner: Arc<BroadcasterInner>,
}

impl Broadcaster {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BroadcasterInner {
                subscribers: RwLock::new(HashMap::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn subscribe(&self) -> Subscription {
        self.subscribe_with_capacity(DEFAULT_SUBSCRIBER_CAPACITY)
    }

    pub fn subscribe_with_capacity(&self, capacity: usize) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let queue = Arc::new(SubscriberQueue::new(capacity));
        self.inner.subscribers.write().insert(id, queue.clone());
        Subscription {
            id,
            queue,
            broadcaster: self.inner.clone(),
        }
    }

    /// Non-blocking: pushes onto every subscriber's queue, dropping the
    /// oldest entry for any subscriber that is already at capacity.
    pub fn publish(&self, event: LiveEvent) {
        let subscribers = self.inner.subscribers.read();
        for queue in subscribers.values() {
            queue.push(event.clone());
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.read().len()
    }
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscriber_receives_published_event() {
        let broadcaster = Broadcaster::new();
        let sub = broadcaster.subscribe();
        broadcaster.publish(LiveEvent::ProcessingStatus {
            is_processing: true,
            queue_depth: 3,
        });
        let event = sub.recv().await;
        match event {
            LiveEvent::ProcessingStatus { queue_depth, .. } => assert_eq!(queue_depth, 3),
            _ => panic!("wrong variant"),
        }
    }

    #[tokio::test]
    async fn overflow_drops_oldest_not_newest() {
        let broadcaster = Broadcaster::new();
        let sub = broadcaster.subscribe_with_capacity(2);
        for depth in 0..5i64 {
            broadcaster.publish(LiveEvent::ProcessingStatus {
                is_processing: true,
                queue_depth: depth,
            });
        }
        let first = sub.recv().await;
        let second = sub.recv().await;
        let depths: Vec<i64> = [first, second]
            .into_iter()
            .map(|e| match e {
                LiveEvent::ProcessingStatus { queue_depth, .. } => queue_depth,
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(depths, vec![3, 4]);
    }

    #[tokio::test]
    async fn unsubscribed_subscriber_no_longer_counted() {
        let broadcaster = Broadcaster::new();
        let sub = broadcaster.subscribe();
        assert_eq!(broadcaster.subscriber_count(), 1);
        sub.unsubscribe();
        assert_eq!(broadcaster.subscriber_count(), 0);
    }
}
