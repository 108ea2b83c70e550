// Knowledge bus
// In-process, topic-based pub/sub between agents. Topics are hierarchical
// strings; subscriptions may end in `*` to match a prefix. Publishing is
// synchronous and never blocks: each subscriber owns a bounded queue, and
// under backpressure events carrying the same coalescing key replace their
// queued predecessor, otherwise the oldest queued event is dropped. A slow
// subscriber therefore only ever loses its own events.

use parking_lot::{Mutex, RwLock};
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::trace;

use crate::graph_store::WriteStats;
use crate::observability::{record, Counter};
use crate::parsing::ExtractionResult;
use crate::types::{EntityId, FileId};

/// Well-known topics.
pub mod topics {
    pub const PARSE_COMPLETE: &str = "parse:complete";
    pub const PARSE_FAILED: &str = "parse:failed";
    pub const FILE_REMOVED: &str = "file:removed";
    pub const INDEX_COMPLETE: &str = "index:complete";
    pub const EMBEDDING_FAILED: &str = "embedding:failed";
    pub const RESOURCE_WARNING: &str = "resource:warning";
    pub const CACHE_EVICT: &str = "cache:evict";
    pub const TELEMETRY: &str = "telemetry:event";
}

/// One notification on the bus.
#[derive(Debug, Clone)]
pub struct BusEvent {
    pub topic: &'static str,
    /// Coalescing key; repeated events with the same key may collapse under
    /// backpressure. Usually the file path.
    pub key: Option<String>,
    pub payload: BusPayload,
}

#[derive(Debug, Clone)]
pub enum BusPayload {
    ParseComplete {
        result: Arc<ExtractionResult>,
        from_cache: bool,
    },
    ParseFailed {
        path: PathBuf,
        reason: String,
    },
    FileRemoved {
        path: PathBuf,
    },
    IndexComplete {
        path: PathBuf,
        file_id: FileId,
        entity_ids: Vec<EntityId>,
        removed_ids: Vec<EntityId>,
        stats: WriteStats,
    },
    EmbeddingFailed {
        entity_id: EntityId,
        reason: String,
    },
    ResourceWarning {
        message: String,
    },
    CacheEvict {
        fraction: f64,
    },
    Telemetry {
        name: &'static str,
        value: u64,
    },
}

struct SubscriberInner {
    patterns: Vec<String>,
    queue: Mutex<VecDeque<BusEvent>>,
    capacity: usize,
    notify: Notify,
    closed: AtomicBool,
}

impl SubscriberInner {
    /// Enqueue without ever blocking the publisher.
    fn offer(&self, event: BusEvent) {
        let mut queue = self.queue.lock();
        if queue.len() >= self.capacity {
            if let Some(key) = &event.key {
                if let Some(pos) = queue
                    .iter()
                    .position(|e| e.topic == event.topic && e.key.as_deref() == Some(key.as_str()))
                {
                    queue[pos] = event;
                    record(Counter::BusEventsCoalesced);
                    drop(queue);
                    self.notify.notify_one();
                    return;
                }
            }
            queue.pop_front();
            record(Counter::BusEventsDropped);
        }
        queue.push_back(event);
        drop(queue);
        self.notify.notify_one();
    }

    fn matches(&self, topic: &str) -> bool {
        self.patterns.iter().any(|pattern| {
            if let Some(prefix) = pattern.strip_suffix('*') {
                topic.starts_with(prefix)
            } else {
                pattern == topic
            }
        })
    }
}

/// Receiving end of a subscription. Dropping it detaches from the bus.
pub struct BusSubscriber {
    inner: Arc<SubscriberInner>,
}

impl BusSubscriber {
    /// Wait for the next event. Returns `None` once the bus has shut down
    /// and the queue is drained.
    pub async fn recv(&self) -> Option<BusEvent> {
        loop {
            if let Some(event) = self.inner.queue.lock().pop_front() {
                return Some(event);
            }
            if self.inner.closed.load(Ordering::Acquire) {
                return None;
            }
            self.inner.notify.notified().await;
        }
    }

    /// Non-blocking poll.
    pub fn try_recv(&self) -> Option<BusEvent> {
        self.inner.queue.lock().pop_front()
    }

    pub fn pending(&self) -> usize {
        self.inner.queue.lock().len()
    }
}

impl Drop for BusSubscriber {
    fn drop(&mut self) {
        self.inner.closed.store(true, Ordering::Release);
    }
}

/// Process-wide pub/sub hub. Created at startup, shut down once.
pub struct KnowledgeBus {
    subscribers: RwLock<Vec<Arc<SubscriberInner>>>,
    default_capacity: usize,
}

impl KnowledgeBus {
    pub fn new(default_capacity: usize) -> Self {
        Self {
            subscribers: RwLock::new(Vec::new()),
            default_capacity,
        }
    }

    /// Register a subscriber for one or more topic patterns.
    pub fn subscribe(&self, patterns: &[&str]) -> BusSubscriber {
        self.subscribe_with_capacity(patterns, self.default_capacity)
    }

    pub fn subscribe_with_capacity(&self, patterns: &[&str], capacity: usize) -> BusSubscriber {
        let inner = Arc::new(SubscriberInner {
            patterns: patterns.iter().map(|p| p.to_string()).collect(),
            queue: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
        });
        self.subscribers.write().push(Arc::clone(&inner));
        BusSubscriber { inner }
    }

    /// Deliver an event to every matching subscriber. Never blocks; returns
    /// the number of queues the event landed in.
    pub fn publish(&self, event: BusEvent) -> usize {
        record(Counter::BusEventsPublished);
        let mut delivered = 0usize;
        let mut saw_closed = false;
        {
            let subscribers = self.subscribers.read();
            for subscriber in subscribers.iter() {
                if subscriber.closed.load(Ordering::Acquire) {
                    saw_closed = true;
                    continue;
                }
                if subscriber.matches(event.topic) {
                    subscriber.offer(event.clone());
                    delivered += 1;
                }
            }
        }
        if saw_closed {
            self.subscribers
                .write()
                .retain(|s| !s.closed.load(Ordering::Acquire));
        }
        trace!(topic = event.topic, delivered, "bus publish");
        delivered
    }

    /// Wake every subscriber with a closed signal.
    pub fn shutdown(&self) {
        let subscribers = self.subscribers.read();
        for subscriber in subscribers.iter() {
            subscriber.closed.store(true, Ordering::Release);
            subscriber.notify.notify_one();
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn telemetry(key: &str, value: u64) -> BusEvent {
        BusEvent {
            topic: topics::TELEMETRY,
            key: Some(key.to_string()),
            payload: BusPayload::Telemetry {
                name: "test",
                value,
            },
        }
    }

    #[tokio::test]
    async fn publish_reaches_matching_subscribers() {
        let bus = KnowledgeBus::new(16);
        let parse_sub = bus.subscribe(&[topics::PARSE_COMPLETE]);
        let wildcard_sub = bus.subscribe(&["parse:*"]);
        let other_sub = bus.subscribe(&[topics::INDEX_COMPLETE]);

        let delivered = bus.publish(BusEvent {
            topic: topics::PARSE_COMPLETE,
            key: None,
            payload: BusPayload::ParseFailed {
                path: PathBuf::from("x.py"),
                reason: "test".into(),
            },
        });

        assert_eq!(delivered, 2);
        assert!(parse_sub.try_recv().is_some());
        assert!(wildcard_sub.try_recv().is_some());
        assert!(other_sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn backpressure_coalesces_same_key() {
        let bus = KnowledgeBus::new(16);
        let sub = bus.subscribe_with_capacity(&[topics::TELEMETRY], 2);

        bus.publish(telemetry("a", 1));
        bus.publish(telemetry("b", 2));
        // Queue is full; same-key event replaces the queued one.
        bus.publish(telemetry("a", 3));

        assert_eq!(sub.pending(), 2);
        let first = sub.try_recv().expect("first event");
        match first.payload {
            BusPayload::Telemetry { value, .. } => assert_eq!(value, 3),
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[tokio::test]
    async fn backpressure_drops_oldest_without_blocking() {
        let bus = KnowledgeBus::new(16);
        let sub = bus.subscribe_with_capacity(&[topics::TELEMETRY], 2);

        bus.publish(telemetry("a", 1));
        bus.publish(telemetry("b", 2));
        bus.publish(telemetry("c", 3));

        assert_eq!(sub.pending(), 2);
        let keys: Vec<Option<String>> = std::iter::from_fn(|| sub.try_recv())
            .map(|e| e.key)
            .collect();
        assert_eq!(
            keys,
            vec![Some("b".to_string()), Some("c".to_string())],
            "oldest event dropped"
        );
    }

    #[tokio::test]
    async fn recv_waits_for_events() {
        let bus = Arc::new(KnowledgeBus::new(16));
        let sub = bus.subscribe(&[topics::TELEMETRY]);

        let publisher = {
            let bus = Arc::clone(&bus);
            tokio::spawn(async move {
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                bus.publish(telemetry("later", 9));
            })
        };

        let event = sub.recv().await.expect("event arrives");
        assert_eq!(event.key.as_deref(), Some("later"));
        publisher.await.expect("publisher task");
    }

    #[tokio::test]
    async fn shutdown_unblocks_receivers() {
        let bus = Arc::new(KnowledgeBus::new(16));
        let sub = bus.subscribe(&[topics::TELEMETRY]);

        let receiver = tokio::spawn(async move { sub.recv().await });
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        bus.shutdown();

        let result = receiver.await.expect("receiver task");
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn dropped_subscribers_are_pruned() {
        let bus = KnowledgeBus::new(16);
        let sub = bus.subscribe(&[topics::TELEMETRY]);
        assert_eq!(bus.subscriber_count(), 1);
        drop(sub);
        bus.publish(telemetry("x", 1));
        assert_eq!(bus.subscriber_count(), 0);
    }
}
