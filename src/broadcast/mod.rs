//! Event broadcaster — fans domain events out to subscribers filtered by
//! declared scope.
//!
//! Each subscription owns a bounded delivery queue. Delivery is best-effort
//! by design: when a queue is full the oldest pending event is dropped with
//! a recorded warning, because clients recover missed state by refetching on
//! reconnect. The publisher never blocks on a slow subscriber, and a problem
//! delivering to one subscriber never affects the others.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, RwLock};

use tokio::sync::Notify;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::errors::SyncError;
use crate::events::Event;

/// Default bound on each subscriber's outbound queue.
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

// ─── Delivery queue ──────────────────────────────────────────────────────────

/// Bounded single-consumer event queue. Push is non-blocking; on overflow the
/// oldest pending event is evicted.
pub struct DeliveryQueue {
    inner: Mutex<VecDeque<Event>>,
    notify: Notify,
    capacity: usize,
}

impl DeliveryQueue {
    fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity.min(64))),
            notify: Notify::new(),
            capacity,
        }
    }

    /// Enqueue one event. Returns `true` if the oldest pending event was
    /// dropped to make room.
    fn push(&self, event: Event) -> bool {
        let dropped = {
            let mut queue = self.inner.lock().unwrap_or_else(|p| p.into_inner());
            let dropped = if queue.len() >= self.capacity {
                queue.pop_front();
                true
            } else {
                false
            };
            queue.push_back(event);
            dropped
        };
        self.notify.notify_one();
        dropped
    }

    /// Pop the next pending event without waiting.
    pub fn try_pop(&self) -> Option<Event> {
        self.inner
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .pop_front()
    }

    /// Wait for and pop the next event.
    pub async fn recv(&self) -> Event {
        loop {
            if let Some(event) = self.try_pop() {
                return event;
            }
            self.notify.notified().await;
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ─── Broadcaster ─────────────────────────────────────────────────────────────

struct SubscriberEntry {
    scopes: HashSet<String>,
    queue: Arc<DeliveryQueue>,
}

/// Handle returned by [`EventBroadcaster::register`]. Owns the consumer side
/// of the delivery queue; the connection that created it is the only reader.
pub struct Subscription {
    id: Uuid,
    queue: Arc<DeliveryQueue>,
}

impl Subscription {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Wait for the next event delivered to this subscription.
    pub async fn recv(&self) -> Event {
        self.queue.recv().await
    }

    pub fn try_recv(&self) -> Option<Event> {
        self.queue.try_pop()
    }
}

/// Fans published events out to every registered subscription whose scope
/// set contains the event's scope.
pub struct EventBroadcaster {
    subscribers: RwLock<HashMap<Uuid, SubscriberEntry>>,
    queue_capacity: usize,
}

impl Default for EventBroadcaster {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY)
    }
}

impl EventBroadcaster {
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            subscribers: RwLock::new(HashMap::new()),
            queue_capacity: queue_capacity.max(1),
        }
    }

    /// Bind a new outbound queue to one or more scopes.
    /// An empty scope set is rejected.
    pub fn register(&self, scopes: &[String]) -> Result<Subscription, SyncError> {
        if scopes.is_empty() {
            return Err(SyncError::Validation(
                "subscription must declare at least one scope".to_string(),
            ));
        }
        let id = Uuid::new_v4();
        let queue = Arc::new(DeliveryQueue::new(self.queue_capacity));
        let entry = SubscriberEntry {
            scopes: scopes.iter().cloned().collect(),
            queue: queue.clone(),
        };
        self.subscribers
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .insert(id, entry);
        debug!(subscriber = %id, scopes = ?scopes, "subscriber registered");
        Ok(Subscription { id, queue })
    }

    /// Release a subscription's queue. Called on disconnect, timeout, or
    /// explicit close.
    pub fn unregister(&self, id: Uuid) {
        if self
            .subscribers
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&id)
            .is_some()
        {
            debug!(subscriber = %id, "subscriber unregistered");
        }
    }

    /// Enqueue `event` on every subscription whose scopes contain the
    /// event's scope. Non-blocking; never fails the publisher.
    pub fn publish(&self, event: &Event) {
        let subscribers = self.subscribers.read().unwrap_or_else(|p| p.into_inner());
        for (id, entry) in subscribers.iter() {
            if !entry.scopes.contains(&event.scope) {
                continue;
            }
            if entry.queue.push(event.clone()) {
                warn!(
                    subscriber = %id,
                    event_type = %event.event_type,
                    "subscriber queue full — dropped oldest pending event"
                );
            }
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .len()
    }
}
