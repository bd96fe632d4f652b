//! In-memory pub/sub hub: per-flow, per-topic fan-out of typed events.
//!
//! Broadcasting never blocks the caller. Each subscriber gets a bounded
//! buffer (10 events); a subscriber that falls behind loses events instead
//! of stalling the producer or its peers. There is no durable replay.

pub mod events;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use tokio::sync::mpsc;

pub use events::{BrowserEvent, FlowEvent, LogEvent, TaskEvent, TerminalInfo};

/// Bounded buffer per subscriber; the back-pressure policy is "drop".
pub const SUBSCRIBER_BUFFER: usize = 10;

struct Subscriber<T> {
    id: u64,
    tx: mpsc::Sender<T>,
}

struct TopicInner<T> {
    subscribers: RwLock<HashMap<i64, Vec<Subscriber<T>>>>,
    next_id: AtomicU64,
}

/// A single fan-out table mapping flow id to subscriber channels.
pub struct Topic<T> {
    inner: Arc<TopicInner<T>>,
}

impl<T> Clone for Topic<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Default for Topic<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Topic<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(TopicInner {
                subscribers: RwLock::new(HashMap::new()),
                next_id: AtomicU64::new(0),
            }),
        }
    }

    /// Register a subscriber for a flow. The receiver closes once the
    /// returned [`Subscription`] is dropped or explicitly unsubscribed.
    pub fn subscribe(&self, flow_id: i64) -> (mpsc::Receiver<T>, Subscription<T>) {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);

        let mut table = self.inner.subscribers.write().expect("hub lock poisoned");
        table.entry(flow_id).or_default().push(Subscriber { id, tx });

        (
            rx,
            Subscription {
                inner: Arc::clone(&self.inner),
                flow_id,
                id,
                active: true,
            },
        )
    }

    /// Number of live subscribers for a flow.
    pub fn subscriber_count(&self, flow_id: i64) -> usize {
        self.inner
            .subscribers
            .read()
            .expect("hub lock poisoned")
            .get(&flow_id)
            .map_or(0, Vec::len)
    }
}

impl<T: Clone> Topic<T> {
    /// Deliver an event to every subscriber of `flow_id`. Full buffers drop
    /// the event for that subscriber; no subscribers is a no-op.
    pub fn broadcast(&self, flow_id: i64, event: T) {
        let table = self.inner.subscribers.read().expect("hub lock poisoned");
        let Some(subscribers) = table.get(&flow_id) else {
            return;
        };
        for subscriber in subscribers {
            if subscriber.tx.try_send(event.clone()).is_err() {
                tracing::trace!(flow_id, "subscriber buffer full, event dropped");
            }
        }
    }
}

/// Handle that removes its subscriber from the topic. The transport layer
/// calls [`Subscription::unsubscribe`] when its consumer disconnects;
/// dropping the handle has the same effect.
pub struct Subscription<T> {
    inner: Arc<TopicInner<T>>,
    flow_id: i64,
    id: u64,
    active: bool,
}

impl<T> Subscription<T> {
    pub fn unsubscribe(mut self) {
        self.remove();
    }

    fn remove(&mut self) {
        if !self.active {
            return;
        }
        self.active = false;

        let mut table = self.inner.subscribers.write().expect("hub lock poisoned");
        if let Some(subscribers) = table.get_mut(&self.flow_id) {
            // Dropping the sender closes the subscriber's receiver.
            subscribers.retain(|s| s.id != self.id);
            if subscribers.is_empty() {
                table.remove(&self.flow_id);
            }
        }
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        self.remove();
    }
}

/// The five topic tables the engine broadcasts on.
pub struct Hub {
    pub task_added: Topic<TaskEvent>,
    pub task_updated: Topic<TaskEvent>,
    pub flow_updated: Topic<FlowEvent>,
    pub terminal_log_added: Topic<LogEvent>,
    pub browser_updated: Topic<BrowserEvent>,
}

impl Default for Hub {
    fn default() -> Self {
        Self::new()
    }
}

impl Hub {
    pub fn new() -> Self {
        Self {
            task_added: Topic::new(),
            task_updated: Topic::new(),
            flow_updated: Topic::new(),
            terminal_log_added: Topic::new(),
            browser_updated: Topic::new(),
        }
    }

    pub fn broadcast_task_added(&self, flow_id: i64, event: TaskEvent) {
        self.task_added.broadcast(flow_id, event);
    }

    pub fn broadcast_task_updated(&self, flow_id: i64, event: TaskEvent) {
        self.task_updated.broadcast(flow_id, event);
    }

    pub fn broadcast_flow_updated(&self, flow_id: i64, event: FlowEvent) {
        self.flow_updated.broadcast(flow_id, event);
    }

    pub fn broadcast_terminal_log(&self, flow_id: i64, event: LogEvent) {
        self.terminal_log_added.broadcast(flow_id, event);
    }

    pub fn broadcast_browser_updated(&self, flow_id: i64, event: BrowserEvent) {
        self.browser_updated.broadcast(flow_id, event);
    }
}
