//! Long-poll fan-out of newly arrived attributes.
//!
//! Every watcher id owns an independent queue. `publish` copies an attribute
//! into every live queue; `poll` drains one queue, waiting for the next
//! publish when the queue is empty. Waiting uses a per-queue [`Notify`], so
//! publishers wake pollers directly.

use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use telemetry::metrics;
use tokio::sync::Notify;
use tracing::{debug, trace};

use crate::attribute::Attribute;
use crate::limits::DEFAULT_WATCH_QUEUE_CAPACITY;

/// Fan-out configuration.
#[derive(Debug, Clone)]
pub struct FanoutConfig {
    /// Items held per watcher before the oldest are dropped.
    pub queue_capacity: usize,
}

impl Default for FanoutConfig {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_WATCH_QUEUE_CAPACITY,
        }
    }
}

/// Pending attributes for one watcher.
#[derive(Debug)]
struct WatchQueue {
    items: Mutex<QueueState>,
    notify: Notify,
    dropped: AtomicU64,
    /// Polls currently waiting on this queue
    waiting: AtomicUsize,
}

#[derive(Debug)]
struct QueueState {
    items: VecDeque<Attribute>,
    last_polled: Instant,
}

impl WatchQueue {
    fn new() -> Self {
        Self {
            items: Mutex::new(QueueState {
                items: VecDeque::new(),
                last_polled: Instant::now(),
            }),
            notify: Notify::new(),
            dropped: AtomicU64::new(0),
            waiting: AtomicUsize::new(0),
        }
    }

    fn push(&self, attribute: Attribute, capacity: usize) {
        {
            let mut state = self.items.lock();
            state.items.push_back(attribute);
            while state.items.len() > capacity {
                state.items.pop_front();
                self.dropped.fetch_add(1, Ordering::Relaxed);
                metrics().watch_items_dropped.inc();
            }
        }
        self.notify.notify_one();
    }

    /// Take everything queued, or `None` when empty.
    fn drain(&self) -> Option<Vec<Attribute>> {
        let mut state = self.items.lock();
        state.last_polled = Instant::now();
        if state.items.is_empty() {
            return None;
        }
        Some(state.items.drain(..).collect())
    }

    fn touch(&self) {
        self.items.lock().last_polled = Instant::now();
    }

    fn is_waited_on(&self) -> bool {
        self.waiting.load(Ordering::Acquire) > 0
    }
}

/// Marks a queue as being polled until dropped, including on cancellation.
struct PollGuard<'a> {
    queue: &'a WatchQueue,
}

impl<'a> PollGuard<'a> {
    fn new(queue: &'a WatchQueue) -> Self {
        queue.waiting.fetch_add(1, Ordering::AcqRel);
        Self { queue }
    }
}

impl Drop for PollGuard<'_> {
    fn drop(&mut self) {
        self.queue.touch();
        self.queue.waiting.fetch_sub(1, Ordering::AcqRel);
    }
}

#[derive(Debug)]
struct FanoutInner {
    config: FanoutConfig,
    queues: RwLock<HashMap<String, Arc<WatchQueue>>>,
}

/// Broadcast queues drained by long-poll requests.
///
/// Cloning is cheap; clones share the same queues.
#[derive(Debug, Clone)]
pub struct WatchFanout {
    inner: Arc<FanoutInner>,
}

impl Default for WatchFanout {
    fn default() -> Self {
        Self::new(FanoutConfig::default())
    }
}

impl WatchFanout {
    pub fn new(config: FanoutConfig) -> Self {
        Self {
            inner: Arc::new(FanoutInner {
                config: FanoutConfig {
                    queue_capacity: config.queue_capacity.max(1),
                },
                queues: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Ensure a queue exists for `watch_id`. Idempotent.
    pub fn subscribe(&self, watch_id: &str) {
        self.queue(watch_id);
    }

    /// Remove a watcher and everything queued for it.
    pub fn unsubscribe(&self, watch_id: &str) -> bool {
        let removed = self.inner.queues.write().remove(watch_id).is_some();
        if removed {
            metrics().active_watchers.dec();
        }
        removed
    }

    /// Copy `attribute` into every live queue. Never waits on pollers.
    pub fn publish(&self, attribute: Attribute) {
        let queues: Vec<Arc<WatchQueue>> = self.inner.queues.read().values().cloned().collect();
        metrics().attributes_published.inc();

        trace!(watchers = queues.len(), "Publishing attribute");

        let capacity = self.inner.config.queue_capacity;
        for queue in queues {
            queue.push(attribute.clone(), capacity);
        }
    }

    /// Publish several attributes in order.
    pub fn publish_all(&self, attributes: impl IntoIterator<Item = Attribute>) {
        for attribute in attributes {
            self.publish(attribute);
        }
    }

    /// Long-poll for `watch_id`.
    ///
    /// Returns everything queued as soon as the queue is non-empty, or an
    /// empty vector once `max_wait` elapses. Dropping the returned future
    /// leaves the queue untouched for the next poll.
    pub async fn poll(&self, watch_id: &str, max_wait: Duration) -> Vec<Attribute> {
        let queue = self.queue(watch_id);
        let _polling = PollGuard::new(&queue);
        let deadline = tokio::time::Instant::now() + max_wait;
        metrics().watch_polls.inc();

        loop {
            let notified = queue.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(items) = queue.drain() {
                debug!(watch_id = %watch_id, count = items.len(), "Sending to watcher");
                return items;
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                metrics().watch_timeouts.inc();
                let items = queue.drain().unwrap_or_default();
                debug!(watch_id = %watch_id, count = items.len(), "Watch timed out");
                return items;
            }
        }
    }

    /// Drop watchers that have not polled within `max_idle`. Queues with a
    /// poll in progress are kept.
    pub fn evict_idle(&self, max_idle: Duration) -> usize {
        let now = Instant::now();
        let mut queues = self.inner.queues.write();
        let before = queues.len();
        queues.retain(|watch_id, queue| {
            let keep = queue.is_waited_on()
                || now.duration_since(queue.items.lock().last_polled) < max_idle;
            if !keep {
                debug!(watch_id = %watch_id, "Evicting idle watcher");
            }
            keep
        });
        let evicted = before - queues.len();
        for _ in 0..evicted {
            metrics().active_watchers.dec();
        }
        evicted
    }

    pub fn watcher_count(&self) -> usize {
        self.inner.queues.read().len()
    }

    /// Items currently queued for `watch_id`, `None` if not subscribed.
    pub fn queue_len(&self, watch_id: &str) -> Option<usize> {
        self.inner
            .queues
            .read()
            .get(watch_id)
            .map(|q| q.items.lock().items.len())
    }

    /// Items dropped from `watch_id`'s queue by overflow.
    pub fn dropped(&self, watch_id: &str) -> u64 {
        self.inner
            .queues
            .read()
            .get(watch_id)
            .map(|q| q.dropped.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    fn queue(&self, watch_id: &str) -> Arc<WatchQueue> {
        if let Some(queue) = self.inner.queues.read().get(watch_id) {
            queue.touch();
            return queue.clone();
        }

        let mut queues = self.inner.queues.write();
        queues
            .entry(watch_id.to_string())
            .or_insert_with(|| {
                debug!(watch_id = %watch_id, "New watcher");
                metrics().active_watchers.inc();
                Arc::new(WatchQueue::new())
            })
            .clone()
    }
}
