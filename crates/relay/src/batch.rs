//! Per-session batch accumulation and flush policy.
//!
//! Each session accumulates attributes until either `max_count` is reached
//! (count trigger) or `timeout` elapses after the first buffered attribute
//! (timer trigger). A flush snapshots and clears the batch under the session
//! lock and stages the snapshot in the session's outbox. One drain task per
//! session uploads staged snapshots in order, so a session never has two
//! uploads in flight and enqueue never waits on the network.
//!
//! Timers are identified by a generation number. The trigger that flushes
//! clears the armed generation while holding the session lock; a timer that
//! wakes with a stale generation does nothing.

use engine_core::limits::{DEFAULT_BATCH_MAX, DEFAULT_BATCH_TIMEOUT_MS, DEFAULT_RETRY_BACKOFF_MS};
use engine_core::{Attribute, UploadBatch, WatchFanout};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use telemetry::metrics;
use tokio::sync::Notify;
use tokio::task::AbortHandle;
use tracing::{debug, error, info, trace, warn};

use crate::uploader::Uploader;
use crate::upstream::Handshaker;

/// Batch flush policy.
#[derive(Debug, Clone)]
pub struct BatchConfig {
    /// Batch length that forces an immediate flush
    pub max_count: usize,
    /// Maximum time a partial batch waits
    pub timeout: Duration,
    /// Delay between retries while the upstream is unknown
    pub retry_backoff: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_count: DEFAULT_BATCH_MAX,
            timeout: Duration::from_millis(DEFAULT_BATCH_TIMEOUT_MS),
            retry_backoff: Duration::from_millis(DEFAULT_RETRY_BACKOFF_MS),
        }
    }
}

/// Why a batch was flushed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushTrigger {
    Count,
    Timeout,
    Shutdown,
}

impl FlushTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Count => "count",
            Self::Timeout => "timeout",
            Self::Shutdown => "shutdown",
        }
    }
}

/// Result of [`SessionBatcher::enqueue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// Attribute is waiting in the pending batch.
    Buffered,
    /// Attribute completed a batch, which was snapshotted for upload.
    Flushed,
}

/// Point-in-time view of one session's batching state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    /// Attributes buffered and not yet snapshotted
    pub pending: usize,
    /// Whether a flush timer is armed
    pub timer_armed: bool,
    /// Snapshots staged behind the one being uploaded
    pub staged: usize,
    /// Whether a drain task is uploading
    pub in_flight: bool,
}

#[derive(Debug)]
struct ArmedTimer {
    generation: u64,
    handle: AbortHandle,
}

#[derive(Debug)]
struct Snapshot {
    trigger: FlushTrigger,
    batch: UploadBatch,
}

#[derive(Debug)]
struct PendingBatch {
    items: Vec<Attribute>,
    timer: Option<ArmedTimer>,
    outbox: VecDeque<Snapshot>,
    in_flight: bool,
    last_enqueue: Instant,
}

impl PendingBatch {
    fn new() -> Self {
        Self {
            items: Vec::new(),
            timer: None,
            outbox: VecDeque::new(),
            in_flight: false,
            last_enqueue: Instant::now(),
        }
    }

    fn is_idle(&self) -> bool {
        self.items.is_empty() && self.timer.is_none() && self.outbox.is_empty() && !self.in_flight
    }

    fn disarm(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.handle.abort();
        }
    }
}

#[derive(Debug)]
struct SessionSlot {
    session_id: String,
    pending: Mutex<PendingBatch>,
    /// Signalled when the drain task finishes.
    idle: Notify,
}

struct BatcherInner {
    config: BatchConfig,
    client_id: Option<String>,
    uploader: Arc<dyn Uploader>,
    fanout: Option<WatchFanout>,
    handshaker: Option<Handshaker>,
    sessions: Mutex<HashMap<String, Arc<SessionSlot>>>,
    next_generation: AtomicU64,
}

/// Accumulates attributes per session and uploads them in batches.
///
/// Cloning is cheap; clones share state.
#[derive(Clone)]
pub struct SessionBatcher {
    inner: Arc<BatcherInner>,
}

impl SessionBatcher {
    pub fn new(
        config: BatchConfig,
        client_id: Option<String>,
        uploader: Arc<dyn Uploader>,
        fanout: Option<WatchFanout>,
    ) -> Self {
        let config = BatchConfig {
            max_count: config.max_count.max(1),
            ..config
        };

        Self {
            inner: Arc::new(BatcherInner {
                config,
                client_id,
                uploader,
                fanout,
                handshaker: None,
                sessions: Mutex::new(HashMap::new()),
                next_generation: AtomicU64::new(1),
            }),
        }
    }

    /// Re-run failed handshakes for sessions whose uploads have no target.
    ///
    /// Must be set before the batcher is cloned or used.
    pub fn with_handshaker(mut self, handshaker: Handshaker) -> Self {
        match Arc::get_mut(&mut self.inner) {
            Some(inner) => inner.handshaker = Some(handshaker),
            None => warn!("Batcher already shared, handshake retries disabled"),
        }
        self
    }

    pub fn config(&self) -> &BatchConfig {
        &self.inner.config
    }

    /// Add an attribute to `session_id`'s batch.
    ///
    /// Must be called from within a Tokio runtime. Never waits on uploads.
    pub fn enqueue(&self, session_id: &str, attribute: Attribute) -> EnqueueOutcome {
        metrics().attributes_enqueued.inc();

        if let Some(fanout) = &self.inner.fanout {
            fanout.publish(attribute.clone().with_session_id(session_id));
        }

        let slot;
        let mut pending = {
            let mut sessions = self.inner.sessions.lock();
            slot = sessions
                .entry(session_id.to_string())
                .or_insert_with(|| {
                    metrics().active_sessions.inc();
                    Arc::new(SessionSlot {
                        session_id: session_id.to_string(),
                        pending: Mutex::new(PendingBatch::new()),
                        idle: Notify::new(),
                    })
                })
                .clone();
            // Taken before the map lock is released so pruning cannot
            // orphan this slot.
            slot.pending.lock()
        };

        pending.items.push(attribute);
        pending.last_enqueue = Instant::now();
        metrics().pending_attributes.inc();

        if pending.items.len() >= self.inner.config.max_count {
            pending.disarm();
            debug!(
                session_id = %session_id,
                count = pending.items.len(),
                "Flushing on count"
            );
            self.stage(&slot, &mut pending, FlushTrigger::Count);
            return EnqueueOutcome::Flushed;
        }

        if pending.timer.is_none() {
            pending.timer = Some(self.arm_timer(&slot));
        } else {
            trace!(session_id = %session_id, count = pending.items.len(), "Timer already armed");
        }

        EnqueueOutcome::Buffered
    }

    /// Flush every non-empty batch and wait until all staged uploads finish.
    ///
    /// Batches whose upstream stays unknown keep retrying, so callers should
    /// bound this with a timeout.
    pub async fn flush_all(&self) {
        let slots: Vec<Arc<SessionSlot>> = self.inner.sessions.lock().values().cloned().collect();

        for slot in &slots {
            let mut pending = slot.pending.lock();
            pending.disarm();
            if !pending.items.is_empty() {
                self.stage(slot, &mut pending, FlushTrigger::Shutdown);
            }
        }

        for slot in slots {
            loop {
                let idle = slot.idle.notified();
                tokio::pin!(idle);
                idle.as_mut().enable();

                if !slot.pending.lock().in_flight {
                    break;
                }
                idle.await;
            }
        }
    }

    /// Forget sessions with nothing buffered that have been quiet for
    /// `max_idle`.
    pub fn prune_idle(&self, max_idle: Duration) -> usize {
        let now = Instant::now();
        let mut sessions = self.inner.sessions.lock();
        let before = sessions.len();
        sessions.retain(|_, slot| {
            let pending = slot.pending.lock();
            !(pending.is_idle() && now.duration_since(pending.last_enqueue) >= max_idle)
        });
        let pruned = before - sessions.len();
        metrics().active_sessions.sub(pruned as u64);
        pruned
    }

    pub fn stats(&self, session_id: &str) -> Option<SessionStats> {
        let slot = self.inner.sessions.lock().get(session_id).cloned()?;
        let pending = slot.pending.lock();
        Some(SessionStats {
            pending: pending.items.len(),
            timer_armed: pending.timer.is_some(),
            staged: pending.outbox.len(),
            in_flight: pending.in_flight,
        })
    }

    pub fn session_count(&self) -> usize {
        self.inner.sessions.lock().len()
    }

    /// Attributes buffered across all sessions.
    pub fn pending_total(&self) -> usize {
        let slots: Vec<Arc<SessionSlot>> = self.inner.sessions.lock().values().cloned().collect();
        slots.iter().map(|s| s.pending.lock().items.len()).sum()
    }

    fn arm_timer(&self, slot: &Arc<SessionSlot>) -> ArmedTimer {
        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
        let delay = self.inner.config.timeout;
        let batcher = self.clone();
        let slot = slot.clone();

        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            batcher.fire_timer(&slot, generation);
        });

        ArmedTimer {
            generation,
            handle: handle.abort_handle(),
        }
    }

    fn fire_timer(&self, slot: &Arc<SessionSlot>, generation: u64) {
        let mut pending = slot.pending.lock();
        if pending.timer.as_ref().map(|t| t.generation) != Some(generation) {
            return;
        }
        pending.timer = None;

        if pending.items.is_empty() {
            metrics().empty_flushes.inc();
            trace!(session_id = %slot.session_id, "Timer fired with no payload");
            return;
        }

        debug!(
            session_id = %slot.session_id,
            count = pending.items.len(),
            "Flushing on timeout"
        );
        self.stage(slot, &mut pending, FlushTrigger::Timeout);
    }

    /// Snapshot-and-clear the batch and hand it to the session's drain task.
    fn stage(&self, slot: &Arc<SessionSlot>, pending: &mut PendingBatch, trigger: FlushTrigger) {
        let items = std::mem::take(&mut pending.items);
        metrics().pending_attributes.sub(items.len() as u64);
        match trigger {
            FlushTrigger::Count => metrics().flushes_by_count.inc(),
            FlushTrigger::Timeout => metrics().flushes_by_timeout.inc(),
            FlushTrigger::Shutdown => metrics().flushes_on_shutdown.inc(),
        }

        pending.outbox.push_back(Snapshot {
            trigger,
            batch: UploadBatch::new(slot.session_id.clone(), self.inner.client_id.clone(), items),
        });

        if !pending.in_flight {
            pending.in_flight = true;
            let batcher = self.clone();
            let slot = slot.clone();
            tokio::spawn(async move { batcher.drain(slot).await });
        }
    }

    async fn drain(self, slot: Arc<SessionSlot>) {
        loop {
            let snapshot = {
                let mut pending = slot.pending.lock();
                match pending.outbox.pop_front() {
                    Some(snapshot) => snapshot,
                    None => {
                        pending.in_flight = false;
                        drop(pending);
                        slot.idle.notify_waiters();
                        return;
                    }
                }
            };
            self.deliver(snapshot).await;
        }
    }

    /// Upload one snapshot, retrying while the upstream is unknown.
    async fn deliver(&self, snapshot: Snapshot) {
        let Snapshot { trigger, batch } = snapshot;
        let mut attempts: u32 = 0;

        loop {
            attempts += 1;
            match self.inner.uploader.send(&batch).await {
                Ok(receipt) => {
                    metrics().uploads_succeeded.inc();
                    metrics().attributes_uploaded.inc_by(batch.len() as u64);
                    info!(
                        session_id = %batch.session_id,
                        trigger = trigger.as_str(),
                        batch_size = batch.len(),
                        accepted = receipt.count,
                        attempts = attempts,
                        "Uploaded session batch"
                    );
                    return;
                }
                Err(e) if e.is_retryable() => {
                    metrics().uploads_upstream_unknown.inc();
                    if attempts == 1 {
                        debug!(
                            session_id = %batch.session_id,
                            batch_size = batch.len(),
                            reason = %e,
                            "Holding batch until upstream is known"
                        );
                    }
                    if let Some(handshaker) = &self.inner.handshaker {
                        handshaker.retry(&batch.session_id);
                    }
                    tokio::time::sleep(self.inner.config.retry_backoff).await;
                }
                Err(e) => {
                    metrics().uploads_failed.inc();
                    metrics().attributes_lost.inc_by(batch.len() as u64);
                    error!(
                        session_id = %batch.session_id,
                        trigger = trigger.as_str(),
                        batch_size = batch.len(),
                        error = %e,
                        "Upload failed, batch dropped"
                    );
                    return;
                }
            }
        }
    }
}
