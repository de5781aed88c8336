//! Size and time limits shared by the relay and the collector.
//!
//! These bound memory held on behalf of senders and watchers that may
//! disappear without notice.

use std::time::Duration;

// === Datagram Limits ===

/// Largest UDP payload that fits in a single IPv4 datagram.
pub const MAX_DATAGRAM_BYTES: usize = 65_507;

// === Batch Defaults ===

/// Default number of attributes that forces a flush.
pub const DEFAULT_BATCH_MAX: usize = 275;

/// Default time a partial batch may wait before it is flushed (ms).
pub const DEFAULT_BATCH_TIMEOUT_MS: u64 = 5_000;

/// Delay before retrying a batch whose upstream is not known yet (ms).
pub const DEFAULT_RETRY_BACKOFF_MS: u64 = 100;

/// Upper bound on the delay between handshake re-runs for one session.
pub const MAX_HANDSHAKE_RETRY_BACKOFF: Duration = Duration::from_secs(30);

// === Watch Limits ===

/// Attributes held per watcher before the oldest are dropped.
pub const DEFAULT_WATCH_QUEUE_CAPACITY: usize = 10_000;

/// Longest a long-poll is held open before answering with no items.
pub const DEFAULT_WATCH_MAX_WAIT: Duration = Duration::from_secs(30);

/// Watchers not polled for this long are evicted.
pub const DEFAULT_WATCH_IDLE_TIMEOUT: Duration = Duration::from_secs(600);

// === Identity Limits ===

/// Client ids are truncated to this many characters.
pub const MAX_CLIENT_ID_LEN: usize = 64;

// === Session Table Limits ===

/// Sessions tracked at once by the registry and the collector.
pub const DEFAULT_SESSION_CAPACITY: u64 = 100_000;

/// Sessions untouched for this long are forgotten (seconds).
pub const DEFAULT_SESSION_IDLE_SECS: u64 = 24 * 60 * 60;

// === Memory Store Limits ===

/// Sessions whose upload blobs the in-memory store keeps.
pub const DEFAULT_MEMORY_STORE_SESSIONS: u64 = 10_000;

/// Upload blobs kept per session by the in-memory store; older ones are dropped.
pub const DEFAULT_MEMORY_STORE_BLOBS_PER_SESSION: usize = 100;
