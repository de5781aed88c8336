//! Application state shared across handlers.

use engine_core::limits::{
    DEFAULT_SESSION_CAPACITY, DEFAULT_SESSION_IDLE_SECS, DEFAULT_WATCH_IDLE_TIMEOUT,
    DEFAULT_WATCH_MAX_WAIT,
};
use engine_core::{Attribute, Session, WatchFanout};
use moka::future::Cache;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use telemetry::health;
use tracing::debug;

use crate::store::BlobStore;

/// Collector HTTP settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Prefix the collector routes are also served under
    #[serde(default = "default_mount")]
    pub mount: String,
    /// Longest a watch request is held open (ms)
    #[serde(default = "default_watch_max_wait_ms")]
    pub watch_max_wait_ms: u64,
    /// Watchers that have not polled for this long are dropped (seconds)
    #[serde(default = "default_watch_idle_secs")]
    pub watch_idle_secs: u64,
    /// How often idle watchers are swept (seconds)
    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,
    /// Sessions kept in the session table
    #[serde(default = "default_session_capacity")]
    pub session_capacity: u64,
    /// Sessions not written for this long are dropped (seconds)
    #[serde(default = "default_session_idle_secs")]
    pub session_idle_secs: u64,
}

fn default_mount() -> String {
    "/api/v1/attrstream".to_string()
}

fn default_watch_max_wait_ms() -> u64 {
    DEFAULT_WATCH_MAX_WAIT.as_millis() as u64
}

fn default_watch_idle_secs() -> u64 {
    DEFAULT_WATCH_IDLE_TIMEOUT.as_secs()
}

fn default_cleanup_interval_secs() -> u64 {
    60
}

fn default_session_capacity() -> u64 {
    DEFAULT_SESSION_CAPACITY
}

fn default_session_idle_secs() -> u64 {
    DEFAULT_SESSION_IDLE_SECS
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            mount: default_mount(),
            watch_max_wait_ms: default_watch_max_wait_ms(),
            watch_idle_secs: default_watch_idle_secs(),
            cleanup_interval_secs: default_cleanup_interval_secs(),
            session_capacity: default_session_capacity(),
            session_idle_secs: default_session_idle_secs(),
        }
    }
}

impl ApiConfig {
    /// Mount as `/a/b`, or `None` when routes live only at the root.
    pub fn mount_path(&self) -> Option<String> {
        let trimmed = self.mount.trim().trim_matches('/');
        if trimmed.is_empty() {
            None
        } else {
            Some(format!("/{}", trimmed))
        }
    }

    pub fn watch_max_wait(&self) -> Duration {
        Duration::from_millis(self.watch_max_wait_ms)
    }

    pub fn watch_idle(&self) -> Duration {
        Duration::from_secs(self.watch_idle_secs)
    }

    pub fn session_idle(&self) -> Duration {
        Duration::from_secs(self.session_idle_secs)
    }
}

/// Accumulated attributes per session.
#[derive(Clone)]
pub struct SessionTable {
    sessions: Cache<String, Arc<Mutex<Session>>>,
}

impl SessionTable {
    pub fn new(capacity: u64, idle: Duration) -> Self {
        Self {
            sessions: Cache::builder()
                .max_capacity(capacity)
                .time_to_idle(idle)
                .build(),
        }
    }

    /// Fold an upload into its session; returns the fields written.
    pub async fn apply(
        &self,
        session_id: &str,
        client_id: Option<&str>,
        attributes: &[Attribute],
    ) -> usize {
        let session = self
            .sessions
            .get_with(session_id.to_string(), async {
                debug!(session_id = %session_id, "New collector session");
                Arc::new(Mutex::new(Session::new(
                    session_id,
                    client_id.map(str::to_string),
                )))
            })
            .await;

        let mut session = session.lock();
        session.record_upload(client_id);
        attributes.iter().map(|a| session.apply(a)).sum()
    }

    pub async fn get(&self, session_id: &str) -> Option<Session> {
        let session = self.sessions.get(session_id).await?;
        let snapshot = session.lock().clone();
        Some(snapshot)
    }

    pub async fn len(&self) -> u64 {
        self.sessions.run_pending_tasks().await;
        self.sessions.entry_count()
    }
}

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub fanout: WatchFanout,
    pub sessions: SessionTable,
    pub store: Arc<dyn BlobStore>,
    pub config: Arc<ApiConfig>,
}

impl AppState {
    pub fn new(config: ApiConfig, fanout: WatchFanout, store: Arc<dyn BlobStore>) -> Self {
        health().store.set_healthy();
        Self {
            fanout,
            sessions: SessionTable::new(config.session_capacity, config.session_idle()),
            store,
            config: Arc::new(config),
        }
    }

    /// Start the idle-watcher sweep.
    /// Returns a handle that can be used to cancel the task.
    pub fn start_watch_cleanup(&self) -> tokio::task::JoinHandle<()> {
        let fanout = self.fanout.clone();
        let every = Duration::from_secs(self.config.cleanup_interval_secs.max(1));
        let idle = self.config.watch_idle();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.tick().await;
            loop {
                interval.tick().await;
                let evicted = fanout.evict_idle(idle);
                if evicted > 0 {
                    debug!(evicted = evicted, "Evicted idle watchers");
                }
            }
        })
    }
}
