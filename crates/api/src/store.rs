//! Persistence boundary for raw upload requests.

use async_trait::async_trait;
use chrono::Utc;
use engine_core::limits::{
    DEFAULT_MEMORY_STORE_BLOBS_PER_SESSION, DEFAULT_MEMORY_STORE_SESSIONS,
    DEFAULT_SESSION_IDLE_SECS,
};
use engine_core::{Error, Result};
use moka::future::Cache;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};
use uuid::Uuid;

/// Stores one blob per upload request, keyed by session.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(&self, session_id: &str, blob: &Value) -> Result<()>;
}

/// Keeps the most recent blobs of recent sessions in memory.
///
/// Bounded by session count, blobs per session and session idle time. Used in
/// tests and when no store directory is set.
#[derive(Clone)]
pub struct MemoryBlobStore {
    sessions: Cache<String, Arc<Mutex<VecDeque<Value>>>>,
    per_session: usize,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::with_limits(
            DEFAULT_MEMORY_STORE_SESSIONS,
            DEFAULT_MEMORY_STORE_BLOBS_PER_SESSION,
            Duration::from_secs(DEFAULT_SESSION_IDLE_SECS),
        )
    }

    pub fn with_limits(max_sessions: u64, per_session: usize, idle: Duration) -> Self {
        Self {
            sessions: Cache::builder()
                .max_capacity(max_sessions)
                .time_to_idle(idle)
                .build(),
            per_session: per_session.max(1),
        }
    }

    /// Blobs kept for `session_id`, oldest first.
    pub async fn blobs(&self, session_id: &str) -> Vec<Value> {
        match self.sessions.get(session_id).await {
            Some(blobs) => blobs.lock().iter().cloned().collect(),
            None => Vec::new(),
        }
    }

    /// Blobs kept across all sessions.
    pub async fn total(&self) -> usize {
        self.sessions.run_pending_tasks().await;
        self.sessions.iter().map(|(_, blobs)| blobs.lock().len()).sum()
    }
}

impl Default for MemoryBlobStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(&self, session_id: &str, blob: &Value) -> Result<()> {
        let blobs = self
            .sessions
            .get_with(session_id.to_string(), async {
                Arc::new(Mutex::new(VecDeque::new()))
            })
            .await;

        let mut blobs = blobs.lock();
        blobs.push_back(blob.clone());
        while blobs.len() > self.per_session {
            blobs.pop_front();
            trace!(session_id = %session_id, "Dropped oldest in-memory blob");
        }
        Ok(())
    }
}

/// Writes `<root>/<session>/<millis>-<uuid>.json`.
#[derive(Debug, Clone)]
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    /// Create the root directory if needed.
    pub async fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(&root)
            .await
            .map_err(|e| Error::storage(format!("cannot create {}: {}", root.display(), e)))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn session_dir(&self, session_id: &str) -> PathBuf {
        let name: String = session_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.root.join(name)
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn put(&self, session_id: &str, blob: &Value) -> Result<()> {
        let dir = self.session_dir(session_id);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| Error::storage(format!("cannot create {}: {}", dir.display(), e)))?;

        let path = dir.join(format!(
            "{}-{}.json",
            Utc::now().timestamp_millis(),
            Uuid::new_v4().simple()
        ));
        let bytes = serde_json::to_vec(blob)?;
        tokio::fs::write(&path, bytes)
            .await
            .map_err(|e| Error::storage(format!("cannot write {}: {}", path.display(), e)))?;

        debug!(path = %path.display(), "Stored upload blob");
        Ok(())
    }
}
