//! Sender endpoint to session mapping.

use chrono::Utc;
use engine_core::limits::MAX_CLIENT_ID_LEN;
use moka::future::Cache;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use telemetry::metrics;
use tracing::info;
use uuid::Uuid;

use crate::upstream::{Handshaker, SessionStarter, Upstream};

/// Session chosen for one packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub session_id: String,
    /// First packet seen from this endpoint
    pub is_new: bool,
}

/// Build the relay's client identity.
///
/// `<prefix>-<id>` when both are set, a random id under the prefix when only
/// the prefix is set, and no identity when neither is.
pub fn resolve_client_id(configured: Option<&str>, prefix: Option<&str>) -> Option<String> {
    let configured = configured.map(str::trim).filter(|s| !s.is_empty());
    let prefix = prefix.map(str::trim).filter(|s| !s.is_empty());

    let id = match (prefix, configured) {
        (Some(prefix), Some(id)) => format!("{}-{}", prefix, id),
        (None, Some(id)) => id.to_string(),
        (Some(prefix), None) => format!("{}-{}", prefix, Uuid::new_v4().simple()),
        (None, None) => return None,
    };

    Some(id.chars().take(MAX_CLIENT_ID_LEN).collect())
}

/// `socket_<addr>` with every non-alphanumeric character replaced by `_`.
pub fn endpoint_key(peer: &SocketAddr) -> String {
    let sanitized: String = peer
        .to_string()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    format!("socket_{}", sanitized)
}

/// Assigns sessions to sender endpoints and starts the handshake for new ones.
#[derive(Clone)]
pub struct SessionRegistry {
    client_id: Option<String>,
    default_session_id: Option<String>,
    endpoints: Cache<String, String>,
    handshaker: Handshaker,
    seq: Arc<AtomicU64>,
    session_idle: Duration,
}

impl SessionRegistry {
    pub fn new(
        client_id: Option<String>,
        default_session_id: Option<String>,
        capacity: u64,
        session_idle: Duration,
        upstream: Arc<Upstream>,
        starter: Arc<dyn SessionStarter>,
    ) -> Self {
        let endpoints = Cache::builder()
            .max_capacity(capacity)
            .time_to_idle(session_idle)
            .build();

        Self {
            handshaker: Handshaker::new(upstream, starter, client_id.clone()),
            client_id,
            default_session_id: default_session_id.filter(|s| !s.is_empty()),
            endpoints,
            seq: Arc::new(AtomicU64::new(0)),
            session_idle,
        }
    }

    pub fn client_id(&self) -> Option<&str> {
        self.client_id.as_deref()
    }

    /// Space handshake re-runs starting at `backoff`.
    pub fn with_handshake_backoff(mut self, backoff: Duration) -> Self {
        self.handshaker = self.handshaker.with_initial_backoff(backoff);
        self
    }

    pub fn upstream(&self) -> &Arc<Upstream> {
        self.handshaker.upstream()
    }

    /// Handle the batcher uses to re-run failed handshakes.
    pub fn handshaker(&self) -> Handshaker {
        self.handshaker.clone()
    }

    pub fn session_idle(&self) -> Duration {
        self.session_idle
    }

    /// Pick the session for a packet from `peer`.
    ///
    /// A declared session id wins. Otherwise the endpoint's session is used,
    /// synthesized on its first packet.
    pub async fn resolve(&self, peer: SocketAddr, declared: Option<String>) -> Resolution {
        let key = endpoint_key(&peer);
        let entry = self
            .endpoints
            .entry(key.clone())
            .or_insert_with(async { self.synthesize(&key) })
            .await;

        let is_new = entry.is_fresh();
        let session_id = declared.unwrap_or_else(|| entry.into_value());

        if is_new {
            metrics().sessions_started.inc();
            info!(peer = %peer, session_id = %session_id, "New sender endpoint");
            self.handshaker.start(session_id.clone());
        }

        Resolution { session_id, is_new }
    }

    /// Endpoints currently remembered.
    pub async fn endpoint_count(&self) -> u64 {
        self.endpoints.run_pending_tasks().await;
        self.endpoints.entry_count()
    }

    fn synthesize(&self, key: &str) -> String {
        if let Some(default) = &self.default_session_id {
            return default.clone();
        }
        match &self.client_id {
            Some(client_id) => {
                let seq = self.seq.fetch_add(1, Ordering::Relaxed);
                format!("{}-{}-{}", client_id, Utc::now().format("%Y%m%d%H%M%S%3f"), seq)
            }
            None => key.to_string(),
        }
    }
}
