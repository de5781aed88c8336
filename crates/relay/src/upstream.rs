//! Upstream endpoint discovery and session-start handshakes.
//!
//! A new session runs a one-time handshake before its first batch may be
//! uploaded. The handshake reports the collector endpoint. Until it
//! resolves, [`Upstream::target_for`] answers `UpstreamUnknown` for that
//! session and the batcher keeps retrying. A failed handshake is re-run by
//! [`Handshaker::retry`] when the batcher still has data and no endpoint.

use async_trait::async_trait;
use engine_core::limits::{DEFAULT_RETRY_BACKOFF_MS, MAX_HANDSHAKE_RETRY_BACKOFF};
use engine_core::{Error, Result};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use telemetry::{health, metrics};
use tracing::{debug, info, warn};
use url::Url;

/// Runs the session-start handshake and reports the collector endpoint.
#[async_trait]
pub trait SessionStarter: Send + Sync {
    async fn start_session(&self, session_id: &str, client_id: Option<&str>) -> Result<Url>;
}

/// Known collector endpoint plus sessions whose handshake is in flight.
#[derive(Debug, Default)]
pub struct Upstream {
    endpoint: RwLock<Option<Url>>,
    pending: RwLock<HashSet<String>>,
}

impl Upstream {
    pub fn new(endpoint: Option<Url>) -> Self {
        if endpoint.is_some() {
            health().upstream.set_healthy();
        }
        Self {
            endpoint: RwLock::new(endpoint),
            pending: RwLock::new(HashSet::new()),
        }
    }

    pub fn endpoint(&self) -> Option<Url> {
        self.endpoint.read().clone()
    }

    pub fn set_endpoint(&self, endpoint: Url) {
        let mut current = self.endpoint.write();
        if current.as_ref() != Some(&endpoint) {
            info!(endpoint = %endpoint, "Upstream endpoint updated");
        }
        *current = Some(endpoint);
        health().upstream.set_healthy();
    }

    /// Mark `session_id` as waiting on its handshake.
    pub fn begin_handshake(&self, session_id: &str) {
        self.pending.write().insert(session_id.to_string());
    }

    /// Record the handshake outcome. Failure only clears the pending mark.
    pub fn finish_handshake(&self, session_id: &str, outcome: Result<Url>) {
        match outcome {
            Ok(endpoint) => {
                info!(session_id = %session_id, endpoint = %endpoint, "Session started");
                self.set_endpoint(endpoint);
            }
            Err(e) => {
                metrics().handshake_failures.inc();
                if self.endpoint.read().is_none() {
                    health().upstream.set_unhealthy(e.to_string());
                }
                warn!(session_id = %session_id, error = %e, "Session-start handshake failed");
            }
        }
        self.pending.write().remove(session_id);
    }

    pub fn is_pending(&self, session_id: &str) -> bool {
        self.pending.read().contains(session_id)
    }

    /// Endpoint to upload `session_id`'s batches to.
    pub fn target_for(&self, session_id: &str) -> Result<Url> {
        if self.is_pending(session_id) {
            return Err(Error::upstream_unknown(format!(
                "handshake for {} still in flight",
                session_id
            )));
        }
        self.endpoint()
            .ok_or_else(|| Error::upstream_unknown("no upstream endpoint known"))
    }
}

#[derive(Debug, Clone, Copy)]
struct RetryState {
    next_at: Instant,
    backoff: Duration,
}

/// Starts session handshakes and re-runs ones that failed.
///
/// Re-runs are spaced per session, starting at `initial_backoff` and
/// doubling up to [`MAX_HANDSHAKE_RETRY_BACKOFF`].
#[derive(Clone)]
pub struct Handshaker {
    upstream: Arc<Upstream>,
    starter: Arc<dyn SessionStarter>,
    client_id: Option<String>,
    initial_backoff: Duration,
    retries: Arc<Mutex<HashMap<String, RetryState>>>,
}

impl Handshaker {
    pub fn new(
        upstream: Arc<Upstream>,
        starter: Arc<dyn SessionStarter>,
        client_id: Option<String>,
    ) -> Self {
        Self {
            upstream,
            starter,
            client_id,
            initial_backoff: Duration::from_millis(DEFAULT_RETRY_BACKOFF_MS),
            retries: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn with_initial_backoff(mut self, backoff: Duration) -> Self {
        self.initial_backoff = backoff.min(MAX_HANDSHAKE_RETRY_BACKOFF);
        self
    }

    pub fn upstream(&self) -> &Arc<Upstream> {
        &self.upstream
    }

    /// Mark `session_id` pending and run its handshake in the background.
    pub fn start(&self, session_id: String) {
        self.upstream.begin_handshake(&session_id);

        let upstream = self.upstream.clone();
        let starter = self.starter.clone();
        let client_id = self.client_id.clone();
        let retries = self.retries.clone();

        tokio::spawn(async move {
            debug!(session_id = %session_id, "Starting session handshake");
            let outcome = starter.start_session(&session_id, client_id.as_deref()).await;
            if outcome.is_ok() {
                retries.lock().remove(&session_id);
            }
            upstream.finish_handshake(&session_id, outcome);
        });
    }

    /// Re-run the handshake for a session whose uploads have no target.
    ///
    /// Does nothing while an endpoint is known, while a handshake for the
    /// session is in flight, or before the session's backoff has elapsed.
    /// Returns whether a handshake was started.
    pub fn retry(&self, session_id: &str) -> bool {
        if self.upstream.endpoint().is_some() || self.upstream.is_pending(session_id) {
            return false;
        }

        let now = Instant::now();
        {
            let mut retries = self.retries.lock();
            let state = retries.entry(session_id.to_string()).or_insert(RetryState {
                next_at: now,
                backoff: self.initial_backoff,
            });
            if now < state.next_at {
                return false;
            }
            state.next_at = now + state.backoff;
            state.backoff = (state.backoff * 2).min(MAX_HANDSHAKE_RETRY_BACKOFF);
        }

        metrics().handshake_retries.inc();
        info!(session_id = %session_id, "Retrying session-start handshake");
        self.start(session_id.to_string());
        true
    }

    /// Sessions currently backing off between handshake re-runs.
    pub fn retrying(&self) -> usize {
        self.retries.lock().len()
    }
}

/// Handshake against a fixed endpoint.
#[derive(Debug, Clone)]
pub struct StaticSessionStarter {
    endpoint: Url,
}

impl StaticSessionStarter {
    pub fn new(endpoint: Url) -> Self {
        Self { endpoint }
    }
}

#[async_trait]
impl SessionStarter for StaticSessionStarter {
    async fn start_session(&self, _session_id: &str, _client_id: Option<&str>) -> Result<Url> {
        Ok(self.endpoint.clone())
    }
}

/// Handshake used when neither an endpoint nor discovery is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnconfiguredStarter;

#[async_trait]
impl SessionStarter for UnconfiguredStarter {
    async fn start_session(&self, _session_id: &str, _client_id: Option<&str>) -> Result<Url> {
        Err(Error::upstream_unknown(
            "neither upstream_endpoint nor discovery_url is configured",
        ))
    }
}

/// Handshake request sent to the discovery service.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct StartRequest<'a> {
    partner_id: &'a str,
    version: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    client_id: Option<&'a str>,
    session_id: &'a str,
}

/// Startup information returned by the discovery service.
#[derive(Debug, Clone, Deserialize)]
pub struct StartupInfo {
    #[serde(default)]
    pub upstreams: HashMap<String, String>,
}

/// Handshake against a discovery service over HTTP.
#[derive(Debug, Clone)]
pub struct HttpSessionStarter {
    http_client: reqwest::Client,
    discovery_url: Url,
    service: String,
    partner_id: String,
}

impl HttpSessionStarter {
    pub fn new(
        discovery_url: Url,
        service: impl Into<String>,
        partner_id: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::config(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self {
            http_client,
            discovery_url,
            service: service.into(),
            partner_id: partner_id.into(),
        })
    }
}

#[async_trait]
impl SessionStarter for HttpSessionStarter {
    async fn start_session(&self, session_id: &str, client_id: Option<&str>) -> Result<Url> {
        let request = StartRequest {
            partner_id: &self.partner_id,
            version: 1,
            client_id,
            session_id,
        };

        debug!(url = %self.discovery_url, session_id = %session_id, "Calling discovery service");

        let response = self
            .http_client
            .post(self.discovery_url.clone())
            .json(&request)
            .send()
            .await
            .map_err(|e| Error::upstream_unknown(format!("discovery unreachable: {}", e)))?;

        if !response.status().is_success() {
            return Err(Error::upstream_unknown(format!(
                "discovery returned {}",
                response.status()
            )));
        }

        let info: StartupInfo = response
            .json()
            .await
            .map_err(|e| Error::upstream_unknown(format!("invalid discovery response: {}", e)))?;

        let endpoint = info.upstreams.get(&self.service).ok_or_else(|| {
            Error::upstream_unknown(format!("discovery has no upstream for {}", self.service))
        })?;

        Url::parse(endpoint)
            .map_err(|e| Error::upstream_unknown(format!("bad upstream url {}: {}", endpoint, e)))
    }
}
