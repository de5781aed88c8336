//! Relay configuration.

use engine_core::limits::{
    DEFAULT_BATCH_MAX, DEFAULT_BATCH_TIMEOUT_MS, DEFAULT_RETRY_BACKOFF_MS,
    DEFAULT_SESSION_CAPACITY, DEFAULT_SESSION_IDLE_SECS,
};
use engine_core::{Error, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use url::Url;
use validator::Validate;

use crate::batch::BatchConfig;

/// UDP relay configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct RelayConfig {
    /// Run the UDP relay in this process
    #[serde(default)]
    pub enabled: bool,
    /// Address the UDP socket binds to
    #[serde(default = "default_host")]
    pub host: String,
    /// UDP listen port
    #[serde(default = "default_udp_port")]
    pub udp_port: u16,
    /// Attributes per session that force an immediate flush
    #[serde(default = "default_batch_max")]
    #[validate(range(min = 1))]
    pub batch_max: usize,
    /// Time a partial batch may wait before it is flushed (ms)
    #[serde(default = "default_batch_timeout_ms")]
    #[validate(range(min = 1))]
    pub batch_timeout_ms: u64,
    /// Delay between retries while no upstream is known (ms)
    #[serde(default = "default_retry_backoff_ms")]
    #[validate(range(min = 1))]
    pub retry_backoff_ms: u64,
    /// Session used for packets that do not declare one, instead of a
    /// per-sender session
    #[serde(default)]
    pub default_session_id: Option<String>,
    /// Identity reported to the collector
    #[serde(default)]
    #[validate(length(min = 1))]
    pub client_id: Option<String>,
    /// Prefix applied to the client id
    #[serde(default)]
    pub client_prefix: Option<String>,
    /// Fixed collector endpoint; skips discovery when set
    #[serde(default)]
    #[validate(url)]
    pub upstream_endpoint: Option<String>,
    /// Discovery service that answers session-start handshakes
    #[serde(default)]
    #[validate(url)]
    pub discovery_url: Option<String>,
    /// Name of the collector in the discovery response
    #[serde(default = "default_upstream_service")]
    pub upstream_service: String,
    /// Partner id sent with handshakes
    #[serde(default = "default_partner_id")]
    pub partner_id: String,
    /// HTTP request timeout for uploads and handshakes (ms)
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Publish attributes to the local fan-out as they arrive
    #[serde(default = "default_true")]
    pub fanout_on_enqueue: bool,
    /// Sender endpoints remembered at once
    #[serde(default = "default_session_capacity")]
    pub session_capacity: u64,
    /// Sender endpoints idle this long are forgotten (seconds)
    #[serde(default = "default_session_idle_secs")]
    pub session_idle_secs: u64,
    /// How long shutdown waits for pending batches (seconds)
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_udp_port() -> u16 {
    50505
}

fn default_batch_max() -> usize {
    DEFAULT_BATCH_MAX
}

fn default_batch_timeout_ms() -> u64 {
    DEFAULT_BATCH_TIMEOUT_MS
}

fn default_retry_backoff_ms() -> u64 {
    DEFAULT_RETRY_BACKOFF_MS
}

fn default_upstream_service() -> String {
    "attrstream".to_string()
}

fn default_partner_id() -> String {
    "attrstream-relay".to_string()
}

fn default_request_timeout_ms() -> u64 {
    5000
}

fn default_true() -> bool {
    true
}

fn default_session_capacity() -> u64 {
    DEFAULT_SESSION_CAPACITY
}

fn default_session_idle_secs() -> u64 {
    DEFAULT_SESSION_IDLE_SECS
}

fn default_shutdown_grace_secs() -> u64 {
    5
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            host: default_host(),
            udp_port: default_udp_port(),
            batch_max: default_batch_max(),
            batch_timeout_ms: default_batch_timeout_ms(),
            retry_backoff_ms: default_retry_backoff_ms(),
            default_session_id: None,
            client_id: None,
            client_prefix: None,
            upstream_endpoint: None,
            discovery_url: None,
            upstream_service: default_upstream_service(),
            partner_id: default_partner_id(),
            request_timeout_ms: default_request_timeout_ms(),
            fanout_on_enqueue: default_true(),
            session_capacity: default_session_capacity(),
            session_idle_secs: default_session_idle_secs(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
        }
    }
}

impl RelayConfig {
    /// Validate field ranges and URLs.
    pub fn check(&self) -> Result<()> {
        self.validate()
            .map_err(|e| Error::config(format!("invalid relay config: {}", e)))
    }

    /// `host:port` for the UDP socket.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.udp_port)
    }

    pub fn batch_config(&self) -> BatchConfig {
        BatchConfig {
            max_count: self.batch_max,
            timeout: Duration::from_millis(self.batch_timeout_ms),
            retry_backoff: Duration::from_millis(self.retry_backoff_ms),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn session_idle(&self) -> Duration {
        Duration::from_secs(self.session_idle_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    pub fn upstream_url(&self) -> Result<Option<Url>> {
        parse_optional_url(self.upstream_endpoint.as_deref(), "upstream_endpoint")
    }

    pub fn discovery(&self) -> Result<Option<Url>> {
        parse_optional_url(self.discovery_url.as_deref(), "discovery_url")
    }

    /// Whether the static upstream is the collector served by this process
    /// on `host:port`.
    pub fn uploads_to_self(&self, host: &str, port: u16) -> Result<bool> {
        let Some(endpoint) = self.upstream_url()? else {
            return Ok(false);
        };
        if endpoint.port_or_known_default() != Some(port) {
            return Ok(false);
        }
        let target = endpoint.host_str().unwrap_or_default();
        Ok(target == host || (is_local_host(target) && (is_local_host(host) || is_any_host(host))))
    }
}

fn is_local_host(host: &str) -> bool {
    matches!(host, "localhost" | "127.0.0.1" | "[::1]" | "::1")
}

fn is_any_host(host: &str) -> bool {
    matches!(host, "0.0.0.0" | "::" | "[::]")
}

fn parse_optional_url(raw: Option<&str>, field: &str) -> Result<Option<Url>> {
    raw.filter(|s| !s.trim().is_empty())
        .map(|s| {
            Url::parse(s.trim()).map_err(|e| Error::config(format!("{}: {}", field, e)))
        })
        .transpose()
}
