//! attrstream
//!
//! Telemetry attribute pipeline:
//! - UDP relay that batches attributes per session and uploads them
//! - HTTP collector that accumulates uploads per session and persists them
//! - Long-poll watch endpoint fed by an in-memory fan-out

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::signal;
use tokio::sync::watch;
use tracing::{info, warn};

use api::{router, ApiConfig, AppState, BlobStore, FsBlobStore, MemoryBlobStore};
use engine_core::limits::{
    DEFAULT_MEMORY_STORE_BLOBS_PER_SESSION, DEFAULT_MEMORY_STORE_SESSIONS,
    DEFAULT_WATCH_QUEUE_CAPACITY,
};
use engine_core::{FanoutConfig, WatchFanout};
use relay::{
    resolve_client_id, HttpSessionStarter, HttpUploader, RelayConfig, SessionBatcher,
    SessionRegistry, SessionStarter, StaticSessionStarter, UdpRelay, UnconfiguredStarter,
    Upstream,
};
use telemetry::init_tracing_from_env;

/// Application configuration.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
struct Config {
    #[serde(default = "default_host")]
    host: String,
    #[serde(default = "default_port")]
    port: u16,

    #[serde(default)]
    api: ApiConfig,

    #[serde(default)]
    watch: WatchConfig,

    #[serde(default)]
    store: StoreConfig,

    #[serde(default)]
    relay: RelayConfig,
}

/// Fan-out settings.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
struct WatchConfig {
    /// Items held per watcher before the oldest are dropped
    #[serde(default = "default_queue_capacity")]
    queue_capacity: usize,
}

/// Upload blob persistence.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
struct StoreConfig {
    /// Directory for upload blobs; blobs stay in memory when unset
    #[serde(default)]
    dir: Option<String>,
    /// Sessions kept by the in-memory store
    #[serde(default = "default_memory_sessions")]
    memory_sessions: u64,
    /// Blobs kept per session by the in-memory store
    #[serde(default = "default_memory_blobs_per_session")]
    memory_blobs_per_session: usize,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_queue_capacity() -> usize {
    DEFAULT_WATCH_QUEUE_CAPACITY
}

fn default_memory_sessions() -> u64 {
    DEFAULT_MEMORY_STORE_SESSIONS
}

fn default_memory_blobs_per_session() -> usize {
    DEFAULT_MEMORY_STORE_BLOBS_PER_SESSION
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            dir: None,
            memory_sessions: default_memory_sessions(),
            memory_blobs_per_session: default_memory_blobs_per_session(),
        }
    }
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            api: ApiConfig::default(),
            watch: WatchConfig::default(),
            store: StoreConfig::default(),
            relay: RelayConfig::default(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    init_tracing_from_env();

    info!("Starting attrstream v{}", env!("CARGO_PKG_VERSION"));

    let config = load_config()?;

    let fanout = WatchFanout::new(FanoutConfig {
        queue_capacity: config.watch.queue_capacity,
    });

    let store: Arc<dyn BlobStore> = match &config.store.dir {
        Some(dir) => {
            info!(dir = %dir, "Persisting uploads to disk");
            Arc::new(
                FsBlobStore::new(dir)
                    .await
                    .context("Failed to open blob store")?,
            )
        }
        None => {
            warn!(
                sessions = config.store.memory_sessions,
                blobs_per_session = config.store.memory_blobs_per_session,
                "No store dir configured, keeping only recent uploads in memory"
            );
            Arc::new(MemoryBlobStore::with_limits(
                config.store.memory_sessions,
                config.store.memory_blobs_per_session,
                config.api.session_idle(),
            ))
        }
    };

    let state = AppState::new(config.api.clone(), fanout.clone(), store);
    let _watch_cleanup = state.start_watch_cleanup();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = shutdown_tx.send(true);
    });

    let relay = if config.relay.enabled {
        let relay = build_relay(&config, &fanout)
            .await
            .context("Failed to start UDP relay")?;
        let batcher = relay.batcher().clone();
        let handle = tokio::spawn(relay.run(wait_for_shutdown(shutdown_rx.clone())));
        Some((batcher, handle))
    } else {
        info!("UDP relay disabled");
        None
    };

    let app = router(state);

    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .context("Invalid server address")?;

    info!("Listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, app)
        .with_graceful_shutdown(wait_for_shutdown(shutdown_rx))
        .await
        .context("Server error")?;

    info!("Shutting down...");

    if let Some((batcher, handle)) = relay {
        match handle.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "UDP relay exited with error"),
            Err(e) => warn!(error = %e, "UDP relay task failed"),
        }

        let grace = config.relay.shutdown_grace();
        info!(
            pending = batcher.pending_total(),
            grace_secs = grace.as_secs(),
            "Flushing pending batches"
        );
        if tokio::time::timeout(grace, batcher.flush_all()).await.is_err() {
            warn!(
                pending = batcher.pending_total(),
                "Shutdown grace elapsed before all batches were uploaded"
            );
        }
    }

    info!("Shutdown complete");
    Ok(())
}

/// Wire the relay pipeline: upstream, handshake, uploader, batcher, socket.
async fn build_relay(app: &Config, fanout: &WatchFanout) -> Result<UdpRelay> {
    let config = &app.relay;
    config.check()?;

    let client_id = resolve_client_id(config.client_id.as_deref(), config.client_prefix.as_deref());
    let static_endpoint = config.upstream_url()?;
    let upstream = Arc::new(Upstream::new(static_endpoint.clone()));

    let starter: Arc<dyn SessionStarter> = match (static_endpoint, config.discovery()?) {
        (Some(endpoint), _) => {
            info!(endpoint = %endpoint, "Using static upstream endpoint");
            Arc::new(StaticSessionStarter::new(endpoint))
        }
        (None, Some(discovery)) => {
            info!(discovery = %discovery, service = %config.upstream_service, "Using discovery");
            Arc::new(HttpSessionStarter::new(
                discovery,
                &config.upstream_service,
                &config.partner_id,
                config.request_timeout(),
            )?)
        }
        (None, None) => {
            warn!("No upstream endpoint or discovery URL configured; batches will be held");
            Arc::new(UnconfiguredStarter)
        }
    };

    info!(
        client_id = client_id.as_deref().unwrap_or("none"),
        batch_max = config.batch_max,
        batch_timeout_ms = config.batch_timeout_ms,
        "Relay configured"
    );

    let registry = SessionRegistry::new(
        client_id.clone(),
        config.default_session_id.clone(),
        config.session_capacity,
        config.session_idle(),
        upstream.clone(),
        starter,
    )
    .with_handshake_backoff(config.batch_config().retry_backoff);

    let mut publish_locally = config.fanout_on_enqueue;
    if publish_locally && config.uploads_to_self(&app.host, app.port)? {
        warn!(
            port = app.port,
            "Relay uploads to this process's collector; local fan-out on enqueue disabled"
        );
        publish_locally = false;
    }

    let uploader = HttpUploader::new(upstream, config.request_timeout())?;
    let batcher = SessionBatcher::new(
        config.batch_config(),
        client_id,
        Arc::new(uploader),
        publish_locally.then(|| fanout.clone()),
    )
    .with_handshaker(registry.handshaker());

    Ok(UdpRelay::bind(&config.bind_addr(), registry, batcher).await?)
}

/// Load configuration from files and environment.
fn load_config() -> Result<Config> {
    let config = config::Config::builder()
        // Start with defaults
        .add_source(config::Config::try_from(&Config::default())?)
        // Load from config file if exists
        .add_source(
            config::File::with_name("config/default")
                .required(false)
                .format(config::FileFormat::Toml),
        )
        // Override with environment variables
        .add_source(
            config::Environment::default()
                .separator("__")
                .prefix("ATTRSTREAM")
                .try_parsing(true),
        )
        .build()
        .context("Failed to build configuration")?;

    let mut config: Config = config
        .try_deserialize()
        .context("Failed to deserialize configuration")?;

    // Nested fields with underscores do not map reliably through the
    // environment source.
    if let Ok(enabled) = std::env::var("ATTRSTREAM_RELAY_ENABLED") {
        config.relay.enabled = enabled == "1" || enabled.eq_ignore_ascii_case("true");
    }
    if let Ok(endpoint) = std::env::var("ATTRSTREAM_RELAY_UPSTREAM_ENDPOINT") {
        config.relay.upstream_endpoint = Some(endpoint);
    }
    if let Ok(discovery) = std::env::var("ATTRSTREAM_RELAY_DISCOVERY_URL") {
        config.relay.discovery_url = Some(discovery);
    }
    if let Ok(client_id) = std::env::var("ATTRSTREAM_RELAY_CLIENT_ID") {
        config.relay.client_id = Some(client_id);
    }
    if let Ok(session_id) = std::env::var("ATTRSTREAM_RELAY_DEFAULT_SESSION_ID") {
        config.relay.default_session_id = Some(session_id);
    }
    if let Ok(dir) = std::env::var("ATTRSTREAM_STORE_DIR") {
        config.store.dir = Some(dir);
    }

    Ok(config)
}

async fn wait_for_shutdown(mut rx: watch::Receiver<bool>) {
    // A closed channel also means shutdown.
    let _ = rx.wait_for(|stop| *stop).await;
}

/// Graceful shutdown signal handler.
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            info!("Received terminate signal");
        }
    }
}
