//! Common test setup functions.

use api::{router, ApiConfig, AppState, BlobStore, MemoryBlobStore};
use axum::Router;
use engine_core::{Result, WatchFanout};
use relay::{
    endpoint_key, BatchConfig, SessionBatcher, SessionRegistry, SessionStarter, UdpRelay,
    Uploader, Upstream,
};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// Collector test context.
///
/// Uses the real router and state with an in-memory blob store and a short
/// watch wait.
pub struct TestContext {
    pub state: AppState,
    pub store: Arc<MemoryBlobStore>,
    pub router: Router,
}

impl TestContext {
    pub fn new() -> Self {
        Self::with_config(test_api_config())
    }

    pub fn with_config(config: ApiConfig) -> Self {
        let store = Arc::new(MemoryBlobStore::new());
        let state = AppState::new(config, WatchFanout::default(), store.clone());
        let router = router(state.clone());
        Self {
            state,
            store,
            router,
        }
    }

    /// Context whose uploads go to `store`.
    pub fn with_store(store: Arc<dyn BlobStore>) -> Self {
        let state = AppState::new(test_api_config(), WatchFanout::default(), store);
        let router = router(state.clone());
        Self {
            state,
            store: Arc::new(MemoryBlobStore::new()),
            router,
        }
    }

    pub fn fanout(&self) -> &WatchFanout {
        &self.state.fanout
    }

    /// Serve the router on an ephemeral local port.
    pub async fn serve(&self) -> SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind collector");
        let addr = listener.local_addr().expect("No local addr");
        let app = self.router.clone();
        tokio::spawn(async move {
            axum::serve(listener, app).await.ok();
        });
        addr
    }
}

impl Default for TestContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Api config with a 200 ms watch wait.
pub fn test_api_config() -> ApiConfig {
    ApiConfig {
        watch_max_wait_ms: 200,
        ..ApiConfig::default()
    }
}

/// A running UDP relay plus a socket to send datagrams from.
pub struct RelayHarness {
    pub addr: SocketAddr,
    pub batcher: SessionBatcher,
    pub upstream: Arc<Upstream>,
    sender: UdpSocket,
    shutdown: Option<oneshot::Sender<()>>,
    handle: JoinHandle<Result<()>>,
}

impl RelayHarness {
    pub async fn start(
        batch: BatchConfig,
        upstream: Arc<Upstream>,
        starter: Arc<dyn SessionStarter>,
        uploader: Arc<dyn Uploader>,
        fanout: Option<WatchFanout>,
    ) -> Self {
        let registry = SessionRegistry::new(
            None,
            None,
            1_000,
            Duration::from_secs(600),
            upstream.clone(),
            starter,
        )
        .with_handshake_backoff(batch.retry_backoff);
        let batcher =
            SessionBatcher::new(batch, None, uploader, fanout).with_handshaker(registry.handshaker());
        let relay = UdpRelay::bind("127.0.0.1:0", registry, batcher.clone())
            .await
            .expect("Failed to bind relay");
        let addr = relay.local_addr().expect("No relay addr");

        let (tx, rx) = oneshot::channel::<()>();
        let handle = tokio::spawn(relay.run(async {
            let _ = rx.await;
        }));

        let sender = UdpSocket::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind sender");

        Self {
            addr,
            batcher,
            upstream,
            sender,
            shutdown: Some(tx),
            handle,
        }
    }

    pub async fn send(&self, datagram: &str) {
        self.sender
            .send_to(datagram.as_bytes(), self.addr)
            .await
            .expect("Failed to send datagram");
    }

    /// Session id the relay assigns to this harness's sender.
    pub fn sender_session(&self) -> String {
        endpoint_key(&self.sender.local_addr().expect("No sender addr"))
    }

    /// Stop the receive loop.
    pub async fn stop(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        let _ = tokio::time::timeout(Duration::from_secs(2), self.handle).await;
    }
}

/// Poll `check` every 10 ms until it is true or `timeout` elapses.
pub async fn eventually<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
