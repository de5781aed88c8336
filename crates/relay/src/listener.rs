//! UDP ingest loop.

use engine_core::{PacketDecoder, Result};
use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;
use telemetry::metrics;
use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

use crate::batch::{EnqueueOutcome, SessionBatcher};
use crate::registry::SessionRegistry;

/// Receive buffer size; one byte over the largest legal UDP payload.
const RECV_BUFFER_BYTES: usize = 65_536;

const PRUNE_INTERVAL: Duration = Duration::from_secs(60);

/// Receives attribute datagrams and feeds them to the batcher.
pub struct UdpRelay {
    socket: UdpSocket,
    decoder: PacketDecoder,
    registry: SessionRegistry,
    batcher: SessionBatcher,
}

impl UdpRelay {
    pub async fn bind(
        addr: &str,
        registry: SessionRegistry,
        batcher: SessionBatcher,
    ) -> Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        info!(addr = %socket.local_addr()?, "UDP relay listening");

        Ok(Self {
            socket,
            decoder: PacketDecoder::new(),
            registry,
            batcher,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    pub fn batcher(&self) -> &SessionBatcher {
        &self.batcher
    }

    /// Receive until `shutdown` completes. Bad packets are logged and skipped.
    pub async fn run<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let mut buf = vec![0u8; RECV_BUFFER_BYTES];
        let mut prune = tokio::time::interval(PRUNE_INTERVAL);
        prune.tick().await;
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = prune.tick() => {
                    let pruned = self.batcher.prune_idle(self.registry.session_idle());
                    if pruned > 0 {
                        debug!(pruned = pruned, "Pruned idle sessions");
                    }
                }
                received = self.socket.recv_from(&mut buf) => match received {
                    Ok((len, peer)) => {
                        if let Err(e) = self.handle_datagram(&buf[..len], peer).await {
                            warn!(peer = %peer, len = len, error = %e, "Dropped datagram");
                        }
                    }
                    Err(e) => warn!(error = %e, "UDP receive failed"),
                },
            }
        }

        info!("UDP relay stopped");
        Ok(())
    }

    /// Decode one datagram and enqueue its attribute.
    pub async fn handle_datagram(&self, bytes: &[u8], peer: SocketAddr) -> Result<EnqueueOutcome> {
        metrics().packets_received.inc();

        let packet = match self.decoder.decode(bytes) {
            Ok(packet) => packet,
            Err(e) => {
                metrics().packets_malformed.inc();
                return Err(e);
            }
        };

        let resolution = self.registry.resolve(peer, packet.session_id).await;
        Ok(self.batcher.enqueue(&resolution.session_id, packet.payload))
    }
}
