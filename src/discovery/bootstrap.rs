// Bootstrap connector: keeps configured peers connected.
//
// One task per bootstrap peer. Failed dials back off exponentially up to
// a cap; a successful dial switches the task into a 10 s connectedness
// monitor, and a drop falls back to dialing with the backoff reset.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::BootstrapConfig;
use crate::error::{BibError, Result};
use crate::host::Host;
use crate::peer_store::{PeerInfo, PeerStore};

const MONITOR_INTERVAL: Duration = Duration::from_secs(10);

pub(crate) struct Bootstrapper {
    host: Arc<Host>,
    peer_store: Arc<PeerStore>,
    config: BootstrapConfig,
    peers: Vec<PeerInfo>,
    connected: Arc<AtomicUsize>,
    notify: Arc<Notify>,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl Bootstrapper {
    pub(crate) fn new(
        host: Arc<Host>,
        peer_store: Arc<PeerStore>,
        config: BootstrapConfig,
        peers: Vec<PeerInfo>,
    ) -> Self {
        Self {
            host,
            peer_store,
            config,
            peers,
            connected: Arc::new(AtomicUsize::new(0)),
            notify: Arc::new(Notify::new()),
            tasks: parking_lot::Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn connected_count(&self) -> usize {
        self.connected.load(Ordering::SeqCst)
    }

    /// Spawn the per-peer connectors and block until `min_peers` are up or
    /// the token fires.
    pub(crate) async fn start(&self, shutdown: CancellationToken) -> Result<()> {
        for info in self.peers.clone() {
            let task = tokio::spawn(run_peer(
                Arc::clone(&self.host),
                Arc::clone(&self.peer_store),
                info,
                self.config.retry_interval(),
                self.config.max_retry_interval(),
                Arc::clone(&self.connected),
                Arc::clone(&self.notify),
                shutdown.clone(),
            ));
            self.tasks.lock().push(task);
        }

        let min_peers = self.config.min_peers.min(self.peers.len());
        while self.connected.load(Ordering::SeqCst) < min_peers {
            tokio::select! {
                _ = shutdown.cancelled() => return Err(BibError::Cancelled),
                _ = self.notify.notified() => {}
            }
        }
        Ok(())
    }

    pub(crate) async fn stop(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_peer(
    host: Arc<Host>,
    peer_store: Arc<PeerStore>,
    info: PeerInfo,
    retry_interval: Duration,
    max_retry_interval: Duration,
    connected: Arc<AtomicUsize>,
    notify: Arc<Notify>,
    shutdown: CancellationToken,
) {
    let peer = info.peer_id;
    let mut backoff = retry_interval;

    loop {
        if shutdown.is_cancelled() {
            return;
        }

        let started = Instant::now();
        match host.connect(&info).await {
            Ok(()) => {
                let latency_ms = started.elapsed().as_secs_f64() * 1000.0;
                if let Err(e) = peer_store.record_connection(&peer, true, latency_ms) {
                    tracing::warn!(peer = %peer, error = %e, "Failed to record bootstrap connection");
                }
                tracing::info!(peer = %peer, latency_ms, "Bootstrap peer connected");
                connected.fetch_add(1, Ordering::SeqCst);
                notify.notify_waiters();
                backoff = retry_interval;

                // Watch the connection until it drops.
                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => return,
                        _ = tokio::time::sleep(MONITOR_INTERVAL) => {
                            match host.connectedness(peer).await {
                                Ok(true) => {}
                                _ => {
                                    tracing::info!(peer = %peer, "Bootstrap peer disconnected");
                                    connected.fetch_sub(1, Ordering::SeqCst);
                                    break;
                                }
                            }
                        }
                    }
                }
            }
            Err(e) => {
                tracing::debug!(peer = %peer, error = %e, backoff_secs = backoff.as_secs(), "Bootstrap dial failed");
                if let Err(e) = peer_store.record_connection(&peer, false, 0.0) {
                    tracing::warn!(peer = %peer, error = %e, "Failed to record bootstrap failure");
                }
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = tokio::time::sleep(backoff) => {}
                }
                backoff = (backoff * 2).min(max_retry_interval);
            }
        }
    }
}
