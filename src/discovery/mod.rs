// Peer discovery: bootstrap connector, local mDNS and the DHT behind one
// API.
//
// Discovery owns handles to the host and the peer store; neither holds a
// handle back. It is the single writer of network events into the peer
// store, via the connection notifier attached to the host's event stream.

mod bootstrap;

use bootstrap::Bootstrapper;
use libp2p::multiaddr::Protocol;
use libp2p::{Multiaddr, PeerId};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::P2pConfig;
use crate::error::{BibError, Result};
use crate::host::{Host, HostEvent, PeerScorer};
use crate::peer_store::{now_secs, PeerInfo, PeerStore};

const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(3600);

/// Non-bootstrap peers unseen for this long are pruned by maintenance.
const PEER_MAX_AGE: Duration = Duration::from_secs(30 * 24 * 3600);

/// Parse configured bootstrap multiaddrs into per-peer address books.
/// Every address must embed a `/p2p/<peer-id>` component; addresses of the
/// same peer are merged and duplicates collapse into one entry.
pub fn parse_bootstrap_peers(addrs: &[String]) -> Result<Vec<PeerInfo>> {
    let mut by_peer: HashMap<PeerId, Vec<Multiaddr>> = HashMap::new();
    let mut order: Vec<PeerId> = Vec::new();

    for raw in addrs {
        let addr: Multiaddr = raw
            .parse()
            .map_err(|e| BibError::InvalidInput(format!("bootstrap address {raw}: {e}")))?;
        let peer_id = match addr.iter().last() {
            Some(Protocol::P2p(peer_id)) => peer_id,
            _ => {
                return Err(BibError::InvalidInput(format!(
                    "bootstrap address {raw} has no /p2p/<peer-id> component"
                )));
            }
        };
        let entry = by_peer.entry(peer_id).or_insert_with(|| {
            order.push(peer_id);
            Vec::new()
        });
        if !entry.contains(&addr) {
            entry.push(addr);
        }
    }

    Ok(order
        .into_iter()
        .map(|peer_id| PeerInfo {
            addrs: by_peer.remove(&peer_id).unwrap_or_default(),
            peer_id,
        })
        .collect())
}

/// Watermark scoring backed by the peer store.
struct StoreScorer {
    peer_store: Arc<PeerStore>,
}

impl PeerScorer for StoreScorer {
    fn score(&self, peer: &PeerId) -> f64 {
        match self.peer_store.get_peer(peer) {
            Ok(Some(record)) => record.score(now_secs()),
            _ => 0.0,
        }
    }

    fn is_bootstrap(&self, peer: &PeerId) -> bool {
        matches!(self.peer_store.get_peer(peer), Ok(Some(record)) if record.is_bootstrap)
    }
}

/// Composed discovery over bootstrap, mDNS and DHT sources.
pub struct Discovery {
    host: Arc<Host>,
    peer_store: Arc<PeerStore>,
    bootstrapper: Arc<Bootstrapper>,
    dht_enabled: bool,
    bootstrap_peers: Vec<PeerInfo>,
    shutdown: CancellationToken,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl Discovery {
    pub fn new(host: Arc<Host>, peer_store: Arc<PeerStore>, config: &P2pConfig) -> Result<Self> {
        let bootstrap_peers = parse_bootstrap_peers(&config.bootstrap.peers)?;

        host.set_peer_scorer(Arc::new(StoreScorer {
            peer_store: Arc::clone(&peer_store),
        }));

        let bootstrapper = Arc::new(Bootstrapper::new(
            Arc::clone(&host),
            Arc::clone(&peer_store),
            config.bootstrap.clone(),
            bootstrap_peers.clone(),
        ));

        Ok(Self {
            host,
            peer_store,
            bootstrapper,
            dht_enabled: config.dht.enabled,
            bootstrap_peers,
            shutdown: CancellationToken::new(),
            tasks: parking_lot::Mutex::new(Vec::new()),
        })
    }

    /// Start all sources. Returns once `min_peers` bootstrap peers are
    /// connected or `ctx` is cancelled.
    pub async fn start(&self, ctx: CancellationToken) -> Result<()> {
        // Bootstrap records exist before any connection attempt so failures
        // have a row to count against. Never pruned.
        for info in &self.bootstrap_peers {
            self.peer_store.add_peer(info, true)?;
        }

        self.spawn_notifier();
        self.spawn_maintenance();

        if self.dht_enabled {
            for info in &self.bootstrap_peers {
                for addr in &info.addrs {
                    self.host.kad_add_address(info.peer_id, addr.clone()).await?;
                }
            }
        }

        let shutdown = self.shutdown.clone();
        let linked = CancellationToken::new();
        {
            let linked = linked.clone();
            let ctx = ctx.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = ctx.cancelled() => linked.cancel(),
                    _ = shutdown.cancelled() => linked.cancel(),
                }
            });
        }
        self.bootstrapper.start(linked).await?;

        if self.dht_enabled && !self.bootstrap_peers.is_empty() {
            if let Err(e) = self.host.kad_bootstrap().await {
                tracing::warn!(error = %e, "DHT bootstrap failed");
            }
        }
        Ok(())
    }

    /// Resolve a peer's addresses: peer store first, then the DHT.
    pub async fn find_peer(&self, peer: PeerId) -> Result<PeerInfo> {
        if let Some(record) = self.peer_store.get_peer(&peer)? {
            if !record.addrs.is_empty() {
                return Ok(PeerInfo {
                    peer_id: peer,
                    addrs: record.addrs,
                });
            }
        }

        if self.dht_enabled {
            let closest = self.host.find_closest(peer).await?;
            if let Some(info) = closest.into_iter().find(|info| info.peer_id == peer) {
                if !info.addrs.is_empty() {
                    return Ok(info);
                }
            }
        }

        Err(BibError::not_found(format!("peer {peer}")))
    }

    /// DHT provider lookup for a content key.
    pub async fn find_providers(&self, key: &[u8]) -> Result<Vec<PeerId>> {
        if !self.dht_enabled {
            return Err(BibError::InvalidInput("DHT is disabled".to_string()));
        }
        self.host.find_providers(key.to_vec()).await
    }

    pub fn connected_bootstrap_peers(&self) -> usize {
        self.bootstrapper.connected_count()
    }

    pub async fn stop(&self) {
        self.shutdown.cancel();
        self.bootstrapper.stop().await;
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }

    /// Forward host connection and mDNS events into the peer store, and
    /// dial freshly discovered local peers.
    fn spawn_notifier(&self) {
        let mut events = self.host.events();
        let host = Arc::clone(&self.host);
        let peer_store = Arc::clone(&self.peer_store);
        let shutdown = self.shutdown.clone();

        let task = tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    event = events.recv() => match event {
                        Ok(event) => event,
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::warn!(skipped, "Discovery notifier lagged behind host events");
                            continue;
                        }
                        Err(_) => break,
                    },
                };

                match event {
                    HostEvent::PeerConnected(peer_id) => {
                        let info = PeerInfo {
                            peer_id,
                            addrs: Vec::new(),
                        };
                        if let Err(e) = peer_store.add_peer(&info, false) {
                            tracing::warn!(peer = %peer_id, error = %e, "Failed to record connected peer");
                        }
                    }
                    HostEvent::PeerDisconnected(peer_id) => {
                        tracing::debug!(peer = %peer_id, "Peer disconnected");
                    }
                    HostEvent::MdnsDiscovered(info) => {
                        tracing::debug!(peer = %info.peer_id, "mDNS discovered peer");
                        if let Err(e) = peer_store.add_peer(&info, false) {
                            tracing::warn!(peer = %info.peer_id, error = %e, "Failed to store mDNS peer");
                            continue;
                        }
                        let host = Arc::clone(&host);
                        let peer_store = Arc::clone(&peer_store);
                        tokio::spawn(async move {
                            let peer = info.peer_id;
                            let started = std::time::Instant::now();
                            let outcome = host.connect(&info).await;
                            let latency_ms = started.elapsed().as_secs_f64() * 1000.0;
                            let success = outcome.is_ok();
                            if let Err(e) = outcome {
                                tracing::debug!(peer = %peer, error = %e, "mDNS dial failed");
                            }
                            if let Err(e) =
                                peer_store.record_connection(&peer, success, latency_ms)
                            {
                                tracing::warn!(peer = %peer, error = %e, "Failed to record mDNS dial");
                            }
                        });
                    }
                    _ => {}
                }
            }
        });
        self.tasks.lock().push(task);
    }

    fn spawn_maintenance(&self) {
        let peer_store = Arc::clone(&self.peer_store);
        let shutdown = self.shutdown.clone();

        let task = tokio::spawn(async move {
            let mut tick = tokio::time::interval(MAINTENANCE_INTERVAL);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // Skip the immediate first tick.
            tick.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tick.tick() => {
                        match peer_store.prune_old_peers(PEER_MAX_AGE) {
                            Ok(0) => {}
                            Ok(removed) => {
                                tracing::info!(removed, "Pruned stale peer records");
                            }
                            Err(e) => {
                                tracing::warn!(error = %e, "Peer store maintenance failed");
                            }
                        }
                    }
                }
            }
        });
        self.tasks.lock().push(task);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bootstrap_peers_merges_by_peer_id() {
        let peer = PeerId::random();
        let other = PeerId::random();
        let addrs = vec![
            format!("/ip4/10.0.0.1/tcp/4001/p2p/{peer}"),
            format!("/ip4/10.0.0.1/udp/4001/quic-v1/p2p/{peer}"),
            // Exact duplicate collapses.
            format!("/ip4/10.0.0.1/tcp/4001/p2p/{peer}"),
            format!("/dns4/boot.example.org/tcp/4001/p2p/{other}"),
        ];

        let parsed = parse_bootstrap_peers(&addrs).unwrap();
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].peer_id, peer);
        assert_eq!(parsed[0].addrs.len(), 2);
        assert_eq!(parsed[1].peer_id, other);
        assert_eq!(parsed[1].addrs.len(), 1);
    }

    #[test]
    fn test_parse_bootstrap_peers_requires_peer_id() {
        let err = parse_bootstrap_peers(&["/ip4/10.0.0.1/tcp/4001".to_string()]).unwrap_err();
        assert!(matches!(err, BibError::InvalidInput(_)));

        let err = parse_bootstrap_peers(&["not-a-multiaddr".to_string()]).unwrap_err();
        assert!(matches!(err, BibError::InvalidInput(_)));
    }
}
