// Overlay transport host.
//
// One swarm, one event-loop task. The public handle talks to the loop
// over an mpsc command channel and surfaces network events on a broadcast
// channel. Named-protocol streams are opened and accepted through a
// `libp2p-stream` control handle, which works independently of the
// command channel.

mod bandwidth;
mod behaviour;

pub use bandwidth::{BandwidthCounter, BandwidthStats};
pub(crate) use behaviour::MAX_GOSSIP_SIZE;

use behaviour::{BibBehaviour, BibBehaviourEvent};
use futures::StreamExt;
use libp2p::gossipsub::{IdentTopic, TopicHash};
use libp2p::swarm::dial_opts::DialOpts;
use libp2p::swarm::SwarmEvent;
use libp2p::{gossipsub, identify, kad, mdns, noise, tcp, yamux, Multiaddr, PeerId, Swarm};
use libp2p_stream::Control;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::P2pConfig;
use crate::error::{BibError, Result};
use crate::identity::Identity;
use crate::peer_store::PeerInfo;

/// How often the watermark policy re-evaluates the connection count.
const CONN_MANAGER_TICK: Duration = Duration::from_secs(60);

/// Bounded wait for the event loop to wind down in `close`.
const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(5);

/// Scoring seam used by the watermark pruner. Installed by discovery so
/// the host never holds a peer-store handle of its own.
pub trait PeerScorer: Send + Sync {
    fn score(&self, peer: &PeerId) -> f64;
    fn is_bootstrap(&self, peer: &PeerId) -> bool;
}

/// Events surfaced to discovery, pubsub and the mode handlers.
#[derive(Debug, Clone)]
pub enum HostEvent {
    PeerConnected(PeerId),
    PeerDisconnected(PeerId),
    MdnsDiscovered(PeerInfo),
    Gossip {
        topic: TopicHash,
        source: Option<PeerId>,
        data: Vec<u8>,
    },
    NewListenAddr(Multiaddr),
}

enum HostCommand {
    Dial {
        peer: PeerId,
        addrs: Vec<Multiaddr>,
        reply: oneshot::Sender<Result<()>>,
    },
    Disconnect {
        peer: PeerId,
        reply: oneshot::Sender<Result<()>>,
    },
    Peers {
        reply: oneshot::Sender<Vec<PeerId>>,
    },
    Connectedness {
        peer: PeerId,
        reply: oneshot::Sender<bool>,
    },
    ListenAddrs {
        reply: oneshot::Sender<Vec<Multiaddr>>,
    },
    Publish {
        topic: String,
        data: Vec<u8>,
        reply: oneshot::Sender<Result<()>>,
    },
    Subscribe {
        topic: String,
        reply: oneshot::Sender<Result<()>>,
    },
    FindClosest {
        peer: PeerId,
        reply: oneshot::Sender<Result<Vec<PeerInfo>>>,
    },
    FindProviders {
        key: Vec<u8>,
        reply: oneshot::Sender<Result<Vec<PeerId>>>,
    },
    KadAddAddress {
        peer: PeerId,
        addr: Multiaddr,
    },
    KadBootstrap {
        reply: oneshot::Sender<Result<()>>,
    },
}

/// The overlay host handle.
pub struct Host {
    identity: Arc<Identity>,
    commands: mpsc::Sender<HostCommand>,
    control: Control,
    events: broadcast::Sender<HostEvent>,
    bandwidth: Arc<BandwidthCounter>,
    scorer: Arc<parking_lot::RwLock<Option<Arc<dyn PeerScorer>>>>,
    shutdown: CancellationToken,
    event_loop: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl Host {
    /// Compose identity, transports and behaviours, start listening and
    /// spawn the event loop.
    pub fn new(config: &P2pConfig, config_dir: &Path) -> Result<Self> {
        let identity = Arc::new(Identity::load_or_generate(
            config.identity.key_path.as_deref(),
            config_dir,
        )?);

        let mut swarm = libp2p::SwarmBuilder::with_existing_identity(identity.keypair().clone())
            .with_tokio()
            .with_tcp(
                tcp::Config::default().nodelay(true),
                noise::Config::new,
                yamux::Config::default,
            )
            .map_err(BibError::transport)?
            .with_quic()
            .with_dns()
            .map_err(BibError::transport)?
            .with_relay_client(noise::Config::new, yamux::Config::default)
            .map_err(BibError::transport)?
            .with_behaviour(|key, relay| {
                BibBehaviour::new(key, relay, config)
                    .map_err(|e| Box::new(e) as Box<dyn std::error::Error + Send + Sync>)
            })
            .map_err(|e| BibError::InvalidInput(format!("behaviour: {e}")))?
            .with_swarm_config(|c| c.with_idle_connection_timeout(Duration::from_secs(60)))
            .build();

        for addr in &config.listen_addresses {
            let parsed: Multiaddr = addr
                .parse()
                .map_err(|e| BibError::InvalidInput(format!("listen address {addr}: {e}")))?;
            swarm
                .listen_on(parsed)
                .map_err(BibError::transport)?;
        }

        let control = swarm.behaviour().stream.new_control();
        let bandwidth = Arc::new(BandwidthCounter::new(config.metrics.bandwidth_metering));
        let (commands_tx, commands_rx) = mpsc::channel(64);
        let (events_tx, _) = broadcast::channel(256);
        let scorer: Arc<parking_lot::RwLock<Option<Arc<dyn PeerScorer>>>> =
            Arc::new(parking_lot::RwLock::new(None));
        let shutdown = CancellationToken::new();

        let event_loop = EventLoop {
            swarm,
            commands: commands_rx,
            events: events_tx.clone(),
            scorer: Arc::clone(&scorer),
            shutdown: shutdown.clone(),
            local_peer_id: identity.peer_id(),
            connected: HashMap::new(),
            pending_dials: HashMap::new(),
            pending_queries: HashMap::new(),
            pending_provider_queries: HashMap::new(),
            low_watermark: config.conn_manager.low_watermark,
            high_watermark: config.conn_manager.high_watermark,
            grace_period: config.conn_manager.grace_period(),
        };
        let handle = tokio::spawn(event_loop.run());

        tracing::info!(peer_id = %identity.peer_id(), "Host started");

        Ok(Self {
            identity,
            commands: commands_tx,
            control,
            events: events_tx,
            bandwidth,
            scorer,
            shutdown,
            event_loop: parking_lot::Mutex::new(Some(handle)),
        })
    }

    pub fn local_peer_id(&self) -> PeerId {
        self.identity.peer_id()
    }

    pub fn identity(&self) -> &Arc<Identity> {
        &self.identity
    }

    /// Stream control for opening and accepting named-protocol streams.
    pub fn stream_control(&self) -> Control {
        self.control.clone()
    }

    /// Open a named-protocol stream to a connected peer.
    pub async fn new_stream(
        &self,
        peer: PeerId,
        protocol: libp2p::StreamProtocol,
    ) -> Result<libp2p::Stream> {
        self.control
            .clone()
            .open_stream(peer, protocol)
            .await
            .map_err(BibError::transport)
    }

    /// Register as the handler for a protocol id, receiving its incoming
    /// streams. At most one handler per protocol.
    pub fn accept_streams(
        &self,
        protocol: libp2p::StreamProtocol,
    ) -> Result<libp2p_stream::IncomingStreams> {
        self.control
            .clone()
            .accept(protocol)
            .map_err(BibError::transport)
    }

    pub fn bandwidth(&self) -> Arc<BandwidthCounter> {
        Arc::clone(&self.bandwidth)
    }

    pub fn bandwidth_stats(&self) -> BandwidthStats {
        self.bandwidth.stats()
    }

    /// Install the scoring seam used by the watermark pruner.
    pub fn set_peer_scorer(&self, scorer: Arc<dyn PeerScorer>) {
        *self.scorer.write() = Some(scorer);
    }

    pub fn events(&self) -> broadcast::Receiver<HostEvent> {
        self.events.subscribe()
    }

    /// Dial a peer on its known addresses and wait for the connection.
    pub async fn connect(&self, info: &PeerInfo) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(HostCommand::Dial {
            peer: info.peer_id,
            addrs: info.addrs.clone(),
            reply,
        })
        .await?;
        rx.await.map_err(|_| BibError::Cancelled)?
    }

    pub async fn disconnect(&self, peer: PeerId) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(HostCommand::Disconnect { peer, reply }).await?;
        rx.await.map_err(|_| BibError::Cancelled)?
    }

    pub async fn peers(&self) -> Result<Vec<PeerId>> {
        let (reply, rx) = oneshot::channel();
        self.send(HostCommand::Peers { reply }).await?;
        rx.await.map_err(|_| BibError::Cancelled)
    }

    pub async fn connectedness(&self, peer: PeerId) -> Result<bool> {
        let (reply, rx) = oneshot::channel();
        self.send(HostCommand::Connectedness { peer, reply }).await?;
        rx.await.map_err(|_| BibError::Cancelled)
    }

    pub async fn listen_addrs(&self) -> Result<Vec<Multiaddr>> {
        let (reply, rx) = oneshot::channel();
        self.send(HostCommand::ListenAddrs { reply }).await?;
        rx.await.map_err(|_| BibError::Cancelled)
    }

    pub async fn publish(&self, topic: &str, data: Vec<u8>) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(HostCommand::Publish {
            topic: topic.to_string(),
            data,
            reply,
        })
        .await?;
        rx.await.map_err(|_| BibError::Cancelled)?
    }

    pub async fn subscribe(&self, topic: &str) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(HostCommand::Subscribe {
            topic: topic.to_string(),
            reply,
        })
        .await?;
        rx.await.map_err(|_| BibError::Cancelled)?
    }

    /// DHT lookup for the peers closest to `peer`.
    pub async fn find_closest(&self, peer: PeerId) -> Result<Vec<PeerInfo>> {
        let (reply, rx) = oneshot::channel();
        self.send(HostCommand::FindClosest { peer, reply }).await?;
        rx.await.map_err(|_| BibError::Cancelled)?
    }

    /// DHT lookup for providers of a content key.
    pub async fn find_providers(&self, key: Vec<u8>) -> Result<Vec<PeerId>> {
        let (reply, rx) = oneshot::channel();
        self.send(HostCommand::FindProviders { key, reply }).await?;
        rx.await.map_err(|_| BibError::Cancelled)?
    }

    /// Seed the DHT routing table with a known peer address.
    pub async fn kad_add_address(&self, peer: PeerId, addr: Multiaddr) -> Result<()> {
        self.send(HostCommand::KadAddAddress { peer, addr }).await
    }

    pub async fn kad_bootstrap(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(HostCommand::KadBootstrap { reply }).await?;
        rx.await.map_err(|_| BibError::Cancelled)?
    }

    /// Cancel the event loop, releasing sockets, and wait for it to
    /// return within the shutdown deadline.
    pub async fn close(&self) -> Result<()> {
        self.shutdown.cancel();
        let handle = self.event_loop.lock().take();
        if let Some(handle) = handle {
            if tokio::time::timeout(SHUTDOWN_DEADLINE, handle).await.is_err() {
                return Err(BibError::timeout("host shutdown"));
            }
        }
        Ok(())
    }

    async fn send(&self, command: HostCommand) -> Result<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| BibError::Cancelled)
    }
}

struct EventLoop {
    swarm: Swarm<BibBehaviour>,
    commands: mpsc::Receiver<HostCommand>,
    events: broadcast::Sender<HostEvent>,
    scorer: Arc<parking_lot::RwLock<Option<Arc<dyn PeerScorer>>>>,
    shutdown: CancellationToken,
    local_peer_id: PeerId,
    connected: HashMap<PeerId, Instant>,
    pending_dials: HashMap<PeerId, Vec<oneshot::Sender<Result<()>>>>,
    pending_queries: HashMap<kad::QueryId, oneshot::Sender<Result<Vec<PeerInfo>>>>,
    pending_provider_queries: HashMap<kad::QueryId, oneshot::Sender<Result<Vec<PeerId>>>>,
    low_watermark: usize,
    high_watermark: usize,
    grace_period: Duration,
}

impl EventLoop {
    async fn run(mut self) {
        let mut conn_tick = tokio::time::interval(CONN_MANAGER_TICK);
        conn_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = conn_tick.tick() => self.enforce_watermarks(),
                command = self.commands.recv() => {
                    let Some(command) = command else { break };
                    self.handle_command(command);
                }
                event = self.swarm.select_next_some() => self.handle_swarm_event(event),
            }
        }

        // Fail any callers still waiting on a dial or query.
        for (_, waiters) in self.pending_dials.drain() {
            for waiter in waiters {
                let _ = waiter.send(Err(BibError::Cancelled));
            }
        }
        for (_, waiter) in self.pending_queries.drain() {
            let _ = waiter.send(Err(BibError::Cancelled));
        }
        for (_, waiter) in self.pending_provider_queries.drain() {
            let _ = waiter.send(Err(BibError::Cancelled));
        }
        tracing::debug!("Host event loop stopped");
    }

    fn handle_command(&mut self, command: HostCommand) {
        match command {
            HostCommand::Dial { peer, addrs, reply } => {
                if self.swarm.is_connected(&peer) {
                    let _ = reply.send(Ok(()));
                    return;
                }
                let opts = DialOpts::peer_id(peer).addresses(addrs).build();
                match self.swarm.dial(opts) {
                    Ok(()) => {
                        self.pending_dials.entry(peer).or_default().push(reply);
                    }
                    Err(e) => {
                        let _ = reply.send(Err(BibError::transport(e)));
                    }
                }
            }
            HostCommand::Disconnect { peer, reply } => {
                let result = self
                    .swarm
                    .disconnect_peer_id(peer)
                    .map_err(|_| BibError::not_found(format!("connection to {peer}")));
                let _ = reply.send(result);
            }
            HostCommand::Peers { reply } => {
                let _ = reply.send(self.connected.keys().copied().collect());
            }
            HostCommand::Connectedness { peer, reply } => {
                let _ = reply.send(self.swarm.is_connected(&peer));
            }
            HostCommand::ListenAddrs { reply } => {
                let _ = reply.send(self.swarm.listeners().cloned().collect());
            }
            HostCommand::Publish { topic, data, reply } => {
                let result = self
                    .swarm
                    .behaviour_mut()
                    .gossipsub
                    .publish(IdentTopic::new(topic), data)
                    .map(|_| ())
                    .map_err(BibError::transport);
                let _ = reply.send(result);
            }
            HostCommand::Subscribe { topic, reply } => {
                let result = self
                    .swarm
                    .behaviour_mut()
                    .gossipsub
                    .subscribe(&IdentTopic::new(topic))
                    .map(|_| ())
                    .map_err(BibError::transport);
                let _ = reply.send(result);
            }
            HostCommand::FindClosest { peer, reply } => {
                match self.swarm.behaviour_mut().kademlia.as_mut() {
                    Some(kademlia) => {
                        let query = kademlia.get_closest_peers(peer);
                        self.pending_queries.insert(query, reply);
                    }
                    None => {
                        let _ = reply.send(Err(BibError::InvalidInput(
                            "DHT is disabled".to_string(),
                        )));
                    }
                }
            }
            HostCommand::FindProviders { key, reply } => {
                match self.swarm.behaviour_mut().kademlia.as_mut() {
                    Some(kademlia) => {
                        let query = kademlia.get_providers(key.into());
                        self.pending_provider_queries.insert(query, reply);
                    }
                    None => {
                        let _ = reply.send(Err(BibError::InvalidInput(
                            "DHT is disabled".to_string(),
                        )));
                    }
                }
            }
            HostCommand::KadAddAddress { peer, addr } => {
                if let Some(kademlia) = self.swarm.behaviour_mut().kademlia.as_mut() {
                    kademlia.add_address(&peer, addr);
                }
            }
            HostCommand::KadBootstrap { reply } => {
                let result = match self.swarm.behaviour_mut().kademlia.as_mut() {
                    Some(kademlia) => kademlia
                        .bootstrap()
                        .map(|_| ())
                        .map_err(BibError::transport),
                    None => Err(BibError::InvalidInput("DHT is disabled".to_string())),
                };
                let _ = reply.send(result);
            }
        }
    }

    fn handle_swarm_event(&mut self, event: SwarmEvent<BibBehaviourEvent>) {
        match event {
            SwarmEvent::NewListenAddr { address, .. } => {
                tracing::info!(address = %address, "Listening");
                let _ = self.events.send(HostEvent::NewListenAddr(address));
            }
            SwarmEvent::ConnectionEstablished {
                peer_id,
                num_established,
                ..
            } => {
                if num_established.get() == 1 {
                    self.connected.insert(peer_id, Instant::now());
                    let _ = self.events.send(HostEvent::PeerConnected(peer_id));
                }
                if let Some(waiters) = self.pending_dials.remove(&peer_id) {
                    for waiter in waiters {
                        let _ = waiter.send(Ok(()));
                    }
                }
            }
            SwarmEvent::ConnectionClosed {
                peer_id,
                num_established,
                ..
            } => {
                if num_established == 0 {
                    self.connected.remove(&peer_id);
                    let _ = self.events.send(HostEvent::PeerDisconnected(peer_id));
                }
            }
            SwarmEvent::OutgoingConnectionError { peer_id, error, .. } => {
                if let Some(peer) = peer_id {
                    tracing::debug!(peer = %peer, error = %error, "Outgoing connection failed");
                    if let Some(waiters) = self.pending_dials.remove(&peer) {
                        for waiter in waiters {
                            let _ = waiter.send(Err(BibError::transport(std::io::Error::other(
                                error.to_string(),
                            ))));
                        }
                    }
                }
            }
            SwarmEvent::Behaviour(event) => self.handle_behaviour_event(event),
            _ => {}
        }
    }

    fn handle_behaviour_event(&mut self, event: BibBehaviourEvent) {
        match event {
            BibBehaviourEvent::Mdns(mdns::Event::Discovered(peers)) => {
                let mut by_peer: HashMap<PeerId, Vec<Multiaddr>> = HashMap::new();
                for (peer, addr) in peers {
                    if peer == self.local_peer_id {
                        continue;
                    }
                    by_peer.entry(peer).or_default().push(addr);
                }
                for (peer_id, addrs) in by_peer {
                    let _ = self
                        .events
                        .send(HostEvent::MdnsDiscovered(PeerInfo { peer_id, addrs }));
                }
            }
            BibBehaviourEvent::Mdns(mdns::Event::Expired(_)) => {}
            BibBehaviourEvent::Gossipsub(gossipsub::Event::Message { message, .. }) => {
                let _ = self.events.send(HostEvent::Gossip {
                    topic: message.topic,
                    source: message.source,
                    data: message.data,
                });
            }
            BibBehaviourEvent::Identify(identify::Event::Received { peer_id, info, .. }) => {
                // Feed identified listen addresses into the routing table.
                if let Some(kademlia) = self.swarm.behaviour_mut().kademlia.as_mut() {
                    for addr in info.listen_addrs {
                        kademlia.add_address(&peer_id, addr);
                    }
                }
            }
            BibBehaviourEvent::Kademlia(kad::Event::OutboundQueryProgressed {
                id,
                result: kad::QueryResult::GetProviders(result),
                ..
            }) => {
                match result {
                    Ok(kad::GetProvidersOk::FoundProviders { providers, .. }) => {
                        if let Some(reply) = self.pending_provider_queries.remove(&id) {
                            let _ = reply.send(Ok(providers.into_iter().collect()));
                        }
                        if let Some(mut query) = self
                            .swarm
                            .behaviour_mut()
                            .kademlia
                            .as_mut()
                            .and_then(|k| k.query_mut(&id))
                        {
                            query.finish();
                        }
                    }
                    Ok(kad::GetProvidersOk::FinishedWithNoAdditionalRecord { .. }) => {
                        if let Some(reply) = self.pending_provider_queries.remove(&id) {
                            let _ = reply.send(Ok(Vec::new()));
                        }
                    }
                    Err(e) => {
                        if let Some(reply) = self.pending_provider_queries.remove(&id) {
                            let _ = reply.send(Err(BibError::transport(std::io::Error::other(
                                e.to_string(),
                            ))));
                        }
                    }
                }
            }
            BibBehaviourEvent::Kademlia(kad::Event::OutboundQueryProgressed {
                id,
                result: kad::QueryResult::GetClosestPeers(result),
                ..
            }) => {
                if let Some(reply) = self.pending_queries.remove(&id) {
                    let outcome = match result {
                        Ok(ok) => Ok(ok
                            .peers
                            .into_iter()
                            .map(|info| PeerInfo {
                                peer_id: info.peer_id,
                                addrs: info.addrs,
                            })
                            .collect()),
                        Err(e) => Err(BibError::transport(std::io::Error::other(e.to_string()))),
                    };
                    let _ = reply.send(outcome);
                }
            }
            _ => {}
        }
    }

    /// When connected peers exceed the high watermark, close the
    /// lowest-scored non-bootstrap connections past the grace period until
    /// the count is back at the low watermark.
    fn enforce_watermarks(&mut self) {
        if self.connected.len() <= self.high_watermark {
            return;
        }
        let scorer = self.scorer.read().clone();
        let Some(scorer) = scorer else {
            return;
        };

        let mut candidates: Vec<(PeerId, f64)> = self
            .connected
            .iter()
            .filter(|(peer, since)| {
                since.elapsed() >= self.grace_period && !scorer.is_bootstrap(peer)
            })
            .map(|(peer, _)| (*peer, scorer.score(peer)))
            .collect();
        candidates.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));

        let excess = self.connected.len().saturating_sub(self.low_watermark);
        for (peer, score) in candidates.into_iter().take(excess) {
            tracing::debug!(peer = %peer, score, "Pruning connection over high watermark");
            let _ = self.swarm.disconnect_peer_id(peer);
        }
    }
}
