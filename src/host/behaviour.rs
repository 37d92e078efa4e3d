// Composed swarm behaviour for the overlay host.

use libp2p::kad::store::MemoryStore;
use libp2p::swarm::behaviour::toggle::Toggle;
use libp2p::swarm::NetworkBehaviour;
use libp2p::{dcutr, gossipsub, identify, identity, kad, mdns, ping, relay, upnp, StreamProtocol};
use std::time::Duration;

use crate::config::P2pConfig;
use crate::error::BibError;

const IDENTIFY_PROTOCOL: &str = "/bib/1.0.0";
const KAD_PROTOCOL: StreamProtocol = StreamProtocol::new("/bib/kad/1.0.0");

/// Upper bound on a single gossip message.
pub const MAX_GOSSIP_SIZE: usize = 1024 * 1024;

#[derive(NetworkBehaviour)]
pub(crate) struct BibBehaviour {
    pub stream: libp2p_stream::Behaviour,
    pub gossipsub: gossipsub::Behaviour,
    pub identify: identify::Behaviour,
    pub ping: ping::Behaviour,
    pub kademlia: Toggle<kad::Behaviour<MemoryStore>>,
    pub mdns: Toggle<mdns::tokio::Behaviour>,
    pub upnp: upnp::tokio::Behaviour,
    pub relay: relay::client::Behaviour,
    pub dcutr: dcutr::Behaviour,
}

impl BibBehaviour {
    pub(crate) fn new(
        keypair: &identity::Keypair,
        relay: relay::client::Behaviour,
        config: &P2pConfig,
    ) -> std::result::Result<Self, BibError> {
        let peer_id = keypair.public().to_peer_id();

        let gossip_config = gossipsub::ConfigBuilder::default()
            .validation_mode(gossipsub::ValidationMode::Strict)
            .max_transmit_size(MAX_GOSSIP_SIZE)
            .heartbeat_interval(Duration::from_secs(1))
            .build()
            .map_err(|e| BibError::InvalidInput(format!("gossipsub config: {e}")))?;
        let gossipsub = gossipsub::Behaviour::new(
            gossipsub::MessageAuthenticity::Signed(keypair.clone()),
            gossip_config,
        )
        .map_err(|e| BibError::InvalidInput(format!("gossipsub: {e}")))?;

        let identify = identify::Behaviour::new(
            identify::Config::new(IDENTIFY_PROTOCOL.to_string(), keypair.public())
                .with_agent_version(format!("bib/{}", env!("CARGO_PKG_VERSION"))),
        );

        let kademlia = if config.dht.enabled {
            let store = MemoryStore::new(peer_id);
            let kad_config = kad::Config::new(KAD_PROTOCOL);
            let mut behaviour = kad::Behaviour::with_config(peer_id, store, kad_config);
            match config.dht.mode.as_str() {
                "server" => behaviour.set_mode(Some(kad::Mode::Server)),
                "client" => behaviour.set_mode(Some(kad::Mode::Client)),
                // Auto: follow reachability as reported by identify.
                _ => behaviour.set_mode(None),
            }
            Some(behaviour)
        } else {
            None
        };

        let mdns = if config.mdns.enabled {
            let behaviour = mdns::tokio::Behaviour::new(mdns::Config::default(), peer_id)
                .map_err(BibError::transport)?;
            Some(behaviour)
        } else {
            None
        };

        Ok(Self {
            stream: libp2p_stream::Behaviour::new(),
            gossipsub,
            identify,
            ping: ping::Behaviour::new(ping::Config::new()),
            kademlia: Toggle::from(kademlia),
            mdns: Toggle::from(mdns),
            upnp: upnp::tokio::Behaviour::default(),
            relay,
            dcutr: dcutr::Behaviour::new(peer_id),
        })
    }
}
