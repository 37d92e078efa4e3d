// Signed gossip over the host's pubsub overlay.
//
// Every message travels in an envelope signed by the sender's node key.
// Verification recovers the public key from the sender's peer id, so a
// message is only accepted when the signature, the claimed sender and the
// gossip origin all agree. Strict mode (the default) rejects unsigned or
// malformed envelopes outright.

use libp2p::identity::PublicKey;
use libp2p::PeerId;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{BibError, Result};
use crate::host::{Host, HostEvent, MAX_GOSSIP_SIZE};
use crate::protocol::NodeStatus;

/// Node join/leave and new-dataset announcements.
pub const TOPIC_GLOBAL: &str = "/bib/global";

/// Periodic node status.
pub const TOPIC_NODES: &str = "/bib/nodes";

/// Per-topic catalog updates.
pub fn topic_for(topic_id: &str) -> String {
    format!("/bib/topics/{topic_id}")
}

/// Accepted clock skew, in both directions.
pub const DEFAULT_TTL: Duration = Duration::from_secs(300);

const STATUS_INTERVAL: Duration = Duration::from_secs(30);

/// Envelope kinds used by the node.
pub mod kind {
    pub const NODE_JOINED: &str = "node_joined";
    pub const NODE_LEFT: &str = "node_left";
    pub const NODE_STATUS: &str = "node_status";
    pub const DATASET_ANNOUNCED: &str = "dataset_announced";
    pub const CATALOG_UPDATED: &str = "catalog_updated";
}

/// The signed wire envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GossipEnvelope {
    #[serde(rename = "type")]
    pub kind: String,
    pub sender_peer_id: String,
    /// Unix nanoseconds at signing time.
    pub timestamp: i64,
    pub signature: Vec<u8>,
    pub payload: Vec<u8>,
}

/// An envelope that passed signature, origin and freshness checks.
#[derive(Debug, Clone)]
pub struct VerifiedMessage {
    pub topic: String,
    pub kind: String,
    pub sender: PeerId,
    pub timestamp: i64,
    pub payload: Vec<u8>,
}

fn signing_digest(kind: &str, sender: &str, timestamp: i64, payload: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(kind.as_bytes());
    hasher.update(sender.as_bytes());
    hasher.update(timestamp.to_be_bytes());
    hasher.update(payload);
    hasher.finalize().into()
}

/// Recover the Ed25519 public key embedded in a peer id.
fn public_key_of(peer: &PeerId) -> Option<PublicKey> {
    // An Ed25519 peer id is an identity multihash (code 0x00, then the
    // digest length) whose digest is the protobuf-encoded key itself.
    // Hashed peer ids carry no key and cannot be verified.
    let bytes = peer.to_bytes();
    if bytes.len() < 2 || bytes[0] != 0x00 {
        return None;
    }
    PublicKey::try_decode_protobuf(&bytes[2..]).ok()
}

fn unix_nanos() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as i64
}

/// Build and sign an envelope with the local identity.
pub fn sign_envelope(
    identity: &crate::identity::Identity,
    kind: &str,
    payload: Vec<u8>,
) -> GossipEnvelope {
    let sender = identity.peer_id().to_string();
    let timestamp = unix_nanos();
    let digest = signing_digest(kind, &sender, timestamp, &payload);
    GossipEnvelope {
        kind: kind.to_string(),
        sender_peer_id: sender,
        timestamp,
        signature: identity.sign(&digest),
        payload,
    }
}

/// Verify an envelope against its claimed sender and the freshness window.
pub fn verify_envelope(
    envelope: &GossipEnvelope,
    local_peer: &PeerId,
    ttl: Duration,
) -> Result<PeerId> {
    let sender = PeerId::from_str(&envelope.sender_peer_id)
        .map_err(|_| BibError::InvalidInput("unparseable sender peer id".to_string()))?;

    if sender == *local_peer {
        return Err(BibError::InvalidInput("message from self".to_string()));
    }

    let age = unix_nanos().abs_diff(envelope.timestamp);
    if age > ttl.as_nanos() as u64 {
        return Err(BibError::InvalidInput(format!(
            "message outside the {}s freshness window",
            ttl.as_secs()
        )));
    }

    let key = public_key_of(&sender).ok_or_else(|| {
        BibError::InvalidInput("sender peer id does not embed a public key".to_string())
    })?;
    let digest = signing_digest(
        &envelope.kind,
        &envelope.sender_peer_id,
        envelope.timestamp,
        &envelope.payload,
    );
    if !key.verify(&digest, &envelope.signature) {
        return Err(BibError::Unauthorized);
    }
    Ok(sender)
}

/// The gossip layer handle.
pub struct PubSub {
    host: Arc<Host>,
    strict: bool,
    ttl: Duration,
    messages: broadcast::Sender<VerifiedMessage>,
    shutdown: CancellationToken,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl PubSub {
    pub fn new(host: Arc<Host>) -> Self {
        let (messages, _) = broadcast::channel(256);
        Self {
            host,
            strict: true,
            ttl: DEFAULT_TTL,
            messages,
            shutdown: CancellationToken::new(),
            tasks: parking_lot::Mutex::new(Vec::new()),
        }
    }

    /// Accept unsigned or malformed envelopes (testing only).
    pub fn with_strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    /// Subscribe the standing topics and start the verifier task.
    pub async fn start(&self) -> Result<()> {
        self.host.subscribe(TOPIC_GLOBAL).await?;
        self.host.subscribe(TOPIC_NODES).await?;

        let mut events = self.host.events();
        let local_peer = self.host.local_peer_id();
        let strict = self.strict;
        let ttl = self.ttl;
        let messages = self.messages.clone();
        let shutdown = self.shutdown.clone();

        let task = tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    event = events.recv() => match event {
                        Ok(event) => event,
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::warn!(skipped, "Gossip verifier lagged behind host events");
                            continue;
                        }
                        Err(_) => break,
                    },
                };

                let HostEvent::Gossip { topic, data, .. } = event else {
                    continue;
                };
                if data.len() > MAX_GOSSIP_SIZE {
                    tracing::debug!(topic = %topic, size = data.len(), "Dropping oversized gossip message");
                    continue;
                }

                let envelope: GossipEnvelope = match serde_json::from_slice(&data) {
                    Ok(envelope) => envelope,
                    Err(e) => {
                        if strict {
                            tracing::debug!(topic = %topic, error = %e, "Dropping malformed gossip message");
                        }
                        continue;
                    }
                };

                match verify_envelope(&envelope, &local_peer, ttl) {
                    Ok(sender) => {
                        let _ = messages.send(VerifiedMessage {
                            topic: topic.to_string(),
                            kind: envelope.kind,
                            sender,
                            timestamp: envelope.timestamp,
                            payload: envelope.payload,
                        });
                    }
                    Err(e) if strict => {
                        tracing::debug!(topic = %topic, error = %e, "Rejected gossip message");
                    }
                    Err(_) => {
                        // Lenient mode: deliver unverified envelopes as long
                        // as the claimed sender parses and is not us.
                        if let Ok(sender) = PeerId::from_str(&envelope.sender_peer_id) {
                            if sender != local_peer {
                                let _ = messages.send(VerifiedMessage {
                                    topic: topic.to_string(),
                                    kind: envelope.kind,
                                    sender,
                                    timestamp: envelope.timestamp,
                                    payload: envelope.payload,
                                });
                            }
                        }
                    }
                }
            }
        });
        self.tasks.lock().push(task);
        Ok(())
    }

    /// Verified messages, in arrival order.
    pub fn messages(&self) -> broadcast::Receiver<VerifiedMessage> {
        self.messages.subscribe()
    }

    pub async fn subscribe_topic(&self, topic_id: &str) -> Result<()> {
        self.host.subscribe(&topic_for(topic_id)).await
    }

    /// Sign and publish a payload on a topic.
    pub async fn publish(&self, topic: &str, kind: &str, payload: Vec<u8>) -> Result<()> {
        let envelope = sign_envelope(self.host.identity(), kind, payload);
        let data = serde_json::to_vec(&envelope)?;
        if data.len() > MAX_GOSSIP_SIZE {
            return Err(BibError::InvalidInput(format!(
                "gossip message of {} bytes exceeds the {} byte limit",
                data.len(),
                MAX_GOSSIP_SIZE
            )));
        }
        self.host.publish(topic, data).await
    }

    /// Publish node status on the nodes topic every 30 s.
    pub fn start_status_publisher<F>(&self, status: F)
    where
        F: Fn() -> NodeStatus + Send + Sync + 'static,
    {
        let host = Arc::clone(&self.host);
        let shutdown = self.shutdown.clone();

        let task = tokio::spawn(async move {
            let mut tick = tokio::time::interval(STATUS_INTERVAL);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tick.tick() => {
                        let payload = match serde_json::to_vec(&status()) {
                            Ok(payload) => payload,
                            Err(e) => {
                                tracing::warn!(error = %e, "Failed to encode node status");
                                continue;
                            }
                        };
                        let envelope = sign_envelope(host.identity(), kind::NODE_STATUS, payload);
                        let data = match serde_json::to_vec(&envelope) {
                            Ok(data) => data,
                            Err(e) => {
                                tracing::warn!(error = %e, "Failed to encode status envelope");
                                continue;
                            }
                        };
                        if let Err(e) = host.publish(TOPIC_NODES, data).await {
                            // Expected while no peer shares the topic yet.
                            tracing::debug!(error = %e, "Status publish failed");
                        }
                    }
                }
            }
        });
        self.tasks.lock().push(task);
    }

    pub async fn stop(&self) {
        self.shutdown.cancel();
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Identity;

    fn test_identity() -> (tempfile::TempDir, Identity) {
        let dir = tempfile::tempdir().unwrap();
        let identity = Identity::load_or_generate(None, dir.path()).unwrap();
        (dir, identity)
    }

    #[test]
    fn test_envelope_round_trip() {
        let (_dir, identity) = test_identity();
        let envelope = sign_envelope(&identity, kind::DATASET_ANNOUNCED, b"payload".to_vec());

        let other = PeerId::random();
        let sender = verify_envelope(&envelope, &other, DEFAULT_TTL).unwrap();
        assert_eq!(sender, identity.peer_id());
    }

    #[test]
    fn test_tampered_payload_rejected() {
        let (_dir, identity) = test_identity();
        let mut envelope = sign_envelope(&identity, kind::DATASET_ANNOUNCED, b"payload".to_vec());
        envelope.payload = b"other payload".to_vec();

        let err = verify_envelope(&envelope, &PeerId::random(), DEFAULT_TTL).unwrap_err();
        assert!(matches!(err, BibError::Unauthorized));
    }

    #[test]
    fn test_impersonated_sender_rejected() {
        let (_dir, identity) = test_identity();
        let (_dir2, impostor) = test_identity();
        let mut envelope = sign_envelope(&impostor, kind::NODE_JOINED, b"hi".to_vec());
        // Claim someone else's identity; the digest no longer matches.
        envelope.sender_peer_id = identity.peer_id().to_string();

        let err = verify_envelope(&envelope, &PeerId::random(), DEFAULT_TTL).unwrap_err();
        assert!(matches!(err, BibError::Unauthorized));
    }

    #[test]
    fn test_stale_message_rejected() {
        let (_dir, identity) = test_identity();
        let sender = identity.peer_id().to_string();
        let timestamp = unix_nanos() - Duration::from_secs(600).as_nanos() as i64;
        let payload = b"old".to_vec();
        let digest = signing_digest(kind::NODE_STATUS, &sender, timestamp, &payload);
        let envelope = GossipEnvelope {
            kind: kind::NODE_STATUS.to_string(),
            sender_peer_id: sender,
            timestamp,
            signature: identity.sign(&digest),
            payload,
        };

        let err = verify_envelope(&envelope, &PeerId::random(), DEFAULT_TTL).unwrap_err();
        assert!(matches!(err, BibError::InvalidInput(_)));
    }

    #[test]
    fn test_own_messages_dropped() {
        let (_dir, identity) = test_identity();
        let envelope = sign_envelope(&identity, kind::NODE_STATUS, b"self".to_vec());
        let err = verify_envelope(&envelope, &identity.peer_id(), DEFAULT_TTL).unwrap_err();
        assert!(matches!(err, BibError::InvalidInput(_)));
    }
}
