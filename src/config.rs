// Configuration surface for the node.
//
// These structs are deserialized by the embedding application (file loading
// and merging live outside this crate) and handed to the subsystems that
// consume them. Every struct has workable defaults so a zero-config node
// comes up as a local proxy-mode peer.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level peer-to-peer configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct P2pConfig {
    /// Enable the p2p subsystem.
    pub enabled: bool,

    /// Node mode: "proxy", "selective" or "full".
    pub mode: String,

    /// Multiaddrs to listen on.
    pub listen_addresses: Vec<String>,

    pub identity: IdentityConfig,

    pub conn_manager: ConnManagerConfig,

    pub metrics: MetricsConfig,

    pub bootstrap: BootstrapConfig,

    pub mdns: MdnsConfig,

    pub dht: DhtConfig,

    pub peer_store: PeerStoreConfig,

    pub proxy: ProxyConfig,

    pub selective: SelectiveConfig,

    pub full: FullConfig,

    pub transfer: TransferConfig,

    pub rpc: RpcConfig,
}

impl Default for P2pConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            mode: "proxy".to_string(),
            listen_addresses: vec![
                "/ip4/0.0.0.0/tcp/4001".to_string(),
                "/ip4/0.0.0.0/udp/4001/quic-v1".to_string(),
            ],
            identity: IdentityConfig::default(),
            conn_manager: ConnManagerConfig::default(),
            metrics: MetricsConfig::default(),
            bootstrap: BootstrapConfig::default(),
            mdns: MdnsConfig::default(),
            dht: DhtConfig::default(),
            peer_store: PeerStoreConfig::default(),
            proxy: ProxyConfig::default(),
            selective: SelectiveConfig::default(),
            full: FullConfig::default(),
            transfer: TransferConfig::default(),
            rpc: RpcConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// Path of the PEM key file. Defaults to `<config dir>/identity.pem`.
    pub key_path: Option<PathBuf>,
}

/// Connection-count watermarks for the host.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnManagerConfig {
    pub low_watermark: usize,

    pub high_watermark: usize,

    /// Connections younger than this are exempt from pruning.
    pub grace_period_secs: u64,
}

impl Default for ConnManagerConfig {
    fn default() -> Self {
        Self {
            low_watermark: 32,
            high_watermark: 96,
            grace_period_secs: 60,
        }
    }
}

impl ConnManagerConfig {
    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub bandwidth_metering: bool,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            bandwidth_metering: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BootstrapConfig {
    /// Bootstrap peer multiaddrs, each with an embedded `/p2p/<peer-id>`.
    pub peers: Vec<String>,

    /// `Discovery::start` returns once this many bootstrap peers are up.
    pub min_peers: usize,

    pub retry_interval_secs: u64,

    pub max_retry_interval_secs: u64,
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        Self {
            peers: Vec::new(),
            min_peers: 1,
            retry_interval_secs: 1,
            max_retry_interval_secs: 60,
        }
    }
}

impl BootstrapConfig {
    pub fn retry_interval(&self) -> Duration {
        Duration::from_secs(self.retry_interval_secs)
    }

    pub fn max_retry_interval(&self) -> Duration {
        Duration::from_secs(self.max_retry_interval_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MdnsConfig {
    pub enabled: bool,

    pub service_name: String,
}

impl Default for MdnsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            service_name: "bib".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DhtConfig {
    pub enabled: bool,

    /// "auto", "server" or "client". Server mode requires public reachability.
    pub mode: String,
}

impl Default for DhtConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            mode: "auto".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerStoreConfig {
    /// Path of the peers database. Defaults to `<config dir>/peers.db`.
    pub path: Option<PathBuf>,
}

/// Proxy-mode settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Peers queried first, ahead of other connected peers.
    pub favorite_peers: Vec<String>,

    pub cache_ttl_secs: u64,

    pub max_cache_size: usize,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            favorite_peers: Vec::new(),
            cache_ttl_secs: 120,
            max_cache_size: 1000,
        }
    }
}

impl ProxyConfig {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }
}

/// Selective-mode settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectiveConfig {
    /// Initial subscription patterns, merged with the persisted set.
    pub subscriptions: Vec<String>,

    /// Path of the subscriptions file. Defaults to
    /// `<config dir>/subscriptions.json`.
    pub subscription_store_path: Option<PathBuf>,
}

/// Full-replica-mode settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FullConfig {
    pub sync_interval_secs: u64,
}

impl Default for FullConfig {
    fn default() -> Self {
        Self {
            sync_interval_secs: 300,
        }
    }
}

impl FullConfig {
    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs)
    }
}

/// Transfer-engine settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Upper bound on concurrent chunk workers per download.
    pub max_concurrent_chunks: usize,

    /// Round-robin chunks across candidate peers instead of pinning the first.
    pub parallel_peers: bool,

    pub chunk_timeout_secs: u64,

    /// Retries per chunk before the download fails.
    pub max_retries: usize,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            max_concurrent_chunks: 8,
            parallel_peers: true,
            chunk_timeout_secs: 30,
            max_retries: 3,
        }
    }
}

impl TransferConfig {
    pub fn chunk_timeout(&self) -> Duration {
        Duration::from_secs(self.chunk_timeout_secs)
    }
}

/// Stream-RPC gate settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RpcConfig {
    /// Token-bucket refill rate per peer.
    pub requests_per_second: f64,

    /// Token-bucket capacity per peer.
    pub burst_size: f64,

    /// Idle rate-limiter entries are evicted after twice this interval.
    pub cleanup_interval_secs: u64,

    /// Pooled client connections idle longer than this are closed.
    pub idle_timeout_secs: u64,

    /// Bounded accept queue; overflowing streams are reset.
    pub accept_backlog: usize,

    /// Method-routing prefixes refused over the overlay regardless of
    /// authorization (administrative and emergency-access services).
    pub restricted_prefixes: Vec<String>,

    /// Peer ids admitted unconditionally.
    pub bootstrap_allowlist: Vec<String>,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            requests_per_second: 10.0,
            burst_size: 20.0,
            cleanup_interval_secs: 60,
            idle_timeout_secs: 300,
            accept_backlog: 16,
            restricted_prefixes: vec![
                "/bib.admin.".to_string(),
                "/bib.breakglass.".to_string(),
            ],
            bootstrap_allowlist: Vec::new(),
        }
    }
}

impl RpcConfig {
    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

/// Raft cluster settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    pub enabled: bool,

    pub cluster_name: String,

    pub node_id: String,

    pub is_voter: bool,

    /// Bootstrap a new cluster instead of joining one.
    pub bootstrap: bool,

    pub listen_addr: String,

    pub advertise_addr: Option<String>,

    pub join_token: Option<String>,

    pub join_addrs: Vec<String>,

    pub raft: RaftTimingConfig,

    pub snapshot: SnapshotConfig,

    pub data_dir: PathBuf,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            cluster_name: "bib".to_string(),
            node_id: String::new(),
            is_voter: true,
            bootstrap: false,
            listen_addr: "0.0.0.0:4101".to_string(),
            advertise_addr: None,
            join_token: None,
            join_addrs: Vec::new(),
            raft: RaftTimingConfig::default(),
            snapshot: SnapshotConfig::default(),
            data_dir: PathBuf::from("./data/cluster"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RaftTimingConfig {
    pub heartbeat_timeout_ms: u64,

    pub election_timeout_ms: u64,
}

impl Default for RaftTimingConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout_ms: 1000,
            election_timeout_ms: 3000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotConfig {
    pub retain_count: usize,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self { retain_count: 3 }
    }
}

/// Break-glass emergency access settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakGlassConfig {
    pub enabled: bool,

    /// Refuse enable/disable until the node restarts with the flag flipped.
    pub require_restart: bool,

    /// Hard ceiling on session duration.
    pub max_duration_secs: u64,

    /// "readonly" or "readwrite".
    pub default_access_level: String,

    pub allowed_users: Vec<AllowedUser>,

    /// "normal" or "paranoid".
    pub audit_level: String,

    /// Keep reports pending until a human acknowledges them.
    pub require_acknowledgment: bool,

    pub session_recording: bool,

    pub recording_path: PathBuf,

    pub webhook_url: Option<String>,

    pub email_address: Option<String>,
}

impl Default for BreakGlassConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            require_restart: true,
            max_duration_secs: 3600,
            default_access_level: "readonly".to_string(),
            allowed_users: Vec::new(),
            audit_level: "normal".to_string(),
            require_acknowledgment: true,
            session_recording: true,
            recording_path: PathBuf::from("./data/recordings"),
            webhook_url: None,
            email_address: None,
        }
    }
}

impl BreakGlassConfig {
    pub fn max_duration(&self) -> Duration {
        Duration::from_secs(self.max_duration_secs)
    }
}

/// A user allowed to open break-glass sessions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllowedUser {
    pub name: String,

    /// Ed25519 public key, 32 bytes hex.
    pub public_key: String,
}
