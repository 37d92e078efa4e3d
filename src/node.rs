// Node assembly: one struct wiring the host, peer store, discovery,
// gossip, wire-protocol server, mode manager and transfer engine, plus
// the request handlers answering peers.

use libp2p::PeerId;
use parking_lot::RwLock;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::catalog::{content_hash, Catalog, CatalogEntry, Chunk, Dataset, DatasetContent};
use crate::config::P2pConfig;
use crate::discovery::Discovery;
use crate::error::{BibError, Result};
use crate::host::Host;
use crate::modes::{ModeContext, ModeManager};
use crate::peer_store::PeerStore;
use crate::protocol::{
    Announcement, ErrorBody, NodeStatus, PeerInfoPayload, ProtocolClient, ProtocolServer,
    QueryResult, RequestBody, RequestHandler, ResponseBody, SyncStatusPayload,
};
use crate::pubsub::{kind, topic_for, PubSub, TOPIC_GLOBAL};
use crate::transfer::{TransferCallbacks, TransferEngine};

const SERVER_STOP_DEADLINE: Duration = Duration::from_secs(5);

/// Local dataset content served to peers.
pub trait DatasetStore: Send + Sync {
    fn dataset(&self, dataset_id: &str) -> Option<(Dataset, DatasetContent)>;

    fn chunk(&self, dataset_id: &str, index: u32) -> Option<Chunk>;
}

/// In-memory dataset store, chunking byte blobs on insert.
#[derive(Default)]
pub struct MemoryDatasetStore {
    datasets: dashmap::DashMap<String, (Dataset, DatasetContent, Vec<Chunk>)>,
}

impl MemoryDatasetStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a dataset, splitting `bytes` into `chunk_size`-sized chunks.
    pub fn insert(
        &self,
        id: impl Into<String>,
        name: impl Into<String>,
        topic_id: impl Into<String>,
        bytes: &[u8],
        chunk_size: u32,
    ) -> (Dataset, DatasetContent) {
        let id = id.into();
        let dataset = Dataset {
            id: id.clone(),
            name: name.into(),
            topic_id: topic_id.into(),
            created_at: chrono::Utc::now(),
        };
        let chunks: Vec<Chunk> = bytes
            .chunks(chunk_size.max(1) as usize)
            .enumerate()
            .map(|(index, data)| Chunk::new(id.clone(), index as u32, data.to_vec()))
            .collect();
        let content = DatasetContent {
            hash: content_hash(bytes),
            size: bytes.len() as u64,
            chunk_count: chunks.len() as u32,
            chunk_size,
        };
        self.datasets
            .insert(id, (dataset.clone(), content.clone(), chunks));
        (dataset, content)
    }
}

impl DatasetStore for MemoryDatasetStore {
    fn dataset(&self, dataset_id: &str) -> Option<(Dataset, DatasetContent)> {
        self.datasets
            .get(dataset_id)
            .map(|entry| (entry.0.clone(), entry.1.clone()))
    }

    fn chunk(&self, dataset_id: &str, index: u32) -> Option<Chunk> {
        self.datasets
            .get(dataset_id)
            .and_then(|entry| entry.2.get(index as usize).cloned())
    }
}

/// Answers peer requests from the local catalog and dataset store.
pub struct NodeHandlers {
    local_peer: PeerId,
    catalog: Arc<Catalog>,
    datasets: Arc<dyn DatasetStore>,
    mode: Arc<RwLock<String>>,
    listen_addrs: Arc<RwLock<Vec<String>>>,
    last_sync: Arc<RwLock<Option<chrono::DateTime<chrono::Utc>>>>,
    announcements: broadcast::Sender<Announcement>,
}

impl NodeHandlers {
    fn new(local_peer: PeerId, catalog: Arc<Catalog>, datasets: Arc<dyn DatasetStore>) -> Self {
        let (announcements, _) = broadcast::channel(64);
        Self {
            local_peer,
            catalog,
            datasets,
            mode: Arc::new(RwLock::new(String::new())),
            listen_addrs: Arc::new(RwLock::new(Vec::new())),
            last_sync: Arc::new(RwLock::new(None)),
            announcements,
        }
    }

    /// Announcements accepted from peers, for whoever mirrors them.
    pub fn announcements(&self) -> broadcast::Receiver<Announcement> {
        self.announcements.subscribe()
    }

    pub fn set_last_sync(&self, at: chrono::DateTime<chrono::Utc>) {
        *self.last_sync.write() = Some(at);
    }
}

#[async_trait::async_trait]
impl RequestHandler for NodeHandlers {
    async fn handle(&self, peer: PeerId, request: RequestBody) -> Result<ResponseBody> {
        match request {
            RequestBody::GetCatalog { since_version } => {
                let version = self.catalog.version();
                match since_version {
                    Some(since) if version <= since => {
                        Ok(ResponseBody::CatalogStub { version })
                    }
                    _ => Ok(ResponseBody::Catalog(self.catalog.snapshot())),
                }
            }
            RequestBody::QueryCatalog(query) => {
                let (entries, total) = self.catalog.query(&query);
                Ok(ResponseBody::QueryResult(QueryResult { entries, total }))
            }
            RequestBody::GetPeerInfo => Ok(ResponseBody::PeerInfo(PeerInfoPayload {
                peer_id: self.local_peer.to_string(),
                mode: self.mode.read().clone(),
                catalog_version: self.catalog.version(),
                entry_count: self.catalog.len(),
                listen_addrs: self.listen_addrs.read().clone(),
            })),
            RequestBody::Announce(announcement) => {
                tracing::debug!(
                    peer = %peer,
                    dataset = %announcement.entry.dataset_id,
                    removed = announcement.removed,
                    "Catalog announcement received"
                );
                let _ = self.announcements.send(announcement);
                Ok(ResponseBody::AnnounceAck { accepted: true })
            }
            RequestBody::GetDatasetInfo { dataset_id } => {
                match self.datasets.dataset(&dataset_id) {
                    Some((dataset, content)) => Ok(ResponseBody::DatasetInfo { dataset, content }),
                    None => Err(BibError::not_found(format!("dataset {dataset_id}"))),
                }
            }
            RequestBody::GetChunk { dataset_id, index } => {
                match self.datasets.chunk(&dataset_id, index) {
                    Some(chunk) => Ok(ResponseBody::Chunk(chunk)),
                    None => Err(BibError::not_found(format!(
                        "chunk {index} of dataset {dataset_id}"
                    ))),
                }
            }
            RequestBody::GetChunks {
                dataset_id,
                indices,
            } => {
                let mut chunks = Vec::with_capacity(indices.len());
                for index in indices {
                    match self.datasets.chunk(&dataset_id, index) {
                        Some(chunk) => chunks.push(chunk),
                        None => {
                            return Err(BibError::not_found(format!(
                                "chunk {index} of dataset {dataset_id}"
                            )));
                        }
                    }
                }
                Ok(ResponseBody::Chunks(chunks))
            }
            RequestBody::GetSyncStatus => Ok(ResponseBody::SyncStatus(SyncStatusPayload {
                catalog_version: self.catalog.version(),
                entry_count: self.catalog.len(),
                last_sync: *self.last_sync.read(),
            })),
            RequestBody::SyncState {
                catalog_version: _,
                hashes,
            } => {
                let diff = self.catalog.diff(&hashes);
                Ok(ResponseBody::SyncState(
                    crate::protocol::SyncStateResponse {
                        missing_hashes: diff.missing,
                        wanted_hashes: diff.wanted,
                        catalog_version: diff.version,
                    },
                ))
            }
            // The jobs surface is reserved; see the protocol docs.
            RequestBody::SubmitJob { .. } | RequestBody::GetJobStatus { .. } => {
                Ok(ResponseBody::Error(ErrorBody::new(
                    501,
                    "the jobs service is not available yet",
                )))
            }
        }
    }
}

/// A fully wired node.
pub struct Node {
    config: P2pConfig,
    host: Arc<Host>,
    peer_store: Arc<PeerStore>,
    discovery: Arc<Discovery>,
    pubsub: Arc<PubSub>,
    client: Arc<ProtocolClient>,
    server: Arc<ProtocolServer>,
    mode_manager: Arc<ModeManager>,
    transfer: Arc<TransferEngine>,
    catalog: Arc<Catalog>,
    handlers: Arc<NodeHandlers>,
    started_at: Instant,
}

impl Node {
    /// Build every subsystem. Must run inside a tokio runtime; background
    /// tasks are spawned lazily by `start`.
    pub fn new(
        config: P2pConfig,
        config_dir: &Path,
        datasets: Arc<dyn DatasetStore>,
        transfer_callbacks: TransferCallbacks,
    ) -> Result<Self> {
        let host = Arc::new(Host::new(&config, config_dir)?);

        let peer_store = Arc::new(match &config.peer_store.path {
            Some(path) => PeerStore::open(path)?,
            None => PeerStore::open(&config_dir.join("peers.db"))?,
        });

        let discovery = Arc::new(Discovery::new(
            Arc::clone(&host),
            Arc::clone(&peer_store),
            &config,
        )?);

        let pubsub = Arc::new(PubSub::new(Arc::clone(&host)));
        let client = Arc::new(ProtocolClient::new(host.stream_control(), host.bandwidth()));

        let catalog = Arc::new(Catalog::new(host.local_peer_id().to_string()));
        let handlers = Arc::new(NodeHandlers::new(
            host.local_peer_id(),
            Arc::clone(&catalog),
            Arc::clone(&datasets),
        ));
        *handlers.mode.write() = config.mode.clone();

        let server = Arc::new(ProtocolServer::new(
            Arc::clone(&handlers) as Arc<dyn RequestHandler>,
            host.bandwidth(),
        ));

        let mode_manager = Arc::new(ModeManager::new(
            ModeContext {
                host: Arc::clone(&host),
                client: Arc::clone(&client),
            },
            config.clone(),
            config_dir.to_path_buf(),
        ));

        let transfer = Arc::new(TransferEngine::new(
            Arc::clone(&client),
            Arc::clone(&peer_store),
            config.transfer.clone(),
            transfer_callbacks,
        ));

        Ok(Self {
            config,
            host,
            peer_store,
            discovery,
            pubsub,
            client,
            server,
            mode_manager,
            transfer,
            catalog,
            handlers,
            started_at: Instant::now(),
        })
    }

    /// Start serving: wire handlers, gossip, the mode handler, then
    /// discovery. Returns once the bootstrap set is connected or `ctx`
    /// fires.
    pub async fn start(&self, ctx: CancellationToken) -> Result<()> {
        self.server.start(&self.host.stream_control())?;
        self.pubsub.start().await?;

        let status_catalog = Arc::clone(&self.catalog);
        let peer_id = self.host.local_peer_id().to_string();
        let mode = self.config.mode.clone();
        let started_at = self.started_at;
        self.pubsub.start_status_publisher(move || NodeStatus {
            peer_id: peer_id.clone(),
            mode: mode.clone(),
            catalog_version: status_catalog.version(),
            entry_count: status_catalog.len(),
            uptime_secs: started_at.elapsed().as_secs(),
        });

        self.mode_manager.start().await?;
        self.discovery.start(ctx).await?;

        if let Ok(addrs) = self.host.listen_addrs().await {
            *self.handlers.listen_addrs.write() =
                addrs.iter().map(|a| a.to_string()).collect();
        }
        Ok(())
    }

    /// Stop every subsystem, releasing sockets and waiting for stream
    /// handlers within a bounded deadline. Errors are collected so a
    /// failing component does not leave the rest running.
    pub async fn stop(&self) -> Result<()> {
        let mut failures: Vec<String> = Vec::new();

        if let Err(e) = self.mode_manager.stop().await {
            failures.push(format!("mode manager: {e}"));
        }
        self.discovery.stop().await;
        self.pubsub.stop().await;
        self.server.stop(SERVER_STOP_DEADLINE).await;
        if let Err(e) = self.host.close().await {
            failures.push(format!("host: {e}"));
        }
        if let Err(e) = self.peer_store.close() {
            failures.push(format!("peer store: {e}"));
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(BibError::transport(std::io::Error::other(
                failures.join("; "),
            )))
        }
    }

    /// Publish an entry into the local catalog and announce it on gossip.
    pub async fn publish_entry(&self, entry: CatalogEntry) -> Result<u64> {
        let version = self.catalog.publish(entry.clone());
        let announcement = Announcement {
            owner: self.host.local_peer_id().to_string(),
            catalog_version: version,
            entry: entry.clone(),
            removed: false,
        };
        let payload = serde_json::to_vec(&announcement)?;
        // Announce on the global topic and the entry's own topic; both are
        // best-effort while the mesh forms.
        if let Err(e) = self
            .pubsub
            .publish(TOPIC_GLOBAL, kind::DATASET_ANNOUNCED, payload.clone())
            .await
        {
            tracing::debug!(error = %e, "Global announcement not published");
        }
        if let Err(e) = self
            .pubsub
            .publish(&topic_for(&entry.topic_id), kind::CATALOG_UPDATED, payload)
            .await
        {
            tracing::debug!(error = %e, "Topic announcement not published");
        }
        Ok(version)
    }

    pub fn host(&self) -> &Arc<Host> {
        &self.host
    }

    pub fn peer_store(&self) -> &Arc<PeerStore> {
        &self.peer_store
    }

    pub fn discovery(&self) -> &Arc<Discovery> {
        &self.discovery
    }

    pub fn pubsub(&self) -> &Arc<PubSub> {
        &self.pubsub
    }

    pub fn client(&self) -> &Arc<ProtocolClient> {
        &self.client
    }

    pub fn catalog(&self) -> &Arc<Catalog> {
        &self.catalog
    }

    pub fn transfer(&self) -> &Arc<TransferEngine> {
        &self.transfer
    }

    pub fn mode_manager(&self) -> &Arc<ModeManager> {
        &self.mode_manager
    }

    pub fn handlers(&self) -> &Arc<NodeHandlers> {
        &self.handlers
    }

    pub fn active_streams(&self) -> usize {
        self.server.active_streams()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_store_chunks_correctly() {
        let store = MemoryDatasetStore::new();
        let bytes: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();
        let (dataset, content) = store.insert("ds-1", "numbers", "math", &bytes, 256);

        assert_eq!(dataset.id, "ds-1");
        assert_eq!(content.chunk_count, 4);
        assert_eq!(content.size, 1000);
        assert_eq!(content.hash, content_hash(&bytes));

        let mut reassembled = Vec::new();
        for index in 0..content.chunk_count {
            let chunk = store.chunk("ds-1", index).unwrap();
            chunk.verify().unwrap();
            reassembled.extend_from_slice(&chunk.data);
        }
        assert_eq!(reassembled, bytes);
        assert!(store.chunk("ds-1", 4).is_none());
    }
}
