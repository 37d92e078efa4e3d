// Parallel, resumable, integrity-checked chunk downloads.
//
// A download owns a byte-packed bitmap of received chunks. The runner
// feeds missing indices through a shared queue to a bounded worker pool;
// each worker owns its index for the duration of the attempt, so the
// bitmap is set exactly once per chunk. Chunk bytes are never held beyond
// a worker's loop iteration; they flow to the sink callback.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use libp2p::PeerId;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::catalog::Chunk;
use crate::config::TransferConfig;
use crate::error::{BibError, Result};
use crate::peer_store::PeerStore;
use crate::protocol::ProtocolClient;

/// Lifecycle states of a download.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadStatus {
    Active,
    Paused,
    Completed,
    Failed,
}

struct DownloadState {
    bitmap: Vec<u8>,
    status: DownloadStatus,
    updated_at: DateTime<Utc>,
    peers: Vec<PeerId>,
    error: Option<String>,
}

/// A tracked download.
pub struct Download {
    pub id: String,
    pub dataset_id: String,
    pub dataset_hash: String,
    pub total_chunks: u32,
    pub started_at: DateTime<Utc>,
    state: Mutex<DownloadState>,
}

impl Download {
    fn new(dataset_id: String, dataset_hash: String, total_chunks: u32, peers: Vec<PeerId>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            dataset_id,
            dataset_hash,
            total_chunks,
            started_at: Utc::now(),
            state: Mutex::new(DownloadState {
                bitmap: vec![0u8; (total_chunks as usize).div_ceil(8)],
                status: DownloadStatus::Active,
                updated_at: Utc::now(),
                peers,
                error: None,
            }),
        }
    }

    pub fn status(&self) -> DownloadStatus {
        self.state.lock().status
    }

    pub fn error(&self) -> Option<String> {
        self.state.lock().error.clone()
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.state.lock().updated_at
    }

    pub fn peers(&self) -> Vec<PeerId> {
        self.state.lock().peers.clone()
    }

    /// Byte-packed copy of the chunk bitmap.
    pub fn bitmap(&self) -> Vec<u8> {
        self.state.lock().bitmap.clone()
    }

    pub fn has_chunk(&self, index: u32) -> bool {
        let state = self.state.lock();
        has_bit(&state.bitmap, index)
    }

    /// Complete exactly when every chunk bit is set.
    pub fn is_complete(&self) -> bool {
        let state = self.state.lock();
        (0..self.total_chunks).all(|i| has_bit(&state.bitmap, i))
    }

    pub fn received_chunks(&self) -> u32 {
        let state = self.state.lock();
        (0..self.total_chunks)
            .filter(|&i| has_bit(&state.bitmap, i))
            .count() as u32
    }

    pub fn missing_chunks(&self) -> Vec<u32> {
        let state = self.state.lock();
        (0..self.total_chunks)
            .filter(|&i| !has_bit(&state.bitmap, i))
            .collect()
    }

    fn set_chunk(&self, index: u32) {
        let mut state = self.state.lock();
        state.bitmap[(index / 8) as usize] |= 1 << (index % 8);
        state.updated_at = Utc::now();
    }

    fn set_status(&self, status: DownloadStatus) {
        let mut state = self.state.lock();
        state.status = status;
        state.updated_at = Utc::now();
    }

    fn set_error(&self, error: String) {
        let mut state = self.state.lock();
        // First chunk error wins.
        if state.error.is_none() {
            state.error = Some(error);
        }
    }

    fn set_peers(&self, peers: Vec<PeerId>) {
        self.state.lock().peers = peers;
    }
}

fn has_bit(bitmap: &[u8], index: u32) -> bool {
    bitmap[(index / 8) as usize] & (1 << (index % 8)) != 0
}

/// Sink and lifecycle callbacks. Chunk bytes are handed to `on_chunk`
/// and not retained by the engine.
#[derive(Clone, Default)]
pub struct TransferCallbacks {
    pub on_chunk: Option<Arc<dyn Fn(&Download, &Chunk) + Send + Sync>>,
    pub on_complete: Option<Arc<dyn Fn(&Download) + Send + Sync>>,
    pub on_error: Option<Arc<dyn Fn(&Download, &str) + Send + Sync>>,
    /// Dataset-level verification hook, invoked with the finished download
    /// before it is marked completed. The sink holds the assembled bytes,
    /// so whole-dataset hashing lives there.
    pub verify_complete: Option<Arc<dyn Fn(&Download) -> Result<()> + Send + Sync>>,
}

struct ActiveDownload {
    download: Arc<Download>,
    cancel: CancellationToken,
    runner: Mutex<Option<JoinHandle<()>>>,
}

/// The download orchestrator.
pub struct TransferEngine {
    client: Arc<ProtocolClient>,
    peer_store: Arc<PeerStore>,
    config: TransferConfig,
    callbacks: TransferCallbacks,
    downloads: Arc<DashMap<String, Arc<ActiveDownload>>>,
    by_hash: Arc<DashMap<String, String>>,
}

impl TransferEngine {
    pub fn new(
        client: Arc<ProtocolClient>,
        peer_store: Arc<PeerStore>,
        config: TransferConfig,
        callbacks: TransferCallbacks,
    ) -> Self {
        Self {
            client,
            peer_store,
            config,
            callbacks,
            downloads: Arc::new(DashMap::new()),
            by_hash: Arc::new(DashMap::new()),
        }
    }

    /// Begin (or rejoin) a download. A second call with the same dataset
    /// hash returns the already-running download.
    pub fn start_download(
        &self,
        dataset_id: impl Into<String>,
        dataset_hash: impl Into<String>,
        total_chunks: u32,
        peers: Vec<PeerId>,
    ) -> Result<Arc<Download>> {
        let dataset_id = dataset_id.into();
        let dataset_hash = dataset_hash.into();

        if peers.is_empty() {
            return Err(BibError::InvalidInput(
                "a download needs at least one candidate peer".to_string(),
            ));
        }
        if total_chunks == 0 {
            return Err(BibError::InvalidInput(
                "a download needs at least one chunk".to_string(),
            ));
        }

        if let Some(existing_id) = self.by_hash.get(&dataset_hash) {
            if let Some(active) = self.downloads.get(existing_id.value()) {
                return Ok(Arc::clone(&active.download));
            }
        }

        let download = Arc::new(Download::new(
            dataset_id,
            dataset_hash.clone(),
            total_chunks,
            peers.clone(),
        ));
        let active = Arc::new(ActiveDownload {
            download: Arc::clone(&download),
            cancel: CancellationToken::new(),
            runner: Mutex::new(None),
        });
        self.downloads.insert(download.id.clone(), Arc::clone(&active));
        self.by_hash.insert(dataset_hash, download.id.clone());

        self.spawn_runner(&active, peers);
        Ok(download)
    }

    /// Cancel the runner but keep the record; the bitmap survives for a
    /// later resume.
    pub fn pause_download(&self, id: &str) -> Result<()> {
        let active = self
            .downloads
            .get(id)
            .ok_or_else(|| BibError::not_found(format!("download {id}")))?;
        active.cancel.cancel();
        active.download.set_status(DownloadStatus::Paused);
        tracing::info!(download = %id, "Download paused");
        Ok(())
    }

    /// Rebind a runner onto a paused download with a fresh peer set.
    pub fn resume_download(&self, id: &str, peers: Vec<PeerId>) -> Result<Arc<Download>> {
        let active = self
            .downloads
            .get(id)
            .map(|a| Arc::clone(&a))
            .ok_or_else(|| BibError::not_found(format!("download {id}")))?;

        if active.download.status() == DownloadStatus::Active {
            return Ok(Arc::clone(&active.download));
        }
        if peers.is_empty() {
            return Err(BibError::InvalidInput(
                "a download needs at least one candidate peer".to_string(),
            ));
        }

        let refreshed = Arc::new(ActiveDownload {
            download: Arc::clone(&active.download),
            cancel: CancellationToken::new(),
            runner: Mutex::new(None),
        });
        refreshed.download.set_peers(peers.clone());
        refreshed.download.set_status(DownloadStatus::Active);
        self.downloads.insert(active.download.id.clone(), Arc::clone(&refreshed));

        self.spawn_runner(&refreshed, peers);
        tracing::info!(download = %id, "Download resumed");
        Ok(Arc::clone(&refreshed.download))
    }

    /// Cancel the runner and drop the record.
    pub fn cancel_download(&self, id: &str) -> Result<()> {
        let (_, active) = self
            .downloads
            .remove(id)
            .ok_or_else(|| BibError::not_found(format!("download {id}")))?;
        active.cancel.cancel();
        self.by_hash.remove(&active.download.dataset_hash);
        tracing::info!(download = %id, "Download cancelled");
        Ok(())
    }

    pub fn get_download(&self, id: &str) -> Option<Arc<Download>> {
        self.downloads.get(id).map(|a| Arc::clone(&a.download))
    }

    pub fn downloads(&self) -> Vec<Arc<Download>> {
        self.downloads
            .iter()
            .map(|a| Arc::clone(&a.download))
            .collect()
    }

    fn spawn_runner(&self, active: &Arc<ActiveDownload>, peers: Vec<PeerId>) {
        let download = Arc::clone(&active.download);
        let cancel = active.cancel.clone();
        let client = Arc::clone(&self.client);
        let peer_store = Arc::clone(&self.peer_store);
        let config = self.config.clone();
        let callbacks = self.callbacks.clone();

        let handle = tokio::spawn(run_download(
            download, peers, cancel, client, peer_store, config, callbacks,
        ));
        *active.runner.lock() = Some(handle);
    }
}

async fn run_download(
    download: Arc<Download>,
    peers: Vec<PeerId>,
    cancel: CancellationToken,
    client: Arc<ProtocolClient>,
    peer_store: Arc<PeerStore>,
    config: TransferConfig,
    callbacks: TransferCallbacks,
) {
    let missing = download.missing_chunks();
    if missing.is_empty() {
        finish(&download, &callbacks);
        return;
    }

    let queue: Arc<Mutex<VecDeque<u32>>> = Arc::new(Mutex::new(missing.iter().copied().collect()));
    let worker_count = config.max_concurrent_chunks.max(1).min(missing.len());

    let mut workers = Vec::with_capacity(worker_count);
    for _ in 0..worker_count {
        workers.push(tokio::spawn(chunk_worker(
            Arc::clone(&download),
            peers.clone(),
            Arc::clone(&queue),
            cancel.clone(),
            Arc::clone(&client),
            Arc::clone(&peer_store),
            config.clone(),
            callbacks.clone(),
        )));
    }
    for worker in workers {
        let _ = worker.await;
    }

    if cancel.is_cancelled() {
        // Paused or cancelled; the caller already set the terminal state.
        return;
    }
    if download.is_complete() {
        finish(&download, &callbacks);
    } else {
        download.set_status(DownloadStatus::Failed);
        let error = download
            .error()
            .unwrap_or_else(|| "download incomplete".to_string());
        tracing::warn!(download = %download.id, error = %error, "Download failed");
        if let Some(on_error) = &callbacks.on_error {
            on_error(&download, &error);
        }
    }
}

fn finish(download: &Arc<Download>, callbacks: &TransferCallbacks) {
    if let Some(verify) = &callbacks.verify_complete {
        if let Err(e) = verify(download) {
            download.set_status(DownloadStatus::Failed);
            download.set_error(e.to_string());
            tracing::warn!(download = %download.id, error = %e, "Dataset verification failed");
            if let Some(on_error) = &callbacks.on_error {
                on_error(download, &e.to_string());
            }
            return;
        }
    }
    download.set_status(DownloadStatus::Completed);
    tracing::info!(download = %download.id, dataset = %download.dataset_id, "Download completed");
    if let Some(on_complete) = &callbacks.on_complete {
        on_complete(download);
    }
}

#[allow(clippy::too_many_arguments)]
async fn chunk_worker(
    download: Arc<Download>,
    peers: Vec<PeerId>,
    queue: Arc<Mutex<VecDeque<u32>>>,
    cancel: CancellationToken,
    client: Arc<ProtocolClient>,
    peer_store: Arc<PeerStore>,
    config: TransferConfig,
    callbacks: TransferCallbacks,
) {
    loop {
        if cancel.is_cancelled() {
            return;
        }
        let index = {
            let mut queue = queue.lock();
            queue.pop_front()
        };
        let Some(index) = index else { return };

        match fetch_chunk(
            &download, index, &peers, &cancel, &client, &peer_store, &config,
        )
        .await
        {
            Ok(Some(chunk)) => {
                download.set_chunk(index);
                if let Some(on_chunk) = &callbacks.on_chunk {
                    on_chunk(&download, &chunk);
                }
            }
            Ok(None) => return, // cancelled mid-fetch
            Err(e) => {
                download.set_error(e.to_string());
            }
        }
    }
}

/// Fetch and verify one chunk, retrying across peers. `Ok(None)` means the
/// download was cancelled while fetching.
async fn fetch_chunk(
    download: &Download,
    index: u32,
    peers: &[PeerId],
    cancel: &CancellationToken,
    client: &ProtocolClient,
    peer_store: &PeerStore,
    config: &TransferConfig,
) -> Result<Option<Chunk>> {
    let mut last_error: Option<BibError> = None;

    for attempt in 0..=config.max_retries {
        if cancel.is_cancelled() {
            return Ok(None);
        }
        let peer = select_peer(peers, index, attempt, config.parallel_peers);

        let fetched = tokio::select! {
            _ = cancel.cancelled() => return Ok(None),
            fetched = tokio::time::timeout(
                config.chunk_timeout(),
                client.get_chunk(peer, download.dataset_id.clone(), index),
            ) => fetched,
        };

        let outcome = match fetched {
            Ok(Ok(chunk)) => verify_chunk(chunk),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(BibError::timeout(format!("chunk {index} from {peer}"))),
        };

        match outcome {
            Ok(chunk) => return Ok(Some(chunk)),
            Err(e) => {
                tracing::debug!(
                    download = %download.id,
                    chunk = index,
                    peer = %peer,
                    attempt,
                    error = %e,
                    "Chunk fetch failed"
                );
                // Integrity and transport failures both count against the
                // peer; the next attempt rotates to a different one.
                if let Err(store_err) = peer_store.record_connection(&peer, false, 0.0) {
                    tracing::debug!(peer = %peer, error = %store_err, "Could not record chunk failure");
                }
                last_error = Some(e);
            }
        }
    }

    Err(last_error.unwrap_or_else(|| BibError::timeout(format!("chunk {index}"))))
}

fn verify_chunk(chunk: Chunk) -> Result<Chunk> {
    if chunk.data.is_empty() {
        return Err(BibError::InvalidInput("empty chunk payload".to_string()));
    }
    chunk.verify()?;
    Ok(chunk)
}

/// Round-robin over the candidate peers keyed by chunk index when
/// parallel-peer fetching is on; otherwise stick to the first peer and
/// rotate only on retry.
fn select_peer(peers: &[PeerId], index: u32, attempt: usize, parallel: bool) -> PeerId {
    let base = if parallel { index as usize } else { 0 };
    peers[(base + attempt) % peers.len()]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn download(total: u32) -> Download {
        Download::new("ds".to_string(), "hash".to_string(), total, Vec::new())
    }

    #[test]
    fn test_bitmap_length_and_completion() {
        let d = download(12);
        assert_eq!(d.bitmap().len(), 2);
        assert!(!d.is_complete());

        for i in 0..12 {
            assert!(!d.has_chunk(i));
            d.set_chunk(i);
            assert!(d.has_chunk(i));
            // Complete exactly when every bit is set, not before.
            assert_eq!(d.is_complete(), i == 11);
        }
        assert_eq!(d.received_chunks(), 12);
        assert!(d.missing_chunks().is_empty());
    }

    #[test]
    fn test_missing_chunks_reflect_bitmap() {
        let d = download(10);
        d.set_chunk(0);
        d.set_chunk(3);
        d.set_chunk(9);
        assert_eq!(d.missing_chunks(), vec![1, 2, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn test_first_error_is_kept() {
        let d = download(1);
        d.set_error("first".to_string());
        d.set_error("second".to_string());
        assert_eq!(d.error().unwrap(), "first");
    }

    #[test]
    fn test_peer_selection_round_robin() {
        let peers: Vec<PeerId> = (0..3).map(|_| PeerId::random()).collect();

        // Parallel: keyed by chunk index.
        assert_eq!(select_peer(&peers, 0, 0, true), peers[0]);
        assert_eq!(select_peer(&peers, 1, 0, true), peers[1]);
        assert_eq!(select_peer(&peers, 5, 0, true), peers[2]);
        // Retries rotate away from the failing peer.
        assert_eq!(select_peer(&peers, 1, 1, true), peers[2]);

        // Single-peer mode pins the first peer until a retry.
        assert_eq!(select_peer(&peers, 7, 0, false), peers[0]);
        assert_eq!(select_peer(&peers, 7, 1, false), peers[1]);
    }

    #[test]
    fn test_verify_chunk_rejects_bad_data() {
        let good = Chunk::new("ds", 0, vec![1, 2, 3]);
        assert!(verify_chunk(good.clone()).is_ok());

        let mut tampered = good.clone();
        tampered.data = vec![4, 5, 6];
        assert!(matches!(
            verify_chunk(tampered).unwrap_err(),
            BibError::HashMismatch { .. }
        ));

        let mut empty = good;
        empty.data = Vec::new();
        assert!(matches!(
            verify_chunk(empty).unwrap_err(),
            BibError::InvalidInput(_)
        ));
    }
}
