// Full-replica mode: mirror the catalog of every connected peer.
//
// The sync cycle walks the connected peers and refreshes each mirror,
// recording per-peer failures without aborting the cycle. Mirrors are
// advisory replicas keyed by source peer id.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use libp2p::PeerId;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::{ModeContext, ModeHandler, NodeMode};
use crate::catalog::{CatalogEntry, CatalogQuery, CatalogSnapshot};
use crate::config::{FullConfig, P2pConfig};
use crate::error::Result;
use crate::protocol::{CatalogReply, QueryResult};

#[derive(Debug, Clone)]
pub(crate) struct SyncError {
    pub peer: PeerId,
    pub error: String,
    pub at: DateTime<Utc>,
}

pub struct FullHandler {
    context: ModeContext,
    sync_interval: RwLock<std::time::Duration>,
    mirrors: Arc<DashMap<PeerId, CatalogSnapshot>>,
    last_sync: RwLock<Option<DateTime<Utc>>>,
    last_sync_error: Arc<RwLock<Option<SyncError>>>,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl FullHandler {
    pub fn new(context: ModeContext, config: FullConfig) -> Self {
        Self {
            context,
            sync_interval: RwLock::new(config.sync_interval()),
            mirrors: Arc::new(DashMap::new()),
            last_sync: RwLock::new(None),
            last_sync_error: Arc::new(RwLock::new(None)),
            shutdown: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Union of all mirrored entries, deduplicated by content hash.
    pub fn get_all_entries(&self) -> Vec<CatalogEntry> {
        let mut seen = std::collections::HashSet::new();
        let mut entries = Vec::new();
        for mirror in self.mirrors.iter() {
            for entry in &mirror.value().entries {
                if seen.insert(entry.content_hash.clone()) {
                    entries.push(entry.clone());
                }
            }
        }
        entries
    }

    pub fn mirrored_peers(&self) -> Vec<PeerId> {
        self.mirrors.iter().map(|m| *m.key()).collect()
    }

    pub fn last_sync(&self) -> Option<DateTime<Utc>> {
        *self.last_sync.read()
    }

    /// Refresh every connected peer's mirror once.
    pub async fn sync_once(&self) -> Result<()> {
        sync_cycle(&self.context, &self.mirrors, &self.last_sync_error).await;
        *self.last_sync.write() = Some(Utc::now());
        Ok(())
    }
}

/// One pass over the connected peers. Per-peer failures are recorded and
/// the cycle moves on.
async fn sync_cycle(
    context: &ModeContext,
    mirrors: &DashMap<PeerId, CatalogSnapshot>,
    last_sync_error: &RwLock<Option<SyncError>>,
) {
    let peers = match context.host.peers().await {
        Ok(peers) => peers,
        Err(e) => {
            tracing::debug!(error = %e, "Sync cycle could not list peers");
            return;
        }
    };
    for peer in peers {
        let since = mirrors.get(&peer).map(|m| m.version);
        match context.client.get_catalog(peer, since).await {
            Ok(CatalogReply::Snapshot(snapshot)) => {
                mirrors.insert(peer, snapshot);
            }
            Ok(CatalogReply::Stub { .. }) => {
                // Mirror already current.
            }
            Err(e) => {
                tracing::debug!(peer = %peer, error = %e, "Catalog sync failed for peer");
                *last_sync_error.write() = Some(SyncError {
                    peer,
                    error: e.to_string(),
                    at: Utc::now(),
                });
            }
        }
    }
}

#[async_trait::async_trait]
impl ModeHandler for FullHandler {
    fn mode(&self) -> NodeMode {
        NodeMode::Full
    }

    async fn start(&self) -> Result<()> {
        let context = self.context.clone();
        let mirrors = Arc::clone(&self.mirrors);
        let last_sync_error = Arc::clone(&self.last_sync_error);
        let interval = *self.sync_interval.read();
        let shutdown = self.shutdown.clone();

        let task = tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tick.tick() => {
                        sync_cycle(&context, &mirrors, &last_sync_error).await;
                    }
                }
            }
        });
        self.tasks.lock().push(task);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.shutdown.cancel();
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        Ok(())
    }

    async fn on_config_update(&self, config: &P2pConfig) -> Result<()> {
        *self.sync_interval.write() = config.full.sync_interval();
        Ok(())
    }

    /// Answer from the mirrored union; no forwarding needed.
    async fn query(&self, query: CatalogQuery) -> Result<QueryResult> {
        let matched: Vec<CatalogEntry> = self
            .get_all_entries()
            .into_iter()
            .filter(|entry| query.matches(entry))
            .collect();
        let total = matched.len();

        let offset = query.offset.unwrap_or(0);
        let limit = query.limit.unwrap_or(usize::MAX);
        let entries = matched.into_iter().skip(offset).take(limit).collect();
        Ok(QueryResult { entries, total })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(owner: &str, version: u64, hashes: &[&str]) -> CatalogSnapshot {
        CatalogSnapshot {
            owner: owner.to_string(),
            version,
            entries: hashes
                .iter()
                .map(|h| CatalogEntry {
                    topic_id: "t".to_string(),
                    dataset_id: format!("ds-{h}"),
                    name: format!("ds-{h}"),
                    content_hash: h.to_string(),
                    size: 1,
                    chunk_count: 1,
                    updated_at: Utc::now(),
                })
                .collect(),
            last_updated: Utc::now(),
        }
    }

    #[test]
    fn test_union_dedups_by_hash() {
        let mirrors: DashMap<PeerId, CatalogSnapshot> = DashMap::new();
        mirrors.insert(PeerId::random(), snapshot("a", 1, &["h1", "h2"]));
        mirrors.insert(PeerId::random(), snapshot("b", 4, &["h2", "h3"]));

        let mut seen = std::collections::HashSet::new();
        let mut union = Vec::new();
        for mirror in mirrors.iter() {
            for entry in &mirror.value().entries {
                if seen.insert(entry.content_hash.clone()) {
                    union.push(entry.clone());
                }
            }
        }
        let mut hashes: Vec<_> = union.iter().map(|e| e.content_hash.clone()).collect();
        hashes.sort();
        assert_eq!(hashes, vec!["h1", "h2", "h3"]);
    }
}
