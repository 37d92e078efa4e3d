// Proxy mode: no local catalog, every query is forwarded.
//
// Favorites are asked first, then the rest of the connected peers.
// Results are cached by query fingerprint with a TTL and a capacity
// bound; when full, the entry nearest expiry makes room.

use libp2p::PeerId;
use parking_lot::{Mutex, RwLock};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::str::FromStr;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::{fan_out_query, ModeContext, ModeHandler, NodeMode};
use crate::catalog::CatalogQuery;
use crate::config::{P2pConfig, ProxyConfig};
use crate::error::Result;
use crate::protocol::QueryResult;

const CACHE_CLEANUP_INTERVAL: Duration = Duration::from_secs(30);

struct CacheEntry {
    result: QueryResult,
    expires_at: Instant,
}

/// TTL + capacity bounded query cache.
struct QueryCache {
    entries: Mutex<HashMap<String, CacheEntry>>,
    ttl: RwLock<Duration>,
    capacity: RwLock<usize>,
}

impl QueryCache {
    fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl: RwLock::new(ttl),
            capacity: RwLock::new(capacity),
        }
    }

    fn get(&self, key: &str) -> Option<QueryResult> {
        let entries = self.entries.lock();
        entries
            .get(key)
            .filter(|entry| entry.expires_at > Instant::now())
            .map(|entry| entry.result.clone())
    }

    fn put(&self, key: String, result: QueryResult) {
        let ttl = *self.ttl.read();
        let capacity = *self.capacity.read();
        let mut entries = self.entries.lock();

        if entries.len() >= capacity && !entries.contains_key(&key) {
            // Make room by dropping the entry nearest expiry.
            if let Some(victim) = entries
                .iter()
                .min_by_key(|(_, entry)| entry.expires_at)
                .map(|(k, _)| k.clone())
            {
                entries.remove(&victim);
            }
        }

        entries.insert(
            key,
            CacheEntry {
                result,
                expires_at: Instant::now() + ttl,
            },
        );
    }

    fn cleanup(&self) {
        let now = Instant::now();
        self.entries.lock().retain(|_, entry| entry.expires_at > now);
    }

    fn clear(&self) {
        self.entries.lock().clear();
    }

    fn len(&self) -> usize {
        self.entries.lock().len()
    }
}

fn fingerprint(query: &CatalogQuery) -> String {
    let encoded = serde_json::to_vec(query).unwrap_or_default();
    hex::encode(Sha256::digest(encoded))
}

pub struct ProxyHandler {
    context: ModeContext,
    favorites: RwLock<Vec<PeerId>>,
    cache: std::sync::Arc<QueryCache>,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ProxyHandler {
    pub fn new(context: ModeContext, config: ProxyConfig) -> Self {
        Self {
            context,
            favorites: RwLock::new(parse_favorites(&config.favorite_peers)),
            cache: std::sync::Arc::new(QueryCache::new(
                config.cache_ttl(),
                config.max_cache_size.max(1),
            )),
            shutdown: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn add_favorite(&self, peer: PeerId) {
        let mut favorites = self.favorites.write();
        if !favorites.contains(&peer) {
            favorites.push(peer);
        }
    }

    pub fn remove_favorite(&self, peer: &PeerId) {
        self.favorites.write().retain(|p| p != peer);
    }

    pub fn favorites(&self) -> Vec<PeerId> {
        self.favorites.read().clone()
    }

    pub fn clear_cache(&self) {
        self.cache.clear();
    }

    pub fn cached_queries(&self) -> usize {
        self.cache.len()
    }

    /// Favorites first, then the remaining connected peers.
    async fn targets(&self) -> Result<Vec<PeerId>> {
        let favorites = self.favorites.read().clone();
        let mut targets = favorites.clone();
        for peer in self.context.host.peers().await? {
            if !targets.contains(&peer) {
                targets.push(peer);
            }
        }
        Ok(targets)
    }
}

#[async_trait::async_trait]
impl ModeHandler for ProxyHandler {
    fn mode(&self) -> NodeMode {
        NodeMode::Proxy
    }

    async fn start(&self) -> Result<()> {
        let cache = std::sync::Arc::clone(&self.cache);
        let shutdown = self.shutdown.clone();
        let task = tokio::spawn(async move {
            let mut tick = tokio::time::interval(CACHE_CLEANUP_INTERVAL);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tick.tick() => cache.cleanup(),
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
        *self.favorites.write() = parse_favorites(&config.proxy.favorite_peers);
        *self.cache.ttl.write() = config.proxy.cache_ttl();
        *self.cache.capacity.write() = config.proxy.max_cache_size.max(1);
        Ok(())
    }

    async fn query(&self, query: CatalogQuery) -> Result<QueryResult> {
        let key = fingerprint(&query);
        if let Some(result) = self.cache.get(&key) {
            tracing::debug!(fingerprint = %key, "Query cache hit");
            return Ok(result);
        }

        let targets = self.targets().await?;
        let result = fan_out_query(&self.context, targets, &query).await;
        self.cache.put(key, result.clone());
        Ok(result)
    }
}

fn parse_favorites(raw: &[String]) -> Vec<PeerId> {
    raw.iter()
        .filter_map(|s| match PeerId::from_str(s) {
            Ok(peer) => Some(peer),
            Err(_) => {
                tracing::warn!(peer = %s, "Ignoring unparseable favorite peer id");
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::CatalogEntry;
    use chrono::Utc;

    fn result(n: usize) -> QueryResult {
        QueryResult {
            entries: (0..n)
                .map(|i| CatalogEntry {
                    topic_id: "t".to_string(),
                    dataset_id: format!("d{i}"),
                    name: format!("d{i}"),
                    content_hash: format!("h{i}"),
                    size: 1,
                    chunk_count: 1,
                    updated_at: Utc::now(),
                })
                .collect(),
            total: n,
        }
    }

    #[test]
    fn test_cache_ttl_expiry() {
        let cache = QueryCache::new(Duration::from_millis(0), 10);
        cache.put("k".to_string(), result(1));
        // Zero TTL: expired immediately.
        assert!(cache.get("k").is_none());

        let cache = QueryCache::new(Duration::from_secs(60), 10);
        cache.put("k".to_string(), result(1));
        assert_eq!(cache.get("k").unwrap().total, 1);
    }

    #[test]
    fn test_cache_evicts_nearest_expiry_when_full() {
        let cache = QueryCache::new(Duration::from_secs(60), 2);
        cache.put("a".to_string(), result(1));
        std::thread::sleep(Duration::from_millis(5));
        cache.put("b".to_string(), result(2));
        std::thread::sleep(Duration::from_millis(5));
        cache.put("c".to_string(), result(3));

        // "a" expires first and was the victim.
        assert!(cache.get("a").is_none());
        assert!(cache.get("b").is_some());
        assert!(cache.get("c").is_some());
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_fingerprint_distinguishes_queries() {
        let a = CatalogQuery {
            topic_id: Some("climate".to_string()),
            ..Default::default()
        };
        let b = CatalogQuery {
            topic_id: Some("geo".to_string()),
            ..Default::default()
        };
        assert_ne!(fingerprint(&a), fingerprint(&b));
        assert_eq!(fingerprint(&a), fingerprint(&a.clone()));
    }
}
