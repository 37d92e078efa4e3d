// End-to-end node scenarios over real sockets on the loopback interface:
// bootstrap with a dead peer in the set, catalog delta sync, verified
// chunk transfer with a corrupting peer, and mode switching with the
// proxy cache.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bib::catalog::{CatalogEntry, Chunk};
use bib::config::P2pConfig;
use bib::error::BibError;
use bib::modes::NodeMode;
use bib::node::{DatasetStore, MemoryDatasetStore, Node};
use bib::transfer::{DownloadStatus, TransferCallbacks};
use libp2p::{Multiaddr, PeerId};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

fn entry(topic: &str, dataset: &str, hash: &str) -> CatalogEntry {
    CatalogEntry {
        topic_id: topic.to_string(),
        dataset_id: dataset.to_string(),
        name: format!("{topic}/{dataset}"),
        content_hash: hash.to_string(),
        size: 64,
        chunk_count: 1,
        updated_at: chrono::Utc::now(),
    }
}

fn quiet_config() -> P2pConfig {
    let mut config = P2pConfig::default();
    config.listen_addresses = vec!["/ip4/127.0.0.1/tcp/0".to_string()];
    config.mdns.enabled = false;
    config.dht.enabled = false;
    config.bootstrap.peers = Vec::new();
    config.bootstrap.min_peers = 0;
    config
}

struct TestNode {
    node: Arc<Node>,
    datasets: Arc<MemoryDatasetStore>,
    _dir: tempfile::TempDir,
}

async fn spawn_node(mut mutate: impl FnMut(&mut P2pConfig)) -> TestNode {
    let dir = tempfile::tempdir().unwrap();
    let mut config = quiet_config();
    mutate(&mut config);

    let datasets = Arc::new(MemoryDatasetStore::new());
    let node = Arc::new(
        Node::new(
            config,
            dir.path(),
            Arc::clone(&datasets) as Arc<dyn DatasetStore>,
            TransferCallbacks::default(),
        )
        .unwrap(),
    );
    node.start(CancellationToken::new()).await.unwrap();

    TestNode {
        node,
        datasets,
        _dir: dir,
    }
}

/// First listen address with the peer id appended, once the listener is up.
async fn listen_addr(node: &Node) -> Multiaddr {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let addrs = node.host().listen_addrs().await.unwrap();
        if let Some(addr) = addrs.into_iter().next() {
            return addr.with(libp2p::multiaddr::Protocol::P2p(node.host().local_peer_id()));
        }
        assert!(Instant::now() < deadline, "listener never came up");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

async fn wait_for(mut condition: impl FnMut() -> bool, what: &str) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_bootstrap_with_one_dead_peer() {
    let provider = spawn_node(|_| {}).await;
    let provider_addr = listen_addr(&provider.node).await;

    let dead_peer = PeerId::random();
    let dead_addr = format!("/ip4/127.0.0.1/tcp/1/p2p/{dead_peer}");

    let started = Instant::now();
    let joiner = spawn_node(|config| {
        config.bootstrap.peers = vec![provider_addr.to_string(), dead_addr.clone()];
        config.bootstrap.min_peers = 1;
    })
    .await;
    // One reachable peer satisfies min_peers; the dead one must not block.
    assert!(started.elapsed() < Duration::from_secs(2));

    let provider_peer = provider.node.host().local_peer_id();
    let record = joiner
        .node
        .peer_store()
        .get_peer(&provider_peer)
        .unwrap()
        .expect("provider is in the peer store");
    assert!(record.is_bootstrap);
    assert!(record.last_seen > 0);
    assert!(record.successes >= 1);

    let store = Arc::clone(joiner.node.peer_store());
    wait_for(
        move || {
            store
                .get_peer(&dead_peer)
                .unwrap()
                .map(|r| r.failures >= 1)
                .unwrap_or(false)
        },
        "dead bootstrap peer failure count",
    )
    .await;

    joiner.node.stop().await.unwrap();
    provider.node.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_catalog_delta_sync() {
    let node_a = spawn_node(|_| {}).await;
    let addr_a = listen_addr(&node_a.node).await;

    let node_b = spawn_node(|config| {
        config.bootstrap.peers = vec![addr_a.to_string()];
        config.bootstrap.min_peers = 1;
    })
    .await;

    // A serves {h1, h2, h3} at version 3; B holds {h2, h4} at version 2.
    node_a.node.catalog().publish(entry("t", "d1", "h1"));
    node_a.node.catalog().publish(entry("t", "d2", "h2"));
    node_a.node.catalog().publish(entry("t", "d3", "h3"));
    node_b.node.catalog().publish(entry("t", "d2", "h2"));
    node_b.node.catalog().publish(entry("t", "d4", "h4"));

    let peer_a = node_a.node.host().local_peer_id();
    let state = node_b
        .node
        .client()
        .sync_state(
            peer_a,
            node_b.node.catalog().version(),
            node_b.node.catalog().hashes(),
        )
        .await
        .unwrap();

    let mut missing = state.missing_hashes.clone();
    missing.sort();
    assert_eq!(missing, vec!["h1", "h3"]);
    assert_eq!(state.wanted_hashes, vec!["h4"]);
    assert_eq!(state.catalog_version, 3);

    // Both sides' wanted sets are subsets of the counterpart's catalog.
    for hash in &state.wanted_hashes {
        assert!(node_b.node.catalog().get_by_hash(hash).is_some());
    }

    node_b.node.stop().await.unwrap();
    node_a.node.stop().await.unwrap();
}

/// Serves chunks whose bytes no longer match their hash.
struct CorruptingStore {
    inner: MemoryDatasetStore,
}

impl DatasetStore for CorruptingStore {
    fn dataset(&self, dataset_id: &str) -> Option<(bib::catalog::Dataset, bib::catalog::DatasetContent)> {
        self.inner.dataset(dataset_id)
    }

    fn chunk(&self, dataset_id: &str, index: u32) -> Option<Chunk> {
        self.inner.chunk(dataset_id, index).map(|mut chunk| {
            chunk.data[0] ^= 0xff;
            chunk
        })
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_transfer_routes_around_corrupting_peer() {
    let bytes: Vec<u8> = (0..4096u32).map(|i| (i % 241) as u8).collect();

    // An honest provider and one that flips bytes in every chunk.
    let honest = spawn_node(|_| {}).await;
    let (_, content) = honest
        .datasets
        .insert("ds-1", "numbers", "math", &bytes, 1024);
    assert_eq!(content.chunk_count, 4);

    let corrupt_dir = tempfile::tempdir().unwrap();
    let corrupt_store = Arc::new(CorruptingStore {
        inner: MemoryDatasetStore::new(),
    });
    corrupt_store
        .inner
        .insert("ds-1", "numbers", "math", &bytes, 1024);
    let corrupt_node = Arc::new(
        Node::new(
            quiet_config(),
            corrupt_dir.path(),
            Arc::clone(&corrupt_store) as Arc<dyn DatasetStore>,
            TransferCallbacks::default(),
        )
        .unwrap(),
    );
    corrupt_node.start(CancellationToken::new()).await.unwrap();

    let honest_addr = listen_addr(&honest.node).await;
    let corrupt_addr = listen_addr(&corrupt_node).await;

    let received: Arc<Mutex<Vec<Chunk>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&received);

    let dir = tempfile::tempdir().unwrap();
    let mut config = quiet_config();
    config.bootstrap.peers = vec![honest_addr.to_string(), corrupt_addr.to_string()];
    config.bootstrap.min_peers = 2;
    config.transfer.max_retries = 2;
    config.transfer.parallel_peers = true;

    let downloader = Arc::new(
        Node::new(
            config,
            dir.path(),
            Arc::new(MemoryDatasetStore::new()) as Arc<dyn DatasetStore>,
            TransferCallbacks {
                on_chunk: Some(Arc::new(move |_download, chunk: &Chunk| {
                    sink.lock().push(chunk.clone());
                })),
                ..Default::default()
            },
        )
        .unwrap(),
    );
    downloader.start(CancellationToken::new()).await.unwrap();

    let corrupt_peer = corrupt_node.host().local_peer_id();
    let honest_peer = honest.node.host().local_peer_id();

    let download = downloader
        .transfer()
        .start_download(
            "ds-1",
            content.hash.clone(),
            content.chunk_count,
            // The corrupting peer comes first so it is actually consulted.
            vec![corrupt_peer, honest_peer],
        )
        .unwrap();

    // Idempotent by dataset hash while running.
    let again = downloader
        .transfer()
        .start_download("ds-1", content.hash.clone(), content.chunk_count, vec![honest_peer])
        .unwrap();
    assert_eq!(again.id, download.id);

    let watched = Arc::clone(&download);
    wait_for(
        move || watched.status() == DownloadStatus::Completed,
        "download completion",
    )
    .await;

    assert!(download.is_complete());
    let chunks = received.lock();
    assert_eq!(chunks.len(), 4);
    for chunk in chunks.iter() {
        chunk.verify().unwrap();
    }

    // Corruption attempts were charged against the dishonest peer.
    let record = downloader
        .peer_store()
        .get_peer(&corrupt_peer)
        .unwrap()
        .unwrap();
    assert!(record.failures >= 1, "corrupting peer accrued no failures");

    downloader.stop().await.unwrap();
    assert_eq!(downloader.active_streams(), 0);
    corrupt_node.stop().await.unwrap();
    honest.node.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_mode_switch_discards_proxy_cache() {
    let provider = spawn_node(|_| {}).await;
    let addr = listen_addr(&provider.node).await;
    provider.node.catalog().publish(entry("t", "d1", "h1"));
    provider.node.catalog().publish(entry("t", "d2", "h2"));

    let proxy = spawn_node(|config| {
        config.mode = "proxy".to_string();
        config.bootstrap.peers = vec![addr.to_string()];
        config.bootstrap.min_peers = 1;
    })
    .await;
    assert_eq!(
        proxy.node.mode_manager().current_mode().await,
        Some(NodeMode::Proxy)
    );

    let query = bib::catalog::CatalogQuery {
        topic_id: Some("t".to_string()),
        ..Default::default()
    };

    let first = proxy.node.mode_manager().query(query.clone()).await.unwrap();
    assert_eq!(first.total, 2);

    // The provider gains an entry, but the identical query is served from
    // the proxy cache.
    provider.node.catalog().publish(entry("t", "d3", "h3"));
    let cached = proxy.node.mode_manager().query(query.clone()).await.unwrap();
    assert_eq!(cached.total, 2);

    // Switching modes drops the proxy handler and its cache.
    proxy
        .node
        .mode_manager()
        .set_mode(NodeMode::Selective)
        .await
        .unwrap();
    // Re-selecting the active mode is a no-op returning success.
    proxy
        .node
        .mode_manager()
        .set_mode(NodeMode::Selective)
        .await
        .unwrap();

    let fresh = proxy.node.mode_manager().query(query).await.unwrap();
    assert_eq!(fresh.total, 3);

    proxy.node.stop().await.unwrap();
    provider.node.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_rejects_unknown_mode_on_update() {
    let node = spawn_node(|_| {}).await;
    let mut config = quiet_config();
    config.mode = "archive".to_string();
    let err = node.node.mode_manager().update_config(config).await.unwrap_err();
    assert!(matches!(err, BibError::InvalidInput(_)));
    node.node.stop().await.unwrap();
}
