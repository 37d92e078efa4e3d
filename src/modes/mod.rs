// Node modes and the mode manager.
//
// A node runs exactly one mode handler at a time. `set_mode` stops the
// current handler, builds and starts the replacement, and swaps it in
// atomically under the manager's lock; a start failure leaves the node
// handler-less and surfaces the error. Config updates that do not change
// the mode are forwarded to the running handler.

mod full;
mod proxy;
mod selective;

pub use full::FullHandler;
pub use proxy::ProxyHandler;
pub use selective::{SelectiveHandler, Subscription};

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use crate::catalog::CatalogQuery;
use crate::config::P2pConfig;
use crate::error::{BibError, Result};
use crate::host::Host;
use crate::protocol::{ProtocolClient, QueryResult};

/// Storage/availability posture of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeMode {
    /// No local catalog; queries are forwarded to peers.
    Proxy,
    /// Mirrors only subscribed topics.
    Selective,
    /// Mirrors the catalogs of every connected peer.
    Full,
}

impl fmt::Display for NodeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NodeMode::Proxy => "proxy",
            NodeMode::Selective => "selective",
            NodeMode::Full => "full",
        };
        f.write_str(s)
    }
}

impl FromStr for NodeMode {
    type Err = BibError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "proxy" => Ok(NodeMode::Proxy),
            "selective" => Ok(NodeMode::Selective),
            "full" => Ok(NodeMode::Full),
            other => Err(BibError::InvalidInput(format!("unknown mode {other:?}"))),
        }
    }
}

/// Shared handles every mode handler works with.
#[derive(Clone)]
pub struct ModeContext {
    pub host: Arc<Host>,
    pub client: Arc<ProtocolClient>,
}

/// The capability set every mode implements.
#[async_trait::async_trait]
pub trait ModeHandler: Send + Sync {
    fn mode(&self) -> NodeMode;

    async fn start(&self) -> Result<()>;

    async fn stop(&self) -> Result<()>;

    async fn on_config_update(&self, config: &P2pConfig) -> Result<()>;

    /// Answer a catalog query according to the mode's storage posture.
    async fn query(&self, query: CatalogQuery) -> Result<QueryResult>;
}

/// State machine over the three handlers.
pub struct ModeManager {
    context: ModeContext,
    config_dir: PathBuf,
    config: parking_lot::Mutex<P2pConfig>,
    // Serializes transitions; `set_mode` is atomic w.r.t. `update_config`.
    handler: tokio::sync::Mutex<Option<Arc<dyn ModeHandler>>>,
}

impl ModeManager {
    pub fn new(context: ModeContext, config: P2pConfig, config_dir: PathBuf) -> Self {
        Self {
            context,
            config_dir,
            config: parking_lot::Mutex::new(config),
            handler: tokio::sync::Mutex::new(None),
        }
    }

    /// Instantiate and start the mode named by the current config.
    pub async fn start(&self) -> Result<()> {
        let mode = self.config.lock().mode.parse::<NodeMode>()?;
        self.set_mode(mode).await
    }

    pub async fn current_mode(&self) -> Option<NodeMode> {
        self.handler.lock().await.as_ref().map(|h| h.mode())
    }

    /// Switch modes. Re-selecting the running mode is a no-op.
    pub async fn set_mode(&self, mode: NodeMode) -> Result<()> {
        let mut guard = self.handler.lock().await;

        if let Some(current) = guard.as_ref() {
            if current.mode() == mode {
                return Ok(());
            }
            current.stop().await?;
            *guard = None;
        }

        let handler = self.build_handler(mode)?;
        handler.start().await?;
        tracing::info!(mode = %mode, "Mode handler started");
        *guard = Some(handler);
        Ok(())
    }

    /// Apply a new config: a changed mode triggers a switch, anything else
    /// is forwarded to the running handler.
    pub async fn update_config(&self, config: P2pConfig) -> Result<()> {
        let mode = config.mode.parse::<NodeMode>()?;
        *self.config.lock() = config.clone();

        let guard = self.handler.lock().await;
        match guard.as_ref() {
            Some(current) if current.mode() == mode => current.on_config_update(&config).await,
            _ => {
                drop(guard);
                self.set_mode(mode).await
            }
        }
    }

    pub async fn query(&self, query: CatalogQuery) -> Result<QueryResult> {
        let guard = self.handler.lock().await;
        match guard.as_ref() {
            Some(handler) => {
                let handler = Arc::clone(handler);
                drop(guard);
                handler.query(query).await
            }
            None => Err(BibError::InvalidInput("no active mode handler".to_string())),
        }
    }

    pub async fn stop(&self) -> Result<()> {
        let mut guard = self.handler.lock().await;
        if let Some(handler) = guard.take() {
            handler.stop().await?;
        }
        Ok(())
    }

    fn build_handler(&self, mode: NodeMode) -> Result<Arc<dyn ModeHandler>> {
        let config = self.config.lock().clone();
        Ok(match mode {
            NodeMode::Proxy => Arc::new(ProxyHandler::new(self.context.clone(), config.proxy)),
            NodeMode::Selective => Arc::new(SelectiveHandler::new(
                self.context.clone(),
                config.selective,
                &self.config_dir,
            )),
            NodeMode::Full => Arc::new(FullHandler::new(self.context.clone(), config.full)),
        })
    }
}

/// Fan a query out to peers and merge the answers, deduplicated by content
/// hash. Pagination is applied after the merge, so the forwarded query
/// carries the filters but not the page bounds.
pub(crate) async fn fan_out_query(
    context: &ModeContext,
    targets: Vec<libp2p::PeerId>,
    query: &CatalogQuery,
) -> QueryResult {
    let mut forwarded = query.clone();
    forwarded.limit = None;
    forwarded.offset = None;

    let futures: Vec<_> = targets
        .into_iter()
        .map(|peer| {
            let client = Arc::clone(&context.client);
            let forwarded = forwarded.clone();
            async move { (peer, client.query_catalog(peer, forwarded).await) }
        })
        .collect();
    let results = futures::future::join_all(futures).await;

    let mut seen = std::collections::HashSet::new();
    let mut entries = Vec::new();
    for (peer, result) in results {
        match result {
            Ok(page) => {
                for entry in page.entries {
                    if seen.insert(entry.content_hash.clone()) {
                        entries.push(entry);
                    }
                }
            }
            Err(e) => {
                tracing::debug!(peer = %peer, error = %e, "Peer query failed");
            }
        }
    }

    let total = entries.len();
    let offset = query.offset.unwrap_or(0);
    let limit = query.limit.unwrap_or(usize::MAX);
    let entries = entries.into_iter().skip(offset).take(limit).collect();
    QueryResult { entries, total }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_parse_round_trip() {
        for mode in [NodeMode::Proxy, NodeMode::Selective, NodeMode::Full] {
            assert_eq!(mode.to_string().parse::<NodeMode>().unwrap(), mode);
        }
        assert!(matches!(
            "archive".parse::<NodeMode>().unwrap_err(),
            BibError::InvalidInput(_)
        ));
    }
}
