// Selective mode: mirror only subscribed topics.
//
// Subscriptions are glob patterns persisted to a JSON file the moment
// they change. The file is written atomically (temp file + rename) with
// owner-only permissions.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex as AsyncMutex;

use super::{fan_out_query, ModeContext, ModeHandler, NodeMode};
use crate::catalog::CatalogQuery;
use crate::config::{P2pConfig, SelectiveConfig};
use crate::error::{BibError, Result};
use crate::protocol::QueryResult;

/// One persisted subscription.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscription {
    pub pattern: String,
    pub created_at: DateTime<Utc>,
    pub last_sync: Option<DateTime<Utc>>,
}

pub struct SelectiveHandler {
    context: ModeContext,
    store_path: PathBuf,
    subscriptions: RwLock<Vec<Subscription>>,
    // Serializes file writes so concurrent updates cannot interleave.
    persist_lock: AsyncMutex<()>,
}

impl SelectiveHandler {
    pub fn new(context: ModeContext, config: SelectiveConfig, config_dir: &Path) -> Self {
        let store_path = config
            .subscription_store_path
            .clone()
            .unwrap_or_else(|| config_dir.join("subscriptions.json"));

        let mut subscriptions = load_subscriptions(&store_path).unwrap_or_else(|e| {
            tracing::warn!(path = %store_path.display(), error = %e, "Could not load subscriptions, starting empty");
            Vec::new()
        });

        // Patterns seeded from config are merged into the persisted set.
        for pattern in &config.subscriptions {
            if !subscriptions.iter().any(|s| &s.pattern == pattern) {
                subscriptions.push(Subscription {
                    pattern: pattern.clone(),
                    created_at: Utc::now(),
                    last_sync: None,
                });
            }
        }

        Self {
            context,
            store_path,
            subscriptions: RwLock::new(subscriptions),
            persist_lock: AsyncMutex::new(()),
        }
    }

    pub fn subscriptions(&self) -> Vec<Subscription> {
        self.subscriptions.read().clone()
    }

    /// Add a pattern. Re-subscribing an existing pattern is a no-op.
    pub async fn subscribe(&self, pattern: &str) -> Result<()> {
        glob::Pattern::new(pattern)
            .map_err(|e| BibError::InvalidInput(format!("subscription pattern {pattern:?}: {e}")))?;

        {
            let mut subscriptions = self.subscriptions.write();
            if subscriptions.iter().any(|s| s.pattern == pattern) {
                return Ok(());
            }
            subscriptions.push(Subscription {
                pattern: pattern.to_string(),
                created_at: Utc::now(),
                last_sync: None,
            });
        }
        self.persist().await
    }

    /// Remove a pattern. Unknown patterns are ignored.
    pub async fn unsubscribe(&self, pattern: &str) -> Result<()> {
        let removed = {
            let mut subscriptions = self.subscriptions.write();
            let before = subscriptions.len();
            subscriptions.retain(|s| s.pattern != pattern);
            subscriptions.len() != before
        };
        if removed {
            self.persist().await?;
        }
        Ok(())
    }

    /// Query every connected peer for entries matching `pattern` and stamp
    /// the subscription's last sync on success.
    pub async fn sync_subscription(&self, pattern: &str) -> Result<QueryResult> {
        if !self.subscriptions.read().iter().any(|s| s.pattern == pattern) {
            return Err(BibError::not_found(format!("subscription {pattern:?}")));
        }

        let peers = self.context.host.peers().await?;
        let query = CatalogQuery {
            name_pattern: Some(pattern.to_string()),
            ..Default::default()
        };
        let result = fan_out_query(&self.context, peers, &query).await;

        {
            let mut subscriptions = self.subscriptions.write();
            if let Some(sub) = subscriptions.iter_mut().find(|s| s.pattern == pattern) {
                sub.last_sync = Some(Utc::now());
            }
        }
        self.persist().await?;
        Ok(result)
    }

    async fn persist(&self) -> Result<()> {
        let _guard = self.persist_lock.lock().await;
        let subscriptions = self.subscriptions.read().clone();
        write_subscriptions(&self.store_path, &subscriptions)
    }
}

#[async_trait::async_trait]
impl ModeHandler for SelectiveHandler {
    fn mode(&self) -> NodeMode {
        NodeMode::Selective
    }

    async fn start(&self) -> Result<()> {
        // Persist the merged config + file set so both survive a restart.
        self.persist().await
    }

    async fn stop(&self) -> Result<()> {
        Ok(())
    }

    async fn on_config_update(&self, config: &P2pConfig) -> Result<()> {
        let mut changed = false;
        {
            let mut subscriptions = self.subscriptions.write();
            for pattern in &config.selective.subscriptions {
                if !subscriptions.iter().any(|s| &s.pattern == pattern) {
                    subscriptions.push(Subscription {
                        pattern: pattern.clone(),
                        created_at: Utc::now(),
                        last_sync: None,
                    });
                    changed = true;
                }
            }
        }
        if changed {
            self.persist().await?;
        }
        Ok(())
    }

    /// Like proxy forwarding, but never cached.
    async fn query(&self, query: CatalogQuery) -> Result<QueryResult> {
        let peers = self.context.host.peers().await?;
        Ok(fan_out_query(&self.context, peers, &query).await)
    }
}

fn load_subscriptions(path: &Path) -> Result<Vec<Subscription>> {
    match fs::read(path) {
        Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(e.into()),
    }
}

fn write_subscriptions(path: &Path, subscriptions: &[Subscription]) -> Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir)?;
    set_mode(dir, 0o700)?;

    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, serde_json::to_vec_pretty(subscriptions)?)?;
    set_mode(&tmp, 0o600)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))?;
    Ok(())
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subscriptions_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("subscriptions.json");
        let subs = vec![
            Subscription {
                pattern: "climate/*".to_string(),
                created_at: Utc::now(),
                last_sync: None,
            },
            Subscription {
                pattern: "geo/maps-*".to_string(),
                created_at: Utc::now(),
                last_sync: Some(Utc::now()),
            },
        ];

        write_subscriptions(&path, &subs).unwrap();
        let loaded = load_subscriptions(&path).unwrap();
        assert_eq!(loaded, subs);
    }

    #[cfg(unix)]
    #[test]
    fn test_subscriptions_file_permissions() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("subscriptions.json");
        write_subscriptions(&path, &[]).unwrap();
        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_missing_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let loaded = load_subscriptions(&dir.path().join("subscriptions.json")).unwrap();
        assert!(loaded.is_empty());
    }
}
