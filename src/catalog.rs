// The data catalog: the set of dataset entries a node claims to serve.
//
// One catalog per node, updated in place; the version is bumped on every
// add, edit and remove so peers can cheaply detect staleness. Replicas of
// remote catalogs (full mode) are advisory and keyed by source peer id.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

use crate::error::{BibError, Result};

/// A dataset a node can serve.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dataset {
    pub id: String,
    pub name: String,
    pub topic_id: String,
    pub created_at: DateTime<Utc>,
}

/// Content identity of a dataset: what gets transferred and verified.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetContent {
    /// Lowercase hex SHA-256 of the whole dataset.
    pub hash: String,
    pub size: u64,
    pub chunk_count: u32,
    pub chunk_size: u32,
}

/// A content-addressed fragment of a dataset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub dataset_id: String,
    pub index: u32,
    /// Lowercase hex SHA-256 of `data`.
    pub hash: String,
    pub size: u32,
    pub data: Vec<u8>,
}

impl Chunk {
    pub fn new(dataset_id: impl Into<String>, index: u32, data: Vec<u8>) -> Self {
        let hash = content_hash(&data);
        Self {
            dataset_id: dataset_id.into(),
            index,
            hash,
            size: data.len() as u32,
            data,
        }
    }

    /// Verify the payload against the carried hash.
    pub fn verify(&self) -> Result<()> {
        let actual = content_hash(&self.data);
        if actual != self.hash {
            return Err(BibError::HashMismatch {
                expected: self.hash.clone(),
                actual,
            });
        }
        Ok(())
    }
}

/// Lowercase hex SHA-256.
pub fn content_hash(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// One published catalog entry. `(topic_id, dataset_id)` is unique per owner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub topic_id: String,
    pub dataset_id: String,
    pub name: String,
    pub content_hash: String,
    pub size: u64,
    pub chunk_count: u32,
    pub updated_at: DateTime<Utc>,
}

/// Filters for a catalog query. All filters are optional and conjunctive;
/// `limit`/`offset` paginate after filtering.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogQuery {
    pub topic_id: Option<String>,
    pub dataset_id: Option<String>,
    /// Glob pattern matched against the entry name.
    pub name_pattern: Option<String>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

impl CatalogQuery {
    pub(crate) fn matches(&self, entry: &CatalogEntry) -> bool {
        if let Some(topic) = &self.topic_id {
            if &entry.topic_id != topic {
                return false;
            }
        }
        if let Some(dataset) = &self.dataset_id {
            if &entry.dataset_id != dataset {
                return false;
            }
        }
        if let Some(pattern) = &self.name_pattern {
            match glob::Pattern::new(pattern) {
                Ok(p) => {
                    if !p.matches(&entry.name) {
                        return false;
                    }
                }
                Err(_) => return false,
            }
        }
        true
    }
}

/// A point-in-time copy of a catalog, as exchanged on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogSnapshot {
    pub owner: String,
    pub version: u64,
    pub entries: Vec<CatalogEntry>,
    pub last_updated: DateTime<Utc>,
}

struct CatalogInner {
    entries: BTreeMap<(String, String), CatalogEntry>,
    version: u64,
    last_updated: DateTime<Utc>,
}

/// The node-owned catalog.
pub struct Catalog {
    owner: String,
    inner: RwLock<CatalogInner>,
}

impl Catalog {
    pub fn new(owner: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            inner: RwLock::new(CatalogInner {
                entries: BTreeMap::new(),
                version: 0,
                last_updated: Utc::now(),
            }),
        }
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn version(&self) -> u64 {
        self.inner.read().version
    }

    pub fn len(&self) -> usize {
        self.inner.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().entries.is_empty()
    }

    /// Publish (or update) an entry. Returns the new catalog version.
    pub fn publish(&self, entry: CatalogEntry) -> u64 {
        let mut inner = self.inner.write();
        let key = (entry.topic_id.clone(), entry.dataset_id.clone());
        inner.entries.insert(key, entry);
        inner.version += 1;
        inner.last_updated = Utc::now();
        inner.version
    }

    /// Remove an entry. Returns the new catalog version.
    pub fn remove(&self, topic_id: &str, dataset_id: &str) -> Result<u64> {
        let mut inner = self.inner.write();
        let key = (topic_id.to_string(), dataset_id.to_string());
        if inner.entries.remove(&key).is_none() {
            return Err(BibError::not_found(format!(
                "catalog entry {topic_id}/{dataset_id}"
            )));
        }
        inner.version += 1;
        inner.last_updated = Utc::now();
        Ok(inner.version)
    }

    pub fn get(&self, topic_id: &str, dataset_id: &str) -> Option<CatalogEntry> {
        self.inner
            .read()
            .entries
            .get(&(topic_id.to_string(), dataset_id.to_string()))
            .cloned()
    }

    pub fn get_by_hash(&self, content_hash: &str) -> Option<CatalogEntry> {
        self.inner
            .read()
            .entries
            .values()
            .find(|e| e.content_hash == content_hash)
            .cloned()
    }

    pub fn entries(&self) -> Vec<CatalogEntry> {
        self.inner.read().entries.values().cloned().collect()
    }

    pub fn hashes(&self) -> Vec<String> {
        self.inner
            .read()
            .entries
            .values()
            .map(|e| e.content_hash.clone())
            .collect()
    }

    /// Filter and paginate. Returns the page plus the total match count
    /// before pagination.
    pub fn query(&self, query: &CatalogQuery) -> (Vec<CatalogEntry>, usize) {
        let inner = self.inner.read();
        let matched: Vec<&CatalogEntry> = inner
            .entries
            .values()
            .filter(|e| query.matches(e))
            .collect();
        let total = matched.len();

        let offset = query.offset.unwrap_or(0);
        let limit = query.limit.unwrap_or(usize::MAX);
        let page = matched
            .into_iter()
            .skip(offset)
            .take(limit)
            .cloned()
            .collect();
        (page, total)
    }

    /// Compare against a peer's hash list: `missing` is what we have that
    /// the peer did not list, `wanted` is what the peer listed that we lack.
    pub fn diff(&self, remote_hashes: &[String]) -> CatalogDiff {
        let inner = self.inner.read();
        let local: std::collections::HashSet<&str> = inner
            .entries
            .values()
            .map(|e| e.content_hash.as_str())
            .collect();
        let remote: std::collections::HashSet<&str> =
            remote_hashes.iter().map(|h| h.as_str()).collect();

        CatalogDiff {
            missing: local
                .difference(&remote)
                .map(|h| h.to_string())
                .collect(),
            wanted: remote
                .difference(&local)
                .map(|h| h.to_string())
                .collect(),
            version: inner.version,
        }
    }

    pub fn snapshot(&self) -> CatalogSnapshot {
        let inner = self.inner.read();
        CatalogSnapshot {
            owner: self.owner.clone(),
            version: inner.version,
            entries: inner.entries.values().cloned().collect(),
            last_updated: inner.last_updated,
        }
    }
}

/// Result of a catalog hash comparison.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogDiff {
    /// Hashes present locally but absent from the peer's list.
    pub missing: Vec<String>,
    /// Hashes the peer listed that are absent locally.
    pub wanted: Vec<String>,
    /// Local catalog version at comparison time.
    pub version: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn entry(topic: &str, dataset: &str, hash: &str) -> CatalogEntry {
        CatalogEntry {
            topic_id: topic.to_string(),
            dataset_id: dataset.to_string(),
            name: format!("{topic}/{dataset}"),
            content_hash: hash.to_string(),
            size: 1024,
            chunk_count: 4,
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_version_strictly_increases() {
        let catalog = Catalog::new("owner");
        assert_eq!(catalog.version(), 0);
        let v1 = catalog.publish(entry("t", "a", "h1"));
        let v2 = catalog.publish(entry("t", "b", "h2"));
        let v3 = catalog.publish(entry("t", "a", "h1b"));
        let v4 = catalog.remove("t", "b").unwrap();
        assert_eq!((v1, v2, v3, v4), (1, 2, 3, 4));
        assert_eq!(catalog.len(), 1);
    }

    #[test]
    fn test_remove_missing_entry() {
        let catalog = Catalog::new("owner");
        assert!(matches!(
            catalog.remove("t", "x").unwrap_err(),
            BibError::NotFound(_)
        ));
    }

    #[test]
    fn test_query_filters_and_paginates() {
        let catalog = Catalog::new("owner");
        for i in 0..10 {
            catalog.publish(entry("climate", &format!("ds{i}"), &format!("h{i}")));
        }
        catalog.publish(entry("geo", "maps", "hg"));

        let (page, total) = catalog.query(&CatalogQuery {
            topic_id: Some("climate".to_string()),
            limit: Some(3),
            offset: Some(8),
            ..Default::default()
        });
        assert_eq!(total, 10);
        assert_eq!(page.len(), 2);

        let (named, total) = catalog.query(&CatalogQuery {
            name_pattern: Some("geo/*".to_string()),
            ..Default::default()
        });
        assert_eq!(total, 1);
        assert_eq!(named[0].dataset_id, "maps");
    }

    #[test]
    fn test_diff_splits_missing_and_wanted() {
        let catalog = Catalog::new("a");
        catalog.publish(entry("t", "1", "h1"));
        catalog.publish(entry("t", "2", "h2"));
        catalog.publish(entry("t", "3", "h3"));

        let diff = catalog.diff(&["h2".to_string(), "h4".to_string()]);
        let mut missing = diff.missing.clone();
        missing.sort();
        assert_eq!(missing, vec!["h1", "h3"]);
        assert_eq!(diff.wanted, vec!["h4"]);
        assert_eq!(diff.version, 3);
    }

    #[test]
    fn test_chunk_verify() {
        let chunk = Chunk::new("ds", 0, vec![1, 2, 3]);
        assert!(chunk.verify().is_ok());

        let mut bad = chunk.clone();
        bad.data = vec![9, 9, 9];
        assert!(matches!(
            bad.verify().unwrap_err(),
            BibError::HashMismatch { .. }
        ));
    }
}
