// Durable peer records with a score function used for best-peer selection
// and connection pruning.
//
// Backed by an embedded SQLite database in WAL mode. The connection is
// guarded by a single mutex; the latency EWMA update is a read-modify-write
// and must not interleave, so it runs entirely inside that critical section.

use crate::error::{BibError, Result};
use libp2p::{Multiaddr, PeerId};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::str::FromStr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Score assigned to bootstrap peers, above anything reachable by the
/// regular formula.
pub const BOOTSTRAP_SCORE: f64 = 1_000_000.0;

/// Address book entry handed to `add_peer` and returned from lookups.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    pub peer_id: PeerId,
    pub addrs: Vec<Multiaddr>,
}

/// A stored peer record.
#[derive(Debug, Clone)]
pub struct PeerRecord {
    pub peer_id: PeerId,
    pub addrs: Vec<Multiaddr>,
    pub successes: u64,
    pub failures: u64,
    pub avg_latency_ms: f64,
    /// Unix seconds of the last successful contact.
    pub last_seen: i64,
    pub is_bootstrap: bool,
}

impl PeerRecord {
    /// Ranking used for best-peer selection and pruning. Bootstrap peers
    /// rank above everything; otherwise success rate, latency and recency
    /// contribute.
    pub fn score(&self, now: i64) -> f64 {
        if self.is_bootstrap {
            return BOOTSTRAP_SCORE;
        }

        let attempts = self.successes + self.failures;
        let success_rate = if attempts > 0 {
            self.successes as f64 / attempts as f64
        } else {
            0.0
        };

        let latency_bonus = if self.avg_latency_ms > 0.0 {
            100.0 / self.avg_latency_ms
        } else {
            0.0
        };

        let age = now.saturating_sub(self.last_seen);
        let recency_bonus = if age < 3600 {
            100.0
        } else if age < 24 * 3600 {
            50.0
        } else if age < 168 * 3600 {
            10.0
        } else {
            0.0
        };

        success_rate * 100.0 + latency_bonus + recency_bonus
    }
}

/// Durable peer store over SQLite.
pub struct PeerStore {
    conn: Mutex<Connection>,
}

impl PeerStore {
    /// Open (or create) the store at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    /// In-memory store for tests and ephemeral nodes.
    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS peers (
                id             TEXT PRIMARY KEY,
                addrs          TEXT NOT NULL,
                successes      INTEGER NOT NULL DEFAULT 0,
                failures       INTEGER NOT NULL DEFAULT 0,
                avg_latency_ms REAL NOT NULL DEFAULT 0,
                last_seen      INTEGER NOT NULL,
                is_bootstrap   INTEGER NOT NULL DEFAULT 0,
                created_at     INTEGER NOT NULL,
                updated_at     INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_peers_last_seen ON peers(last_seen);
            CREATE INDEX IF NOT EXISTS idx_peers_is_bootstrap ON peers(is_bootstrap);",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Upsert a peer. Addresses are merged with any already stored; the
    /// bootstrap flag is sticky once set.
    pub fn add_peer(&self, info: &PeerInfo, is_bootstrap: bool) -> Result<()> {
        let conn = self.conn.lock();
        let now = now_secs();
        let id = info.peer_id.to_string();

        let existing: Option<(String, bool)> = conn
            .query_row(
                "SELECT addrs, is_bootstrap FROM peers WHERE id = ?1",
                params![id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        match existing {
            Some((stored_addrs, stored_bootstrap)) => {
                let mut addrs = parse_addrs(&stored_addrs);
                for addr in &info.addrs {
                    if !addrs.contains(addr) {
                        addrs.push(addr.clone());
                    }
                }
                // Re-discovery counts as contact.
                conn.execute(
                    "UPDATE peers SET addrs = ?2, is_bootstrap = ?3, last_seen = ?4, updated_at = ?4
                     WHERE id = ?1",
                    params![id, join_addrs(&addrs), stored_bootstrap || is_bootstrap, now],
                )?;
            }
            None => {
                conn.execute(
                    "INSERT INTO peers (id, addrs, last_seen, is_bootstrap, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
                    params![id, join_addrs(&info.addrs), now, is_bootstrap, now],
                )?;
            }
        }
        Ok(())
    }

    /// Record a connection attempt. Successful attempts fold `latency_ms`
    /// into the running average and refresh `last_seen`; failures only bump
    /// the failure counter.
    pub fn record_connection(&self, peer_id: &PeerId, success: bool, latency_ms: f64) -> Result<()> {
        let conn = self.conn.lock();
        let now = now_secs();
        let id = peer_id.to_string();

        if success {
            let row: Option<(u64, f64)> = conn
                .query_row(
                    "SELECT successes, avg_latency_ms FROM peers WHERE id = ?1",
                    params![id],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;
            let (successes, avg) = match row {
                Some(r) => r,
                None => return Err(BibError::not_found(format!("peer {id}"))),
            };
            let new_avg = (avg * successes as f64 + latency_ms) / (successes as f64 + 1.0);
            conn.execute(
                "UPDATE peers
                 SET successes = successes + 1, avg_latency_ms = ?2, last_seen = ?3, updated_at = ?3
                 WHERE id = ?1",
                params![id, new_avg, now],
            )?;
        } else {
            let changed = conn.execute(
                "UPDATE peers SET failures = failures + 1, updated_at = ?2 WHERE id = ?1",
                params![id, now],
            )?;
            if changed == 0 {
                return Err(BibError::not_found(format!("peer {id}")));
            }
        }
        Ok(())
    }

    pub fn get_peer(&self, peer_id: &PeerId) -> Result<Option<PeerRecord>> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT id, addrs, successes, failures, avg_latency_ms, last_seen, is_bootstrap
                 FROM peers WHERE id = ?1",
                params![peer_id.to_string()],
                row_to_record,
            )
            .optional()?;
        match row {
            Some(raw) => Ok(collect_records(std::iter::once(Ok(raw)))?.into_iter().next()),
            None => Ok(None),
        }
    }

    /// The `limit` highest-scored peers, ties broken by most recent contact.
    pub fn get_best_peers(&self, limit: usize) -> Result<Vec<PeerRecord>> {
        let mut peers = self.all_peers()?;
        let now = now_secs();
        peers.sort_by(|a, b| {
            b.score(now)
                .partial_cmp(&a.score(now))
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(b.last_seen.cmp(&a.last_seen))
        });
        peers.truncate(limit);
        Ok(peers)
    }

    pub fn get_bootstrap_peers(&self) -> Result<Vec<PeerRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, addrs, successes, failures, avg_latency_ms, last_seen, is_bootstrap
             FROM peers WHERE is_bootstrap = 1",
        )?;
        let rows = stmt.query_map([], row_to_record)?;
        collect_records(rows)
    }

    /// Delete non-bootstrap peers unseen for longer than `max_age`.
    /// Returns the number of records removed.
    pub fn prune_old_peers(&self, max_age: Duration) -> Result<usize> {
        let conn = self.conn.lock();
        let cutoff = now_secs() - max_age.as_secs() as i64;
        let removed = conn.execute(
            "DELETE FROM peers WHERE is_bootstrap = 0 AND last_seen < ?1",
            params![cutoff],
        )?;
        Ok(removed)
    }

    pub fn count(&self) -> Result<usize> {
        let conn = self.conn.lock();
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM peers", [], |row| row.get(0))?;
        Ok(n as usize)
    }

    /// Flush the WAL. The connection itself closes on drop.
    pub fn close(&self) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);")?;
        Ok(())
    }

    fn all_peers(&self) -> Result<Vec<PeerRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, addrs, successes, failures, avg_latency_ms, last_seen, is_bootstrap
             FROM peers",
        )?;
        let rows = stmt.query_map([], row_to_record)?;
        collect_records(rows)
    }
}

type RawRow = (String, String, u64, u64, f64, i64, bool);

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
    ))
}

fn collect_records<I>(rows: I) -> Result<Vec<PeerRecord>>
where
    I: Iterator<Item = rusqlite::Result<RawRow>>,
{
    let mut out = Vec::new();
    for row in rows {
        let (id, addrs, successes, failures, avg_latency_ms, last_seen, is_bootstrap) = row?;
        match PeerId::from_str(&id) {
            Ok(peer_id) => out.push(PeerRecord {
                peer_id,
                addrs: parse_addrs(&addrs),
                successes,
                failures,
                avg_latency_ms,
                last_seen,
                is_bootstrap,
            }),
            Err(_) => {
                tracing::warn!(id = %id, "Dropping peer record with unparseable id");
            }
        }
    }
    Ok(out)
}

fn parse_addrs(stored: &str) -> Vec<Multiaddr> {
    stored
        .split(',')
        .filter(|s| !s.is_empty())
        .filter_map(|s| Multiaddr::from_str(s).ok())
        .collect()
}

fn join_addrs(addrs: &[Multiaddr]) -> String {
    addrs
        .iter()
        .map(|a| a.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

pub(crate) fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(peer_id: PeerId) -> PeerInfo {
        PeerInfo {
            peer_id,
            addrs: vec!["/ip4/127.0.0.1/tcp/4001".parse().unwrap()],
        }
    }

    #[test]
    fn test_latency_ewma_is_arithmetic_mean() {
        let store = PeerStore::open_in_memory().unwrap();
        let peer = PeerId::random();
        store.add_peer(&info(peer), false).unwrap();

        let samples = [10.0, 20.0, 60.0, 30.0, 5.0];
        for s in samples {
            store.record_connection(&peer, true, s).unwrap();
        }
        // A failure in between must not disturb the average.
        store.record_connection(&peer, false, 999.0).unwrap();

        let record = store.get_peer(&peer).unwrap().unwrap();
        let mean: f64 = samples.iter().sum::<f64>() / samples.len() as f64;
        assert!((record.avg_latency_ms - mean).abs() < 1e-9);
        assert_eq!(record.successes, samples.len() as u64);
        assert_eq!(record.failures, 1);
    }

    #[test]
    fn test_score_monotone_in_successes() {
        let now = now_secs();
        let mut record = PeerRecord {
            peer_id: PeerId::random(),
            addrs: Vec::new(),
            successes: 0,
            failures: 5,
            avg_latency_ms: 50.0,
            last_seen: now,
            is_bootstrap: false,
        };
        let mut prev = record.score(now);
        for successes in 1..50 {
            record.successes = successes;
            let score = record.score(now);
            assert!(score >= prev);
            prev = score;
        }
    }

    #[test]
    fn test_bootstrap_flag_is_sticky_and_outranks() {
        let store = PeerStore::open_in_memory().unwrap();
        let boot = PeerId::random();
        let other = PeerId::random();

        store.add_peer(&info(boot), true).unwrap();
        // Re-adding without the flag must not clear it.
        store.add_peer(&info(boot), false).unwrap();
        store.add_peer(&info(other), false).unwrap();
        store.record_connection(&other, true, 1.0).unwrap();

        let best = store.get_best_peers(2).unwrap();
        assert_eq!(best[0].peer_id, boot);
        assert!(best[0].is_bootstrap);
    }

    #[test]
    fn test_prune_spares_bootstrap() {
        let store = PeerStore::open_in_memory().unwrap();
        let boot = PeerId::random();
        let stale = PeerId::random();
        store.add_peer(&info(boot), true).unwrap();
        store.add_peer(&info(stale), false).unwrap();

        // Backdate both.
        {
            let conn = store.conn.lock();
            conn.execute("UPDATE peers SET last_seen = 0", []).unwrap();
        }

        let removed = store.prune_old_peers(Duration::from_secs(60)).unwrap();
        assert_eq!(removed, 1);
        assert!(store.get_peer(&boot).unwrap().is_some());
        assert!(store.get_peer(&stale).unwrap().is_none());
    }

    #[test]
    fn test_addresses_merge_on_upsert() {
        let store = PeerStore::open_in_memory().unwrap();
        let peer = PeerId::random();
        let a: Multiaddr = "/ip4/127.0.0.1/tcp/4001".parse().unwrap();
        let b: Multiaddr = "/ip4/10.0.0.2/udp/4001/quic-v1".parse().unwrap();

        store.add_peer(
            &PeerInfo {
                peer_id: peer,
                addrs: vec![a.clone()],
            },
            false,
        )
        .unwrap();
        store.add_peer(
            &PeerInfo {
                peer_id: peer,
                addrs: vec![a.clone(), b.clone()],
            },
            false,
        )
        .unwrap();

        let record = store.get_peer(&peer).unwrap().unwrap();
        assert_eq!(record.addrs, vec![a, b]);
    }

    #[test]
    fn test_record_connection_unknown_peer() {
        let store = PeerStore::open_in_memory().unwrap();
        let err = store
            .record_connection(&PeerId::random(), true, 1.0)
            .unwrap_err();
        assert!(matches!(err, BibError::NotFound(_)));
    }
}
