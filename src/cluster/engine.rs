// The seam to the external Raft engine.
//
// Log replication, elections and snapshot wire formats are the engine's
// business; the node only needs the operations below. `LocalRaftEngine`
// is the single-node implementation used by tests and standalone
// deployments: always leader once bootstrapped, applying straight into
// the FSM, with file-backed snapshots.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use super::fsm::ClusterFsm;
use crate::error::{BibError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RaftRole {
    Follower,
    Candidate,
    Leader,
}

impl std::fmt::Display for RaftRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RaftRole::Follower => "follower",
            RaftRole::Candidate => "candidate",
            RaftRole::Leader => "leader",
        };
        f.write_str(s)
    }
}

/// Point-in-time engine state, sampled by the monitor loop.
#[derive(Debug, Clone)]
pub struct RaftStatus {
    pub role: RaftRole,
    pub term: u64,
    pub commit_index: u64,
    pub leader: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotInfo {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub size: u64,
}

/// Black-box replicated log.
#[async_trait::async_trait]
pub trait RaftEngine: Send + Sync {
    async fn start(&self) -> Result<()>;

    async fn stop(&self) -> Result<()>;

    fn status(&self) -> RaftStatus;

    async fn add_voter(&self, id: &str, addr: &str) -> Result<()>;

    async fn add_non_voter(&self, id: &str, addr: &str) -> Result<()>;

    async fn remove_server(&self, id: &str) -> Result<()>;

    async fn transfer_leadership(&self, id: &str) -> Result<()>;

    /// Replicate one command and return the FSM response once committed.
    async fn apply(&self, command: Vec<u8>) -> Result<Vec<u8>>;

    async fn snapshot(&self) -> Result<SnapshotInfo>;

    async fn restore(&self, id: &str) -> Result<()>;

    fn list_snapshots(&self) -> Result<Vec<SnapshotInfo>>;
}

/// Single-node engine: leader from bootstrap, no replication.
pub struct LocalRaftEngine {
    node_id: String,
    fsm: Arc<ClusterFsm>,
    snapshot_dir: PathBuf,
    retain_count: usize,
    running: AtomicBool,
    bootstrapped: AtomicBool,
    term: AtomicU64,
    commit_index: AtomicU64,
    snapshot_counter: AtomicU64,
    lock: Mutex<()>,
}

impl LocalRaftEngine {
    pub fn new(
        node_id: impl Into<String>,
        fsm: Arc<ClusterFsm>,
        data_dir: PathBuf,
        retain_count: usize,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            fsm,
            snapshot_dir: data_dir.join("snapshots"),
            retain_count: retain_count.max(1),
            running: AtomicBool::new(false),
            bootstrapped: AtomicBool::new(false),
            term: AtomicU64::new(0),
            commit_index: AtomicU64::new(0),
            snapshot_counter: AtomicU64::new(0),
            lock: Mutex::new(()),
        }
    }

    /// Become the founding (and only) member.
    pub fn bootstrap(&self) {
        self.bootstrapped.store(true, Ordering::SeqCst);
        self.term.store(1, Ordering::SeqCst);
    }

    fn ensure_running(&self) -> Result<()> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(BibError::InvalidInput("raft engine not started".to_string()));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl RaftEngine for LocalRaftEngine {
    async fn start(&self) -> Result<()> {
        std::fs::create_dir_all(&self.snapshot_dir)?;
        self.running.store(true, Ordering::SeqCst);
        tracing::info!(node_id = %self.node_id, "Local raft engine started");
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn status(&self) -> RaftStatus {
        let leader = self.bootstrapped.load(Ordering::SeqCst) && self.running.load(Ordering::SeqCst);
        RaftStatus {
            role: if leader {
                RaftRole::Leader
            } else {
                RaftRole::Follower
            },
            term: self.term.load(Ordering::SeqCst),
            commit_index: self.commit_index.load(Ordering::SeqCst),
            leader: leader.then(|| self.node_id.clone()),
        }
    }

    async fn add_voter(&self, id: &str, _addr: &str) -> Result<()> {
        self.ensure_running()?;
        tracing::info!(member = %id, "Voter registered with local engine");
        Ok(())
    }

    async fn add_non_voter(&self, id: &str, _addr: &str) -> Result<()> {
        self.ensure_running()?;
        tracing::info!(member = %id, "Non-voter registered with local engine");
        Ok(())
    }

    async fn remove_server(&self, id: &str) -> Result<()> {
        self.ensure_running()?;
        tracing::info!(member = %id, "Member removed from local engine");
        Ok(())
    }

    async fn transfer_leadership(&self, id: &str) -> Result<()> {
        self.ensure_running()?;
        if id != self.node_id {
            return Err(BibError::InvalidInput(
                "a single-node engine cannot transfer leadership".to_string(),
            ));
        }
        Ok(())
    }

    async fn apply(&self, command: Vec<u8>) -> Result<Vec<u8>> {
        self.ensure_running()?;
        if !self.bootstrapped.load(Ordering::SeqCst) {
            return Err(BibError::NotLeader { leader: None });
        }
        let response = self.fsm.apply(&command)?;
        self.commit_index.fetch_add(1, Ordering::SeqCst);
        Ok(response)
    }

    async fn snapshot(&self) -> Result<SnapshotInfo> {
        self.ensure_running()?;
        let _guard = self.lock.lock();

        let seq = self.snapshot_counter.fetch_add(1, Ordering::SeqCst);
        let id = format!(
            "snapshot-{}-{}",
            self.commit_index.load(Ordering::SeqCst),
            seq
        );
        let bytes = self.fsm.snapshot()?;
        let path = self.snapshot_dir.join(format!("{id}.bin"));
        std::fs::write(&path, &bytes)?;

        // Retain only the newest snapshots.
        let mut snapshots = self.list_snapshots()?;
        if snapshots.len() > self.retain_count {
            snapshots.sort_by(|a, b| a.created_at.cmp(&b.created_at));
            let excess = snapshots.len() - self.retain_count;
            for stale in snapshots.into_iter().take(excess) {
                let _ = std::fs::remove_file(self.snapshot_dir.join(format!("{}.bin", stale.id)));
            }
        }

        Ok(SnapshotInfo {
            id,
            created_at: Utc::now(),
            size: bytes.len() as u64,
        })
    }

    async fn restore(&self, id: &str) -> Result<()> {
        self.ensure_running()?;
        let path = self.snapshot_dir.join(format!("{id}.bin"));
        let bytes = std::fs::read(&path)
            .map_err(|_| BibError::not_found(format!("snapshot {id}")))?;
        self.fsm.restore(&bytes)
    }

    fn list_snapshots(&self) -> Result<Vec<SnapshotInfo>> {
        let mut snapshots = Vec::new();
        let entries = match std::fs::read_dir(&self.snapshot_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(snapshots),
            Err(e) => return Err(e.into()),
        };
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            let Some(id) = name.strip_suffix(".bin") else {
                continue;
            };
            let metadata = entry.metadata()?;
            snapshots.push(SnapshotInfo {
                id: id.to_string(),
                created_at: metadata.modified().map(DateTime::from).unwrap_or_else(|_| Utc::now()),
                size: metadata.len(),
            });
        }
        Ok(snapshots)
    }
}
