// Raft-fronted cluster management.
//
// `ClusterManager` is a thin façade over the replicated log: it gates
// membership changes on leadership, keeps the members map reconciled
// against the engine's view, and hands out single-use join tokens stored
// in the FSM. A monitor loop samples engine state every second and fires
// the registered callbacks on leader or membership change.

mod engine;
mod fsm;

pub use engine::{LocalRaftEngine, RaftEngine, RaftRole, RaftStatus, SnapshotInfo};
pub use fsm::{ClusterCommand, ClusterFsm, FsmResponse};

use fsm::{decode_response, encode_command};
use parking_lot::{Mutex, RwLock};
use rand::RngCore;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::ClusterConfig;
use crate::error::{BibError, Result};
use crate::peer_store::now_secs;

const MONITOR_INTERVAL: Duration = Duration::from_secs(1);

/// Minimum voter count that must remain after removing a voter.
const MIN_VOTERS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberRole {
    Voter,
    NonVoter,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Member {
    pub id: String,
    pub addr: String,
    pub role: MemberRole,
    pub healthy: bool,
}

/// Operator-facing cluster state.
#[derive(Debug, Clone)]
pub struct ClusterStatus {
    pub node_id: String,
    pub cluster_name: String,
    pub role: RaftRole,
    pub term: u64,
    pub commit_index: u64,
    pub leader: Option<String>,
    pub members: Vec<Member>,
}

type LeaderChangeCallback = Arc<dyn Fn(Option<String>) + Send + Sync>;
type MemberChangeCallback = Arc<dyn Fn(&[Member]) + Send + Sync>;

pub struct ClusterManager {
    config: ClusterConfig,
    engine: Arc<dyn RaftEngine>,
    members: Arc<RwLock<HashMap<String, Member>>>,
    on_leader_change: Arc<Mutex<Vec<LeaderChangeCallback>>>,
    on_member_change: Arc<Mutex<Vec<MemberChangeCallback>>>,
    shutdown: CancellationToken,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

impl ClusterManager {
    pub fn new(config: ClusterConfig, engine: Arc<dyn RaftEngine>) -> Self {
        Self {
            config,
            engine,
            members: Arc::new(RwLock::new(HashMap::new())),
            on_leader_change: Arc::new(Mutex::new(Vec::new())),
            on_member_change: Arc::new(Mutex::new(Vec::new())),
            shutdown: CancellationToken::new(),
            monitor: Mutex::new(None),
        }
    }

    pub async fn start(&self) -> Result<()> {
        self.engine.start().await?;

        // The local node is always in the members map.
        let addr = self
            .config
            .advertise_addr
            .clone()
            .unwrap_or_else(|| self.config.listen_addr.clone());
        self.members.write().insert(
            self.config.node_id.clone(),
            Member {
                id: self.config.node_id.clone(),
                addr,
                role: if self.config.is_voter {
                    MemberRole::Voter
                } else {
                    MemberRole::NonVoter
                },
                healthy: true,
            },
        );

        self.spawn_monitor();
        tracing::info!(
            node_id = %self.config.node_id,
            cluster = %self.config.cluster_name,
            "Cluster manager started"
        );
        Ok(())
    }

    pub async fn stop(&self) -> Result<()> {
        self.shutdown.cancel();
        if let Some(monitor) = self.monitor.lock().take() {
            monitor.abort();
        }
        self.engine.stop().await
    }

    pub fn is_leader(&self) -> bool {
        self.engine.status().role == RaftRole::Leader
    }

    pub fn leader(&self) -> Option<String> {
        self.engine.status().leader
    }

    pub fn status(&self) -> ClusterStatus {
        let raft = self.engine.status();
        let mut members: Vec<Member> = self.members.read().values().cloned().collect();
        members.sort_by(|a, b| a.id.cmp(&b.id));
        ClusterStatus {
            node_id: self.config.node_id.clone(),
            cluster_name: self.config.cluster_name.clone(),
            role: raft.role,
            term: raft.term,
            commit_index: raft.commit_index,
            leader: raft.leader,
            members,
        }
    }

    /// Add a voting member. Idempotent against the members map.
    pub async fn add_voter(&self, id: &str, addr: &str) -> Result<()> {
        self.require_leader()?;
        if let Some(existing) = self.members.read().get(id) {
            if existing.role == MemberRole::Voter {
                return Ok(());
            }
        }
        self.engine.add_voter(id, addr).await?;
        self.insert_member(id, addr, MemberRole::Voter);
        Ok(())
    }

    /// Add a non-voting member. Idempotent against the members map.
    pub async fn add_non_voter(&self, id: &str, addr: &str) -> Result<()> {
        self.require_leader()?;
        if let Some(existing) = self.members.read().get(id) {
            if existing.role == MemberRole::NonVoter {
                return Ok(());
            }
        }
        self.engine.add_non_voter(id, addr).await?;
        self.insert_member(id, addr, MemberRole::NonVoter);
        Ok(())
    }

    /// Remove a member. Refuses to shrink the voter set below the minimum.
    pub async fn remove_node(&self, id: &str) -> Result<()> {
        self.require_leader()?;

        let (is_member, is_voter, voters) = {
            let members = self.members.read();
            let target = members.get(id);
            (
                target.is_some(),
                target.map(|m| m.role == MemberRole::Voter).unwrap_or(false),
                members
                    .values()
                    .filter(|m| m.role == MemberRole::Voter)
                    .count(),
            )
        };
        if !is_member {
            return Ok(());
        }
        if is_voter && voters <= MIN_VOTERS {
            return Err(BibError::MinimumNodes(format!(
                "removing voter {id} would leave fewer than {MIN_VOTERS} voters"
            )));
        }

        self.engine.remove_server(id).await?;
        self.members.write().remove(id);
        self.fire_member_change();
        Ok(())
    }

    pub async fn transfer_leadership(&self, id: &str) -> Result<()> {
        self.require_leader()?;
        self.engine.transfer_leadership(id).await
    }

    /// Mint a single-use join token: 32 random bytes, hex-encoded, stored
    /// in the FSM with a TTL.
    pub async fn generate_join_token(&self, ttl: Duration) -> Result<String> {
        self.require_leader()?;

        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        let token = hex::encode(bytes);

        let command = encode_command(&ClusterCommand::PutJoinToken {
            token: token.clone(),
            expires_at: now_secs() + ttl.as_secs() as i64,
        })?;
        match decode_response(&self.engine.apply(command).await?)? {
            FsmResponse::Applied => Ok(token),
            FsmResponse::Rejected(reason) => Err(BibError::InvalidInput(reason)),
        }
    }

    /// Redeem a join token. Succeeds at most once per token.
    pub async fn validate_join_token(&self, token: &str) -> Result<()> {
        let command = encode_command(&ClusterCommand::ConsumeJoinToken {
            token: token.to_string(),
        })?;
        match decode_response(&self.engine.apply(command).await?)? {
            FsmResponse::Applied => Ok(()),
            FsmResponse::Rejected(_) => Err(BibError::Unauthorized),
        }
    }

    /// Admit a joining node: consume its token, register it, and return
    /// the cluster status so the joiner learns the current voter set
    /// before its first Raft RPC.
    pub async fn handle_join(
        &self,
        token: &str,
        node_id: &str,
        addr: &str,
        as_voter: bool,
    ) -> Result<ClusterStatus> {
        self.require_leader()?;
        self.validate_join_token(token).await?;
        if as_voter {
            self.add_voter(node_id, addr).await?;
        } else {
            self.add_non_voter(node_id, addr).await?;
        }
        Ok(self.status())
    }

    /// Replicate an opaque command through the log. Leader only.
    pub async fn apply(&self, command: Vec<u8>) -> Result<Vec<u8>> {
        self.require_leader()?;
        self.engine.apply(command).await
    }

    pub async fn snapshot(&self) -> Result<SnapshotInfo> {
        self.engine.snapshot().await
    }

    pub async fn restore(&self, id: &str) -> Result<()> {
        self.engine.restore(id).await
    }

    pub fn list_snapshots(&self) -> Result<Vec<SnapshotInfo>> {
        self.engine.list_snapshots()
    }

    pub fn on_leader_change(&self, callback: LeaderChangeCallback) {
        self.on_leader_change.lock().push(callback);
    }

    pub fn on_member_change(&self, callback: MemberChangeCallback) {
        self.on_member_change.lock().push(callback);
    }

    fn require_leader(&self) -> Result<()> {
        let status = self.engine.status();
        if status.role != RaftRole::Leader {
            return Err(BibError::NotLeader {
                leader: status.leader,
            });
        }
        Ok(())
    }

    fn insert_member(&self, id: &str, addr: &str, role: MemberRole) {
        self.members.write().insert(
            id.to_string(),
            Member {
                id: id.to_string(),
                addr: addr.to_string(),
                role,
                healthy: true,
            },
        );
        self.fire_member_change();
    }

    fn fire_member_change(&self) {
        let mut members: Vec<Member> = self.members.read().values().cloned().collect();
        members.sort_by(|a, b| a.id.cmp(&b.id));
        for callback in self.on_member_change.lock().iter() {
            callback(&members);
        }
    }

    fn spawn_monitor(&self) {
        let engine = Arc::clone(&self.engine);
        let on_leader_change = Arc::clone(&self.on_leader_change);
        let shutdown = self.shutdown.clone();

        let monitor = tokio::spawn(async move {
            let mut tick = tokio::time::interval(MONITOR_INTERVAL);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            let mut last_leader: Option<String> = None;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tick.tick() => {
                        let status = engine.status();
                        if status.leader != last_leader {
                            tracing::info!(
                                leader = status.leader.as_deref().unwrap_or("none"),
                                term = status.term,
                                "Cluster leader changed"
                            );
                            last_leader = status.leader.clone();
                            for callback in on_leader_change.lock().iter() {
                                callback(status.leader.clone());
                            }
                        }
                    }
                }
            }
        });
        *self.monitor.lock() = Some(monitor);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(bootstrap: bool) -> (ClusterManager, Arc<ClusterFsm>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let fsm = Arc::new(ClusterFsm::new());
        let engine = Arc::new(LocalRaftEngine::new(
            "node-1",
            Arc::clone(&fsm),
            dir.path().to_path_buf(),
            3,
        ));
        if bootstrap {
            engine.bootstrap();
        }
        let config = ClusterConfig {
            enabled: true,
            node_id: "node-1".to_string(),
            bootstrap,
            ..Default::default()
        };
        (ClusterManager::new(config, engine), fsm, dir)
    }

    #[tokio::test]
    async fn test_membership_requires_leadership() {
        let (manager, _fsm, _dir) = manager(false);
        manager.start().await.unwrap();

        let err = manager.add_voter("node-2", "10.0.0.2:4101").await.unwrap_err();
        assert!(matches!(err, BibError::NotLeader { .. }));
        manager.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_add_voter_is_idempotent() {
        let (manager, _fsm, _dir) = manager(true);
        manager.start().await.unwrap();

        manager.add_voter("node-2", "10.0.0.2:4101").await.unwrap();
        manager.add_voter("node-2", "10.0.0.2:4101").await.unwrap();
        assert_eq!(manager.status().members.len(), 2);
        manager.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_minimum_voters_enforced() {
        let (manager, _fsm, _dir) = manager(true);
        manager.start().await.unwrap();

        manager.add_voter("node-2", "10.0.0.2:4101").await.unwrap();
        manager.add_voter("node-3", "10.0.0.3:4101").await.unwrap();
        // Three voters: removing any of them must fail.
        let err = manager.remove_node("node-3").await.unwrap_err();
        assert!(matches!(err, BibError::MinimumNodes(_)));

        // A fourth voter makes removal legal again.
        manager.add_voter("node-4", "10.0.0.4:4101").await.unwrap();
        manager.remove_node("node-3").await.unwrap();
        // Removing an unknown member is a no-op.
        manager.remove_node("node-9").await.unwrap();
        manager.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_join_token_single_use() {
        let (manager, _fsm, _dir) = manager(true);
        manager.start().await.unwrap();

        let token = manager
            .generate_join_token(Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(token.len(), 64);

        manager.validate_join_token(&token).await.unwrap();
        let err = manager.validate_join_token(&token).await.unwrap_err();
        assert!(matches!(err, BibError::Unauthorized));
        manager.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_join_handshake_returns_voter_set() {
        let (manager, _fsm, _dir) = manager(true);
        manager.start().await.unwrap();

        let token = manager
            .generate_join_token(Duration::from_secs(60))
            .await
            .unwrap();
        let status = manager
            .handle_join(&token, "node-2", "10.0.0.2:4101", true)
            .await
            .unwrap();
        assert!(status.members.iter().any(|m| m.id == "node-2"));
        manager.stop().await.unwrap();
    }
}
