// Replicated state machine commands for cluster metadata.
//
// Join tokens live here so their validity survives leadership changes:
// a token is written by the leader via `Apply` and consumed exactly once
// by the node that redeems it.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::Result;
use crate::peer_store::now_secs;

/// Commands applied through the replicated log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ClusterCommand {
    PutJoinToken { token: String, expires_at: i64 },
    ConsumeJoinToken { token: String },
}

/// Outcome of applying a command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FsmResponse {
    Applied,
    Rejected(String),
}

pub fn encode_command(command: &ClusterCommand) -> Result<Vec<u8>> {
    Ok(bincode::serde::encode_to_vec(
        command,
        bincode::config::standard(),
    )?)
}

pub fn decode_response(bytes: &[u8]) -> Result<FsmResponse> {
    let (response, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())?;
    Ok(response)
}

#[derive(Default, Serialize, Deserialize)]
struct FsmState {
    /// token -> expiry (unix seconds).
    tokens: HashMap<String, i64>,
}

/// The cluster metadata FSM. Deterministic: the same command sequence
/// yields the same state on every member.
#[derive(Default)]
pub struct ClusterFsm {
    state: Mutex<FsmState>,
}

impl ClusterFsm {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one encoded command, returning the encoded response.
    pub fn apply(&self, command: &[u8]) -> Result<Vec<u8>> {
        let (command, _): (ClusterCommand, _) =
            bincode::serde::decode_from_slice(command, bincode::config::standard())?;
        let response = self.apply_command(command);
        Ok(bincode::serde::encode_to_vec(
            &response,
            bincode::config::standard(),
        )?)
    }

    fn apply_command(&self, command: ClusterCommand) -> FsmResponse {
        let mut state = self.state.lock();
        let now = now_secs();
        state.tokens.retain(|_, expires_at| *expires_at > now);

        match command {
            ClusterCommand::PutJoinToken { token, expires_at } => {
                state.tokens.insert(token, expires_at);
                FsmResponse::Applied
            }
            ClusterCommand::ConsumeJoinToken { token } => match state.tokens.remove(&token) {
                Some(expires_at) if expires_at > now => FsmResponse::Applied,
                _ => FsmResponse::Rejected("unknown or expired join token".to_string()),
            },
        }
    }

    pub fn token_count(&self) -> usize {
        self.state.lock().tokens.len()
    }

    /// Serialize the full state for a snapshot.
    pub fn snapshot(&self) -> Result<Vec<u8>> {
        let state = self.state.lock();
        Ok(bincode::serde::encode_to_vec(
            &*state,
            bincode::config::standard(),
        )?)
    }

    pub fn restore(&self, snapshot: &[u8]) -> Result<()> {
        let (restored, _): (FsmState, _) =
            bincode::serde::decode_from_slice(snapshot, bincode::config::standard())?;
        *self.state.lock() = restored;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_is_single_use() {
        let fsm = ClusterFsm::new();
        let put = encode_command(&ClusterCommand::PutJoinToken {
            token: "tok".to_string(),
            expires_at: now_secs() + 60,
        })
        .unwrap();
        assert_eq!(
            decode_response(&fsm.apply(&put).unwrap()).unwrap(),
            FsmResponse::Applied
        );

        let consume = encode_command(&ClusterCommand::ConsumeJoinToken {
            token: "tok".to_string(),
        })
        .unwrap();
        assert_eq!(
            decode_response(&fsm.apply(&consume).unwrap()).unwrap(),
            FsmResponse::Applied
        );
        // Second redemption fails.
        assert!(matches!(
            decode_response(&fsm.apply(&consume).unwrap()).unwrap(),
            FsmResponse::Rejected(_)
        ));
    }

    #[test]
    fn test_expired_token_rejected() {
        let fsm = ClusterFsm::new();
        let put = encode_command(&ClusterCommand::PutJoinToken {
            token: "stale".to_string(),
            expires_at: now_secs() - 1,
        })
        .unwrap();
        fsm.apply(&put).unwrap();

        let consume = encode_command(&ClusterCommand::ConsumeJoinToken {
            token: "stale".to_string(),
        })
        .unwrap();
        assert!(matches!(
            decode_response(&fsm.apply(&consume).unwrap()).unwrap(),
            FsmResponse::Rejected(_)
        ));
    }

    #[test]
    fn test_snapshot_restore_round_trip() {
        let fsm = ClusterFsm::new();
        let put = encode_command(&ClusterCommand::PutJoinToken {
            token: "tok".to_string(),
            expires_at: now_secs() + 60,
        })
        .unwrap();
        fsm.apply(&put).unwrap();

        let snapshot = fsm.snapshot().unwrap();
        let restored = ClusterFsm::new();
        restored.restore(&snapshot).unwrap();
        assert_eq!(restored.token_count(), 1);
    }
}
