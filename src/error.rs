use thiserror::Error;

#[derive(Error, Debug)]
pub enum BibError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("not the cluster leader (current leader: {})", .leader.as_deref().unwrap_or("unknown"))]
    NotLeader { leader: Option<String> },

    #[error("already a cluster member: {0}")]
    AlreadyMember(String),

    #[error("membership change refused: {0}")]
    MinimumNodes(String),

    #[error("unauthorized")]
    Unauthorized,

    #[error("rate limited")]
    RateLimited,

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("cancelled")]
    Cancelled,

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("hash mismatch: expected {expected}, got {actual}")]
    HashMismatch { expected: String, actual: String },

    #[error("challenge expired")]
    ChallengeExpired,

    #[error("a session is already active")]
    SessionActive,

    #[error("no active session")]
    SessionNotActive,

    #[error("storage error: {0}")]
    Storage(String),

    #[error("transport error: {0}")]
    Transport(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl BibError {
    /// Wrap any network or encoding failure, preserving the cause.
    pub fn transport(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        BibError::Transport(Box::new(err))
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        BibError::NotFound(what.into())
    }

    pub fn timeout(what: impl Into<String>) -> Self {
        BibError::Timeout(what.into())
    }
}

impl From<rusqlite::Error> for BibError {
    fn from(e: rusqlite::Error) -> Self {
        BibError::Storage(e.to_string())
    }
}

impl From<serde_json::Error> for BibError {
    fn from(e: serde_json::Error) -> Self {
        BibError::transport(e)
    }
}

impl From<bincode::error::EncodeError> for BibError {
    fn from(e: bincode::error::EncodeError) -> Self {
        BibError::transport(e)
    }
}

impl From<bincode::error::DecodeError> for BibError {
    fn from(e: bincode::error::DecodeError) -> Self {
        BibError::transport(e)
    }
}

impl From<tokio::time::error::Elapsed> for BibError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        BibError::Timeout("deadline elapsed".to_string())
    }
}

pub type Result<T> = std::result::Result<T, BibError>;
