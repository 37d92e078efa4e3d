// Typed request/response unions for the discovery, data, sync and jobs
// streams, plus the shared error carrier.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::catalog::{CatalogEntry, CatalogQuery, CatalogSnapshot, Chunk, Dataset, DatasetContent};

/// A framed request. The id is echoed in the response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub request_id: String,
    pub body: RequestBody,
}

impl Request {
    pub fn new(body: RequestBody) -> Self {
        Self {
            request_id: uuid::Uuid::new_v4().to_string(),
            body,
        }
    }
}

/// A framed response carrying the originating request id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub request_id: String,
    pub body: ResponseBody,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RequestBody {
    // Discovery stream.
    GetCatalog {
        /// When set and the remote catalog is not newer, the reply is a
        /// version-only stub.
        since_version: Option<u64>,
    },
    QueryCatalog(CatalogQuery),
    GetPeerInfo,
    Announce(Announcement),

    // Data stream.
    GetDatasetInfo {
        dataset_id: String,
    },
    GetChunk {
        dataset_id: String,
        index: u32,
    },
    GetChunks {
        dataset_id: String,
        indices: Vec<u32>,
    },

    // Sync stream.
    GetSyncStatus,
    SyncState {
        catalog_version: u64,
        hashes: Vec<String>,
    },

    // Jobs stream (reserved).
    SubmitJob {
        payload: Vec<u8>,
    },
    GetJobStatus {
        job_id: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ResponseBody {
    Catalog(CatalogSnapshot),
    /// `GetCatalog` short-circuit when the caller is already current.
    CatalogStub {
        version: u64,
    },
    QueryResult(QueryResult),
    PeerInfo(PeerInfoPayload),
    AnnounceAck {
        accepted: bool,
    },
    DatasetInfo {
        dataset: Dataset,
        content: DatasetContent,
    },
    Chunk(Chunk),
    Chunks(Vec<Chunk>),
    SyncStatus(SyncStatusPayload),
    SyncState(SyncStateResponse),
    JobStatus {
        job_id: String,
        state: String,
    },
    Error(ErrorBody),
}

/// Shared error carrier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: i32,
    pub message: String,
    #[serde(default)]
    pub details: BTreeMap<String, String>,
}

impl ErrorBody {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: BTreeMap::new(),
        }
    }
}

/// Catalog announcement gossiped and pushed to peers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Announcement {
    pub owner: String,
    pub catalog_version: u64,
    pub entry: CatalogEntry,
    /// True when the entry was deleted rather than published.
    #[serde(default)]
    pub removed: bool,
}

/// Query result page plus the total match count before pagination.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    pub entries: Vec<CatalogEntry>,
    pub total: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerInfoPayload {
    pub peer_id: String,
    pub mode: String,
    pub catalog_version: u64,
    pub entry_count: usize,
    pub listen_addrs: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncStatusPayload {
    pub catalog_version: u64,
    pub entry_count: usize,
    pub last_sync: Option<DateTime<Utc>>,
}

/// Reply to `SyncState`: the delta between the caller's hash list and ours.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStateResponse {
    /// Entries we have that the caller did not list.
    pub missing_hashes: Vec<String>,
    /// Entries the caller listed that we do not have.
    pub wanted_hashes: Vec<String>,
    pub catalog_version: u64,
}

/// Periodic node status published on the nodes topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeStatus {
    pub peer_id: String,
    pub mode: String,
    pub catalog_version: u64,
    pub entry_count: usize,
    pub uptime_secs: u64,
}
