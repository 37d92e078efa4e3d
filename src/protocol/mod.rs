// Versioned wire protocol spoken over named overlay streams.
//
// Two generations coexist, selected by protocol id: the 1.0.0 ids carry
// JSON bodies, the 2.0.0 ids carry binary bodies. Framing is identical in
// both: a 4-byte big-endian length prefix, then the body, capped at 10 MiB.
// A stream carries exactly one request and one response.

mod client;
mod codec;
mod messages;
mod server;

pub use client::{CatalogReply, ProtocolClient};
pub use codec::{
    decode_request, decode_response, encode_request, encode_response, read_frame, write_frame,
    MAX_FRAME_SIZE,
};
pub use messages::{
    Announcement, ErrorBody, NodeStatus, PeerInfoPayload, QueryResult, Request, RequestBody,
    Response, ResponseBody, SyncStateResponse, SyncStatusPayload,
};
pub use server::{ProtocolServer, RequestHandler};

use libp2p::StreamProtocol;

/// Protocol id for the stream-RPC transport (not a request/response stream).
pub const PROTOCOL_GRPC: StreamProtocol = StreamProtocol::new("/bib/grpc/1.0.0");

/// Per-request server-side deadline.
pub const REQUEST_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

/// Wire encoding generation, selected by protocol id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WireVersion {
    /// JSON bodies.
    V1,
    /// Binary bodies.
    V2,
}

/// The four request/response stream classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamClass {
    Discovery,
    Data,
    Sync,
    Jobs,
}

impl StreamClass {
    pub const ALL: [StreamClass; 4] = [
        StreamClass::Discovery,
        StreamClass::Data,
        StreamClass::Sync,
        StreamClass::Jobs,
    ];

    pub fn protocol(self, version: WireVersion) -> StreamProtocol {
        match (self, version) {
            (StreamClass::Discovery, WireVersion::V1) => {
                StreamProtocol::new("/bib/discovery/1.0.0")
            }
            (StreamClass::Discovery, WireVersion::V2) => {
                StreamProtocol::new("/bib/discovery/2.0.0")
            }
            (StreamClass::Data, WireVersion::V1) => StreamProtocol::new("/bib/data/1.0.0"),
            (StreamClass::Data, WireVersion::V2) => StreamProtocol::new("/bib/data/2.0.0"),
            (StreamClass::Sync, WireVersion::V1) => StreamProtocol::new("/bib/sync/1.0.0"),
            (StreamClass::Sync, WireVersion::V2) => StreamProtocol::new("/bib/sync/2.0.0"),
            (StreamClass::Jobs, WireVersion::V1) => StreamProtocol::new("/bib/jobs/1.0.0"),
            (StreamClass::Jobs, WireVersion::V2) => StreamProtocol::new("/bib/jobs/2.0.0"),
        }
    }

    /// The class a request body belongs to, used for routing.
    pub fn of(body: &RequestBody) -> StreamClass {
        match body {
            RequestBody::GetCatalog { .. }
            | RequestBody::QueryCatalog(_)
            | RequestBody::GetPeerInfo
            | RequestBody::Announce(_) => StreamClass::Discovery,
            RequestBody::GetDatasetInfo { .. }
            | RequestBody::GetChunk { .. }
            | RequestBody::GetChunks { .. } => StreamClass::Data,
            RequestBody::GetSyncStatus | RequestBody::SyncState { .. } => StreamClass::Sync,
            RequestBody::SubmitJob { .. } | RequestBody::GetJobStatus { .. } => StreamClass::Jobs,
        }
    }
}
