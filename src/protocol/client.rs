// Client side of the wire protocol: open a named stream, write one
// request, read one response, close.
//
// Version negotiation is by protocol id: the client attempts the binary
// 2.0.0 protocol and falls back to 1.0.0 when the peer does not support
// it. The outcome is cached per peer and invalidated when it stops
// holding.

use dashmap::DashMap;
use futures::AsyncWriteExt;
use libp2p::{PeerId, Stream};
use libp2p_stream::{Control, OpenStreamError};
use std::sync::Arc;

use super::codec::{decode_response, encode_request, read_frame, write_frame};
use super::messages::{
    Announcement, ErrorBody, PeerInfoPayload, QueryResult, Request, RequestBody, Response,
    ResponseBody, SyncStateResponse, SyncStatusPayload,
};
use super::{StreamClass, WireVersion};
use crate::catalog::{CatalogQuery, CatalogSnapshot, Chunk};
use crate::error::{BibError, Result};
use crate::host::BandwidthCounter;

/// Reply to `GetCatalog`: either the full snapshot or a version-only stub
/// when the caller was already current.
#[derive(Debug, Clone)]
pub enum CatalogReply {
    Snapshot(CatalogSnapshot),
    Stub { version: u64 },
}

pub struct ProtocolClient {
    control: Control,
    bandwidth: Arc<BandwidthCounter>,
    negotiated: DashMap<PeerId, WireVersion>,
}

impl ProtocolClient {
    pub fn new(control: Control, bandwidth: Arc<BandwidthCounter>) -> Self {
        Self {
            control,
            bandwidth,
            negotiated: DashMap::new(),
        }
    }

    /// Issue one request and await its response.
    pub async fn request(&self, peer: PeerId, request: Request) -> Result<Response> {
        let class = StreamClass::of(&request.body);
        let (mut stream, version) = self.open(peer, class).await?;

        let bytes = encode_request(version, &request)?;
        write_frame(&mut stream, &bytes).await?;
        self.bandwidth.record_out(bytes.len() as u64 + 4);

        let body = read_frame(&mut stream).await?;
        self.bandwidth.record_in(body.len() as u64 + 4);
        let _ = stream.close().await;

        let response = decode_response(version, &body)?;
        if response.request_id != request.request_id {
            return Err(BibError::transport(std::io::Error::other(format!(
                "response id {} does not match request id {}",
                response.request_id, request.request_id
            ))));
        }
        Ok(response)
    }

    async fn open(&self, peer: PeerId, class: StreamClass) -> Result<(Stream, WireVersion)> {
        // A previously negotiated version is tried first; a stale entry is
        // dropped and negotiation restarts.
        if let Some(version) = self.negotiated.get(&peer).map(|v| *v) {
            match self.control.clone().open_stream(peer, class.protocol(version)).await {
                Ok(stream) => return Ok((stream, version)),
                Err(OpenStreamError::UnsupportedProtocol(_)) => {
                    self.negotiated.remove(&peer);
                }
                Err(e) => return Err(BibError::transport(e)),
            }
        }

        match self
            .control
            .clone()
            .open_stream(peer, class.protocol(WireVersion::V2))
            .await
        {
            Ok(stream) => {
                self.negotiated.insert(peer, WireVersion::V2);
                Ok((stream, WireVersion::V2))
            }
            Err(OpenStreamError::UnsupportedProtocol(_)) => {
                let stream = self
                    .control
                    .clone()
                    .open_stream(peer, class.protocol(WireVersion::V1))
                    .await
                    .map_err(BibError::transport)?;
                self.negotiated.insert(peer, WireVersion::V1);
                Ok((stream, WireVersion::V1))
            }
            Err(e) => Err(BibError::transport(e)),
        }
    }

    pub async fn get_catalog(&self, peer: PeerId, since_version: Option<u64>) -> Result<CatalogReply> {
        let response = self
            .request(peer, Request::new(RequestBody::GetCatalog { since_version }))
            .await?;
        match response.body {
            ResponseBody::Catalog(snapshot) => Ok(CatalogReply::Snapshot(snapshot)),
            ResponseBody::CatalogStub { version } => Ok(CatalogReply::Stub { version }),
            other => Err(unexpected(other)),
        }
    }

    pub async fn query_catalog(&self, peer: PeerId, query: CatalogQuery) -> Result<QueryResult> {
        let response = self
            .request(peer, Request::new(RequestBody::QueryCatalog(query)))
            .await?;
        match response.body {
            ResponseBody::QueryResult(result) => Ok(result),
            other => Err(unexpected(other)),
        }
    }

    pub async fn get_peer_info(&self, peer: PeerId) -> Result<PeerInfoPayload> {
        let response = self
            .request(peer, Request::new(RequestBody::GetPeerInfo))
            .await?;
        match response.body {
            ResponseBody::PeerInfo(info) => Ok(info),
            other => Err(unexpected(other)),
        }
    }

    pub async fn announce(&self, peer: PeerId, announcement: Announcement) -> Result<bool> {
        let response = self
            .request(peer, Request::new(RequestBody::Announce(announcement)))
            .await?;
        match response.body {
            ResponseBody::AnnounceAck { accepted } => Ok(accepted),
            other => Err(unexpected(other)),
        }
    }

    pub async fn get_dataset_info(
        &self,
        peer: PeerId,
        dataset_id: impl Into<String>,
    ) -> Result<(crate::catalog::Dataset, crate::catalog::DatasetContent)> {
        let response = self
            .request(
                peer,
                Request::new(RequestBody::GetDatasetInfo {
                    dataset_id: dataset_id.into(),
                }),
            )
            .await?;
        match response.body {
            ResponseBody::DatasetInfo { dataset, content } => Ok((dataset, content)),
            other => Err(unexpected(other)),
        }
    }

    pub async fn get_chunk(
        &self,
        peer: PeerId,
        dataset_id: impl Into<String>,
        index: u32,
    ) -> Result<Chunk> {
        let response = self
            .request(
                peer,
                Request::new(RequestBody::GetChunk {
                    dataset_id: dataset_id.into(),
                    index,
                }),
            )
            .await?;
        match response.body {
            ResponseBody::Chunk(chunk) => Ok(chunk),
            other => Err(unexpected(other)),
        }
    }

    pub async fn get_chunks(
        &self,
        peer: PeerId,
        dataset_id: impl Into<String>,
        indices: Vec<u32>,
    ) -> Result<Vec<Chunk>> {
        let response = self
            .request(
                peer,
                Request::new(RequestBody::GetChunks {
                    dataset_id: dataset_id.into(),
                    indices,
                }),
            )
            .await?;
        match response.body {
            ResponseBody::Chunks(chunks) => Ok(chunks),
            other => Err(unexpected(other)),
        }
    }

    pub async fn get_sync_status(&self, peer: PeerId) -> Result<SyncStatusPayload> {
        let response = self
            .request(peer, Request::new(RequestBody::GetSyncStatus))
            .await?;
        match response.body {
            ResponseBody::SyncStatus(status) => Ok(status),
            other => Err(unexpected(other)),
        }
    }

    pub async fn sync_state(
        &self,
        peer: PeerId,
        catalog_version: u64,
        hashes: Vec<String>,
    ) -> Result<SyncStateResponse> {
        let response = self
            .request(
                peer,
                Request::new(RequestBody::SyncState {
                    catalog_version,
                    hashes,
                }),
            )
            .await?;
        match response.body {
            ResponseBody::SyncState(state) => Ok(state),
            other => Err(unexpected(other)),
        }
    }
}

/// Map a remote error carrier back into the local taxonomy.
pub(crate) fn error_from_body(body: ErrorBody) -> BibError {
    match body.code {
        404 => BibError::NotFound(body.message),
        401 => BibError::Unauthorized,
        429 => BibError::RateLimited,
        408 => BibError::Timeout(body.message),
        400 => BibError::InvalidInput(body.message),
        422 => BibError::HashMismatch {
            expected: body
                .details
                .get("expected")
                .cloned()
                .unwrap_or_default(),
            actual: body.details.get("actual").cloned().unwrap_or_default(),
        },
        code => BibError::transport(std::io::Error::other(format!(
            "remote error {code}: {}",
            body.message
        ))),
    }
}

fn unexpected(body: ResponseBody) -> BibError {
    if let ResponseBody::Error(err) = body {
        return error_from_body(err);
    }
    BibError::transport(std::io::Error::other(
        "peer answered with an unexpected response type",
    ))
}
