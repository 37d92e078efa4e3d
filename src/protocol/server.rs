// Server side of the wire protocol.
//
// One accept loop per (stream class, version). Each accepted stream
// carries a single request: decode, route to the registered handler under
// the per-request deadline, write the response, close. Handlers never
// retain the stream.

use futures::{AsyncWriteExt, StreamExt};
use libp2p::{PeerId, Stream};
use libp2p_stream::Control;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::codec::{decode_request, encode_response, read_frame, write_frame};
use super::messages::{ErrorBody, Response, ResponseBody};
use super::{RequestBody, StreamClass, WireVersion, REQUEST_TIMEOUT};
use crate::error::{BibError, Result};
use crate::host::BandwidthCounter;

/// Application-side request routing, one implementation per node.
#[async_trait::async_trait]
pub trait RequestHandler: Send + Sync + 'static {
    async fn handle(&self, peer: PeerId, request: RequestBody) -> Result<ResponseBody>;
}

pub struct ProtocolServer {
    handler: Arc<dyn RequestHandler>,
    bandwidth: Arc<BandwidthCounter>,
    shutdown: CancellationToken,
    accept_loops: parking_lot::Mutex<Vec<JoinHandle<()>>>,
    active_streams: Arc<AtomicUsize>,
}

impl ProtocolServer {
    pub fn new(handler: Arc<dyn RequestHandler>, bandwidth: Arc<BandwidthCounter>) -> Self {
        Self {
            handler,
            bandwidth,
            shutdown: CancellationToken::new(),
            accept_loops: parking_lot::Mutex::new(Vec::new()),
            active_streams: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Register accept loops for every stream class in both protocol
    /// generations.
    pub fn start(&self, control: &Control) -> Result<()> {
        for class in StreamClass::ALL {
            for version in [WireVersion::V1, WireVersion::V2] {
                let protocol = class.protocol(version);
                let mut incoming = control
                    .clone()
                    .accept(protocol.clone())
                    .map_err(BibError::transport)?;

                let handler = Arc::clone(&self.handler);
                let bandwidth = Arc::clone(&self.bandwidth);
                let shutdown = self.shutdown.clone();
                let active = Arc::clone(&self.active_streams);

                let handle = tokio::spawn(async move {
                    loop {
                        tokio::select! {
                            _ = shutdown.cancelled() => break,
                            next = incoming.next() => {
                                let Some((peer, stream)) = next else { break };
                                let handler = Arc::clone(&handler);
                                let bandwidth = Arc::clone(&bandwidth);
                                let active = Arc::clone(&active);
                                active.fetch_add(1, Ordering::SeqCst);
                                tokio::spawn(async move {
                                    serve_stream(peer, stream, version, handler, bandwidth).await;
                                    active.fetch_sub(1, Ordering::SeqCst);
                                });
                            }
                        }
                    }
                });
                self.accept_loops.lock().push(handle);
            }
        }
        Ok(())
    }

    /// Stop accepting and wait for in-flight handlers, up to `deadline`.
    pub async fn stop(&self, deadline: std::time::Duration) {
        self.shutdown.cancel();
        for handle in self.accept_loops.lock().drain(..) {
            handle.abort();
        }
        let started = std::time::Instant::now();
        while self.active_streams.load(Ordering::SeqCst) > 0 && started.elapsed() < deadline {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
    }

    pub fn active_streams(&self) -> usize {
        self.active_streams.load(Ordering::SeqCst)
    }
}

async fn serve_stream(
    peer: PeerId,
    mut stream: Stream,
    version: WireVersion,
    handler: Arc<dyn RequestHandler>,
    bandwidth: Arc<BandwidthCounter>,
) {
    let body = match read_frame(&mut stream).await {
        Ok(body) => body,
        Err(e) => {
            tracing::debug!(peer = %peer, error = %e, "Dropping stream with unreadable frame");
            return;
        }
    };
    bandwidth.record_in(body.len() as u64 + 4);

    let (request_id, response_body) = match decode_request(version, &body) {
        Ok(request) => {
            let outcome =
                tokio::time::timeout(REQUEST_TIMEOUT, handler.handle(peer, request.body)).await;
            let response_body = match outcome {
                Ok(Ok(body)) => body,
                Ok(Err(e)) => {
                    tracing::debug!(peer = %peer, error = %e, "Request failed");
                    ResponseBody::Error(error_body(&e))
                }
                Err(_) => ResponseBody::Error(ErrorBody::new(408, "request timed out")),
            };
            (request.request_id, response_body)
        }
        Err(e) => {
            tracing::debug!(peer = %peer, error = %e, "Undecodable request");
            (
                String::new(),
                ResponseBody::Error(ErrorBody::new(400, "undecodable request")),
            )
        }
    };

    let response = Response {
        request_id,
        body: response_body,
    };
    match encode_response(version, &response) {
        Ok(bytes) => {
            if let Err(e) = write_frame(&mut stream, &bytes).await {
                tracing::debug!(peer = %peer, error = %e, "Failed to write response");
            } else {
                bandwidth.record_out(bytes.len() as u64 + 4);
            }
        }
        Err(e) => {
            tracing::warn!(peer = %peer, error = %e, "Failed to encode response");
        }
    }
    let _ = stream.close().await;
}

/// Map a local error into the shared wire carrier.
pub(crate) fn error_body(err: &BibError) -> ErrorBody {
    match err {
        BibError::NotFound(what) => ErrorBody::new(404, what.clone()),
        BibError::Unauthorized => ErrorBody::new(401, "unauthorized"),
        BibError::RateLimited => ErrorBody::new(429, "rate limited"),
        BibError::Timeout(what) => ErrorBody::new(408, what.clone()),
        BibError::Cancelled => ErrorBody::new(499, "cancelled"),
        BibError::InvalidInput(what) => ErrorBody::new(400, what.clone()),
        BibError::HashMismatch { expected, actual } => {
            let mut body = ErrorBody::new(422, "hash mismatch");
            body.details.insert("expected".to_string(), expected.clone());
            body.details.insert("actual".to_string(), actual.clone());
            body
        }
        other => ErrorBody::new(500, other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::client::error_from_body;

    #[test]
    fn test_error_mapping_round_trip() {
        let cases = vec![
            BibError::NotFound("dataset d1".to_string()),
            BibError::Unauthorized,
            BibError::RateLimited,
            BibError::Timeout("chunk fetch".to_string()),
            BibError::InvalidInput("unknown mode".to_string()),
            BibError::HashMismatch {
                expected: "aa".to_string(),
                actual: "bb".to_string(),
            },
        ];
        for err in cases {
            let body = error_body(&err);
            let back = error_from_body(body);
            assert_eq!(
                std::mem::discriminant(&err),
                std::mem::discriminant(&back)
            );
        }
    }
}
