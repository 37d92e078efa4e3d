// Frame and body codecs.
//
// Framing is shared by both protocol generations: a 4-byte big-endian
// length prefix followed by the body. Oversized frames are refused before
// the body is read; the stream is not drained.

use futures::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::messages::{Request, Response};
use super::WireVersion;
use crate::error::{BibError, Result};

/// Bodies above this size are refused on both ends.
pub const MAX_FRAME_SIZE: usize = 10 * 1024 * 1024;

/// Write one length-prefixed frame.
pub async fn write_frame<W>(io: &mut W, body: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    if body.len() > MAX_FRAME_SIZE {
        return Err(BibError::InvalidInput(format!(
            "frame of {} bytes exceeds the {} byte limit",
            body.len(),
            MAX_FRAME_SIZE
        )));
    }
    let len = (body.len() as u32).to_be_bytes();
    io.write_all(&len).await.map_err(BibError::transport)?;
    io.write_all(body).await.map_err(BibError::transport)?;
    io.flush().await.map_err(BibError::transport)?;
    Ok(())
}

/// Read one length-prefixed frame, refusing oversized bodies.
pub async fn read_frame<R>(io: &mut R) -> Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    io.read_exact(&mut len_buf)
        .await
        .map_err(BibError::transport)?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(BibError::InvalidInput(format!(
            "peer announced a {len} byte frame, limit is {MAX_FRAME_SIZE}"
        )));
    }
    let mut body = vec![0u8; len];
    io.read_exact(&mut body)
        .await
        .map_err(BibError::transport)?;
    Ok(body)
}

fn encode_body<T: Serialize>(version: WireVersion, value: &T) -> Result<Vec<u8>> {
    match version {
        WireVersion::V1 => Ok(serde_json::to_vec(value)?),
        WireVersion::V2 => Ok(bincode::serde::encode_to_vec(
            value,
            bincode::config::standard(),
        )?),
    }
}

fn decode_body<T: DeserializeOwned>(version: WireVersion, body: &[u8]) -> Result<T> {
    match version {
        WireVersion::V1 => Ok(serde_json::from_slice(body)?),
        WireVersion::V2 => {
            let (value, _) = bincode::serde::decode_from_slice(body, bincode::config::standard())?;
            Ok(value)
        }
    }
}

pub fn encode_request(version: WireVersion, request: &Request) -> Result<Vec<u8>> {
    encode_body(version, request)
}

pub fn decode_request(version: WireVersion, body: &[u8]) -> Result<Request> {
    decode_body(version, body)
}

pub fn encode_response(version: WireVersion, response: &Response) -> Result<Vec<u8>> {
    encode_body(version, response)
}

pub fn decode_response(version: WireVersion, body: &[u8]) -> Result<Response> {
    decode_body(version, body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::CatalogQuery;
    use crate::protocol::messages::{ErrorBody, RequestBody, ResponseBody};
    use futures::io::Cursor;

    fn sample_request() -> Request {
        Request::new(RequestBody::QueryCatalog(CatalogQuery {
            topic_id: Some("climate".to_string()),
            name_pattern: Some("temps-*".to_string()),
            limit: Some(20),
            ..Default::default()
        }))
    }

    #[test]
    fn test_request_round_trip_both_versions() {
        let request = sample_request();
        for version in [WireVersion::V1, WireVersion::V2] {
            let bytes = encode_request(version, &request).unwrap();
            let decoded = decode_request(version, &bytes).unwrap();
            assert_eq!(decoded, request);
        }
    }

    #[test]
    fn test_response_round_trip_both_versions() {
        let response = Response {
            request_id: "req-1".to_string(),
            body: ResponseBody::Error(ErrorBody::new(404, "dataset not found")),
        };
        for version in [WireVersion::V1, WireVersion::V2] {
            let bytes = encode_response(version, &response).unwrap();
            let decoded = decode_response(version, &bytes).unwrap();
            assert_eq!(decoded, response);
        }
    }

    #[tokio::test]
    async fn test_frame_round_trip() {
        let mut buf = Cursor::new(Vec::new());
        write_frame(&mut buf, b"hello frames").await.unwrap();

        let mut reader = Cursor::new(buf.into_inner());
        let body = read_frame(&mut reader).await.unwrap();
        assert_eq!(body, b"hello frames");
    }

    #[tokio::test]
    async fn test_oversized_frame_refused_without_draining() {
        // Announce an 11 MiB body but provide none of it.
        let mut header = Vec::new();
        header.extend_from_slice(&(11u32 * 1024 * 1024).to_be_bytes());
        let mut reader = Cursor::new(header);

        let err = read_frame(&mut reader).await.unwrap_err();
        assert!(matches!(err, BibError::InvalidInput(_)));
        // Nothing past the prefix was consumed.
        assert_eq!(reader.position(), 4);
    }

    #[tokio::test]
    async fn test_oversized_write_refused() {
        let mut buf = Cursor::new(Vec::new());
        let body = vec![0u8; MAX_FRAME_SIZE + 1];
        assert!(matches!(
            write_frame(&mut buf, &body).await.unwrap_err(),
            BibError::InvalidInput(_)
        ));
    }
}
