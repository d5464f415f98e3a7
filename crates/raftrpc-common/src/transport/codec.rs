use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::protocol::error::{RaftRpcError, Result};
use crate::protocol::{Request, Response, RpcArgs};

/// Maximum frame size (100 MB)
pub const MAX_MESSAGE_SIZE: usize = 100 * 1024 * 1024;

/// JSON codec for frames and for the typed payloads they carry.
///
/// # Example
///
/// ```
/// use raftrpc_common::transport::JsonCodec;
/// use raftrpc_common::protocol::Request;
/// use serde_json::json;
///
/// let request = Request::new("raft.TimeoutNow", json!({"header": {}}));
/// let encoded = JsonCodec::encode_request(&request).unwrap();
/// let decoded = JsonCodec::decode_request(&encoded).unwrap();
/// assert_eq!(request, decoded);
/// ```
pub struct JsonCodec;

impl JsonCodec {
    pub fn encode_request(request: &Request) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(request)?)
    }

    pub fn decode_request(data: &[u8]) -> Result<Request> {
        Ok(serde_json::from_slice(data)?)
    }

    pub fn encode_response(response: &Response) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(response)?)
    }

    pub fn decode_response(data: &[u8]) -> Result<Response> {
        Ok(serde_json::from_slice(data)?)
    }

    /// Encodes a typed payload into request arguments or a response result.
    pub fn encode_args<T: Serialize>(value: &T) -> Result<RpcArgs> {
        Ok(serde_json::to_value(value)?)
    }

    /// Decodes request arguments or a response result into a typed payload.
    ///
    /// A payload that does not match the expected schema is reported as an
    /// invalid request.
    pub fn decode_args<T: DeserializeOwned>(value: RpcArgs) -> Result<T> {
        serde_json::from_value(value)
            .map_err(|e| RaftRpcError::InvalidRequest(format!("Malformed payload: {}", e)))
    }
}

/// Writes one frame: `[4-byte length as u32 big-endian] + [data]`.
pub async fn write_frame<W>(writer: &mut W, data: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    if data.len() > MAX_MESSAGE_SIZE {
        return Err(RaftRpcError::InvalidRequest(format!(
            "Message too large: {} bytes (max {} bytes)",
            data.len(),
            MAX_MESSAGE_SIZE
        )));
    }

    let len = data.len() as u32;
    writer
        .write_all(&len.to_be_bytes())
        .await
        .map_err(|e| map_io_error(e, "writing length prefix"))?;
    writer
        .write_all(data)
        .await
        .map_err(|e| map_io_error(e, "writing data"))?;
    writer
        .flush()
        .await
        .map_err(|e| map_io_error(e, "flushing stream"))?;

    Ok(())
}

/// Reads one frame.
///
/// Returns `Ok(None)` when the peer closed the connection cleanly between
/// frames.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(map_io_error(e, "reading length prefix")),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_MESSAGE_SIZE {
        return Err(RaftRpcError::InvalidResponse(format!(
            "Message too large: {} bytes (max {} bytes)",
            len, MAX_MESSAGE_SIZE
        )));
    }

    let mut buf = vec![0u8; len];
    reader
        .read_exact(&mut buf)
        .await
        .map_err(|e| map_io_error(e, "reading data"))?;

    Ok(Some(buf))
}

/// Map IO errors to connection errors where the peer went away.
fn map_io_error(err: std::io::Error, context: &str) -> RaftRpcError {
    match err.kind() {
        std::io::ErrorKind::ConnectionReset
        | std::io::ErrorKind::ConnectionAborted
        | std::io::ErrorKind::BrokenPipe
        | std::io::ErrorKind::UnexpectedEof
        | std::io::ErrorKind::NotConnected => {
            RaftRpcError::Connection(format!("{}: Connection lost", context))
        }
        _ => RaftRpcError::Io(err),
    }
}
