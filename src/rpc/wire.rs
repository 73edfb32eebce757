//! Wire framing helpers shared by the mesh and proxy transports
//!
//! Request frame:  rpc_id (u16 le) | header_len (u32 le) | header bytes
//! Response frame: header_len (u32 le) | header bytes
//!
//! A response length of `ERROR_MARKER` signals that the peer could not
//! produce a typed response (unknown opcode, undecodable request); the
//! caller gets a transport-level error instead of hanging.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::{RpcError, RpcId, Serializable};

/// Maximum header size in bytes
pub const MAX_HEADER_SIZE: usize = 256;

/// Response-length sentinel for dispatch failures
pub const ERROR_MARKER: u32 = u32::MAX;

/// Send a request frame: rpc_id, header length, header bytes.
pub async fn send_request<W, H>(writer: &mut W, rpc_id: RpcId, header: &H) -> Result<(), RpcError>
where
    W: AsyncWrite + Unpin,
    H: Serializable,
{
    let header_bytes = zerocopy::IntoBytes::as_bytes(header);

    let mut frame = Vec::with_capacity(6 + header_bytes.len());
    frame.extend_from_slice(&rpc_id.to_le_bytes());
    frame.extend_from_slice(&(header_bytes.len() as u32).to_le_bytes());
    frame.extend_from_slice(header_bytes);

    writer
        .write_all(&frame)
        .await
        .map_err(|e| RpcError::Transport(format!("Failed to send request frame: {}", e)))?;
    writer
        .flush()
        .await
        .map_err(|e| RpcError::Transport(format!("Failed to flush request frame: {}", e)))?;

    Ok(())
}

/// Receive a request frame. Returns `None` on clean connection close
/// before the first byte of a frame.
pub async fn recv_request<R>(reader: &mut R) -> Result<Option<(RpcId, Vec<u8>)>, RpcError>
where
    R: AsyncRead + Unpin,
{
    let mut id_buf = [0u8; 2];
    match reader.read_exact(&mut id_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => {
            return Err(RpcError::Transport(format!(
                "Failed to receive RPC ID: {}",
                e
            )))
        }
    }
    let rpc_id = RpcId::from_le_bytes(id_buf);

    let mut len_buf = [0u8; 4];
    reader
        .read_exact(&mut len_buf)
        .await
        .map_err(|e| RpcError::Transport(format!("Failed to receive header length: {}", e)))?;
    let header_len = u32::from_le_bytes(len_buf) as usize;

    if header_len > MAX_HEADER_SIZE {
        return Err(RpcError::Transport(format!(
            "Header size {} exceeds maximum {}",
            header_len, MAX_HEADER_SIZE
        )));
    }

    let mut header = vec![0u8; header_len];
    reader
        .read_exact(&mut header)
        .await
        .map_err(|e| RpcError::Transport(format!("Failed to receive header: {}", e)))?;

    Ok(Some((rpc_id, header)))
}

/// Send a serializable response header.
pub async fn send_response<W, H>(writer: &mut W, header: &H) -> Result<(), RpcError>
where
    W: AsyncWrite + Unpin,
    H: Serializable,
{
    let header_bytes = zerocopy::IntoBytes::as_bytes(header);

    let mut frame = Vec::with_capacity(4 + header_bytes.len());
    frame.extend_from_slice(&(header_bytes.len() as u32).to_le_bytes());
    frame.extend_from_slice(header_bytes);

    writer
        .write_all(&frame)
        .await
        .map_err(|e| RpcError::Transport(format!("Failed to send response: {}", e)))?;
    writer
        .flush()
        .await
        .map_err(|e| RpcError::Transport(format!("Failed to flush response: {}", e)))?;

    Ok(())
}

/// Signal a dispatch failure to the peer so it never waits forever.
pub async fn send_error_marker<W>(writer: &mut W) -> Result<(), RpcError>
where
    W: AsyncWrite + Unpin,
{
    writer
        .write_all(&ERROR_MARKER.to_le_bytes())
        .await
        .map_err(|e| RpcError::Transport(format!("Failed to send error marker: {}", e)))?;
    writer
        .flush()
        .await
        .map_err(|e| RpcError::Transport(format!("Failed to flush error marker: {}", e)))?;
    Ok(())
}

/// Receive a serializable response header.
pub async fn recv_response<R, H>(reader: &mut R) -> Result<H, RpcError>
where
    R: AsyncRead + Unpin,
    H: Serializable,
{
    let mut len_buf = [0u8; 4];
    reader
        .read_exact(&mut len_buf)
        .await
        .map_err(|e| RpcError::Transport(format!("Failed to receive response length: {}", e)))?;
    let header_len = u32::from_le_bytes(len_buf);

    if header_len == ERROR_MARKER {
        return Err(RpcError::Handler(
            "peer failed to dispatch the request".to_string(),
        ));
    }

    let expected = std::mem::size_of::<H>();
    if header_len as usize != expected {
        return Err(RpcError::Transport(format!(
            "Expected {} byte response header, received {}",
            expected, header_len
        )));
    }

    let mut buffer = vec![0u8; expected];
    reader
        .read_exact(&mut buffer)
        .await
        .map_err(|e| RpcError::Transport(format!("Failed to receive response header: {}", e)))?;

    H::read_from_bytes(&buffer)
        .map_err(|e| RpcError::Transport(format!("Failed to deserialize response: {:?}", e)))
}

/// Parse a request header out of raw frame bytes.
pub fn parse_header<H: Serializable>(bytes: &[u8]) -> Result<H, RpcError> {
    H::read_from_bytes(bytes).map_err(|_| RpcError::InvalidHeader)
}

#[cfg(test)]
mod tests {
    use super::*;
    use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

    #[derive(Debug, Clone, Copy, PartialEq, FromBytes, IntoBytes, KnownLayout, Immutable)]
    #[repr(C)]
    struct TestHeader {
        a: i32,
        b: i32,
    }

    #[tokio::test]
    async fn test_request_round_trip() {
        let (mut client, mut server) = tokio::io::duplex(1024);

        let header = TestHeader { a: -7, b: 99i32 };
        send_request(&mut client, 42, &header).await.unwrap();

        let (rpc_id, bytes) = recv_request(&mut server).await.unwrap().unwrap();
        assert_eq!(rpc_id, 42);

        let parsed: TestHeader = parse_header(&bytes).unwrap();
        assert_eq!(parsed, header);
    }

    #[tokio::test]
    async fn test_response_round_trip() {
        let (mut client, mut server) = tokio::io::duplex(1024);

        let header = TestHeader { a: 3, b: 4 };
        send_response(&mut server, &header).await.unwrap();

        let received: TestHeader = recv_response(&mut client).await.unwrap();
        assert_eq!(received, header);
    }

    #[tokio::test]
    async fn test_clean_close_yields_none() {
        let (client, mut server) = tokio::io::duplex(1024);
        drop(client);

        let result = recv_request(&mut server).await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_error_marker_surfaces_as_handler_error() {
        let (mut client, mut server) = tokio::io::duplex(1024);

        send_error_marker(&mut server).await.unwrap();

        let result: Result<TestHeader, _> = recv_response(&mut client).await;
        assert!(matches!(result, Err(RpcError::Handler(_))));
    }

    #[tokio::test]
    async fn test_oversized_header_rejected() {
        let (mut client, mut server) = tokio::io::duplex(4096);

        // Hand-craft a frame claiming a giant header
        use tokio::io::AsyncWriteExt;
        client.write_all(&7u16.to_le_bytes()).await.unwrap();
        client
            .write_all(&(MAX_HEADER_SIZE as u32 + 1).to_le_bytes())
            .await
            .unwrap();
        client.flush().await.unwrap();

        let result = recv_request(&mut server).await;
        assert!(matches!(result, Err(RpcError::Transport(_))));
    }
}
