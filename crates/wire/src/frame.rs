//! Request/response framing.
//!
//! # Wire format
//!
//! ```text
//! HANDSHAKE (client -> server):     [32 bytes: hex token ASCII]
//! AUTH RESPONSE (server -> client): [1 byte: 0x01=OK, 0x00=rejected]
//!
//! FRAME (both directions):
//!   [4 bytes BE: header_len]
//!   [header_len bytes: JSON Message envelope]
//!   [8 bytes BE: body_len]
//!   [body_len bytes: raw body]
//! ```
//!
//! Responses always carry an empty body.

use chunkferry_protocol::Message;
use chunkferry_protocol::constants::{MAX_HEADER_LEN, TOKEN_LEN};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::ChannelError;

/// Authentication response: accepted.
pub const AUTH_OK: u8 = 0x01;

/// Authentication response: rejected.
pub const AUTH_REJECTED: u8 = 0x00;

/// One decoded frame: the envelope plus its raw body.
#[derive(Debug, Clone)]
pub struct Frame {
    pub message: Message,
    pub body: Vec<u8>,
}

impl Frame {
    /// A frame with no body.
    pub fn bare(message: Message) -> Self {
        Self {
            message,
            body: Vec::new(),
        }
    }
}

/// Writes the envelope and the body length; the caller streams the body.
pub async fn write_frame_header<W: AsyncWrite + Unpin>(
    writer: &mut W,
    message: &Message,
    body_len: u64,
) -> Result<(), ChannelError> {
    let header = serde_json::to_vec(message)?;
    if header.len() > MAX_HEADER_LEN {
        return Err(ChannelError::HeaderTooLarge {
            len: header.len(),
            max: MAX_HEADER_LEN,
        });
    }

    writer.write_u32(header.len() as u32).await?;
    writer.write_all(&header).await?;
    writer.write_u64(body_len).await?;
    Ok(())
}

/// Writes a complete frame and flushes.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    message: &Message,
    body: &[u8],
) -> Result<(), ChannelError> {
    write_frame_header(writer, message, body.len() as u64).await?;
    writer.write_all(body).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads one frame, refusing bodies larger than `max_body`.
pub async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
    max_body: u64,
) -> Result<Frame, ChannelError> {
    let header_len = reader.read_u32().await? as usize;
    if header_len > MAX_HEADER_LEN {
        return Err(ChannelError::HeaderTooLarge {
            len: header_len,
            max: MAX_HEADER_LEN,
        });
    }

    let mut header = vec![0u8; header_len];
    reader.read_exact(&mut header).await?;
    let message: Message = serde_json::from_slice(&header)?;

    let body_len = reader.read_u64().await?;
    if body_len > max_body {
        return Err(ChannelError::BodyTooLarge {
            len: body_len,
            max: max_body,
        });
    }

    let mut body = vec![0u8; body_len as usize];
    reader.read_exact(&mut body).await?;

    Ok(Frame { message, body })
}

/// Writes the capability token (32 hex ASCII bytes).
pub async fn write_token<W: AsyncWrite + Unpin>(
    writer: &mut W,
    token: &str,
) -> Result<(), ChannelError> {
    if token.len() != TOKEN_LEN {
        return Err(ChannelError::Protocol(format!(
            "token must be {TOKEN_LEN} bytes, got {}",
            token.len()
        )));
    }
    writer.write_all(token.as_bytes()).await?;
    Ok(())
}

/// Reads the capability token.
pub async fn read_token<R: AsyncRead + Unpin>(reader: &mut R) -> Result<String, ChannelError> {
    let mut buf = [0u8; TOKEN_LEN];
    reader.read_exact(&mut buf).await?;
    String::from_utf8(buf.to_vec())
        .map_err(|e| ChannelError::Protocol(format!("invalid token encoding: {e}")))
}

/// Writes the authentication response byte.
pub async fn write_auth_response<W: AsyncWrite + Unpin>(
    writer: &mut W,
    accepted: bool,
) -> Result<(), ChannelError> {
    writer
        .write_u8(if accepted { AUTH_OK } else { AUTH_REJECTED })
        .await?;
    writer.flush().await?;
    Ok(())
}

/// Reads the authentication response byte.
pub async fn read_auth_response<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<bool, ChannelError> {
    let byte = reader.read_u8().await?;
    Ok(byte == AUTH_OK)
}
