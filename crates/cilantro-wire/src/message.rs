//! Wire encoding.
//!
//! Every record on a stream is prefixed with a 4-byte big-endian length. An
//! application record carries one multipart message: a frame count byte
//! followed by each frame as a 4-byte big-endian length plus its bytes.
//! Handshake records are JSON-encoded [`HandshakeMessage`]s.
//!
//! Application messages are always three frames:
//! `[routing/filter][message type][payload]`.

use crate::error::{WireError, WireResult};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// One multipart message.
pub type Multipart = Vec<Bytes>;

/// Current protocol version.
pub const PROTOCOL_VERSION: u32 = 1;

/// Maximum single record size (16 MB).
pub const MAX_MESSAGE_SIZE: u32 = 16 * 1024 * 1024;

/// Maximum number of frames in one multipart message.
pub const MAX_FRAMES: usize = u8::MAX as usize;

/// Message-type frame of the control message a peer sends once it is ready
/// to receive.
pub const CONTROL_READY: &[u8] = b"\x00READY";

/// Message-type frame of a keep-alive control message.
pub const CONTROL_HEARTBEAT: &[u8] = b"\x00HEARTBEAT";

/// Build the standard three-frame message.
pub fn three_frame(
    header: impl Into<Bytes>,
    msg_type: impl Into<Bytes>,
    payload: impl Into<Bytes>,
) -> Multipart {
    vec![header.into(), msg_type.into(), payload.into()]
}

/// Messages exchanged when a connection is established.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum HandshakeMessage {
    /// Identity exchange, sent by both sides (after the secure exchange when
    /// the channel is encrypted).
    #[serde(rename = "greeting")]
    Greeting {
        identity: String,
        protocol_version: u32,
        secure: bool,
    },
    /// Client opens a secure exchange.
    #[serde(rename = "hello")]
    Hello {
        /// Client encryption public key (hex).
        public_key: String,
        /// Security domain the client expects to be authorized in.
        domain: String,
        /// Random client nonce (hex).
        nonce: String,
    },
    /// Server proves it holds the expected key.
    #[serde(rename = "welcome")]
    Welcome {
        /// Random server nonce (hex).
        nonce: String,
        /// HMAC-SHA256 key confirmation tag (hex).
        auth_tag: String,
    },
    /// Client proves it holds its key.
    #[serde(rename = "initiate")]
    Initiate { auth_tag: String },
    /// Handshake rejected.
    #[serde(rename = "error")]
    Error { code: i32, message: String },
}

/// Encode a multipart message into a record body.
pub fn encode_multipart(frames: &[Bytes]) -> WireResult<Vec<u8>> {
    if frames.len() > MAX_FRAMES {
        return Err(WireError::Framing(format!(
            "too many frames: {} (max {MAX_FRAMES})",
            frames.len()
        )));
    }
    let size: usize = 1 + frames.iter().map(|f| 4 + f.len()).sum::<usize>();
    if size > MAX_MESSAGE_SIZE as usize {
        return Err(WireError::MessageTooLarge {
            size: size.min(u32::MAX as usize) as u32,
            max: MAX_MESSAGE_SIZE,
        });
    }
    let mut body = Vec::with_capacity(size);
    body.push(frames.len() as u8);
    for frame in frames {
        body.extend_from_slice(&(frame.len() as u32).to_be_bytes());
        body.extend_from_slice(frame);
    }
    Ok(body)
}

/// Decode a record body into a multipart message.
pub fn decode_multipart(body: &[u8]) -> WireResult<Multipart> {
    let (&count, mut rest) = body
        .split_first()
        .ok_or_else(|| WireError::Framing("empty record".into()))?;
    let mut frames = Vec::with_capacity(count as usize);
    for i in 0..count {
        if rest.len() < 4 {
            return Err(WireError::Framing(format!("truncated length of frame {i}")));
        }
        let len = u32::from_be_bytes([rest[0], rest[1], rest[2], rest[3]]) as usize;
        rest = &rest[4..];
        if rest.len() < len {
            return Err(WireError::Framing(format!(
                "frame {i} declares {len} bytes, {} available",
                rest.len()
            )));
        }
        frames.push(Bytes::copy_from_slice(&rest[..len]));
        rest = &rest[len..];
    }
    if !rest.is_empty() {
        return Err(WireError::Framing(format!(
            "{} trailing bytes after {count} frames",
            rest.len()
        )));
    }
    Ok(frames)
}

/// Write one length-prefixed record.
pub async fn write_record<W>(writer: &mut W, body: &[u8]) -> WireResult<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    if body.len() > MAX_MESSAGE_SIZE as usize {
        return Err(WireError::MessageTooLarge {
            size: body.len().min(u32::MAX as usize) as u32,
            max: MAX_MESSAGE_SIZE,
        });
    }
    writer.write_all(&(body.len() as u32).to_be_bytes()).await?;
    writer.write_all(body).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one length-prefixed record.
pub async fn read_record<R>(reader: &mut R) -> WireResult<Vec<u8>>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut header = [0u8; 4];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(WireError::ConnectionClosed);
        }
        Err(e) => return Err(WireError::Transport(e)),
    }

    let len = u32::from_be_bytes(header);
    if len > MAX_MESSAGE_SIZE {
        return Err(WireError::MessageTooLarge {
            size: len,
            max: MAX_MESSAGE_SIZE,
        });
    }

    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body).await?;
    Ok(body)
}

/// Write a JSON handshake record.
pub async fn write_handshake<W>(writer: &mut W, msg: &HandshakeMessage) -> WireResult<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let body = serde_json::to_vec(msg)?;
    write_record(writer, &body).await
}

/// Read a JSON handshake record.
pub async fn read_handshake<R>(reader: &mut R) -> WireResult<HandshakeMessage>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let body = read_record(reader).await?;
    Ok(serde_json::from_slice(&body)?)
}
