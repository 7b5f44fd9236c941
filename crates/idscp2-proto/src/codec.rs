//! Length-prefixed framing for IDSCP2 messages.
//!
//! Each wire frame is a 4-byte big-endian length `L` followed by `L` bytes
//! of protobuf-encoded [`IdscpMessage`]. The decoder buffers partial input
//! internally, so the connection layer only ever sees complete messages.
//!
//! The announced length is validated against the configured cap before any
//! payload allocation happens, so a hostile length prefix cannot trigger an
//! unbounded allocation.

use bytes::{Buf, BytesMut};
use prost::Message;

use crate::error::{ProtoError, Result};
use crate::wire::IdscpMessage;

/// Size of the length prefix in bytes.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Default maximum frame body size (4 MiB).
pub const DEFAULT_MAX_FRAME_BYTES: usize = 4 * 1024 * 1024;

/// Encode a message as `[u32 big-endian length][protobuf body]`.
///
/// Total on valid message values; fails only if the body exceeds what a
/// 4-byte prefix can announce.
pub fn encode_frame(msg: &IdscpMessage) -> Result<Vec<u8>> {
    let body_len = msg.encoded_len();
    let prefix = u32::try_from(body_len).map_err(|_| ProtoError::FrameTooLarge {
        got: body_len as u64,
        limit: u32::MAX as u64,
    })?;

    let mut buf = Vec::with_capacity(LENGTH_PREFIX_SIZE + body_len);
    buf.extend_from_slice(&prefix.to_be_bytes());
    msg.encode(&mut buf)?;
    Ok(buf)
}

/// Incremental frame decoder.
///
/// Feed raw bytes with [`extend`](FrameDecoder::extend) as they arrive, then
/// drain complete messages with [`next`](FrameDecoder::next). `Ok(None)`
/// means more input is needed; any `Err` is fatal for the stream.
pub struct FrameDecoder {
    buf: BytesMut,
    max_frame_bytes: usize,
}

impl FrameDecoder {
    /// Create a decoder with the given frame body cap.
    pub fn new(max_frame_bytes: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            max_frame_bytes,
        }
    }

    /// Append raw bytes received from the transport.
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Try to decode the next complete message from the buffer.
    pub fn next(&mut self) -> Result<Option<IdscpMessage>> {
        if self.buf.len() < LENGTH_PREFIX_SIZE {
            return Ok(None);
        }

        let mut prefix = [0u8; LENGTH_PREFIX_SIZE];
        prefix.copy_from_slice(&self.buf[..LENGTH_PREFIX_SIZE]);
        let body_len = u32::from_be_bytes(prefix) as usize;

        if body_len > self.max_frame_bytes {
            return Err(ProtoError::FrameTooLarge {
                got: body_len as u64,
                limit: self.max_frame_bytes as u64,
            });
        }

        if self.buf.len() < LENGTH_PREFIX_SIZE + body_len {
            return Ok(None);
        }

        self.buf.advance(LENGTH_PREFIX_SIZE);
        let body = self.buf.split_to(body_len);
        let msg = IdscpMessage::decode(body.as_ref())
            .map_err(|e| ProtoError::MalformedFrame(format!("protobuf decode: {e}")))?;

        // A frame whose oneof is unset carries no recognizable message type.
        if msg.body.is_none() {
            return Err(ProtoError::MalformedFrame("message has no body".into()));
        }

        Ok(Some(msg))
    }
}
