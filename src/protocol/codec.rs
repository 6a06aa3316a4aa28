//! Length-prefixed binary framing for the codeforge wire protocol.
//!
//! Outgoing frames are serialized with postcard and prefixed with a 4-byte
//! big-endian byte count. Incoming bytes are reassembled incrementally by
//! [`FrameBuffer`], which tolerates arbitrary chunking: feeding a stream one
//! byte at a time yields the same frames as feeding it all at once.

use bytes::{Buf, BytesMut};
use thiserror::Error;
use tracing::warn;

use crate::protocol::message::Frame;

/// Size of the length prefix in bytes.
pub const LEN_PREFIX_LEN: usize = 4;

/// Maximum accepted frame body size (16 MiB) to prevent unbounded buffering
/// from a corrupt or adversarial peer.
pub const DEFAULT_MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Framing codec error types.
#[derive(Debug, Error)]
pub enum CodecError {
    /// The peer declared a frame length beyond the configured maximum.
    /// This is fatal for the connection; there is no way to resynchronize.
    #[error("declared frame length {declared} exceeds maximum {max} bytes")]
    FrameTooLarge { declared: usize, max: usize },

    /// A frame could not be serialized.
    #[error("failed to encode frame: {0}")]
    Encode(#[source] postcard::Error),

    /// A structurally complete frame body could not be deserialized.
    /// Non-fatal: the frame is dropped and reassembly continues.
    #[error("failed to decode frame body: {0}")]
    Decode(#[source] postcard::Error),

    /// The header kind tag disagrees with the payload variant.
    /// Non-fatal: the frame is dropped and reassembly continues.
    #[error("header kind {header} does not match payload kind {payload}")]
    KindMismatch {
        header: &'static str,
        payload: &'static str,
    },
}

/// Serialize a frame into wire bytes: `length(4, big-endian) || body(length)`.
///
/// # Errors
///
/// Returns `CodecError::Encode` if serialization fails, or
/// `CodecError::FrameTooLarge` if the body would exceed
/// [`DEFAULT_MAX_FRAME_LEN`] (a peer honoring the same bound would drop the
/// connection on receipt).
pub fn encode_frame(frame: &Frame) -> Result<Vec<u8>, CodecError> {
    let body = postcard::to_allocvec(frame).map_err(CodecError::Encode)?;
    if body.len() > DEFAULT_MAX_FRAME_LEN {
        return Err(CodecError::FrameTooLarge {
            declared: body.len(),
            max: DEFAULT_MAX_FRAME_LEN,
        });
    }

    let mut out = Vec::with_capacity(LEN_PREFIX_LEN + body.len());
    out.extend_from_slice(&(body.len() as u32).to_be_bytes());
    out.extend_from_slice(&body);
    Ok(out)
}

/// Deserialize a frame body and verify the tag/payload invariant.
fn decode_body(body: &[u8]) -> Result<Frame, CodecError> {
    let frame: Frame = postcard::from_bytes(body).map_err(CodecError::Decode)?;
    if !frame.is_consistent() {
        return Err(CodecError::KindMismatch {
            header: frame.header.kind.as_str(),
            payload: frame.payload.kind().as_str(),
        });
    }
    Ok(frame)
}

/// Incremental frame reassembly buffer.
///
/// Owns all bytes received but not yet assembled into a complete frame.
/// Exactly one reader feeds it; it is not shared.
///
/// # Malformed frames
///
/// A structurally complete frame whose body fails to decode (or whose kind
/// tag disagrees with its payload) is dropped with a warning and counted in
/// [`FrameBuffer::dropped`]; reassembly resynchronizes on the next length
/// prefix. Only an implausibly large declared length is fatal.
#[derive(Debug)]
pub struct FrameBuffer {
    buf: BytesMut,
    max_frame_len: usize,
    dropped: u64,
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::with_max_len(DEFAULT_MAX_FRAME_LEN)
    }

    /// Create a buffer with a custom maximum frame length.
    pub fn with_max_len(max_frame_len: usize) -> Self {
        FrameBuffer {
            buf: BytesMut::new(),
            max_frame_len,
            dropped: 0,
        }
    }

    /// Append newly received bytes and drain every complete frame.
    ///
    /// # Errors
    ///
    /// Returns `CodecError::FrameTooLarge` if the peer declares a frame
    /// beyond the configured maximum. The caller must treat this as fatal
    /// and drop the connection; frames decoded before the bad prefix are
    /// lost with it.
    pub fn feed(&mut self, bytes: &[u8]) -> Result<Vec<Frame>, CodecError> {
        self.buf.extend_from_slice(bytes);

        let mut frames = Vec::new();
        while self.buf.len() >= LEN_PREFIX_LEN {
            // Peek the length field without consuming it.
            let declared = u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]])
                as usize;

            if declared > self.max_frame_len {
                return Err(CodecError::FrameTooLarge {
                    declared,
                    max: self.max_frame_len,
                });
            }

            // Frame incomplete; wait for more data.
            if self.buf.len() < LEN_PREFIX_LEN + declared {
                break;
            }

            self.buf.advance(LEN_PREFIX_LEN);
            let body = self.buf.split_to(declared);

            match decode_body(&body) {
                Ok(frame) => frames.push(frame),
                Err(e) => {
                    // Drop this frame, stay synchronized on the next prefix.
                    self.dropped += 1;
                    warn!("Dropping malformed frame ({} bytes): {}", declared, e);
                }
            }
        }

        Ok(frames)
    }

    /// Number of buffered bytes not yet assembled into a frame.
    pub fn pending_bytes(&self) -> usize {
        self.buf.len()
    }

    /// Number of structurally complete frames dropped as malformed.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}
