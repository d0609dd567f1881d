//! Length-prefixed MessagePack framing.
//!
//! ```text
//! ┌──────────────────┬─────────────────────────┐
//! │ length (u32, BE) │ MessagePack frame (map) │
//! └──────────────────┴─────────────────────────┘
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::frames::Frame;

/// Default maximum frame size (16 MiB).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Length prefix size in bytes.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Errors raised while encoding or decoding frames.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame exceeds the size limit.
    #[error("Frame size {size} exceeds maximum {max}")]
    FrameTooLarge { size: usize, max: usize },

    /// Not enough data to decode a frame.
    #[error("Incomplete frame: need {0} more bytes")]
    Incomplete(usize),

    /// MessagePack encoding error.
    #[error("Encoding error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    /// MessagePack decoding error.
    #[error("Decoding error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    /// The client speaks an incompatible protocol version.
    #[error("Unsupported protocol version {0}")]
    UnsupportedVersion(u8),
}

/// Encode a frame with the default size limit.
///
/// # Errors
///
/// Returns an error if the frame is too large or encoding fails.
pub fn encode(frame: &Frame) -> Result<Bytes, ProtocolError> {
    FrameCodec::default().encode(frame)
}

/// Decode one complete frame with the default size limit.
///
/// # Errors
///
/// Returns an error if the data is incomplete, too large, or invalid.
pub fn decode(data: &[u8]) -> Result<Frame, ProtocolError> {
    FrameCodec::default().decode(data)
}

/// Frame codec with a configurable size limit.
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    max_frame_size: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(MAX_FRAME_SIZE)
    }
}

impl FrameCodec {
    /// Create a codec rejecting frames larger than `max_frame_size` bytes.
    #[must_use]
    pub fn new(max_frame_size: usize) -> Self {
        Self {
            max_frame_size: max_frame_size.min(u32::MAX as usize),
        }
    }

    /// The size limit, length prefix excluded.
    #[must_use]
    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    fn check(&self, size: usize) -> Result<(), ProtocolError> {
        if size > self.max_frame_size {
            return Err(ProtocolError::FrameTooLarge {
                size,
                max: self.max_frame_size,
            });
        }
        Ok(())
    }

    /// Encode a frame to bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the frame is too large or encoding fails.
    pub fn encode(&self, frame: &Frame) -> Result<Bytes, ProtocolError> {
        let mut buf = BytesMut::new();
        self.encode_into(frame, &mut buf)?;
        Ok(buf.freeze())
    }

    /// Append an encoded frame to a buffer.
    ///
    /// # Errors
    ///
    /// Returns an error if the frame is too large or encoding fails. The buffer
    /// is left untouched in that case.
    pub fn encode_into(&self, frame: &Frame, buf: &mut BytesMut) -> Result<(), ProtocolError> {
        let payload = rmp_serde::to_vec_named(frame)?;
        self.check(payload.len())?;

        buf.reserve(LENGTH_PREFIX_SIZE + payload.len());
        buf.put_u32(payload.len() as u32);
        buf.extend_from_slice(&payload);
        Ok(())
    }

    /// Decode one complete frame. Trailing bytes are ignored.
    ///
    /// # Errors
    ///
    /// Returns an error if the data is incomplete, too large, or invalid.
    pub fn decode(&self, data: &[u8]) -> Result<Frame, ProtocolError> {
        let Some(prefix) = data.get(..LENGTH_PREFIX_SIZE) else {
            return Err(ProtocolError::Incomplete(LENGTH_PREFIX_SIZE - data.len()));
        };
        let length = u32::from_be_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]) as usize;
        self.check(length)?;

        let total = LENGTH_PREFIX_SIZE + length;
        if data.len() < total {
            return Err(ProtocolError::Incomplete(total - data.len()));
        }
        Ok(rmp_serde::from_slice(&data[LENGTH_PREFIX_SIZE..total])?)
    }

    /// Decode the next frame of a stream, advancing the buffer past it.
    ///
    /// Returns `Ok(None)` until a whole frame is buffered.
    ///
    /// # Errors
    ///
    /// Returns an error if the announced frame is too large or invalid.
    pub fn decode_from(&self, buf: &mut BytesMut) -> Result<Option<Frame>, ProtocolError> {
        if buf.len() < LENGTH_PREFIX_SIZE {
            return Ok(None);
        }
        let length = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        self.check(length)?;

        if buf.len() < LENGTH_PREFIX_SIZE + length {
            return Ok(None);
        }
        buf.advance(LENGTH_PREFIX_SIZE);
        let payload = buf.split_to(length);
        Ok(Some(rmp_serde::from_slice(&payload)?))
    }
}
