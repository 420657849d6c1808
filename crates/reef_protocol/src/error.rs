//! Error type for the KV wire codec.

use thiserror::Error;

use reef_common::error::{ProtocolError, ReefError, TransportError};

/// Errors raised while encoding or decoding KV frames.
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Bad magic byte: 0x{0:02x}")]
    BadMagic(u8),

    #[error("Frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    #[error("Header field mismatch: {0}")]
    Malformed(String),

    #[error("Key too long for frame: {0} bytes")]
    KeyTooLong(usize),
}

impl From<CodecError> for ReefError {
    fn from(e: CodecError) -> Self {
        match e {
            CodecError::BadMagic(m) => ReefError::Protocol(ProtocolError::BadMagic(m)),
            CodecError::FrameTooLarge { size, max } => {
                ReefError::Transport(TransportError::FrameTooLarge { size, max })
            }
            CodecError::Malformed(msg) => ReefError::Protocol(ProtocolError::Violation(msg)),
            CodecError::KeyTooLong(n) => {
                ReefError::InvalidArgument(format!("key of {} bytes exceeds frame limits", n))
            }
        }
    }
}
