//! Binary KV wire protocol for the data service.
//!
//! Frames are fixed 24-byte headers followed by `framing_extras || extras ||
//! key || value`, all multi-byte integers big-endian. The codec is resumable:
//! decoding a partial buffer reports how many bytes are needed and consumes
//! nothing.

pub mod codec;
pub mod error;
pub mod types;

pub use codec::{decode_packet, encode_packet, DecodeOutcome};
pub use error::CodecError;
pub use types::*;
