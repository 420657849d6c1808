//! Value compression for the data plane.
//!
//! When the snappy feature was negotiated at HELLO time, responses may carry
//! the SNAPPY datatype bit, and mutations compress values above a size
//! threshold (tiny values grow under compression).

use reef_common::error::{ProtocolError, ReefError, ReefResult};
use reef_protocol::DATATYPE_SNAPPY;

/// Decompress a response value if its datatype says so. Returns the value
/// and the datatype with the SNAPPY bit cleared.
pub fn maybe_decompress(datatype: u8, value: Vec<u8>) -> ReefResult<(u8, Vec<u8>)> {
    if datatype & DATATYPE_SNAPPY == 0 {
        return Ok((datatype, value));
    }
    let decoded = snap::raw::Decoder::new()
        .decompress_vec(&value)
        .map_err(|e| {
            ReefError::Protocol(ProtocolError::Violation(format!(
                "undecodable snappy value: {}",
                e
            )))
        })?;
    Ok((datatype & !DATATYPE_SNAPPY, decoded))
}

/// Compress an outbound value when worthwhile. Returns the (possibly
/// unchanged) value and the datatype to send.
pub fn maybe_compress(datatype: u8, value: Vec<u8>, min_size: usize) -> (u8, Vec<u8>) {
    if value.len() < min_size {
        return (datatype, value);
    }
    match snap::raw::Encoder::new().compress_vec(&value) {
        // Only keep the compressed form when it actually shrank.
        Ok(compressed) if compressed.len() < value.len() => {
            (datatype | DATATYPE_SNAPPY, compressed)
        }
        _ => (datatype, value),
    }
}
