//! Encode/decode for KV frames.
//!
//! All multi-byte integers are big-endian. Every frame is:
//! `[24-byte header][framing_extras][extras][key][value]`
//!
//! Framed magics (0x18/0x19) repurpose the key-length field: byte 2 is the
//! framing-extras length and byte 3 the (single-byte) key length.

use bytes::{BufMut, BytesMut};

use crate::error::CodecError;
use crate::types::*;

type Result<T> = std::result::Result<T, CodecError>;

/// Outcome of a decode attempt over a possibly-partial buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeOutcome {
    /// A whole frame was parsed; `consumed` bytes may be dropped from the
    /// front of the buffer.
    Complete { packet: Packet, consumed: usize },
    /// Not enough bytes yet; nothing was consumed. `needed` is the total
    /// buffer length required to finish this frame.
    Incomplete { needed: usize },
}

/// Encode a packet into a framed byte buffer.
pub fn encode_packet(packet: &Packet, max_frame_size: usize) -> Result<BytesMut> {
    let framed = packet.magic.is_framed();
    if !framed && !packet.framing_extras.is_empty() {
        return Err(CodecError::Malformed(
            "framing extras on a non-framed magic".into(),
        ));
    }
    let key_limit = if framed { u8::MAX as usize } else { u16::MAX as usize };
    if packet.key.len() > key_limit {
        return Err(CodecError::KeyTooLong(packet.key.len()));
    }
    if packet.extras.len() > u8::MAX as usize {
        return Err(CodecError::Malformed(format!(
            "extras of {} bytes exceed the 255-byte field",
            packet.extras.len()
        )));
    }
    if framed && packet.framing_extras.len() > u8::MAX as usize {
        return Err(CodecError::Malformed(format!(
            "framing extras of {} bytes exceed the 255-byte field",
            packet.framing_extras.len()
        )));
    }

    let body_len = packet.total_body_len();
    let total = HEADER_SIZE + body_len;
    if total > max_frame_size {
        return Err(CodecError::FrameTooLarge {
            size: total,
            max: max_frame_size,
        });
    }

    let mut out = BytesMut::with_capacity(total);
    out.put_u8(packet.magic.to_byte());
    out.put_u8(packet.opcode);
    if framed {
        out.put_u8(packet.framing_extras.len() as u8);
        out.put_u8(packet.key.len() as u8);
    } else {
        out.put_u16(packet.key.len() as u16);
    }
    out.put_u8(packet.extras.len() as u8);
    out.put_u8(packet.datatype);
    out.put_u16(packet.status_or_partition);
    out.put_u32(body_len as u32);
    out.put_u32(packet.opaque);
    out.put_u64(packet.cas);
    out.put_slice(&packet.framing_extras);
    out.put_slice(&packet.extras);
    out.put_slice(&packet.key);
    out.put_slice(&packet.value);
    Ok(out)
}

/// Decode one packet from the front of `input`.
///
/// Returns `Incomplete` without consuming anything when fewer than header or
/// header+body bytes are available. Status codes are not interpreted here.
pub fn decode_packet(input: &[u8], max_frame_size: usize) -> Result<DecodeOutcome> {
    if input.len() < HEADER_SIZE {
        return Ok(DecodeOutcome::Incomplete {
            needed: HEADER_SIZE,
        });
    }

    let magic = Magic::from_byte(input[0]).ok_or(CodecError::BadMagic(input[0]))?;
    let opcode = input[1];
    let (framing_len, key_len) = if magic.is_framed() {
        (input[2] as usize, input[3] as usize)
    } else {
        (0, u16::from_be_bytes([input[2], input[3]]) as usize)
    };
    let extras_len = input[4] as usize;
    let datatype = input[5];
    let status_or_partition = u16::from_be_bytes([input[6], input[7]]);
    let body_len = u32::from_be_bytes([input[8], input[9], input[10], input[11]]) as usize;
    let opaque = u32::from_be_bytes([input[12], input[13], input[14], input[15]]);
    let cas = u64::from_be_bytes([
        input[16], input[17], input[18], input[19], input[20], input[21], input[22], input[23],
    ]);

    let total = HEADER_SIZE + body_len;
    if total > max_frame_size {
        return Err(CodecError::FrameTooLarge {
            size: total,
            max: max_frame_size,
        });
    }
    if framing_len + key_len + extras_len > body_len {
        return Err(CodecError::Malformed(format!(
            "sections ({} + {} + {}) exceed body of {} bytes",
            framing_len, key_len, extras_len, body_len
        )));
    }
    if input.len() < total {
        return Ok(DecodeOutcome::Incomplete { needed: total });
    }

    let body = &input[HEADER_SIZE..total];
    let (framing_extras, rest) = body.split_at(framing_len);
    let (extras, rest) = rest.split_at(extras_len);
    let (key, value) = rest.split_at(key_len);

    let packet = Packet {
        magic,
        opcode,
        datatype,
        status_or_partition,
        opaque,
        cas,
        framing_extras: framing_extras.to_vec(),
        extras: extras.to_vec(),
        key: key.to_vec(),
        value: value.to_vec(),
    };
    Ok(DecodeOutcome::Complete {
        packet,
        consumed: total,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(packet: &Packet) -> Packet {
        let encoded = encode_packet(packet, DEFAULT_MAX_FRAME_SIZE).unwrap();
        match decode_packet(&encoded, DEFAULT_MAX_FRAME_SIZE).unwrap() {
            DecodeOutcome::Complete { packet, consumed } => {
                assert_eq!(consumed, encoded.len());
                packet
            }
            DecodeOutcome::Incomplete { needed } => {
                panic!("whole frame reported incomplete, needed {}", needed)
            }
        }
    }

    fn get_request() -> Packet {
        let mut p = Packet::request(OP_GET, 12);
        p.opaque = 0xdead_beef;
        p.key = b"k".to_vec();
        p
    }

    #[test]
    fn test_golden_get_request_bytes() {
        let encoded = encode_packet(&get_request(), DEFAULT_MAX_FRAME_SIZE).unwrap();
        assert_eq!(
            encoded.as_ref(),
            &[
                0x80, 0x00, // magic, opcode
                0x00, 0x01, // key length
                0x00, 0x00, // extras length, datatype
                0x00, 0x0c, // partition 12
                0x00, 0x00, 0x00, 0x01, // total body length
                0xde, 0xad, 0xbe, 0xef, // opaque
                0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, // cas
                b'k',
            ]
        );
    }

    #[test]
    fn test_roundtrip_request_with_all_sections() {
        let mut p = Packet::request(OP_SET, 513);
        p.opaque = 42;
        p.cas = 0x0123_4567_89ab_cdef;
        p.datatype = DATATYPE_JSON;
        p.extras = vec![0, 0, 0, 7, 0, 0, 0, 60];
        p.key = b"user::1001".to_vec();
        p.value = br#"{"name":"ada"}"#.to_vec();
        assert_eq!(roundtrip(&p), p);
    }

    #[test]
    fn test_roundtrip_response() {
        let mut p = Packet::response(OP_GET, STATUS_SUCCESS, 7);
        p.cas = 99;
        p.extras = vec![0, 0, 0, 0];
        p.value = b"v".to_vec();
        assert_eq!(roundtrip(&p), p);
    }

    #[test]
    fn test_roundtrip_framed_with_framing_extras() {
        let mut p = Packet {
            magic: Magic::FramedRequest,
            ..Packet::request(OP_SET, 3)
        };
        p.framing_extras = vec![0x22, 0x00, 0x10]; // one framing section
        p.key = b"k".to_vec();
        p.value = b"v".to_vec();
        assert_eq!(roundtrip(&p), p);
    }

    #[test]
    fn test_empty_body_roundtrip() {
        let p = Packet::request(OP_NOOP, 0);
        let encoded = encode_packet(&p, DEFAULT_MAX_FRAME_SIZE).unwrap();
        assert_eq!(encoded.len(), HEADER_SIZE);
        assert_eq!(roundtrip(&p), p);
    }

    #[test]
    fn test_every_prefix_is_incomplete_and_consumes_nothing() {
        let encoded = encode_packet(&get_request(), DEFAULT_MAX_FRAME_SIZE).unwrap();
        for cut in 0..encoded.len() {
            match decode_packet(&encoded[..cut], DEFAULT_MAX_FRAME_SIZE).unwrap() {
                DecodeOutcome::Incomplete { needed } => {
                    assert!(needed > cut, "prefix of {} needs {} more", cut, needed);
                    assert!(needed <= encoded.len());
                }
                DecodeOutcome::Complete { .. } => {
                    panic!("prefix of {} bytes decoded as complete", cut)
                }
            }
        }
    }

    #[test]
    fn test_decode_leaves_trailing_bytes() {
        let mut buf = encode_packet(&get_request(), DEFAULT_MAX_FRAME_SIZE)
            .unwrap()
            .to_vec();
        let frame_len = buf.len();
        buf.extend_from_slice(&[0x81, 0x00, 0x00]); // start of a second frame
        match decode_packet(&buf, DEFAULT_MAX_FRAME_SIZE).unwrap() {
            DecodeOutcome::Complete { consumed, .. } => assert_eq!(consumed, frame_len),
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[test]
    fn test_bad_magic() {
        let mut buf = vec![0u8; HEADER_SIZE];
        buf[0] = 0x55;
        assert!(matches!(
            decode_packet(&buf, DEFAULT_MAX_FRAME_SIZE),
            Err(CodecError::BadMagic(0x55))
        ));
    }

    #[test]
    fn test_frame_too_large_on_decode() {
        let mut buf = vec![0u8; HEADER_SIZE];
        buf[0] = MAGIC_RESPONSE;
        buf[8..12].copy_from_slice(&(64u32 * 1024 * 1024).to_be_bytes());
        assert!(matches!(
            decode_packet(&buf, DEFAULT_MAX_FRAME_SIZE),
            Err(CodecError::FrameTooLarge { .. })
        ));
    }

    #[test]
    fn test_frame_too_large_on_encode() {
        let mut p = Packet::request(OP_SET, 0);
        p.value = vec![0u8; 100];
        assert!(matches!(
            encode_packet(&p, 64),
            Err(CodecError::FrameTooLarge { size: 124, max: 64 })
        ));
    }

    #[test]
    fn test_sections_exceeding_body_are_malformed() {
        let mut buf = vec![0u8; HEADER_SIZE];
        buf[0] = MAGIC_REQUEST;
        buf[2..4].copy_from_slice(&10u16.to_be_bytes()); // key of 10
        buf[8..12].copy_from_slice(&4u32.to_be_bytes()); // body of 4
        assert!(matches!(
            decode_packet(&buf, DEFAULT_MAX_FRAME_SIZE),
            Err(CodecError::Malformed(_))
        ));
    }

    #[test]
    fn test_key_too_long_for_framed_magic() {
        let mut p = Packet {
            magic: Magic::FramedRequest,
            ..Packet::request(OP_GET, 0)
        };
        p.key = vec![b'a'; 300];
        assert!(matches!(
            encode_packet(&p, DEFAULT_MAX_FRAME_SIZE),
            Err(CodecError::KeyTooLong(300))
        ));
    }

    #[test]
    fn test_framing_extras_rejected_on_plain_magic() {
        let mut p = Packet::request(OP_GET, 0);
        p.framing_extras = vec![0x01];
        assert!(matches!(
            encode_packet(&p, DEFAULT_MAX_FRAME_SIZE),
            Err(CodecError::Malformed(_))
        ));
    }
}
