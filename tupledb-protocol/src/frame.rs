//! Binary frame format.
//!
//! Every message travels as a 5-byte length prefix followed by a msgpack
//! body:
//!
//! ```text
//! +--------+------------------+------------------------+
//! | 0xce   | length (u32, BE) | header map + body map  |
//! | 1 byte | 4 bytes          | `length` bytes         |
//! +--------+------------------+------------------------+
//! ```

use crate::error::ProtocolError;
use crate::MAX_FRAME_SIZE;
use bytes::{Buf, Bytes, BytesMut};

/// First byte of every length prefix.
pub const LENGTH_MARKER: u8 = 0xce;

/// Size of the length prefix in bytes.
pub const PACKET_LENGTH_BYTES: usize = 5;

/// Wraps a payload in a length prefix.
pub fn encode(payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(PACKET_LENGTH_BYTES + payload.len());
    buf.push(LENGTH_MARKER);
    buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    buf.extend_from_slice(payload);
    buf
}

/// Splits the next frame body off `buf`.
///
/// Returns `Ok(Some(body))` if a complete frame was buffered, `Ok(None)` if
/// more data is needed, or `Err` on protocol errors.
pub fn decode(buf: &mut BytesMut) -> Result<Option<Bytes>, ProtocolError> {
    if buf.len() < PACKET_LENGTH_BYTES {
        return Ok(None);
    }
    if buf[0] != LENGTH_MARKER {
        return Err(ProtocolError::InvalidMarker(buf[0]));
    }
    let length = u32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]) as usize;
    if length == 0 {
        return Err(ProtocolError::ZeroLength);
    }
    if length > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge {
            size: length,
            max: MAX_FRAME_SIZE,
        });
    }
    if buf.len() < PACKET_LENGTH_BYTES + length {
        return Ok(None);
    }
    buf.advance(PACKET_LENGTH_BYTES);
    Ok(Some(buf.split_to(length).freeze()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_roundtrip() {
        let payload = b"\x82\x00\x01\x01\xce\x00\x00\x00\x07";
        let mut buf = BytesMut::from(&encode(payload)[..]);
        let body = decode(&mut buf).unwrap().unwrap();
        assert_eq!(&body[..], payload);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_incomplete_prefix() {
        let mut buf = BytesMut::from(&[LENGTH_MARKER, 0, 0][..]);
        assert!(decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_incomplete_body() {
        let encoded = encode(b"abcdef");
        let mut buf = BytesMut::from(&encoded[..encoded.len() - 2]);
        assert!(decode(&mut buf).unwrap().is_none());
        // Prefix must survive a partial decode attempt.
        buf.extend_from_slice(&encoded[encoded.len() - 2..]);
        let body = decode(&mut buf).unwrap().unwrap();
        assert_eq!(&body[..], b"abcdef");
    }

    #[test]
    fn test_invalid_marker() {
        let mut buf = BytesMut::from(&[0xd0u8, 0, 0, 0, 1, 0xc0][..]);
        assert!(matches!(
            decode(&mut buf),
            Err(ProtocolError::InvalidMarker(0xd0))
        ));
    }

    #[test]
    fn test_zero_length() {
        let mut buf = BytesMut::from(&[LENGTH_MARKER, 0, 0, 0, 0][..]);
        assert!(matches!(decode(&mut buf), Err(ProtocolError::ZeroLength)));
    }

    #[test]
    fn test_too_large() {
        let length = (MAX_FRAME_SIZE as u32 + 1).to_be_bytes();
        let mut buf = BytesMut::from(
            &[
                LENGTH_MARKER,
                length[0],
                length[1],
                length[2],
                length[3],
            ][..],
        );
        assert!(matches!(
            decode(&mut buf),
            Err(ProtocolError::FrameTooLarge { .. })
        ));
    }

    #[test]
    fn test_multiple_frames_in_buffer() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&encode(b"first"));
        buf.extend_from_slice(&encode(b"second"));

        let one = decode(&mut buf).unwrap().unwrap();
        assert_eq!(&one[..], b"first");
        let two = decode(&mut buf).unwrap().unwrap();
        assert_eq!(&two[..], b"second");
        assert!(decode(&mut buf).unwrap().is_none());
    }

    proptest! {
        #[test]
        fn prop_roundtrip(payload in proptest::collection::vec(any::<u8>(), 1..4096)) {
            let mut buf = BytesMut::from(&encode(&payload)[..]);
            let body = decode(&mut buf).unwrap().unwrap();
            prop_assert_eq!(&body[..], &payload[..]);
            prop_assert!(buf.is_empty());
        }
    }
}
