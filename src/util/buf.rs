use anyhow::{anyhow, bail};
use bytes::{Buf, BufMut};
use bytes_varint::try_get_fixed::TryGetFixedSupport;
use uuid::Uuid;

use crate::transport::constants::OperationalEncoding;

/// Writes a GUID in Microsoft RPC byte order: the first three fields
///  little-endian, the remaining eight bytes as-is. This is the order STTP
///  mandates on the wire so that all implementations interoperate bit-exactly.
pub fn put_guid(buf: &mut impl BufMut, guid: Uuid) {
    buf.put_slice(&guid.to_bytes_le());
}

pub fn try_get_guid(buf: &mut impl Buf) -> anyhow::Result<Uuid> {
    if buf.remaining() < 16 {
        bail!("buffer underflow reading GUID");
    }
    let mut raw = [0u8; 16];
    buf.copy_to_slice(&mut raw);
    Ok(Uuid::from_bytes_le(raw))
}

/// Encodes a string in the negotiated session encoding, without a length prefix.
pub fn encode_str(s: &str, encoding: OperationalEncoding) -> Vec<u8> {
    match encoding {
        OperationalEncoding::Utf8 => s.as_bytes().to_vec(),
        OperationalEncoding::Utf16Le => s.encode_utf16().flat_map(|unit| unit.to_le_bytes()).collect(),
    }
}

pub fn decode_str(raw: &[u8], encoding: OperationalEncoding) -> anyhow::Result<String> {
    match encoding {
        OperationalEncoding::Utf8 => Ok(String::from_utf8(raw.to_vec())?),
        OperationalEncoding::Utf16Le => {
            if raw.len() % 2 != 0 {
                bail!("UTF-16 string payload has odd byte length {}", raw.len());
            }
            let units: Vec<u16> = raw.chunks_exact(2)
                .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
                .collect();
            String::from_utf16(&units).map_err(|e| anyhow!("invalid UTF-16 string payload: {}", e))
        }
    }
}

/// Strings embedded in larger structures are length-prefixed with a u32 byte
///  count in the negotiated encoding.
pub fn put_string(buf: &mut impl BufMut, s: &str, encoding: OperationalEncoding) {
    let raw = encode_str(s, encoding);
    buf.put_u32(raw.len() as u32);
    buf.put_slice(&raw);
}

pub fn try_get_string(buf: &mut impl Buf, encoding: OperationalEncoding) -> anyhow::Result<String> {
    let len = buf.try_get_u32()? as usize;
    if buf.remaining() < len {
        bail!("buffer underflow reading string of {} bytes", len);
    }
    let mut raw = vec![0u8; len];
    buf.copy_to_slice(&mut raw);
    decode_str(&raw, encoding)
}

#[cfg(test)]
mod test {
    use bytes::BytesMut;
    use rstest::rstest;

    use super::*;

    #[test]
    fn test_guid_round_trip() {
        for _ in 0..100 {
            let guid = Uuid::new_v4();
            let mut buf = BytesMut::new();
            put_guid(&mut buf, guid);
            assert_eq!(buf.len(), 16);
            assert_eq!(try_get_guid(&mut buf.freeze()).unwrap(), guid);
        }
    }

    #[test]
    fn test_guid_rpc_byte_order() {
        let guid = Uuid::parse_str("00112233-4455-6677-8899-aabbccddeeff").unwrap();
        let mut buf = BytesMut::new();
        put_guid(&mut buf, guid);
        // first three fields little-endian, trailing eight bytes verbatim
        assert_eq!(&buf[..], &[
            0x33, 0x22, 0x11, 0x00,
            0x55, 0x44,
            0x77, 0x66,
            0x88, 0x99, 0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff,
        ]);
    }

    #[rstest]
    #[case::utf8_ascii(OperationalEncoding::Utf8, "PPA:1", 9)]
    #[case::utf8_multibyte(OperationalEncoding::Utf8, "größe", 11)]
    #[case::utf16(OperationalEncoding::Utf16Le, "PPA:1", 14)]
    #[case::utf16_empty(OperationalEncoding::Utf16Le, "", 4)]
    fn test_string_round_trip(#[case] encoding: OperationalEncoding, #[case] s: &str, #[case] expected_len: usize) {
        let mut buf = BytesMut::new();
        put_string(&mut buf, s, encoding);
        assert_eq!(buf.len(), expected_len);
        assert_eq!(try_get_string(&mut buf.freeze(), encoding).unwrap(), s);
    }

    #[test]
    fn test_string_underflow() {
        let mut buf: &[u8] = &[0, 0, 0, 9, b'x'];
        assert!(try_get_string(&mut buf, OperationalEncoding::Utf8).is_err());
    }

    #[test]
    fn test_utf16_odd_length_rejected() {
        assert!(decode_str(&[0x41, 0x00, 0x42], OperationalEncoding::Utf16Le).is_err());
    }
}
