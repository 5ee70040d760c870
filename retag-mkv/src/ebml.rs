//! EBML primitives: variable-length integers, size denotations and simple
//! element synthesis.
//!
//! EBML identifiers are VLQs whose leading-one marker is *kept* as part of
//! the value (1..4 bytes); data sizes are VLQs whose marker is *cleared*
//! (1..8 bytes). A size whose payload bits are all ones denotes "unknown
//! size", which this engine does not support and rejects as invalid data.

use crate::ids;

use retag_core::error::{Error, Result};
use retag_core::tree::{ElementFormat, Node, RawHeader};

use std::io::{Read, Seek, SeekFrom, Write};

/// Maximum length of an element identifier in bytes.
pub const MAX_ID_LENGTH: u32 = 4;
/// Maximum length of a size denotation in bytes.
pub const MAX_SIZE_LENGTH: u32 = 8;

/// Returns the encoded length in bytes of an identifier (marker included).
pub fn id_length(id: u32) -> u32 {
    (32 - id.leading_zeros()).div_ceil(8).max(1)
}

/// Encodes an identifier verbatim (big-endian, leading zero bytes dropped).
pub fn encode_id(id: u32) -> ([u8; 4], usize) {
    let len = id_length(id) as usize;
    let bytes = id.to_be_bytes();
    let mut out = [0u8; 4];
    out[..len].copy_from_slice(&bytes[4 - len..]);
    (out, len)
}

/// Writes an identifier to `out`.
pub fn write_id<W: Write + ?Sized>(out: &mut W, id: u32) -> Result<usize> {
    let (bytes, len) = encode_id(id);
    out.write_all(&bytes[..len])?;
    Ok(len)
}

/// Reads an element identifier, marker bits kept.
///
/// Returns the identifier and its encoded length.
pub fn read_id<R: Read + ?Sized>(reader: &mut R) -> Result<(u32, u32)> {
    let mut first = [0u8; 1];
    reader.read_exact(&mut first)?;
    if first[0] == 0 {
        return Err(Error::InvalidData(
            "EBML identifier lacks its leading-one marker".into(),
        ));
    }
    let length = first[0].leading_zeros() + 1;
    if length > MAX_ID_LENGTH {
        return Err(Error::InvalidData(format!(
            "EBML identifier of {} bytes exceeds the supported maximum of {}",
            length, MAX_ID_LENGTH
        )));
    }
    let mut value = u32::from(first[0]);
    for _ in 1..length {
        let mut byte = [0u8; 1];
        reader.read_exact(&mut byte)?;
        value = (value << 8) | u32::from(byte[0]);
    }
    Ok((value, length))
}

/// Reads a size denotation, marker bit cleared.
///
/// Returns the size and its encoded length. An all-ones payload (the
/// "unknown size" denotation) is rejected.
pub fn read_size<R: Read + ?Sized>(reader: &mut R) -> Result<(u64, u32)> {
    let mut first = [0u8; 1];
    reader.read_exact(&mut first)?;
    if first[0] == 0 {
        return Err(Error::InvalidData(
            "EBML size denotation lacks its leading-one marker".into(),
        ));
    }
    let length = first[0].leading_zeros() + 1;
    if length > MAX_SIZE_LENGTH {
        return Err(Error::InvalidData(format!(
            "EBML size denotation of {} bytes exceeds the supported maximum of {}",
            length, MAX_SIZE_LENGTH
        )));
    }
    let mask = (0xFFu32 >> length) as u8;
    let mut value = u64::from(first[0] & mask);
    for _ in 1..length {
        let mut byte = [0u8; 1];
        reader.read_exact(&mut byte)?;
        value = (value << 8) | u64::from(byte[0]);
    }
    // All payload bits set denotes "unknown size".
    if value == (1u64 << (7 * length)) - 1 {
        return Err(Error::InvalidData(
            "elements of unknown size are not supported".into(),
        ));
    }
    Ok((value, length))
}

/// Returns the minimum length in bytes of the size denotation for `value`.
pub fn size_denotation_length(value: u64) -> u32 {
    for length in 1..=7u32 {
        // The all-ones payload per length is reserved for "unknown size".
        if value < (1u64 << (7 * length)) - 1 {
            return length;
        }
    }
    8
}

/// Encodes a size denotation.
///
/// The minimum length is used unless `forced_length` is given. Fails with
/// `InvalidData` when the value does not fit the forced length.
pub fn encode_size(value: u64, forced_length: Option<u32>) -> Result<([u8; 8], usize)> {
    let length = match forced_length {
        Some(length) => {
            if !(1..=MAX_SIZE_LENGTH).contains(&length) || size_denotation_length(value) > length {
                return Err(Error::InvalidData(format!(
                    "size {} does not fit a {}-byte denotation",
                    value, length
                )));
            }
            length
        }
        None => size_denotation_length(value),
    };
    let mut bytes = [0u8; 8];
    let mut v = value;
    for i in (0..length as usize).rev() {
        bytes[i] = (v & 0xFF) as u8;
        v >>= 8;
    }
    bytes[0] |= 1 << (8 - length);
    Ok((bytes, length as usize))
}

/// Writes a size denotation of minimum length.
pub fn write_size<W: Write + ?Sized>(out: &mut W, value: u64) -> Result<usize> {
    let (bytes, len) = encode_size(value, None)?;
    out.write_all(&bytes[..len])?;
    Ok(len)
}

/// Returns the content length in bytes of an unsigned integer element.
pub fn uinteger_length(value: u64) -> u32 {
    (64 - value.leading_zeros()).div_ceil(8).max(1)
}

/// Encodes an unsigned integer padded with leading zeros to `width` bytes.
///
/// Fails when the value needs more bytes than `width`.
pub fn encode_uint_padded(value: u64, width: u32) -> Result<[u8; 8]> {
    if uinteger_length(value) > width {
        return Err(Error::InvalidData(format!(
            "value {} does not fit {} bytes",
            value, width
        )));
    }
    let mut out = [0u8; 8];
    let bytes = value.to_be_bytes();
    out[..width as usize].copy_from_slice(&bytes[8 - width as usize..]);
    Ok(out)
}

/// Writes a simple element holding an unsigned integer of minimum length.
///
/// Returns the total number of bytes written.
pub fn make_uint<W: Write + ?Sized>(out: &mut W, id: u32, value: u64) -> Result<u64> {
    let id_len = write_id(out, id)?;
    let content_len = uinteger_length(value) as usize;
    out.write_all(&[0x80 | content_len as u8])?;
    out.write_all(&value.to_be_bytes()[8 - content_len..])?;
    Ok((id_len + 1 + content_len) as u64)
}

/// Writes a simple element holding raw bytes.
pub fn make_binary<W: Write + ?Sized>(out: &mut W, id: u32, data: &[u8]) -> Result<u64> {
    let id_len = write_id(out, id)?;
    let size_len = write_size(out, data.len() as u64)?;
    out.write_all(data)?;
    Ok((id_len + size_len + data.len()) as u64)
}

/// Writes a simple element holding a UTF-8 string.
pub fn make_string<W: Write + ?Sized>(out: &mut W, id: u32, value: &str) -> Result<u64> {
    make_binary(out, id, value.as_bytes())
}

/// Total encoded size of a simple unsigned integer element.
pub fn uint_element_size(id: u32, value: u64) -> u64 {
    u64::from(id_length(id)) + 1 + u64::from(uinteger_length(value))
}

/// Total encoded size of a simple string or binary element.
pub fn binary_element_size(id: u32, content_len: u64) -> u64 {
    u64::from(id_length(id)) + u64::from(size_denotation_length(content_len)) + content_len
}

/// Reads an unsigned integer from element data (big-endian, up to 8 bytes).
pub fn parse_uint(data: &[u8]) -> Result<u64> {
    if data.len() > 8 {
        return Err(Error::InvalidData(format!(
            "unsigned integer of {} bytes is too wide",
            data.len()
        )));
    }
    let mut value = 0u64;
    for &byte in data {
        value = (value << 8) | u64::from(byte);
    }
    Ok(value)
}

/// Reads a signed integer from element data (big-endian, sign-extended).
pub fn parse_int(data: &[u8]) -> Result<i64> {
    if data.len() > 8 {
        return Err(Error::InvalidData(format!(
            "signed integer of {} bytes is too wide",
            data.len()
        )));
    }
    if data.is_empty() {
        return Ok(0);
    }
    let mut value: i64 = if data[0] & 0x80 != 0 { -1 } else { 0 };
    for &byte in data {
        value = (value << 8) | i64::from(byte);
    }
    Ok(value)
}

/// Reads a float from element data (IEEE-754 big-endian, 4 or 8 bytes).
pub fn parse_float(data: &[u8]) -> Result<f64> {
    match data.len() {
        0 => Ok(0.0),
        4 => Ok(f64::from(f32::from_bits(u32::from_be_bytes(
            data.try_into().unwrap(),
        )))),
        8 => Ok(f64::from_bits(u64::from_be_bytes(data.try_into().unwrap()))),
        n => Err(Error::InvalidData(format!(
            "float element of {} bytes (expected 4 or 8)",
            n
        ))),
    }
}

/// Reads a UTF-8 string from element data, stopping at a null terminator.
pub fn parse_string(data: &[u8]) -> Result<String> {
    let end = data.iter().position(|&b| b == 0).unwrap_or(data.len());
    String::from_utf8(data[..end].to_vec())
        .map_err(|e| Error::Conversion(format!("invalid UTF-8 string: {}", e)))
}

/// The EBML decoder for the generic element tree.
pub struct EbmlFormat;

impl ElementFormat for EbmlFormat {
    type Id = u32;
    const MAX_ID_LENGTH: u32 = MAX_ID_LENGTH;
    const MAX_SIZE_LENGTH: u32 = MAX_SIZE_LENGTH;

    fn read_header<R: Read + Seek + ?Sized>(
        io: &mut R,
        start_offset: u64,
        max_size: u64,
    ) -> Result<RawHeader<u32>> {
        if max_size < 2 {
            return Err(Error::TruncatedData(format!(
                "no room for an EBML element header at {}",
                start_offset
            )));
        }
        io.seek(SeekFrom::Start(start_offset))?;
        let (id, id_length) = read_id(io)?;
        if u64::from(id_length) >= max_size {
            return Err(Error::TruncatedData(format!(
                "EBML element header at {} is cut off",
                start_offset
            )));
        }
        let (data_size, size_length) = read_size(io)?;
        Ok(RawHeader {
            id,
            id_length,
            size_length,
            data_size,
        })
    }

    fn is_parent(node: &Node<u32>) -> bool {
        ids::is_master(node.id())
    }

    fn is_padding(node: &Node<u32>) -> bool {
        node.id() == ids::VOID
    }

    fn first_child_offset(node: &Node<u32>) -> u64 {
        u64::from(node.header_size())
    }

    fn id_to_string(id: u32) -> String {
        format!("0x{:X}", id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_id_length() {
        assert_eq!(id_length(0xEC), 1);
        assert_eq!(id_length(0x4DBB), 2);
        assert_eq!(id_length(0x2AD7B1), 3);
        assert_eq!(id_length(0x1A45DFA3), 4);
    }

    #[test]
    fn test_read_id() {
        let mut cursor = Cursor::new(vec![0x1A, 0x45, 0xDF, 0xA3]);
        assert_eq!(read_id(&mut cursor).unwrap(), (0x1A45DFA3, 4));

        let mut cursor = Cursor::new(vec![0xEC]);
        assert_eq!(read_id(&mut cursor).unwrap(), (0xEC, 1));
    }

    #[test]
    fn test_read_id_rejects_missing_marker() {
        let mut cursor = Cursor::new(vec![0x00, 0x80]);
        assert!(matches!(
            read_id(&mut cursor),
            Err(Error::InvalidData(_))
        ));
    }

    #[test]
    fn test_size_roundtrip() {
        for value in [0u64, 1, 126, 127, 128, 16382, 16383, 1_000_000, 0xFF_FFFF] {
            for forced in [None, Some(8)] {
                let (bytes, len) = encode_size(value, forced).unwrap();
                let mut cursor = Cursor::new(bytes[..len].to_vec());
                let (decoded, decoded_len) = read_size(&mut cursor).unwrap();
                assert_eq!(decoded, value, "value {} failed roundtrip", value);
                assert_eq!(decoded_len as usize, len);
            }
        }
    }

    #[test]
    fn test_size_denotation_length_boundaries() {
        assert_eq!(size_denotation_length(0), 1);
        assert_eq!(size_denotation_length(0x7E), 1);
        // 0x7F is the 1-byte unknown-size payload, so 0x7F needs 2 bytes.
        assert_eq!(size_denotation_length(0x7F), 2);
        assert_eq!(size_denotation_length(0x3FFE), 2);
        assert_eq!(size_denotation_length(0x3FFF), 3);
    }

    #[test]
    fn test_unknown_size_rejected() {
        for buf in [vec![0xFFu8], vec![0x7F, 0xFF], vec![0x01; 8]] {
            let mut cursor = Cursor::new(buf.clone());
            let result = read_size(&mut cursor);
            if buf == vec![0x01; 8] {
                // 8-byte denotation with non-all-ones payload is fine.
                assert!(result.is_ok());
            } else {
                assert!(matches!(result, Err(Error::InvalidData(_))));
            }
        }
    }

    #[test]
    fn test_forced_size_too_small() {
        assert!(encode_size(0x4000, Some(1)).is_err());
    }

    #[test]
    fn test_uinteger_length() {
        assert_eq!(uinteger_length(0), 1);
        assert_eq!(uinteger_length(0xFF), 1);
        assert_eq!(uinteger_length(0x100), 2);
        assert_eq!(uinteger_length(u64::MAX), 8);
    }

    #[test]
    fn test_make_uint() {
        let mut out = Vec::new();
        let written = make_uint(&mut out, ids::CUE_TIME, 0x1234).unwrap();
        assert_eq!(out, vec![0xB3, 0x82, 0x12, 0x34]);
        assert_eq!(written, 4);
        assert_eq!(uint_element_size(ids::CUE_TIME, 0x1234), 4);
    }

    #[test]
    fn test_make_string() {
        let mut out = Vec::new();
        make_string(&mut out, ids::DOC_TYPE, "matroska").unwrap();
        assert_eq!(out[..2], [0x42, 0x82]);
        assert_eq!(out[2], 0x88);
        assert_eq!(&out[3..], b"matroska");
    }

    #[test]
    fn test_parse_values() {
        assert_eq!(parse_uint(&[0x01, 0x00]).unwrap(), 256);
        assert_eq!(parse_int(&[0xFF]).unwrap(), -1);
        assert_eq!(parse_int(&[0x00, 0x80]).unwrap(), 128);
        assert_eq!(parse_float(&1.5f32.to_bits().to_be_bytes()).unwrap(), 1.5);
        assert_eq!(parse_float(&2.5f64.to_bits().to_be_bytes()).unwrap(), 2.5);
        assert!(parse_float(&[0; 3]).is_err());
        assert_eq!(parse_string(b"abc\x00def").unwrap(), "abc");
    }

    #[test]
    fn test_encode_uint_padded() {
        let bytes = encode_uint_padded(0x1234, 4).unwrap();
        assert_eq!(&bytes[..4], &[0x00, 0x00, 0x12, 0x34]);
        assert!(encode_uint_padded(0x12345, 2).is_err());
    }

    #[test]
    fn test_header_roundtrip_through_format() {
        use retag_core::tree::Tree;

        // Segment element with 3 bytes of (opaque) data plus a Void sibling.
        let mut data = Vec::new();
        write_id(&mut data, ids::SIMPLE_BLOCK).unwrap();
        write_size(&mut data, 3).unwrap();
        data.extend_from_slice(&[1, 2, 3]);
        write_id(&mut data, ids::VOID).unwrap();
        write_size(&mut data, 2).unwrap();
        data.extend_from_slice(&[0, 0]);

        let mut io = Cursor::new(data.clone());
        let mut tree: Tree<EbmlFormat> = Tree::new(0, data.len() as u64);
        let root = tree.root();
        tree.parse(root, &mut io).unwrap();
        assert_eq!(tree.node(root).id(), ids::SIMPLE_BLOCK);
        assert_eq!(tree.node(root).data_size(), 3);

        let void = tree.next_sibling(root).unwrap();
        tree.parse(void, &mut io).unwrap();
        assert_eq!(tree.node(void).id(), ids::VOID);
        assert!(EbmlFormat::is_padding(tree.node(void)));
    }
}
