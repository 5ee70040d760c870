//! Binary stream primitives.
//!
//! Extension traits over `Read + Seek` / `Write + Seek` for the integer,
//! fixed-point and string encodings used by the supported containers, a
//! buffered copy helper with abort/progress support, and the CRC-32 (IEEE)
//! checksum used by Matroska.

use crate::error::{Error, Result};
use crate::progress::Progress;

use byteorder::{BigEndian, LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Seek, SeekFrom, Write};

/// Buffer size for stream-to-stream copies.
const COPY_BUFFER_SIZE: usize = 0x2000;

/// Extra read operations over a seekable byte stream.
pub trait ReadSeekExt: Read + Seek {
    /// Returns the total length of the stream, restoring the current position.
    fn stream_len(&mut self) -> Result<u64> {
        let pos = self.stream_position()?;
        let len = self.seek(SeekFrom::End(0))?;
        self.seek(SeekFrom::Start(pos))?;
        Ok(len)
    }

    /// Reads exactly `len` bytes into a fresh vector.
    fn read_bytes_exact(&mut self, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.read_exact(&mut buf).map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                Error::TruncatedData(format!("expected {} more bytes", len))
            } else {
                Error::Io(e)
            }
        })?;
        Ok(buf)
    }

    /// Reads a big-endian unsigned integer of `width` bytes (1..=8).
    fn read_uint_be(&mut self, width: usize) -> Result<u64> {
        debug_assert!(width >= 1 && width <= 8);
        let mut value = 0u64;
        for _ in 0..width {
            value = (value << 8) | u64::from(self.read_u8()?);
        }
        Ok(value)
    }

    /// Reads a 16.16 fixed-point value (big-endian).
    fn read_fixed_16_16(&mut self) -> Result<f64> {
        let raw = self.read_u32::<BigEndian>()?;
        Ok(f64::from(raw) / 65536.0)
    }

    /// Reads an 8.8 fixed-point value (big-endian).
    fn read_fixed_8_8(&mut self) -> Result<f64> {
        let raw = self.read_u16::<BigEndian>()?;
        Ok(f64::from(raw) / 256.0)
    }

    /// Reads a string of `len` bytes, stopping at a null terminator if one
    /// is present inside the range.
    fn read_sized_string(&mut self, len: usize) -> Result<String> {
        let data = self.read_bytes_exact(len)?;
        let end = data.iter().position(|&b| b == 0).unwrap_or(data.len());
        String::from_utf8(data[..end].to_vec())
            .map_err(|e| Error::Conversion(format!("invalid UTF-8 string: {}", e)))
    }

    /// Reads a null-terminated string, consuming at most `max` bytes.
    fn read_terminated_string(&mut self, max: u64) -> Result<String> {
        let mut data = Vec::new();
        let mut remaining = max;
        while remaining > 0 {
            let byte = self.read_u8()?;
            remaining -= 1;
            if byte == 0 {
                break;
            }
            data.push(byte);
        }
        String::from_utf8(data).map_err(|e| Error::Conversion(format!("invalid UTF-8 string: {}", e)))
    }

    /// Computes the CRC-32 of the next `len` bytes of the stream.
    fn read_crc32(&mut self, len: u64) -> Result<u32> {
        let mut hasher = Crc32::new();
        let mut buf = [0u8; COPY_BUFFER_SIZE];
        let mut remaining = len;
        while remaining > 0 {
            let chunk = remaining.min(COPY_BUFFER_SIZE as u64) as usize;
            self.read_exact(&mut buf[..chunk]).map_err(|e| {
                if e.kind() == std::io::ErrorKind::UnexpectedEof {
                    Error::TruncatedData(format!("CRC-32 region short by {} bytes", remaining))
                } else {
                    Error::Io(e)
                }
            })?;
            hasher.update(&buf[..chunk]);
            remaining -= chunk as u64;
        }
        Ok(hasher.finalize())
    }
}

impl<T: Read + Seek + ?Sized> ReadSeekExt for T {}

/// Extra write operations over a byte stream.
pub trait WriteExt: Write {
    /// Writes a big-endian unsigned integer using exactly `width` bytes.
    ///
    /// Fails with `InvalidData` when the value does not fit the width.
    fn write_uint_be(&mut self, value: u64, width: usize) -> Result<()> {
        debug_assert!(width >= 1 && width <= 8);
        if width < 8 && value >= 1u64 << (8 * width) {
            return Err(Error::InvalidData(format!(
                "value {} does not fit {} bytes",
                value, width
            )));
        }
        let bytes = value.to_be_bytes();
        self.write_all(&bytes[8 - width..])?;
        Ok(())
    }

    /// Writes a u32 little-endian (CRC-32 fields are stored this way).
    fn write_u32_le(&mut self, value: u32) -> Result<()> {
        WriteBytesExt::write_u32::<LittleEndian>(self, value)?;
        Ok(())
    }
}

impl<T: Write + ?Sized> WriteExt for T {}

/// Copies `len` bytes from `src` to `dst` through a fixed-size buffer.
///
/// The abort flag is polled once per buffer and the percentage of the copy
/// is reported through `progress`. Raises `OperationAborted` when cancelled.
pub fn copy_range<R, W>(src: &mut R, dst: &mut W, len: u64, progress: &Progress) -> Result<()>
where
    R: Read + ?Sized,
    W: Write + ?Sized,
{
    let mut buf = [0u8; COPY_BUFFER_SIZE];
    let mut copied = 0u64;
    while copied < len {
        progress.check_aborted()?;
        let chunk = (len - copied).min(COPY_BUFFER_SIZE as u64) as usize;
        src.read_exact(&mut buf[..chunk]).map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                Error::TruncatedData(format!("copy short by {} bytes", len - copied))
            } else {
                Error::Io(e)
            }
        })?;
        dst.write_all(&buf[..chunk])?;
        copied += chunk as u64;
        progress.report_ratio(copied, len);
    }
    Ok(())
}

/// Streaming CRC-32 hasher (IEEE polynomial, reflected).
#[derive(Debug, Clone)]
pub struct Crc32 {
    state: u32,
}

impl Crc32 {
    /// Creates a hasher in its initial state.
    pub fn new() -> Self {
        Self { state: 0xFFFF_FFFF }
    }

    /// Feeds `data` into the checksum.
    pub fn update(&mut self, data: &[u8]) {
        let mut crc = self.state;
        for &byte in data {
            let idx = ((crc ^ u32::from(byte)) & 0xFF) as usize;
            crc = CRC_TABLE[idx] ^ (crc >> 8);
        }
        self.state = crc;
    }

    /// Returns the final checksum value.
    pub fn finalize(&self) -> u32 {
        self.state ^ 0xFFFF_FFFF
    }
}

impl Default for Crc32 {
    fn default() -> Self {
        Self::new()
    }
}

/// Computes the CRC-32 of `data` in one shot.
pub fn crc32(data: &[u8]) -> u32 {
    let mut hasher = Crc32::new();
    hasher.update(data);
    hasher.finalize()
}

/// CRC-32 lookup table.
const CRC_TABLE: [u32; 256] = {
    let mut table = [0u32; 256];
    let mut n = 0;
    while n < 256 {
        let mut c = n as u32;
        let mut k = 0;
        while k < 8 {
            if c & 1 != 0 {
                c = 0xEDB8_8320 ^ (c >> 1);
            } else {
                c >>= 1;
            }
            k += 1;
        }
        table[n] = c;
        n += 1;
    }
    table
};

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_read_uint_be() {
        let data = [0x01, 0x02, 0x03, 0x04];
        let mut cursor = Cursor::new(&data);
        assert_eq!(cursor.read_uint_be(4).unwrap(), 0x01020304);

        let mut cursor = Cursor::new(&data);
        assert_eq!(cursor.read_uint_be(1).unwrap(), 0x01);
    }

    #[test]
    fn test_write_uint_be_width() {
        let mut buf = Vec::new();
        buf.write_uint_be(0x0102, 3).unwrap();
        assert_eq!(buf, [0x00, 0x01, 0x02]);

        let mut buf = Vec::new();
        assert!(buf.write_uint_be(0x0102, 1).is_err());
    }

    #[test]
    fn test_read_sized_string() {
        let mut cursor = Cursor::new(b"hello\x00world".to_vec());
        assert_eq!(cursor.read_sized_string(11).unwrap(), "hello");

        let mut cursor = Cursor::new(b"hello".to_vec());
        assert_eq!(cursor.read_sized_string(5).unwrap(), "hello");
    }

    #[test]
    fn test_read_terminated_string() {
        let mut cursor = Cursor::new(b"abc\x00def".to_vec());
        assert_eq!(cursor.read_terminated_string(7).unwrap(), "abc");
        // Cursor stops right after the terminator.
        assert_eq!(cursor.position(), 4);
    }

    #[test]
    fn test_fixed_point() {
        let mut cursor = Cursor::new(0x0001_8000u32.to_be_bytes().to_vec());
        assert_eq!(cursor.read_fixed_16_16().unwrap(), 1.5);

        let mut cursor = Cursor::new(0x0180u16.to_be_bytes().to_vec());
        assert_eq!(cursor.read_fixed_8_8().unwrap(), 1.5);
    }

    #[test]
    fn test_crc32_known_vector() {
        // Standard check value for CRC-32/ISO-HDLC.
        assert_eq!(crc32(b"123456789"), 0xCBF43926);
        assert_eq!(crc32(b""), 0);
    }

    #[test]
    fn test_crc32_streaming_matches_one_shot() {
        let data = b"the quick brown fox jumps over the lazy dog";
        let mut hasher = Crc32::new();
        hasher.update(&data[..10]);
        hasher.update(&data[10..]);
        assert_eq!(hasher.finalize(), crc32(data));
    }

    #[test]
    fn test_read_crc32_from_stream() {
        let mut cursor = Cursor::new(b"123456789".to_vec());
        assert_eq!(cursor.read_crc32(9).unwrap(), 0xCBF43926);
    }

    #[test]
    fn test_copy_range() {
        let data: Vec<u8> = (0..=255).cycle().take(0x5000).collect();
        let mut src = Cursor::new(data.clone());
        let mut dst = Vec::new();
        copy_range(&mut src, &mut dst, 0x5000, &Progress::default()).unwrap();
        assert_eq!(dst, data);
    }

    #[test]
    fn test_copy_range_truncated() {
        let mut src = Cursor::new(vec![0u8; 10]);
        let mut dst = Vec::new();
        let err = copy_range(&mut src, &mut dst, 20, &Progress::default()).unwrap_err();
        assert!(matches!(err, Error::TruncatedData(_)));
    }

    #[test]
    fn test_copy_range_aborted() {
        let progress = Progress::default();
        progress.abort_handle().abort();
        let mut src = Cursor::new(vec![0u8; 10]);
        let mut dst = Vec::new();
        let err = copy_range(&mut src, &mut dst, 10, &progress).unwrap_err();
        assert!(matches!(err, Error::OperationAborted));
    }
}
