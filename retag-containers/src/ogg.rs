//! OGG page parsing and logical-stream iteration.
//!
//! An OGG bitstream is physically framed into pages, each carrying up to
//! 255 segments of up to 255 bytes. [`OggIterator`] exposes a continuous
//! logical byte stream over that framing: reads walk across segment and
//! page boundaries, skipping page headers, optionally filtered to one
//! logical stream by its serial number.

use retag_core::error::{Error, Result};

use bitflags::bitflags;
use byteorder::{LittleEndian, ReadBytesExt};
use std::io::{Read, Seek, SeekFrom};

/// Capture pattern at the start of every page.
pub const PAGE_MARKER: [u8; 4] = *b"OggS";

/// Size of the fixed part of a page header (up to the segment table).
pub const PAGE_HEADER_SIZE: u64 = 27;

bitflags! {
    /// Header-type flags of a page.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageFlags: u8 {
        /// The first packet of this page continues a packet of the
        /// previous page.
        const CONTINUED = 0x01;
        /// First page of the logical bitstream.
        const FIRST = 0x02;
        /// Last page of the logical bitstream.
        const LAST = 0x04;
    }
}

/// One parsed OGG page header.
#[derive(Debug, Clone)]
pub struct OggPage {
    /// Absolute start offset of the page.
    pub start_offset: u64,
    /// Header size including the segment table.
    pub header_size: u64,
    /// Stream structure version (always 0).
    pub version: u8,
    /// Header-type flags.
    pub flags: PageFlags,
    /// Granule position.
    pub granule_position: u64,
    /// Serial number of the logical bitstream.
    pub serial: u32,
    /// Page sequence number.
    pub sequence: u32,
    /// CRC-32 checksum stored in the header.
    pub checksum: u32,
    /// Sizes of the segments on this page (each 0..=255).
    pub segment_sizes: Vec<u8>,
}

impl OggPage {
    /// Parses a page header at `start_offset`; at most `max_size` bytes
    /// belong to the stream.
    pub fn parse_header<R: Read + Seek + ?Sized>(
        io: &mut R,
        start_offset: u64,
        max_size: u64,
    ) -> Result<Self> {
        if max_size < PAGE_HEADER_SIZE {
            return Err(Error::TruncatedData(format!(
                "no room for an OGG page header at {}",
                start_offset
            )));
        }
        io.seek(SeekFrom::Start(start_offset))?;
        let mut marker = [0u8; 4];
        io.read_exact(&mut marker)?;
        if marker != PAGE_MARKER {
            return Err(Error::InvalidData(format!(
                "OGG page at {} lacks the \"OggS\" capture pattern",
                start_offset
            )));
        }
        let version = io.read_u8()?;
        if version != 0 {
            return Err(Error::InvalidData(format!(
                "unsupported OGG stream structure version {}",
                version
            )));
        }
        let raw_flags = io.read_u8()?;
        let flags = PageFlags::from_bits(raw_flags).ok_or_else(|| {
            Error::InvalidData(format!("invalid OGG header-type flags 0x{:02X}", raw_flags))
        })?;
        let granule_position = io.read_u64::<LittleEndian>()?;
        let serial = io.read_u32::<LittleEndian>()?;
        let sequence = io.read_u32::<LittleEndian>()?;
        let checksum = io.read_u32::<LittleEndian>()?;
        let segment_count = io.read_u8()?;
        if max_size < PAGE_HEADER_SIZE + u64::from(segment_count) {
            return Err(Error::TruncatedData(format!(
                "OGG page segment table at {} is cut off",
                start_offset
            )));
        }
        let mut segment_sizes = vec![0u8; usize::from(segment_count)];
        io.read_exact(&mut segment_sizes)?;
        Ok(Self {
            start_offset,
            header_size: PAGE_HEADER_SIZE + u64::from(segment_count),
            version,
            flags,
            granule_position,
            serial,
            sequence,
            checksum,
            segment_sizes,
        })
    }

    /// Total payload size of the page.
    pub fn data_size(&self) -> u64 {
        self.segment_sizes.iter().map(|&s| u64::from(s)).sum()
    }

    /// Total size of the page including its header.
    pub fn total_size(&self) -> u64 {
        self.header_size + self.data_size()
    }

    /// Absolute offset of the given segment's payload.
    pub fn data_offset(&self, segment_index: usize) -> u64 {
        self.start_offset
            + self.header_size
            + self.segment_sizes[..segment_index]
                .iter()
                .map(|&s| u64::from(s))
                .sum::<u64>()
    }
}

/// Cursor over the segments of an OGG bitstream.
///
/// A freshly constructed iterator is invalid; call [`reset`](Self::reset)
/// to position it at the first matching segment. Pages are fetched and
/// cached lazily, so `pages` always holds a prefix of the physical page
/// sequence.
pub struct OggIterator<'a, R: Read + Seek> {
    stream: &'a mut R,
    start_offset: u64,
    stream_size: u64,
    pages: Vec<OggPage>,
    page: usize,
    segment: usize,
    offset: u64,
    bytes_read: u64,
    filter: Option<u32>,
}

impl<'a, R: Read + Seek> OggIterator<'a, R> {
    /// Creates an iterator over `stream[start_offset..start_offset + size]`.
    pub fn new(stream: &'a mut R, start_offset: u64, stream_size: u64) -> Self {
        Self {
            stream,
            start_offset,
            stream_size,
            pages: Vec::new(),
            page: 0,
            segment: 0,
            offset: 0,
            bytes_read: 0,
            filter: None,
        }
    }

    /// Restricts iteration to pages with the given stream serial.
    pub fn set_filter(&mut self, serial: Option<u32>) {
        self.filter = serial;
    }

    /// The pages fetched so far (a prefix of the physical sequence).
    pub fn pages(&self) -> &[OggPage] {
        &self.pages
    }

    /// Whether the iterator points at a valid page.
    pub fn is_valid(&self) -> bool {
        self.page < self.pages.len()
    }

    /// The page the iterator currently points at.
    pub fn current_page(&self) -> Option<&OggPage> {
        self.pages.get(self.page)
    }

    /// Index of the current segment within the current page.
    pub fn current_segment_index(&self) -> usize {
        self.segment
    }

    /// Size of the current segment.
    pub fn current_segment_size(&self) -> u64 {
        u64::from(self.pages[self.page].segment_sizes[self.segment])
    }

    /// Absolute offset of the next byte [`read`](Self::read) would return.
    pub fn current_character_offset(&self) -> u64 {
        self.offset + self.bytes_read
    }

    fn matches_filter(&self, page: &OggPage) -> bool {
        self.filter.map_or(true, |serial| page.serial == serial)
    }

    /// Returns `(payload offset, segment count)` of the page at `index`
    /// when it is non-empty and matches the filter.
    fn usable_page(&self, index: usize) -> Option<(u64, usize)> {
        let page = &self.pages[index];
        if !page.segment_sizes.is_empty() && self.matches_filter(page) {
            Some((
                page.start_offset + page.header_size,
                page.segment_sizes.len(),
            ))
        } else {
            None
        }
    }

    /// Positions the cursor at the first segment of the first non-empty
    /// page matching the filter. Leaves the iterator invalid when no page
    /// matches.
    pub fn reset(&mut self) -> Result<()> {
        self.page = 0;
        self.segment = 0;
        self.offset = 0;
        self.bytes_read = 0;
        while self.page < self.pages.len() || self.fetch_next_page()? {
            if let Some((payload_offset, _)) = self.usable_page(self.page) {
                self.offset = payload_offset;
                return Ok(());
            }
            self.page += 1;
        }
        Ok(())
    }

    /// Advances to the next non-empty matching page; does nothing when the
    /// iterator is invalid.
    pub fn next_page(&mut self) -> Result<()> {
        if !self.is_valid() {
            return Ok(());
        }
        self.page += 1;
        while self.page < self.pages.len() || self.fetch_next_page()? {
            if let Some((payload_offset, _)) = self.usable_page(self.page) {
                self.segment = 0;
                self.bytes_read = 0;
                self.offset = payload_offset;
                return Ok(());
            }
            self.page += 1;
        }
        // No further page: the iterator is now invalid.
        Ok(())
    }

    /// Advances to the next segment, rolling over to the next matching page.
    pub fn next_segment(&mut self) -> Result<()> {
        if !self.is_valid() {
            return Ok(());
        }
        let matches = self.matches_filter(&self.pages[self.page]);
        let segment_count = self.pages[self.page].segment_sizes.len();
        if self.segment + 1 < segment_count && matches {
            let size = u64::from(self.pages[self.page].segment_sizes[self.segment]);
            self.bytes_read = 0;
            self.offset += size;
            self.segment += 1;
            Ok(())
        } else {
            self.next_page()
        }
    }

    /// Steps back to the last segment of the previous matching page.
    pub fn previous_page(&mut self) -> Result<()> {
        if !self.is_valid() {
            return Ok(());
        }
        while self.page > 0 {
            self.page -= 1;
            if let Some((_, segment_count)) = self.usable_page(self.page) {
                self.segment = segment_count - 1;
                self.offset = self.pages[self.page].data_offset(self.segment);
                self.bytes_read = 0;
                return Ok(());
            }
        }
        Ok(())
    }

    /// Steps back one segment, rolling over to the previous page.
    pub fn previous_segment(&mut self) -> Result<()> {
        if !self.is_valid() {
            return Ok(());
        }
        let matches = self.matches_filter(&self.pages[self.page]);
        if self.segment > 0 && matches {
            self.segment -= 1;
            let size = u64::from(self.pages[self.page].segment_sizes[self.segment]);
            self.offset -= size;
            self.bytes_read = 0;
            Ok(())
        } else {
            self.previous_page()
        }
    }

    /// Fills `buffer` from the logical stream, walking across segment and
    /// page boundaries and skipping page headers.
    ///
    /// Raises `TruncatedData` when the stream ends before the buffer is
    /// full.
    pub fn read(&mut self, buffer: &mut [u8]) -> Result<()> {
        let mut done = 0usize;
        while self.is_valid() && done < buffer.len() {
            let available = self.current_segment_size() - self.bytes_read;
            let wanted = (buffer.len() - done) as u64;
            self.stream
                .seek(SeekFrom::Start(self.current_character_offset()))?;
            if wanted <= available {
                self.stream.read_exact(&mut buffer[done..])?;
                self.bytes_read += wanted;
                return Ok(());
            }
            self.stream
                .read_exact(&mut buffer[done..done + available as usize])?;
            done += available as usize;
            self.next_segment()?;
        }
        if done == buffer.len() {
            return Ok(());
        }
        Err(Error::TruncatedData(format!(
            "OGG stream ended {} bytes short",
            buffer.len() - done
        )))
    }

    /// Advances the read position by `count` bytes without reading.
    ///
    /// Raises `TruncatedData` when the end of the stream is exceeded.
    pub fn seek_forward(&mut self, count: u64) -> Result<()> {
        let mut remaining = count;
        while self.is_valid() && remaining > 0 {
            let available = self.current_segment_size() - self.bytes_read;
            if remaining <= available {
                self.bytes_read += remaining;
                return Ok(());
            }
            remaining -= available;
            self.next_segment()?;
        }
        if remaining == 0 {
            return Ok(());
        }
        Err(Error::TruncatedData(format!(
            "OGG stream ended {} bytes short of the seek target",
            remaining
        )))
    }

    /// Appends the next physical page to the cache.
    ///
    /// Only possible when the cursor sits one past the last fetched page.
    /// Returns whether a page could be fetched.
    pub fn fetch_next_page(&mut self) -> Result<bool> {
        if self.page != self.pages.len() {
            return Ok(false);
        }
        let offset = match self.pages.last() {
            Some(last) => last.start_offset + last.total_size(),
            None => self.start_offset,
        };
        if offset >= self.stream_size {
            return Ok(false);
        }
        let page = OggPage::parse_header(&mut *self.stream, offset, self.stream_size - offset)?;
        tracing::trace!(
            offset,
            serial = page.serial,
            sequence = page.sequence,
            segments = page.segment_sizes.len(),
            "fetched OGG page"
        );
        self.pages.push(page);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn page(serial: u32, sequence: u32, segments: &[&[u8]], flags: PageFlags) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&PAGE_MARKER);
        out.push(0); // version
        out.push(flags.bits());
        out.extend_from_slice(&0u64.to_le_bytes()); // granule
        out.extend_from_slice(&serial.to_le_bytes());
        out.extend_from_slice(&sequence.to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes()); // crc (unchecked)
        out.push(segments.len() as u8);
        for segment in segments {
            out.push(segment.len() as u8);
        }
        for segment in segments {
            out.extend_from_slice(segment);
        }
        out
    }

    #[test]
    fn test_parse_page_header() {
        let data = page(7, 0, &[b"abc", b"de"], PageFlags::FIRST);
        let mut io = Cursor::new(data.clone());
        let parsed = OggPage::parse_header(&mut io, 0, data.len() as u64).unwrap();
        assert_eq!(parsed.serial, 7);
        assert_eq!(parsed.flags, PageFlags::FIRST);
        assert_eq!(parsed.segment_sizes, vec![3, 2]);
        assert_eq!(parsed.header_size, 29);
        assert_eq!(parsed.total_size(), 34);
        assert_eq!(parsed.data_offset(1), 32);
    }

    #[test]
    fn test_bad_marker_rejected() {
        let mut data = page(1, 0, &[b"x"], PageFlags::empty());
        data[0] = b'X';
        let mut io = Cursor::new(data.clone());
        assert!(matches!(
            OggPage::parse_header(&mut io, 0, data.len() as u64),
            Err(Error::InvalidData(_))
        ));
    }

    #[test]
    fn test_read_across_page_boundary() {
        // First page: segments of 255 and 10 bytes; second page: 20 bytes.
        let first_segment = vec![b'a'; 255];
        let second_segment = vec![b'b'; 10];
        let third_segment = vec![b'c'; 20];
        let mut data = page(
            1,
            0,
            &[&first_segment, &second_segment],
            PageFlags::FIRST,
        );
        data.extend_from_slice(&page(1, 1, &[&third_segment], PageFlags::LAST));

        let len = data.len() as u64;
        let mut stream = Cursor::new(data);
        let mut iterator = OggIterator::new(&mut stream, 0, len);
        iterator.reset().unwrap();
        assert!(iterator.is_valid());

        // 270 bytes span both pages; the page header in between is skipped.
        let mut buffer = vec![0u8; 270];
        iterator.read(&mut buffer).unwrap();
        assert_eq!(&buffer[..255], &first_segment[..]);
        assert_eq!(&buffer[255..265], &second_segment[..]);
        assert_eq!(&buffer[265..], &third_segment[..5]);

        // The remaining 15 bytes exhaust the stream.
        let mut rest = vec![0u8; 15];
        iterator.read(&mut rest).unwrap();
        assert_eq!(rest, &third_segment[5..]);

        // One more byte is not there.
        let mut one = [0u8; 1];
        assert!(matches!(
            iterator.read(&mut one),
            Err(Error::TruncatedData(_))
        ));
    }

    #[test]
    fn test_seek_forward_across_segments() {
        let mut data = page(1, 0, &[&[b'a'; 200], &[b'b'; 50]], PageFlags::FIRST);
        data.extend_from_slice(&page(1, 1, &[&[b'c'; 30]], PageFlags::LAST));

        let len = data.len() as u64;
        let mut stream = Cursor::new(data);
        let mut iterator = OggIterator::new(&mut stream, 0, len);
        iterator.reset().unwrap();

        iterator.seek_forward(230).unwrap();
        let mut buffer = vec![0u8; 30];
        iterator.read(&mut buffer).unwrap();
        assert_eq!(buffer, vec![b'c'; 30]);

        assert!(matches!(
            iterator.seek_forward(1),
            Err(Error::TruncatedData(_))
        ));
    }

    #[test]
    fn test_serial_filter_skips_foreign_pages() {
        let mut data = page(1, 0, &[b"one"], PageFlags::FIRST);
        data.extend_from_slice(&page(2, 0, &[b"two"], PageFlags::FIRST));
        data.extend_from_slice(&page(1, 1, &[b"three"], PageFlags::LAST));

        let len = data.len() as u64;
        let mut stream = Cursor::new(data);
        let mut iterator = OggIterator::new(&mut stream, 0, len);
        iterator.set_filter(Some(1));
        iterator.reset().unwrap();

        let mut buffer = vec![0u8; 8];
        iterator.read(&mut buffer).unwrap();
        assert_eq!(&buffer, b"onethree");
    }

    #[test]
    fn test_page_navigation() {
        let mut data = page(1, 0, &[b"aa", b"bb"], PageFlags::FIRST);
        data.extend_from_slice(&page(1, 1, &[b"cc"], PageFlags::LAST));

        let len = data.len() as u64;
        let mut stream = Cursor::new(data);
        let mut iterator = OggIterator::new(&mut stream, 0, len);
        iterator.reset().unwrap();
        assert_eq!(iterator.current_segment_index(), 0);

        iterator.next_segment().unwrap();
        assert_eq!(iterator.current_segment_index(), 1);

        // Rolls over to the second page.
        iterator.next_segment().unwrap();
        assert_eq!(iterator.current_page().unwrap().sequence, 1);
        assert_eq!(iterator.current_segment_index(), 0);

        // And back again.
        iterator.previous_segment().unwrap();
        assert_eq!(iterator.current_page().unwrap().sequence, 0);
        assert_eq!(iterator.current_segment_index(), 1);

        iterator.previous_page().unwrap();
        assert_eq!(iterator.current_page().unwrap().sequence, 0);

        // The page cache is a prefix of the physical sequence.
        assert_eq!(iterator.pages().len(), 2);
        assert_eq!(iterator.pages()[0].sequence, 0);
        assert_eq!(iterator.pages()[1].sequence, 1);
    }

    #[test]
    fn test_reset_on_empty_stream_is_invalid() {
        let mut stream = Cursor::new(Vec::new());
        let mut iterator = OggIterator::new(&mut stream, 0, 0);
        iterator.reset().unwrap();
        assert!(!iterator.is_valid());
    }
}
