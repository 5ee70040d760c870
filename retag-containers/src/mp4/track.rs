//! MP4 sample-table access: chunk offsets, sample-to-chunk mapping and
//! sample sizes.
//!
//! The piece that matters for rewriting is the chunk-offset table: when
//! the `mdat` atom moves, every `stco`/`co64` entry has to be shifted by
//! the distance its `mdat` moved. Everything else is decoded for
//! inspection only.

use super::{atom_ids, Mp4Format};

use retag_core::error::{Error, Result};
use retag_core::notify::NotificationList;
use retag_core::tree::{NodeId, Tree};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Seek, SeekFrom, Write};

const CONTEXT: &str = "parsing MP4 sample tables";

/// One entry of the sample-to-chunk table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SampleToChunkEntry {
    /// Index of the first chunk the entry applies to (1-based).
    pub first_chunk: u32,
    /// Samples per chunk from `first_chunk` on.
    pub samples_per_chunk: u32,
    /// Sample description index.
    pub sample_description_index: u32,
}

/// Sample sizes: either one constant size or a per-sample table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SampleSizes {
    /// All samples share one size.
    Constant {
        /// Size of every sample in bytes.
        size: u32,
        /// Number of samples.
        count: u32,
    },
    /// Per-sample sizes (from `stsz` with size 0, or `stz2`).
    Variable(Vec<u32>),
}

/// Sample-table view of one `trak` atom.
#[derive(Debug)]
pub struct Mp4Track {
    chunk_offset_atom: NodeId,
    chunk_offset_size: u8,
    chunk_count: u32,
    sample_to_chunk: Vec<SampleToChunkEntry>,
    sample_sizes: Option<SampleSizes>,
}

impl Mp4Track {
    /// Decodes the sample tables of the `trak` atom.
    ///
    /// Fails with `InvalidData` when no chunk-offset atom is present.
    pub fn parse<R: Read + Seek + ?Sized>(
        tree: &mut Tree<Mp4Format>,
        trak: NodeId,
        io: &mut R,
        notifications: &mut NotificationList,
    ) -> Result<Self> {
        tree.parse(trak, io)?;
        let stbl = tree
            .subelement_by_path(
                trak,
                &[
                    atom_ids::TRAK,
                    atom_ids::MDIA,
                    atom_ids::MINF,
                    atom_ids::STBL,
                ],
                io,
            )?
            .ok_or_else(|| {
                notifications.critical(CONTEXT, "no stbl atom found");
                Error::InvalidData("trak atom without sample table".into())
            })?;

        let chunk_offset_atom = match tree.child_by_id(stbl, atom_ids::STCO, io)? {
            Some(atom) => atom,
            None => tree.child_by_id(stbl, atom_ids::CO64, io)?.ok_or_else(|| {
                notifications.critical(CONTEXT, "no stco/co64 atom found");
                Error::InvalidData("trak atom without chunk offsets".into())
            })?,
        };
        let chunk_offset_size = if tree.node(chunk_offset_atom).id() == atom_ids::CO64 {
            8
        } else {
            4
        };

        // Chunk count, with the table length cross-checked against it.
        io.seek(SeekFrom::Start(tree.node(chunk_offset_atom).data_offset() + 4))?;
        let chunk_count = io.read_u32::<BigEndian>()?;
        let table_capacity =
            (tree.node(chunk_offset_atom).data_size().saturating_sub(8)) / u64::from(chunk_offset_size);
        if u64::from(chunk_count) > table_capacity {
            notifications.critical(
                CONTEXT,
                "the stco/co64 atom is truncated; it stores fewer chunk offsets than denoted",
            );
        } else if u64::from(chunk_count) < table_capacity {
            notifications.critical(
                CONTEXT,
                "the stco/co64 atom stores more chunk offsets than denoted; \
                 the additional offsets will be ignored",
            );
        }

        let sample_to_chunk = match tree.child_by_id(stbl, atom_ids::STSC, io)? {
            Some(stsc) => Self::read_sample_to_chunk(tree, stsc, io, notifications)?,
            None => Vec::new(),
        };

        let sample_sizes = if let Some(stsz) = tree.child_by_id(stbl, atom_ids::STSZ, io)? {
            Some(Self::read_sample_sizes(tree, stsz, io)?)
        } else if let Some(stz2) = tree.child_by_id(stbl, atom_ids::STZ2, io)? {
            Some(Self::read_compact_sample_sizes(tree, stz2, io)?)
        } else {
            None
        };

        tracing::debug!(
            chunk_count,
            chunk_offset_size,
            stsc_entries = sample_to_chunk.len(),
            "parsed MP4 sample tables"
        );
        Ok(Self {
            chunk_offset_atom,
            chunk_offset_size,
            chunk_count,
            sample_to_chunk,
            sample_sizes,
        })
    }

    fn read_sample_to_chunk<R: Read + Seek + ?Sized>(
        tree: &mut Tree<Mp4Format>,
        stsc: NodeId,
        io: &mut R,
        notifications: &mut NotificationList,
    ) -> Result<Vec<SampleToChunkEntry>> {
        io.seek(SeekFrom::Start(tree.node(stsc).data_offset() + 4))?;
        let count = io.read_u32::<BigEndian>()?;
        let capacity = (tree.node(stsc).data_size().saturating_sub(8)) / 12;
        let usable = u64::from(count).min(capacity);
        if u64::from(count) > capacity {
            notifications.critical(
                CONTEXT,
                "the stsc atom is truncated; it stores fewer entries than denoted",
            );
        }
        let mut entries = Vec::with_capacity(usable as usize);
        for _ in 0..usable {
            entries.push(SampleToChunkEntry {
                first_chunk: io.read_u32::<BigEndian>()?,
                samples_per_chunk: io.read_u32::<BigEndian>()?,
                sample_description_index: io.read_u32::<BigEndian>()?,
            });
        }
        Ok(entries)
    }

    fn read_sample_sizes<R: Read + Seek + ?Sized>(
        tree: &mut Tree<Mp4Format>,
        stsz: NodeId,
        io: &mut R,
    ) -> Result<SampleSizes> {
        io.seek(SeekFrom::Start(tree.node(stsz).data_offset() + 4))?;
        let constant_size = io.read_u32::<BigEndian>()?;
        let count = io.read_u32::<BigEndian>()?;
        if constant_size != 0 {
            return Ok(SampleSizes::Constant {
                size: constant_size,
                count,
            });
        }
        let capacity = (tree.node(stsz).data_size().saturating_sub(12)) / 4;
        let usable = u64::from(count).min(capacity);
        let mut sizes = Vec::with_capacity(usable as usize);
        for _ in 0..usable {
            sizes.push(io.read_u32::<BigEndian>()?);
        }
        Ok(SampleSizes::Variable(sizes))
    }

    fn read_compact_sample_sizes<R: Read + Seek + ?Sized>(
        tree: &mut Tree<Mp4Format>,
        stz2: NodeId,
        io: &mut R,
    ) -> Result<SampleSizes> {
        io.seek(SeekFrom::Start(tree.node(stz2).data_offset() + 4))?;
        let mut reserved_and_field_size = [0u8; 4];
        io.read_exact(&mut reserved_and_field_size)?;
        let field_size = u32::from(reserved_and_field_size[3]);
        let count = io.read_u32::<BigEndian>()?;
        let mut sizes = Vec::with_capacity(count as usize);
        match field_size {
            4 => {
                for _ in 0..count.div_ceil(2) {
                    let byte = io.read_u8()?;
                    sizes.push(u32::from(byte >> 4));
                    if sizes.len() < count as usize {
                        sizes.push(u32::from(byte & 0x0F));
                    }
                }
            }
            8 => {
                for _ in 0..count {
                    sizes.push(u32::from(io.read_u8()?));
                }
            }
            16 => {
                for _ in 0..count {
                    sizes.push(u32::from(io.read_u16::<BigEndian>()?));
                }
            }
            32 => {
                for _ in 0..count {
                    sizes.push(io.read_u32::<BigEndian>()?);
                }
            }
            other => {
                return Err(Error::InvalidData(format!(
                    "stz2 atom with unsupported field size {}",
                    other
                )));
            }
        }
        sizes.truncate(count as usize);
        Ok(SampleSizes::Variable(sizes))
    }

    /// Number of chunks denoted by the chunk-offset atom.
    pub fn chunk_count(&self) -> u32 {
        self.chunk_count
    }

    /// Width of one chunk offset in bytes (4 for `stco`, 8 for `co64`).
    pub fn chunk_offset_size(&self) -> u8 {
        self.chunk_offset_size
    }

    /// The sample-to-chunk table.
    pub fn sample_to_chunk(&self) -> &[SampleToChunkEntry] {
        &self.sample_to_chunk
    }

    /// The sample sizes, when an `stsz`/`stz2` atom was present.
    pub fn sample_sizes(&self) -> Option<&SampleSizes> {
        self.sample_sizes.as_ref()
    }

    /// Reads the chunk-offset table.
    pub fn read_chunk_offsets<R: Read + Seek + ?Sized>(
        &self,
        tree: &Tree<Mp4Format>,
        io: &mut R,
    ) -> Result<Vec<u64>> {
        let atom = tree.node(self.chunk_offset_atom);
        io.seek(SeekFrom::Start(atom.data_offset() + 8))?;
        let capacity = (atom.data_size().saturating_sub(8)) / u64::from(self.chunk_offset_size);
        let usable = u64::from(self.chunk_count).min(capacity);
        let mut offsets = Vec::with_capacity(usable as usize);
        for _ in 0..usable {
            offsets.push(match self.chunk_offset_size {
                4 => u64::from(io.read_u32::<BigEndian>()?),
                _ => io.read_u64::<BigEndian>()?,
            });
        }
        Ok(offsets)
    }

    /// Shifts every chunk offset after the `mdat` atoms moved.
    ///
    /// `old_mdat_offsets` and `new_mdat_offsets` are paired: for each table
    /// entry the largest old offset strictly below the entry determines the
    /// delta to apply. Fails with `InvalidData` when the vectors are empty
    /// or of different lengths, or when the offset-holding atom is not an
    /// `stco`/`co64` atom.
    pub fn update_chunk_offsets<R, W>(
        &self,
        tree: &Tree<Mp4Format>,
        input: &mut R,
        output: &mut W,
        old_mdat_offsets: &[u64],
        new_mdat_offsets: &[u64],
    ) -> Result<()>
    where
        R: Read + Seek + ?Sized,
        W: Write + Seek + ?Sized,
    {
        if old_mdat_offsets.is_empty() || old_mdat_offsets.len() != new_mdat_offsets.len() {
            return Err(Error::InvalidData(
                "mismatched mdat offset vectors".into(),
            ));
        }
        let atom = tree.node(self.chunk_offset_atom);
        match atom.id() {
            atom_ids::STCO | atom_ids::CO64 => {}
            _ => {
                return Err(Error::InvalidData(
                    "atom holding the chunk offsets is not an stco/co64 atom".into(),
                ));
            }
        }
        let width = u64::from(self.chunk_offset_size);
        let start = atom.data_offset() + 8;
        let end = atom.data_offset() + atom.data_size();
        let mut position = start;
        input.seek(SeekFrom::Start(start))?;
        while position + width <= end {
            let offset = match self.chunk_offset_size {
                4 => u64::from(input.read_u32::<BigEndian>()?),
                _ => input.read_u64::<BigEndian>()?,
            };
            // Largest old mdat offset strictly below the entry decides the
            // shift.
            let mut best: Option<usize> = None;
            for (index, &old) in old_mdat_offsets.iter().enumerate() {
                if offset > old && best.map_or(true, |b| old > old_mdat_offsets[b]) {
                    best = Some(index);
                }
            }
            let shifted = match best {
                Some(index) => offset
                    .wrapping_add(new_mdat_offsets[index])
                    .wrapping_sub(old_mdat_offsets[index]),
                None => offset,
            };
            output.seek(SeekFrom::Start(position))?;
            match self.chunk_offset_size {
                4 => output.write_u32::<BigEndian>(shifted as u32)?,
                _ => output.write_u64::<BigEndian>(shifted)?,
            }
            position += width;
        }
        Ok(())
    }

    /// Overwrites a single chunk offset.
    pub fn update_chunk_offset<W>(
        &self,
        tree: &Tree<Mp4Format>,
        output: &mut W,
        chunk_index: u32,
        offset: u64,
    ) -> Result<()>
    where
        W: Write + Seek + ?Sized,
    {
        if chunk_index >= self.chunk_count {
            return Err(Error::InvalidData(format!(
                "chunk index {} out of range ({} chunks)",
                chunk_index, self.chunk_count
            )));
        }
        let atom = tree.node(self.chunk_offset_atom);
        output.seek(SeekFrom::Start(
            atom.data_offset() + 8 + u64::from(self.chunk_offset_size) * u64::from(chunk_index),
        ))?;
        match self.chunk_offset_size {
            4 => output.write_u32::<BigEndian>(offset as u32)?,
            _ => output.write_u64::<BigEndian>(offset)?,
        }
        Ok(())
    }

    /// Synthesising a `trak` atom from model state is not supported; the
    /// original atom is copied instead.
    pub fn make_track(&self) -> Result<()> {
        Err(Error::NotImplemented(
            "assembling a trak atom from scratch".into(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn full_atom(tag: &[u8; 4], content: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&((content.len() + 8) as u32).to_be_bytes());
        out.extend_from_slice(tag);
        out.extend_from_slice(content);
        out
    }

    fn stco_atom(offsets: &[u32]) -> Vec<u8> {
        let mut content = Vec::new();
        content.extend_from_slice(&[0, 0, 0, 0]); // version + flags
        content.extend_from_slice(&(offsets.len() as u32).to_be_bytes());
        for &offset in offsets {
            content.extend_from_slice(&offset.to_be_bytes());
        }
        full_atom(b"stco", &content)
    }

    fn co64_atom(offsets: &[u64]) -> Vec<u8> {
        let mut content = Vec::new();
        content.extend_from_slice(&[0, 0, 0, 0]);
        content.extend_from_slice(&(offsets.len() as u32).to_be_bytes());
        for &offset in offsets {
            content.extend_from_slice(&offset.to_be_bytes());
        }
        full_atom(b"co64", &content)
    }

    fn stsc_atom(entries: &[(u32, u32, u32)]) -> Vec<u8> {
        let mut content = Vec::new();
        content.extend_from_slice(&[0, 0, 0, 0]);
        content.extend_from_slice(&(entries.len() as u32).to_be_bytes());
        for &(first, per, desc) in entries {
            content.extend_from_slice(&first.to_be_bytes());
            content.extend_from_slice(&per.to_be_bytes());
            content.extend_from_slice(&desc.to_be_bytes());
        }
        full_atom(b"stsc", &content)
    }

    fn stsz_atom(constant: u32, sizes: &[u32]) -> Vec<u8> {
        let mut content = Vec::new();
        content.extend_from_slice(&[0, 0, 0, 0]);
        content.extend_from_slice(&constant.to_be_bytes());
        if constant == 0 {
            content.extend_from_slice(&(sizes.len() as u32).to_be_bytes());
            for &size in sizes {
                content.extend_from_slice(&size.to_be_bytes());
            }
        } else {
            content.extend_from_slice(&42u32.to_be_bytes());
        }
        full_atom(b"stsz", &content)
    }

    fn trak_with(tables: &[Vec<u8>]) -> Vec<u8> {
        let mut stbl_content = Vec::new();
        for table in tables {
            stbl_content.extend_from_slice(table);
        }
        let stbl = full_atom(b"stbl", &stbl_content);
        let minf = full_atom(b"minf", &stbl);
        let mdia = full_atom(b"mdia", &minf);
        full_atom(b"trak", &mdia)
    }

    fn parse_track(data: &[u8]) -> (Tree<Mp4Format>, Mp4Track, Cursor<Vec<u8>>) {
        let mut io = Cursor::new(data.to_vec());
        let mut tree: Tree<Mp4Format> = Tree::new(0, data.len() as u64);
        let root = tree.root();
        let mut notifications = NotificationList::new();
        let track = Mp4Track::parse(&mut tree, root, &mut io, &mut notifications).unwrap();
        (tree, track, io)
    }

    #[test]
    fn test_parse_sample_tables() {
        let data = trak_with(&[
            stco_atom(&[0x1000, 0x2000, 0x3000]),
            stsc_atom(&[(1, 10, 1), (3, 5, 1)]),
            stsz_atom(0, &[100, 200, 300]),
        ]);
        let (_, track, _) = parse_track(&data);

        assert_eq!(track.chunk_count(), 3);
        assert_eq!(track.chunk_offset_size(), 4);
        assert_eq!(
            track.sample_to_chunk(),
            &[
                SampleToChunkEntry {
                    first_chunk: 1,
                    samples_per_chunk: 10,
                    sample_description_index: 1
                },
                SampleToChunkEntry {
                    first_chunk: 3,
                    samples_per_chunk: 5,
                    sample_description_index: 1
                },
            ]
        );
        assert_eq!(
            track.sample_sizes(),
            Some(&SampleSizes::Variable(vec![100, 200, 300]))
        );
    }

    #[test]
    fn test_constant_sample_size() {
        let data = trak_with(&[stco_atom(&[0x100]), stsz_atom(1024, &[])]);
        let (_, track, _) = parse_track(&data);
        assert_eq!(
            track.sample_sizes(),
            Some(&SampleSizes::Constant {
                size: 1024,
                count: 42
            })
        );
    }

    #[test]
    fn test_chunk_offsets_shift_when_mdat_moves() {
        let data = trak_with(&[stco_atom(&[0x1000, 0x2000, 0x3000])]);
        let (tree, track, mut io) = parse_track(&data);

        let mut output = Cursor::new(io.get_ref().clone());
        track
            .update_chunk_offsets(&tree, &mut io, &mut output, &[0x800], &[0x1800])
            .unwrap();

        let mut patched = Cursor::new(output.into_inner());
        let offsets = track.read_chunk_offsets(&tree, &mut patched).unwrap();
        assert_eq!(offsets, vec![0x2000, 0x3000, 0x4000]);
    }

    #[test]
    fn test_co64_offsets_shift_with_wide_encoding() {
        let data = trak_with(&[co64_atom(&[0x1000, 0x2000, 0x3000])]);
        let (tree, track, mut io) = parse_track(&data);
        assert_eq!(track.chunk_offset_size(), 8);

        let mut output = Cursor::new(io.get_ref().clone());
        track
            .update_chunk_offsets(&tree, &mut io, &mut output, &[0x800], &[0x1800])
            .unwrap();

        let mut patched = Cursor::new(output.into_inner());
        let offsets = track.read_chunk_offsets(&tree, &mut patched).unwrap();
        assert_eq!(offsets, vec![0x2000, 0x3000, 0x4000]);
    }

    #[test]
    fn test_multiple_mdat_ranges_pick_largest_below() {
        let data = trak_with(&[stco_atom(&[0x1000, 0x5000])]);
        let (tree, track, mut io) = parse_track(&data);

        // Two mdat atoms: one at 0x800 (moved +0x100), one at 0x4000
        // (moved +0x200). Each entry shifts by its own mdat's delta.
        let mut output = Cursor::new(io.get_ref().clone());
        track
            .update_chunk_offsets(
                &tree,
                &mut io,
                &mut output,
                &[0x800, 0x4000],
                &[0x900, 0x4200],
            )
            .unwrap();

        let mut patched = Cursor::new(output.into_inner());
        let offsets = track.read_chunk_offsets(&tree, &mut patched).unwrap();
        assert_eq!(offsets, vec![0x1100, 0x5200]);
    }

    #[test]
    fn test_mismatched_offset_vectors_rejected() {
        let data = trak_with(&[stco_atom(&[0x1000])]);
        let (tree, track, mut io) = parse_track(&data);
        let mut output = Cursor::new(Vec::new());
        assert!(track
            .update_chunk_offsets(&tree, &mut io, &mut output, &[], &[])
            .is_err());
        assert!(track
            .update_chunk_offsets(&tree, &mut io, &mut output, &[1, 2], &[1])
            .is_err());
    }

    #[test]
    fn test_update_single_chunk_offset() {
        let data = trak_with(&[stco_atom(&[0x1000, 0x2000])]);
        let (tree, track, io) = parse_track(&data);

        let mut output = Cursor::new(io.get_ref().clone());
        track
            .update_chunk_offset(&tree, &mut output, 1, 0x2222)
            .unwrap();
        assert!(track.update_chunk_offset(&tree, &mut output, 2, 0).is_err());

        let mut patched = Cursor::new(output.into_inner());
        let offsets = track.read_chunk_offsets(&tree, &mut patched).unwrap();
        assert_eq!(offsets, vec![0x1000, 0x2222]);
    }

    #[test]
    fn test_missing_chunk_offsets_rejected() {
        let data = trak_with(&[stsz_atom(100, &[])]);
        let mut io = Cursor::new(data.clone());
        let mut tree: Tree<Mp4Format> = Tree::new(0, data.len() as u64);
        let root = tree.root();
        let mut notifications = NotificationList::new();
        let result = Mp4Track::parse(&mut tree, root, &mut io, &mut notifications);
        assert!(matches!(result, Err(Error::InvalidData(_))));
        assert!(notifications.has_critical());
    }

    #[test]
    fn test_make_track_not_implemented() {
        let data = trak_with(&[stco_atom(&[0x1000])]);
        let (_, track, _) = parse_track(&data);
        let err = track.make_track().unwrap_err();
        assert!(matches!(err, Error::NotImplemented(_)));
        assert_eq!(err.exit_code(), 4);
    }
}
