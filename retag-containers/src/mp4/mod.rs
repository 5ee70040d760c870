//! MP4 (ISO-BMFF) atom support.
//!
//! Atoms are length-prefixed like EBML elements, just with fixed-width
//! framing: a 32-bit size followed by a 4-byte tag, with a 64-bit extended
//! size when the 32-bit field holds 1 and to-end-of-file semantics when it
//! holds 0. The [`Mp4Format`] decoder plugs that framing into the generic
//! element tree; [`track::Mp4Track`] decodes the sample tables needed to
//! relocate media data.

pub mod track;

use retag_core::error::{Error, Result};
use retag_core::tree::{ElementFormat, Node, RawHeader};

use byteorder::{BigEndian, ReadBytesExt};
use std::io::{Read, Seek, SeekFrom};

/// Converts a four-character tag to its numeric identifier.
pub const fn fourcc(tag: &[u8; 4]) -> u32 {
    u32::from_be_bytes(*tag)
}

/// Well-known atom identifiers.
pub mod atom_ids {
    use super::fourcc;

    /// File type.
    pub const FTYP: u32 = fourcc(b"ftyp");
    /// Movie metadata container.
    pub const MOOV: u32 = fourcc(b"moov");
    /// Track container.
    pub const TRAK: u32 = fourcc(b"trak");
    /// Media container.
    pub const MDIA: u32 = fourcc(b"mdia");
    /// Media information container.
    pub const MINF: u32 = fourcc(b"minf");
    /// Sample table container.
    pub const STBL: u32 = fourcc(b"stbl");
    /// Edit list container.
    pub const EDTS: u32 = fourcc(b"edts");
    /// Data information container.
    pub const DINF: u32 = fourcc(b"dinf");
    /// User data container.
    pub const UDTA: u32 = fourcc(b"udta");
    /// Movie extends container.
    pub const MVEX: u32 = fourcc(b"mvex");
    /// Movie fragment container.
    pub const MOOF: u32 = fourcc(b"moof");
    /// Track fragment container.
    pub const TRAF: u32 = fourcc(b"traf");
    /// Metadata container (full atom: version/flags precede the children).
    pub const META: u32 = fourcc(b"meta");
    /// Sample description table.
    pub const STSD: u32 = fourcc(b"stsd");
    /// 32-bit chunk offset table.
    pub const STCO: u32 = fourcc(b"stco");
    /// 64-bit chunk offset table.
    pub const CO64: u32 = fourcc(b"co64");
    /// Sample-to-chunk table.
    pub const STSC: u32 = fourcc(b"stsc");
    /// Sample size table.
    pub const STSZ: u32 = fourcc(b"stsz");
    /// Compact sample size table.
    pub const STZ2: u32 = fourcc(b"stz2");
    /// Media data.
    pub const MDAT: u32 = fourcc(b"mdat");
    /// Free space (padding).
    pub const FREE: u32 = fourcc(b"free");
    /// Free space (padding, legacy tag).
    pub const SKIP: u32 = fourcc(b"skip");
}

/// Returns whether `id` denotes a container atom.
pub fn is_container(id: u32) -> bool {
    matches!(
        id,
        atom_ids::MOOV
            | atom_ids::TRAK
            | atom_ids::MDIA
            | atom_ids::MINF
            | atom_ids::STBL
            | atom_ids::EDTS
            | atom_ids::DINF
            | atom_ids::UDTA
            | atom_ids::MVEX
            | atom_ids::MOOF
            | atom_ids::TRAF
            | atom_ids::META
            | atom_ids::STSD
    )
}

/// The MP4 decoder for the generic element tree.
pub struct Mp4Format;

impl ElementFormat for Mp4Format {
    type Id = u32;
    const MAX_ID_LENGTH: u32 = 4;
    const MAX_SIZE_LENGTH: u32 = 12;

    fn read_header<R: Read + Seek + ?Sized>(
        io: &mut R,
        start_offset: u64,
        max_size: u64,
    ) -> Result<RawHeader<u32>> {
        if max_size < 8 {
            return Err(Error::TruncatedData(format!(
                "no room for an atom header at {}",
                start_offset
            )));
        }
        io.seek(SeekFrom::Start(start_offset))?;
        let size32 = io.read_u32::<BigEndian>()?;
        let id = io.read_u32::<BigEndian>()?;
        let (size_length, total_size) = match size32 {
            0 => (4, max_size),
            1 => {
                if max_size < 16 {
                    return Err(Error::TruncatedData(format!(
                        "no room for an extended atom header at {}",
                        start_offset
                    )));
                }
                (12, io.read_u64::<BigEndian>()?)
            }
            _ => (4, u64::from(size32)),
        };
        let header_size = u64::from(4 + size_length);
        if total_size < header_size {
            return Err(Error::InvalidData(format!(
                "atom at {} denotes a size smaller than its own header",
                start_offset
            )));
        }
        Ok(RawHeader {
            id,
            id_length: 4,
            size_length,
            data_size: total_size - header_size,
        })
    }

    fn is_parent(node: &Node<u32>) -> bool {
        is_container(node.id())
    }

    fn is_padding(node: &Node<u32>) -> bool {
        matches!(node.id(), atom_ids::FREE | atom_ids::SKIP)
    }

    fn first_child_offset(node: &Node<u32>) -> u64 {
        let header = u64::from(node.header_size());
        match node.id() {
            // Full atom: version and flags precede the children.
            atom_ids::META => header + 4,
            // Version/flags plus the entry count.
            atom_ids::STSD => header + 8,
            _ => header,
        }
    }

    fn id_to_string(id: u32) -> String {
        let bytes = id.to_be_bytes();
        if bytes.iter().all(|b| b.is_ascii_graphic() || *b == b' ') {
            String::from_utf8_lossy(&bytes).into_owned()
        } else {
            format!("0x{:08X}", id)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use retag_core::tree::Tree;
    use std::io::Cursor;

    fn atom(tag: &[u8; 4], content: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&((content.len() + 8) as u32).to_be_bytes());
        out.extend_from_slice(tag);
        out.extend_from_slice(content);
        out
    }

    #[test]
    fn test_parse_plain_atom() {
        let data = atom(b"ftyp", b"isom\x00\x00\x02\x00isomiso2");
        let mut io = Cursor::new(data.clone());
        let mut tree: Tree<Mp4Format> = Tree::new(0, data.len() as u64);
        let root = tree.root();
        tree.parse(root, &mut io).unwrap();

        assert_eq!(tree.node(root).id(), atom_ids::FTYP);
        assert_eq!(tree.node(root).header_size(), 8);
        assert_eq!(tree.node(root).data_size(), 16);
    }

    #[test]
    fn test_parse_extended_size() {
        let mut data = Vec::new();
        data.extend_from_slice(&1u32.to_be_bytes());
        data.extend_from_slice(b"mdat");
        data.extend_from_slice(&24u64.to_be_bytes());
        data.extend_from_slice(&[0xAB; 8]);

        let mut io = Cursor::new(data.clone());
        let mut tree: Tree<Mp4Format> = Tree::new(0, data.len() as u64);
        let root = tree.root();
        tree.parse(root, &mut io).unwrap();

        assert_eq!(tree.node(root).id(), atom_ids::MDAT);
        assert_eq!(tree.node(root).header_size(), 16);
        assert_eq!(tree.node(root).data_size(), 8);
    }

    #[test]
    fn test_size_zero_extends_to_end() {
        let mut data = Vec::new();
        data.extend_from_slice(&0u32.to_be_bytes());
        data.extend_from_slice(b"mdat");
        data.extend_from_slice(&[0xCD; 100]);

        let mut io = Cursor::new(data.clone());
        let mut tree: Tree<Mp4Format> = Tree::new(0, data.len() as u64);
        let root = tree.root();
        tree.parse(root, &mut io).unwrap();

        assert_eq!(tree.node(root).data_size(), 100);
        assert!(tree.next_sibling(root).is_none());
    }

    #[test]
    fn test_nested_containers() {
        let stbl = atom(b"stbl", &atom(b"stco", &[0, 0, 0, 0, 0, 0, 0, 0]));
        let minf = atom(b"minf", &stbl);
        let mdia = atom(b"mdia", &minf);
        let trak = atom(b"trak", &mdia);
        let moov = atom(b"moov", &trak);

        let mut io = Cursor::new(moov.clone());
        let mut tree: Tree<Mp4Format> = Tree::new(0, moov.len() as u64);
        let root = tree.root();
        let stco = tree
            .subelement_by_path(
                root,
                &[
                    atom_ids::MOOV,
                    atom_ids::TRAK,
                    atom_ids::MDIA,
                    atom_ids::MINF,
                    atom_ids::STBL,
                    atom_ids::STCO,
                ],
                &mut io,
            )
            .unwrap()
            .unwrap();
        assert_eq!(tree.node(stco).id(), atom_ids::STCO);
    }

    #[test]
    fn test_undersized_atom_rejected() {
        let mut data = Vec::new();
        data.extend_from_slice(&4u32.to_be_bytes()); // smaller than its header
        data.extend_from_slice(b"free");

        let mut io = Cursor::new(data.clone());
        let mut tree: Tree<Mp4Format> = Tree::new(0, data.len() as u64);
        let root = tree.root();
        assert!(matches!(
            tree.parse(root, &mut io),
            Err(Error::InvalidData(_))
        ));
    }

    #[test]
    fn test_id_to_string() {
        assert_eq!(Mp4Format::id_to_string(atom_ids::MOOV), "moov");
        assert_eq!(Mp4Format::id_to_string(1), "0x00000001");
    }
}
