//! Editable model of a Matroska "SeekHead" element.

use crate::ebml;
use crate::ids;

use retag_core::error::Result;
use retag_core::notify::NotificationList;
use retag_core::tree::{NodeId, Tree};

use std::io::{Read, Seek, Write};

const CONTEXT: &str = "parsing \"SeekHead\"-element";

/// One entry of the seek index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeekEntry {
    /// Identifier of the referenced element.
    pub id: u32,
    /// Offset of the referenced element from the start of the segment data.
    pub offset: u64,
}

/// In-memory seek index of one segment.
///
/// The planner grows and retargets the index while it converges on the
/// final layout; [`SeekInfo::push`] reports whether a change altered the
/// encoded size so the caller knows it has to iterate.
#[derive(Debug, Default)]
pub struct SeekInfo {
    entries: Vec<SeekEntry>,
    notifications: NotificationList,
}

impl SeekInfo {
    /// Creates an empty seek index.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses the entries of an existing "SeekHead" element.
    pub fn parse<R: Read + Seek + ?Sized>(
        &mut self,
        tree: &mut Tree<ebml::EbmlFormat>,
        seek_head: NodeId,
        io: &mut R,
    ) -> Result<()> {
        tree.parse(seek_head, io)?;
        let mut child = tree.first_child(seek_head);
        while let Some(seek) = child {
            tree.parse(seek, io)?;
            match tree.node(seek).id() {
                ids::SEEK => {
                    let mut id = None;
                    let mut offset = None;
                    let mut sub = tree.first_child(seek);
                    while let Some(s) = sub {
                        tree.parse(s, io)?;
                        match tree.node(s).id() {
                            ids::SEEK_ID => {
                                let data = tree.read_data(s, io)?;
                                id = Some(ebml::parse_uint(&data)? as u32);
                            }
                            ids::SEEK_POSITION => {
                                let data = tree.read_data(s, io)?;
                                offset = Some(ebml::parse_uint(&data)?);
                            }
                            ids::VOID | ids::CRC32 => {}
                            other => {
                                self.notifications.warning(
                                    CONTEXT,
                                    format!(
                                        "\"Seek\"-element contains unknown child 0x{:X}; it will be ignored",
                                        other
                                    ),
                                );
                            }
                        }
                        sub = tree.next_sibling(s);
                    }
                    match (id, offset) {
                        (Some(id), Some(offset)) => self.entries.push(SeekEntry { id, offset }),
                        _ => self.notifications.warning(
                            CONTEXT,
                            "\"Seek\"-element without \"SeekID\" or \"SeekPosition\" is ignored",
                        ),
                    }
                }
                ids::VOID | ids::CRC32 => {}
                other => {
                    self.notifications.warning(
                        CONTEXT,
                        format!(
                            "\"SeekHead\"-element contains unknown child 0x{:X}; it will be ignored",
                            other
                        ),
                    );
                }
            }
            child = tree.next_sibling(seek);
        }
        Ok(())
    }

    /// Inserts or updates the `index`-th entry for `id`.
    ///
    /// Returns whether the encoded size of the SeekHead element changed as a
    /// result; once an offset has been pushed its byte cost is part of every
    /// subsequent [`actual_size`](Self::actual_size) computation, so the
    /// planner must restart its size calculation whenever this returns true.
    pub fn push(&mut self, index: usize, id: u32, offset: u64) -> bool {
        let mut seen = 0;
        for entry in &mut self.entries {
            if entry.id == id {
                if seen == index {
                    let changed =
                        ebml::uinteger_length(entry.offset) != ebml::uinteger_length(offset);
                    entry.offset = offset;
                    return changed;
                }
                seen += 1;
            }
        }
        self.entries.push(SeekEntry { id, offset });
        true
    }

    /// The current entries in emission order.
    pub fn entries(&self) -> &[SeekEntry] {
        &self.entries
    }

    /// Returns whether the index holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Removes all entries.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    fn entry_size(entry: &SeekEntry) -> u64 {
        let id_element = 2 + 1 + u64::from(ebml::id_length(entry.id));
        let position_element = 2 + 1 + u64::from(ebml::uinteger_length(entry.offset));
        let data = id_element + position_element;
        2 + u64::from(ebml::size_denotation_length(data)) + data
    }

    fn data_size(&self) -> u64 {
        self.entries.iter().map(Self::entry_size).sum()
    }

    /// Encoded size of the SeekHead element including its own header.
    ///
    /// Zero when the index is empty (no element is emitted then).
    pub fn actual_size(&self) -> u64 {
        if self.entries.is_empty() {
            return 0;
        }
        let data = self.data_size();
        4 + u64::from(ebml::size_denotation_length(data)) + data
    }

    /// Emits the SeekHead element. Writes nothing when the index is empty.
    pub fn make<W: Write + ?Sized>(&mut self, out: &mut W) -> Result<()> {
        if self.entries.is_empty() {
            return Ok(());
        }
        ebml::write_id(out, ids::SEEK_HEAD)?;
        ebml::write_size(out, self.data_size())?;
        for entry in &self.entries {
            let (id_bytes, id_len) = ebml::encode_id(entry.id);
            let id_element = 2 + 1 + id_len as u64;
            let position_element = 2 + 1 + u64::from(ebml::uinteger_length(entry.offset));
            ebml::write_id(out, ids::SEEK)?;
            ebml::write_size(out, id_element + position_element)?;
            ebml::make_binary(out, ids::SEEK_ID, &id_bytes[..id_len])?;
            ebml::make_uint(out, ids::SEEK_POSITION, entry.offset)?;
        }
        Ok(())
    }

    /// Takes the notifications recorded while parsing or emitting.
    pub fn take_notifications(&mut self, target: &mut NotificationList) {
        target.take_from(&mut self.notifications);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use retag_core::tree::Tree;
    use std::io::Cursor;

    #[test]
    fn test_push_reports_size_changes() {
        let mut info = SeekInfo::new();
        // New entries always change the size.
        assert!(info.push(0, ids::INFO, 100));
        assert!(info.push(0, ids::TRACKS, 200));
        // Same encoded offset length: no size change.
        assert!(!info.push(0, ids::INFO, 101));
        // Offset now needs two bytes instead of one.
        assert!(info.push(0, ids::INFO, 300));
        // Second element with the same ID is a distinct entry.
        assert!(info.push(1, ids::INFO, 400));
        assert_eq!(info.entries().len(), 3);
    }

    #[test]
    fn test_actual_size_matches_emitted_bytes() {
        let mut info = SeekInfo::new();
        info.push(0, ids::INFO, 0x20);
        info.push(0, ids::TRACKS, 0x4321);
        info.push(0, ids::CLUSTER, 0x123456);

        let mut out = Vec::new();
        info.make(&mut out).unwrap();
        assert_eq!(out.len() as u64, info.actual_size());
    }

    #[test]
    fn test_empty_index_emits_nothing() {
        let mut info = SeekInfo::new();
        assert_eq!(info.actual_size(), 0);
        let mut out = Vec::new();
        info.make(&mut out).unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn test_parse_roundtrip() {
        let mut info = SeekInfo::new();
        info.push(0, ids::INFO, 0x40);
        info.push(0, ids::CUES, 0x1234);
        let mut out = Vec::new();
        info.make(&mut out).unwrap();

        let mut io = Cursor::new(out.clone());
        let mut tree: Tree<ebml::EbmlFormat> = Tree::new(0, out.len() as u64);
        let root = tree.root();
        let mut parsed = SeekInfo::new();
        parsed.parse(&mut tree, root, &mut io).unwrap();

        assert_eq!(parsed.entries(), info.entries());
        let mut notifications = NotificationList::new();
        parsed.take_notifications(&mut notifications);
        assert!(notifications.is_empty());
    }
}
