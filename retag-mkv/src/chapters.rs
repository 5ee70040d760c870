//! Matroska edition and chapter model (inspection only).
//!
//! Chapters elements are re-emitted from buffered copies on write, so this
//! model exists for callers that want to look at the chapter tree.

use crate::ebml;
use crate::ids;

use retag_core::error::{Error, Result};
use retag_core::notify::NotificationList;
use retag_core::tree::{NodeId, Tree};

use std::io::{Read, Seek};

const CONTEXT: &str = "parsing \"EditionEntry\"-element";

/// A localized chapter title.
#[derive(Debug, Clone, Default)]
pub struct ChapterDisplay {
    /// Title string.
    pub title: String,
    /// Language code.
    pub language: Option<String>,
}

/// One chapter atom, possibly nested.
#[derive(Debug, Clone, Default)]
pub struct MatroskaChapter {
    /// Chapter UID.
    pub uid: u64,
    /// Start time in nanoseconds.
    pub start_time: u64,
    /// End time in nanoseconds.
    pub end_time: Option<u64>,
    /// Hidden flag.
    pub hidden: bool,
    /// Enabled flag.
    pub enabled: bool,
    /// Localized titles.
    pub displays: Vec<ChapterDisplay>,
    /// Nested chapters.
    pub nested: Vec<MatroskaChapter>,
}

impl MatroskaChapter {
    fn parse<R: Read + Seek + ?Sized>(
        tree: &mut Tree<ebml::EbmlFormat>,
        node: NodeId,
        io: &mut R,
        notifications: &mut NotificationList,
    ) -> Result<Self> {
        let mut chapter = MatroskaChapter {
            enabled: true,
            ..Default::default()
        };
        let mut child = tree.first_child(node);
        while let Some(c) = child {
            tree.parse(c, io)?;
            match tree.node(c).id() {
                ids::CHAPTER_UID => {
                    let data = tree.read_data(c, io)?;
                    chapter.uid = ebml::parse_uint(&data)?;
                }
                ids::CHAPTER_TIME_START => {
                    let data = tree.read_data(c, io)?;
                    chapter.start_time = ebml::parse_uint(&data)?;
                }
                ids::CHAPTER_TIME_END => {
                    let data = tree.read_data(c, io)?;
                    chapter.end_time = Some(ebml::parse_uint(&data)?);
                }
                ids::CHAPTER_FLAG_HIDDEN => {
                    let data = tree.read_data(c, io)?;
                    chapter.hidden = ebml::parse_uint(&data)? != 0;
                }
                ids::CHAPTER_FLAG_ENABLED => {
                    let data = tree.read_data(c, io)?;
                    chapter.enabled = ebml::parse_uint(&data)? != 0;
                }
                ids::CHAPTER_DISPLAY => {
                    let mut display = ChapterDisplay::default();
                    let mut sub = tree.first_child(c);
                    while let Some(s) = sub {
                        tree.parse(s, io)?;
                        match tree.node(s).id() {
                            ids::CHAP_STRING => {
                                let data = tree.read_data(s, io)?;
                                display.title = ebml::parse_string(&data)?;
                            }
                            ids::CHAP_LANGUAGE => {
                                let data = tree.read_data(s, io)?;
                                display.language = Some(ebml::parse_string(&data)?);
                            }
                            _ => {}
                        }
                        sub = tree.next_sibling(s);
                    }
                    chapter.displays.push(display);
                }
                ids::CHAPTER_ATOM => {
                    chapter
                        .nested
                        .push(Self::parse(tree, c, io, notifications)?);
                }
                ids::VOID | ids::CRC32 => {}
                other => notifications.warning(
                    CONTEXT,
                    format!(
                        "\"ChapterAtom\"-element contains unknown child 0x{:X}; it will be ignored",
                        other
                    ),
                ),
            }
            child = tree.next_sibling(c);
        }
        Ok(chapter)
    }
}

/// One edition of a segment: a flat list of top-level chapters.
#[derive(Debug, Clone, Default)]
pub struct ChapterEdition {
    /// Edition UID.
    pub uid: u64,
    /// Hidden flag.
    pub hidden: bool,
    /// Default flag.
    pub default: bool,
    /// Ordered flag.
    pub ordered: bool,
    /// Chapters of this edition.
    pub chapters: Vec<MatroskaChapter>,
}

impl ChapterEdition {
    /// Parses an "EditionEntry" element including its nested chapter atoms.
    ///
    /// Fails with `NoDataFound` when the edition holds no chapters; the
    /// caller drops the entry in that case.
    pub fn parse_nested<R: Read + Seek + ?Sized>(
        tree: &mut Tree<ebml::EbmlFormat>,
        node: NodeId,
        io: &mut R,
        notifications: &mut NotificationList,
    ) -> Result<Self> {
        tree.parse(node, io)?;
        let mut edition = ChapterEdition::default();
        let mut child = tree.first_child(node);
        while let Some(c) = child {
            tree.parse(c, io)?;
            match tree.node(c).id() {
                ids::EDITION_UID => {
                    let data = tree.read_data(c, io)?;
                    edition.uid = ebml::parse_uint(&data)?;
                }
                ids::EDITION_FLAG_HIDDEN => {
                    let data = tree.read_data(c, io)?;
                    edition.hidden = ebml::parse_uint(&data)? != 0;
                }
                ids::EDITION_FLAG_DEFAULT => {
                    let data = tree.read_data(c, io)?;
                    edition.default = ebml::parse_uint(&data)? != 0;
                }
                ids::EDITION_FLAG_ORDERED => {
                    let data = tree.read_data(c, io)?;
                    edition.ordered = ebml::parse_uint(&data)? != 0;
                }
                ids::CHAPTER_ATOM => {
                    edition
                        .chapters
                        .push(MatroskaChapter::parse(tree, c, io, notifications)?);
                }
                ids::VOID | ids::CRC32 => {}
                other => notifications.warning(
                    CONTEXT,
                    format!(
                        "\"EditionEntry\"-element contains unknown child 0x{:X}; it will be ignored",
                        other
                    ),
                ),
            }
            child = tree.next_sibling(c);
        }
        if edition.chapters.is_empty() {
            return Err(Error::NoDataFound);
        }
        Ok(edition)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use retag_core::tree::Tree;
    use std::io::Cursor;

    fn chapter_atom(uid: u64, start: u64, title: &str) -> Vec<u8> {
        let mut display = Vec::new();
        ebml::make_string(&mut display, ids::CHAP_STRING, title).unwrap();
        ebml::make_string(&mut display, ids::CHAP_LANGUAGE, "eng").unwrap();

        let mut atom = Vec::new();
        ebml::make_uint(&mut atom, ids::CHAPTER_UID, uid).unwrap();
        ebml::make_uint(&mut atom, ids::CHAPTER_TIME_START, start).unwrap();
        ebml::write_id(&mut atom, ids::CHAPTER_DISPLAY).unwrap();
        ebml::write_size(&mut atom, display.len() as u64).unwrap();
        atom.extend_from_slice(&display);

        let mut out = Vec::new();
        ebml::write_id(&mut out, ids::CHAPTER_ATOM).unwrap();
        ebml::write_size(&mut out, atom.len() as u64).unwrap();
        out.extend_from_slice(&atom);
        out
    }

    #[test]
    fn test_parse_edition_with_chapters() {
        let mut content = Vec::new();
        ebml::make_uint(&mut content, ids::EDITION_UID, 7).unwrap();
        content.extend_from_slice(&chapter_atom(1, 0, "Intro"));
        content.extend_from_slice(&chapter_atom(2, 60_000_000_000, "Main"));

        let mut data = Vec::new();
        ebml::write_id(&mut data, ids::EDITION_ENTRY).unwrap();
        ebml::write_size(&mut data, content.len() as u64).unwrap();
        data.extend_from_slice(&content);

        let mut io = Cursor::new(data.clone());
        let mut tree: Tree<ebml::EbmlFormat> = Tree::new(0, data.len() as u64);
        let root = tree.root();
        let mut notifications = NotificationList::new();
        let edition =
            ChapterEdition::parse_nested(&mut tree, root, &mut io, &mut notifications).unwrap();

        assert_eq!(edition.uid, 7);
        assert_eq!(edition.chapters.len(), 2);
        assert_eq!(edition.chapters[0].displays[0].title, "Intro");
        assert_eq!(edition.chapters[1].start_time, 60_000_000_000);
        assert!(notifications.is_empty());
    }

    #[test]
    fn test_empty_edition_is_no_data() {
        let mut data = Vec::new();
        ebml::write_id(&mut data, ids::EDITION_ENTRY).unwrap();
        ebml::write_size(&mut data, 0).unwrap();

        let mut io = Cursor::new(data.clone());
        let mut tree: Tree<ebml::EbmlFormat> = Tree::new(0, data.len() as u64);
        let root = tree.root();
        let mut notifications = NotificationList::new();
        let result = ChapterEdition::parse_nested(&mut tree, root, &mut io, &mut notifications);
        assert!(matches!(result, Err(Error::NoDataFound)));
    }
}
