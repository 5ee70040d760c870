//! Matroska tag model and serialisation.
//!
//! A "Tag" element pairs a target description (which track, edition,
//! chapter or attachment the tag applies to) with a list of "SimpleTag"
//! name/value entries, possibly nested. Parsing keeps everything needed to
//! re-encode the tag canonically; [`TagMaker`] precomputes the encoded
//! size so the segment planner can lay out the file before any byte is
//! written.

use crate::ebml;
use crate::ids;

use retag_core::error::{Error, Result};
use retag_core::notify::NotificationList;
use retag_core::tree::{NodeId, Tree};

use std::io::{Read, Seek, Write};

const CONTEXT: &str = "parsing \"Tag\"-element";

/// Value of a simple tag.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum TagValue {
    /// No value present.
    #[default]
    Empty,
    /// UTF-8 string value.
    String(String),
    /// Binary value.
    Binary(Vec<u8>),
}

impl TagValue {
    /// Returns whether no value is present.
    pub fn is_empty(&self) -> bool {
        match self {
            TagValue::Empty => true,
            TagValue::String(s) => s.is_empty(),
            TagValue::Binary(b) => b.is_empty(),
        }
    }
}

/// A name/value entry of a tag, possibly holding nested entries.
#[derive(Debug, Clone, Default)]
pub struct SimpleTag {
    /// Tag name, e.g. `"TITLE"`.
    pub name: String,
    /// Tag language.
    pub language: Option<String>,
    /// Default-language flag.
    pub default: Option<u64>,
    /// Tag value.
    pub value: TagValue,
    /// Nested entries.
    pub nested: Vec<SimpleTag>,
}

impl SimpleTag {
    /// Creates a simple tag with a string value.
    pub fn with_string(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: TagValue::String(value.into()),
            ..Default::default()
        }
    }

    fn data_size(&self) -> u64 {
        let mut size = ebml::binary_element_size(ids::TAG_NAME, self.name.len() as u64);
        if let Some(language) = &self.language {
            size += ebml::binary_element_size(ids::TAG_LANGUAGE, language.len() as u64);
        }
        if let Some(default) = self.default {
            size += ebml::uint_element_size(ids::TAG_DEFAULT, default);
        }
        match &self.value {
            TagValue::Empty => {}
            TagValue::String(s) => {
                size += ebml::binary_element_size(ids::TAG_STRING, s.len() as u64);
            }
            TagValue::Binary(b) => {
                size += ebml::binary_element_size(ids::TAG_BINARY, b.len() as u64);
            }
        }
        size + self.nested.iter().map(|n| n.total_size()).sum::<u64>()
    }

    fn total_size(&self) -> u64 {
        let data = self.data_size();
        2 + u64::from(ebml::size_denotation_length(data)) + data
    }

    fn make<W: Write + ?Sized>(&self, out: &mut W) -> Result<()> {
        ebml::write_id(out, ids::SIMPLE_TAG)?;
        ebml::write_size(out, self.data_size())?;
        ebml::make_string(out, ids::TAG_NAME, &self.name)?;
        if let Some(language) = &self.language {
            ebml::make_string(out, ids::TAG_LANGUAGE, language)?;
        }
        if let Some(default) = self.default {
            ebml::make_uint(out, ids::TAG_DEFAULT, default)?;
        }
        match &self.value {
            TagValue::Empty => {}
            TagValue::String(s) => {
                ebml::make_string(out, ids::TAG_STRING, s)?;
            }
            TagValue::Binary(b) => {
                ebml::make_binary(out, ids::TAG_BINARY, b)?;
            }
        }
        for nested in &self.nested {
            nested.make(out)?;
        }
        Ok(())
    }
}

/// Target description of a tag.
#[derive(Debug, Clone, Default)]
pub struct TagTarget {
    /// Target type value (e.g. 50 for "album level").
    pub type_value: Option<u64>,
    /// Target type string.
    pub target_type: Option<String>,
    /// Referenced track UIDs.
    pub track_uids: Vec<u64>,
    /// Referenced edition UIDs.
    pub edition_uids: Vec<u64>,
    /// Referenced chapter UIDs.
    pub chapter_uids: Vec<u64>,
    /// Referenced attachment UIDs.
    pub attachment_uids: Vec<u64>,
}

impl TagTarget {
    fn is_default(&self) -> bool {
        self.type_value.is_none()
            && self.target_type.is_none()
            && self.track_uids.is_empty()
            && self.edition_uids.is_empty()
            && self.chapter_uids.is_empty()
            && self.attachment_uids.is_empty()
    }

    fn data_size(&self) -> u64 {
        let mut size = 0;
        if let Some(type_value) = self.type_value {
            size += ebml::uint_element_size(ids::TARGET_TYPE_VALUE, type_value);
        }
        if let Some(target_type) = &self.target_type {
            size += ebml::binary_element_size(ids::TARGET_TYPE, target_type.len() as u64);
        }
        for &uid in &self.track_uids {
            size += ebml::uint_element_size(ids::TAG_TRACK_UID, uid);
        }
        for &uid in &self.edition_uids {
            size += ebml::uint_element_size(ids::TAG_EDITION_UID, uid);
        }
        for &uid in &self.chapter_uids {
            size += ebml::uint_element_size(ids::TAG_CHAPTER_UID, uid);
        }
        for &uid in &self.attachment_uids {
            size += ebml::uint_element_size(ids::TAG_ATTACHMENT_UID, uid);
        }
        size
    }

    fn total_size(&self) -> u64 {
        if self.is_default() {
            return 0;
        }
        let data = self.data_size();
        2 + u64::from(ebml::size_denotation_length(data)) + data
    }

    fn make<W: Write + ?Sized>(&self, out: &mut W) -> Result<()> {
        if self.is_default() {
            return Ok(());
        }
        ebml::write_id(out, ids::TARGETS)?;
        ebml::write_size(out, self.data_size())?;
        if let Some(type_value) = self.type_value {
            ebml::make_uint(out, ids::TARGET_TYPE_VALUE, type_value)?;
        }
        if let Some(target_type) = &self.target_type {
            ebml::make_string(out, ids::TARGET_TYPE, target_type)?;
        }
        for &uid in &self.track_uids {
            ebml::make_uint(out, ids::TAG_TRACK_UID, uid)?;
        }
        for &uid in &self.edition_uids {
            ebml::make_uint(out, ids::TAG_EDITION_UID, uid)?;
        }
        for &uid in &self.chapter_uids {
            ebml::make_uint(out, ids::TAG_CHAPTER_UID, uid)?;
        }
        for &uid in &self.attachment_uids {
            ebml::make_uint(out, ids::TAG_ATTACHMENT_UID, uid)?;
        }
        Ok(())
    }
}

/// A Matroska tag: one target plus its simple tags.
#[derive(Debug, Clone, Default)]
pub struct MatroskaTag {
    /// Target description.
    pub target: TagTarget,
    /// Name/value entries.
    pub simple_tags: Vec<SimpleTag>,
}

impl MatroskaTag {
    /// Creates an empty tag addressing the whole file.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a "Tag" element.
    ///
    /// Fails with `NoDataFound` when the element holds no usable simple
    /// tag; the caller drops the entry in that case.
    pub fn parse<R: Read + Seek + ?Sized>(
        tree: &mut Tree<ebml::EbmlFormat>,
        tag_node: NodeId,
        io: &mut R,
        notifications: &mut NotificationList,
    ) -> Result<Self> {
        tree.parse(tag_node, io)?;
        let mut tag = MatroskaTag::new();
        let mut child = tree.first_child(tag_node);
        while let Some(c) = child {
            tree.parse(c, io)?;
            match tree.node(c).id() {
                ids::TARGETS => tag.parse_targets(tree, c, io)?,
                ids::SIMPLE_TAG => {
                    if let Some(simple) = Self::parse_simple_tag(tree, c, io, notifications)? {
                        tag.simple_tags.push(simple);
                    }
                }
                ids::VOID | ids::CRC32 => {}
                other => notifications.warning(
                    CONTEXT,
                    format!(
                        "\"Tag\"-element contains unknown child 0x{:X}; it will be ignored",
                        other
                    ),
                ),
            }
            child = tree.next_sibling(c);
        }
        if tag.simple_tags.is_empty() {
            return Err(Error::NoDataFound);
        }
        Ok(tag)
    }

    fn parse_targets<R: Read + Seek + ?Sized>(
        &mut self,
        tree: &mut Tree<ebml::EbmlFormat>,
        node: NodeId,
        io: &mut R,
    ) -> Result<()> {
        let mut child = tree.first_child(node);
        while let Some(c) = child {
            tree.parse(c, io)?;
            let id = tree.node(c).id();
            match id {
                ids::TARGET_TYPE_VALUE => {
                    let data = tree.read_data(c, io)?;
                    self.target.type_value = Some(ebml::parse_uint(&data)?);
                }
                ids::TARGET_TYPE => {
                    let data = tree.read_data(c, io)?;
                    self.target.target_type = Some(ebml::parse_string(&data)?);
                }
                ids::TAG_TRACK_UID | ids::TAG_EDITION_UID | ids::TAG_CHAPTER_UID
                | ids::TAG_ATTACHMENT_UID => {
                    let data = tree.read_data(c, io)?;
                    let uid = ebml::parse_uint(&data)?;
                    match id {
                        ids::TAG_TRACK_UID => self.target.track_uids.push(uid),
                        ids::TAG_EDITION_UID => self.target.edition_uids.push(uid),
                        ids::TAG_CHAPTER_UID => self.target.chapter_uids.push(uid),
                        _ => self.target.attachment_uids.push(uid),
                    }
                }
                _ => {}
            }
            child = tree.next_sibling(c);
        }
        Ok(())
    }

    fn parse_simple_tag<R: Read + Seek + ?Sized>(
        tree: &mut Tree<ebml::EbmlFormat>,
        node: NodeId,
        io: &mut R,
        notifications: &mut NotificationList,
    ) -> Result<Option<SimpleTag>> {
        let mut simple = SimpleTag::default();
        let mut child = tree.first_child(node);
        while let Some(c) = child {
            tree.parse(c, io)?;
            match tree.node(c).id() {
                ids::TAG_NAME => {
                    let data = tree.read_data(c, io)?;
                    simple.name = ebml::parse_string(&data)?;
                }
                ids::TAG_LANGUAGE => {
                    let data = tree.read_data(c, io)?;
                    simple.language = Some(ebml::parse_string(&data)?);
                }
                ids::TAG_DEFAULT => {
                    let data = tree.read_data(c, io)?;
                    simple.default = Some(ebml::parse_uint(&data)?);
                }
                ids::TAG_STRING => {
                    let data = tree.read_data(c, io)?;
                    simple.value = TagValue::String(ebml::parse_string(&data)?);
                }
                ids::TAG_BINARY => {
                    simple.value = TagValue::Binary(tree.read_data(c, io)?);
                }
                ids::SIMPLE_TAG => {
                    if let Some(nested) = Self::parse_simple_tag(tree, c, io, notifications)? {
                        simple.nested.push(nested);
                    }
                }
                ids::VOID | ids::CRC32 => {}
                other => notifications.warning(
                    CONTEXT,
                    format!(
                        "\"SimpleTag\"-element contains unknown child 0x{:X}; it will be ignored",
                        other
                    ),
                ),
            }
            child = tree.next_sibling(c);
        }
        if simple.name.is_empty() && simple.value.is_empty() && simple.nested.is_empty() {
            notifications.warning(CONTEXT, "empty \"SimpleTag\"-element is dropped");
            return Ok(None);
        }
        Ok(Some(simple))
    }
}

/// Precomputed serialisation of one tag.
#[derive(Debug, Clone)]
pub struct TagMaker {
    tag: MatroskaTag,
    data_size: u64,
    total_size: u64,
}

impl TagMaker {
    /// Prepares the serialisation of `tag`.
    pub fn new(tag: MatroskaTag) -> Self {
        let data_size = tag.target.total_size()
            + tag.simple_tags.iter().map(|s| s.total_size()).sum::<u64>();
        let total_size = 2 + u64::from(ebml::size_denotation_length(data_size)) + data_size;
        Self {
            tag,
            data_size,
            total_size,
        }
    }

    /// Encoded size of the "Tag" element including its header.
    ///
    /// A size of 3 bytes means the tag is empty; the planner skips it.
    pub fn required_size(&self) -> u64 {
        self.total_size
    }

    /// Emits the "Tag" element.
    pub fn make<W: Write + ?Sized>(&self, out: &mut W) -> Result<()> {
        ebml::write_id(out, ids::TAG)?;
        ebml::write_size(out, self.data_size)?;
        self.tag.target.make(out)?;
        for simple in &self.tag.simple_tags {
            simple.make(out)?;
        }
        Ok(())
    }
}
