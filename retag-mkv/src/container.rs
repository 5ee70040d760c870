//! The Matroska container: lifecycle, discovery and validation.
//!
//! A [`MatroskaContainer`] owns the stream and the lazy element tree.
//! `parse_header` walks the top-level structure once, collecting the
//! interesting level-1 elements (and resolving elements denoted by seek
//! indexes so tags behind the clusters are found without walking to EOF);
//! the `parse_*` methods then build the inspection models on demand.
//! `apply_changes` plans and writes the modified file (see the `planner`
//! and `writer` modules).

use crate::attachments::MatroskaAttachment;
use crate::chapters::ChapterEdition;
use crate::ebml::{self, EbmlFormat};
use crate::ids;
use crate::seek_info::SeekInfo;
use crate::tags::MatroskaTag;
use crate::tracks::MatroskaTrack;

use retag_core::error::{Error, Result};
use retag_core::io::ReadSeekExt;
use retag_core::notify::NotificationList;
use retag_core::progress::Progress;
use retag_core::tree::{NodeId, Tree};

use rand::Rng;

use std::fs::File;
use std::io::{Read, Seek};
use std::path::PathBuf;
use std::time::Duration;

/// Application string written as "MuxingApp" and "WritingApp".
pub const APP_INFO: &str = concat!("retag v", env!("CARGO_PKG_VERSION"));

/// Default threshold above which header parsing short-circuits instead of
/// walking every cluster to find trailing metadata.
pub const DEFAULT_MAX_FULL_PARSE_SIZE: u64 = 0x320_0000;

/// Placement of an element group relative to the media data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ElementPosition {
    /// Before the first cluster.
    BeforeData,
    /// After the last cluster.
    AfterData,
    /// Keep the placement found in the file.
    #[default]
    Keep,
}

/// Policy knobs consulted when writing.
#[derive(Debug, Clone)]
pub struct WriteConfig {
    /// Desired placement of tags and attachments.
    pub tag_position: ElementPosition,
    /// Refuse to move tags away from `tag_position`.
    pub force_tag_position: bool,
    /// Desired placement of the cue index.
    pub index_position: ElementPosition,
    /// Refuse to move the index away from `index_position`.
    pub force_index_position: bool,
    /// Padding written on a full rewrite.
    pub preferred_padding: u64,
    /// Smallest padding acceptable without a rewrite.
    pub min_padding: u64,
    /// Largest padding acceptable without a rewrite.
    pub max_padding: u64,
    /// Always rewrite, even when patching would do.
    pub force_rewrite: bool,
    /// Write to this path instead of rewriting in place.
    pub save_file_path: Option<PathBuf>,
    /// See [`DEFAULT_MAX_FULL_PARSE_SIZE`].
    pub max_full_parse_size: u64,
}

impl Default for WriteConfig {
    fn default() -> Self {
        Self {
            tag_position: ElementPosition::Keep,
            force_tag_position: false,
            index_position: ElementPosition::Keep,
            force_index_position: false,
            preferred_padding: 0,
            min_padding: 0,
            max_padding: u64::MAX,
            force_rewrite: false,
            save_file_path: None,
            max_full_parse_size: DEFAULT_MAX_FULL_PARSE_SIZE,
        }
    }
}

/// A Matroska/WebM container over a seekable stream.
pub struct MatroskaContainer<S: Read + Seek> {
    pub(crate) stream: S,
    pub(crate) path: Option<PathBuf>,
    pub(crate) start_offset: u64,
    pub(crate) file_size: u64,
    pub(crate) tree: Tree<EbmlFormat>,

    // EBML header fields.
    pub(crate) version: u64,
    pub(crate) read_version: u64,
    pub(crate) max_id_length: u64,
    pub(crate) max_size_length: u64,
    pub(crate) doctype: String,
    pub(crate) doctype_version: u64,
    pub(crate) doctype_read_version: u64,

    // Level-1 elements discovered by `parse_header`.
    pub(crate) segment_count: usize,
    pub(crate) tracks_elements: Vec<NodeId>,
    pub(crate) segment_info_elements: Vec<NodeId>,
    pub(crate) tags_elements: Vec<NodeId>,
    pub(crate) chapters_elements: Vec<NodeId>,
    pub(crate) attachments_elements: Vec<NodeId>,
    pub(crate) seek_infos: Vec<SeekInfo>,

    // Parsed models.
    pub(crate) tags: Vec<MatroskaTag>,
    pub(crate) tracks: Vec<MatroskaTrack>,
    pub(crate) editions: Vec<ChapterEdition>,
    pub(crate) attachments: Vec<MatroskaAttachment>,
    pub(crate) titles: Vec<String>,
    pub(crate) duration: Duration,

    pub(crate) header_parsed: bool,
    pub(crate) notifications: NotificationList,
    pub(crate) progress: Progress,
    pub(crate) config: WriteConfig,
}

/// Returns whether an error must stop processing instead of being recorded
/// as a notification at an element boundary.
pub(crate) fn is_fatal(error: &Error) -> bool {
    matches!(error, Error::Io(_) | Error::OperationAborted)
}

fn excludes_offset(tree: &Tree<EbmlFormat>, elements: &[NodeId], offset: u64) -> bool {
    elements
        .iter()
        .all(|&e| tree.node(e).start_offset() != offset)
}

impl MatroskaContainer<File> {
    /// Opens the file at `path`.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let file = File::open(&path)?;
        let mut container = Self::from_stream(file, 0)?;
        container.path = Some(path);
        Ok(container)
    }
}

impl<S: Read + Seek> MatroskaContainer<S> {
    /// Creates a container over `stream`, with the EBML structure starting
    /// at `start_offset`.
    pub fn from_stream(mut stream: S, start_offset: u64) -> Result<Self> {
        let file_size = stream.stream_len()?;
        let max = file_size.saturating_sub(start_offset);
        Ok(Self {
            stream,
            path: None,
            start_offset,
            file_size,
            tree: Tree::new(start_offset, max),
            version: 1,
            read_version: 1,
            max_id_length: 4,
            max_size_length: 8,
            doctype: "matroska".into(),
            doctype_version: 1,
            doctype_read_version: 1,
            segment_count: 0,
            tracks_elements: Vec::new(),
            segment_info_elements: Vec::new(),
            tags_elements: Vec::new(),
            chapters_elements: Vec::new(),
            attachments_elements: Vec::new(),
            seek_infos: Vec::new(),
            tags: Vec::new(),
            tracks: Vec::new(),
            editions: Vec::new(),
            attachments: Vec::new(),
            titles: Vec::new(),
            duration: Duration::ZERO,
            header_parsed: false,
            notifications: NotificationList::new(),
            progress: Progress::default(),
            config: WriteConfig::default(),
        })
    }

    /// Resets all parsed state; the next `parse_header` starts from scratch.
    pub fn reset(&mut self) -> Result<()> {
        self.file_size = self.stream.stream_len()?;
        let max = self.file_size.saturating_sub(self.start_offset);
        self.tree.reset(self.start_offset, max);
        self.version = 1;
        self.read_version = 1;
        self.max_id_length = 4;
        self.max_size_length = 8;
        self.doctype = "matroska".into();
        self.doctype_version = 1;
        self.doctype_read_version = 1;
        self.segment_count = 0;
        self.tracks_elements.clear();
        self.segment_info_elements.clear();
        self.tags_elements.clear();
        self.chapters_elements.clear();
        self.attachments_elements.clear();
        self.seek_infos.clear();
        self.tags.clear();
        self.tracks.clear();
        self.editions.clear();
        self.attachments.clear();
        self.titles.clear();
        self.duration = Duration::ZERO;
        self.header_parsed = false;
        Ok(())
    }

    /// Walks the top-level structure once and collects the level-1 elements
    /// of every segment.
    ///
    /// When a cluster is reached, elements denoted by the seek indexes seen
    /// so far are resolved, and the walk stops early once tracks, tags and
    /// segment information are known (or the file exceeds
    /// `max_full_parse_size`).
    pub fn parse_header(&mut self) -> Result<()> {
        const CONTEXT: &str = "parsing Matroska container header";
        self.reset()?;
        tracing::debug!(size = self.file_size, "parsing container header");

        let mut current_offset = 0u64;
        let mut seek_infos_index = 0usize;
        let mut finished = false;

        let mut top = Some(self.tree.root());
        while let Some(t) = top {
            if finished {
                break;
            }
            if let Err(err) = self.tree.parse(t, &mut self.stream) {
                if is_fatal(&err) {
                    return Err(err);
                }
                self.notifications.critical(
                    CONTEXT,
                    format!(
                        "unable to parse top-level element at {}: {}",
                        self.tree.node(t).start_offset(),
                        err
                    ),
                );
                break;
            }
            match self.tree.node(t).id() {
                ids::EBML => {
                    if let Err(err) = self.parse_ebml_header(t) {
                        if is_fatal(&err) {
                            return Err(err);
                        }
                        self.notifications
                            .critical(CONTEXT, "unable to parse all children of the EBML header");
                        if matches!(err, Error::InvalidData(_)) {
                            return Err(err);
                        }
                    }
                }
                ids::SEGMENT => {
                    self.segment_count += 1;
                    let mut child = self.tree.first_child(t);
                    while let Some(c) = child {
                        if let Err(err) = self.tree.parse(c, &mut self.stream) {
                            if is_fatal(&err) {
                                return Err(err);
                            }
                            self.notifications.critical(
                                CONTEXT,
                                format!(
                                    "unable to parse all children of the \"Segment\"-element: {}",
                                    err
                                ),
                            );
                            break;
                        }
                        match self.tree.node(c).id() {
                            ids::SEEK_HEAD => {
                                let mut info = SeekInfo::new();
                                let result = info.parse(&mut self.tree, c, &mut self.stream);
                                info.take_notifications(&mut self.notifications);
                                if let Err(err) = result {
                                    if is_fatal(&err) {
                                        return Err(err);
                                    }
                                    self.notifications.critical(
                                        CONTEXT,
                                        format!("unable to parse \"SeekHead\"-element: {}", err),
                                    );
                                } else {
                                    self.seek_infos.push(info);
                                }
                            }
                            ids::TRACKS => {
                                let offset = self.tree.node(c).start_offset();
                                if excludes_offset(&self.tree, &self.tracks_elements, offset) {
                                    self.tracks_elements.push(c);
                                }
                            }
                            ids::INFO => {
                                let offset = self.tree.node(c).start_offset();
                                if excludes_offset(&self.tree, &self.segment_info_elements, offset)
                                {
                                    self.segment_info_elements.push(c);
                                }
                            }
                            ids::TAGS => {
                                let offset = self.tree.node(c).start_offset();
                                if excludes_offset(&self.tree, &self.tags_elements, offset) {
                                    self.tags_elements.push(c);
                                }
                            }
                            ids::CHAPTERS => {
                                let offset = self.tree.node(c).start_offset();
                                if excludes_offset(&self.tree, &self.chapters_elements, offset) {
                                    self.chapters_elements.push(c);
                                }
                            }
                            ids::ATTACHMENTS => {
                                let offset = self.tree.node(c).start_offset();
                                if excludes_offset(&self.tree, &self.attachments_elements, offset) {
                                    self.attachments_elements.push(c);
                                }
                            }
                            ids::CLUSTER => {
                                self.resolve_seek_info_elements(
                                    t,
                                    current_offset,
                                    &mut seek_infos_index,
                                )?;
                                // Stop as soon as everything of interest is
                                // known; big files are never walked to EOF.
                                if ((!self.tracks_elements.is_empty()
                                    && !self.tags_elements.is_empty())
                                    || self.file_size > self.config.max_full_parse_size)
                                    && !self.segment_info_elements.is_empty()
                                {
                                    finished = true;
                                    break;
                                }
                            }
                            _ => {}
                        }
                        child = self.tree.next_sibling(c);
                    }
                    current_offset += self.tree.node(t).total_size();
                }
                _ => {}
            }
            top = self.tree.next_sibling(t);
        }

        if let Err(err) = self.parse_segment_info() {
            if is_fatal(&err) {
                return Err(err);
            }
            self.notifications
                .critical(CONTEXT, "unable to parse the segment \"Info\"-element");
        }
        self.header_parsed = true;
        Ok(())
    }

    fn parse_ebml_header(&mut self, header: NodeId) -> Result<()> {
        const CONTEXT: &str = "parsing EBML header";
        let mut child = self.tree.first_child(header);
        while let Some(c) = child {
            self.tree.parse(c, &mut self.stream)?;
            let id = self.tree.node(c).id();
            match id {
                ids::EBML_VERSION => {
                    let data = self.tree.read_data(c, &mut self.stream)?;
                    self.version = ebml::parse_uint(&data)?;
                }
                ids::EBML_READ_VERSION => {
                    let data = self.tree.read_data(c, &mut self.stream)?;
                    self.read_version = ebml::parse_uint(&data)?;
                }
                ids::DOC_TYPE => {
                    let data = self.tree.read_data(c, &mut self.stream)?;
                    self.doctype = ebml::parse_string(&data)?;
                }
                ids::DOC_TYPE_VERSION => {
                    let data = self.tree.read_data(c, &mut self.stream)?;
                    self.doctype_version = ebml::parse_uint(&data)?;
                }
                ids::DOC_TYPE_READ_VERSION => {
                    let data = self.tree.read_data(c, &mut self.stream)?;
                    self.doctype_read_version = ebml::parse_uint(&data)?;
                }
                ids::EBML_MAX_ID_LENGTH => {
                    let data = self.tree.read_data(c, &mut self.stream)?;
                    self.max_id_length = ebml::parse_uint(&data)?;
                    if self.max_id_length > u64::from(ebml::MAX_ID_LENGTH) {
                        self.notifications.critical(
                            CONTEXT,
                            format!(
                                "maximum EBML element ID length greater than {} bytes is not supported",
                                ebml::MAX_ID_LENGTH
                            ),
                        );
                        return Err(Error::InvalidData(
                            "unsupported maximum EBML element ID length".into(),
                        ));
                    }
                }
                ids::EBML_MAX_SIZE_LENGTH => {
                    let data = self.tree.read_data(c, &mut self.stream)?;
                    self.max_size_length = ebml::parse_uint(&data)?;
                    if self.max_size_length > u64::from(ebml::MAX_SIZE_LENGTH) {
                        self.notifications.critical(
                            CONTEXT,
                            format!(
                                "maximum EBML element size length greater than {} bytes is not supported",
                                ebml::MAX_SIZE_LENGTH
                            ),
                        );
                        return Err(Error::InvalidData(
                            "unsupported maximum EBML element size length".into(),
                        ));
                    }
                }
                _ => {}
            }
            child = self.tree.next_sibling(c);
        }
        Ok(())
    }

    /// Inspects the elements denoted by the seek indexes collected so far
    /// and registers tags, attachments and the like found behind the
    /// clusters.
    fn resolve_seek_info_elements(
        &mut self,
        segment: NodeId,
        current_offset: u64,
        seek_infos_index: &mut usize,
    ) -> Result<()> {
        const CONTEXT: &str = "parsing Matroska container header";
        let segment_data_offset = self.tree.node(segment).data_offset();
        while *seek_infos_index < self.seek_infos.len() {
            let entries: Vec<_> = self.seek_infos[*seek_infos_index].entries().to_vec();
            *seek_infos_index += 1;
            for entry in entries {
                let offset = current_offset + segment_data_offset + entry.offset;
                if offset >= self.file_size {
                    self.notifications.critical(
                        CONTEXT,
                        format!(
                            "offset ({}) denoted by \"SeekHead\"-element is invalid",
                            offset
                        ),
                    );
                    continue;
                }
                let node = self.tree.alloc_detached(offset, self.file_size - offset);
                if let Err(err) = self.tree.parse(node, &mut self.stream) {
                    if is_fatal(&err) {
                        return Err(err);
                    }
                    self.notifications.critical(
                        CONTEXT,
                        format!(
                            "unable to parse element at {} (denoted using \"SeekHead\"-element)",
                            offset
                        ),
                    );
                    continue;
                }
                let found = self.tree.node(node).id();
                if found != entry.id {
                    self.notifications.critical(
                        CONTEXT,
                        format!(
                            "ID of element {} at {} does not match the ID denoted in the \
                             \"SeekHead\"-element (0x{:X})",
                            self.tree.id_to_string(node),
                            offset,
                            entry.id
                        ),
                    );
                }
                let list = match found {
                    ids::INFO => &mut self.segment_info_elements,
                    ids::TRACKS => &mut self.tracks_elements,
                    ids::TAGS => &mut self.tags_elements,
                    ids::CHAPTERS => &mut self.chapters_elements,
                    ids::ATTACHMENTS => &mut self.attachments_elements,
                    _ => continue,
                };
                if excludes_offset(&self.tree, list, offset) {
                    list.push(node);
                }
            }
        }
        Ok(())
    }

    /// Reads titles and the cumulative duration from the segment
    /// "Info"-elements.
    fn parse_segment_info(&mut self) -> Result<()> {
        if self.segment_info_elements.is_empty() {
            return Err(Error::NoDataFound);
        }
        self.duration = Duration::ZERO;
        self.titles.clear();
        for index in 0..self.segment_info_elements.len() {
            let element = self.segment_info_elements[index];
            self.tree.parse(element, &mut self.stream)?;
            let mut raw_duration = 0.0f64;
            let mut time_scale = 0u64;
            let mut has_title = false;
            let mut child = self.tree.first_child(element);
            while let Some(c) = child {
                self.tree.parse(c, &mut self.stream)?;
                match self.tree.node(c).id() {
                    ids::TITLE => {
                        let data = self.tree.read_data(c, &mut self.stream)?;
                        self.titles.push(ebml::parse_string(&data)?);
                        has_title = true;
                    }
                    ids::DURATION => {
                        let data = self.tree.read_data(c, &mut self.stream)?;
                        raw_duration = ebml::parse_float(&data)?;
                    }
                    ids::TIMECODE_SCALE => {
                        let data = self.tree.read_data(c, &mut self.stream)?;
                        time_scale = ebml::parse_uint(&data)?;
                    }
                    _ => {}
                }
                child = self.tree.next_sibling(c);
            }
            if !has_title {
                // Every segment gets a title slot so indexes line up.
                self.titles.push(String::new());
            }
            if raw_duration > 0.0 && time_scale > 0 {
                self.duration +=
                    Duration::from_secs_f64(raw_duration * time_scale as f64 / 1_000_000_000.0);
            }
        }
        Ok(())
    }

    /// Parses the tags of all discovered "Tags"-elements.
    pub fn parse_tags(&mut self) -> Result<()> {
        const CONTEXT: &str = "parsing tags of Matroska container";
        for index in 0..self.tags_elements.len() {
            let element = self.tags_elements[index];
            self.tree.parse(element, &mut self.stream)?;
            let mut child = self.tree.first_child(element);
            while let Some(c) = child {
                self.tree.parse(c, &mut self.stream)?;
                match self.tree.node(c).id() {
                    ids::TAG => {
                        match MatroskaTag::parse(
                            &mut self.tree,
                            c,
                            &mut self.stream,
                            &mut self.notifications,
                        ) {
                            Ok(tag) => self.tags.push(tag),
                            Err(Error::NoDataFound) => {}
                            Err(err) if is_fatal(&err) => return Err(err),
                            Err(_) => self.notifications.critical(
                                CONTEXT,
                                format!("unable to parse tag {}", self.tags.len()),
                            ),
                        }
                    }
                    ids::VOID | ids::CRC32 => {}
                    _ => self.notifications.warning(
                        CONTEXT,
                        "\"Tags\"-element contains unknown child; it will be ignored",
                    ),
                }
                child = self.tree.next_sibling(c);
            }
        }
        Ok(())
    }

    /// Parses the track headers of all discovered "Tracks"-elements.
    pub fn parse_tracks(&mut self) -> Result<()> {
        const CONTEXT: &str = "parsing tracks of Matroska container";
        for index in 0..self.tracks_elements.len() {
            let element = self.tracks_elements[index];
            self.tree.parse(element, &mut self.stream)?;
            let mut child = self.tree.first_child(element);
            while let Some(c) = child {
                self.tree.parse(c, &mut self.stream)?;
                match self.tree.node(c).id() {
                    ids::TRACK_ENTRY => {
                        match MatroskaTrack::parse_header(
                            &mut self.tree,
                            c,
                            &mut self.stream,
                            &mut self.notifications,
                        ) {
                            Ok(track) => self.tracks.push(track),
                            Err(Error::NoDataFound) => {}
                            Err(err) if is_fatal(&err) => return Err(err),
                            Err(_) => self.notifications.critical(
                                CONTEXT,
                                format!("unable to parse track {}", self.tracks.len()),
                            ),
                        }
                    }
                    ids::VOID | ids::CRC32 => {}
                    _ => self.notifications.warning(
                        CONTEXT,
                        "\"Tracks\"-element contains unknown child; it will be ignored",
                    ),
                }
                child = self.tree.next_sibling(c);
            }
        }
        Ok(())
    }

    /// Parses the edition entries of all discovered "Chapters"-elements.
    pub fn parse_chapters(&mut self) -> Result<()> {
        const CONTEXT: &str = "parsing editions/chapters of Matroska container";
        for index in 0..self.chapters_elements.len() {
            let element = self.chapters_elements[index];
            self.tree.parse(element, &mut self.stream)?;
            let mut child = self.tree.first_child(element);
            while let Some(c) = child {
                self.tree.parse(c, &mut self.stream)?;
                match self.tree.node(c).id() {
                    ids::EDITION_ENTRY => {
                        match ChapterEdition::parse_nested(
                            &mut self.tree,
                            c,
                            &mut self.stream,
                            &mut self.notifications,
                        ) {
                            Ok(edition) => self.editions.push(edition),
                            Err(Error::NoDataFound) => {}
                            Err(err) if is_fatal(&err) => return Err(err),
                            Err(_) => self.notifications.critical(
                                CONTEXT,
                                format!("unable to parse edition entry {}", self.editions.len()),
                            ),
                        }
                    }
                    ids::VOID | ids::CRC32 => {}
                    _ => self.notifications.warning(
                        CONTEXT,
                        "\"Chapters\"-element contains unknown child; it will be ignored",
                    ),
                }
                child = self.tree.next_sibling(c);
            }
        }
        Ok(())
    }

    /// Parses the attached files of all discovered "Attachments"-elements.
    pub fn parse_attachments(&mut self) -> Result<()> {
        const CONTEXT: &str = "parsing attachments of Matroska container";
        for index in 0..self.attachments_elements.len() {
            let element = self.attachments_elements[index];
            self.tree.parse(element, &mut self.stream)?;
            let mut child = self.tree.first_child(element);
            while let Some(c) = child {
                self.tree.parse(c, &mut self.stream)?;
                match self.tree.node(c).id() {
                    ids::ATTACHED_FILE => {
                        match MatroskaAttachment::parse(
                            &mut self.tree,
                            c,
                            &mut self.stream,
                            &mut self.notifications,
                        ) {
                            Ok(attachment) => self.attachments.push(attachment),
                            Err(Error::NoDataFound) => {}
                            Err(err) if is_fatal(&err) => return Err(err),
                            Err(_) => self.notifications.critical(
                                CONTEXT,
                                format!(
                                    "unable to parse attached file {}",
                                    self.attachments.len()
                                ),
                            ),
                        }
                    }
                    ids::VOID | ids::CRC32 => {}
                    _ => self.notifications.warning(
                        CONTEXT,
                        "\"Attachments\"-element contains unknown child; it will be ignored",
                    ),
                }
                child = self.tree.next_sibling(c);
            }
        }
        Ok(())
    }

    /// Validates the cue index of every segment.
    ///
    /// Checks that every "CueClusterPosition" points at a "Cluster"-element,
    /// every "CueRelativePosition" at a block, and that "Position" and
    /// "PrevSize" children of the clusters hold consistent values.
    pub fn validate_index(&mut self) -> Result<()> {
        const CONTEXT: &str = "validating Matroska file index (cues)";
        let mut cues_found = false;
        let mut current_offset = 0u64;

        let mut segment =
            self.tree
                .sibling_by_id(self.tree.root(), ids::SEGMENT, true, &mut self.stream)?;
        while let Some(seg) = segment {
            let segment_data_offset = self.tree.node(seg).data_offset();
            let mut prev_cluster_size = 0u64;
            let mut child = self.tree.first_child(seg);
            while let Some(c) = child {
                self.tree.parse(c, &mut self.stream)?;
                match self.tree.node(c).id() {
                    ids::CUES => {
                        cues_found = true;
                        self.validate_cues(c, segment_data_offset, current_offset)?;
                    }
                    ids::CLUSTER => {
                        let cluster_start = self.tree.node(c).start_offset();
                        let mut cluster_child = self.tree.first_child(c);
                        while let Some(cc) = cluster_child {
                            self.tree.parse(cc, &mut self.stream)?;
                            match self.tree.node(cc).id() {
                                ids::POSITION => {
                                    let data = self.tree.read_data(cc, &mut self.stream)?;
                                    let pos = ebml::parse_uint(&data)?;
                                    if pos > 0
                                        && cluster_start - segment_data_offset + current_offset
                                            != pos
                                    {
                                        self.notifications.critical(
                                            CONTEXT,
                                            format!(
                                                "\"Position\"-element at {} points to {} which is \
                                                 not the offset of the containing \"Cluster\"-element",
                                                self.tree.node(cc).start_offset(),
                                                pos
                                            ),
                                        );
                                    }
                                }
                                ids::PREV_SIZE => {
                                    let data = self.tree.read_data(cc, &mut self.stream)?;
                                    if ebml::parse_uint(&data)? != prev_cluster_size {
                                        self.notifications.critical(
                                            CONTEXT,
                                            format!(
                                                "\"PrevSize\"-element at {} has invalid value",
                                                self.tree.node(cc).start_offset()
                                            ),
                                        );
                                    }
                                }
                                _ => {}
                            }
                            cluster_child = self.tree.next_sibling(cc);
                        }
                        prev_cluster_size = self.tree.node(c).total_size();
                    }
                    _ => {}
                }
                child = self.tree.next_sibling(c);
            }
            current_offset += self.tree.node(seg).total_size();
            segment = self
                .tree
                .sibling_by_id(seg, ids::SEGMENT, false, &mut self.stream)?;
        }

        if !cues_found {
            self.notifications
                .warning(CONTEXT, "no \"Cues\"-elements (index) found");
        }
        Ok(())
    }

    fn validate_cues(
        &mut self,
        cues: NodeId,
        segment_data_offset: u64,
        current_offset: u64,
    ) -> Result<()> {
        const CONTEXT: &str = "validating Matroska file index (cues)";
        let mut cue_point = self.tree.first_child(cues);
        while let Some(cp) = cue_point {
            self.tree.parse(cp, &mut self.stream)?;
            if self.tree.node(cp).id() == ids::CUE_POINT {
                let mut cue_time_found = false;
                let mut cue_track_positions_found = false;
                let mut child = self.tree.first_child(cp);
                while let Some(c) = child {
                    self.tree.parse(c, &mut self.stream)?;
                    match self.tree.node(c).id() {
                        ids::CUE_TIME => {
                            if cue_time_found {
                                self.notifications.warning(
                                    CONTEXT,
                                    "\"CuePoint\"-element contains multiple \"CueTime\" elements",
                                );
                            }
                            cue_time_found = true;
                        }
                        ids::CUE_TRACK_POSITIONS => {
                            cue_track_positions_found = true;
                            self.validate_cue_track_positions(
                                c,
                                segment_data_offset,
                                current_offset,
                            )?;
                        }
                        _ => {}
                    }
                    child = self.tree.next_sibling(c);
                }
                if !cue_time_found {
                    self.notifications.warning(
                        CONTEXT,
                        "\"CuePoint\"-element does not contain mandatory element \"CueTime\"",
                    );
                }
                if !cue_track_positions_found {
                    self.notifications.warning(
                        CONTEXT,
                        "\"CuePoint\"-element does not contain mandatory element \
                         \"CueTrackPositions\"",
                    );
                }
            }
            cue_point = self.tree.next_sibling(cp);
        }
        Ok(())
    }

    fn validate_cue_track_positions(
        &mut self,
        positions: NodeId,
        segment_data_offset: u64,
        current_offset: u64,
    ) -> Result<()> {
        const CONTEXT: &str = "validating Matroska file index (cues)";
        let mut cue_track_found = false;
        let mut cluster: Option<NodeId> = None;
        let mut relative_position: Option<(u64, u64)> = None; // (element offset, value)
        let mut child = self.tree.first_child(positions);
        while let Some(c) = child {
            self.tree.parse(c, &mut self.stream)?;
            match self.tree.node(c).id() {
                ids::CUE_TRACK => cue_track_found = true,
                ids::CUE_CLUSTER_POSITION => {
                    let element_offset = self.tree.node(c).start_offset();
                    let data = self.tree.read_data(c, &mut self.stream)?;
                    let position = ebml::parse_uint(&data)?;
                    let target = segment_data_offset
                        .saturating_add(position)
                        .saturating_sub(current_offset);
                    let node = self
                        .tree
                        .alloc_detached(target, self.file_size.saturating_sub(target));
                    match self.tree.parse(node, &mut self.stream) {
                        Ok(()) => {
                            if self.tree.node(node).id() != ids::CLUSTER {
                                self.notifications.critical(
                                    CONTEXT,
                                    format!(
                                        "\"CueClusterPosition\" element at {} does not point to \
                                         \"Cluster\"-element (points to {})",
                                        element_offset, target
                                    ),
                                );
                            } else {
                                cluster = Some(node);
                            }
                        }
                        Err(err) if is_fatal(&err) => return Err(err),
                        Err(_) => self.notifications.critical(
                            CONTEXT,
                            format!(
                                "\"CueClusterPosition\" element at {} points to {} which cannot \
                                 be parsed",
                                element_offset, target
                            ),
                        ),
                    }
                }
                ids::CUE_RELATIVE_POSITION => {
                    let element_offset = self.tree.node(c).start_offset();
                    let data = self.tree.read_data(c, &mut self.stream)?;
                    relative_position = Some((element_offset, ebml::parse_uint(&data)?));
                }
                _ => {}
            }
            child = self.tree.next_sibling(c);
        }
        if !cue_track_found {
            self.notifications.warning(
                CONTEXT,
                "\"CueTrackPositions\"-element does not contain mandatory element \"CueTrack\"",
            );
        }
        match cluster {
            None => self.notifications.warning(
                CONTEXT,
                "\"CueTrackPositions\"-element does not contain mandatory element \
                 \"CueClusterPosition\"",
            ),
            Some(cluster) => {
                if let Some((element_offset, value)) = relative_position {
                    let target = self.tree.node(cluster).data_offset().saturating_add(value);
                    let node = self
                        .tree
                        .alloc_detached(target, self.file_size.saturating_sub(target));
                    match self.tree.parse(node, &mut self.stream) {
                        Ok(()) => match self.tree.node(node).id() {
                            ids::SIMPLE_BLOCK | ids::BLOCK | ids::BLOCK_GROUP => {}
                            _ => self.notifications.critical(
                                CONTEXT,
                                format!(
                                    "\"CueRelativePosition\" element at {} does not point to \
                                     \"Block\"-, \"BlockGroup\"-, or \"SimpleBlock\"-element \
                                     (points to {})",
                                    element_offset, target
                                ),
                            ),
                        },
                        Err(err) if is_fatal(&err) => return Err(err),
                        Err(_) => self.notifications.critical(
                            CONTEXT,
                            format!(
                                "\"CueRelativePosition\" element at {} points to {} which cannot \
                                 be parsed",
                                element_offset, target
                            ),
                        ),
                    }
                }
            }
        }
        Ok(())
    }

    /// Creates a new attachment with a random, collision-free UID and
    /// returns a mutable reference to it.
    ///
    /// Fails with `InvalidData` when no free UID could be found within a
    /// bounded number of attempts.
    pub fn create_attachment(&mut self) -> Result<&mut MatroskaAttachment> {
        let mut rng = rand::thread_rng();
        let mut uid = 0u64;
        let mut found = false;
        for _ in 0..=255u16 {
            let candidate: u64 = rng.gen_range(1..=u64::MAX);
            if self.attachments.iter().all(|a| a.uid != candidate) {
                uid = candidate;
                found = true;
                break;
            }
        }
        if !found {
            return Err(Error::InvalidData(
                "unable to generate a unique attachment UID".into(),
            ));
        }
        self.attachments.push(MatroskaAttachment::new(uid));
        Ok(self.attachments.last_mut().unwrap())
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    /// Whether `parse_header` completed.
    pub fn is_header_parsed(&self) -> bool {
        self.header_parsed
    }

    /// Size of the backing stream in bytes.
    ///
    /// Refreshed when the container is reparsed, so after `apply_changes`
    /// this reports the size of the written file.
    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    /// Document type, e.g. `"matroska"` or `"webm"`.
    pub fn doctype(&self) -> &str {
        &self.doctype
    }

    /// Number of segments found.
    pub fn segment_count(&self) -> usize {
        self.segment_count
    }

    /// Cumulative duration over all segments.
    pub fn duration(&self) -> Duration {
        self.duration
    }

    /// Per-segment titles (one entry per segment, possibly empty).
    pub fn titles(&self) -> &[String] {
        &self.titles
    }

    /// Replaces the title of segment `index`.
    pub fn set_title(&mut self, index: usize, title: impl Into<String>) {
        if index < self.titles.len() {
            self.titles[index] = title.into();
        }
    }

    /// Parsed tags.
    pub fn tags(&self) -> &[MatroskaTag] {
        &self.tags
    }

    /// Parsed tags, mutable.
    pub fn tags_mut(&mut self) -> &mut Vec<MatroskaTag> {
        &mut self.tags
    }

    /// Parsed tracks.
    pub fn tracks(&self) -> &[MatroskaTrack] {
        &self.tracks
    }

    /// Parsed editions.
    pub fn editions(&self) -> &[ChapterEdition] {
        &self.editions
    }

    /// Parsed attachments.
    pub fn attachments(&self) -> &[MatroskaAttachment] {
        &self.attachments
    }

    /// Parsed attachments, mutable.
    pub fn attachments_mut(&mut self) -> &mut Vec<MatroskaAttachment> {
        &mut self.attachments
    }

    /// Recorded notifications.
    pub fn notifications(&self) -> &NotificationList {
        &self.notifications
    }

    /// Recorded notifications, mutable.
    pub fn notifications_mut(&mut self) -> &mut NotificationList {
        &mut self.notifications
    }

    /// The write policy.
    pub fn config(&self) -> &WriteConfig {
        &self.config
    }

    /// The write policy, mutable.
    pub fn config_mut(&mut self) -> &mut WriteConfig {
        &mut self.config
    }

    /// The progress/abort handle.
    pub fn progress(&self) -> &Progress {
        &self.progress
    }

    /// Installs a progress/abort handle.
    pub fn set_progress(&mut self, progress: Progress) {
        self.progress = progress;
    }
}
