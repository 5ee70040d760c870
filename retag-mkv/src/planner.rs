//! Segment planner: per-segment size and offset precomputation.
//!
//! Before any byte is written, the planner decides whether the changed
//! metadata can be patched into the existing file (keeping every cluster at
//! its current offset) or whether a full rewrite is required, and computes
//! every value the writer will need: segment sizes, seek-index offsets,
//! retargeted cue positions, cluster sizes and padding.
//!
//! The hard part is convergence. The size denotation of the segment and of
//! every index entry has variable length, so growing one offset can grow
//! the seek index, which shifts everything behind it, which can grow more
//! offsets. The computation therefore runs as two nested fixpoint loops
//! (`'size` per segment and `'layout` over the whole file) with explicit
//! restart points; a shared budget bounds the number of restarts so a
//! pathological file fails with `InvalidData` instead of spinning.

use crate::attachments::AttachmentMaker;
use crate::container::{is_fatal, ElementPosition, MatroskaContainer, WriteConfig, APP_INFO};
use crate::cues::CuesUpdater;
use crate::ebml::{self, EbmlFormat};
use crate::ids;
use crate::seek_info::SeekInfo;
use crate::tags::TagMaker;

use retag_core::error::{Error, Result};
use retag_core::notify::NotificationList;
use retag_core::tree::{NodeId, Tree};

use std::io::{Read, Seek};

const CONTEXT: &str = "calculating Matroska segment layout";

/// Upper bound on planner restarts (all loops combined, per plan run).
const RESTART_BUDGET: u32 = 4096;

/// Encoded size of one MuxingApp/WritingApp element.
pub(crate) fn app_info_element_total_size() -> u64 {
    2 + 1 + APP_INFO.len() as u64
}

/// A top-level element of the original file, in file order.
#[derive(Debug, Clone, Copy)]
pub(crate) enum TopLevel {
    /// Index into [`MatroskaPlan::segments`].
    Segment(usize),
    /// Unknown element, copied verbatim on write.
    Other(NodeId),
}

/// One preserved "Info"-element: the original node plus the verbatim bytes
/// of the children that are not re-emitted.
#[derive(Debug)]
pub(crate) struct InfoPlan {
    pub(crate) preserved_children: Vec<u8>,
}

/// Read-side facts about one cluster.
#[derive(Debug)]
pub(crate) struct ClusterPlan {
    pub(crate) node: NodeId,
    pub(crate) start_offset: u64,
    pub(crate) end_offset: u64,
    /// `(id, total_size)` of every child; filled lazily on the first
    /// rewrite pass.
    children: Option<Vec<(u32, u64)>>,
}

/// Everything the planner computed about one segment.
#[derive(Debug)]
pub(crate) struct SegmentPlan {
    pub(crate) segment: NodeId,
    pub(crate) segment_data_offset: u64,
    pub(crate) segment_total_size: u64,
    pub(crate) original_header_size: u32,

    pub(crate) has_crc32: bool,
    pub(crate) cues_element: Option<NodeId>,
    pub(crate) cues_updater: CuesUpdater,
    pub(crate) seek_info: SeekInfo,
    pub(crate) info_elements: Vec<InfoPlan>,
    pub(crate) info_data_size: u64,
    pub(crate) tracks_buffers: Vec<Vec<u8>>,
    pub(crate) chapters_buffers: Vec<Vec<u8>>,
    pub(crate) clusters: Vec<ClusterPlan>,

    pub(crate) cluster_end_offset: u64,
    pub(crate) start_offset: u64,
    pub(crate) new_padding: u64,
    pub(crate) size_denotation_length: u32,
    pub(crate) total_data_size: u64,
    pub(crate) total_size: u64,
    pub(crate) new_data_offset: u64,
    pub(crate) cluster_sizes: Vec<u64>,
}

impl SegmentPlan {
    pub(crate) fn has_cues(&self) -> bool {
        self.cues_element.is_some() && !self.cues_updater.cue_points().is_empty()
    }
}

/// The complete write plan for a container.
pub(crate) struct MatroskaPlan {
    pub(crate) rewrite: bool,
    pub(crate) tag_pos: ElementPosition,
    pub(crate) cues_pos: ElementPosition,
    pub(crate) padding: u64,
    pub(crate) ebml_header_data_size: u64,
    pub(crate) ebml_header_size: u64,
    pub(crate) tag_elements_size: u64,
    pub(crate) tags_size: u64,
    pub(crate) attached_file_elements_size: u64,
    pub(crate) attachments_size: u64,
    pub(crate) tag_makers: Vec<TagMaker>,
    pub(crate) attachment_makers: Vec<AttachmentMaker>,
    pub(crate) top_level: Vec<TopLevel>,
    pub(crate) segments: Vec<SegmentPlan>,
    pub(crate) last_segment_index: usize,
}

/// Outcome of one per-segment computation.
enum SegmentOutcome {
    Done,
    /// Element order or the rewrite decision changed; the whole layout must
    /// be recomputed.
    RestartLayout,
}

struct PlanContext<'a> {
    config: &'a WriteConfig,
    titles: &'a [String],
    ebml_header_size: u64,
    tags_size: u64,
    attachments_size: u64,
    last_segment_index: usize,
    current_tag_pos: ElementPosition,
}

fn charge(budget: &mut u32) -> Result<()> {
    if *budget == 0 {
        return Err(Error::InvalidData(
            "segment layout calculation did not converge".into(),
        ));
    }
    *budget -= 1;
    Ok(())
}

impl<S: Read + Seek> MatroskaContainer<S> {
    /// Computes the write plan for the current state of the container.
    pub(crate) fn plan(&mut self) -> Result<MatroskaPlan> {
        if !self.header_parsed {
            self.notifications
                .critical(CONTEXT, "the header has not been parsed yet");
            return Err(Error::InvalidData("header not parsed".into()));
        }
        self.progress.status("calculating element sizes", 0.0);

        // EBML header size: seven 2-byte child IDs plus their content.
        let mut ebml_header_data_size = 2 * 7u64;
        for value in [
            self.version,
            self.read_version,
            self.max_id_length,
            self.max_size_length,
            self.doctype_version,
            self.doctype_read_version,
        ] {
            let content = ebml::uinteger_length(value);
            ebml_header_data_size +=
                u64::from(content) + u64::from(ebml::size_denotation_length(u64::from(content)));
        }
        ebml_header_data_size += self.doctype.len() as u64
            + u64::from(ebml::size_denotation_length(self.doctype.len() as u64));
        let ebml_header_size =
            4 + u64::from(ebml::size_denotation_length(ebml_header_data_size)) + ebml_header_data_size;

        // Precompute the tag and attachment serialisations. Entries of
        // three bytes are empty and skipped entirely.
        let mut tag_makers = Vec::new();
        let mut tag_elements_size = 0u64;
        for tag in &self.tags {
            let maker = TagMaker::new(tag.clone());
            if maker.required_size() > 3 {
                tag_elements_size += maker.required_size();
                tag_makers.push(maker);
            }
        }
        let tags_size = if tag_elements_size > 0 {
            4 + u64::from(ebml::size_denotation_length(tag_elements_size)) + tag_elements_size
        } else {
            0
        };

        let mut attachment_makers = Vec::new();
        let mut attached_file_elements_size = 0u64;
        for attachment in self.attachments.iter().filter(|a| !a.ignored) {
            let maker = AttachmentMaker::new(attachment.clone());
            if maker.required_size() > 3 {
                attached_file_elements_size += maker.required_size();
                attachment_makers.push(maker);
            }
        }
        let attachments_size = if attached_file_elements_size > 0 {
            4 + u64::from(ebml::size_denotation_length(attached_file_elements_size))
                + attached_file_elements_size
        } else {
            0
        };

        // Inspect the layout of the original file: every top-level element,
        // the number of segments and the current tag position.
        let (top_level, mut segments) = self.collect_top_level()?;
        if segments.is_empty() {
            self.notifications
                .critical(CONTEXT, "no \"Segment\"-element could be found");
            return Err(Error::InvalidData("no segment found".into()));
        }
        let last_segment_index = segments.len() - 1;
        let current_tag_pos = self.determine_current_tag_position(&segments)?;

        let mut tag_pos = resolve_keep(self.config.tag_position, current_tag_pos);
        let mut cues_pos = self.config.index_position;
        let mut rewrite = self.config.force_rewrite || self.config.save_file_path.is_some();

        let ctx = PlanContext {
            config: &self.config,
            titles: &self.titles,
            ebml_header_size,
            tags_size,
            attachments_size,
            last_segment_index,
            current_tag_pos,
        };

        let mut budget = RESTART_BUDGET;
        let mut padding;
        self.progress.status("calculating segment data", 0.0);
        'layout: loop {
            self.progress.check_aborted()?;
            charge(&mut budget)?;

            // A rewrite always uses the preferred positions.
            if rewrite {
                tag_pos = resolve_keep(self.config.tag_position, current_tag_pos);
                cues_pos = self.config.index_position;
            }

            let mut current_offset = ebml_header_size;
            let mut current_position = 0u64;
            let mut read_offset = 0u64;
            let mut segment_index = 0usize;
            padding = 0u64;

            for entry in &top_level {
                match *entry {
                    TopLevel::Segment(_) => {
                        let plan = &mut segments[segment_index];
                        plan.start_offset = current_offset;
                        plan.new_padding = 0;
                        let outcome = compute_segment(
                            &mut self.tree,
                            &mut self.stream,
                            plan,
                            segment_index,
                            &ctx,
                            current_position,
                            current_offset,
                            read_offset,
                            &mut tag_pos,
                            &mut cues_pos,
                            &mut rewrite,
                            &mut budget,
                            &mut self.notifications,
                        )?;
                        if matches!(outcome, SegmentOutcome::RestartLayout) {
                            continue 'layout;
                        }
                        plan.total_size = 4
                            + u64::from(ebml::size_denotation_length(plan.total_data_size))
                            + plan.total_data_size;
                        padding += plan.new_padding;
                        current_position += plan.total_size;
                        current_offset += plan.total_size;
                        read_offset += plan.segment_total_size;
                        segment_index += 1;
                    }
                    TopLevel::Other(node) => {
                        let total = self.tree.node(node).total_size();
                        current_offset += total;
                        current_position += total;
                        read_offset += total;
                    }
                }
            }

            if !rewrite
                && (padding > self.config.max_padding || padding < self.config.min_padding)
            {
                rewrite = true;
                continue 'layout;
            }
            break;
        }

        tracing::debug!(
            rewrite,
            padding,
            ?tag_pos,
            ?cues_pos,
            segments = segments.len(),
            "segment layout calculated"
        );
        Ok(MatroskaPlan {
            rewrite,
            tag_pos,
            cues_pos,
            padding,
            ebml_header_data_size,
            ebml_header_size,
            tag_elements_size,
            tags_size,
            attached_file_elements_size,
            attachments_size,
            tag_makers,
            attachment_makers,
            top_level,
            segments,
            last_segment_index,
        })
    }

    /// Walks the top-level elements once, initialising a [`SegmentPlan`]
    /// for every segment (parsing its cues, buffering the metadata elements
    /// that are copied verbatim).
    fn collect_top_level(&mut self) -> Result<(Vec<TopLevel>, Vec<SegmentPlan>)> {
        let mut top_level = Vec::new();
        let mut segments = Vec::new();
        let mut top = Some(self.tree.root());
        while let Some(t) = top {
            if let Err(err) = self.tree.parse(t, &mut self.stream) {
                if is_fatal(&err) {
                    return Err(err);
                }
                if self.tree.node(t).start_offset() >= self.file_size {
                    break;
                }
                self.notifications.critical(
                    CONTEXT,
                    format!(
                        "unable to parse content in top-level element at {} of original file",
                        self.tree.node(t).start_offset()
                    ),
                );
                return Err(err);
            }
            match self.tree.node(t).id() {
                // The EBML header is re-made, level-0 Void and CRC-32
                // elements are omitted.
                ids::EBML | ids::VOID | ids::CRC32 => {}
                ids::SEGMENT => {
                    top_level.push(TopLevel::Segment(segments.len()));
                    segments.push(self.init_segment_plan(t)?);
                }
                other => {
                    self.notifications.warning(
                        CONTEXT,
                        format!(
                            "the top-level element 0x{:X} of the original file is unknown and \
                             will just be copied",
                            other
                        ),
                    );
                    top_level.push(TopLevel::Other(t));
                }
            }
            top = self.tree.next_sibling(t);
        }
        Ok((top_level, segments))
    }

    fn init_segment_plan(&mut self, segment: NodeId) -> Result<SegmentPlan> {
        let cues_element = self
            .tree
            .child_by_id(segment, ids::CUES, &mut self.stream)?;
        let mut cues_updater = CuesUpdater::new();
        if let Some(cues) = cues_element {
            let result = cues_updater.parse(&mut self.tree, cues, &mut self.stream);
            cues_updater.take_notifications(&mut self.notifications);
            result?;
        }

        // CRC-32 presence: the checksum must be the first child.
        let has_crc32 = match self.tree.first_child(segment) {
            Some(first) => {
                self.tree.parse(first, &mut self.stream)?;
                self.tree.node(first).id() == ids::CRC32
            }
            None => false,
        };

        // Buffer the "Info"-children that are preserved verbatim.
        let mut info_elements = Vec::new();
        let mut info = self
            .tree
            .child_by_id(segment, ids::INFO, &mut self.stream)?;
        while let Some(i) = info {
            let mut preserved = Vec::new();
            let mut child = self.tree.first_child(i);
            while let Some(c) = child {
                self.tree.parse(c, &mut self.stream)?;
                match self.tree.node(c).id() {
                    // Re-emitted or dropped on write.
                    ids::VOID | ids::CRC32 | ids::TITLE | ids::MUXING_APP | ids::WRITING_APP => {}
                    _ => {
                        self.tree.copy_entirely(
                            c,
                            &mut self.stream,
                            &mut preserved,
                            &self.progress.clone(),
                        )?;
                    }
                }
                child = self.tree.next_sibling(c);
            }
            info_elements.push(InfoPlan {
                preserved_children: preserved,
            });
            info = self
                .tree
                .sibling_by_id(i, ids::INFO, false, &mut self.stream)?;
        }

        // Buffer Tracks- and Chapters-elements wholesale.
        let mut tracks_buffers = Vec::new();
        let mut tracks = self
            .tree
            .child_by_id(segment, ids::TRACKS, &mut self.stream)?;
        while let Some(t) = tracks {
            let mut buffer = Vec::new();
            self.tree
                .copy_entirely(t, &mut self.stream, &mut buffer, &self.progress.clone())?;
            tracks_buffers.push(buffer);
            tracks = self
                .tree
                .sibling_by_id(t, ids::TRACKS, false, &mut self.stream)?;
        }
        let mut chapters_buffers = Vec::new();
        let mut chapters = self
            .tree
            .child_by_id(segment, ids::CHAPTERS, &mut self.stream)?;
        while let Some(c) = chapters {
            let mut buffer = Vec::new();
            self.tree
                .copy_entirely(c, &mut self.stream, &mut buffer, &self.progress.clone())?;
            chapters_buffers.push(buffer);
            chapters = self
                .tree
                .sibling_by_id(c, ids::CHAPTERS, false, &mut self.stream)?;
        }

        // Record every cluster (children are inspected lazily).
        let mut clusters = Vec::new();
        let mut cluster = self
            .tree
            .child_by_id(segment, ids::CLUSTER, &mut self.stream)?;
        while let Some(c) = cluster {
            clusters.push(ClusterPlan {
                node: c,
                start_offset: self.tree.node(c).start_offset(),
                end_offset: self.tree.node(c).end_offset(),
                children: None,
            });
            cluster = self
                .tree
                .sibling_by_id(c, ids::CLUSTER, false, &mut self.stream)?;
        }

        let node = self.tree.node(segment);
        Ok(SegmentPlan {
            segment,
            segment_data_offset: node.data_offset(),
            segment_total_size: node.total_size(),
            original_header_size: node.header_size(),
            has_crc32,
            cues_element,
            cues_updater,
            seek_info: SeekInfo::new(),
            info_elements,
            info_data_size: 0,
            tracks_buffers,
            chapters_buffers,
            clusters,
            cluster_end_offset: 0,
            start_offset: 0,
            new_padding: 0,
            size_denotation_length: 0,
            total_data_size: 0,
            total_size: 0,
            new_data_offset: 0,
            cluster_sizes: Vec::new(),
        })
    }

    /// Determines where tags currently live relative to the media data:
    /// `BeforeData` when a Tags/Attachments element precedes the first
    /// cluster of any segment, `AfterData` when a cluster comes first.
    fn determine_current_tag_position(
        &mut self,
        segments: &[SegmentPlan],
    ) -> Result<ElementPosition> {
        let mut first_cluster_found = false;
        let mut first_tag_found = false;
        for plan in segments {
            let mut child = self.tree.first_child(plan.segment);
            while let Some(c) = child {
                if first_cluster_found || first_tag_found {
                    break;
                }
                self.tree.parse(c, &mut self.stream)?;
                match self.tree.node(c).id() {
                    ids::TAGS | ids::ATTACHMENTS => first_tag_found = true,
                    ids::CLUSTER => first_cluster_found = true,
                    _ => {}
                }
                child = self.tree.next_sibling(c);
            }
        }
        Ok(if first_tag_found {
            ElementPosition::BeforeData
        } else if first_cluster_found {
            ElementPosition::AfterData
        } else {
            ElementPosition::Keep
        })
    }
}

fn resolve_keep(preferred: ElementPosition, current: ElementPosition) -> ElementPosition {
    match preferred {
        ElementPosition::Keep => match current {
            ElementPosition::Keep => ElementPosition::BeforeData,
            other => other,
        },
        other => other,
    }
}

/// Encoded size of one "Info"-element's data for segment `segment_index`.
fn info_data_size(plan: &InfoPlan, titles: &[String], segment_index: usize) -> u64 {
    let mut size = 2 * app_info_element_total_size();
    if let Some(title) = titles.get(segment_index) {
        if !title.is_empty() {
            size += 2
                + u64::from(ebml::size_denotation_length(title.len() as u64))
                + title.len() as u64;
        }
    }
    size + plan.preserved_children.len() as u64
}

/// Fills the `(id, total_size)` list of a cluster's children on demand.
fn cluster_children<'a, S: Read + Seek>(
    tree: &mut Tree<EbmlFormat>,
    io: &mut S,
    cluster: &'a mut ClusterPlan,
) -> Result<&'a [(u32, u64)]> {
    if cluster.children.is_none() {
        let mut children = Vec::new();
        let mut child = tree.first_child(cluster.node);
        while let Some(c) = child {
            tree.parse(c, io)?;
            children.push((tree.node(c).id(), tree.node(c).total_size()));
            child = tree.next_sibling(c);
        }
        cluster.children = Some(children);
    }
    Ok(cluster.children.as_deref().unwrap())
}

/// Precomputes the size of one segment.
///
/// Restart semantics: whenever growing an entry of the seek index changes
/// its encoded size, the computation starts over (`'size`); whenever the
/// cues element changes size while it sits before the clusters, the
/// computation is rolled back to the offset recorded just before the cues
/// (`'after_cues`).
#[allow(clippy::too_many_arguments)]
fn compute_segment<S: Read + Seek>(
    tree: &mut Tree<EbmlFormat>,
    io: &mut S,
    plan: &mut SegmentPlan,
    segment_index: usize,
    ctx: &PlanContext<'_>,
    current_position: u64,
    current_offset: u64,
    read_offset: u64,
    tag_pos: &mut ElementPosition,
    cues_pos: &mut ElementPosition,
    rewrite: &mut bool,
    budget: &mut u32,
    notifications: &mut NotificationList,
) -> Result<SegmentOutcome> {
    // Resolve the cue position for this segment.
    let current_cues_pos = match (plan.cues_element, plan.clusters.first()) {
        (Some(cues), Some(first_cluster)) => {
            if tree.node(cues).start_offset() < first_cluster.start_offset {
                ElementPosition::BeforeData
            } else {
                ElementPosition::AfterData
            }
        }
        _ => ElementPosition::Keep,
    };
    if *cues_pos == ElementPosition::Keep {
        *cues_pos = match current_cues_pos {
            ElementPosition::Keep => ElementPosition::BeforeData,
            other => other,
        };
    }
    let has_cues = plan.has_cues();

    'size: loop {
        charge(budget)?;

        // CRC-32 element (6 bytes when present), then the seek index.
        plan.total_data_size = if plan.has_crc32 { 6 } else { 0 };
        plan.total_data_size += plan.seek_info.actual_size();

        // "Info"-elements.
        for index in 0..plan.info_elements.len() {
            if plan
                .seek_info
                .push(index, ids::INFO, current_position + plan.total_data_size)
            {
                continue 'size;
            }
            plan.info_data_size = info_data_size(&plan.info_elements[index], ctx.titles, segment_index);
            plan.total_data_size += 4
                + u64::from(ebml::size_denotation_length(plan.info_data_size))
                + plan.info_data_size;
        }

        // "Tracks"- and "Chapters"-elements, copied from buffers.
        for (id, buffers) in [
            (ids::TRACKS, &plan.tracks_buffers),
            (ids::CHAPTERS, &plan.chapters_buffers),
        ] {
            for (index, buffer) in buffers.iter().enumerate() {
                if plan
                    .seek_info
                    .push(index, id, current_position + plan.total_data_size)
                {
                    continue 'size;
                }
                plan.total_data_size += buffer.len() as u64;
            }
        }

        // Tags and attachments land in the first segment when they go in
        // front of the media data.
        if *tag_pos == ElementPosition::BeforeData && segment_index == 0 {
            if ctx.tags_size > 0 {
                if plan
                    .seek_info
                    .push(0, ids::TAGS, current_position + plan.total_data_size)
                {
                    continue 'size;
                }
                plan.total_data_size += ctx.tags_size;
            }
            if ctx.attachments_size > 0 {
                if plan
                    .seek_info
                    .push(0, ids::ATTACHMENTS, current_position + plan.total_data_size)
                {
                    continue 'size;
                }
                plan.total_data_size += ctx.attachments_size;
            }
        }

        // Everything from here on is recomputed when the cues grow.
        let offset_before_cues = plan.total_data_size;
        if *cues_pos == ElementPosition::BeforeData && has_cues {
            if plan
                .seek_info
                .push(0, ids::CUES, current_position + plan.total_data_size)
            {
                continue 'size;
            }
        }

        'after_cues: loop {
            charge(budget)?;
            plan.total_data_size = offset_before_cues;
            if *cues_pos == ElementPosition::BeforeData && has_cues {
                plan.total_data_size += plan.cues_updater.total_size();
            }

            if !*rewrite {
                // Try to keep every cluster where it is.
                let first_cluster = plan.clusters.first().map(|c| c.start_offset);
                match first_cluster {
                    Some(first_cluster_start)
                        if current_offset + 4 + plan.total_data_size <= first_cluster_start =>
                    {
                        if plan.original_header_size <= 4 || plan.original_header_size > 12 {
                            notifications.critical(
                                CONTEXT,
                                "header size of \"Segment\"-element from original file is invalid",
                            );
                            return Err(Error::InvalidData(
                                "invalid segment header in original file".into(),
                            ));
                        }
                        // Assume the size denotation keeps its length; the
                        // assumption is verified below and corrected.
                        let mut assumed = plan.original_header_size - 4;
                        'denotation: loop {
                            charge(budget)?;
                            let data_start = current_offset + 4 + u64::from(assumed);
                            if first_cluster_start < data_start {
                                notifications.critical(
                                    CONTEXT,
                                    "clusters of the original file precede the segment data start",
                                );
                                return Err(Error::InvalidData(
                                    "inconsistent cluster offsets".into(),
                                ));
                            }
                            if plan
                                .seek_info
                                .push(0, ids::CLUSTER, first_cluster_start - data_start)
                            {
                                continue 'size;
                            }
                            for cluster in &plan.clusters {
                                let cluster_read_offset =
                                    cluster.start_offset - plan.segment_data_offset + read_offset;
                                plan.cluster_end_offset = cluster.end_offset;
                                if has_cues
                                    && plan.cues_updater.update_offsets(
                                        cluster_read_offset,
                                        cluster.start_offset - data_start,
                                    )
                                    && *cues_pos == ElementPosition::BeforeData
                                {
                                    continue 'after_cues;
                                }
                            }
                            plan.total_data_size = plan.cluster_end_offset - data_start;

                            if *cues_pos == ElementPosition::AfterData && has_cues {
                                if plan.seek_info.push(
                                    0,
                                    ids::CUES,
                                    current_position + plan.total_data_size,
                                ) {
                                    continue 'size;
                                }
                                plan.total_data_size += plan.cues_updater.total_size();
                            }
                            if *tag_pos == ElementPosition::AfterData
                                && segment_index == ctx.last_segment_index
                            {
                                if ctx.tags_size > 0 {
                                    if plan.seek_info.push(
                                        0,
                                        ids::TAGS,
                                        current_position + plan.total_data_size,
                                    ) {
                                        continue 'size;
                                    }
                                    plan.total_data_size += ctx.tags_size;
                                }
                                if ctx.attachments_size > 0 {
                                    if plan.seek_info.push(
                                        0,
                                        ids::ATTACHMENTS,
                                        current_position + plan.total_data_size,
                                    ) {
                                        continue 'size;
                                    }
                                    plan.total_data_size += ctx.attachments_size;
                                }
                            }

                            let minimal = ebml::size_denotation_length(plan.total_data_size);
                            if assumed != minimal {
                                assumed = minimal;
                                continue 'denotation;
                            }
                            plan.size_denotation_length = assumed;
                            break;
                        }

                        // Check the pre-cluster budget with everything
                        // accounted for.
                        let mut total_offset =
                            current_offset + 4 + u64::from(plan.size_denotation_length) + offset_before_cues;
                        if *cues_pos == ElementPosition::BeforeData && has_cues {
                            total_offset += plan.cues_updater.total_size();
                        }
                        if total_offset <= first_cluster_start {
                            let padding = first_cluster_start - total_offset;
                            if padding == 1 {
                                // The smallest Void element is 2 bytes.
                                *rewrite = true;
                            } else {
                                plan.new_padding = padding;
                            }
                        } else {
                            *rewrite = true;
                        }
                    }
                    // No cluster, or the pre-cluster content alone already
                    // overruns the first cluster.
                    _ => *rewrite = true,
                }

                if *rewrite {
                    // Rewriting might still be avoided by moving tags, then
                    // cues, behind the media data.
                    if *tag_pos != ElementPosition::AfterData
                        && (!ctx.config.force_tag_position
                            || (ctx.config.tag_position == ElementPosition::Keep
                                && ctx.current_tag_pos == ElementPosition::Keep))
                    {
                        *tag_pos = ElementPosition::AfterData;
                        *rewrite = false;
                    } else if *cues_pos != ElementPosition::AfterData
                        && (!ctx.config.force_index_position
                            || (ctx.config.index_position == ElementPosition::Keep
                                && current_cues_pos == ElementPosition::Keep))
                    {
                        *cues_pos = ElementPosition::AfterData;
                        *rewrite = false;
                    }
                    return Ok(SegmentOutcome::RestartLayout);
                }
                return Ok(SegmentOutcome::Done);
            }

            // Rewrite path: lay the segment out from scratch.
            if segment_index == 0 && !plan.clusters.is_empty() {
                plan.new_padding = ctx.config.preferred_padding;
                plan.total_data_size += plan.new_padding;
            }
            plan.cluster_sizes.clear();
            for cluster_index in 0..plan.clusters.len() {
                let cluster_read_offset = plan.clusters[cluster_index].start_offset
                    - plan.segment_data_offset
                    + read_offset;
                if has_cues
                    && plan
                        .cues_updater
                        .update_offsets(cluster_read_offset, current_position + plan.total_data_size)
                    && *cues_pos == ElementPosition::BeforeData
                {
                    continue 'after_cues;
                }
                if cluster_index == 0
                    && plan.seek_info.push(
                        0,
                        ids::CLUSTER,
                        current_position + plan.total_data_size,
                    )
                {
                    continue 'size;
                }

                let children =
                    cluster_children(tree, io, &mut plan.clusters[cluster_index])?.to_vec();
                let mut cluster_size = 0u64;
                let mut cluster_read_size = 0u64;
                for (id, total) in children {
                    if has_cues
                        && plan.cues_updater.update_relative_offsets(
                            cluster_read_offset,
                            cluster_read_size,
                            cluster_size,
                        )
                        && *cues_pos == ElementPosition::BeforeData
                    {
                        continue 'after_cues;
                    }
                    match id {
                        ids::VOID | ids::CRC32 => {}
                        // Position elements are re-encoded with the new
                        // cluster offset; their length may change.
                        ids::POSITION => {
                            cluster_size += 1
                                + 1
                                + u64::from(ebml::uinteger_length(
                                    current_position + plan.total_data_size,
                                ));
                        }
                        _ => cluster_size += total,
                    }
                    cluster_read_size += total;
                }
                plan.cluster_sizes.push(cluster_size);
                plan.total_data_size += 4
                    + u64::from(ebml::size_denotation_length(cluster_size))
                    + cluster_size;
            }

            if *cues_pos == ElementPosition::AfterData && has_cues {
                if plan
                    .seek_info
                    .push(0, ids::CUES, current_position + plan.total_data_size)
                {
                    continue 'size;
                }
                plan.total_data_size += plan.cues_updater.total_size();
            }
            if *tag_pos == ElementPosition::AfterData && segment_index == ctx.last_segment_index {
                if ctx.tags_size > 0 {
                    if plan
                        .seek_info
                        .push(0, ids::TAGS, current_position + plan.total_data_size)
                    {
                        continue 'size;
                    }
                    plan.total_data_size += ctx.tags_size;
                }
                if ctx.attachments_size > 0 {
                    if plan
                        .seek_info
                        .push(0, ids::ATTACHMENTS, current_position + plan.total_data_size)
                    {
                        continue 'size;
                    }
                    plan.total_data_size += ctx.attachments_size;
                }
            }
            plan.size_denotation_length = ebml::size_denotation_length(plan.total_data_size);
            return Ok(SegmentOutcome::Done);
        }
    }
}
