//! Segment writer: streams a computed plan to the output file.
//!
//! Two write paths exist. A *patch* keeps every cluster at its current
//! offset and rewrites only the metadata region in front of it (plus the
//! trailing elements), updating cluster-internal "Position" fields in
//! place. A *rewrite* reconstructs the whole file; the original is moved
//! aside as a backup and serves as the read source. Any failure after the
//! output was modified restores the original before the error propagates.

use crate::container::{ElementPosition, MatroskaContainer, APP_INFO};
use crate::ebml;
use crate::ids;
use crate::planner::{MatroskaPlan, SegmentPlan, TopLevel};

use retag_core::backup::{create_backup, handle_failure_after_file_modified};
use retag_core::error::{Error, Result};
use retag_core::io::{ReadSeekExt, WriteExt};
use retag_core::progress::Progress;

use std::fs::{self, File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::PathBuf;

const CONTEXT: &str = "writing Matroska container";

impl MatroskaContainer<File> {
    /// Applies all pending changes (tags, attachments, titles, layout
    /// policy) to the file.
    ///
    /// Plans the new layout, then either patches the file in place or
    /// rewrites it via a backup. On success the container is reparsed from
    /// the written file; on failure the original file is restored.
    pub fn apply_changes(&mut self) -> Result<()> {
        let mut plan = self.plan()?;
        self.progress.check_aborted()?;
        self.progress.status("preparing streams", 0.0);
        tracing::debug!(
            rewrite = plan.rewrite,
            padding = plan.padding,
            "applying changes"
        );

        let path = self.path.clone().ok_or_else(|| {
            Error::InvalidData("container is not backed by a named file".into())
        })?;
        let save_as = self.config.save_file_path.clone();
        let mut backup_path: Option<PathBuf> = None;

        let (mut input, output) = if plan.rewrite {
            if let Some(save_as_path) = &save_as {
                // Write to a separate target; the original stays untouched.
                let streams = File::open(&path).and_then(|input| {
                    OpenOptions::new()
                        .read(true)
                        .write(true)
                        .create(true)
                        .truncate(true)
                        .open(save_as_path)
                        .map(|output| (input, output))
                });
                match streams {
                    Ok(streams) => streams,
                    Err(err) => {
                        self.notifications
                            .critical(CONTEXT, "opening streams to write the output file failed");
                        return Err(err.into());
                    }
                }
            } else {
                // Move the original aside and recreate it.
                let (bp, input) = match create_backup(&path) {
                    Ok(result) => result,
                    Err(err) => {
                        self.notifications.critical(
                            CONTEXT,
                            "creation of a backup file (to rewrite the original file) failed",
                        );
                        return Err(err);
                    }
                };
                backup_path = Some(bp);
                let output = OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create(true)
                    .truncate(true)
                    .open(&path);
                match output {
                    Ok(output) => (input, output),
                    Err(err) => {
                        return Err(handle_failure_after_file_modified(
                            &path,
                            backup_path.as_deref(),
                            None,
                            err.into(),
                            &mut self.notifications,
                        ));
                    }
                }
            }
        } else {
            // Patching overwrites the regions the attachment payloads may
            // live in, so pull them into memory first.
            for maker in &mut plan.attachment_makers {
                maker.buffer(&mut self.stream)?;
            }
            let streams = File::open(&path).and_then(|input| {
                OpenOptions::new()
                    .read(true)
                    .write(true)
                    .open(&path)
                    .map(|output| (input, output))
            });
            match streams {
                Ok(streams) => streams,
                Err(err) => {
                    self.notifications
                        .critical(CONTEXT, "opening the file with write permissions failed");
                    return Err(err.into());
                }
            }
        };

        match self.write_and_finalize(&mut plan, &mut input, output) {
            Ok(()) => {
                if let Some(save_as_path) = save_as {
                    self.path = Some(save_as_path);
                    self.config.save_file_path = None;
                }
                if let Some(bp) = backup_path {
                    // The rewrite went through; the backup is obsolete.
                    let _ = fs::remove_file(bp);
                }
                Ok(())
            }
            Err(err) => {
                let err = handle_failure_after_file_modified(
                    &path,
                    backup_path.as_deref(),
                    save_as.as_deref(),
                    err,
                    &mut self.notifications,
                );
                // Point the container back at the (restored) original.
                if let Ok(stream) = File::open(&path) {
                    self.stream = stream;
                    let _ = self.reset();
                }
                Err(err)
            }
        }
    }

    fn write_and_finalize(
        &mut self,
        plan: &mut MatroskaPlan,
        input: &mut File,
        mut output: File,
    ) -> Result<()> {
        let crc32_offsets = self.emit(plan, input, &mut output)?;

        let end = output.stream_position()?;
        if plan.rewrite {
            tracing::debug!(new_size = end, "file rewritten");
        } else if end < self.file_size {
            // The metadata shrank; drop the bytes past the write offset.
            output.set_len(end)?;
            tracing::debug!(new_size = end, "file truncated after in-place patch");
        }
        output.flush()?;

        // Reparse what has been written so far.
        self.progress.status("reparsing output file", 0.0);
        self.stream = output;
        self.reset()?;
        if let Err(err) = self.parse_header() {
            self.notifications
                .critical(CONTEXT, "unable to reparse the header of the new file");
            return Err(err);
        }

        if !crc32_offsets.is_empty() {
            self.progress.status("updating CRC-32 checksums", 0.0);
            for (element_offset, enclosed_size) in crc32_offsets {
                self.stream.seek(SeekFrom::Start(element_offset + 6))?;
                let checksum = self.stream.read_crc32(enclosed_size - 6)?;
                self.stream.seek(SeekFrom::Start(element_offset + 2))?;
                self.stream.write_u32_le(checksum)?;
            }
            self.stream.flush()?;
        }
        self.progress.status("done", 1.0);
        Ok(())
    }

    /// Streams the planned layout to `output`.
    ///
    /// Returns the offsets of the written CRC-32 placeholders together with
    /// the size of their enclosing data regions for the final fixup pass.
    fn emit(
        &mut self,
        plan: &mut MatroskaPlan,
        input: &mut File,
        output: &mut File,
    ) -> Result<Vec<(u64, u64)>> {
        self.progress.status("writing EBML header", 0.0);
        ebml::write_id(output, ids::EBML)?;
        ebml::write_size(output, plan.ebml_header_data_size)?;
        ebml::make_uint(output, ids::EBML_VERSION, self.version)?;
        ebml::make_uint(output, ids::EBML_READ_VERSION, self.read_version)?;
        ebml::make_uint(output, ids::EBML_MAX_ID_LENGTH, self.max_id_length)?;
        ebml::make_uint(output, ids::EBML_MAX_SIZE_LENGTH, self.max_size_length)?;
        ebml::make_string(output, ids::DOC_TYPE, &self.doctype)?;
        ebml::make_uint(output, ids::DOC_TYPE_VERSION, self.doctype_version)?;
        ebml::make_uint(output, ids::DOC_TYPE_READ_VERSION, self.doctype_read_version)?;
        debug_assert_eq!(output.stream_position()?, plan.ebml_header_size);

        let mut crc32_offsets = Vec::new();
        let mut current_position = 0u64;
        let mut segment_index = 0usize;

        for entry in plan.top_level.clone() {
            self.progress.check_aborted()?;
            match entry {
                TopLevel::Other(node) => {
                    let progress = self.progress.clone();
                    self.tree.copy_entirely(node, input, output, &progress)?;
                    current_position += self.tree.node(node).total_size();
                }
                TopLevel::Segment(plan_index) => {
                    self.emit_segment(
                        plan,
                        plan_index,
                        segment_index,
                        current_position,
                        input,
                        output,
                        &mut crc32_offsets,
                    )?;
                    current_position += plan.segments[plan_index].total_size;
                    segment_index += 1;
                }
            }
        }
        Ok(crc32_offsets)
    }

    #[allow(clippy::too_many_arguments)]
    fn emit_segment(
        &mut self,
        plan: &mut MatroskaPlan,
        plan_index: usize,
        segment_index: usize,
        current_position: u64,
        input: &mut File,
        output: &mut File,
        crc32_offsets: &mut Vec<(u64, u64)>,
    ) -> Result<()> {
        self.progress.status("writing segment header", 0.0);
        {
            let segment = &plan.segments[plan_index];
            debug_assert_eq!(output.stream_position()?, segment.start_offset);
            ebml::write_id(output, ids::SEGMENT)?;
            ebml::write_size(output, segment.total_data_size)?;
        }
        let segment_data_offset = output.stream_position()?;
        plan.segments[plan_index].new_data_offset = segment_data_offset;

        // CRC-32 placeholder; the value is filled in by the final pass.
        if plan.segments[plan_index].has_crc32 {
            crc32_offsets.push((
                output.stream_position()?,
                plan.segments[plan_index].total_data_size,
            ));
            output.write_all(&[ids::CRC32 as u8, 0x84, 0, 0, 0, 0])?;
        }

        // Seek index.
        plan.segments[plan_index].seek_info.make(output)?;
        plan.segments[plan_index]
            .seek_info
            .take_notifications(&mut self.notifications);

        // "Info"-elements: preserved children verbatim, then Title,
        // MuxingApp and WritingApp are always re-emitted.
        let info_data_size = plan.segments[plan_index].info_data_size;
        for info_index in 0..plan.segments[plan_index].info_elements.len() {
            ebml::write_id(output, ids::INFO)?;
            ebml::write_size(output, info_data_size)?;
            output.write_all(&plan.segments[plan_index].info_elements[info_index].preserved_children)?;
            if let Some(title) = self.titles.get(segment_index) {
                if !title.is_empty() {
                    ebml::make_string(output, ids::TITLE, title)?;
                }
            }
            ebml::make_string(output, ids::MUXING_APP, APP_INFO)?;
            ebml::make_string(output, ids::WRITING_APP, APP_INFO)?;
        }

        for buffer in &plan.segments[plan_index].tracks_buffers {
            output.write_all(buffer)?;
        }
        for buffer in &plan.segments[plan_index].chapters_buffers {
            output.write_all(buffer)?;
        }

        if plan.tag_pos == ElementPosition::BeforeData && segment_index == 0 {
            write_tags(plan, output)?;
            write_attachments(plan, input, output, &self.progress)?;
        }

        if plan.cues_pos == ElementPosition::BeforeData && plan.segments[plan_index].has_cues() {
            plan.segments[plan_index].cues_updater.make(output)?;
            plan.segments[plan_index]
                .cues_updater
                .take_notifications(&mut self.notifications);
        }

        if plan.segments[plan_index].new_padding > 0 {
            write_void(output, plan.segments[plan_index].new_padding)?;
        }

        if plan.rewrite {
            self.emit_clusters_rewrite(
                &mut plan.segments[plan_index],
                current_position,
                segment_data_offset,
                input,
                output,
            )?;
        } else {
            self.patch_cluster_positions(&mut plan.segments[plan_index], input, output)?;
        }

        if plan.cues_pos == ElementPosition::AfterData && plan.segments[plan_index].has_cues() {
            plan.segments[plan_index].cues_updater.make(output)?;
            plan.segments[plan_index]
                .cues_updater
                .take_notifications(&mut self.notifications);
        }
        if plan.tag_pos == ElementPosition::AfterData && segment_index == plan.last_segment_index {
            write_tags(plan, output)?;
            write_attachments(plan, input, output, &self.progress)?;
        }
        Ok(())
    }

    fn emit_clusters_rewrite(
        &mut self,
        segment: &mut SegmentPlan,
        current_position: u64,
        segment_data_offset: u64,
        input: &mut File,
        output: &mut File,
    ) -> Result<()> {
        self.progress.status("writing clusters", 0.0);
        for cluster_index in 0..segment.clusters.len() {
            self.progress.check_aborted()?;
            // Offset of this cluster relative to the segment data start;
            // the value every "Position" child is re-encoded with.
            let position_value =
                current_position + (output.stream_position()? - segment_data_offset);
            ebml::write_id(output, ids::CLUSTER)?;
            ebml::write_size(output, segment.cluster_sizes[cluster_index])?;

            let cluster_node = segment.clusters[cluster_index].node;
            let mut child = self.tree.first_child(cluster_node);
            while let Some(c) = child {
                self.tree.parse(c, input)?;
                match self.tree.node(c).id() {
                    ids::VOID | ids::CRC32 => {}
                    ids::POSITION => {
                        ebml::make_uint(output, ids::POSITION, position_value)?;
                    }
                    _ => {
                        let progress = self.progress.clone();
                        self.tree.copy_entirely(c, input, output, &progress)?;
                    }
                }
                child = self.tree.next_sibling(c);
            }
            self.progress.report_ratio(
                output.stream_position()? - segment_data_offset,
                segment.total_data_size,
            );
        }
        Ok(())
    }

    /// Updates "Position" fields inside the existing clusters in place.
    ///
    /// A new value that no longer fits the pre-existing size denotation
    /// cannot be moved, so the element's ID byte is overwritten with a
    /// Void ID instead (its bytes stay reserved).
    fn patch_cluster_positions(
        &mut self,
        segment: &mut SegmentPlan,
        input: &mut File,
        output: &mut File,
    ) -> Result<()> {
        for cluster_index in 0..segment.clusters.len() {
            self.progress.check_aborted()?;
            let cluster_node = segment.clusters[cluster_index].node;
            let cluster_start = segment.clusters[cluster_index].start_offset;
            let mut child = self.tree.first_child(cluster_node);
            while let Some(c) = child {
                self.tree.parse(c, input)?;
                if self.tree.node(c).id() == ids::POSITION {
                    let value = cluster_start - segment.new_data_offset;
                    let width = self.tree.node(c).data_size();
                    let encoded = if width <= 8 {
                        ebml::encode_uint_padded(value, width as u32).ok()
                    } else {
                        None
                    };
                    match encoded {
                        Some(bytes) => {
                            output.seek(SeekFrom::Start(self.tree.node(c).data_offset()))?;
                            output.write_all(&bytes[..width as usize])?;
                        }
                        None => {
                            output.seek(SeekFrom::Start(self.tree.node(c).start_offset()))?;
                            output.write_all(&[ids::VOID as u8])?;
                        }
                    }
                }
                child = self.tree.next_sibling(c);
            }
        }
        output.seek(SeekFrom::Start(segment.cluster_end_offset))?;
        Ok(())
    }
}

fn write_tags(plan: &MatroskaPlan, output: &mut File) -> Result<()> {
    if plan.tags_size == 0 {
        return Ok(());
    }
    ebml::write_id(output, ids::TAGS)?;
    ebml::write_size(output, plan.tag_elements_size)?;
    for maker in &plan.tag_makers {
        maker.make(output)?;
    }
    Ok(())
}

fn write_attachments(
    plan: &MatroskaPlan,
    input: &mut File,
    output: &mut File,
    progress: &Progress,
) -> Result<()> {
    if plan.attachments_size == 0 {
        return Ok(());
    }
    ebml::write_id(output, ids::ATTACHMENTS)?;
    ebml::write_size(output, plan.attached_file_elements_size)?;
    for maker in &plan.attachment_makers {
        maker.make(output, input, progress)?;
    }
    Ok(())
}

/// Writes a Void element whose total length is exactly `padding` bytes.
///
/// Uses a 1-byte size denotation below 64 bytes and an 8-byte denotation
/// otherwise, mirroring how the padding size was planned.
fn write_void(output: &mut File, padding: u64) -> Result<()> {
    debug_assert!(padding >= 2);
    let void_length;
    ebml::write_id(output, ids::VOID)?;
    if padding < 64 {
        void_length = padding - 2;
        output.write_all(&[void_length as u8 | 0x80])?;
    } else {
        void_length = padding - 9;
        let (bytes, len) = ebml::encode_size(void_length, Some(8))?;
        output.write_all(&bytes[..len])?;
    }
    let zeros = vec![0u8; void_length as usize];
    output.write_all(&zeros)?;
    Ok(())
}
