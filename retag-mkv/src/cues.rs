//! Editable model of a Matroska "Cues" element.
//!
//! The planner retargets cue positions while it converges on the output
//! layout. Every cue keeps the offsets it was parsed with (the read side)
//! next to the offsets it will be written with, so repeated retargeting
//! passes can always re-match against the original file.

use crate::ebml;
use crate::ids;

use retag_core::error::Result;
use retag_core::notify::NotificationList;
use retag_core::tree::{NodeId, Tree};

use std::io::{Read, Seek, Write};

const CONTEXT: &str = "parsing \"Cues\"-element";

/// One "CueTrackPositions" entry.
#[derive(Debug, Clone, Default)]
pub struct CueTrackPositions {
    /// Referenced track number.
    pub track: Option<u64>,
    /// Cluster offset as stored in the original file.
    pub read_cluster_position: u64,
    /// Cluster offset to be written.
    pub cluster_position: u64,
    /// Relative block offset as stored in the original file.
    pub read_relative_position: Option<u64>,
    /// Relative block offset to be written.
    pub relative_position: Option<u64>,
    /// Optional cue duration.
    pub cue_duration: Option<u64>,
    /// Optional block number.
    pub block_number: Option<u64>,
    /// Optional codec state offset.
    pub codec_state: Option<u64>,
    /// Children preserved verbatim (e.g. "CueReference").
    raw_children: Vec<u8>,
}

impl CueTrackPositions {
    fn data_size(&self) -> u64 {
        let mut size = 0;
        if let Some(track) = self.track {
            size += ebml::uint_element_size(ids::CUE_TRACK, track);
        }
        size += ebml::uint_element_size(ids::CUE_CLUSTER_POSITION, self.cluster_position);
        if let Some(relative) = self.relative_position {
            size += ebml::uint_element_size(ids::CUE_RELATIVE_POSITION, relative);
        }
        if let Some(duration) = self.cue_duration {
            size += ebml::uint_element_size(ids::CUE_DURATION, duration);
        }
        if let Some(number) = self.block_number {
            size += ebml::uint_element_size(ids::CUE_BLOCK_NUMBER, number);
        }
        if let Some(state) = self.codec_state {
            size += ebml::uint_element_size(ids::CUE_CODEC_STATE, state);
        }
        size + self.raw_children.len() as u64
    }

    fn total_size(&self) -> u64 {
        let data = self.data_size();
        1 + u64::from(ebml::size_denotation_length(data)) + data
    }
}

/// One "CuePoint" entry.
#[derive(Debug, Clone)]
pub struct CuePoint {
    /// Cue timestamp in timecode units.
    pub time: u64,
    /// Track positions of this cue point.
    pub positions: Vec<CueTrackPositions>,
}

impl CuePoint {
    fn data_size(&self) -> u64 {
        ebml::uint_element_size(ids::CUE_TIME, self.time)
            + self.positions.iter().map(|p| p.total_size()).sum::<u64>()
    }

    fn total_size(&self) -> u64 {
        let data = self.data_size();
        1 + u64::from(ebml::size_denotation_length(data)) + data
    }
}

/// Parses a "Cues" element into an editable list of cue points and emits
/// the updated element.
#[derive(Debug, Default)]
pub struct CuesUpdater {
    cue_points: Vec<CuePoint>,
    notifications: NotificationList,
}

impl CuesUpdater {
    /// Creates an empty updater.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses the cue points of an existing "Cues" element.
    ///
    /// Entries without a usable cluster position are dropped with a warning.
    pub fn parse<R: Read + Seek + ?Sized>(
        &mut self,
        tree: &mut Tree<ebml::EbmlFormat>,
        cues: NodeId,
        io: &mut R,
    ) -> Result<()> {
        tree.parse(cues, io)?;
        let mut child = tree.first_child(cues);
        while let Some(cue_point) = child {
            tree.parse(cue_point, io)?;
            match tree.node(cue_point).id() {
                ids::CUE_POINT => self.parse_cue_point(tree, cue_point, io)?,
                ids::VOID | ids::CRC32 => {}
                other => self.notifications.warning(
                    CONTEXT,
                    format!(
                        "\"Cues\"-element contains unknown child 0x{:X}; it will be ignored",
                        other
                    ),
                ),
            }
            child = tree.next_sibling(cue_point);
        }
        Ok(())
    }

    fn parse_cue_point<R: Read + Seek + ?Sized>(
        &mut self,
        tree: &mut Tree<ebml::EbmlFormat>,
        cue_point: NodeId,
        io: &mut R,
    ) -> Result<()> {
        let mut time = None;
        let mut positions = Vec::new();
        let mut child = tree.first_child(cue_point);
        while let Some(c) = child {
            tree.parse(c, io)?;
            match tree.node(c).id() {
                ids::CUE_TIME => {
                    if time.is_some() {
                        self.notifications.warning(
                            CONTEXT,
                            "\"CuePoint\"-element contains multiple \"CueTime\" elements",
                        );
                    }
                    let data = tree.read_data(c, io)?;
                    time = Some(ebml::parse_uint(&data)?);
                }
                ids::CUE_TRACK_POSITIONS => {
                    if let Some(entry) = self.parse_positions(tree, c, io)? {
                        positions.push(entry);
                    }
                }
                ids::VOID | ids::CRC32 => {}
                other => self.notifications.warning(
                    CONTEXT,
                    format!(
                        "\"CuePoint\"-element contains unknown child 0x{:X}; it will be ignored",
                        other
                    ),
                ),
            }
            child = tree.next_sibling(c);
        }
        match time {
            Some(time) if !positions.is_empty() => {
                self.cue_points.push(CuePoint { time, positions });
            }
            Some(_) => self.notifications.warning(
                CONTEXT,
                "\"CuePoint\"-element without usable \"CueTrackPositions\" is dropped",
            ),
            None => self.notifications.warning(
                CONTEXT,
                "\"CuePoint\"-element does not contain mandatory element \"CueTime\"; it is dropped",
            ),
        }
        Ok(())
    }

    fn parse_positions<R: Read + Seek + ?Sized>(
        &mut self,
        tree: &mut Tree<ebml::EbmlFormat>,
        node: NodeId,
        io: &mut R,
    ) -> Result<Option<CueTrackPositions>> {
        let mut entry = CueTrackPositions::default();
        let mut has_cluster_position = false;
        let mut child = tree.first_child(node);
        while let Some(c) = child {
            tree.parse(c, io)?;
            match tree.node(c).id() {
                ids::CUE_TRACK => {
                    let data = tree.read_data(c, io)?;
                    entry.track = Some(ebml::parse_uint(&data)?);
                }
                ids::CUE_CLUSTER_POSITION => {
                    let data = tree.read_data(c, io)?;
                    let position = ebml::parse_uint(&data)?;
                    entry.read_cluster_position = position;
                    entry.cluster_position = position;
                    has_cluster_position = true;
                }
                ids::CUE_RELATIVE_POSITION => {
                    let data = tree.read_data(c, io)?;
                    let position = ebml::parse_uint(&data)?;
                    entry.read_relative_position = Some(position);
                    entry.relative_position = Some(position);
                }
                ids::CUE_DURATION => {
                    let data = tree.read_data(c, io)?;
                    entry.cue_duration = Some(ebml::parse_uint(&data)?);
                }
                ids::CUE_BLOCK_NUMBER => {
                    let data = tree.read_data(c, io)?;
                    entry.block_number = Some(ebml::parse_uint(&data)?);
                }
                ids::CUE_CODEC_STATE => {
                    let data = tree.read_data(c, io)?;
                    entry.codec_state = Some(ebml::parse_uint(&data)?);
                }
                ids::CUE_REFERENCE => {
                    // Preserved verbatim; nothing in it needs retargeting
                    // because references are time-based.
                    let start = tree.node(c).start_offset();
                    let total = tree.node(c).total_size();
                    io.seek(std::io::SeekFrom::Start(start))?;
                    let mut raw = vec![0u8; total as usize];
                    io.read_exact(&mut raw)?;
                    entry.raw_children.extend_from_slice(&raw);
                }
                ids::VOID | ids::CRC32 => {}
                other => self.notifications.warning(
                    CONTEXT,
                    format!(
                        "\"CueTrackPositions\"-element contains unknown child 0x{:X}; it will be ignored",
                        other
                    ),
                ),
            }
            child = tree.next_sibling(c);
        }
        if entry.track.is_none() {
            self.notifications.warning(
                CONTEXT,
                "\"CueTrackPositions\"-element does not contain mandatory element \"CueTrack\"",
            );
        }
        if !has_cluster_position {
            self.notifications.warning(
                CONTEXT,
                "\"CueTrackPositions\"-element without \"CueClusterPosition\" is dropped",
            );
            return Ok(None);
        }
        Ok(Some(entry))
    }

    /// The parsed cue points.
    pub fn cue_points(&self) -> &[CuePoint] {
        &self.cue_points
    }

    /// Retargets every cue that points at the cluster read from
    /// `old_cluster_read_offset` to `new_cluster_write_offset`.
    ///
    /// Returns whether the total encoded size changed.
    pub fn update_offsets(&mut self, old_cluster_read_offset: u64, new_cluster_write_offset: u64) -> bool {
        let before = self.total_size();
        for cue in &mut self.cue_points {
            for position in &mut cue.positions {
                if position.read_cluster_position == old_cluster_read_offset {
                    position.cluster_position = new_cluster_write_offset;
                }
            }
        }
        self.total_size() != before
    }

    /// Retargets the relative block offsets of the cluster read from
    /// `old_cluster_read_offset`: cues whose stored relative offset equals
    /// `in_cluster_read_delta` are rewritten to `in_cluster_write_delta`.
    ///
    /// Returns whether the total encoded size changed.
    pub fn update_relative_offsets(
        &mut self,
        old_cluster_read_offset: u64,
        in_cluster_read_delta: u64,
        in_cluster_write_delta: u64,
    ) -> bool {
        let before = self.total_size();
        for cue in &mut self.cue_points {
            for position in &mut cue.positions {
                if position.read_cluster_position == old_cluster_read_offset
                    && position.read_relative_position == Some(in_cluster_read_delta)
                {
                    position.relative_position = Some(in_cluster_write_delta);
                }
            }
        }
        self.total_size() != before
    }

    fn data_size(&self) -> u64 {
        self.cue_points.iter().map(|c| c.total_size()).sum()
    }

    /// Encoded size of the Cues element including its own header.
    ///
    /// A pure function of the current contents; zero when no cue points
    /// survived parsing.
    pub fn total_size(&self) -> u64 {
        if self.cue_points.is_empty() {
            return 0;
        }
        let data = self.data_size();
        4 + u64::from(ebml::size_denotation_length(data)) + data
    }

    /// Emits the updated Cues element. Writes nothing when empty.
    pub fn make<W: Write + ?Sized>(&mut self, out: &mut W) -> Result<()> {
        if self.cue_points.is_empty() {
            return Ok(());
        }
        ebml::write_id(out, ids::CUES)?;
        ebml::write_size(out, self.data_size())?;
        for cue in &self.cue_points {
            ebml::write_id(out, ids::CUE_POINT)?;
            ebml::write_size(out, cue.data_size())?;
            ebml::make_uint(out, ids::CUE_TIME, cue.time)?;
            for position in &cue.positions {
                ebml::write_id(out, ids::CUE_TRACK_POSITIONS)?;
                ebml::write_size(out, position.data_size())?;
                if let Some(track) = position.track {
                    ebml::make_uint(out, ids::CUE_TRACK, track)?;
                }
                ebml::make_uint(out, ids::CUE_CLUSTER_POSITION, position.cluster_position)?;
                if let Some(relative) = position.relative_position {
                    ebml::make_uint(out, ids::CUE_RELATIVE_POSITION, relative)?;
                }
                if let Some(duration) = position.cue_duration {
                    ebml::make_uint(out, ids::CUE_DURATION, duration)?;
                }
                if let Some(number) = position.block_number {
                    ebml::make_uint(out, ids::CUE_BLOCK_NUMBER, number)?;
                }
                if let Some(state) = position.codec_state {
                    ebml::make_uint(out, ids::CUE_CODEC_STATE, state)?;
                }
                out.write_all(&position.raw_children)?;
            }
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

    /// Builds a Cues element with two cue points referencing two clusters.
    fn sample_cues() -> Vec<u8> {
        let mut updater = CuesUpdater {
            cue_points: vec![
                CuePoint {
                    time: 0,
                    positions: vec![CueTrackPositions {
                        track: Some(1),
                        read_cluster_position: 0x100,
                        cluster_position: 0x100,
                        read_relative_position: Some(8),
                        relative_position: Some(8),
                        ..Default::default()
                    }],
                },
                CuePoint {
                    time: 5000,
                    positions: vec![CueTrackPositions {
                        track: Some(1),
                        read_cluster_position: 0x2000,
                        cluster_position: 0x2000,
                        ..Default::default()
                    }],
                },
            ],
            notifications: NotificationList::new(),
        };
        let mut out = Vec::new();
        updater.make(&mut out).unwrap();
        out
    }

    fn parse_sample() -> CuesUpdater {
        let data = sample_cues();
        let mut io = Cursor::new(data.clone());
        let mut tree: Tree<ebml::EbmlFormat> = Tree::new(0, data.len() as u64);
        let root = tree.root();
        let mut updater = CuesUpdater::new();
        updater.parse(&mut tree, root, &mut io).unwrap();
        updater
    }

    #[test]
    fn test_parse_preserves_entries() {
        let updater = parse_sample();
        assert_eq!(updater.cue_points().len(), 2);
        assert_eq!(updater.cue_points()[0].time, 0);
        assert_eq!(updater.cue_points()[0].positions[0].read_cluster_position, 0x100);
        assert_eq!(
            updater.cue_points()[0].positions[0].read_relative_position,
            Some(8)
        );
        assert_eq!(updater.cue_points()[1].positions[0].read_cluster_position, 0x2000);
    }

    #[test]
    fn test_total_size_matches_emitted_bytes() {
        let mut updater = parse_sample();
        let mut out = Vec::new();
        updater.make(&mut out).unwrap();
        assert_eq!(out.len() as u64, updater.total_size());
    }

    #[test]
    fn test_update_offsets() {
        let mut updater = parse_sample();
        // Same encoded width: 0x2000 -> 0x2040 keeps the size stable.
        assert!(!updater.update_offsets(0x2000, 0x2040));
        assert_eq!(updater.cue_points()[1].positions[0].cluster_position, 0x2040);

        // Growing width changes the size; re-matching still works because
        // the read-side offset is retained.
        assert!(updater.update_offsets(0x2000, 0x2_0000));
        assert_eq!(updater.cue_points()[1].positions[0].cluster_position, 0x2_0000);
        // The first cue point is untouched.
        assert_eq!(updater.cue_points()[0].positions[0].cluster_position, 0x100);
    }

    #[test]
    fn test_update_relative_offsets() {
        let mut updater = parse_sample();
        assert!(!updater.update_relative_offsets(0x100, 8, 10));
        assert_eq!(
            updater.cue_points()[0].positions[0].relative_position,
            Some(10)
        );
        // No entry of that cluster stores relative offset 99.
        assert!(!updater.update_relative_offsets(0x100, 99, 1000));
        assert!(updater.update_relative_offsets(0x100, 8, 0x300));
    }

    #[test]
    fn test_positions_without_cluster_position_dropped() {
        // CuePoint with a CueTime and a CueTrackPositions lacking a cluster position.
        let mut inner = Vec::new();
        ebml::make_uint(&mut inner, ids::CUE_TRACK, 1).unwrap();
        let mut cue_point = Vec::new();
        ebml::make_uint(&mut cue_point, ids::CUE_TIME, 1).unwrap();
        ebml::write_id(&mut cue_point, ids::CUE_TRACK_POSITIONS).unwrap();
        ebml::write_size(&mut cue_point, inner.len() as u64).unwrap();
        cue_point.extend_from_slice(&inner);
        let mut data = Vec::new();
        ebml::write_id(&mut data, ids::CUES).unwrap();
        ebml::write_size(&mut data, (cue_point.len() + 2) as u64).unwrap();
        ebml::write_id(&mut data, ids::CUE_POINT).unwrap();
        ebml::write_size(&mut data, cue_point.len() as u64).unwrap();
        data.extend_from_slice(&cue_point);

        let mut io = Cursor::new(data.clone());
        let mut tree: Tree<ebml::EbmlFormat> = Tree::new(0, data.len() as u64);
        let root = tree.root();
        let mut updater = CuesUpdater::new();
        updater.parse(&mut tree, root, &mut io).unwrap();

        assert!(updater.cue_points().is_empty());
        assert_eq!(updater.total_size(), 0);
        let mut notifications = NotificationList::new();
        updater.take_notifications(&mut notifications);
        assert!(!notifications.is_empty());
    }
}
