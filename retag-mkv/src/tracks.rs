//! Matroska track header model (inspection only).
//!
//! Tracks elements are re-emitted from buffered copies on write; this
//! model identifies the tracks of a file without decoding any codec
//! configuration.

use crate::ebml;
use crate::ids;

use retag_core::error::{Error, Result};
use retag_core::notify::NotificationList;
use retag_core::tree::{NodeId, Tree};

use std::io::{Read, Seek};

const CONTEXT: &str = "parsing \"TrackEntry\"-element";

/// Kind of a Matroska track.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TrackKind {
    /// Video track (type 1).
    Video,
    /// Audio track (type 2).
    Audio,
    /// Complex track (type 3).
    Complex,
    /// Subtitle track (type 17).
    Subtitle,
    /// Any other or missing type.
    #[default]
    Unknown,
}

impl TrackKind {
    fn from_raw(raw: u64) -> Self {
        match raw {
            1 => TrackKind::Video,
            2 => TrackKind::Audio,
            3 => TrackKind::Complex,
            17 => TrackKind::Subtitle,
            _ => TrackKind::Unknown,
        }
    }
}

/// Header-level information about one track.
#[derive(Debug, Clone, Default)]
pub struct MatroskaTrack {
    /// Track number (1-based).
    pub number: u64,
    /// Track UID.
    pub uid: u64,
    /// Track kind.
    pub kind: TrackKind,
    /// Codec identifier string, e.g. `"V_VP9"`.
    pub codec_id: String,
    /// Track name.
    pub name: Option<String>,
    /// Language code.
    pub language: Option<String>,
    /// Default flag.
    pub is_default: bool,
    /// Enabled flag.
    pub is_enabled: bool,
    /// Forced flag.
    pub is_forced: bool,
}

impl MatroskaTrack {
    /// Parses a "TrackEntry" element.
    ///
    /// Fails with `NoDataFound` when the entry is empty; the caller drops
    /// it in that case.
    pub fn parse_header<R: Read + Seek + ?Sized>(
        tree: &mut Tree<ebml::EbmlFormat>,
        node: NodeId,
        io: &mut R,
        notifications: &mut NotificationList,
    ) -> Result<Self> {
        tree.parse(node, io)?;
        if tree.first_child(node).is_none() {
            return Err(Error::NoDataFound);
        }
        let mut track = MatroskaTrack {
            is_default: true,
            is_enabled: true,
            ..Default::default()
        };
        let mut child = tree.first_child(node);
        while let Some(c) = child {
            tree.parse(c, io)?;
            match tree.node(c).id() {
                ids::TRACK_NUMBER => {
                    let data = tree.read_data(c, io)?;
                    track.number = ebml::parse_uint(&data)?;
                }
                ids::TRACK_UID => {
                    let data = tree.read_data(c, io)?;
                    track.uid = ebml::parse_uint(&data)?;
                }
                ids::TRACK_TYPE => {
                    let data = tree.read_data(c, io)?;
                    track.kind = TrackKind::from_raw(ebml::parse_uint(&data)?);
                }
                ids::CODEC_ID => {
                    let data = tree.read_data(c, io)?;
                    track.codec_id = ebml::parse_string(&data)?;
                }
                ids::NAME => {
                    let data = tree.read_data(c, io)?;
                    track.name = Some(ebml::parse_string(&data)?);
                }
                ids::LANGUAGE => {
                    let data = tree.read_data(c, io)?;
                    track.language = Some(ebml::parse_string(&data)?);
                }
                ids::FLAG_DEFAULT => {
                    let data = tree.read_data(c, io)?;
                    track.is_default = ebml::parse_uint(&data)? != 0;
                }
                ids::FLAG_ENABLED => {
                    let data = tree.read_data(c, io)?;
                    track.is_enabled = ebml::parse_uint(&data)? != 0;
                }
                ids::FLAG_FORCED => {
                    let data = tree.read_data(c, io)?;
                    track.is_forced = ebml::parse_uint(&data)? != 0;
                }
                // Codec configuration and A/V parameters are intentionally
                // not decoded here.
                _ => {}
            }
            child = tree.next_sibling(c);
        }
        if track.number == 0 && track.codec_id.is_empty() {
            notifications.warning(CONTEXT, "track entry carries neither number nor codec ID");
        }
        Ok(track)
    }
}
