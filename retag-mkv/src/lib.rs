//! # retag-mkv
//!
//! Matroska/WebM container parsing and in-place rewriting.
//!
//! This crate reads a Matroska file into a lazy element tree, exposes its
//! tracks, tags, chapters and attachments for inspection and mutation, and
//! writes the modified file back while preserving bit-level container
//! semantics and moving as little data as possible.
//!
//! ## Features
//!
//! - EBML parsing and writing (variable-length IDs and size denotations)
//! - Lazy, single-pass header parsing with seek-index resolution
//! - Tag, attachment, chapter and track models
//! - In-place patching: when the changed metadata fits the existing
//!   pre-cluster region (plus padding), clusters are not moved and only
//!   metadata bytes change
//! - Full rewrite with retargeted seek index, cue positions, cluster
//!   "Position" fields and CRC-32 checksums when patching is impossible
//! - Index validation (cue positions against actual cluster offsets)
//!
//! ## Example: adding a tag
//!
//! ```no_run
//! use retag_mkv::{MatroskaContainer, MatroskaTag, SimpleTag};
//!
//! let mut container = MatroskaContainer::open("video.mkv").unwrap();
//! container.parse_header().unwrap();
//! container.parse_tags().unwrap();
//!
//! let mut tag = MatroskaTag::new();
//! tag.simple_tags.push(SimpleTag::with_string("TITLE", "My Title"));
//! container.tags_mut().push(tag);
//!
//! container.apply_changes().unwrap();
//! ```
//!
//! ## Matroska element structure
//!
//! ```text
//! EBML Header
//! Segment
//! ├── SeekHead (index to other elements)
//! ├── Info (segment information)
//! ├── Tracks (track definitions)
//! ├── Chapters (chapter markers)
//! ├── Tags (metadata)
//! ├── Attachments (embedded files)
//! ├── Cues (seeking index)
//! └── Cluster (media data)
//!     ├── Position
//!     └── SimpleBlock / BlockGroup
//! ```
//!
//! Whether the tags land in front of or behind the clusters is controlled
//! through [`WriteConfig`]; the writer relocates them automatically when
//! that avoids rewriting the whole file.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod attachments;
pub mod chapters;
pub mod container;
pub mod cues;
pub mod ebml;
pub mod ids;
pub mod seek_info;
pub mod tags;
pub mod tracks;

mod planner;
mod writer;

pub use attachments::{AttachmentData, AttachmentMaker, MatroskaAttachment};
pub use chapters::{ChapterDisplay, ChapterEdition, MatroskaChapter};
pub use container::{
    ElementPosition, MatroskaContainer, WriteConfig, APP_INFO, DEFAULT_MAX_FULL_PARSE_SIZE,
};
pub use cues::{CuePoint, CueTrackPositions, CuesUpdater};
pub use ebml::EbmlFormat;
pub use seek_info::{SeekEntry, SeekInfo};
pub use tags::{MatroskaTag, SimpleTag, TagMaker, TagTarget, TagValue};
pub use tracks::{MatroskaTrack, TrackKind};

/// Checks whether `data` starts with the EBML header signature.
pub fn is_mkv_signature(data: &[u8]) -> bool {
    data.len() >= 4 && data[0..4] == [0x1A, 0x45, 0xDF, 0xA3]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_mkv_signature() {
        assert!(is_mkv_signature(&[0x1A, 0x45, 0xDF, 0xA3]));
        assert!(is_mkv_signature(&[0x1A, 0x45, 0xDF, 0xA3, 0x00, 0x00]));

        assert!(!is_mkv_signature(&[0x00, 0x00, 0x00, 0x00]));
        assert!(!is_mkv_signature(&[0x1A, 0x45, 0xDF])); // Too short
        assert!(!is_mkv_signature(&[]));
    }
}
