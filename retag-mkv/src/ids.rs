//! EBML and Matroska element identifiers.
//!
//! Only the identifiers the rewrite engine actually touches are defined
//! here; IDs are stored with their marker bits, exactly as they appear in
//! the file.

// =============================================================================
// EBML header elements
// =============================================================================

/// EBML Header element.
pub const EBML: u32 = 0x1A45DFA3;
/// EBML Version.
pub const EBML_VERSION: u32 = 0x4286;
/// EBML Read Version.
pub const EBML_READ_VERSION: u32 = 0x42F7;
/// EBML Max ID Length.
pub const EBML_MAX_ID_LENGTH: u32 = 0x42F2;
/// EBML Max Size Length.
pub const EBML_MAX_SIZE_LENGTH: u32 = 0x42F3;
/// EBML Doc Type.
pub const DOC_TYPE: u32 = 0x4282;
/// EBML Doc Type Version.
pub const DOC_TYPE_VERSION: u32 = 0x4287;
/// EBML Doc Type Read Version.
pub const DOC_TYPE_READ_VERSION: u32 = 0x4285;

/// Void (padding).
pub const VOID: u32 = 0xEC;
/// CRC-32.
pub const CRC32: u32 = 0xBF;

// =============================================================================
// Segment and meta seek information
// =============================================================================

/// Segment (the root container for all Matroska data).
pub const SEGMENT: u32 = 0x18538067;
/// SeekHead (index of top-level elements).
pub const SEEK_HEAD: u32 = 0x114D9B74;
/// Seek entry.
pub const SEEK: u32 = 0x4DBB;
/// Seek ID.
pub const SEEK_ID: u32 = 0x53AB;
/// Seek Position.
pub const SEEK_POSITION: u32 = 0x53AC;

// =============================================================================
// Segment information
// =============================================================================

/// Segment Info.
pub const INFO: u32 = 0x1549A966;
/// Timecode Scale (nanoseconds per timecode unit, default 1000000 = 1ms).
pub const TIMECODE_SCALE: u32 = 0x2AD7B1;
/// Duration (in timecode units).
pub const DURATION: u32 = 0x4489;
/// Title.
pub const TITLE: u32 = 0x7BA9;
/// Muxing App.
pub const MUXING_APP: u32 = 0x4D80;
/// Writing App.
pub const WRITING_APP: u32 = 0x5741;

// =============================================================================
// Cluster elements
// =============================================================================

/// Cluster (contains blocks of media data).
pub const CLUSTER: u32 = 0x1F43B675;
/// Position (cluster position in segment).
pub const POSITION: u32 = 0xA7;
/// Previous Size (size of previous cluster).
pub const PREV_SIZE: u32 = 0xAB;
/// SimpleBlock.
pub const SIMPLE_BLOCK: u32 = 0xA3;
/// BlockGroup.
pub const BLOCK_GROUP: u32 = 0xA0;
/// Block.
pub const BLOCK: u32 = 0xA1;

// =============================================================================
// Track elements
// =============================================================================

/// Tracks.
pub const TRACKS: u32 = 0x1654AE6B;
/// Track Entry.
pub const TRACK_ENTRY: u32 = 0xAE;
/// Track Number.
pub const TRACK_NUMBER: u32 = 0xD7;
/// Track UID.
pub const TRACK_UID: u32 = 0x73C5;
/// Track Type.
pub const TRACK_TYPE: u32 = 0x83;
/// Flag Enabled.
pub const FLAG_ENABLED: u32 = 0xB9;
/// Flag Default.
pub const FLAG_DEFAULT: u32 = 0x88;
/// Flag Forced.
pub const FLAG_FORCED: u32 = 0x55AA;
/// Name.
pub const NAME: u32 = 0x536E;
/// Language.
pub const LANGUAGE: u32 = 0x22B59C;
/// Codec ID.
pub const CODEC_ID: u32 = 0x86;

// =============================================================================
// Cueing data
// =============================================================================

/// Cues.
pub const CUES: u32 = 0x1C53BB6B;
/// Cue Point.
pub const CUE_POINT: u32 = 0xBB;
/// Cue Time.
pub const CUE_TIME: u32 = 0xB3;
/// Cue Track Positions.
pub const CUE_TRACK_POSITIONS: u32 = 0xB7;
/// Cue Track.
pub const CUE_TRACK: u32 = 0xF7;
/// Cue Cluster Position.
pub const CUE_CLUSTER_POSITION: u32 = 0xF1;
/// Cue Relative Position.
pub const CUE_RELATIVE_POSITION: u32 = 0xF0;
/// Cue Duration.
pub const CUE_DURATION: u32 = 0xB2;
/// Cue Block Number.
pub const CUE_BLOCK_NUMBER: u32 = 0x5378;
/// Cue Codec State.
pub const CUE_CODEC_STATE: u32 = 0xEA;
/// Cue Reference.
pub const CUE_REFERENCE: u32 = 0xDB;

// =============================================================================
// Chapters
// =============================================================================

/// Chapters.
pub const CHAPTERS: u32 = 0x1043A770;
/// Edition Entry.
pub const EDITION_ENTRY: u32 = 0x45B9;
/// Edition UID.
pub const EDITION_UID: u32 = 0x45BC;
/// Edition Flag Hidden.
pub const EDITION_FLAG_HIDDEN: u32 = 0x45BD;
/// Edition Flag Default.
pub const EDITION_FLAG_DEFAULT: u32 = 0x45DB;
/// Edition Flag Ordered.
pub const EDITION_FLAG_ORDERED: u32 = 0x45DD;
/// Chapter Atom.
pub const CHAPTER_ATOM: u32 = 0xB6;
/// Chapter UID.
pub const CHAPTER_UID: u32 = 0x73C4;
/// Chapter Time Start.
pub const CHAPTER_TIME_START: u32 = 0x91;
/// Chapter Time End.
pub const CHAPTER_TIME_END: u32 = 0x92;
/// Chapter Flag Hidden.
pub const CHAPTER_FLAG_HIDDEN: u32 = 0x98;
/// Chapter Flag Enabled.
pub const CHAPTER_FLAG_ENABLED: u32 = 0x4598;
/// Chapter Display.
pub const CHAPTER_DISPLAY: u32 = 0x80;
/// Chapter String.
pub const CHAP_STRING: u32 = 0x85;
/// Chapter Language.
pub const CHAP_LANGUAGE: u32 = 0x437C;

// =============================================================================
// Tagging
// =============================================================================

/// Tags.
pub const TAGS: u32 = 0x1254C367;
/// Tag.
pub const TAG: u32 = 0x7373;
/// Targets.
pub const TARGETS: u32 = 0x63C0;
/// Target Type Value.
pub const TARGET_TYPE_VALUE: u32 = 0x68CA;
/// Target Type.
pub const TARGET_TYPE: u32 = 0x63CA;
/// Tag Track UID.
pub const TAG_TRACK_UID: u32 = 0x63C5;
/// Tag Edition UID.
pub const TAG_EDITION_UID: u32 = 0x63C9;
/// Tag Chapter UID.
pub const TAG_CHAPTER_UID: u32 = 0x63C4;
/// Tag Attachment UID.
pub const TAG_ATTACHMENT_UID: u32 = 0x63C6;
/// Simple Tag.
pub const SIMPLE_TAG: u32 = 0x67C8;
/// Tag Name.
pub const TAG_NAME: u32 = 0x45A3;
/// Tag Language.
pub const TAG_LANGUAGE: u32 = 0x447A;
/// Tag Default.
pub const TAG_DEFAULT: u32 = 0x4484;
/// Tag String.
pub const TAG_STRING: u32 = 0x4487;
/// Tag Binary.
pub const TAG_BINARY: u32 = 0x4485;

// =============================================================================
// Attachments
// =============================================================================

/// Attachments.
pub const ATTACHMENTS: u32 = 0x1941A469;
/// Attached File.
pub const ATTACHED_FILE: u32 = 0x61A7;
/// File Description.
pub const FILE_DESCRIPTION: u32 = 0x467E;
/// File Name.
pub const FILE_NAME: u32 = 0x466E;
/// File Media Type.
pub const FILE_MEDIA_TYPE: u32 = 0x4660;
/// File Data.
pub const FILE_DATA: u32 = 0x465C;
/// File UID.
pub const FILE_UID: u32 = 0x46AE;

/// Returns whether `id` denotes a master element (one that holds child
/// elements rather than raw data).
pub fn is_master(id: u32) -> bool {
    matches!(
        id,
        EBML | SEGMENT
            | SEEK_HEAD
            | SEEK
            | INFO
            | TRACKS
            | TRACK_ENTRY
            | CLUSTER
            | BLOCK_GROUP
            | CUES
            | CUE_POINT
            | CUE_TRACK_POSITIONS
            | CUE_REFERENCE
            | CHAPTERS
            | EDITION_ENTRY
            | CHAPTER_ATOM
            | CHAPTER_DISPLAY
            | TAGS
            | TAG
            | TARGETS
            | SIMPLE_TAG
            | ATTACHMENTS
            | ATTACHED_FILE
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_well_known_ids() {
        assert_eq!(EBML, 0x1A45DFA3);
        assert_eq!(SEGMENT, 0x18538067);
        assert_eq!(CLUSTER, 0x1F43B675);
        assert_eq!(CUES, 0x1C53BB6B);
        assert_eq!(VOID, 0xEC);
        assert_eq!(CRC32, 0xBF);
    }

    #[test]
    fn test_is_master() {
        assert!(is_master(SEGMENT));
        assert!(is_master(CLUSTER));
        assert!(is_master(SIMPLE_TAG));
        assert!(!is_master(VOID));
        assert!(!is_master(CRC32));
        assert!(!is_master(SIMPLE_BLOCK));
        assert!(!is_master(POSITION));
    }
}
