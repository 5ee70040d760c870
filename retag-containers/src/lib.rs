//! # retag-containers
//!
//! MP4 (ISO-BMFF) and OGG container support for retag.
//!
//! MP4 atoms are the box-format analogue of EBML elements; this crate
//! plugs them into the generic element tree from `retag-core` and decodes
//! the sample tables needed to keep chunk offsets consistent when media
//! data moves. OGG support consists of page parsing and a logical-stream
//! iterator over the page-fragmented physical layout.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod mp4;
pub mod ogg;

pub use mp4::track::{Mp4Track, SampleSizes, SampleToChunkEntry};
pub use mp4::{atom_ids, fourcc, is_container, Mp4Format};
pub use ogg::{OggIterator, OggPage, PageFlags};
