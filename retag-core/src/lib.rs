//! # retag-core
//!
//! Core primitives for the retag container rewrite engine:
//!
//! - binary stream helpers and CRC-32 ([`io`])
//! - typed parser notifications ([`notify`])
//! - cancellation and progress reporting ([`progress`])
//! - the generic lazy element tree shared by the EBML and MP4 decoders
//!   ([`tree`])
//! - backup handling for in-place rewrites ([`backup`])
//! - the shared error type ([`error`])
//!
//! The format-specific crates (`retag-mkv`, `retag-containers`) build on
//! these pieces; nothing here knows about a concrete container format.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod backup;
pub mod error;
pub mod io;
pub mod notify;
pub mod progress;
pub mod tree;

pub use error::{Error, Result};
pub use notify::{Notification, NotificationList, Severity};
pub use progress::{AbortHandle, Progress};
pub use tree::{ElementFormat, Node, NodeId, RawHeader, Tree};
