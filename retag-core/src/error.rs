//! Error types shared by all retag crates.
//!
//! The error kinds are deliberately flat: parsers decide at element
//! boundaries whether a failure is recoverable (recorded as a notification,
//! parsing continues with the next sibling) or fatal (propagated with `?`).

use thiserror::Error;

/// Error type used throughout the retag workspace.
#[derive(Error, Debug)]
pub enum Error {
    /// Stream read/write or filesystem error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed framing or inconsistent sizes.
    #[error("invalid data: {0}")]
    InvalidData(String),

    /// More bytes were expected than the stream provides.
    #[error("truncated data: {0}")]
    TruncatedData(String),

    /// An element is present but carries no usable content.
    ///
    /// Handled locally by parsers: the in-flight entry is dropped and a
    /// warning notification is recorded. Never escapes a parser.
    #[error("no data found")]
    NoDataFound,

    /// Format violation that still allows continuing with siblings.
    #[error("parsing failure: {0}")]
    ParsingFailure(String),

    /// Conversion of a raw value to its target representation failed.
    #[error("conversion failed: {0}")]
    Conversion(String),

    /// Feature recognised but unsupported.
    #[error("not implemented: {0}")]
    NotImplemented(String),

    /// The operation was cancelled externally via the abort flag.
    #[error("operation aborted")]
    OperationAborted,
}

impl Error {
    /// Maps the error kind to the exit status of an enclosing command.
    ///
    /// Success maps to 0 by convention; this method covers the failure side.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::ParsingFailure(_)
            | Error::InvalidData(_)
            | Error::NoDataFound
            | Error::Conversion(_) => 1,
            Error::Io(_) | Error::TruncatedData(_) => 2,
            Error::OperationAborted => 3,
            Error::NotImplemented(_) => 4,
        }
    }
}

/// Result type for retag operations.
pub type Result<T> = std::result::Result<T, Error>;
