//! Error Types
//!
//! Errors here split into two policies: "environmental" failures (I/O, the metadata
//! catalog) have no local recovery in an append-only design and are escalated all the way to the
//! top; "contract" failures (`NotFound`, `AlreadyFlushed`, ...) are ordinary `Result`s the caller
//! is expected to handle. Both are represented as variants of one enum so that `?` composes
//! through the whole core, but callers can match on `is_fatal()` to decide whether to keep
//! running.
use std::io;

use failure::Fail;

/// Errors produced by the block-storage core.
#[derive(Debug, Fail)]
pub enum Error {
    /// A stripe file read, write, or truncate failed. Policy: fatal.
    #[fail(display = "block store I/O error: {}", _0)]
    Io(io::Error),

    /// The metadata catalog failed for a reason other than not-found. Policy: fatal.
    #[fail(display = "superblock catalog error: {}", _0)]
    Catalog(String),

    /// A superblock lookup found no matching record. Policy: returned as `None`, never raised
    /// through this variant in practice -- kept for callers that prefer `Result` over `Option`.
    #[fail(display = "no superblock found")]
    NotFound,

    /// `ReadDatablock` found no valid frame at the requested address.
    #[fail(display = "no datablock found at address {:#x}", _0)]
    DatablockNotFound(u64),

    /// A block's type tag did not match `Core` or `Vector`. Policy: fatal -- indicates storage
    /// corruption.
    #[fail(display = "corrupt block frame: unknown type tag {}", _0)]
    CorruptFrame(u8),

    /// A second `Commit` was attempted on an already-flushed `Generation`. Policy: returned;
    /// does not affect store state.
    #[fail(display = "generation already flushed")]
    AlreadyFlushed,

    /// A programmer error: a malformed address, wrong-sized buffer, etc.
    #[fail(display = "misuse: {}", _0)]
    Misuse(String),
}

impl Error {
    /// Whether this error represents an environmental failure with no local recovery, as
    /// opposed to a contract error the caller is expected to handle.
    pub fn is_fatal(&self) -> bool {
        match self {
            Error::Io(_) | Error::Catalog(_) | Error::CorruptFrame(_) => true,
            Error::NotFound
            | Error::DatablockNotFound(_)
            | Error::AlreadyFlushed
            | Error::Misuse(_) => false,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}
