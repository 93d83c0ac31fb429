//! The closed set of errors returned across the driver's public API.

use thiserror::Error;

/// Errors produced by the `ext2fs` driver.
///
/// The set is intentionally closed: callers are expected to match on the
/// kind rather than treat errors as opaque, so new variants are a breaking
/// change.
#[derive(Debug, Error)]
pub enum Error {
    /// The image could not be parsed: unreadable, bad magic number where one
    /// was required, a short read, or some other structural failure.
    #[error("bad ext2 image: {0}")]
    BadImage(String),

    /// A positional read or write returned fewer bytes than requested.
    #[error("short I/O: expected {expected} bytes, got {actual}")]
    IoShort { expected: usize, actual: usize },

    /// The underlying device failed for a reason unrelated to short I/O.
    #[error("device I/O failed: {0}")]
    IoFailed(#[from] std::io::Error),

    /// Path resolution did not find the requested file.
    #[error("file not found: {0}")]
    FileNotFound(String),

    /// The destination of a create/link operation is already occupied.
    #[error("file already exists: {0}")]
    FileAlreadyExists(String),

    /// The operation does not apply to this file's type.
    #[error("invalid operation for this file type")]
    InvalidFileType,

    /// The feature is recognized but not implemented by this driver.
    #[error("unsupported operation: {0}")]
    UnsupportedOperation(&'static str),

    /// No free block or inode was available to satisfy an allocation.
    #[error("no space left on device")]
    NoSpace,

    /// A logical block index lies beyond the file's block-map tree.
    #[error("block index out of range")]
    OutOfRange,

    /// A bitmap was found to be inconsistent with the structure it
    /// describes.
    #[error("filesystem corrupt: {0}")]
    Corrupt(String),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
