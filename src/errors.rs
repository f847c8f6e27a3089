//! Crate-specific error types for mmap-buffer.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Result alias for mmap-buffer operations.
pub type Result<T> = std::result::Result<T, BufferError>;

/// Error type covering backing acquisition, mapping, bounds, and state misuse.
///
/// Environmental failures (`Open`, `Size`, `Map`, `FileCreate`, `OutOfMemory`)
/// are always returned to the caller. `IndexOutOfRange`, `OutsideWindow`,
/// `ProtectionViolation` and `InvalidState` signal contract violations by the
/// caller; they never leave the buffer's bookkeeping modified.
#[derive(Debug, Error)]
pub enum BufferError {
    /// The backing file could not be opened.
    #[error("failed to open backing file {path}: {source}")]
    Open {
        /// Path that was being opened.
        path: PathBuf,
        /// Underlying OS error.
        #[source]
        source: io::Error,
    },

    /// The size of an existing backing file could not be determined.
    #[error("failed to query size of {path}: {source}")]
    Size {
        /// Path of the backing file.
        path: PathBuf,
        /// Underlying OS error.
        #[source]
        source: io::Error,
    },

    /// The virtual-memory mapping call failed.
    #[error("mapping failed: offset={offset}, len={len}: {source}")]
    Map {
        /// Requested window offset.
        offset: u64,
        /// Requested window length.
        len: u64,
        /// Underlying OS error.
        #[source]
        source: io::Error,
    },

    /// A temporary backing file could not be created or pre-sized.
    #[error("failed to create backing file {path}: {source}")]
    FileCreate {
        /// Path of the temporary file (or its directory if no file was created).
        path: PathBuf,
        /// Underlying OS error.
        #[source]
        source: io::Error,
    },

    /// Heap allocation failed.
    #[error("out of memory: failed to allocate {bytes} bytes")]
    OutOfMemory {
        /// Number of bytes requested.
        bytes: usize,
    },

    /// `entries * size_of::<T>()` does not fit in the address space.
    #[error("capacity overflow: {entries} entries of {elem_size} bytes")]
    CapacityOverflow {
        /// Requested element count.
        entries: usize,
        /// Size of one element in bytes.
        elem_size: usize,
    },

    /// Mapped storage needs a non-zero byte size.
    #[error("size must be greater than zero")]
    ZeroSize,

    /// A window offset is not a multiple of the mapping granularity.
    #[error("misaligned offset: offset={offset}, required alignment={required}")]
    Misaligned {
        /// Required alignment in bytes.
        required: u64,
        /// Offending offset.
        offset: u64,
    },

    /// A checked byte access fell outside the mapped window.
    #[error("byte offset out of bounds: offset={offset}, mapped={len}")]
    OutOfBounds {
        /// Requested offset relative to the window start.
        offset: u64,
        /// Bytes currently mapped.
        len: u64,
    },

    /// An element index was not below the buffer's entry count.
    #[error("index out of range: index={index}, len={len}")]
    IndexOutOfRange {
        /// Requested index.
        index: usize,
        /// Number of entries in the buffer.
        len: usize,
    },

    /// The element exists but lies outside the currently mapped window.
    #[error("index {index} is outside the mapped window {start}..{end}")]
    OutsideWindow {
        /// Requested index.
        index: usize,
        /// First element of the window.
        start: usize,
        /// One past the last element of the window.
        end: usize,
    },

    /// A checked write was attempted while the buffer is read-only.
    #[error("write to index {index} of a read-only buffer")]
    ProtectionViolation {
        /// Index that was written.
        index: usize,
    },

    /// The object is not open (never opened, or already closed).
    #[error("invalid state: {0}")]
    InvalidState(&'static str),

    /// The operation is not supported by this kind of backing.
    #[error("invalid access mode: {0}")]
    InvalidMode(&'static str),

    /// Error when a flush operation fails.
    #[error("flush failed: {0}")]
    FlushFailed(String),

    /// Wrapper for `std::io::Error`.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}
