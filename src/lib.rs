//! # mmap-buffer: typed arrays that do not have to live on the heap
//!
//! This crate stores large arrays of fixed-size elements (per-vertex or
//! per-edge state in a graph engine, for example) behind one typed interface
//! while letting the caller choose where the bytes live.
//!
//! ## Strategies
//!
//! - **Heap**: an ordinary zeroed `Vec<T>`
//! - **AnonymousMap**: an anonymous, shared OS mapping
//! - **FileBackedMap**: a shared mapping over a pre-sized temporary file that
//!   is deleted when the buffer closes
//!
//! Creation either fully succeeds or leaves nothing behind: mapped windows are
//! unmapped and temporary files are deleted before an error is returned.
//!
//! ## Quick Start
//!
//! ```no_run
//! use mmap_buffer::TypedBuffer;
//!
//! // One u64 of state per vertex, paged by the OS.
//! let mut state = TypedBuffer::<u64>::create_file_backed_mapping(10_000_000)?;
//! state.random_access()?;
//! state.set(42, 7)?;
//! assert_eq!(*state.get(42)?, 7);
//!
//! // Freeze it once the phase that writes it is over.
//! state.make_read_only()?;
//! state.close()?;
//! # Ok::<(), mmap_buffer::BufferError>(())
//! ```
//!
//! ## Modules
//!
//! - [`errors`]: Error type for all buffer and region operations
//! - [`utils`]: Page granularity and size arithmetic
//! - [`advise`]: Paging hints
//! - [`region`]: `MappedRegion`, a single mapping window over an optional file
//! - [`config`]: `BufferOptions` for naming and placing temporary files
//! - [`buffer`]: `TypedBuffer<T>` and its strategies
//!
//! ## Feature Flags
//!
//! - `advise` (default): forward paging hints to the OS; without it every
//!   hint is a no-op

#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![deny(missing_docs)]

pub mod errors;
pub mod utils;
pub mod advise;
pub mod region;
pub mod config;
pub mod buffer;

mod sys;

pub use advise::Advice;
pub use buffer::{Strategy, TypedBuffer};
pub use config::BufferOptions;
pub use errors::BufferError;
pub use region::{MappedRegion, Protection, State, WHOLE_FILE};
pub use utils::page_granularity;
