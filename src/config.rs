//! Creation options for typed buffers.
//!
//! Controls the logical name used for temporary backing files, where they are
//! created, and whether mappings are pre-faulted.

use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use bytemuck::Pod;
use tempfile::NamedTempFile;

use crate::buffer::{Strategy, TypedBuffer};
use crate::errors::{BufferError, Result};

/// Logical name used when none is configured.
pub const DEFAULT_NAME: &str = "typed-buffer";

const TEMP_SUFFIX: &str = ".buf";

/// Builder for [`TypedBuffer`] creation.
///
/// # Examples
///
/// ```no_run
/// use mmap_buffer::{BufferOptions, Strategy, TypedBuffer};
///
/// let edges: TypedBuffer<u64> = BufferOptions::new()
///     .name("edge-weights")
///     .temp_dir("/var/tmp")
///     .populate(true)
///     .create(Strategy::FileBackedMap, 1 << 20)?;
/// # Ok::<(), mmap_buffer::BufferError>(())
/// ```
#[derive(Debug, Clone)]
pub struct BufferOptions {
    name: String,
    temp_dir: Option<PathBuf>,
    populate: bool,
}

impl Default for BufferOptions {
    fn default() -> Self {
        Self::new()
    }
}

impl BufferOptions {
    /// Options with the default name, the system temp directory, and lazy
    /// faulting.
    #[must_use]
    pub fn new() -> Self {
        Self {
            name: DEFAULT_NAME.to_owned(),
            temp_dir: None,
            populate: false,
        }
    }

    /// Logical name, used as the prefix of temporary backing files.
    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Directory for temporary backing files (defaults to `std::env::temp_dir()`).
    #[must_use]
    pub fn temp_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.temp_dir = Some(dir.into());
        self
    }

    /// Pre-fault mapped pages at creation instead of on first touch.
    /// Only honored on Linux; elsewhere pages fault lazily.
    #[must_use]
    pub fn populate(mut self, populate: bool) -> Self {
        self.populate = populate;
        self
    }

    /// Configured logical name.
    #[must_use]
    pub fn logical_name(&self) -> &str {
        &self.name
    }

    /// Directory temporary backing files are created in.
    #[must_use]
    pub fn directory(&self) -> PathBuf {
        self.temp_dir.clone().unwrap_or_else(std::env::temp_dir)
    }

    /// Whether mappings are pre-faulted.
    #[must_use]
    pub fn populates(&self) -> bool {
        self.populate
    }

    /// Create a buffer of `entries` elements with the given strategy.
    ///
    /// # Errors
    ///
    /// See [`TypedBuffer::create`].
    pub fn create<T: Pod>(&self, strategy: Strategy, entries: usize) -> Result<TypedBuffer<T>> {
        TypedBuffer::with_options(strategy, entries, self)
    }

    /// Create a uniquely named temporary file of exactly `bytes` bytes.
    ///
    /// The name is `<name>-<unix millis>-<random><suffix>`. The file is
    /// deleted when the returned handle drops, so a failure anywhere after
    /// this call cannot orphan it.
    pub(crate) fn create_temp_file(&self, bytes: u64) -> Result<NamedTempFile> {
        let dir = self.directory();
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_millis());
        let prefix = format!("{}-{}-", self.name, millis);
        let file = tempfile::Builder::new()
            .prefix(&prefix)
            .suffix(TEMP_SUFFIX)
            .tempfile_in(&dir)
            .map_err(|source| BufferError::FileCreate { path: dir, source })?;

        if let Err(source) = file.as_file().set_len(bytes) {
            let path = file.path().to_path_buf();
            discard(file);
            return Err(BufferError::FileCreate { path, source });
        }
        Ok(file)
    }
}

fn discard(file: NamedTempFile) {
    let path = file.path().to_path_buf();
    if let Err(err) = file.close() {
        log::warn!("failed to delete temporary file {}: {err}", path.display());
    }
}

/// Whether `path` looks like a backing file created with `options`.
#[cfg(test)]
pub(crate) fn is_backing_file(options: &BufferOptions, path: &std::path::Path) -> bool {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    path.parent() == Some(options.directory().as_path())
        && name.starts_with(&format!("{}-", options.logical_name()))
        && name.ends_with(TEMP_SUFFIX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn defaults() {
        let opts = BufferOptions::default();
        assert_eq!(opts.logical_name(), DEFAULT_NAME);
        assert_eq!(opts.directory(), std::env::temp_dir());
        assert!(!opts.populates());
    }

    #[test]
    fn temp_file_is_named_sized_and_removed_on_drop() {
        let dir = tempdir().expect("tempdir");
        let opts = BufferOptions::new().name("ranks").temp_dir(dir.path());

        let file = opts.create_temp_file(12_345).expect("create");
        let path = file.path().to_path_buf();
        assert!(is_backing_file(&opts, &path), "unexpected name {}", path.display());
        assert_eq!(file.as_file().metadata().expect("meta").len(), 12_345);

        drop(file);
        assert!(!path.exists());
    }

    #[test]
    fn temp_files_do_not_collide() {
        let dir = tempdir().expect("tempdir");
        let opts = BufferOptions::new().temp_dir(dir.path());
        let a = opts.create_temp_file(8).expect("a");
        let b = opts.create_temp_file(8).expect("b");
        assert_ne!(a.path(), b.path());
    }

    #[test]
    fn missing_directory_is_file_create_error() {
        let dir = tempdir().expect("tempdir");
        let missing = dir.path().join("does-not-exist");
        let opts = BufferOptions::new().temp_dir(&missing);

        let err = opts.create_temp_file(8).unwrap_err();
        match err {
            BufferError::FileCreate { path, .. } => assert_eq!(path, missing),
            other => panic!("expected FileCreate, got {other:?}"),
        }
        assert_eq!(std::fs::read_dir(dir.path()).expect("read_dir").count(), 0);
    }
}
