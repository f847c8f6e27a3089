//! Low-level mapped region: one optional backing file, one mapping window.

use std::{
    fs::{File, OpenOptions},
    io,
    ops::Index,
    path::{Path, PathBuf},
};

use memmap2::{Mmap, MmapMut, MmapOptions};

use crate::advise::Advice;
use crate::errors::{BufferError, Result};
use crate::sys::SharedAnon;
use crate::utils::{clamp_window, ensure_aligned, page_granularity};

/// Window length sentinel that maps the whole backing file.
pub const WHOLE_FILE: usize = 0;

const ERR_NOT_OPEN: &str = "region is not open";
const ERR_CLOSED: &str = "region is closed";
const ERR_NO_WINDOW: &str = "no window is mapped";

/// Page protection applied to a mapped window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protection {
    /// Pages may be read but not written.
    ReadOnly,
    /// Pages may be read and written.
    ReadWrite,
}

/// Lifecycle of a region or buffer. `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Constructed empty; nothing is mapped.
    Unopened,
    /// Backing acquired; element and byte access are legal.
    Open,
    /// Released; a fresh object must be constructed.
    Closed,
}

enum View {
    ReadOnly(Mmap),
    ReadWrite(MmapMut),
    Anonymous(SharedAnon),
}

impl View {
    fn as_slice(&self) -> &[u8] {
        match self {
            View::ReadOnly(m) => &m[..],
            View::ReadWrite(m) => &m[..],
            View::Anonymous(a) => a.as_slice(),
        }
    }

    fn len(&self) -> usize {
        self.as_slice().len()
    }
}

struct Window {
    offset: u64,
    view: View,
}

/// A single mapping window over an optional backing file.
///
/// The region owns at most one open file handle and at most one mapped
/// window. Unmapping and closing the handle happen exactly once, either in
/// [`close`](Self::close) or on drop. Byte views returned by
/// [`data`](Self::data) borrow the region, so they cannot outlive a
/// [`remap`](Self::remap) or `close`.
///
/// Regions are normally created and owned by
/// [`TypedBuffer`](crate::TypedBuffer); the type is public for callers that
/// deliberately map the same backing file a second time.
///
/// # Examples
///
/// ```no_run
/// use mmap_buffer::{Advice, MappedRegion, WHOLE_FILE};
///
/// let mut region = MappedRegion::open("vertices.bin", WHOLE_FILE, Advice::SequentialScan)?;
/// let first = region.at(0)?;
/// region.close();
/// # Ok::<(), mmap_buffer::BufferError>(())
/// ```
pub struct MappedRegion {
    state: State,
    path: Option<PathBuf>,
    backing: Option<File>,
    // Whether the backing permits a ReadWrite window.
    writable: bool,
    total_size: u64,
    window: Option<Window>,
    protection: Protection,
    populate: bool,
}

impl std::fmt::Debug for MappedRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MappedRegion")
            .field("state", &self.state)
            .field("path", &self.path)
            .field("size", &self.total_size)
            .field("offset", &self.offset())
            .field("mapped", &self.mapped_size())
            .field("protection", &self.protection)
            .finish()
    }
}

impl Default for MappedRegion {
    fn default() -> Self {
        Self::new()
    }
}

impl MappedRegion {
    /// Create an empty region in the `Unopened` state.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: State::Unopened,
            path: None,
            backing: None,
            writable: false,
            total_size: 0,
            window: None,
            protection: Protection::ReadOnly,
            populate: false,
        }
    }

    /// Open an existing file read-only and map its first
    /// `initial_window_bytes` bytes ([`WHOLE_FILE`] maps everything), then
    /// apply `hint` to the window.
    ///
    /// # Errors
    ///
    /// Returns `BufferError::Open` if the file cannot be opened,
    /// `BufferError::Size` if its size cannot be read, and `BufferError::Map`
    /// if the initial window cannot be mapped (including empty files).
    /// Nothing stays open on failure.
    pub fn open<P: AsRef<Path>>(path: P, initial_window_bytes: usize, hint: Advice) -> Result<Self> {
        Self::open_with(path.as_ref(), false, initial_window_bytes, hint)
    }

    /// Open an existing file read-write and map a writable window.
    ///
    /// Writes through this region are shared with every other mapping of
    /// the same file.
    ///
    /// # Errors
    ///
    /// Same as [`open`](Self::open).
    pub fn open_rw<P: AsRef<Path>>(
        path: P,
        initial_window_bytes: usize,
        hint: Advice,
    ) -> Result<Self> {
        Self::open_with(path.as_ref(), true, initial_window_bytes, hint)
    }

    fn open_with(path: &Path, writable: bool, window_bytes: usize, hint: Advice) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(writable)
            .open(path)
            .map_err(|source| BufferError::Open {
                path: path.to_path_buf(),
                source,
            })?;
        let mut region = Self::with_backing(file, path.to_path_buf(), writable, false)?;
        // On error `region` drops here and closes the handle.
        region.remap(0, window_bytes)?;
        region.advise(hint)?;
        Ok(region)
    }

    /// Map an already created, already sized backing file read-write in
    /// full. Used by the file-backed buffer strategy.
    pub(crate) fn from_file(file: File, path: PathBuf, populate: bool) -> Result<Self> {
        let mut region = Self::with_backing(file, path, true, populate)?;
        region.remap(0, WHOLE_FILE)?;
        Ok(region)
    }

    fn with_backing(file: File, path: PathBuf, writable: bool, populate: bool) -> Result<Self> {
        let total_size = match file.metadata() {
            Ok(meta) => meta.len(),
            Err(source) => return Err(BufferError::Size { path, source }),
        };
        Ok(Self {
            state: State::Open,
            path: Some(path),
            backing: Some(file),
            writable,
            total_size,
            window: None,
            protection: if writable {
                Protection::ReadWrite
            } else {
                Protection::ReadOnly
            },
            populate,
        })
    }

    /// Map `bytes` bytes of anonymous, shared, zero-filled memory read-write.
    ///
    /// The pages are shared, never copy-on-write, so `DontNeed` only drops
    /// them from the working set and their contents survive. On Windows the
    /// mapping is a section backed by the paging file.
    ///
    /// # Errors
    ///
    /// Returns `BufferError::ZeroSize` if `bytes` is zero and
    /// `BufferError::Map` if the OS refuses the mapping.
    pub fn anonymous(bytes: usize, populate: bool) -> Result<Self> {
        if bytes == 0 {
            return Err(BufferError::ZeroSize);
        }
        let map = SharedAnon::map(bytes, populate).map_err(|source| BufferError::Map {
            offset: 0,
            len: bytes as u64,
            source,
        })?;
        Ok(Self {
            state: State::Open,
            path: None,
            backing: None,
            writable: true,
            total_size: bytes as u64,
            window: Some(Window {
                offset: 0,
                view: View::Anonymous(map),
            }),
            protection: Protection::ReadWrite,
            populate,
        })
    }

    /// Replace the current window with `[offset, offset + window_bytes)`.
    ///
    /// The old window is unmapped first. `window_bytes` is clamped so the
    /// window ends at [`size`](Self::size); zero maps up to the end.
    /// `offset` must be a multiple of [`page_granularity`]; it is never
    /// rounded.
    ///
    /// # Errors
    ///
    /// Returns `BufferError::InvalidState` unless the region is open,
    /// `BufferError::InvalidMode` for anonymous regions,
    /// `BufferError::Misaligned` for an unaligned offset, and
    /// `BufferError::Map` if `offset` is not below the backing size or the
    /// mapping call fails. After a `Map` failure no window is mapped.
    pub fn remap(&mut self, offset: u64, window_bytes: usize) -> Result<()> {
        self.ensure_open()?;
        let Some(file) = self.backing.as_ref() else {
            return Err(BufferError::InvalidMode(
                "anonymous mappings cannot be remapped",
            ));
        };
        ensure_aligned(offset, page_granularity() as u64)?;

        // Unmap before mapping the replacement.
        self.window = None;

        let len = clamp_window(offset, window_bytes, self.total_size)?;
        let view = map_view(file, offset, len, self.protection, self.populate).map_err(
            |source| BufferError::Map {
                offset,
                len: len as u64,
                source,
            },
        )?;
        self.window = Some(Window { offset, view });
        log::debug!(
            "mapped window {offset}..{} of {:?}",
            offset + len as u64,
            self.path
        );
        Ok(())
    }

    /// Change the protection of the current window and of every window
    /// mapped afterwards.
    ///
    /// # Errors
    ///
    /// Returns `BufferError::InvalidState` unless the region is open,
    /// `BufferError::InvalidMode` when asking for `ReadWrite` on a file that
    /// was opened read-only, and `BufferError::Map` if the OS refuses the
    /// change. A refused change unmaps a file window; an anonymous window
    /// keeps its contents and previous protection.
    pub fn protect(&mut self, protection: Protection) -> Result<()> {
        self.ensure_open()?;
        if protection == self.protection {
            return Ok(());
        }
        if protection == Protection::ReadWrite && !self.writable {
            return Err(BufferError::InvalidMode(
                "backing file was opened read-only",
            ));
        }
        if let Some(Window {
            offset,
            view: View::Anonymous(anon),
        }) = self.window.as_mut()
        {
            let (offset, len) = (*offset, anon.as_slice().len() as u64);
            anon.protect(protection)
                .map_err(|source| BufferError::Map { offset, len, source })?;
        } else if let Some(window) = self.window.take() {
            let offset = window.offset;
            let len = window.view.len() as u64;
            let view = match (window.view, protection) {
                (View::ReadWrite(m), Protection::ReadOnly) => m.make_read_only().map(View::ReadOnly),
                (View::ReadOnly(m), Protection::ReadWrite) => m.make_mut().map(View::ReadWrite),
                (view, _) => Ok(view),
            }
            .map_err(|source| BufferError::Map { offset, len, source })?;
            self.window = Some(Window { offset, view });
        }
        self.protection = protection;
        Ok(())
    }

    /// Flush dirty pages of a writable file-backed window to disk.
    /// No-op for anonymous or read-only windows.
    ///
    /// # Errors
    ///
    /// Returns `BufferError::InvalidState` unless the region is open and
    /// `BufferError::FlushFailed` if the flush fails.
    pub fn flush(&self) -> Result<()> {
        self.ensure_open()?;
        if self.backing.is_none() {
            return Ok(());
        }
        match self.window.as_ref().map(|w| &w.view) {
            Some(View::ReadWrite(m)) => m
                .flush()
                .map_err(|e| BufferError::FlushFailed(e.to_string())),
            _ => Ok(()),
        }
    }

    /// Bytes of the current window, or `None` when nothing is mapped.
    #[must_use]
    pub fn data(&self) -> Option<&[u8]> {
        self.window.as_ref().map(|w| w.view.as_slice())
    }

    /// Mutable bytes of the current window.
    ///
    /// # Errors
    ///
    /// Returns `BufferError::InvalidState` if the region is not open or has
    /// no window, and `BufferError::InvalidMode` if the window is read-only.
    pub fn data_mut(&mut self) -> Result<&mut [u8]> {
        self.ensure_open()?;
        match self.window.as_mut().map(|w| &mut w.view) {
            Some(View::ReadWrite(m)) => Ok(&mut m[..]),
            Some(View::Anonymous(a)) => a
                .as_mut_slice()
                .ok_or(BufferError::InvalidMode("window is mapped read-only")),
            Some(View::ReadOnly(_)) => Err(BufferError::InvalidMode("window is mapped read-only")),
            None => Err(BufferError::InvalidState(ERR_NO_WINDOW)),
        }
    }

    /// Base address of the current window; null when nothing is mapped.
    #[must_use]
    pub fn as_ptr(&self) -> *const u8 {
        self.data().map_or(std::ptr::null(), <[u8]>::as_ptr)
    }

    /// Bounds-checked byte read relative to the window start.
    ///
    /// # Errors
    ///
    /// Returns `BufferError::InvalidState` if the region is not open or has
    /// no window, and `BufferError::OutOfBounds` past the window end.
    pub fn at(&self, offset: usize) -> Result<u8> {
        self.ensure_open()?;
        let bytes = self.data().ok_or(BufferError::InvalidState(ERR_NO_WINDOW))?;
        bytes.get(offset).copied().ok_or(BufferError::OutOfBounds {
            offset: offset as u64,
            len: bytes.len() as u64,
        })
    }

    /// Byte read relative to the window start.
    ///
    /// # Panics
    ///
    /// Panics if nothing is mapped or `offset` is past the window end.
    #[must_use]
    pub fn read_byte(&self, offset: usize) -> u8 {
        self[offset]
    }

    /// Unchecked byte read relative to the window start.
    ///
    /// # Safety
    ///
    /// A window must be mapped and `offset < self.mapped_size()`.
    #[must_use]
    pub unsafe fn get_unchecked(&self, offset: usize) -> u8 {
        debug_assert!(offset < self.mapped_size());
        // SAFETY: upheld by the caller.
        unsafe { *self.as_ptr().add(offset) }
    }

    /// Logical size of the backing object in bytes.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.total_size
    }

    /// Bytes currently mapped.
    #[must_use]
    pub fn mapped_size(&self) -> usize {
        self.window.as_ref().map_or(0, |w| w.view.len())
    }

    /// Offset of the current window within the backing object.
    #[must_use]
    pub fn offset(&self) -> u64 {
        self.window.as_ref().map_or(0, |w| w.offset)
    }

    /// Lifecycle state.
    #[must_use]
    pub fn state(&self) -> State {
        self.state
    }

    /// Protection applied to mapped windows.
    #[must_use]
    pub fn protection(&self) -> Protection {
        self.protection
    }

    /// Whether the region maps anonymous memory rather than a file.
    #[must_use]
    pub fn is_anonymous(&self) -> bool {
        self.state == State::Open && self.backing.is_none()
    }

    /// Path of the backing file, if any.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Unmap the window, then close the backing handle. Idempotent; also
    /// run on drop.
    pub fn close(&mut self) {
        if self.state == State::Closed {
            return;
        }
        self.window = None;
        self.backing = None;
        if let Some(path) = self.path.take() {
            log::debug!("closed region over {}", path.display());
        }
        self.total_size = 0;
        self.writable = false;
        self.state = State::Closed;
    }

    pub(crate) fn ensure_open(&self) -> Result<()> {
        match self.state {
            State::Open => Ok(()),
            State::Unopened => Err(BufferError::InvalidState(ERR_NOT_OPEN)),
            State::Closed => Err(BufferError::InvalidState(ERR_CLOSED)),
        }
    }
}

impl Index<usize> for MappedRegion {
    type Output = u8;

    fn index(&self, offset: usize) -> &u8 {
        match self.data() {
            Some(bytes) => &bytes[offset],
            None => panic!("byte {offset} read from a region with no mapped window"),
        }
    }
}

impl Drop for MappedRegion {
    fn drop(&mut self) {
        self.close();
    }
}

fn map_view(
    file: &File,
    offset: u64,
    len: usize,
    protection: Protection,
    populate: bool,
) -> io::Result<View> {
    let mut opts = MmapOptions::new();
    opts.offset(offset).len(len);
    if populate {
        opts.populate();
    }
    // SAFETY: the region owns the handle for as long as the view lives, and
    // offset/len were validated against the file size. Concurrent external
    // truncation of the backing file is outside this layer's contract.
    unsafe {
        match protection {
            Protection::ReadOnly => opts.map(file).map(View::ReadOnly),
            Protection::ReadWrite => opts.map_mut(file).map(View::ReadWrite),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn tmp_path(name: &str) -> PathBuf {
        let mut p = std::env::temp_dir();
        p.push(format!("mmap_buffer_region_test_{}_{}", name, std::process::id()));
        p
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn unopened_region_rejects_access() {
        let mut region = MappedRegion::new();
        assert_eq!(region.state(), State::Unopened);
        assert!(region.data().is_none());
        assert!(region.as_ptr().is_null());
        assert!(matches!(region.at(0), Err(BufferError::InvalidState(ERR_NOT_OPEN))));
        assert!(matches!(region.remap(0, 0), Err(BufferError::InvalidState(_))));
        assert!(matches!(region.data_mut(), Err(BufferError::InvalidState(_))));
    }

    #[test]
    fn open_missing_file_fails_with_open_error() {
        let path = tmp_path("missing");
        let _ = fs::remove_file(&path);
        let err = MappedRegion::open(&path, WHOLE_FILE, Advice::Normal).unwrap_err();
        assert!(matches!(err, BufferError::Open { .. }));
    }

    #[test]
    fn open_empty_file_fails_with_map_error() {
        let path = tmp_path("empty");
        fs::write(&path, b"").expect("write");
        let err = MappedRegion::open(&path, WHOLE_FILE, Advice::Normal).unwrap_err();
        assert!(matches!(err, BufferError::Map { offset: 0, .. }));
        fs::remove_file(&path).expect("cleanup");
    }

    #[test]
    fn open_maps_whole_file_read_only() {
        let path = tmp_path("whole");
        let bytes = pattern(5000);
        fs::write(&path, &bytes).expect("write");

        let mut region = MappedRegion::open(&path, WHOLE_FILE, Advice::SequentialScan).expect("open");
        assert_eq!(region.state(), State::Open);
        assert_eq!(region.size(), 5000);
        assert_eq!(region.mapped_size(), 5000);
        assert_eq!(region.protection(), Protection::ReadOnly);
        assert_eq!(region.data().expect("data"), &bytes[..]);
        assert_eq!(region.read_byte(4999), bytes[4999]);
        assert_eq!(region[10], bytes[10]);
        // SAFETY: 42 < mapped_size.
        assert_eq!(unsafe { region.get_unchecked(42) }, bytes[42]);
        assert!(matches!(
            region.at(5000),
            Err(BufferError::OutOfBounds { offset: 5000, len: 5000 })
        ));
        assert!(matches!(region.data_mut(), Err(BufferError::InvalidMode(_))));
        assert!(matches!(
            region.protect(Protection::ReadWrite),
            Err(BufferError::InvalidMode(_))
        ));

        region.close();
        fs::remove_file(&path).expect("cleanup");
    }

    #[test]
    fn remap_moves_and_clamps_window() {
        let granularity = page_granularity();
        let path = tmp_path("remap");
        let total = granularity * 2 + 100;
        let bytes = pattern(total);
        fs::write(&path, &bytes).expect("write");

        let mut region = MappedRegion::open(&path, granularity, Advice::Normal).expect("open");
        assert_eq!(region.mapped_size(), granularity);

        region.remap(granularity as u64, 0).expect("remap to end");
        assert_eq!(region.offset(), granularity as u64);
        assert_eq!(region.mapped_size(), granularity + 100);
        assert_eq!(region.at(0).expect("at"), bytes[granularity]);

        region.remap(2 * granularity as u64, 1 << 30).expect("clamped");
        assert_eq!(region.mapped_size(), 100);
        assert!(region.offset() + region.mapped_size() as u64 <= region.size());
        assert_eq!(region.offset() % granularity as u64, 0);

        region.close();
        fs::remove_file(&path).expect("cleanup");
    }

    #[test]
    fn remap_rejects_misaligned_and_out_of_range_offsets() {
        let granularity = page_granularity();
        let path = tmp_path("remap_errors");
        fs::write(&path, pattern(granularity * 2)).expect("write");

        let mut region = MappedRegion::open(&path, WHOLE_FILE, Advice::Normal).expect("open");
        let err = region.remap(1, 16).unwrap_err();
        assert!(matches!(err, BufferError::Misaligned { offset: 1, .. }));
        // A rejected alignment leaves the old window in place.
        assert_eq!(region.mapped_size(), granularity * 2);

        let err = region.remap(4 * granularity as u64, 16).unwrap_err();
        assert!(matches!(err, BufferError::Map { .. }));
        assert_eq!(region.mapped_size(), 0);
        assert!(region.data().is_none());

        region.remap(0, 16).expect("recover");
        assert_eq!(region.mapped_size(), 16);

        region.close();
        fs::remove_file(&path).expect("cleanup");
    }

    #[test]
    fn anonymous_region_is_zeroed_and_fixed() {
        let mut region = MappedRegion::anonymous(1024, false).expect("anon");
        assert!(region.is_anonymous());
        assert_eq!(region.size(), 1024);
        assert!(region.data().expect("data").iter().all(|&b| b == 0));

        region.data_mut().expect("data_mut")[3] = 9;
        assert_eq!(region.at(3).expect("at"), 9);
        assert!(matches!(region.remap(0, 0), Err(BufferError::InvalidMode(_))));
        assert!(matches!(MappedRegion::anonymous(0, false), Err(BufferError::ZeroSize)));
    }

    #[test]
    fn protection_round_trip_keeps_contents() {
        let mut region = MappedRegion::anonymous(4096, true).expect("anon");
        region.data_mut().expect("data_mut")[0] = 42;

        region.protect(Protection::ReadOnly).expect("read only");
        assert_eq!(region.protection(), Protection::ReadOnly);
        assert!(matches!(region.data_mut(), Err(BufferError::InvalidMode(_))));
        assert_eq!(region.at(0).expect("at"), 42);

        region.protect(Protection::ReadWrite).expect("read write");
        region.data_mut().expect("data_mut")[1] = 43;
        assert_eq!(region.data().expect("data")[..2], [42, 43]);
    }

    #[test]
    fn close_is_idempotent() {
        let mut region = MappedRegion::anonymous(64, false).expect("anon");
        region.close();
        assert_eq!(region.state(), State::Closed);
        assert_eq!(region.mapped_size(), 0);
        assert_eq!(region.size(), 0);
        region.close();
        assert_eq!(region.state(), State::Closed);
        assert!(matches!(region.at(0), Err(BufferError::InvalidState(ERR_CLOSED))));
        assert!(matches!(region.protect(Protection::ReadOnly), Err(BufferError::InvalidState(_))));
    }

    #[test]
    fn flush_requires_an_open_region() {
        let unopened = MappedRegion::new();
        assert!(matches!(unopened.flush(), Err(BufferError::InvalidState(ERR_NOT_OPEN))));

        let mut region = MappedRegion::anonymous(4096, false).expect("anon");
        region.flush().expect("anonymous flush is a no-op");
        region.close();
        assert!(matches!(region.flush(), Err(BufferError::InvalidState(ERR_CLOSED))));
    }
}
