//! Fixed-length typed arrays over heap, anonymous, or file-backed storage.

use std::fs::File;
use std::mem::{align_of, size_of};
use std::ops::{Index, IndexMut, Range};
use std::path::{Path, PathBuf};

use bytemuck::Pod;
use tempfile::{NamedTempFile, TempPath};

use crate::advise::Advice;
use crate::config::BufferOptions;
use crate::errors::{BufferError, Result};
use crate::region::{MappedRegion, Protection, State};
use crate::utils::byte_len;

const ERR_CLOSED: &str = "buffer is closed";
const ERR_NO_WINDOW: &str = "no window is mapped";

/// Backing strategy of a [`TypedBuffer`], fixed for its lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// Zero-initialized heap allocation.
    Heap,
    /// Anonymous, shared, zero-filled OS mapping.
    AnonymousMap,
    /// Shared mapping over a temporary file deleted on close.
    FileBackedMap,
}

enum Storage<T> {
    Heap(Vec<T>),
    Mapped {
        region: MappedRegion,
        // Present for FileBackedMap; deleting it is the last step of close.
        temp: Option<TempPath>,
    },
    Closed,
}

/// A fixed-length array of `T` backed by one of three [`Strategy`]s.
///
/// `T: Pod` guarantees every bit pattern (including the all-zero pages a
/// fresh mapping starts with) is a valid element.
///
/// Element views borrow the buffer, so none can survive a
/// [`remap`](Self::remap) or [`close`](Self::close). The buffer itself does
/// no locking; callers synchronize shared access.
///
/// # Examples
///
/// ```no_run
/// use mmap_buffer::TypedBuffer;
///
/// let mut ranks = TypedBuffer::<f64>::create_file_backed_mapping(1_000_000)?;
/// ranks.sequential_access()?;
/// for i in 0..ranks.len() {
///     ranks.set(i, 1.0 / 1_000_000.0)?;
/// }
/// ranks.make_read_only()?;
/// assert!(ranks.set(0, 0.0).is_err());
/// ranks.close()?;
/// # Ok::<(), mmap_buffer::BufferError>(())
/// ```
pub struct TypedBuffer<T: Pod> {
    strategy: Strategy,
    entry_count: usize,
    protection: Protection,
    backing_path: Option<PathBuf>,
    storage: Storage<T>,
}

impl<T: Pod> std::fmt::Debug for TypedBuffer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TypedBuffer")
            .field("strategy", &self.strategy)
            .field("len", &self.entry_count)
            .field("elem_size", &size_of::<T>())
            .field("state", &self.state())
            .field("window", &self.window())
            .field("protection", &self.protection)
            .field("backing_path", &self.backing_path)
            .finish()
    }
}

impl<T: Pod> TypedBuffer<T> {
    /// Allocate `entry_count` zeroed elements on the heap.
    ///
    /// # Errors
    ///
    /// Returns `BufferError::OutOfMemory` if the allocation fails and
    /// `BufferError::CapacityOverflow` if the byte size overflows.
    pub fn create_in_memory(entry_count: usize) -> Result<Self> {
        Self::create(Strategy::Heap, entry_count)
    }

    /// Map `entry_count` zeroed elements of anonymous, shared memory.
    ///
    /// # Errors
    ///
    /// Returns `BufferError::ZeroSize` for an empty buffer and
    /// `BufferError::Map` if the mapping cannot be created.
    pub fn create_anonymous_mapping(entry_count: usize) -> Result<Self> {
        Self::create(Strategy::AnonymousMap, entry_count)
    }

    /// Create a pre-sized temporary file and map it shared, read-write.
    ///
    /// # Errors
    ///
    /// Returns `BufferError::ZeroSize` for an empty buffer,
    /// `BufferError::FileCreate` if the file cannot be created or sized, and
    /// `BufferError::Map` if mapping fails. The temporary file is deleted
    /// before any error is returned.
    pub fn create_file_backed_mapping(entry_count: usize) -> Result<Self> {
        Self::create(Strategy::FileBackedMap, entry_count)
    }

    /// Create a buffer with the given strategy and default [`BufferOptions`].
    ///
    /// # Errors
    ///
    /// Returns the errors listed on the strategy-specific constructors.
    pub fn create(strategy: Strategy, entry_count: usize) -> Result<Self> {
        Self::with_options(strategy, entry_count, &BufferOptions::default())
    }

    pub(crate) fn with_options(
        strategy: Strategy,
        entry_count: usize,
        options: &BufferOptions,
    ) -> Result<Self> {
        let bytes = byte_len(entry_count, size_of::<T>())?;
        let populate = options.populates();

        let storage = match strategy {
            Strategy::Heap => Storage::Heap(zeroed_vec(entry_count)?),
            Strategy::AnonymousMap => {
                ensure_mappable(bytes)?;
                let (region, temp) =
                    acquire_and_map(|| Ok(None), |_| MappedRegion::anonymous(bytes, populate))?;
                Storage::Mapped { region, temp }
            }
            Strategy::FileBackedMap => {
                ensure_mappable(bytes)?;
                let (region, temp) = acquire_and_map(
                    || options.create_temp_file(bytes as u64).map(Some),
                    |backing| match backing {
                        Some((file, path)) => MappedRegion::from_file(file, path, populate),
                        None => Err(BufferError::InvalidState("temporary file was not created")),
                    },
                )?;
                Storage::Mapped { region, temp }
            }
        };

        let backing_path = match &storage {
            Storage::Mapped {
                temp: Some(temp), ..
            } => Some(temp.to_path_buf()),
            _ => None,
        };
        log::debug!(
            "created {strategy:?} buffer: {entry_count} entries x {} bytes{}",
            size_of::<T>(),
            backing_path
                .as_deref()
                .map(|p| format!(" at {}", p.display()))
                .unwrap_or_default()
        );

        Ok(Self {
            strategy,
            entry_count,
            protection: Protection::ReadWrite,
            backing_path,
            storage,
        })
    }

    /// Number of elements.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entry_count
    }

    /// Whether the buffer holds no elements.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entry_count == 0
    }

    /// Total size of the elements in bytes.
    #[must_use]
    pub fn byte_len(&self) -> usize {
        self.entry_count * size_of::<T>()
    }

    /// Backing strategy.
    #[must_use]
    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    /// Current protection.
    #[must_use]
    pub fn protection(&self) -> Protection {
        self.protection
    }

    /// `Open` until [`close`](Self::close) has run, `Closed` afterwards.
    #[must_use]
    pub fn state(&self) -> State {
        match self.storage {
            Storage::Closed => State::Closed,
            _ => State::Open,
        }
    }

    /// Temporary file backing a `FileBackedMap` buffer while it is open.
    ///
    /// Mapping this path with [`MappedRegion::open`] gives a second view
    /// that observes this buffer's writes.
    #[must_use]
    pub fn backing_path(&self) -> Option<&Path> {
        self.backing_path.as_deref()
    }

    /// Range of element indices currently addressable.
    ///
    /// Always `0..len()` unless a file-backed buffer was
    /// [`remap`](Self::remap)ped to a partial window; empty once closed.
    #[must_use]
    pub fn window(&self) -> Range<usize> {
        match &self.storage {
            Storage::Heap(v) => 0..v.len(),
            Storage::Mapped { region, .. } => {
                let elem = size_of::<T>();
                // Mapped offsets always fit usize: the backing was sized from a usize.
                let start = (region.offset() as usize) / elem;
                let end = start + region.mapped_size() / elem;
                start..end.min(self.entry_count)
            }
            Storage::Closed => 0..0,
        }
    }

    /// Bounds-checked shared access to element `index`.
    ///
    /// # Errors
    ///
    /// `InvalidState` once closed, `IndexOutOfRange` for
    /// `index >= len()`, `OutsideWindow` if the element is not mapped.
    pub fn get(&self, index: usize) -> Result<&T> {
        let slot = self.slot(index)?;
        Ok(&self.as_slice()?[slot])
    }

    /// Bounds-checked mutable access to element `index`.
    ///
    /// # Errors
    ///
    /// As [`get`](Self::get), plus `ProtectionViolation` while read-only.
    pub fn get_mut(&mut self, index: usize) -> Result<&mut T> {
        let slot = self.slot(index)?;
        if self.protection == Protection::ReadOnly {
            return Err(BufferError::ProtectionViolation { index });
        }
        Ok(&mut self.as_mut_slice()?[slot])
    }

    /// Store `value` at `index`.
    ///
    /// # Errors
    ///
    /// As [`get_mut`](Self::get_mut).
    pub fn set(&mut self, index: usize, value: T) -> Result<()> {
        *self.get_mut(index)? = value;
        Ok(())
    }

    /// Unchecked shared access for verified hot loops.
    ///
    /// # Safety
    ///
    /// The buffer must be open and `index` inside [`window`](Self::window).
    #[must_use]
    pub unsafe fn get_unchecked(&self, index: usize) -> &T {
        debug_assert!(self.window().contains(&index));
        let start = self.window().start;
        let base = match &self.storage {
            Storage::Heap(v) => v.as_ptr(),
            Storage::Mapped { region, .. } => region.as_ptr().cast::<T>(),
            Storage::Closed => std::ptr::null(),
        };
        // SAFETY: upheld by the caller; the window base is page aligned.
        unsafe { &*base.add(index - start) }
    }

    /// Unchecked mutable access for verified hot loops.
    ///
    /// # Safety
    ///
    /// As [`get_unchecked`](Self::get_unchecked), and the buffer must be
    /// read-write.
    #[must_use]
    pub unsafe fn get_unchecked_mut(&mut self, index: usize) -> &mut T {
        debug_assert!(self.window().contains(&index));
        debug_assert_eq!(self.protection, Protection::ReadWrite);
        let start = self.window().start;
        let base = match &mut self.storage {
            Storage::Heap(v) => v.as_mut_ptr(),
            Storage::Mapped { region, .. } => region
                .data_mut()
                .map_or(std::ptr::null_mut(), |bytes| bytes.as_mut_ptr().cast::<T>()),
            Storage::Closed => std::ptr::null_mut(),
        };
        // SAFETY: upheld by the caller.
        unsafe { &mut *base.add(index - start) }
    }

    /// Elements of the current window.
    ///
    /// # Errors
    ///
    /// Returns `BufferError::InvalidState` once closed or if a failed remap
    /// left no window.
    pub fn as_slice(&self) -> Result<&[T]> {
        match &self.storage {
            Storage::Heap(v) => Ok(v.as_slice()),
            Storage::Mapped { region, .. } => {
                let bytes = region.data().ok_or(BufferError::InvalidState(ERR_NO_WINDOW))?;
                cast_window(bytes, region.offset())
            }
            Storage::Closed => Err(BufferError::InvalidState(ERR_CLOSED)),
        }
    }

    /// Mutable elements of the current window.
    ///
    /// # Errors
    ///
    /// As [`as_slice`](Self::as_slice), plus `ProtectionViolation` while
    /// read-only.
    pub fn as_mut_slice(&mut self) -> Result<&mut [T]> {
        if self.protection == Protection::ReadOnly && self.state() == State::Open {
            return Err(BufferError::ProtectionViolation {
                index: self.window().start,
            });
        }
        match &mut self.storage {
            Storage::Heap(v) => Ok(v.as_mut_slice()),
            Storage::Mapped { region, .. } => {
                let offset = region.offset();
                cast_window_mut(region.data_mut()?, offset)
            }
            Storage::Closed => Err(BufferError::InvalidState(ERR_CLOSED)),
        }
    }

    /// Move the window of a file-backed buffer to
    /// `first_entry..first_entry + entries` (`entries == 0` maps to the end).
    ///
    /// The byte offset `first_entry * size_of::<T>()` must be a multiple of
    /// [`page_granularity`](crate::utils::page_granularity). Contents outside
    /// the window stay in the backing file and reappear when mapped again.
    ///
    /// # Errors
    ///
    /// `InvalidMode` for heap and anonymous buffers, `IndexOutOfRange` if
    /// `first_entry >= len()`, `Misaligned`, and `Map` (after which no
    /// window is mapped).
    pub fn remap(&mut self, first_entry: usize, entries: usize) -> Result<()> {
        self.ensure_open()?;
        let elem = size_of::<T>();
        match &mut self.storage {
            Storage::Mapped {
                region,
                temp: Some(_),
            } => {
                if first_entry >= self.entry_count {
                    return Err(BufferError::IndexOutOfRange {
                        index: first_entry,
                        len: self.entry_count,
                    });
                }
                let offset = byte_len(first_entry, elem)? as u64;
                let window_bytes = byte_len(entries, elem)?;
                region.remap(offset, window_bytes)
            }
            _ => Err(BufferError::InvalidMode(
                "only file-backed buffers can move their window",
            )),
        }
    }

    /// Hint that elements will be scanned in ascending order.
    ///
    /// # Errors
    ///
    /// Returns `BufferError::InvalidState` once closed; OS refusals are ignored.
    pub fn sequential_access(&self) -> Result<()> {
        self.advise(Advice::SequentialScan)
    }

    /// Hint that elements will be accessed in no particular order.
    ///
    /// # Errors
    ///
    /// Returns `BufferError::InvalidState` once closed; OS refusals are ignored.
    pub fn random_access(&self) -> Result<()> {
        self.advise(Advice::RandomAccess)
    }

    /// Hint that the whole window will be needed soon (prefetch).
    ///
    /// # Errors
    ///
    /// Returns `BufferError::InvalidState` once closed; OS refusals are ignored.
    pub fn will_need(&self) -> Result<()> {
        self.advise(Advice::WillNeed)
    }

    /// Hint that the window will not be needed soon.
    ///
    /// # Errors
    ///
    /// Returns `BufferError::InvalidState` once closed; OS refusals are ignored.
    pub fn dont_need(&self) -> Result<()> {
        self.advise(Advice::DontNeed)
    }

    /// Reset the access pattern hint to the OS default.
    ///
    /// # Errors
    ///
    /// Returns `BufferError::InvalidState` once closed; OS refusals are ignored.
    pub fn normal_access(&self) -> Result<()> {
        self.advise(Advice::Normal)
    }

    fn advise(&self, hint: Advice) -> Result<()> {
        self.ensure_open()?;
        // Heap pages are left alone: DontNeed would zero private memory.
        match &self.storage {
            Storage::Mapped { region, .. } => region.advise(hint),
            _ => Ok(()),
        }
    }

    /// Protect the buffer against writes.
    ///
    /// # Errors
    ///
    /// `InvalidState` once closed; `Map` if the OS refuses the change.
    pub fn make_read_only(&mut self) -> Result<()> {
        self.set_protection(Protection::ReadOnly)
    }

    /// Make the buffer writable again.
    ///
    /// # Errors
    ///
    /// `InvalidState` once closed; `Map` if the OS refuses the change.
    pub fn make_read_write(&mut self) -> Result<()> {
        self.set_protection(Protection::ReadWrite)
    }

    fn set_protection(&mut self, protection: Protection) -> Result<()> {
        self.ensure_open()?;
        if let Storage::Mapped { region, .. } = &mut self.storage {
            region.protect(protection)?;
        }
        self.protection = protection;
        Ok(())
    }

    /// Write dirty pages of a file-backed buffer to its temporary file.
    ///
    /// # Errors
    ///
    /// `InvalidState` once closed; `FlushFailed` if the flush fails.
    pub fn flush(&self) -> Result<()> {
        self.ensure_open()?;
        match &self.storage {
            Storage::Mapped { region, .. } => region.flush(),
            _ => Ok(()),
        }
    }

    /// Release the storage: unmap and delete the temporary file
    /// (file-backed), unmap (anonymous), or free the heap array.
    /// Idempotent; also run on drop.
    ///
    /// # Errors
    ///
    /// Returns `BufferError::Io` if the temporary file cannot be deleted.
    /// The buffer is closed regardless.
    pub fn close(&mut self) -> Result<()> {
        let storage = std::mem::replace(&mut self.storage, Storage::Closed);
        self.backing_path = None;
        match storage {
            Storage::Closed => return Ok(()),
            Storage::Heap(v) => drop(v),
            Storage::Mapped { mut region, temp } => {
                // Unmap and close the handle before deleting the file.
                region.close();
                if let Some(temp) = temp {
                    temp.close()?;
                }
            }
        }
        log::debug!("closed {:?} buffer of {} entries", self.strategy, self.entry_count);
        Ok(())
    }

    fn ensure_open(&self) -> Result<()> {
        match self.storage {
            Storage::Closed => Err(BufferError::InvalidState(ERR_CLOSED)),
            _ => Ok(()),
        }
    }

    fn slot(&self, index: usize) -> Result<usize> {
        self.ensure_open()?;
        if index >= self.entry_count {
            return Err(BufferError::IndexOutOfRange {
                index,
                len: self.entry_count,
            });
        }
        let window = self.window();
        if !window.contains(&index) {
            return Err(BufferError::OutsideWindow {
                index,
                start: window.start,
                end: window.end,
            });
        }
        Ok(index - window.start)
    }
}

impl<T: Pod> Index<usize> for TypedBuffer<T> {
    type Output = T;

    fn index(&self, index: usize) -> &T {
        match self.get(index) {
            Ok(value) => value,
            Err(err) => panic!("{err}"),
        }
    }
}

impl<T: Pod> IndexMut<usize> for TypedBuffer<T> {
    fn index_mut(&mut self, index: usize) -> &mut T {
        match self.get_mut(index) {
            Ok(value) => value,
            Err(err) => panic!("{err}"),
        }
    }
}

impl<T: Pod> Drop for TypedBuffer<T> {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            log::warn!("failed to release {:?} buffer: {err}", self.strategy);
        }
    }
}

/// Acquire an optional backing file, then map it. If mapping fails the
/// backing file is deleted before the error is returned.
fn acquire_and_map<A, M>(acquire: A, map: M) -> Result<(MappedRegion, Option<TempPath>)>
where
    A: FnOnce() -> Result<Option<NamedTempFile>>,
    M: FnOnce(Option<(File, PathBuf)>) -> Result<MappedRegion>,
{
    let (backing, temp) = match acquire()? {
        Some(named) => {
            let (file, temp) = named.into_parts();
            (Some((file, temp.to_path_buf())), Some(temp))
        }
        None => (None, None),
    };
    // `map` consumes the handle, so it is closed before any deletion below.
    match map(backing) {
        Ok(region) => Ok((region, temp)),
        Err(err) => {
            if let Some(temp) = temp {
                let path = temp.to_path_buf();
                if let Err(cleanup) = temp.close() {
                    log::warn!("failed to delete {} after {err}: {cleanup}", path.display());
                }
            }
            Err(err)
        }
    }
}

fn ensure_mappable(bytes: usize) -> Result<()> {
    if bytes == 0 {
        return Err(BufferError::ZeroSize);
    }
    Ok(())
}

fn zeroed_vec<T: Pod>(entries: usize) -> Result<Vec<T>> {
    let mut v = Vec::new();
    v.try_reserve_exact(entries)
        .map_err(|_| BufferError::OutOfMemory {
            bytes: entries.saturating_mul(size_of::<T>()),
        })?;
    v.resize(entries, T::zeroed());
    Ok(v)
}

fn whole_elements<T>(len: usize) -> usize {
    len - len % size_of::<T>()
}

// `offset` is the window's byte offset in the backing object, reported when
// the mapping base does not satisfy `align_of::<T>()`.
fn cast_window<T: Pod>(bytes: &[u8], offset: u64) -> Result<&[T]> {
    let bytes = &bytes[..whole_elements::<T>(bytes.len())];
    bytemuck::try_cast_slice(bytes).map_err(|_| BufferError::Misaligned {
        required: align_of::<T>() as u64,
        offset,
    })
}

fn cast_window_mut<T: Pod>(bytes: &mut [u8], offset: u64) -> Result<&mut [T]> {
    let len = whole_elements::<T>(bytes.len());
    bytemuck::try_cast_slice_mut(&mut bytes[..len]).map_err(|_| BufferError::Misaligned {
        required: align_of::<T>() as u64,
        offset,
    })
}
