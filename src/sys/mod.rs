//! Host mapping primitives that differ between platform families.
//!
//! File windows go through `memmap2`, which already wraps `mmap(2)` on Unix
//! and `CreateFileMapping`/`MapViewOfFile` on Windows. What is left
//! (granularity queries, paging hints, and shared anonymous memory, which
//! memmap2 only offers copy-on-write) lives behind [`HostMapping`],
//! implemented once per family and selected at compile time as [`Host`].

use std::io;
use std::ptr::NonNull;

use crate::advise::Advice;
use crate::region::Protection;

/// Per-platform mapping primitives.
pub(crate) trait HostMapping {
    /// Hardware page size in bytes.
    fn page_size() -> usize;

    /// Alignment required for mapping offsets.
    fn allocation_granularity() -> usize;

    /// Forward a paging hint for `[addr, addr + len)`.
    ///
    /// # Safety
    ///
    /// The range must lie inside a live mapping owned by the caller, and
    /// `addr` must be page aligned.
    unsafe fn advise(addr: *const u8, len: usize, advice: Advice) -> io::Result<()>;

    /// Map `len` zero-filled, read-write bytes that are shared with the
    /// underlying memory object rather than copy-on-write.
    fn map_shared_anon(len: usize, populate: bool) -> io::Result<NonNull<u8>>;

    /// Change the page protection of `[addr, addr + len)`.
    ///
    /// # Safety
    ///
    /// The range must be a live mapping returned by `map_shared_anon`, and no
    /// mutable borrow of it may be alive when switching to read-only.
    unsafe fn protect(addr: *mut u8, len: usize, protection: Protection) -> io::Result<()>;

    /// Release a range returned by `map_shared_anon`.
    ///
    /// # Safety
    ///
    /// The range must not be used afterwards.
    unsafe fn unmap(addr: *mut u8, len: usize) -> io::Result<()>;
}

cfg_if::cfg_if! {
    if #[cfg(windows)] {
        mod windows;
        pub(crate) use self::windows::Windows as Host;
    } else {
        mod unix;
        pub(crate) use self::unix::Unix as Host;
    }
}

/// Owned shared anonymous mapping, unmapped on drop.
pub(crate) struct SharedAnon {
    ptr: NonNull<u8>,
    len: usize,
    protection: Protection,
}

// SAFETY: the mapping is plain memory owned by this value; access goes
// through `&self`/`&mut self` like a `Vec<u8>`.
unsafe impl Send for SharedAnon {}
// SAFETY: as above.
unsafe impl Sync for SharedAnon {}

impl SharedAnon {
    pub(crate) fn map(len: usize, populate: bool) -> io::Result<Self> {
        let ptr = Host::map_shared_anon(len, populate)?;
        Ok(Self {
            ptr,
            len,
            protection: Protection::ReadWrite,
        })
    }

    pub(crate) fn as_slice(&self) -> &[u8] {
        // SAFETY: ptr..ptr+len is a live readable mapping for the life of self.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    /// Writable bytes, or `None` while the pages are read-only.
    pub(crate) fn as_mut_slice(&mut self) -> Option<&mut [u8]> {
        if self.protection != Protection::ReadWrite {
            return None;
        }
        // SAFETY: the pages are writable and `&mut self` makes the borrow unique.
        Some(unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) })
    }

    /// Change page protection in place. On failure the pages keep their
    /// previous protection and contents.
    pub(crate) fn protect(&mut self, protection: Protection) -> io::Result<()> {
        // SAFETY: live mapping owned by self; `&mut self` rules out borrows.
        unsafe { Host::protect(self.ptr.as_ptr(), self.len, protection)? };
        self.protection = protection;
        Ok(())
    }
}

impl Drop for SharedAnon {
    fn drop(&mut self) {
        // SAFETY: the mapping is never touched again.
        if let Err(err) = unsafe { Host::unmap(self.ptr.as_ptr(), self.len) } {
            log::warn!("failed to unmap {} anonymous bytes: {err}", self.len);
        }
    }
}
