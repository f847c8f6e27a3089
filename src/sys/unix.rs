//! Single-syscall mapping family: `mmap`/`madvise` with a file descriptor.

use std::io;
use std::ptr::{self, NonNull};

use super::HostMapping;
use crate::advise::Advice;
use crate::region::Protection;

pub(crate) struct Unix;

impl HostMapping for Unix {
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    fn page_size() -> usize {
        // SAFETY: sysconf with _SC_PAGESIZE is safe to call.
        let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        // -1 only on an unsupported name; fall back to the common 4 KiB.
        if page_size <= 0 {
            4096
        } else {
            page_size as usize
        }
    }

    fn allocation_granularity() -> usize {
        Self::page_size()
    }

    #[cfg(feature = "advise")]
    unsafe fn advise(addr: *const u8, len: usize, advice: Advice) -> io::Result<()> {
        use libc::{MADV_DONTNEED, MADV_NORMAL, MADV_RANDOM, MADV_SEQUENTIAL, MADV_WILLNEED};

        let flag = match advice {
            Advice::Normal => MADV_NORMAL,
            Advice::SequentialScan => MADV_SEQUENTIAL,
            Advice::RandomAccess => MADV_RANDOM,
            Advice::WillNeed => MADV_WILLNEED,
            Advice::DontNeed => MADV_DONTNEED,
        };

        // SAFETY: the caller guarantees the range is a live, page-aligned mapping.
        let result = unsafe { libc::madvise(addr as *mut libc::c_void, len, flag) };
        if result != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    #[cfg(not(feature = "advise"))]
    unsafe fn advise(_addr: *const u8, _len: usize, _advice: Advice) -> io::Result<()> {
        Ok(())
    }

    fn map_shared_anon(len: usize, populate: bool) -> io::Result<NonNull<u8>> {
        let flags = libc::MAP_SHARED | libc::MAP_ANON | populate_flag(populate);
        // SAFETY: a fresh anonymous mapping at a kernel-chosen address
        // aliases nothing.
        let addr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                flags,
                -1,
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        NonNull::new(addr.cast::<u8>())
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "mmap returned a null mapping"))
    }

    unsafe fn protect(addr: *mut u8, len: usize, protection: Protection) -> io::Result<()> {
        let prot = match protection {
            Protection::ReadOnly => libc::PROT_READ,
            Protection::ReadWrite => libc::PROT_READ | libc::PROT_WRITE,
        };
        // SAFETY: the caller guarantees the range is a live mapping.
        if unsafe { libc::mprotect(addr.cast::<libc::c_void>(), len, prot) } != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    unsafe fn unmap(addr: *mut u8, len: usize) -> io::Result<()> {
        // SAFETY: the caller guarantees the range is ours and unused.
        if unsafe { libc::munmap(addr.cast::<libc::c_void>(), len) } != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn populate_flag(populate: bool) -> libc::c_int {
    if populate {
        libc::MAP_POPULATE
    } else {
        0
    }
}

// Pages fault lazily where MAP_POPULATE does not exist.
#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn populate_flag(_populate: bool) -> libc::c_int {
    0
}
