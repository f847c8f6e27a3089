//! Handle-and-view mapping family: file handle, mapping object, view.

use std::io;
use std::mem::MaybeUninit;
use std::ptr::{self, NonNull};

use core::ffi::c_void;

use super::HostMapping;
use crate::advise::Advice;
use crate::region::Protection;

pub(crate) struct Windows;

#[allow(non_snake_case)]
#[repr(C)]
struct SYSTEM_INFO {
    wProcessorArchitecture: u16,
    wReserved: u16,
    dwPageSize: u32,
    lpMinimumApplicationAddress: *mut core::ffi::c_void,
    lpMaximumApplicationAddress: *mut core::ffi::c_void,
    dwActiveProcessorMask: usize,
    dwNumberOfProcessors: u32,
    dwProcessorType: u32,
    dwAllocationGranularity: u32,
    wProcessorLevel: u16,
    wProcessorRevision: u16,
}

const PAGE_READONLY: u32 = 0x02;
const PAGE_READWRITE: u32 = 0x04;
const FILE_MAP_WRITE: u32 = 0x0002;

extern "system" {
    fn GetSystemInfo(lpSystemInfo: *mut SYSTEM_INFO);

    fn CreateFileMappingW(
        hFile: *mut c_void,
        lpFileMappingAttributes: *mut c_void,
        flProtect: u32,
        dwMaximumSizeHigh: u32,
        dwMaximumSizeLow: u32,
        lpName: *const u16,
    ) -> *mut c_void;

    fn MapViewOfFile(
        hFileMappingObject: *mut c_void,
        dwDesiredAccess: u32,
        dwFileOffsetHigh: u32,
        dwFileOffsetLow: u32,
        dwNumberOfBytesToMap: usize,
    ) -> *mut c_void;

    fn UnmapViewOfFile(lpBaseAddress: *const c_void) -> i32;

    fn CloseHandle(hObject: *mut c_void) -> i32;

    fn VirtualProtect(
        lpAddress: *mut c_void,
        dwSize: usize,
        flNewProtect: u32,
        lpflOldProtect: *mut u32,
    ) -> i32;
}

fn system_info() -> SYSTEM_INFO {
    let mut sysinfo = MaybeUninit::<SYSTEM_INFO>::uninit();
    // SAFETY: GetSystemInfo always fills the struct.
    unsafe {
        GetSystemInfo(sysinfo.as_mut_ptr());
        sysinfo.assume_init()
    }
}

impl HostMapping for Windows {
    fn page_size() -> usize {
        system_info().dwPageSize as usize
    }

    fn allocation_granularity() -> usize {
        system_info().dwAllocationGranularity as usize
    }

    #[cfg(feature = "advise")]
    unsafe fn advise(addr: *const u8, len: usize, advice: Advice) -> io::Result<()> {
        #[allow(non_snake_case)]
        #[repr(C)]
        struct WIN32_MEMORY_RANGE_ENTRY {
            VirtualAddress: *mut core::ffi::c_void,
            NumberOfBytes: usize,
        }

        extern "system" {
            fn PrefetchVirtualMemory(
                hProcess: *mut core::ffi::c_void,
                NumberOfEntries: usize,
                VirtualAddresses: *const WIN32_MEMORY_RANGE_ENTRY,
                Flags: u32,
            ) -> i32;

            fn GetCurrentProcess() -> *mut core::ffi::c_void;
        }

        // Only prefetching has a native counterpart; the other hints are no-ops.
        if advice != Advice::WillNeed {
            return Ok(());
        }

        let entry = WIN32_MEMORY_RANGE_ENTRY {
            VirtualAddress: addr as *mut core::ffi::c_void,
            NumberOfBytes: len,
        };

        // SAFETY: the caller guarantees the range is a live mapping.
        let result = unsafe { PrefetchVirtualMemory(GetCurrentProcess(), 1, &entry, 0) };
        if result == 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    #[cfg(not(feature = "advise"))]
    unsafe fn advise(_addr: *const u8, _len: usize, _advice: Advice) -> io::Result<()> {
        Ok(())
    }

    // `populate` has no counterpart; pages fault lazily.
    #[allow(clippy::cast_possible_truncation)]
    fn map_shared_anon(len: usize, _populate: bool) -> io::Result<NonNull<u8>> {
        let size = len as u64;
        // INVALID_HANDLE_VALUE asks for a section backed by the paging file.
        let invalid_handle = -1isize as *mut c_void;
        // SAFETY: plain Win32 calls; the section handle is closed below and
        // the view keeps the section alive.
        unsafe {
            let section = CreateFileMappingW(
                invalid_handle,
                ptr::null_mut(),
                PAGE_READWRITE,
                (size >> 32) as u32,
                size as u32,
                ptr::null(),
            );
            if section.is_null() {
                return Err(io::Error::last_os_error());
            }
            let view = MapViewOfFile(section, FILE_MAP_WRITE, 0, 0, len);
            let mapped = if view.is_null() {
                Err(io::Error::last_os_error())
            } else {
                Ok(view.cast::<u8>())
            };
            CloseHandle(section);
            NonNull::new(mapped?)
                .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "null view"))
        }
    }

    unsafe fn protect(addr: *mut u8, len: usize, protection: Protection) -> io::Result<()> {
        let flag = match protection {
            Protection::ReadOnly => PAGE_READONLY,
            Protection::ReadWrite => PAGE_READWRITE,
        };
        let mut old = 0u32;
        // SAFETY: the caller guarantees the range is a live view.
        if unsafe { VirtualProtect(addr.cast::<c_void>(), len, flag, &mut old) } == 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    unsafe fn unmap(addr: *mut u8, _len: usize) -> io::Result<()> {
        // SAFETY: the caller guarantees the view is ours and unused.
        if unsafe { UnmapViewOfFile(addr.cast::<c_void>()) } == 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}
