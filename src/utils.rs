//! Utility helpers for granularity, byte sizes, and window arithmetic.

use std::io;
use std::sync::OnceLock;

use crate::errors::{BufferError, Result};
use crate::sys::{Host, HostMapping};

/// Get the system page size in bytes.
#[must_use]
pub fn page_size() -> usize {
    static PAGE: OnceLock<usize> = OnceLock::new();
    *PAGE.get_or_init(Host::page_size)
}

/// Alignment every mapping offset must respect.
///
/// Equal to the page size on Unix; on Windows it is the allocation
/// granularity (typically 64 KiB).
#[must_use]
pub fn page_granularity() -> usize {
    static GRANULARITY: OnceLock<usize> = OnceLock::new();
    *GRANULARITY.get_or_init(Host::allocation_granularity)
}

/// Byte size of `entries` elements of `elem_size` bytes each.
///
/// # Errors
///
/// Returns `BufferError::CapacityOverflow` if the product overflows `usize`.
pub fn byte_len(entries: usize, elem_size: usize) -> Result<usize> {
    entries
        .checked_mul(elem_size)
        .ok_or(BufferError::CapacityOverflow { entries, elem_size })
}

/// Ensure `offset` is a multiple of `required`.
///
/// # Errors
///
/// Returns `BufferError::Misaligned` otherwise.
pub fn ensure_aligned(offset: u64, required: u64) -> Result<()> {
    if required != 0 && offset % required != 0 {
        return Err(BufferError::Misaligned { required, offset });
    }
    Ok(())
}

/// Length of the window starting at `offset`, clamped to end at `total`.
/// A `requested` length of zero means "up to the end of the backing".
///
/// # Errors
///
/// Returns `BufferError::Map` when `offset` is at or past `total`, since
/// nothing would be mapped.
#[allow(clippy::cast_possible_truncation)]
pub fn clamp_window(offset: u64, requested: usize, total: u64) -> Result<usize> {
    if offset >= total {
        return Err(BufferError::Map {
            offset,
            len: requested as u64,
            source: io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("window offset {offset} is not below backing size {total}"),
            ),
        });
    }
    let available = total - offset;
    let len = if requested == 0 {
        available
    } else {
        available.min(requested as u64)
    };
    // The window must be addressable, so it has to fit in usize.
    usize::try_from(len).map_err(|_| BufferError::Map {
        offset,
        len,
        source: io::Error::new(io::ErrorKind::OutOfMemory, "window exceeds address space"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn granularity_is_multiple_of_page_size() {
        let page = page_size();
        let granularity = page_granularity();
        assert!(page.is_power_of_two());
        assert!(granularity >= page);
        assert_eq!(granularity % page, 0);
    }

    #[test]
    fn byte_len_detects_overflow() {
        assert_eq!(byte_len(4, 8).expect("len"), 32);
        assert_eq!(byte_len(0, 8).expect("len"), 0);
        assert!(matches!(
            byte_len(usize::MAX, 2),
            Err(BufferError::CapacityOverflow { entries: usize::MAX, elem_size: 2 })
        ));
    }

    #[test]
    fn alignment_is_checked_not_rounded() {
        ensure_aligned(0, 4096).expect("zero is aligned");
        ensure_aligned(8192, 4096).expect("aligned");
        let err = ensure_aligned(100, 4096).unwrap_err();
        assert_eq!(
            err.to_string(),
            "misaligned offset: offset=100, required alignment=4096"
        );
    }

    #[test]
    fn window_is_clamped_to_backing() {
        assert_eq!(clamp_window(0, 0, 1000).expect("whole"), 1000);
        assert_eq!(clamp_window(0, 400, 1000).expect("partial"), 400);
        assert_eq!(clamp_window(800, 400, 1000).expect("clamped"), 200);
        assert!(matches!(clamp_window(1000, 1, 1000), Err(BufferError::Map { .. })));
        assert!(matches!(clamp_window(2000, 0, 1000), Err(BufferError::Map { .. })));
    }
}
