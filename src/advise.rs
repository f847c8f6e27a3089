//! Paging hints forwarded to the OS for a mapped window.

use crate::errors::Result;
use crate::region::MappedRegion;
use crate::sys::{Host, HostMapping};

/// Expected access pattern, forwarded to the OS as a best-effort hint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Advice {
    /// No particular pattern (default).
    #[default]
    Normal,
    /// Pages will be read in ascending order; read ahead aggressively.
    SequentialScan,
    /// Pages will be touched in no particular order; avoid read-ahead.
    RandomAccess,
    /// The window will be needed soon; start faulting it in.
    WillNeed,
    /// The window will not be needed soon; its pages may be reclaimed.
    DontNeed,
}

impl MappedRegion {
    /// Advise the OS about the expected access pattern of the mapped window.
    ///
    /// The hint is purely a performance request: OS refusals are swallowed,
    /// and an open region with no window ignores it.
    ///
    /// # Errors
    ///
    /// Returns `BufferError::InvalidState` unless the region is open.
    ///
    /// # Platform-specific behavior
    ///
    /// - **Unix**: uses `madvise`
    /// - **Windows**: uses `PrefetchVirtualMemory` for `WillNeed`, no-op for others
    pub fn advise(&self, hint: Advice) -> Result<()> {
        self.ensure_open()?;
        let Some(bytes) = self.data() else {
            return Ok(());
        };
        if bytes.is_empty() {
            return Ok(());
        }
        // SAFETY: the slice borrows the live window, whose base is page aligned.
        let result = unsafe { Host::advise(bytes.as_ptr(), bytes.len(), hint) };
        if let Err(err) = result {
            log::trace!("ignoring failed {hint:?} hint on {} bytes: {err}", bytes.len());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::BufferError;
    use crate::region::WHOLE_FILE;
    use std::fs;
    use std::path::PathBuf;

    fn tmp_path(name: &str) -> PathBuf {
        let mut p = std::env::temp_dir();
        p.push(format!("mmap_buffer_advise_test_{}_{}", name, std::process::id()));
        p
    }

    #[test]
    fn advise_every_hint_on_file_window() {
        let path = tmp_path("file_window");
        fs::write(&path, vec![7u8; 8192]).expect("write");

        let region = MappedRegion::open(&path, WHOLE_FILE, Advice::Normal).expect("open");
        for hint in [
            Advice::SequentialScan,
            Advice::RandomAccess,
            Advice::WillNeed,
            Advice::DontNeed,
            Advice::Normal,
        ] {
            region.advise(hint).expect("advise");
        }
        // DontNeed on a shared file mapping never discards file content.
        assert_eq!(region.at(0).expect("at"), 7);
        assert_eq!(region.at(8191).expect("at"), 7);

        drop(region);
        fs::remove_file(&path).expect("cleanup");
    }

    #[test]
    fn dont_need_keeps_anonymous_contents() {
        let mut region = MappedRegion::anonymous(4 * 4096, false).expect("anon");
        {
            let bytes = region.data_mut().expect("data_mut");
            bytes[0] = 1;
            bytes[4096 * 3 + 17] = 2;
        }
        region.advise(Advice::DontNeed).expect("advise");
        assert_eq!(region.at(0).expect("at"), 1);
        assert_eq!(region.at(4096 * 3 + 17).expect("at"), 2);
    }

    #[test]
    fn advise_outside_open_state_is_rejected() {
        let mut region = MappedRegion::new();
        assert!(matches!(
            region.advise(Advice::WillNeed),
            Err(BufferError::InvalidState(_))
        ));
        region.close();
        assert!(matches!(
            region.advise(Advice::DontNeed),
            Err(BufferError::InvalidState(_))
        ));
    }
}
