//! The real page source: executable aliases of the template page.

use core::ptr::NonNull;

use crate::geometry::PAGE_SIZE;
use crate::image;
use crate::os::{self, MapError};
use crate::pages::{PagePair, PageSource};

/// Maps page pairs whose code half is the template page, reloaded from the
/// file the running program was loaded from.
#[derive(Default, Debug)]
pub struct TemplatePages {
    // Backs `live_pairs`.
    pairs: usize,
}

impl TemplatePages {
    pub const fn new() -> Self {
        TemplatePages { pairs: 0 }
    }

    /// Page pairs currently mapped through this source.
    pub fn live_pairs(&self) -> usize {
        self.pairs
    }
}

/// Closes the image file descriptor on every exit path.
struct Fd(libc::c_int);

impl Drop for Fd {
    fn drop(&mut self) {
        unsafe { libc::close(self.0) };
    }
}

/// Reserve both pages as anonymous memory, then put the template at
/// `offset` in `fd` over the first one. The second stays as the zeroed data
/// page.
fn map_template_pair(fd: libc::c_int, offset: u64) -> Result<NonNull<u8>, MapError> {
    let base = os::map_anonymous_aligned(2 * PAGE_SIZE, PAGE_SIZE)?;
    if let Err(e) = unsafe { os::map_file_exec_fixed(base, PAGE_SIZE, fd, offset) } {
        // The mapping failure is what gets reported.
        if let Err(unmap) = unsafe { os::unmap(base, 2 * PAGE_SIZE) } {
            log::error!("leaking page pair at {:?}: {}", base, unmap);
        }
        return Err(e);
    }
    Ok(base)
}

impl PageSource for TemplatePages {
    fn acquire_pair(&mut self) -> Result<PagePair, MapError> {
        os::check_page_size()?;
        let loc = image::template_location().ok_or(MapError::Locate)?;

        // The descriptor is not cached; holding one open per source would
        // let a busy program run out of them.
        let fd = unsafe { libc::open(loc.path.as_ptr(), libc::O_RDONLY | libc::O_CLOEXEC) };
        if fd < 0 {
            return Err(MapError::Open(errno::errno()));
        }
        let fd = Fd(fd);

        let base = map_template_pair(fd.0, loc.offset)?;

        self.pairs += 1;
        log::debug!("mapped trampoline page pair at {:?}", base);
        Ok(unsafe { PagePair::from_raw(base) })
    }

    fn release_pair(&mut self, pair: PagePair) -> Result<(), MapError> {
        let base: NonNull<u8> = pair.into_raw();
        unsafe { os::unmap(base, 2 * PAGE_SIZE)? };
        self.pairs -= 1;
        log::debug!("unmapped trampoline page pair at {:?}", base);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use test_log::test;

    use crate::geometry::{template_page, SLOT_SIZE};

    #[test]
    fn code_page_aliases_the_template() {
        let mut source = TemplatePages::new();
        let mut pair = source.acquire_pair().unwrap();

        let alias = unsafe { core::slice::from_raw_parts(pair.base() as *const u8, PAGE_SIZE) };
        let original =
            unsafe { core::slice::from_raw_parts(template_page() as *const u8, PAGE_SIZE) };
        assert_eq!(alias[..4 * SLOT_SIZE], original[..4 * SLOT_SIZE]);
        assert_eq!(alias, original);

        // The data page is writable and starts out zeroed.
        assert_eq!(pair.read_slot(0), (0, 0));
        pair.write_slot(0, 1, 2);
        assert_eq!(pair.read_slot(0), (1, 2));

        assert_eq!(source.live_pairs(), 1);
        source.release_pair(pair).unwrap();
        assert_eq!(source.live_pairs(), 0);
    }

    #[test]
    fn failed_template_mapping_reports_the_mmap_error() {
        let err = map_template_pair(-1, 0).unwrap_err();
        assert_eq!(err, MapError::Map(errno::Errno(libc::EBADF)));
    }
}
