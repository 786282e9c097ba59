//! Thin wrappers over the libc calls the allocators need.
//!
//! Everything here reports failure as a [`MapError`]. The allocators treat
//! any of them as fatal: without an executable page there is nothing useful
//! left to do, so [`fatal`] logs the error and aborts.

use core::fmt;
use core::ptr::{null_mut, NonNull};

use errno::Errno;
use spin::Once;

use crate::geometry::PAGE_SIZE;

/// A failure from the operating system while managing trampoline memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapError {
    /// The template page was not found in any loaded object.
    Locate,
    /// The object containing the template could not be opened.
    Open(Errno),
    /// An `mmap` call failed.
    Map(Errno),
    /// A `munmap` call failed.
    Unmap(Errno),
    /// `sigaltstack` refused to describe the current signal stack.
    SignalStack(Errno),
    /// The system page size does not divide the template page size.
    PageSize(usize),
}

impl fmt::Display for MapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MapError::Locate => write!(f, "trampoline template not found in any loaded object"),
            MapError::Open(e) => write!(f, "cannot open the trampoline image: {}", e),
            MapError::Map(e) => write!(f, "mmap failed: {}", e),
            MapError::Unmap(e) => write!(f, "munmap failed: {}", e),
            MapError::SignalStack(e) => write!(f, "sigaltstack failed: {}", e),
            MapError::PageSize(sys) => write!(
                f,
                "system page size {} does not divide trampoline page size {}",
                sys, PAGE_SIZE
            ),
        }
    }
}

/// Log `err` and abort the process.
#[cold]
pub fn fatal(err: MapError) -> ! {
    log::error!("trampoline allocator: {}", err);
    unsafe { libc::abort() }
}

/// Unwrap an OS result, aborting on failure.
pub fn or_abort<T>(res: Result<T, MapError>) -> T {
    match res {
        Ok(v) => v,
        Err(e) => fatal(e),
    }
}

/// Check, once, that the host page size is compatible with our geometry.
pub fn check_page_size() -> Result<(), MapError> {
    static HOST_PAGE: Once<usize> = Once::new();
    let host = *HOST_PAGE.call_once(sysconf::page::pagesize);
    if host == 0 || PAGE_SIZE % host != 0 {
        return Err(MapError::PageSize(host));
    }
    Ok(())
}

/// Map `len` bytes of fresh, zeroed, read/write anonymous memory.
pub fn map_anonymous(len: usize) -> Result<NonNull<u8>, MapError> {
    let ptr = unsafe {
        libc::mmap(
            // Address we want the memory at. We don't care, so null it is.
            null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        return Err(MapError::Map(errno::errno()));
    }
    NonNull::new(ptr as *mut u8).ok_or(MapError::Map(errno::errno()))
}

/// Map `len` bytes of zeroed read/write memory starting on an `align`
/// boundary, which may be coarser than the system page.
pub fn map_anonymous_aligned(len: usize, align: usize) -> Result<NonNull<u8>, MapError> {
    let host = sysconf::page::pagesize();
    if align <= host {
        return map_anonymous(len);
    }

    // Over-allocate, then trim both ends back to the aligned window.
    let padded = len + align - host;
    let raw = map_anonymous(padded)?;
    let start = raw.as_ptr() as usize;
    let aligned = (start + align - 1) & !(align - 1);
    let head = aligned - start;
    let tail = padded - head - len;
    unsafe {
        if head > 0 {
            unmap(raw, head)?;
        }
        if tail > 0 {
            unmap(NonNull::new_unchecked((aligned + len) as *mut u8), tail)?;
        }
        Ok(NonNull::new_unchecked(aligned as *mut u8))
    }
}

/// Replace the first `len` bytes at `addr` with an executable, read-only
/// mapping of `fd` at `offset`.
///
/// # Safety
///
/// `addr..addr+len` must be a mapping owned by the caller; whatever was there
/// is discarded.
pub unsafe fn map_file_exec_fixed(
    addr: NonNull<u8>,
    len: usize,
    fd: libc::c_int,
    offset: u64,
) -> Result<(), MapError> {
    let ptr = libc::mmap(
        addr.as_ptr() as *mut libc::c_void,
        len,
        libc::PROT_READ | libc::PROT_EXEC,
        libc::MAP_PRIVATE | libc::MAP_FIXED,
        fd,
        offset as libc::off_t,
    );
    if ptr == libc::MAP_FAILED {
        return Err(MapError::Map(errno::errno()));
    }
    debug_assert_eq!(ptr as *mut u8, addr.as_ptr());
    Ok(())
}

/// Unmap `len` bytes at `addr`.
///
/// # Safety
///
/// The range must be a mapping owned by the caller and no longer referenced.
pub unsafe fn unmap(addr: NonNull<u8>, len: usize) -> Result<(), MapError> {
    if libc::munmap(addr.as_ptr() as *mut libc::c_void, len) < 0 {
        return Err(MapError::Unmap(errno::errno()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    use test_log::test;

    #[test]
    fn host_page_size_divides_template_page() {
        check_page_size().unwrap();
    }

    #[test]
    fn anonymous_mapping_is_zeroed_and_writable() {
        let p = map_anonymous(PAGE_SIZE).unwrap();
        unsafe {
            let bytes = core::slice::from_raw_parts_mut(p.as_ptr(), PAGE_SIZE);
            assert!(bytes.iter().all(|&b| b == 0));
            bytes[PAGE_SIZE - 1] = 0xa5;
            assert_eq!(bytes[PAGE_SIZE - 1], 0xa5);
            unmap(p, PAGE_SIZE).unwrap();
        }
    }

    #[test]
    fn aligned_mapping_is_aligned() {
        let align = 4 * PAGE_SIZE;
        let p = map_anonymous_aligned(2 * PAGE_SIZE, align).unwrap();
        assert_eq!(p.as_ptr() as usize % align, 0);
        unsafe {
            p.as_ptr().add(2 * PAGE_SIZE - 1).write(1);
            unmap(p, 2 * PAGE_SIZE).unwrap();
        }
    }

    #[test]
    fn errors_render() {
        let msg = alloc::format!("{}", MapError::PageSize(3));
        assert!(msg.contains("does not divide"));
    }
}
