//! Finding the template page on disk.
//!
//! There is no way to ask the kernel for a second, differently protected
//! view of a page we already have mapped, so instead we find out which file
//! and offset the template was loaded from and map that again. The answer is
//! the same for every thread, so it is computed once and cached.

use alloc::borrow::ToOwned;
use alloc::ffi::CString;
use core::ffi::{c_int, c_void, CStr};

use spin::Once;

use crate::geometry;

/// Where the template page lives in the file system.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageLocation {
    /// Path of the loaded object containing the template.
    pub path: CString,
    /// Byte offset of the template page within that file.
    pub offset: u64,
}

static LOCATION: Once<Option<ImageLocation>> = Once::new();

/// The cached location of the template page, or `None` if no loaded object
/// contains it.
pub fn template_location() -> Option<&'static ImageLocation> {
    LOCATION
        .call_once(|| locate(geometry::template_page()))
        .as_ref()
}

struct Search {
    target: usize,
    found: Option<ImageLocation>,
}

/// Walk the program headers of every loaded object looking for the
/// `PT_LOAD` segment that contains `target`.
pub fn locate(target: usize) -> Option<ImageLocation> {
    let mut search = Search {
        target,
        found: None,
    };
    let rc = unsafe {
        libc::dl_iterate_phdr(
            Some(phdr_callback),
            &mut search as *mut Search as *mut c_void,
        )
    };
    if rc <= 0 {
        return None;
    }
    if let Some(loc) = &search.found {
        log::debug!(
            "template {:#x} found in {:?} at offset {:#x}",
            target,
            loc.path,
            loc.offset
        );
    }
    search.found
}

unsafe extern "C" fn phdr_callback(
    info: *mut libc::dl_phdr_info,
    size: usize,
    data: *mut c_void,
) -> c_int {
    // Older C libraries hand out a shorter structure.
    let needed = core::mem::offset_of!(libc::dl_phdr_info, dlpi_phnum)
        + core::mem::size_of::<libc::Elf64_Half>();
    if size < needed {
        return -1;
    }

    let info = &*info;
    let search = &mut *(data as *mut Search);
    let load_base = info.dlpi_addr as usize;
    let phdrs = core::slice::from_raw_parts(info.dlpi_phdr, info.dlpi_phnum as usize);

    for phdr in phdrs {
        if phdr.p_type != libc::PT_LOAD {
            continue;
        }
        let vaddr = load_base.wrapping_add(phdr.p_vaddr as usize);
        if search.target < vaddr || search.target >= vaddr + phdr.p_memsz as usize {
            continue;
        }

        // The main program is reported with an empty name.
        let name = if info.dlpi_name.is_null() || *info.dlpi_name == 0 {
            CString::from(c"/proc/self/exe")
        } else {
            CStr::from_ptr(info.dlpi_name).to_owned()
        };
        search.found = Some(ImageLocation {
            path: name,
            offset: phdr.p_offset as u64 + (search.target - vaddr) as u64,
        });
        return 1;
    }

    0
}
