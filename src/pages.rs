//! Page pairs and the sources that hand them out.
//!
//! ## [`PagePair`]
//!
//! One code page immediately followed by one data page. Slot `i` of the pair
//! is code at `base + (i + RESERVED_SLOTS) * SLOT_SIZE`, and its two data
//! words sit exactly `PAGE_SIZE` bytes above that. A `PagePair` is a move-only
//! handle: whoever holds it owns the memory.
//!
//! ## [`PageSource`]
//!
//! A small trait abstracting over where page pairs come from, in the same
//! spirit as a heap grower. [`TemplatePages`](crate::template::TemplatePages)
//! maps the real executable template; [`ToyPages`] hands out plain heap
//! memory and counts what it does, which is what the tests use.

use alloc::alloc::{alloc_zeroed, dealloc, Layout};
use core::fmt;
use core::ptr::NonNull;

use crate::geometry::{chain_word, funcaddr_word, PAGE_SIZE, RESERVED_SLOTS, SLOT_SIZE, TRAMP_COUNT};
use crate::os::MapError;
use crate::stack::log::{LogPage, LogPageSource};

/// The address of a trampoline's code, callable as a function pointer.
pub type CodePtr = NonNull<u8>;

/// An owned code page plus the data page right after it.
pub struct PagePair {
    base: NonNull<u8>,
}

// A PagePair is just an owning handle to memory nobody else touches.
unsafe impl Send for PagePair {}

impl PagePair {
    /// Take ownership of the pair starting at `base`.
    ///
    /// # Safety
    ///
    /// `base` must be `PAGE_SIZE`-aligned and be the start of `2 * PAGE_SIZE`
    /// bytes laid out as described in the module docs, owned by nobody else.
    pub unsafe fn from_raw(base: NonNull<u8>) -> PagePair {
        debug_assert_eq!(base.as_ptr() as usize % PAGE_SIZE, 0);
        PagePair { base }
    }

    /// Give up ownership, returning the base address.
    pub fn into_raw(self) -> NonNull<u8> {
        self.base
    }

    /// The base address of the code page.
    pub fn base(&self) -> usize {
        self.base.as_ptr() as usize
    }

    /// The page base of any code pointer handed out from a pair.
    pub fn base_of(code: CodePtr) -> usize {
        code.as_ptr() as usize & !(PAGE_SIZE - 1)
    }

    /// The slot index of any code pointer handed out from a pair.
    pub fn slot_of(code: CodePtr) -> usize {
        let offset = code.as_ptr() as usize & (PAGE_SIZE - 1);
        debug_assert_eq!(offset % SLOT_SIZE, 0, "misaligned trampoline {:?}", code);
        offset / SLOT_SIZE - RESERVED_SLOTS
    }

    /// The code address of slot `slot`.
    pub fn code_slot(&self, slot: usize) -> CodePtr {
        assert!(slot < TRAMP_COUNT, "slot {} out of range", slot);
        unsafe {
            NonNull::new_unchecked(
                self.base
                    .as_ptr()
                    .add((slot + RESERVED_SLOTS) * SLOT_SIZE),
            )
        }
    }

    fn data_words(&self, slot: usize) -> *mut usize {
        let code = self.code_slot(slot).as_ptr();
        unsafe { code.add(PAGE_SIZE) as *mut usize }
    }

    /// Bind slot `slot` to `fn_addr` and `chain`, returning its code address.
    pub fn write_slot(&mut self, slot: usize, fn_addr: usize, chain: usize) -> CodePtr {
        let data = self.data_words(slot);
        unsafe {
            data.add(funcaddr_word()).write(fn_addr);
            data.add(chain_word()).write(chain);
        }
        self.code_slot(slot)
    }

    /// The `(fn_addr, chain)` pair currently stored for slot `slot`.
    pub fn read_slot(&self, slot: usize) -> (usize, usize) {
        let data = self.data_words(slot);
        unsafe { (data.add(funcaddr_word()).read(), data.add(chain_word()).read()) }
    }
}

impl fmt::Debug for PagePair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PagePair({:?})", self.base)
    }
}

/// Read back the data words of a trampoline handed out by either allocator.
///
/// # Safety
///
/// `code` must point at a live trampoline.
pub unsafe fn binding_of(code: CodePtr) -> (usize, usize) {
    let data = code.as_ptr().add(PAGE_SIZE) as *const usize;
    (data.add(funcaddr_word()).read(), data.add(chain_word()).read())
}

/// Where page pairs come from.
pub trait PageSource {
    /// Produce a fresh page pair whose data page is zeroed.
    fn acquire_pair(&mut self) -> Result<PagePair, MapError>;

    /// Give a page pair back.
    fn release_pair(&mut self, pair: PagePair) -> Result<(), MapError>;
}

/// A page source backed by ordinary heap memory, for tests.
///
/// The "code" half is plain data, so trampolines from a `ToyPages` cannot be
/// called, but their data words and all of the allocator bookkeeping behave
/// exactly as with real pages. It also serves log pages, so a single value
/// can stand behind a whole [`StackContext`](crate::stack::StackContext).
#[derive(Default, Debug)]
pub struct ToyPages {
    pub pairs_acquired: usize,
    pub pairs_released: usize,
    pub logs_acquired: usize,
    pub logs_released: usize,
}

impl ToyPages {
    pub const fn new() -> Self {
        ToyPages {
            pairs_acquired: 0,
            pairs_released: 0,
            logs_acquired: 0,
            logs_released: 0,
        }
    }

    /// Page pairs handed out and not yet returned.
    pub fn live_pairs(&self) -> usize {
        self.pairs_acquired - self.pairs_released
    }

    /// Log pages handed out and not yet returned.
    pub fn live_logs(&self) -> usize {
        self.logs_acquired - self.logs_released
    }

    fn pair_layout() -> Layout {
        Layout::from_size_align(2 * PAGE_SIZE, PAGE_SIZE).expect("page pairs are a valid layout")
    }

    fn log_layout() -> Layout {
        Layout::new::<LogPage>()
    }
}

impl PageSource for ToyPages {
    fn acquire_pair(&mut self) -> Result<PagePair, MapError> {
        let ptr = unsafe { alloc_zeroed(Self::pair_layout()) };
        let base = NonNull::new(ptr).ok_or(MapError::Map(errno::Errno(libc::ENOMEM)))?;
        self.pairs_acquired += 1;
        Ok(unsafe { PagePair::from_raw(base) })
    }

    fn release_pair(&mut self, pair: PagePair) -> Result<(), MapError> {
        self.pairs_released += 1;
        unsafe { dealloc(pair.into_raw().as_ptr(), Self::pair_layout()) };
        Ok(())
    }
}

impl LogPageSource for ToyPages {
    fn acquire_log(&mut self) -> Result<NonNull<LogPage>, MapError> {
        let ptr = unsafe { alloc_zeroed(Self::log_layout()) };
        let page = NonNull::new(ptr as *mut LogPage)
            .ok_or(MapError::Map(errno::Errno(libc::ENOMEM)))?;
        self.logs_acquired += 1;
        Ok(page)
    }

    unsafe fn release_log(&mut self, page: NonNull<LogPage>) -> Result<(), MapError> {
        self.logs_released += 1;
        dealloc(page.as_ptr() as *mut u8, Self::log_layout());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use test_log::test;

    #[test]
    fn slot_addresses_round_trip() {
        let mut toy = ToyPages::new();
        let mut pair = toy.acquire_pair().unwrap();

        for slot in [0, 1, TRAMP_COUNT / 2, TRAMP_COUNT - 1] {
            let code = pair.write_slot(slot, 0x1000 + slot, !slot);
            assert_eq!(PagePair::base_of(code), pair.base());
            assert_eq!(PagePair::slot_of(code), slot);
            assert_eq!(pair.read_slot(slot), (0x1000 + slot, !slot));
            assert_eq!(unsafe { binding_of(code) }, (0x1000 + slot, !slot));
        }

        toy.release_pair(pair).unwrap();
        assert_eq!(toy.live_pairs(), 0);
    }

    #[test]
    fn neighbouring_slots_do_not_overlap() {
        let mut toy = ToyPages::new();
        let mut pair = toy.acquire_pair().unwrap();

        pair.write_slot(3, usize::MAX, usize::MAX);
        pair.write_slot(4, 0, 0);
        pair.write_slot(2, 0, 0);
        assert_eq!(pair.read_slot(3), (usize::MAX, usize::MAX));

        toy.release_pair(pair).unwrap();
    }

    #[test]
    fn data_words_follow_the_layout_contract() {
        let mut toy = ToyPages::new();
        let mut pair = toy.acquire_pair().unwrap();

        let code = pair.write_slot(7, 0x1122334455667788, 0x99aabbccddeeff00);
        let words = unsafe { core::slice::from_raw_parts(code.as_ptr().add(PAGE_SIZE) as *const usize, 2) };
        assert_eq!(words[funcaddr_word()], 0x1122334455667788);
        assert_eq!(words[chain_word()], 0x99aabbccddeeff00);

        toy.release_pair(pair).unwrap();
    }
}
