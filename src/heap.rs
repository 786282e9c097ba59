//! The heap-scoped trampoline allocator.
//!
//! ## [`RawHeap`]
//!
//! A single-threaded manager of page pairs, each carved into `TRAMP_COUNT`
//! slots tracked by a [`SlotBitmap`]. Page bookkeeping lives out of line,
//! keyed by the code page's base address, so every slot of a page is usable.
//!
//! Every page is in exactly one of three states:
//!
//! - the *current* page, which `alloc` tries first;
//! - on the *not-full* list, a doubly linked list threaded through the
//!   bookkeeping entries;
//! - untracked, because it is full and not current.
//!
//! An empty page is only kept if it can become the current page; otherwise
//! it goes straight back to the [`PageSource`].
//!
//! ## [`TrampHeap`]
//!
//! Wraps a `RawHeap` in a spin lock so any thread can allocate and free.
//! [`HEAP`] is the process-wide instance that [`heap_alloc`] and
//! [`heap_free`] use.

use alloc::collections::BTreeMap;

use spin::{Mutex, MutexGuard};

use crate::bitmap::SlotBitmap;
use crate::geometry::TRAMP_COUNT;
use crate::os;
use crate::pages::{CodePtr, PagePair, PageSource};
use crate::template::TemplatePages;

struct HeapPage {
    pair: PagePair,
    in_use: usize,
    bitmap: SlotBitmap,
    prev: Option<usize>,
    next: Option<usize>,
}

impl HeapPage {
    fn new(pair: PagePair) -> Self {
        HeapPage {
            pair,
            in_use: 0,
            bitmap: SlotBitmap::new(),
            prev: None,
            next: None,
        }
    }
}

/// Validity contains a count of every broken invariant found in a heap.
#[derive(Default, Debug)]
pub struct Validity {
    /// Pages on the not-full list that are current, full, or empty, plus
    /// pages that should be on it and are not.
    pub misplaced: usize,
    /// Pages whose bitmap disagrees with their in-use count.
    pub count_mismatches: usize,
    /// Broken `prev` / `next` links on the not-full list.
    pub broken_links: usize,
}

impl Validity {
    /// Returns a boolean - a simple check if all cases are 0
    pub fn is_valid(&self) -> bool {
        self.misplaced == 0 && self.count_mismatches == 0 && self.broken_links == 0
    }
}

#[derive(Default, Debug, PartialEq, Eq)]
pub struct HeapStats {
    /// Page pairs held by the heap.
    pub pages: usize,
    /// Trampolines allocated and not yet freed.
    pub live: usize,
    /// Length of the not-full list.
    pub not_full: usize,
    /// Whether there is a current page.
    pub has_current: bool,
}

/// A single-threaded heap of trampolines.
pub struct RawHeap<S> {
    pub source: S,
    pages: BTreeMap<usize, HeapPage>,
    current: Option<usize>,
    not_full: Option<usize>,
}

impl<S> Drop for RawHeap<S> {
    fn drop(&mut self) {
        // Trampolines may still be reachable from code we know nothing about,
        // so the pages are leaked rather than handed back.
        let pages = core::mem::take(&mut self.pages);
        core::mem::forget(pages);
    }
}

impl<S: PageSource + Default> Default for RawHeap<S> {
    fn default() -> Self {
        RawHeap::new(S::default())
    }
}

impl<S: PageSource> RawHeap<S> {
    pub const fn new(source: S) -> Self {
        RawHeap {
            source,
            pages: BTreeMap::new(),
            current: None,
            not_full: None,
        }
    }

    fn page(&mut self, key: usize) -> &mut HeapPage {
        self.pages
            .get_mut(&key)
            .expect("trampoline page missing from the heap")
    }

    fn push_not_full(&mut self, key: usize) {
        let old_head = self.not_full.replace(key);
        if let Some(next) = old_head {
            self.page(next).prev = Some(key);
        }
        let page = self.page(key);
        page.prev = None;
        page.next = old_head;
    }

    fn pop_not_full(&mut self) -> Option<usize> {
        let key = self.not_full?;
        self.unlink(key);
        Some(key)
    }

    fn unlink(&mut self, key: usize) {
        let page = self.page(key);
        let (prev, next) = (page.prev.take(), page.next.take());
        match prev {
            Some(p) => self.page(p).next = next,
            None => {
                debug_assert_eq!(self.not_full, Some(key));
                self.not_full = next;
            }
        }
        if let Some(n) = next {
            self.page(n).prev = prev;
        }
    }

    fn new_page(&mut self) -> usize {
        let pair = os::or_abort(self.source.acquire_pair());
        let key = pair.base();
        log::debug!("heap acquired {:?}", pair);
        self.pages.insert(key, HeapPage::new(pair));
        key
    }

    /// Allocate a trampoline calling `fn_addr` with `chain`.
    pub fn alloc(&mut self, fn_addr: usize, chain: usize) -> CodePtr {
        let key = match self.current {
            Some(key) => key,
            None => match self.pop_not_full() {
                Some(key) => key,
                None => self.new_page(),
            },
        };

        let page = self.page(key);
        let hint = page.in_use;
        page.in_use += 1;
        let full = page.in_use == TRAMP_COUNT;

        // Start the search where the page's fill level points; under
        // alloc/free churn that slot is almost always free.
        let slot = page.bitmap.claim(hint);
        let code = page.pair.write_slot(slot, fn_addr, chain);

        self.current = if full { None } else { Some(key) };
        log::trace!("heap alloc {:?} -> {:#x}, {:#x}", code, fn_addr, chain);
        code
    }

    /// Free a trampoline.
    ///
    /// # Safety
    ///
    /// `code` must have been returned by `alloc` on this heap and not freed
    /// since. Foreign pointers are caught by assertions where possible.
    pub unsafe fn free(&mut self, code: CodePtr) {
        let key = PagePair::base_of(code);
        let slot = PagePair::slot_of(code);
        log::trace!("heap free {:?}", code);

        let page = self.page(key);
        assert!(page.in_use > 0, "freeing into an empty trampoline page");
        page.in_use -= 1;
        let in_use = page.in_use;

        if self.current != Some(key) {
            if in_use == TRAMP_COUNT - 1 {
                // It had been full, so it wasn't on any list.
                self.push_not_full(key);
            } else if in_use == 0 {
                self.unlink(key);
                if self.current.is_none() {
                    self.current = Some(key);
                } else {
                    let page = self
                        .pages
                        .remove(&key)
                        .expect("trampoline page missing from the heap");
                    debug_assert!(page.bitmap.is_set(slot));
                    log::debug!("heap releasing {:?}", page.pair);
                    os::or_abort(self.source.release_pair(page.pair));
                    return;
                }
            }
        }

        self.page(key).bitmap.release(slot);
    }

    /// Get statistics on this heap, and verify its invariants.
    pub fn stats(&self) -> (Validity, HeapStats) {
        let mut validity = Validity::default();
        let mut stats = HeapStats {
            pages: self.pages.len(),
            has_current: self.current.is_some(),
            ..HeapStats::default()
        };

        let mut listed = 0;
        let mut prev = None;
        let mut cursor = self.not_full;
        while let Some(key) = cursor {
            let page = match self.pages.get(&key) {
                Some(p) => p,
                None => {
                    validity.broken_links += 1;
                    break;
                }
            };
            if page.prev != prev {
                validity.broken_links += 1;
            }
            if self.current == Some(key) || page.in_use == TRAMP_COUNT || page.in_use == 0 {
                validity.misplaced += 1;
            }
            listed += 1;
            if listed > self.pages.len() {
                // A cycle.
                validity.broken_links += 1;
                break;
            }
            prev = cursor;
            cursor = page.next;
        }
        stats.not_full = listed;

        for (&key, page) in &self.pages {
            stats.live += page.in_use;
            if page.bitmap.count() != page.in_use {
                validity.count_mismatches += 1;
            }
            let should_list = self.current != Some(key) && page.in_use != TRAMP_COUNT;
            let is_listed = page.prev.is_some() || self.not_full == Some(key);
            if should_list != is_listed {
                validity.misplaced += 1;
            }
        }

        (validity, stats)
    }
}

/// A thread-safe trampoline heap, using a spin lock around a `RawHeap`.
pub struct TrampHeap<S> {
    raw: Mutex<RawHeap<S>>,
}

impl<S: PageSource + Default> Default for TrampHeap<S> {
    fn default() -> Self {
        TrampHeap::new(S::default())
    }
}

impl<S: PageSource> TrampHeap<S> {
    pub const fn new(source: S) -> Self {
        TrampHeap {
            raw: Mutex::new(RawHeap::new(source)),
        }
    }

    /// Lock the heap and get at the underlying `RawHeap`.
    pub fn get_raw(&self) -> MutexGuard<RawHeap<S>> {
        self.raw.lock()
    }

    pub fn alloc(&self, fn_addr: usize, chain: usize) -> CodePtr {
        self.get_raw().alloc(fn_addr, chain)
    }

    /// # Safety
    ///
    /// See [`RawHeap::free`].
    pub unsafe fn free(&self, code: CodePtr) {
        self.get_raw().free(code)
    }

    pub fn stats(&self) -> (Validity, HeapStats) {
        self.get_raw().stats()
    }
}

/// The process-wide trampoline heap.
pub static HEAP: TrampHeap<TemplatePages> = TrampHeap::new(TemplatePages::new());

/// Allocate a heap trampoline from [`HEAP`].
pub fn heap_alloc(fn_addr: usize, chain: usize) -> CodePtr {
    HEAP.alloc(fn_addr, chain)
}

/// Free a trampoline returned by [`heap_alloc`].
///
/// # Safety
///
/// `code` must come from [`heap_alloc`] and must not be used afterwards.
pub unsafe fn heap_free(code: CodePtr) {
    HEAP.free(code)
}

#[cfg(test)]
mod tests {
    use super::*;

    use test_log::test;

    use crate::pages::{binding_of, ToyPages};

    fn check(heap: &RawHeap<ToyPages>) -> HeapStats {
        let (validity, stats) = heap.stats();
        assert!(validity.is_valid(), "{:?} {:?}", validity, stats);
        stats
    }

    #[test]
    fn fills_one_page_before_taking_another() {
        let mut heap = RawHeap::new(ToyPages::new());

        let codes: alloc::vec::Vec<_> = (0..TRAMP_COUNT).map(|i| heap.alloc(i, !i)).collect();
        assert_eq!(heap.source.pairs_acquired, 1);
        let stats = check(&heap);
        assert_eq!(stats.live, TRAMP_COUNT);
        assert!(!stats.has_current);

        let base = PagePair::base_of(codes[0]);
        for (i, &code) in codes.iter().enumerate() {
            assert_eq!(PagePair::base_of(code), base);
            assert_eq!(PagePair::slot_of(code), i);
        }

        let extra = heap.alloc(1, 2);
        assert_eq!(heap.source.pairs_acquired, 2);
        assert_ne!(PagePair::base_of(extra), base);
        check(&heap);
    }

    #[test]
    fn emptied_page_is_released_exactly_once() {
        let mut heap = RawHeap::new(ToyPages::new());

        let first: alloc::vec::Vec<_> = (0..TRAMP_COUNT).map(|i| heap.alloc(i, i)).collect();
        let second = heap.alloc(7, 7);
        assert_eq!(heap.source.pairs_acquired, 2);

        // The first page is full and not current; draining it goes through
        // the not-full list and ends with a release, since the second page
        // is current.
        for &code in &first {
            unsafe { heap.free(code) };
            check(&heap);
        }
        assert_eq!(heap.source.pairs_released, 1);
        assert_eq!(check(&heap).pages, 1);

        // The last page is current, so it is kept even when empty.
        unsafe { heap.free(second) };
        assert_eq!(heap.source.pairs_released, 1);
        let stats = check(&heap);
        assert_eq!(stats.pages, 1);
        assert_eq!(stats.live, 0);
    }

    #[test]
    fn empty_page_becomes_current_when_none_is() {
        let mut heap = RawHeap::new(ToyPages::new());

        let codes: alloc::vec::Vec<_> = (0..TRAMP_COUNT).map(|i| heap.alloc(i, i)).collect();
        assert!(!check(&heap).has_current);

        for &code in &codes {
            unsafe { heap.free(code) };
        }
        let stats = check(&heap);
        assert!(stats.has_current);
        assert_eq!(stats.pages, 1);
        assert_eq!(heap.source.pairs_released, 0);

        // And it is reused rather than a new page being mapped.
        heap.alloc(0, 0);
        assert_eq!(heap.source.pairs_acquired, 1);
    }

    #[test]
    fn freed_slots_are_reused_before_new_pages() {
        let mut heap = RawHeap::new(ToyPages::new());

        let codes: alloc::vec::Vec<_> = (0..TRAMP_COUNT).map(|i| heap.alloc(i, i)).collect();
        unsafe {
            heap.free(codes[17]);
            heap.free(codes[3]);
        }
        check(&heap);

        let a = heap.alloc(100, 101);
        let b = heap.alloc(200, 201);
        assert_eq!(heap.source.pairs_acquired, 1);
        let mut reused = [PagePair::slot_of(a), PagePair::slot_of(b)];
        reused.sort();
        assert_eq!(reused, [3, 17]);
        assert_eq!(unsafe { binding_of(a) }, (100, 101));
        assert_eq!(unsafe { binding_of(b) }, (200, 201));
        check(&heap);
    }

    #[test]
    fn alloc_free_alloc_returns_the_same_slot() {
        let mut heap = RawHeap::new(ToyPages::new());
        let keep = heap.alloc(1, 1);
        let a = heap.alloc(2, 2);
        unsafe { heap.free(a) };
        let b = heap.alloc(3, 3);
        assert_eq!(a, b);
        assert_ne!(keep, b);
        check(&heap);
    }

    #[test]
    #[should_panic(expected = "releasing free trampoline slot")]
    fn double_free_is_caught() {
        let mut heap = RawHeap::new(ToyPages::new());
        let _keep = heap.alloc(1, 1);
        let a = heap.alloc(2, 2);
        unsafe {
            heap.free(a);
            heap.free(a);
        }
    }

    #[test]
    fn locked_heap_is_shared_between_threads() {
        static SHARED: TrampHeap<ToyPages> = TrampHeap::new(ToyPages::new());

        let handles: std::vec::Vec<_> = (0..4)
            .map(|t| {
                std::thread::spawn(move || {
                    let codes: std::vec::Vec<_> =
                        (0..100).map(|i| SHARED.alloc(t, i)).collect();
                    for (i, &code) in codes.iter().enumerate() {
                        assert_eq!(unsafe { binding_of(code) }, (t, i));
                    }
                    for code in codes {
                        unsafe { SHARED.free(code) };
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let (validity, stats) = SHARED.stats();
        assert!(validity.is_valid());
        assert_eq!(stats.live, 0);
    }
}
