//! The stack-scoped trampoline allocator.
//!
//! A [`StackContext`] hands out trampolines that live exactly as long as the
//! stack frame that asked for them, without ever being told when a frame
//! returns. Instead, each allocation for a new frame carries that frame's
//! Canonical Frame Address. Frames are always logged in younger-and-younger
//! order, so when a frame at CFA `c` asks for a trampoline, every logged
//! frame younger than `c` must already have returned, and the log is
//! replayed backward to reclaim them.
//!
//! Within a page pair, slots are handed out strictly in order and reclaimed
//! as a contiguous suffix, so no bitmap is needed; the log remembers how
//! many slots each frame took and which page pair was current before each
//! switch.
//!
//! The stack is assumed to grow downward: a numerically larger CFA is an
//! older frame. Split stacks are not supported.
//!
//! One context belongs to one thread. Signal handlers on that thread may
//! allocate too; every update runs with all signals masked, and running on
//! the alternate signal stack is recorded in the log with a
//! [`LogEntry::SigStack`] marker so that unwinding the primary stack never
//! eats into it and leaving the signal stack discards it wholesale.

pub mod log;

use core::ptr::NonNull;

use crate::geometry::TRAMP_COUNT;
use crate::os;
use crate::pages::{CodePtr, PagePair, PageSource};
use crate::signals::{AltStack, MaskedRegion, SignalStackProbe, SystemSignalStack};
use crate::template::TemplatePages;

use self::log::{AnonymousPages, Log, LogEntry, LogPage, LogPageSource};

/// A CFA older than any real frame; replaying to it empties the log.
pub const OLDEST_CFA: usize = usize::MAX;

/// Whether the frame at `a` is older than the frame at `b`.
#[inline]
pub fn cfa_older(a: usize, b: usize) -> bool {
    a > b
}

/// Per-thread state of the stack allocator.
pub struct StackContext<
    S: PageSource = TemplatePages,
    L: LogPageSource = AnonymousPages,
    Q: SignalStackProbe = SystemSignalStack,
> {
    pages: S,
    logs: L,
    probe: Q,

    /// The pair trampolines are currently carved from, and how many of its
    /// slots are taken. `in_use == TRAMP_COUNT` with no page means the next
    /// allocation maps one.
    page: Option<PagePair>,
    in_use: usize,

    log: Log,
    /// The frame that `alloc` with a zero CFA continues.
    cur_cfa: usize,
    /// The alternate signal stack we last saw ourselves running on.
    sigstack: AltStack,

    spare_page: Option<PagePair>,
    spare_log: Option<NonNull<LogPage>>,
}

impl StackContext {
    /// A context drawing on the real template, `mmap` and `sigaltstack`.
    pub const fn new() -> Self {
        StackContext::with_sources(TemplatePages::new(), AnonymousPages, SystemSignalStack)
    }
}

impl Default for StackContext {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: PageSource, L: LogPageSource, Q: SignalStackProbe> StackContext<S, L, Q> {
    pub const fn with_sources(pages: S, logs: L, probe: Q) -> Self {
        StackContext {
            pages,
            logs,
            probe,
            page: None,
            in_use: TRAMP_COUNT,
            log: Log::new(),
            cur_cfa: 0,
            sigstack: AltStack {
                base: 0,
                size: 0,
                active: false,
            },
            spare_page: None,
            spare_log: None,
        }
    }

    /// Allocate a trampoline calling `fn_addr` with `chain`, scoped to the
    /// frame at `cfa`.
    ///
    /// The first allocation on behalf of a frame must pass that frame's CFA;
    /// later ones from the same frame may pass 0 to mean "same as last time".
    /// Passing a CFA reclaims the trampolines of every younger frame.
    pub fn alloc(&mut self, cfa: usize, fn_addr: usize, chain: usize) -> CodePtr {
        let _masked = MaskedRegion::enter();

        let mut cfa = cfa;
        if cfa != 0 {
            self.enter_frame(cfa);
        }

        if self.in_use == TRAMP_COUNT {
            let prev = self.page.take().map(PagePair::into_raw);
            self.append(LogEntry::NewPage(prev));
            let pair = self.take_page();
            ::log::debug!("stack context switched to {:?}", pair);
            self.page = Some(pair);
            self.in_use = 0;
            // A frame's log entry cannot span two pages.
            cfa = self.cur_cfa;
        }

        if cfa != 0 {
            self.append(LogEntry::Frame { cfa, count: 1 });
        } else {
            self.log.extend_frame(self.cur_cfa);
        }

        let slot = self.in_use;
        self.in_use += 1;
        let pair = self
            .page
            .as_mut()
            .expect("stack context has no page after refilling");
        let code = pair.write_slot(slot, fn_addr, chain);
        ::log::trace!(
            "stack alloc {:?} for frame {:#x} -> {:#x}, {:#x}",
            code,
            self.cur_cfa,
            fn_addr,
            chain
        );
        code
    }

    /// Reclaim the trampolines of every frame younger than `cfa`, as if the
    /// frame at `cfa` were about to allocate. The next `alloc` must again
    /// pass a real CFA.
    pub fn unwind(&mut self, cfa: usize) {
        assert_ne!(cfa, 0, "unwinding needs a frame address");
        let _masked = MaskedRegion::enter();
        self.enter_frame(cfa);
    }

    /// Reclaim everything this context holds and give all of its memory
    /// back. Must run before the owning thread goes away; the context is
    /// empty and reusable afterwards.
    pub fn on_thread_exit(&mut self) {
        let _masked = MaskedRegion::enter();

        self.replay(OLDEST_CFA, true);
        debug_assert!(self.log.is_empty());
        debug_assert!(self.page.is_none());

        if let Some(log) = self.log.take() {
            self.release_log(log);
        }
        if let Some(log) = self.spare_log.take() {
            self.release_log(log);
        }
        if let Some(pair) = self.page.take() {
            os::or_abort(self.pages.release_pair(pair));
        }
        if let Some(pair) = self.spare_page.take() {
            os::or_abort(self.pages.release_pair(pair));
        }

        self.in_use = TRAMP_COUNT;
        self.cur_cfa = 0;
        self.sigstack = AltStack::default();
    }

    /// Work out where the frame at `cfa` sits relative to the signal stack,
    /// then reclaim whatever it has outlived.
    fn enter_frame(&mut self, cfa: usize) {
        let current = os::or_abort(self.probe.current());

        if current.active {
            if self.sigstack.active {
                // Still on a signal stack. If it is a different one, nothing
                // logged since we got here can still be live.
                let target = if current.same_stack(&self.sigstack) {
                    cfa
                } else {
                    self.sigstack = current;
                    OLDEST_CFA
                };
                self.replay(target, false);
            } else {
                self.sigstack = current;
                self.append(LogEntry::SigStack);
            }
        } else {
            let leaving = self.sigstack.active;
            self.sigstack.active = false;
            self.replay(cfa, leaving);
        }

        self.cur_cfa = cfa;
    }

    /// Walk the log backward, undoing everything younger than `cfa`.
    ///
    /// A `SigStack` marker stops the walk unless `exit_sigstack` is set, in
    /// which case it is crossed once and every frame before it is discarded
    /// regardless of address.
    fn replay(&mut self, cfa: usize, mut exit_sigstack: bool) {
        while let Some(entry) = self.log.last() {
            match entry {
                LogEntry::NewLog(prev) => {
                    let done = self.log.retreat(prev);
                    self.put_log(done);
                    continue;
                }
                LogEntry::NewPage(prev) => {
                    assert_eq!(
                        self.in_use, 0,
                        "page pair switched back with trampolines still live"
                    );
                    if let Some(pair) = self.page.take() {
                        self.put_page(pair);
                    }
                    self.page = prev.map(|base| unsafe { PagePair::from_raw(base) });
                    self.in_use = TRAMP_COUNT;
                }
                LogEntry::SigStack => {
                    if !exit_sigstack {
                        break;
                    }
                    exit_sigstack = false;
                }
                LogEntry::Frame { cfa: frame, count } => {
                    if !exit_sigstack && cfa_older(frame, cfa) {
                        break;
                    }
                    assert!(
                        self.in_use >= count,
                        "frame {:#x} logged {} trampolines but only {} are live",
                        frame,
                        count,
                        self.in_use
                    );
                    self.in_use -= count;
                }
            }
            self.log.pop();
        }

        // Only the first page can run dry; every later one starts with a
        // `NewLog` and is retreated from instead.
        if self.log.is_empty() {
            if let Some(first) = self.log.take() {
                self.put_log(first);
            }
        }
    }

    fn append(&mut self, entry: LogEntry) {
        if self.log.is_full() {
            let fresh = self.take_log();
            self.log.start_page(fresh);
        }
        self.log.push(entry);
    }

    // One-page caches, so a frame that keeps crossing a page boundary does
    // not map and unmap on every call.

    fn take_page(&mut self) -> PagePair {
        match self.spare_page.take() {
            Some(pair) => pair,
            None => os::or_abort(self.pages.acquire_pair()),
        }
    }

    fn put_page(&mut self, pair: PagePair) {
        if let Some(old) = self.spare_page.replace(pair) {
            os::or_abort(self.pages.release_pair(old));
        }
    }

    fn take_log(&mut self) -> NonNull<LogPage> {
        match self.spare_log.take() {
            Some(page) => page,
            None => os::or_abort(self.logs.acquire_log()),
        }
    }

    fn put_log(&mut self, page: NonNull<LogPage>) {
        if let Some(old) = self.spare_log.replace(page) {
            self.release_log(old);
        }
    }

    fn release_log(&mut self, page: NonNull<LogPage>) {
        os::or_abort(unsafe { self.logs.release_log(page) });
    }

    /// Trampolines taken from the current page pair.
    pub fn in_use(&self) -> usize {
        if self.page.is_none() {
            0
        } else {
            self.in_use
        }
    }

    /// The frame a zero-CFA `alloc` would extend.
    pub fn current_frame(&self) -> usize {
        self.cur_cfa
    }

    pub fn log(&self) -> &Log {
        &self.log
    }

    pub fn page_source(&self) -> &S {
        &self.pages
    }

    pub fn log_source(&self) -> &L {
        &self.logs
    }

    pub fn probe_mut(&mut self) -> &mut Q {
        &mut self.probe
    }

    /// Whether a spare page pair and a spare log page are being held.
    pub fn spares(&self) -> (bool, bool) {
        (self.spare_page.is_some(), self.spare_log.is_some())
    }
}

impl<S: PageSource, L: LogPageSource, Q: SignalStackProbe> Drop for StackContext<S, L, Q> {
    fn drop(&mut self) {
        self.on_thread_exit();
    }
}
