//! The stack allocator's log.
//!
//! The log records, in order, everything a [`StackContext`] has done:
//! trampolines handed out on behalf of a frame, page pairs switched in, log
//! pages chained on, and entry onto the signal stack. Replaying it backward
//! undoes those actions.
//!
//! Entries are stored as two machine words, so a page holds `LOG_ENTRIES` of
//! them, and are decoded into a [`LogEntry`] when read:
//!
//! | action | data                 | entry                       |
//! |--------|----------------------|-----------------------------|
//! | 0      | previous log page    | [`LogEntry::NewLog`]        |
//! | 1      | previous page pair   | [`LogEntry::NewPage`]       |
//! | 2      | unused               | [`LogEntry::SigStack`]      |
//! | CFA    | trampoline count     | [`LogEntry::Frame`]         |
//!
//! [`StackContext`]: super::StackContext

use core::fmt;
use core::ptr::NonNull;

use static_assertions::const_assert;

use crate::geometry::{LOG_ENTRIES, PAGE_SIZE};
use crate::os::{self, MapError};

const ACTION_NEW_LOG: usize = 0;
const ACTION_NEW_PAGE: usize = 1;
const ACTION_SIGSTACK: usize = 2;

/// A decoded log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogEntry {
    /// A fresh log page was started; the payload is the page before it.
    /// Always the first entry of any log page but the oldest.
    NewLog(NonNull<LogPage>),
    /// A fresh page pair replaced the one given, if there was one.
    NewPage(Option<NonNull<u8>>),
    /// Execution moved onto the alternate signal stack.
    SigStack,
    /// `count` trampolines were handed out for the frame at `cfa`.
    Frame { cfa: usize, count: usize },
}

/// The stored form of a [`LogEntry`].
#[derive(Clone, Copy, PartialEq, Eq, Default)]
#[repr(C)]
pub struct RawEntry {
    action: usize,
    data: usize,
}

impl RawEntry {
    pub fn decode(&self) -> LogEntry {
        match self.action {
            ACTION_NEW_LOG => LogEntry::NewLog(
                NonNull::new(self.data as *mut LogPage).expect("log page chain is broken"),
            ),
            ACTION_NEW_PAGE => LogEntry::NewPage(NonNull::new(self.data as *mut u8)),
            ACTION_SIGSTACK => LogEntry::SigStack,
            cfa => LogEntry::Frame {
                cfa,
                count: self.data,
            },
        }
    }
}

impl From<LogEntry> for RawEntry {
    fn from(entry: LogEntry) -> RawEntry {
        let (action, data) = match entry {
            LogEntry::NewLog(prev) => (ACTION_NEW_LOG, prev.as_ptr() as usize),
            LogEntry::NewPage(prev) => (
                ACTION_NEW_PAGE,
                prev.map_or(0, |p| p.as_ptr() as usize),
            ),
            LogEntry::SigStack => (ACTION_SIGSTACK, 0),
            LogEntry::Frame { cfa, count } => {
                assert!(cfa > ACTION_SIGSTACK, "{:#x} is not a frame address", cfa);
                (cfa, count)
            }
        };
        RawEntry { action, data }
    }
}

impl fmt::Debug for RawEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.decode())
    }
}

/// One page of log entries, oldest first.
#[repr(C)]
pub struct LogPage {
    entries: [RawEntry; LOG_ENTRIES],
}

const_assert!(core::mem::size_of::<LogPage>() == PAGE_SIZE);

/// Where log pages come from.
pub trait LogPageSource {
    /// Produce a fresh, writable log page.
    fn acquire_log(&mut self) -> Result<NonNull<LogPage>, MapError>;

    /// Give a log page back.
    ///
    /// # Safety
    ///
    /// `page` must have come from `acquire_log` on this source and must not
    /// be used again.
    unsafe fn release_log(&mut self, page: NonNull<LogPage>) -> Result<(), MapError>;
}

/// Log pages straight from anonymous `mmap`.
#[derive(Default, Debug, Clone, Copy)]
pub struct AnonymousPages;

impl LogPageSource for AnonymousPages {
    fn acquire_log(&mut self) -> Result<NonNull<LogPage>, MapError> {
        let page = os::map_anonymous(PAGE_SIZE)?;
        log::debug!("mapped log page at {:?}", page);
        Ok(page.cast())
    }

    unsafe fn release_log(&mut self, page: NonNull<LogPage>) -> Result<(), MapError> {
        log::debug!("unmapping log page at {:?}", page);
        os::unmap(page.cast(), PAGE_SIZE)
    }
}

/// The tail of a chain of log pages.
pub struct Log {
    page: Option<NonNull<LogPage>>,
    in_use: usize,
}

impl Default for Log {
    fn default() -> Self {
        Self::new()
    }
}

impl Log {
    pub const fn new() -> Self {
        Log {
            page: None,
            in_use: 0,
        }
    }

    /// Whether appending needs a fresh page first.
    pub fn is_full(&self) -> bool {
        self.page.is_none() || self.in_use == LOG_ENTRIES
    }

    /// Entries used in the newest page.
    pub fn len(&self) -> usize {
        self.in_use
    }

    pub fn is_empty(&self) -> bool {
        self.in_use == 0
    }

    /// Chain `fresh` onto the log. Every page but the first starts with a
    /// [`LogEntry::NewLog`] pointing back at its predecessor; the first one
    /// is handed back with [`take`](Log::take) once it runs empty.
    pub fn start_page(&mut self, fresh: NonNull<LogPage>) {
        debug_assert!(self.is_full());
        let prev = self.page.replace(fresh);
        self.in_use = 0;
        if let Some(prev) = prev {
            self.push(LogEntry::NewLog(prev));
        }
    }

    pub fn push(&mut self, entry: LogEntry) {
        let page = self.page.expect("appending to a log with no page");
        assert!(self.in_use < LOG_ENTRIES, "appending to a full log page");
        unsafe { (*page.as_ptr()).entries[self.in_use] = entry.into() };
        self.in_use += 1;
    }

    /// The newest entry.
    pub fn last(&self) -> Option<LogEntry> {
        self.tail().map(|raw| raw.decode())
    }

    fn tail(&self) -> Option<&RawEntry> {
        let page = self.page?;
        if self.in_use == 0 {
            return None;
        }
        Some(unsafe { &(*page.as_ptr()).entries[self.in_use - 1] })
    }

    /// Add one trampoline to the newest entry, which must be a
    /// [`LogEntry::Frame`] for `cfa`.
    pub fn extend_frame(&mut self, cfa: usize) {
        let page = match self.page {
            Some(page) if self.in_use > 0 => page,
            _ => panic!("no frame to extend for {:#x}: the log is empty", cfa),
        };
        let tail = unsafe { &mut (*page.as_ptr()).entries[self.in_use - 1] };
        match tail.decode() {
            LogEntry::Frame { cfa: logged, .. } if logged == cfa => tail.data += 1,
            other => panic!("log tail {:?} does not belong to frame {:#x}", other, cfa),
        }
    }

    /// Drop the newest entry.
    pub fn pop(&mut self) {
        assert!(self.in_use > 0, "popping an empty log page");
        self.in_use -= 1;
    }

    /// Step back from a page whose only remaining entry is its `NewLog`,
    /// returning the abandoned page.
    pub fn retreat(&mut self, prev: NonNull<LogPage>) -> NonNull<LogPage> {
        debug_assert_eq!(self.in_use, 1);
        let done = self
            .page
            .replace(prev)
            .expect("retreating from a log with no page");
        self.in_use = LOG_ENTRIES;
        done
    }

    /// Detach the current page, leaving the log empty.
    pub fn take(&mut self) -> Option<NonNull<LogPage>> {
        self.in_use = 0;
        self.page.take()
    }

    /// Number of chained pages.
    pub fn pages(&self) -> usize {
        if self.page.is_none() {
            return 0;
        }
        1 + self
            .iter()
            .filter(|e| matches!(e, LogEntry::NewLog(_)))
            .count()
    }

    /// Every entry, newest first.
    pub fn iter(&self) -> LogIter<'_> {
        LogIter {
            page: self.page,
            index: self.in_use,
            _log: core::marker::PhantomData,
        }
    }
}

impl fmt::Debug for Log {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.iter()).finish()
    }
}

/// Walks a [`Log`] from its newest entry to its oldest.
pub struct LogIter<'log> {
    page: Option<NonNull<LogPage>>,
    index: usize,
    _log: core::marker::PhantomData<&'log Log>,
}

impl<'log> Iterator for LogIter<'log> {
    type Item = LogEntry;

    fn next(&mut self) -> Option<LogEntry> {
        let page = self.page?;
        if self.index == 0 {
            self.page = None;
            return None;
        }
        self.index -= 1;
        let entry = unsafe { (*page.as_ptr()).entries[self.index] }.decode();
        if let LogEntry::NewLog(prev) = entry {
            self.page = Some(prev);
            self.index = LOG_ENTRIES;
        }
        Some(entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use test_log::test;

    use crate::pages::ToyPages;

    #[test]
    fn entries_decode_to_what_was_stored() {
        let mut toy = ToyPages::new();
        let mut log = Log::new();
        log.start_page(toy.acquire_log().unwrap());

        let pair = NonNull::new(0x10000 as *mut u8);
        log.push(LogEntry::NewPage(None));
        log.push(LogEntry::NewPage(pair));
        log.push(LogEntry::SigStack);
        log.push(LogEntry::Frame {
            cfa: 0x7fff_0000,
            count: 3,
        });

        let all: std::vec::Vec<_> = log.iter().collect();
        assert_eq!(
            all,
            [
                LogEntry::Frame {
                    cfa: 0x7fff_0000,
                    count: 3
                },
                LogEntry::SigStack,
                LogEntry::NewPage(pair),
                LogEntry::NewPage(None),
            ]
        );
        assert_eq!(log.pages(), 1);

        unsafe { toy.release_log(log.take().unwrap()).unwrap() };
    }

    #[test]
    fn frames_extend_in_place() {
        let mut toy = ToyPages::new();
        let mut log = Log::new();
        log.start_page(toy.acquire_log().unwrap());

        log.push(LogEntry::Frame { cfa: 0x5000, count: 1 });
        log.extend_frame(0x5000);
        log.extend_frame(0x5000);
        assert_eq!(log.len(), 1);
        assert_eq!(log.last(), Some(LogEntry::Frame { cfa: 0x5000, count: 3 }));

        unsafe { toy.release_log(log.take().unwrap()).unwrap() };
    }

    #[test]
    #[should_panic(expected = "does not belong to frame")]
    fn extending_the_wrong_frame_panics() {
        let mut toy = ToyPages::new();
        let mut log = Log::new();
        log.start_page(toy.acquire_log().unwrap());
        log.push(LogEntry::Frame { cfa: 0x5000, count: 1 });
        log.extend_frame(0x4000);
    }

    #[test]
    fn pages_chain_back_through_new_log_entries() {
        let mut toy = ToyPages::new();
        let mut log = Log::new();

        for i in 0..LOG_ENTRIES + 5 {
            if log.is_full() {
                log.start_page(toy.acquire_log().unwrap());
            }
            log.push(LogEntry::Frame {
                cfa: 0x1000_0000 - i * 16,
                count: 1,
            });
        }

        assert_eq!(toy.logs_acquired, 2);
        assert_eq!(log.pages(), 2);
        // The second page holds its NewLog plus the five overflow frames.
        assert_eq!(log.len(), 6);
        let frames = log
            .iter()
            .filter(|e| matches!(e, LogEntry::Frame { .. }))
            .count();
        assert_eq!(frames, LOG_ENTRIES + 5);

        // Unwind back over the page boundary and hand both pages back.
        for _ in 0..5 {
            log.pop();
        }
        let prev = match log.last() {
            Some(LogEntry::NewLog(prev)) => prev,
            other => panic!("expected a NewLog at the page start, got {:?}", other),
        };
        let second = log.retreat(prev);
        assert_eq!(log.len(), LOG_ENTRIES);
        assert_eq!(log.pages(), 1);
        unsafe {
            toy.release_log(second).unwrap();
            toy.release_log(log.take().unwrap()).unwrap();
        }
        assert_eq!(toy.live_logs(), 0);
    }
}
