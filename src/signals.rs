//! Signal masking and alternate signal stack queries for the stack
//! allocator.
//!
//! A signal handler running on the same thread can call into the stack
//! allocator while an ordinary call is halfway through updating it, so every
//! update happens inside a [`MaskedRegion`].

use core::mem::MaybeUninit;
use core::ptr;

use crate::os::{self, MapError};

/// All signals blocked on the current thread until this is dropped, at
/// which point the previous mask is put back.
pub struct MaskedRegion {
    previous: libc::sigset_t,
}

impl MaskedRegion {
    pub fn enter() -> MaskedRegion {
        unsafe {
            let mut full = MaybeUninit::<libc::sigset_t>::uninit();
            let mut previous = MaybeUninit::<libc::sigset_t>::uninit();
            libc::sigfillset(full.as_mut_ptr());
            let rc = libc::pthread_sigmask(libc::SIG_SETMASK, full.as_ptr(), previous.as_mut_ptr());
            // pthread_sigmask only fails for an invalid `how`.
            debug_assert_eq!(rc, 0);
            MaskedRegion {
                previous: previous.assume_init(),
            }
        }
    }
}

impl Drop for MaskedRegion {
    fn drop(&mut self) {
        let rc = unsafe { libc::pthread_sigmask(libc::SIG_SETMASK, &self.previous, ptr::null_mut()) };
        debug_assert_eq!(rc, 0);
    }
}

/// A snapshot of the thread's alternate signal stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AltStack {
    pub base: usize,
    pub size: usize,
    /// Whether the thread is executing on this stack right now.
    pub active: bool,
}

impl AltStack {
    /// Whether `other` describes the same stack memory.
    pub fn same_stack(&self, other: &AltStack) -> bool {
        self.base == other.base && self.size == other.size
    }
}

/// Tells the stack allocator whether it is running on the alternate signal
/// stack.
pub trait SignalStackProbe {
    fn current(&mut self) -> Result<AltStack, MapError>;
}

/// Asks the kernel through `sigaltstack`.
#[derive(Default, Debug, Clone, Copy)]
pub struct SystemSignalStack;

impl SignalStackProbe for SystemSignalStack {
    fn current(&mut self) -> Result<AltStack, MapError> {
        let mut ss = MaybeUninit::<libc::stack_t>::uninit();
        if unsafe { libc::sigaltstack(ptr::null(), ss.as_mut_ptr()) } < 0 {
            return Err(MapError::SignalStack(errno::errno()));
        }
        let ss = unsafe { ss.assume_init() };
        Ok(AltStack {
            base: ss.ss_sp as usize,
            size: ss.ss_size,
            active: ss.ss_flags & libc::SS_ONSTACK != 0,
        })
    }
}

/// Query the real alternate stack, aborting if the kernel refuses.
pub fn current_alt_stack() -> AltStack {
    os::or_abort(SystemSignalStack.current())
}

#[cfg(test)]
mod tests {
    use super::*;

    use test_log::test;

    fn blocked() -> libc::sigset_t {
        unsafe {
            let mut set = MaybeUninit::<libc::sigset_t>::uninit();
            libc::pthread_sigmask(libc::SIG_SETMASK, ptr::null(), set.as_mut_ptr());
            set.assume_init()
        }
    }

    #[test]
    fn mask_is_restored_on_drop() {
        let before = unsafe { libc::sigismember(&blocked(), libc::SIGUSR1) };
        {
            let _masked = MaskedRegion::enter();
            assert_eq!(unsafe { libc::sigismember(&blocked(), libc::SIGUSR1) }, 1);
        }
        assert_eq!(unsafe { libc::sigismember(&blocked(), libc::SIGUSR1) }, before);
    }

    #[test]
    fn mask_is_restored_on_panic() {
        let before = unsafe { libc::sigismember(&blocked(), libc::SIGUSR2) };
        let result = std::panic::catch_unwind(|| {
            let _masked = MaskedRegion::enter();
            panic!("inside the masked region");
        });
        assert!(result.is_err());
        assert_eq!(unsafe { libc::sigismember(&blocked(), libc::SIGUSR2) }, before);
    }

    #[test]
    fn ordinary_code_is_not_on_the_alt_stack() {
        assert!(!current_alt_stack().active);
    }
}
