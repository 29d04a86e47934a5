//! Per-task signal dispositions and delivery.
//!
//! Grounded on `signal.c`: a fixed table of handler dispositions per signal
//! number, `signal_rise` ORing the target bit into each recipient thread's
//! pending mask, and `signal_notify` picking the lowest-numbered unmasked
//! pending signal on the syscall/IRQ return path.

use alloc::sync::Arc;

use spin::Mutex;

use crate::process::thread::Thread;

/// Unconditionally terminates the target task; always broadcasts, never masked.
pub const SIGKILL: u8 = 9;
/// Requests termination; broadcasts like `SIGKILL` but may be caught.
pub const SIGTERM: u8 = 15;
/// Raised on an unresolvable memory fault (`VMM_ESIGSEGV`).
pub const SIGSEGV: u8 = 11;
/// Raised on a mapper backing-store failure (`VMM_ESIGBUS`).
pub const SIGBUS: u8 = 7;
/// One past the highest signal number this kernel recognizes.
pub const NSIG: usize = 32;

/// A signal's disposition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Disposition {
    /// The kernel's default action (usually terminate).
    #[default]
    Default,
    /// Ignored entirely.
    Ignore,
    /// Delivered to user-space at `handler`.
    Handler(usize),
}

/// Per-task signal manager: holds the disposition table every thread in the task shares.
pub struct SignalManager {
    dispositions: Mutex<[Disposition; NSIG]>,
}

impl Default for SignalManager {
    fn default() -> Self {
        Self::new()
    }
}

impl SignalManager {
    #[must_use]
    pub fn new() -> Self {
        Self {
            dispositions: Mutex::new([Disposition::default(); NSIG]),
        }
    }

    #[must_use]
    pub fn disposition(&self, sig: u8) -> Disposition {
        self.dispositions.lock()[sig as usize]
    }

    /// `signal(sig, handler)`: installs a new disposition, returning the previous one.
    pub fn set_disposition(&self, sig: u8, disposition: Disposition) -> Disposition {
        core::mem::replace(&mut self.dispositions.lock()[sig as usize], disposition)
    }

    /// `signal_rise`: delivers `sig` to `targets`. `SIGKILL`/`SIGTERM` broadcast to every thread
    /// unconditionally; other signals are expected to be raised against a single designated
    /// thread (or any, the caller's choice of `targets`).
    pub fn rise(&self, sig: u8, targets: &[Arc<Thread>]) {
        for thread in targets {
            thread.raise_signal(sig);
        }
    }

    /// `signal_notify`: called on the return-to-user path for `thread`. Picks the
    /// lowest-numbered pending signal and resolves it against this task's dispositions.
    ///
    /// Returns `None` if nothing is pending or every pending signal is ignored, `Some(action)`
    /// describing what the caller (the trap-return path) must do.
    pub fn notify(&self, thread: &Thread) -> Option<Action> {
        loop {
            let sig = thread.take_lowest_signal()?;
            match self.disposition(sig) {
                Disposition::Ignore => continue,
                Disposition::Default => return Some(Action::KillSigaction(sig)),
                Disposition::Handler(addr) => return Some(Action::EnterTrampoline { sig, addr }),
            }
        }
    }
}

/// What `signal_notify` decided to do about the signal it picked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Run the kernel's default action (`kill_sigaction`); for most signals this performs
    /// `sys_thread_exit`.
    KillSigaction(u8),
    /// Hand control to a user trampoline at `addr` (`cpu_signal_notify`).
    EnterTrampoline { sig: u8, addr: usize },
}
