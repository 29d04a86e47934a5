//! A `pthread_barrier`-equivalent N-party rendezvous.
//!
//! Grounded in the scenario of multiple worker threads needing to
//! synchronize at a phase boundary: every `wait()` call but the last
//! blocks; the last arriver resets the phase and releases everyone else,
//! mirroring `PTHREAD_BARRIER_SERIAL_THREAD`.

use spin::Mutex;

/// What a [`Barrier::wait`] call returned to its caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BarrierWaitResult {
    /// This caller was the one that completed the phase; exactly one caller per phase sees this.
    SerialThread,
    /// This caller waited for another thread to complete the phase.
    Waited,
}

struct Phase {
    remaining: usize,
    generation: u64,
}

/// An N-party rendezvous barrier.
pub struct Barrier {
    count: usize,
    phase: Mutex<Phase>,
}

impl Barrier {
    /// Creates a barrier for `count` parties.
    ///
    /// # Panics
    /// If `count` is zero.
    #[must_use]
    pub fn new(count: usize) -> Self {
        assert!(count > 0, "a barrier needs at least one party");
        Self {
            count,
            phase: Mutex::new(Phase {
                remaining: count,
                generation: 0,
            }),
        }
    }

    /// Blocks until `count` callers have all called `wait`. `wait_fn` is invoked (possibly
    /// repeatedly) while this caller is not yet the last to arrive; in a real build it parks the
    /// calling thread via `sched_sleep` on the barrier's wait queue.
    pub fn wait(&self, mut wait_fn: impl FnMut()) -> BarrierWaitResult {
        let my_generation = {
            let mut phase = self.phase.lock();
            phase.remaining -= 1;
            if phase.remaining == 0 {
                phase.remaining = self.count;
                phase.generation += 1;
                return BarrierWaitResult::SerialThread;
            }
            phase.generation
        };

        loop {
            if self.phase.lock().generation != my_generation {
                return BarrierWaitResult::Waited;
            }
            wait_fn();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::sync::Arc;
    use core::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    #[should_panic(expected = "at least one party")]
    fn zero_parties_panics() {
        Barrier::new(0);
    }

    #[test]
    fn single_party_completes_immediately() {
        let barrier = Barrier::new(1);
        assert_eq!(barrier.wait(|| panic!("should not wait")), BarrierWaitResult::SerialThread);
    }

    #[test]
    fn exactly_one_caller_is_serial_thread() {
        let barrier = Arc::new(Barrier::new(3));
        let serial_count = Arc::new(AtomicUsize::new(0));

        std::thread::scope(|scope| {
            for _ in 0..3 {
                let barrier = barrier.clone();
                let serial_count = serial_count.clone();
                scope.spawn(move || {
                    let result = barrier.wait(|| std::thread::yield_now());
                    if result == BarrierWaitResult::SerialThread {
                        serial_count.fetch_add(1, Ordering::AcqRel);
                    }
                });
            }
        });

        assert_eq!(serial_count.load(Ordering::Acquire), 1);
    }

    #[test]
    fn barrier_is_reusable_across_phases() {
        let barrier = Arc::new(Barrier::new(2));
        for _ in 0..3 {
            let barrier = barrier.clone();
            std::thread::scope(|scope| {
                scope.spawn(|| barrier.wait(std::thread::yield_now));
                barrier.wait(std::thread::yield_now);
            });
        }
    }
}
