//! Round-robin thread scheduler implementation.
//!
//! Grounded on `rr-sched.c`: `RR_QUEUE_NR` priority classes per CPU, kernel
//! threads prepended to their queue and user threads appended
//! (`rr_wakeup`), and the outgoing thread re-queued before the next one is
//! popped (`rr_elect`).

use core::marker::PhantomData;

use alloc::{collections::VecDeque, sync::Arc, vec::Vec};
use arc_swap::ArcSwap;
use hashbrown::HashMap;
use spin::Mutex;

use super::{Kind, Scheduler, State, Thread};
use crate::{config::RR_QUEUE_NR, platform::cpu::{CpuIdReader, Id as CpuId}};

/// `RR_QUEUE_NR` priority classes, indexed highest-priority-first; class 0 is reserved for
/// kernel threads (matching the original's "kernel threads occupy the top class").
struct PriorityQueues {
    classes: [Mutex<VecDeque<Arc<Thread>>>; RR_QUEUE_NR],
}

impl PriorityQueues {
    fn new() -> Self {
        Self {
            classes: core::array::from_fn(|_| Mutex::new(VecDeque::new())),
        }
    }

    /// `rr_wakeup`: kernel threads go to the front of the top class, user threads to the back of
    /// the lowest class.
    fn push(&self, thread: Arc<Thread>) {
        let class = match thread.kind() {
            Kind::Kernel => 0,
            Kind::User => RR_QUEUE_NR - 1,
        };
        let mut queue = self.classes[class].lock();
        match thread.kind() {
            Kind::Kernel => queue.push_front(thread),
            Kind::User => queue.push_back(thread),
        }
    }

    /// Pops the next ready thread, scanning priority classes highest-first.
    fn pop_ready(&self) -> Option<Arc<Thread>> {
        for class in &self.classes {
            let mut queue = class.lock();
            let len = queue.len();
            for _ in 0..len {
                let Some(candidate) = queue.pop_front() else {
                    break;
                };
                if candidate.state() == State::Ready {
                    return Some(candidate);
                }
                queue.push_back(candidate);
            }
        }
        None
    }
}

/// A simple round-robin thread scheduler, one instance shared across all CPUs, with one
/// priority-queue set and current-thread slot per CPU.
pub struct RoundRobinScheduler<C: CpuIdReader> {
    queues: HashMap<CpuId, PriorityQueues>,
    current_threads: HashMap<CpuId, ArcSwap<Thread>>,
    cpu_id_reader: PhantomData<C>,
}

impl<C: CpuIdReader> RoundRobinScheduler<C> {
    /// Create a new scheduler.
    ///
    /// The vector `cpus` contains a set of CPU id, idle thread pairs for each core in the system.
    /// Each idle thread must be distinct, and will run first.
    /// The CPU ids must match those provided by [`CpuIdReader::current_cpu()`] given `C`.
    #[must_use]
    pub fn new(cpus: Vec<(CpuId, Arc<Thread>)>) -> Self {
        RoundRobinScheduler {
            queues: cpus.iter().map(|(id, _)| (*id, PriorityQueues::new())).collect(),
            current_threads: cpus
                .iter()
                .map(|(id, idle_thread)| {
                    idle_thread.set_state(State::Running);
                    (*id, ArcSwap::new(idle_thread.clone()))
                })
                .collect(),
            cpu_id_reader: PhantomData,
        }
    }

    /// `sched_add_created`: places a freshly created thread on its home CPU's run queue.
    pub fn add_created(&self, cpu: CpuId, thread: Arc<Thread>) {
        thread.set_state(State::Ready);
        self.queues.get(&cpu).expect("cpu has queue").push(thread);
    }

    /// `sched_wakeup`: re-inserts a blocked thread into the scheduler.
    pub fn wakeup(&self, cpu: CpuId, thread: Arc<Thread>) {
        thread.set_state(State::Ready);
        self.queues.get(&cpu).expect("cpu has queue").push(thread);
    }

    /// `sched_sleep`: parks the current thread; the caller is responsible for putting it on the
    /// appropriate wait queue before the next [`Scheduler::next_time_slice`] call.
    pub fn sleep(&self, cpu: CpuId) {
        self.current_threads
            .get(&cpu)
            .expect("cpu has current thread")
            .load()
            .set_state(State::Blocked);
    }
}

impl<C: CpuIdReader> Scheduler for RoundRobinScheduler<C> {
    fn current_thread(&self) -> Arc<Thread> {
        self.current_threads
            .get(&C::current_cpu())
            .expect("cpu has current thread")
            .load()
    }

    fn next_time_slice(&self) {
        let cpu_id = C::current_cpu();
        let queue = self.queues.get(&cpu_id).expect("cpu has queue");
        let current_slot = self
            .current_threads
            .get(&cpu_id)
            .expect("cpu has current thread");

        // rr_elect re-queues the outgoing thread, if still runnable, before electing the next one.
        let outgoing = current_slot.load();
        if outgoing.state() == State::Running {
            outgoing.set_state(State::Ready);
            queue.push(outgoing.clone());
        }

        if let Some(next_thread) = queue.pop_ready() {
            next_thread.set_state(State::Running);
            next_thread.reset_quantum();
            current_slot.swap(next_thread);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collections::ThreadId;

    struct FixedCpu;
    impl CpuIdReader for FixedCpu {
        fn current_cpu() -> CpuId {
            0
        }
    }

    fn thread(id: u32, kind: Kind) -> Arc<Thread> {
        Arc::new(Thread::new(ThreadId::from_raw(id), None, kind))
    }

    #[test]
    fn kernel_threads_run_before_user_threads() {
        let idle = thread(0, Kind::Kernel);
        let sched = RoundRobinScheduler::<FixedCpu>::new(alloc::vec![(0, idle)]);
        let user = thread(1, Kind::User);
        let kernel = thread(2, Kind::Kernel);
        sched.add_created(0, user.clone());
        sched.add_created(0, kernel.clone());

        sched.next_time_slice();
        assert_eq!(sched.current_thread().id(), kernel.id());
    }

    #[test]
    fn outgoing_running_thread_is_requeued() {
        let idle = thread(0, Kind::Kernel);
        let sched = RoundRobinScheduler::<FixedCpu>::new(alloc::vec![(0, idle.clone())]);
        let a = thread(1, Kind::User);
        sched.add_created(0, a.clone());

        sched.next_time_slice();
        assert_eq!(sched.current_thread().id(), a.id());

        sched.next_time_slice();
        // idle was requeued (still Running when it went out) and is the only other candidate.
        assert_eq!(sched.current_thread().id(), idle.id());
    }

    #[test]
    fn blocked_thread_is_not_elected() {
        let idle = thread(0, Kind::Kernel);
        let sched = RoundRobinScheduler::<FixedCpu>::new(alloc::vec![(0, idle.clone())]);
        let blocked = thread(1, Kind::User);
        blocked.set_state(State::Blocked);
        sched.queues.get(&0).unwrap().push(blocked);

        sched.next_time_slice();
        assert_eq!(sched.current_thread().id(), idle.id());
    }
}
