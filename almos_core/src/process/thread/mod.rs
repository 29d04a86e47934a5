//! Threads: the unit of scheduling. A thread belongs to at most one task
//! and runs on exactly one CPU at a time.

pub mod completion;
pub mod event;
pub mod scheduler;

use alloc::sync::Arc;
#[cfg(test)]
use mockall::automock;

use crate::{
    collections::{TaskId, ThreadId},
    dqdt::{self, MeshCoord, Node, Xorshift32},
    memory::pmm::TlbBackend,
};

use super::task::{Error as TaskError, Task};
use completion::Completion;

/// The round-robin scheduler implementation; re-exported for callers that don't need the
/// submodule path.
pub use scheduler::RoundRobinScheduler;

/// Id type re-exported for callers that only need the thread identity.
pub type Id = ThreadId;

/// A thread's position in its lifecycle, mirroring the original's
/// `S_CREATED/S_READY/S_RUNNING/S_BLOCKED/S_DEAD` states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Allocated but not yet handed to the scheduler.
    Created,
    /// On a run queue, waiting for a CPU.
    Ready,
    /// Currently executing on its CPU.
    Running,
    /// Parked on a wait queue; not runnable until woken.
    Blocked,
    /// Finished; resources not yet reclaimed by [`super::thread_destroy`](super).
    Dead,
}

/// Whether a thread is scheduled ahead of (kernel) or behind (user) other
/// ready threads of the same priority class, per §4.5.1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    /// A kernel worker (e.g. the event-manager thread); prepended to its run queue.
    Kernel,
    /// A user thread; appended to its run queue.
    User,
}

/// A single thread of execution in a user-space process.
pub struct Thread {
    id: ThreadId,
    task: Option<TaskId>,
    kind: Kind,
    state: spin::Mutex<State>,
    /// Pending-signal bitmap, ORed into by `signal_rise` under the thread lock (§4.8).
    sig_pending: core::sync::atomic::AtomicU32,
    /// Remaining ticks in the current quantum (`RR_QUANTUM` at dispatch).
    quantum: core::sync::atomic::AtomicU32,
}

impl Thread {
    /// Creates a fresh thread in [`State::Created`].
    #[must_use]
    pub fn new(id: ThreadId, task: Option<TaskId>, kind: Kind) -> Self {
        Self {
            id,
            task,
            kind,
            state: spin::Mutex::new(State::Created),
            sig_pending: core::sync::atomic::AtomicU32::new(0),
            quantum: core::sync::atomic::AtomicU32::new(crate::config::RR_QUANTUM),
        }
    }

    #[must_use]
    pub fn id(&self) -> ThreadId {
        self.id
    }

    #[must_use]
    pub fn task(&self) -> Option<TaskId> {
        self.task
    }

    #[must_use]
    pub fn kind(&self) -> Kind {
        self.kind
    }

    #[must_use]
    pub fn state(&self) -> State {
        *self.state.lock()
    }

    pub fn set_state(&self, state: State) {
        *self.state.lock() = state;
    }

    /// `rr_clock`'s quantum countdown: decrements the remaining ticks and reports whether the
    /// quantum just expired (caller should set `TH_NEED_TO_SCHED`-equivalent).
    pub fn tick(&self) -> bool {
        use core::sync::atomic::Ordering::AcqRel;
        let prev = self.quantum.fetch_update(AcqRel, AcqRel, |q| {
            Some(if q == 0 { crate::config::RR_QUANTUM - 1 } else { q - 1 })
        });
        matches!(prev, Ok(0))
    }

    pub fn reset_quantum(&self) {
        self.quantum
            .store(crate::config::RR_QUANTUM, core::sync::atomic::Ordering::Release);
    }

    /// Raises signal `sig` (0..32) on this thread; `signal_rise` ORs it into `sig_state`.
    pub fn raise_signal(&self, sig: u8) {
        debug_assert!(sig < 32);
        self.sig_pending
            .fetch_or(1 << sig, core::sync::atomic::Ordering::AcqRel);
    }

    /// The lowest-numbered pending signal, cleared; `signal_notify`'s selection step.
    pub fn take_lowest_signal(&self) -> Option<u8> {
        use core::sync::atomic::Ordering::AcqRel;
        let bits = self.sig_pending.load(AcqRel);
        if bits == 0 {
            return None;
        }
        let sig = bits.trailing_zeros() as u8;
        self.sig_pending.fetch_and(!(1 << sig), AcqRel);
        Some(sig)
    }

    /// `do_thread_create`: reserves the next free thread-table order on `task` and builds a
    /// fresh thread in [`State::Created`]. The returned order is the caller's to remember — it
    /// is needed again by [`Self::destroy`]. The thread is not yet runnable; the caller still
    /// owes it a `sched_add_created` on whichever CPU's run queue it lands on.
    ///
    /// # Errors
    /// [`TaskError::TooManyThreads`] if `task`'s thread table is full.
    pub fn create<B: TlbBackend>(
        id: ThreadId,
        task: &Arc<Task<B>>,
        kind: Kind,
    ) -> core::result::Result<(Arc<Thread>, usize), TaskError> {
        let order = task.attach_thread(id)?;
        Ok((Arc::new(Thread::new(id, Some(task.pid), kind)), order))
    }

    /// `thread_destroy`: the thread must already be [`State::Dead`] (joined, if joinable).
    /// Clears `task`'s thread-table slot at `order` and reports whether this was the task's
    /// last thread, so the caller knows to follow up with [`super::task::TaskManager::destroy`].
    pub fn destroy<B: TlbBackend>(&self, task: &Task<B>, order: usize) -> bool {
        debug_assert_eq!(self.state(), State::Dead);
        task.detach_thread(order)
    }

    /// `thread_migrate`: asks the DQDT for a less-loaded cluster to relocate this thread to. If
    /// one exists, returns a [`MigrationRequest`] for the caller to dispatch as an
    /// `E_MIGRATE`-priority remote event and await via [`Completion::wait`] — replacing the
    /// original's `while info.isDone == false { sched_yield() }` spin (§4.5.2). `None` is the
    /// `EAGAIN` case: the DQDT found nowhere better, so the thread stays put.
    #[must_use]
    pub fn migrate(
        start: &Arc<Node>,
        path_to_root: &[&Arc<Node>],
        rng: &mut Xorshift32,
    ) -> Option<MigrationRequest> {
        let target = dqdt::thread_migrate(start, path_to_root, rng)?;
        Some(MigrationRequest {
            target,
            completion: Completion::new(),
        })
    }
}

/// What a remote `E_MIGRATE` handler reports back through a [`MigrationRequest::completion`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrateOutcome {
    /// The target cluster allocated a copy; the original thread can be torn down.
    Migrated,
    /// The target cluster could not accept the thread; the original stays where it is.
    Rejected,
}

/// A pending migration: the DQDT-chosen target and the single-slot rendezvous the remote
/// handler signals once it has copied (or refused) the thread.
pub struct MigrationRequest {
    pub target: MeshCoord,
    pub completion: Completion<MigrateOutcome>,
}

/// Abstract scheduler policy.
#[cfg_attr(test, automock)]
pub trait Scheduler: Sync {
    /// Get the currently running thread.
    fn current_thread(&self) -> Arc<Thread>;

    /// Update the thread scheduler for a new time slice,
    /// potentially updating the currently running thread.
    fn next_time_slice(&self);
}

/// Abstract thread switching mechanism.
#[cfg_attr(test, automock)]
pub trait Switcher {
    /// Save the current EL0 thread state into `thread`.
    ///
    /// # Safety
    /// Must be called with interrupts disabled and `thread` not concurrently accessed.
    unsafe fn save_thread_state(thread: &Thread);

    /// Restore the state of `thread` into the current EL0 thread state.
    ///
    /// # Safety
    /// Must be called with interrupts disabled and `thread` not concurrently accessed.
    unsafe fn restore_thread_state(thread: &Thread);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_thread_is_created() {
        let t = Thread::new(ThreadId::from_raw(0), None, Kind::User);
        assert_eq!(t.state(), State::Created);
    }

    #[test]
    fn signal_raise_and_take_lowest() {
        let t = Thread::new(ThreadId::from_raw(0), None, Kind::User);
        t.raise_signal(5);
        t.raise_signal(2);
        assert_eq!(t.take_lowest_signal(), Some(2));
        assert_eq!(t.take_lowest_signal(), Some(5));
        assert_eq!(t.take_lowest_signal(), None);
    }

    #[test]
    fn quantum_expires_after_rr_quantum_ticks() {
        let t = Thread::new(ThreadId::from_raw(0), None, Kind::Kernel);
        let mut expired = false;
        for _ in 0..crate::config::RR_QUANTUM {
            expired = t.tick();
        }
        assert!(expired);
    }

    #[test]
    fn create_attaches_to_the_task_thread_table() {
        use crate::process::task::TaskManager;

        let mgr = TaskManager::new(4);
        let task = mgr.create(None, 0, 0).unwrap();
        let (thread, order) = Thread::create(ThreadId::from_raw(1), &task, Kind::User).unwrap();
        assert_eq!(thread.state(), State::Created);
        assert_eq!(thread.task(), Some(task.pid));
        assert!(thread.destroy(&task, order));
    }

    #[test]
    fn create_fails_once_the_thread_table_is_full() {
        use crate::process::task::{TaskManager, TASK_MAX_THREADS};

        let mgr = TaskManager::new(4);
        let task = mgr.create(None, 0, 0).unwrap();
        for i in 0..TASK_MAX_THREADS {
            Thread::create(ThreadId::from_raw(i as u32), &task, Kind::User).unwrap();
        }
        let result = Thread::create(ThreadId::from_raw(99), &task, Kind::User);
        assert!(matches!(result, Err(TaskError::TooManyThreads)));
    }

    #[test]
    fn migrate_returns_none_when_dqdt_has_nowhere_better() {
        let overloaded = Arc::new(Node::leaf(MeshCoord::default()));
        overloaded.set_leaf_summary(dqdt::Summary {
            utilization: 100,
            thread_count: u32::MAX,
            ..dqdt::Summary::empty()
        });
        let mut rng = Xorshift32::new(1);
        assert!(Thread::migrate(&overloaded, &[], &mut rng).is_none());
    }

    #[test]
    fn migrate_returns_a_request_with_a_fresh_completion() {
        let busy = {
            let node = Node::leaf(MeshCoord { x: 0, y: 0 });
            node.set_leaf_summary(dqdt::Summary {
                utilization: 90,
                ..dqdt::Summary::empty()
            });
            Arc::new(node)
        };
        let idle = {
            let node = Node::leaf(MeshCoord { x: 3, y: 0 });
            node.set_leaf_summary(dqdt::Summary {
                utilization: 5,
                ..dqdt::Summary::empty()
            });
            Arc::new(node)
        };
        let root = Arc::new(Node::internal(alloc::vec![busy, idle]));
        let mut rng = Xorshift32::new(2);
        let request = Thread::migrate(&root, &[], &mut rng).unwrap();
        assert_eq!(request.target, MeshCoord { x: 3, y: 0 });
        request.completion.signal(MigrateOutcome::Migrated);
        assert_eq!(
            request.completion.wait(|| unreachable!()),
            MigrateOutcome::Migrated
        );
    }
}
