//! Tasks: a process's resources grouped under one pid — its threads, open
//! files, and address space.
//!
//! Grounded on `task.h`'s `task_s` and `tasks_mgr`.

use alloc::{sync::Arc, vec::Vec};

use snafu::Snafu;
use spin::Mutex;

use crate::{
    collections::{HandleMap, TaskId, ThreadId},
    memory::{
        pmm::{NoopTlbBackend, Pmm, TlbBackend},
        vmm::Vmm,
    },
};

/// Maximum resident threads per task, sizing [`Task`]'s thread table and order bitmap.
pub const TASK_MAX_THREADS: usize = 32;

/// Maximum open file descriptors per task.
pub const TASK_MAX_FDS: usize = 64;

/// Errors a task-lifecycle operation can fail with.
#[derive(Debug, Snafu)]
pub enum Error {
    /// No free pid remains in the task table.
    NoFreePid,
    /// The task's thread table is full.
    TooManyThreads,
    /// The task's fd table is full.
    TooManyOpenFiles,
    /// The given fd is not open.
    BadFd,
    /// The pid does not name a live task.
    NoSuchTask,
}

type Result<T> = core::result::Result<T, Error>;

/// A task's lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Resources allocated, not yet runnable (reserved pid, no threads yet).
    Building,
    /// Has at least one live thread.
    Running,
    /// Every thread has exited; awaiting reaping by its parent.
    Zombie,
}

/// An opened-file slot, grounding `fd_info_s`. The concrete file representation is left to the
/// caller (VFS layer); only the slot bookkeeping lives here.
pub struct OpenFile {
    pub mapper: crate::collections::MapperId,
    pub offset: u64,
    pub flags: u32,
}

/// A fixed-capacity, spinlock-guarded file-descriptor table.
pub struct FdTable {
    slots: Mutex<[Option<OpenFile>; TASK_MAX_FDS]>,
}

impl Default for FdTable {
    fn default() -> Self {
        Self::new()
    }
}

impl FdTable {
    #[must_use]
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(core::array::from_fn(|_| None)),
        }
    }

    /// Installs `file` at the lowest free fd, POSIX's usual allocation order.
    ///
    /// # Errors
    /// [`Error::TooManyOpenFiles`] if every slot is occupied.
    pub fn install(&self, file: OpenFile) -> Result<usize> {
        let mut slots = self.slots.lock();
        let fd = slots
            .iter()
            .position(Option::is_none)
            .ok_or(Error::TooManyOpenFiles)?;
        slots[fd] = Some(file);
        Ok(fd)
    }

    /// Closes `fd`, returning the descriptor that was there.
    ///
    /// # Errors
    /// [`Error::BadFd`] if nothing is open at `fd`.
    pub fn close(&self, fd: usize) -> Result<OpenFile> {
        self.slots
            .lock()
            .get_mut(fd)
            .and_then(Option::take)
            .ok_or(Error::BadFd)
    }
}

/// A bitmap tracking which of `[0, TASK_MAX_THREADS)` thread-table orders are in use, mirroring
/// `bitmap`/`next_order`/`max_order` from the original.
#[derive(Default)]
struct OrderBitmap {
    used: u32,
}

impl OrderBitmap {
    fn alloc(&mut self) -> Option<usize> {
        let free = (!self.used).trailing_zeros() as usize;
        if free >= TASK_MAX_THREADS {
            return None;
        }
        self.used |= 1 << free;
        Some(free)
    }

    fn free(&mut self, order: usize) {
        self.used &= !(1 << order);
    }
}

/// A user-space process.
pub struct Task<B: TlbBackend = NoopTlbBackend> {
    pub pid: TaskId,
    pub uid: u32,
    pub gid: u32,
    state: Mutex<State>,
    pub parent: Option<TaskId>,
    children: Mutex<Vec<TaskId>>,
    threads: Mutex<[Option<ThreadId>; TASK_MAX_THREADS]>,
    order_bitmap: Mutex<OrderBitmap>,
    pub fd_table: FdTable,
    pub vmm: Mutex<Vmm>,
    pub pmm: Mutex<Pmm<B>>,
}

impl<B: TlbBackend> Task<B> {
    #[must_use]
    fn new(pid: TaskId, parent: Option<TaskId>, uid: u32, gid: u32) -> Self {
        Self {
            pid,
            uid,
            gid,
            state: Mutex::new(State::Building),
            parent,
            children: Mutex::new(Vec::new()),
            threads: Mutex::new(core::array::from_fn(|_| None)),
            order_bitmap: Mutex::new(OrderBitmap::default()),
            fd_table: FdTable::new(),
            vmm: Mutex::new(Vmm::new()),
            pmm: Mutex::new(Pmm::new()),
        }
    }

    #[must_use]
    pub fn state(&self) -> State {
        *self.state.lock()
    }

    pub fn set_state(&self, state: State) {
        *self.state.lock() = state;
    }

    /// Reserves the next free thread-table order and records `thread` there.
    ///
    /// # Errors
    /// [`Error::TooManyThreads`] if the table is full.
    pub fn attach_thread(&self, thread: ThreadId) -> Result<usize> {
        let mut bitmap = self.order_bitmap.lock();
        let order = bitmap.alloc().ok_or(Error::TooManyThreads)?;
        self.threads.lock()[order] = Some(thread);
        Ok(order)
    }

    /// Clears the thread-table slot at `order`, freeing it for reuse. Returns whether this was
    /// the task's last thread (the caller should then tear the task down).
    pub fn detach_thread(&self, order: usize) -> bool {
        self.threads.lock()[order] = None;
        self.order_bitmap.lock().free(order);
        self.threads.lock().iter().all(Option::is_none)
    }

    pub fn add_child(&self, child: TaskId) {
        self.children.lock().push(child);
    }

    #[must_use]
    pub fn children(&self) -> Vec<TaskId> {
        self.children.lock().clone()
    }

    /// `do_fork`'s address-space half: clones `self`'s region list into `child` and marks every
    /// present page `COW`/`!WRITE` in both page tables, so the first write on either side pays
    /// for its own copy. `child` must be a freshly built task with an empty VMM/PMM.
    pub fn fork_address_space(&self, child: &Self, page_size: usize) {
        let parent_vmm = self.vmm.lock();
        let parent_pmm = self.pmm.lock();
        let child_pmm = child.pmm.lock();
        let child_regions = parent_vmm.fork(&parent_pmm, &child_pmm, page_size);
        *child.vmm.lock() = child_regions;
    }
}

/// The kernel's dense pid table: a `HandleMap` over a reservation cell so a
/// concurrent looker never observes a half-built task (`task_pid_alloc`'s
/// `NULL | BUSY | task` three-state invariant, collapsed here to "absent"
/// vs. "reserved, `None`" vs. "ready, `Some`").
pub struct TaskManager<B: TlbBackend = NoopTlbBackend> {
    tasks: HandleMap<Mutex<Option<Arc<Task<B>>>>>,
}

impl<B: TlbBackend> TaskManager<B> {
    #[must_use]
    pub fn new(max_tasks: crate::collections::Handle) -> Self {
        Self {
            tasks: HandleMap::new(max_tasks),
        }
    }

    /// Reserves a pid (the `BUSY` step) and builds the task behind it, making it visible to
    /// lookups only once fully constructed.
    ///
    /// # Errors
    /// [`Error::NoFreePid`] if the table is full.
    pub fn create(&self, parent: Option<TaskId>, uid: u32, gid: u32) -> Result<Arc<Task<B>>> {
        let reservation = Arc::new(Mutex::new(None));
        let handle = self
            .tasks
            .insert(reservation.clone())
            .map_err(|_| Error::NoFreePid)?;
        let task = Arc::new(Task::new(TaskId::from_raw(handle), parent, uid, gid));
        *reservation.lock() = Some(task.clone());
        Ok(task)
    }

    /// Looks up a live task by pid. Returns `None` both when the pid was never issued and while a
    /// concurrent `create` still has it reserved.
    #[must_use]
    pub fn get(&self, pid: TaskId) -> Option<Arc<Task<B>>> {
        self.tasks.get(pid.raw())?.lock().clone()
    }

    /// Removes a task once it has become a zombie with no remaining references.
    pub fn remove(&self, pid: TaskId) {
        self.tasks.remove(pid.raw());
    }

    /// `do_fork`: builds a child task under `parent` sharing its uid/gid, then clones `parent`'s
    /// address space into it via [`Task::fork_address_space`]. The child starts in
    /// [`State::Building`]; the caller still owes it a `thread_dup`'d initial thread
    /// ([`super::thread::Thread::create`]) and a `sched_add_created` before it is runnable.
    ///
    /// # Errors
    /// [`Error::NoFreePid`] if the task table is full.
    pub fn fork(&self, parent: &Arc<Task<B>>, page_size: usize) -> Result<Arc<Task<B>>> {
        let child = self.create(Some(parent.pid), parent.uid, parent.gid)?;
        parent.fork_address_space(&child, page_size);
        parent.add_child(child.pid);
        Ok(child)
    }

    /// `task_destroy`: called once a task's last thread has exited (its [`State`] must already be
    /// [`State::Zombie`]) and its parent has reaped it; removes it from the pid table.
    pub fn destroy(&self, task: &Arc<Task<B>>) {
        debug_assert_eq!(task.state(), State::Zombie);
        self.remove(task.pid);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_and_lookup() {
        let mgr = TaskManager::new(16);
        let task = mgr.create(None, 0, 0).unwrap();
        assert_eq!(mgr.get(task.pid).unwrap().pid, task.pid);
    }

    #[test]
    fn thread_attach_and_detach_tracks_last_thread() {
        let mgr = TaskManager::new(16);
        let task = mgr.create(None, 0, 0).unwrap();
        let order = task.attach_thread(ThreadId::from_raw(5)).unwrap();
        assert!(!task.detach_thread(order));
        // Attaching again after detach reuses the freed order and reports "last thread" once
        // detached with nothing else attached.
        let order2 = task.attach_thread(ThreadId::from_raw(6)).unwrap();
        assert!(task.detach_thread(order2));
    }

    #[test]
    fn fd_table_install_and_close() {
        let table = FdTable::new();
        let fd = table
            .install(OpenFile {
                mapper: crate::collections::MapperId::from_raw(0),
                offset: 0,
                flags: 0,
            })
            .unwrap();
        assert_eq!(fd, 0);
        table.close(fd).unwrap();
        assert!(matches!(table.close(fd), Err(Error::BadFd)));
    }

    #[test]
    fn remove_makes_task_unreachable() {
        let mgr = TaskManager::new(16);
        let task = mgr.create(None, 0, 0).unwrap();
        mgr.remove(task.pid);
        assert!(mgr.get(task.pid).is_none());
    }

    #[test]
    fn fork_clones_regions_and_marks_both_sides_cow() {
        use crate::memory::{pmm::PteAttr, vmm::RegionFlags, vmm::RegionKind};

        let mgr = TaskManager::new(16);
        let parent = mgr.create(None, 1, 1).unwrap();
        parent
            .vmm
            .lock()
            .add_region(0x1000, 0x1000, RegionKind::Anon, RegionFlags::PRIVATE, true)
            .unwrap();
        parent
            .pmm
            .lock()
            .set_page(1, 0x42, PteAttr::PRESENT | PteAttr::WRITE)
            .unwrap();

        let child = mgr.fork(&parent, 4096).unwrap();

        assert_eq!(child.parent, Some(parent.pid));
        assert_eq!(parent.children(), alloc::vec![child.pid]);
        assert!(child.vmm.lock().find_region(0x1000).is_some());
        for task in [&parent, &child] {
            let entry = task.pmm.lock().get_page(1);
            assert!(entry.attrs().contains(PteAttr::COW));
            assert!(!entry.attrs().contains(PteAttr::WRITE));
        }
    }

    #[test]
    fn destroy_removes_a_zombie_task() {
        let mgr = TaskManager::new(16);
        let task = mgr.create(None, 0, 0).unwrap();
        task.set_state(State::Zombie);
        mgr.destroy(&task);
        assert!(mgr.get(task.pid).is_none());
    }
}
