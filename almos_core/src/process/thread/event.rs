//! Per-CPU event listeners: the mechanism cross-cluster operations (fork,
//! remote thread create, migration, memory migrate) use to hand work to a
//! remote CPU without a central dispatcher.
//!
//! Grounded on `event.c`: each CPU owns a **local** listener (an array of
//! priority queues, handlers run with interrupts enabled) and a **remote**
//! listener (one lock-free queue per priority that other CPUs post into).
//! `EventManager::drain_remote_into_local` plus `run_local` is the body of
//! `thread_event_manager`'s loop.

use alloc::{boxed::Box, sync::Arc};

use crossbeam::queue::SegQueue;

/// Event priority classes, lowest first. `Func` and above never raise an IPI (§6's "Event
/// priorities").
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum Priority {
    Clk = 0,
    Chr = 1,
    Blk = 2,
    Migrate = 3,
    Create = 4,
    Fork = 5,
    Func = 6,
}

/// Number of priority classes, for sizing the per-priority queue arrays.
pub const PRIORITY_NR: usize = 7;

/// A unit of deferred work posted to a CPU's event listener.
pub struct Event {
    pub priority: Priority,
    handler: Box<dyn FnOnce() + Send>,
}

impl Event {
    #[must_use]
    pub fn new(priority: Priority, handler: impl FnOnce() + Send + 'static) -> Self {
        Self {
            priority,
            handler: Box::new(handler),
        }
    }

    fn run(self) {
        (self.handler)();
    }
}

/// One CPU's local and remote event listeners.
pub struct EventManager {
    local: [SegQueue<Event>; PRIORITY_NR],
    remote: [SegQueue<Event>; PRIORITY_NR],
}

impl Default for EventManager {
    fn default() -> Self {
        Self::new()
    }
}

impl EventManager {
    #[must_use]
    pub fn new() -> Self {
        Self {
            local: core::array::from_fn(|_| SegQueue::new()),
            remote: core::array::from_fn(|_| SegQueue::new()),
        }
    }

    /// Posts directly to this CPU's own local listener.
    pub fn post_local(&self, event: Event) {
        self.local[event.priority as usize].push(event);
    }

    /// Posts to this CPU's remote listener, as another CPU would. The sender is responsible for
    /// raising an IPI when `priority < Func`; that's a platform concern, not this module's.
    pub fn post_remote(&self, event: Event) {
        self.remote[event.priority as usize].push(event);
    }

    /// Moves every pending remote event into the local listener; the first half of
    /// `thread_event_manager`'s wake-up body.
    pub fn drain_remote_into_local(&self) {
        for priority in 0..PRIORITY_NR {
            while let Some(event) = self.remote[priority].pop() {
                self.local[priority].push(event);
            }
        }
    }

    /// Runs every pending local event, highest priority (numerically lowest) first; the second
    /// half of `thread_event_manager`'s wake-up body. A handler that posts a higher-priority
    /// local event causes it to run before the scan continues, matching the original's
    /// pre-emption-within-the-scan behavior, since the scan re-checks each priority's queue
    /// length freshly every pass.
    pub fn run_local(&self) {
        loop {
            let mut ran_any = false;
            for priority in 0..PRIORITY_NR {
                while let Some(event) = self.local[priority].pop() {
                    ran_any = true;
                    event.run();
                }
            }
            if !ran_any {
                break;
            }
        }
    }

    /// Whether either listener has pending work, the condition the event-manager thread sleeps
    /// on.
    #[must_use]
    pub fn has_pending(&self) -> bool {
        self.local.iter().any(|q| !q.is_empty()) || self.remote.iter().any(|q| !q.is_empty())
    }
}

/// Shared handle to a CPU's event manager, cloned into closures posted from other CPUs.
pub type SharedEventManager = Arc<EventManager>;

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::sync::Arc;
    use core::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn local_events_run_in_priority_order() {
        let mgr = EventManager::new();
        let order = Arc::new(spin::Mutex::new(alloc::vec::Vec::new()));
        let o1 = order.clone();
        let o2 = order.clone();
        mgr.post_local(Event::new(Priority::Func, move || o1.lock().push("func")));
        mgr.post_local(Event::new(Priority::Clk, move || o2.lock().push("clk")));
        mgr.run_local();
        assert_eq!(*order.lock(), alloc::vec!["clk", "func"]);
    }

    #[test]
    fn remote_drains_into_local() {
        let mgr = EventManager::new();
        let counter = Arc::new(AtomicU32::new(0));
        let c = counter.clone();
        mgr.post_remote(Event::new(Priority::Migrate, move || {
            c.fetch_add(1, Ordering::AcqRel);
        }));
        assert!(mgr.has_pending());
        mgr.drain_remote_into_local();
        mgr.run_local();
        assert_eq!(counter.load(Ordering::Acquire), 1);
        assert!(!mgr.has_pending());
    }
}
