//! Thread switching mechanism.

use alloc::sync::Arc;

use almos_core::{
    exceptions::Registers,
    platform::cpu::{CpuIdReader, Id as CpuId},
    process::{
        task::TaskManager,
        thread::{scheduler::RoundRobinScheduler, Kind, Scheduler, Thread},
        ThreadId,
    },
};
use hashbrown::HashMap;
use log::{debug, info, trace};
use spin::{once::Once, Mutex};

const MAX_TASKS: almos_core::collections::Handle = 1024;

/// Implementation of [`CpuIdReader`] that reads the real CP0 `EBase` register.
pub struct SystemCpuIdReader;

impl CpuIdReader for SystemCpuIdReader {
    fn current_cpu() -> CpuId {
        let mut ebase: usize;
        unsafe {
            core::arch::asm!("mfc0 {ebase}, $15, 1", ebase = out(reg) ebase);
        }
        ebase & 0x3ff
    }
}

pub type PlatformScheduler = RoundRobinScheduler<SystemCpuIdReader>;

/// A saved MIPS32 execution context: general-purpose registers plus the program counter and
/// status register at the point the thread was last preempted.
#[derive(Default, Clone, Copy)]
pub struct Context {
    pub registers: Registers,
    pub epc: usize,
    pub status: u32,
}

pub static SCHEDULER: Once<PlatformScheduler> = Once::new();
pub static TASKS: Once<TaskManager> = Once::new();
static CONTEXTS: Once<Mutex<HashMap<ThreadId, Context>>> = Once::new();

/// Initializes the scheduler with one idle thread per online CPU, and the task arena.
pub fn init(cpus: &[CpuId]) {
    debug!("Initializing threads...");

    TASKS.call_once(|| TaskManager::new(MAX_TASKS));
    CONTEXTS.call_once(|| Mutex::new(HashMap::new()));

    trace!("Creating thread scheduler for {} cpu(s)...", cpus.len());

    let idle_threads: alloc::vec::Vec<_> = cpus
        .iter()
        .map(|&cpu| {
            (
                cpu,
                Arc::new(Thread::new(ThreadId::from_raw(0), None, Kind::Kernel)),
            )
        })
        .collect();

    SCHEDULER.call_once(|| PlatformScheduler::new(idle_threads));

    info!("Threads initialized!");
}

/// Saves `registers`/`epc`/`status` as the scheduler's current thread's context.
pub fn save_current_thread_state(registers: &Registers, epc: usize, status: u32) {
    let current = SCHEDULER
        .get()
        .expect("scheduler init before thread switch")
        .current_thread();

    let mut contexts = CONTEXTS.get().expect("contexts initialized").lock();
    let ctx = contexts.entry(current.id()).or_default();
    ctx.registers = *registers;
    ctx.epc = epc;
    ctx.status = status;

    trace!("saved context for thread#{:?}, epc={epc:x}", current.id());
}

/// Restores the scheduler's current thread's saved context into `registers`/`epc`/`status`.
pub fn restore_current_thread_state(registers: &mut Registers, epc: &mut usize, status: &mut u32) {
    let current = SCHEDULER
        .get()
        .expect("scheduler init before thread switch")
        .current_thread();

    let contexts = CONTEXTS.get().expect("contexts initialized").lock();
    let ctx = contexts.get(&current.id()).copied().unwrap_or_default();
    *registers = ctx.registers;
    *epc = ctx.epc;
    *status = ctx.status;

    trace!("restored context for thread#{:?}, epc={epc:x}", current.id());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_round_trips_through_save_and_restore() {
        init(&[0]);

        let mut saved = Registers::default();
        saved.x[4] = 0xdead_beef;
        save_current_thread_state(&saved, 0x8000_1000, 0x1003_0000);

        let mut regs = Registers::default();
        let mut epc = 0usize;
        let mut status = 0u32;
        restore_current_thread_state(&mut regs, &mut epc, &mut status);

        assert_eq!(regs.x[4], 0xdead_beef);
        assert_eq!(epc, 0x8000_1000);
        assert_eq!(status, 0x1003_0000);
    }
}
