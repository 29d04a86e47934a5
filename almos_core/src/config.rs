//! Compile-time kernel configuration constants.
//!
//! Collects the `CONFIG_*` constants named throughout the design into one
//! place, the way a `kernel-config.h` would, but as typed Rust constants
//! rather than preprocessor defines.

/// Largest buddy order a [`crate::memory::ppm::Ppm`] will track: `2^(MAX_ORDER-1)` pages is the
/// largest single allocation.
pub const MAX_ORDER: usize = 16;

/// Round-robin scheduling quantum, in ticks, before a thread is requeued.
pub const RR_QUANTUM: u32 = 3;

/// Number of round-robin priority sub-queues a per-CPU run queue keeps.
pub const RR_QUEUE_NR: usize = 5;

/// Number of levels in the DQDT hierarchy (boot-time derived from the
/// cluster mesh's diameter, bounded by this ceiling).
pub const DQDT_LEVELS_NR: usize = 5;

/// Ticks between `dqdt_update` runs on a cluster's bootstrap CPU.
pub const DQDT_MGR_PERIOD: u32 = 100;

/// Default burst budget before `dqdt_wait_for_update` puts a caller to sleep.
pub const DQDT_THRESHOLD_DEFAULT: u32 = 10;

/// Root utilization below which `dqdt_update_done` relaxes the burst budget to 100.
pub const DQDT_ROOT_U_RELAXED: u8 = 60;

/// Maximum number of clusters addressable by a [`crate::collections::ids`] arena in one boot image.
pub const MAX_CLUSTERS: usize = 1024;

/// Maximum number of cores per cluster.
pub const MAX_CPUS_PER_CLUSTER: usize = 4;

/// Cycles between system timer ticks (one millisecond at the platform's reference clock).
pub const TIMER_TICK_CYCLES: u32 = 1_000_000;
