//! CPU identity and per-CPU load statistics.

use log::info;
use snafu::Snafu;

use crate::memory::PhysicalAddress;

/// A unique identifier for a single CPU core, scoped to its owning cluster.
pub type Id = usize;

/// Reads the identity of the CPU the current code is executing on. Implemented once per target
/// architecture (reading a coprocessor register on real hardware); [`super::cpu::Id`] values it
/// returns must match the ids a [`RoundRobinScheduler`](crate::process::thread::RoundRobinScheduler)
/// was built with.
#[cfg_attr(test, mockall::automock)]
pub trait CpuIdReader {
    /// The id of the CPU executing this call.
    fn current_cpu() -> Id;
}

/// Errors that occur bringing up a secondary core.
#[derive(Debug, Snafu)]
pub enum CoreLaunchError {
    /// Target core ID is invalid.
    InvalidCoreId,
    /// Entry point address is invalid.
    InvalidAddress,
    /// The target core is already running.
    AlreadyOn,
    /// A miscellaneous internal error has occurred.
    Internal,
}

/// Mechanism interface for releasing a secondary core from reset, replacing
/// the original's `enable-method`-dispatched power manager: TSAR-MIPS32
/// cores are released by the boot CPU writing their entry point into a
/// well-known location rather than through a device-tree-described PSCI
/// call.
pub trait CoreLauncher {
    /// Releases `target_core`, which starts executing at `entry_point_address` with `arg` passed
    /// as its first argument.
    ///
    /// # Safety
    /// The entry point address must be valid or else undefined behavior will occur on the target
    /// core.
    unsafe fn start_core(
        &self,
        target_core: Id,
        entry_point_address: PhysicalAddress,
        arg: usize,
    ) -> Result<(), CoreLaunchError>;
}

/// Releases every secondary core named in `cores`, skipping the bootstrap core which is already
/// running.
///
/// # Errors
/// The first [`CoreLaunchError`] encountered; remaining cores are still attempted so a single bad
/// descriptor doesn't strand an otherwise-bootable machine.
pub fn boot_secondary_cores(
    cores: &[Id],
    bootstrap: Id,
    launcher: &impl CoreLauncher,
    entry_point_address: PhysicalAddress,
    arg: usize,
) -> Result<(), CoreLaunchError> {
    let mut started = 0;
    for &core in cores {
        if core == bootstrap {
            continue;
        }
        unsafe {
            launcher.start_core(core, entry_point_address, arg)?;
        }
        started += 1;
    }
    info!("started {started} secondary cores");
    Ok(())
}

/// A CPU's instantaneous load sample: ticks spent idle vs. total ticks since the last sample,
/// the raw inputs `cpu_compute_stats` turns into a busy percentage for the DQDT.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LoadSample {
    pub idle_ticks: u64,
    pub total_ticks: u64,
}

impl LoadSample {
    /// `cpu_compute_stats`: a moving-average busy percentage (0..100) from idle vs. total ticks.
    /// Samples below `min_total_ticks` are considered too noisy and are discarded in favor of the
    /// caller's previous value.
    #[must_use]
    pub fn busy_percent(&self, min_total_ticks: u64) -> Option<u8> {
        if self.total_ticks < min_total_ticks {
            return None;
        }
        let idle_pct = (self.idle_ticks.saturating_mul(100) / self.total_ticks.max(1)) as u8;
        Some(100u8.saturating_sub(idle_pct))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn busy_percent_from_ticks() {
        let sample = LoadSample {
            idle_ticks: 30,
            total_ticks: 100,
        };
        assert_eq!(sample.busy_percent(10), Some(70));
    }

    #[test]
    fn sparse_sample_discarded() {
        let sample = LoadSample {
            idle_ticks: 1,
            total_ticks: 2,
        };
        assert_eq!(sample.busy_percent(10), None);
    }

    #[test]
    fn mock_cpu_id_reader() {
        let mut ctx = MockCpuIdReader::current_cpu_context();
        ctx.expect().returning(|| 3);
        assert_eq!(MockCpuIdReader::current_cpu(), 3);
    }

    struct AlwaysFails;
    impl CoreLauncher for AlwaysFails {
        unsafe fn start_core(
            &self,
            _target_core: Id,
            _entry_point_address: PhysicalAddress,
            _arg: usize,
        ) -> Result<(), CoreLaunchError> {
            Err(CoreLaunchError::InvalidCoreId)
        }
    }

    #[test]
    fn boot_secondary_cores_skips_bootstrap_and_propagates_error() {
        let result = boot_secondary_cores(&[0, 1, 2], 0, &AlwaysFails, 0usize.into(), 0);
        assert!(matches!(result, Err(CoreLaunchError::InvalidCoreId)));
    }
}
