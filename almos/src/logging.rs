//! Kernel logging mechanism.
use log::{debug, info};
use spin::once::Once;

use almos_core::logger::{GlobalValueReader, GlobalValues, Logger};

use crate::tty;

/// Implementation of [`GlobalValueReader`] that reads the real CP0 registers.
struct SystemGlobalValueReader;

impl GlobalValueReader for SystemGlobalValueReader {
    fn read() -> GlobalValues {
        let mut core_id: usize;
        let mut timer_counter: u32;
        unsafe {
            // EBase (CP0 15, sel 1), bits [9:0] = CPUNum (MIPS32r2).
            core::arch::asm!(
                ".set noat",
                "mfc0 {core_id}, $15, 1",
                core_id = out(reg) core_id,
            );
            // Count (CP0 9, sel 0): free-running cycle counter.
            core::arch::asm!(
                "mfc0 {counter}, $9, 0",
                counter = out(reg) timer_counter,
            );
        }
        GlobalValues {
            core_id: core_id & 0x3ff,
            timer_counter: u64::from(timer_counter),
        }
    }
}

/// The global kernel logger instance.
static LOGGER: Once<Logger<tty::SoclibTty, SystemGlobalValueReader>> = Once::new();

/// Initialize the kernel global logger, writing to the boot cluster's TTY device.
pub fn init_logging(bib: &almos_core::platform::bib::Bib) {
    let tty = tty::SoclibTty::from_bib(bib).expect("boot cluster has a TTY device");

    log::set_max_level(log::LevelFilter::max());
    log::set_logger(LOGGER.call_once(|| Logger::new(tty, log::LevelFilter::max())) as _).unwrap();

    info!(
        "\x1b[1mALMOS\x1b[0m v{} (git: {}@{})",
        env!("CARGO_PKG_VERSION"),
        env!("VERGEN_GIT_BRANCH"),
        env!("VERGEN_GIT_SHA"),
    );

    info!(
        "Mesh {}x{}, {} cpu(s), bootstrap cpu {}",
        bib.header.x_max, bib.header.y_max, bib.header.cpu_nr, bib.header.bootstrap_cpu
    );

    debug!("Build timestamp: {}", env!("VERGEN_BUILD_TIMESTAMP"));
    debug!("Kernel memory region: {:x?}", unsafe {
        crate::running_image::kernel_memory_region()
    });
}
