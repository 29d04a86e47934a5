#![no_std]
#![no_main]

extern crate alloc;

mod exceptions;
mod logging;
mod memory;
mod platform;
mod running_image;
mod thread;
mod timer;
mod tty;

use almos_core::platform::bib::Bib;
use log::info;

core::arch::global_asm!(include_str!("start.S"));

/// The largest BIB blob `arch_boot` hands us; `Bib::parse` bounds-checks every read so a
/// generous upper bound just caps how far we scan, never how much we trust.
const MAX_BIB_LEN: usize = 64 * 1024;

#[no_mangle]
pub extern "C" fn kmain(bib_ptr: *const u8) -> ! {
    unsafe {
        running_image::zero_bss_section();
    }

    let bib_bytes = unsafe { core::slice::from_raw_parts(bib_ptr, MAX_BIB_LEN) };
    let bib = Bib::parse(bib_bytes).expect("bootloader handed us a well-formed BIB");

    logging::init_logging(&bib);
    memory::init(&bib);
    exceptions::init_interrupts(&bib);

    unsafe {
        exceptions::install_exception_vector();
    }

    let cpus: alloc::vec::Vec<_> = bib
        .clusters
        .iter()
        .find(|(desc, _)| desc.cid == bib.header.bootstrap_cpu)
        .map(|(desc, _)| (0..desc.cpu_nr as usize).collect())
        .unwrap_or_default();
    thread::init(&cpus);

    info!("ALMOS is up, entering idle loop.");

    #[allow(clippy::empty_loop)]
    loop {
        core::hint::spin_loop();
    }
}

#[panic_handler]
pub fn panic_handler(info: &core::panic::PanicInfo) -> ! {
    log::error!("{info}");
    #[allow(clippy::empty_loop)]
    loop {}
}
