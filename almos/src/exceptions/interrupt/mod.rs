//! Interrupts from hardware devices.

use almos_core::exceptions::InterruptController;
use almos_core::platform::bib::Bib;
use log::{info, trace};
use spin::once::Once;

use crate::platform::xicu::Xicu;

const MAX_IRQ_HANDLERS: usize = 32;

/// Dispatches hardware interrupts to the handler registered for each line.
pub struct Handler<'c> {
    controller: &'c dyn InterruptController,
    handlers: spin::Mutex<[Option<fn()>; MAX_IRQ_HANDLERS]>,
}

impl<'c> Handler<'c> {
    /// Creates a handler dispatching through `controller`, with no lines registered yet.
    #[must_use]
    pub fn new(controller: &'c dyn InterruptController) -> Self {
        Self {
            controller,
            handlers: spin::Mutex::new([None; MAX_IRQ_HANDLERS]),
        }
    }

    /// Registers `f` to run whenever line `id` fires.
    pub fn register(&self, id: u32, f: fn()) {
        self.handlers.lock()[id as usize] = Some(f);
        self.controller.enable(id);
    }

    /// Acknowledges and dispatches every currently pending interrupt.
    pub fn process_interrupts(&self) {
        while let Some(id) = self.controller.ack_interrupt() {
            if let Some(f) = self.handlers.lock()[id as usize] {
                f();
            }
            self.controller.finish_interrupt(id);
        }
    }
}

/// The global interrupt handler.
pub static HANDLER: Once<Handler<'static>> = Once::new();

/// The current cluster's XICU device.
pub static CONTROLLER: Once<Xicu> = Once::new();

/// Initialize the interrupt controller and interrupt handler for the local cluster.
pub fn init(bib: &Bib) {
    trace!("Initializing interrupts…");

    let (desc, devices) = bib
        .clusters
        .iter()
        .find(|(desc, _)| desc.cid == bib.header.bootstrap_cpu)
        .expect("boot cluster present in BIB");
    let xicu_device = devices
        .iter()
        .find(|d| d.id == 1)
        .expect("boot cluster has an XICU device");

    let controller = CONTROLLER.call_once(|| Xicu::new(xicu_device.base as usize, 0));
    controller.global_initialize();
    controller.initialize_for_core();

    HANDLER.call_once(|| Handler::new(controller));

    info!("Interrupts initialized! (cluster {})", desc.cid);
}
