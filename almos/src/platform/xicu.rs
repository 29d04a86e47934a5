//! SoCLib XICU driver: the per-cluster interrupt/timer/soft-irq concentrator TSAR clusters
//! expose to their local CPUs.
//!
//! The real XICU multiplexes four register banks onto one CPU output line: hardware IRQs
//! (`HWI`), inter-core soft IRQs (`WTI`), periodic timers (`PTI`) and a barrier counter
//! (`CNTR`). `arch_init`'s `icu.set_mask(icu, mask, type, output)` call is the grounding for
//! the shape kept here: one mask word per `(bank, output line)` pair.

use almos_core::exceptions::interrupt::{Config, Controller, Id};

const BANK_STRIDE: usize = 32;

/// Which XICU register bank an operation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Bank {
    Hwi = 0,
    Wti = 1,
    Pti = 2,
}

/// A handle to one cluster's XICU device.
pub struct Xicu {
    base: *mut u32,
    output_line: usize,
}

// SAFETY: all access to the device goes through volatile reads/writes of `base`.
unsafe impl Send for Xicu {}
unsafe impl Sync for Xicu {}

impl Xicu {
    /// Creates a handle to the XICU at `base_address`, masking interrupts destined for
    /// `output_line` (the local CPU's index within the cluster).
    #[must_use]
    pub fn new(base_address: usize, output_line: usize) -> Self {
        Self {
            base: base_address as *mut u32,
            output_line,
        }
    }

    fn mask_register(&self, bank: Bank) -> *mut u32 {
        unsafe { self.base.add(bank as usize * BANK_STRIDE + self.output_line) }
    }

    fn read_mask(&self, bank: Bank) -> u32 {
        unsafe { self.mask_register(bank).read_volatile() }
    }

    fn write_mask(&self, bank: Bank, value: u32) {
        unsafe {
            self.mask_register(bank).write_volatile(value);
        }
    }
}

impl Controller for Xicu {
    fn global_initialize(&self) {
        self.write_mask(Bank::Hwi, 0);
        self.write_mask(Bank::Wti, 0);
        self.write_mask(Bank::Pti, 0);
    }

    fn initialize_for_core(&self) {
        // Per-core masks already cover the local output line; nothing more to do.
    }

    fn configure(&self, _id: Id, _config: &Config) {
        // The XICU has no per-line trigger-mode/priority configuration; lines are masked
        // in or out wholesale by `enable`/`disable`.
    }

    fn enable(&self, id: Id) {
        let mask = self.read_mask(Bank::Hwi);
        self.write_mask(Bank::Hwi, mask | (1 << id));
    }

    fn disable(&self, id: Id) {
        let mask = self.read_mask(Bank::Hwi);
        self.write_mask(Bank::Hwi, mask & !(1 << id));
    }

    fn is_pending(&self, id: Id) -> bool {
        self.read_mask(Bank::Hwi) & (1 << id) != 0
    }

    fn clear_pending(&self, id: Id) {
        self.disable(id);
        self.enable(id);
    }

    fn ack_interrupt(&self) -> Option<Id> {
        let pending = self.read_mask(Bank::Hwi);
        if pending == 0 {
            None
        } else {
            Some(pending.trailing_zeros())
        }
    }

    fn finish_interrupt(&self, _id: Id) {
        // Level-triggered HWI lines clear themselves once the device deasserts; nothing to
        // acknowledge explicitly here.
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn xicu_over(regs: &mut [u32]) -> Xicu {
        Xicu::new(regs.as_mut_ptr() as usize, 0)
    }

    #[test]
    fn enable_then_disable_clears_hwi_mask() {
        let mut regs = [0u32; 3 * BANK_STRIDE];
        let xicu = xicu_over(&mut regs);
        xicu.enable(3);
        assert!(xicu.is_pending(3));
        xicu.disable(3);
        assert!(!xicu.is_pending(3));
    }

    #[test]
    fn ack_interrupt_picks_lowest_pending_line() {
        let mut regs = [0u32; 3 * BANK_STRIDE];
        let xicu = xicu_over(&mut regs);
        xicu.enable(5);
        xicu.enable(2);
        assert_eq!(xicu.ack_interrupt(), Some(2));
    }

    #[test]
    fn ack_interrupt_none_when_idle() {
        let mut regs = [0u32; 3 * BANK_STRIDE];
        let xicu = xicu_over(&mut regs);
        assert_eq!(xicu.ack_interrupt(), None);
    }

    #[test]
    fn global_initialize_zeroes_every_bank() {
        let mut regs = [0xffff_ffffu32; 3 * BANK_STRIDE];
        let xicu = xicu_over(&mut regs);
        xicu.global_initialize();
        assert_eq!(xicu.read_mask(Bank::Hwi), 0);
        assert_eq!(xicu.read_mask(Bank::Wti), 0);
        assert_eq!(xicu.read_mask(Bank::Pti), 0);
    }
}
