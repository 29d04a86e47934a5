//! Interrupts are exceptions caused by hardware devices.
//!
//! Each cluster's device descriptors (parsed from the [`crate::platform::bib`])
//! name an IRQ line directly, so unlike a device-tree platform there is no
//! interrupt-specifier parsing step here: a [`Controller`] only needs to
//! configure, mask and acknowledge lines by numeric [`Id`].

/// The identifier of an interrupt, as reported in a BIB device descriptor.
pub type Id = u32;

/// Trigger mode for an interrupt.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum TriggerMode {
    /// Use level triggering.
    #[default]
    Level,
    /// Use edge triggering.
    Edge,
}

/// The configuration of an interrupt with the interrupt controller.
#[derive(Debug, Default, Clone, Copy)]
pub struct Config {
    /// Priority level.
    pub priority: u8,
    /// Triggering mode for the interrupt.
    pub mode: TriggerMode,
}

/// An interrupt controller manages and collates interrupts for the processor.
/// This is the generic interface for the interrupt controller mechanism.
#[cfg_attr(test, mockall::automock)]
pub trait Controller {
    /// Called once at startup to perform global initialization.
    fn global_initialize(&self);

    /// Called once per core to initialize any per-core state.
    fn initialize_for_core(&self);

    /// Set the configuration of an interrupt.
    fn configure(&self, id: Id, config: &Config);

    /// Enable an interrupt to raise an exception.
    fn enable(&self, id: Id);
    /// Disable an interrupt from raising an exception.
    fn disable(&self, id: Id);

    /// True if the interrupt is currently pending.
    fn is_pending(&self, id: Id) -> bool;

    /// Clear the pending state for this interrupt.
    fn clear_pending(&self, id: Id);

    /// Acknowledge that an interrupt exception has been handled.
    /// Returns the ID of the interrupt that was triggered.
    fn ack_interrupt(&self) -> Option<Id>;

    /// Inform the interrupt controller that the system has finished processing an interrupt.
    fn finish_interrupt(&self, id: Id);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mock_controller_round_trip() {
        let mut mock = MockController::new();
        mock.expect_enable().withf(|&id| id == 4).once().return_const(());
        mock.expect_ack_interrupt().once().return_const(Some(4u32));
        mock.enable(4);
        assert_eq!(mock.ack_interrupt(), Some(4));
    }
}
