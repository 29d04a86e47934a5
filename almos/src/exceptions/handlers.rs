use almos_core::exceptions::{FaultCause, Registers};

// Assembly definition of the exception vector and the low-level trampoline that saves
// registers before calling into the Rust handler below.
core::arch::global_asm!(include_str!("exception_vector.S"));

extern "C" {
    /// Install the kernel's exception vector so the kernel can handle traps.
    ///
    /// This function should only be called once at initialization, ideally as early as
    /// possible to catch kernel runtime errors.
    ///
    /// # Safety
    /// This function should be safe as long as `exception_vector.S` is correct.
    pub fn install_exception_vector();
}

/// The `ExcCode` field of CP0's `Cause` register (bits 6:2).
fn exception_code(cause: u32) -> u32 {
    (cause >> 2) & 0x1f
}

/// Decodes a synchronous trap's [`FaultCause`] from the CP0 `Cause`/`BadVAddr`/`EPC` values
/// captured at the point of the trap.
fn decode_cause(cause: u32, bad_vaddr: usize, epc: usize) -> FaultCause {
    match exception_code(cause) {
        8 => FaultCause::SystemCall,
        4 | 5 => FaultCause::Alignment {
            fault_addr: bad_vaddr,
        },
        2 if bad_vaddr == epc => FaultCause::InstructionAbort {
            fault_addr: bad_vaddr,
        },
        2 => FaultCause::DataAbort {
            fault_addr: bad_vaddr,
            write: false,
        },
        3 => FaultCause::DataAbort {
            fault_addr: bad_vaddr,
            write: true,
        },
        code => FaultCause::Other(code),
    }
}

#[no_mangle]
unsafe extern "C" fn handle_synchronous_exception(
    regs: *mut Registers,
    cause: u32,
    bad_vaddr: usize,
    epc: usize,
) {
    panic!(
        "synchronous exception! {:?}, EPC={epc:x}, registers = {:x?}",
        decode_cause(cause, bad_vaddr, epc),
        regs.as_ref()
    );
}

#[no_mangle]
unsafe extern "C" fn handle_interrupt(_regs: *mut Registers, _cause: u32, _epc: usize) {
    super::interrupt::HANDLER
        .get()
        .expect("interrupt handler to be initialized before interrupts are enabled")
        .process_interrupts();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_syscall() {
        assert_eq!(decode_cause(8 << 2, 0, 0x1000), FaultCause::SystemCall);
    }

    #[test]
    fn decodes_instruction_abort_when_bad_vaddr_matches_epc() {
        assert_eq!(
            decode_cause(2 << 2, 0x4000, 0x4000),
            FaultCause::InstructionAbort { fault_addr: 0x4000 }
        );
    }

    #[test]
    fn decodes_data_load_abort() {
        assert_eq!(
            decode_cause(2 << 2, 0x8000, 0x1000),
            FaultCause::DataAbort {
                fault_addr: 0x8000,
                write: false
            }
        );
    }

    #[test]
    fn decodes_data_store_abort() {
        assert_eq!(
            decode_cause(3 << 2, 0x8000, 0x1000),
            FaultCause::DataAbort {
                fault_addr: 0x8000,
                write: true
            }
        );
    }

    #[test]
    fn decodes_address_error_as_alignment() {
        assert_eq!(
            decode_cause(4 << 2, 0x1001, 0x1000),
            FaultCause::Alignment { fault_addr: 0x1001 }
        );
    }

    #[test]
    fn decodes_unknown_code_as_other() {
        assert_eq!(decode_cause(31 << 2, 0, 0), FaultCause::Other(31));
    }
}
