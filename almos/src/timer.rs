//! System timer driver: MIPS32's CP0 `Count`/`Compare` pair, which raises the timer interrupt
//! (hardware interrupt line 7, `Cause.IP7`) whenever `Count` reaches `Compare`.

use core::arch::asm;

/// Read the `Count` register (CP0 9, sel 0): a free-running cycle counter.
#[must_use]
pub fn counter() -> u32 {
    let mut count: u32;
    unsafe {
        asm!("mfc0 {count}, $9, 0", count = out(reg) count);
    }
    count
}

/// Write the `Compare` register (CP0 11, sel 0). Writing it also clears the pending timer
/// interrupt, per the MIPS32 architecture manual.
pub fn set_compare(value: u32) {
    unsafe {
        asm!("mtc0 {value}, $11, 0", value = in(reg) value);
    }
}

/// Read the `Compare` register.
#[must_use]
pub fn compare() -> u32 {
    let mut compare: u32;
    unsafe {
        asm!("mfc0 {compare}, $11, 0", compare = out(reg) compare);
    }
    compare
}

/// Schedule the next tick `ticks_from_now` cycles after the current `Count` value, wrapping on
/// overflow as the hardware comparator does.
pub fn schedule_next_tick(ticks_from_now: u32) {
    set_compare(counter().wrapping_add(ticks_from_now));
}
