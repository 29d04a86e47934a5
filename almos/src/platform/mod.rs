//! Platform glue specific to this kernel image: the XICU interrupt controller driver and the
//! boot-time BSS/image helpers live beside `main.rs` rather than in the portable core.

pub mod xicu;
