//! Portable core of the ALMOS distributed NUMA kernel: page allocation, the
//! page table, the mapper cache, the virtual memory manager, scheduling and
//! inter-cluster events, the DQDT placement tree, and task/thread lifecycle.
//! The `almos` crate wires this core to TSAR-MIPS32 boot and trap handling.
#![no_std]
#![deny(missing_docs)]

#[cfg(all(test, not(target_os = "none")))]
#[macro_use]
extern crate std;

extern crate alloc;

pub mod collections;
pub mod config;
pub mod dqdt;
pub mod errno;
pub mod exceptions;
pub mod logger;
pub mod memory;
pub mod platform;
pub mod process;
