//! Memory subsystem.
//!
//! The memory subsystem consists of:
//! - the per-cluster physical page allocator ([`almos_core::memory::ppm::Ppm`])
//! - the kernel's own page table directory
//! - the Rust heap
use almos_core::{
    memory::{heap::HeapAllocator, ppm::Ppm, PageAllocator, PageSize, PhysicalAddress},
    platform::bib::Bib,
};
use log::{debug, info, trace};
use spin::once::Once;

pub type PlatformPageAllocator = Ppm;

/// The global physical page allocator for this cluster.
static PAGE_ALLOCATOR: Once<PlatformPageAllocator> = Once::new();

#[global_allocator]
/// The Rust global heap allocator.
static ALLOCATOR: HeapAllocator<'static, PlatformPageAllocator> = HeapAllocator::new_uninit();

/// Initialize the memory subsystem for the local cluster from its BIB-described RAM bank.
pub fn init(bib: &Bib) {
    debug!("Initializing memory…");

    let (desc, devices) = bib
        .clusters
        .iter()
        .find(|(desc, _)| desc.cid == bib.header.bootstrap_cpu)
        .expect("boot cluster present in BIB");
    let ram_bank = devices.first().expect("cluster has a RAM bank at device id 0");

    let page_size = PageSize::FourKiB;
    let memory_start = ram_bank.base as *mut u8;
    let memory_length = ram_bank.size as usize;

    trace!(
        "cluster {}: RAM bank <{memory_start:p} - 0x{:x}>, page size = {page_size:?}",
        desc.cid,
        ram_bank.base as usize + memory_length,
    );

    let pa = PAGE_ALLOCATOR
        .call_once(|| unsafe { Ppm::new(page_size, memory_start, memory_length) });

    // Carve the running kernel image's own footprint out of the region before handing the
    // rest to the allocator.
    let (kernel_start, kernel_len) = unsafe { crate::running_image::kernel_memory_region() };
    let kernel_start = kernel_start as *mut u8;
    unsafe {
        if kernel_start > memory_start {
            let before_len = kernel_start.offset_from(memory_start) as usize;
            if before_len > 0 {
                assert!(pa.add_memory_region(memory_start, before_len));
            }
        }
        let after_start = kernel_start.add(kernel_len);
        let memory_end = memory_start.add(memory_length);
        if after_start < memory_end {
            let after_len = memory_end.offset_from(after_start) as usize;
            assert!(pa.add_memory_region(after_start, after_len));
        }
    }

    // initialize kernel heap
    ALLOCATOR.init(pa);

    info!("Memory initialized! ({} free pages)", pa.stats().free_pages());
}

/// Returns a reference to the current global physical page allocator.
#[allow(unused)]
pub fn page_allocator() -> &'static impl PageAllocator {
    PAGE_ALLOCATOR.wait()
}
