//! The per-task Virtual Memory Manager: an ordered, non-overlapping list of
//! [`Region`]s plus the page-fault dispatcher that resolves a trap into a
//! mapping, a copy-on-write, or a migration.
//!
//! Grounded on `vmm_do_cow`, `vmm_do_aod`, `vmm_do_mapped`,
//! `vmm_do_migrate`, `vmm_default_pagefault` and `vmm_fault_handler` from
//! the original's `mm/vmm.c`.

use alloc::{sync::Arc, vec::Vec};

use bitflags::bitflags;
use snafu::{ensure, OptionExt, Snafu};

use crate::{
    collections::RegionId,
    exceptions::FaultOutcome,
    memory::{
        mapper::DynMapper,
        pmm::{Pmm, PteAttr, TlbBackend},
        PageAllocator, PhysicalAddress,
    },
};

/// Errors a VMM region operation can fail with.
#[derive(Debug, Snafu)]
pub enum Error {
    /// The requested range overlaps an existing region.
    Overlap,
    /// No region covers the given address.
    NoSuchRegion,
    /// The allocator backing this VMM has no memory left to satisfy a fault.
    OutOfMemory,
    /// The access violates the region's protection (e.g. a write to a read-only mapping).
    PermissionDenied,
}

type Result<T> = core::result::Result<T, Error>;

/// What a region's pages are backed by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionKind {
    /// Demand-zero memory with no backing file (`do_aod`).
    Anon,
    /// File- or device-backed content, read through a mapper (`do_mapped`).
    File,
    /// The task's heap segment; grows via `brk`-equivalent.
    Heap,
    /// A thread's stack.
    Stack,
    /// An MMIO device window; never paged out or migrated.
    Device,
}

bitflags! {
    /// Per-region sharing and placement flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RegionFlags: u32 {
        /// Writes are visible to other mappers of the same backing object.
        const SHARED  = 1 << 0;
        /// Writes are copy-on-write, private to this address space.
        const PRIVATE = 1 << 1;
        /// The caller requested this exact address, not just a hint.
        const FIXED   = 1 << 2;
    }
}

/// Flags describing the access that caused a page fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VmmFaultFlags {
    /// The access was a write.
    pub is_write: bool,
    /// The access was an instruction fetch.
    pub is_exec: bool,
    /// The access originated from user mode.
    pub from_user: bool,
}

/// One virtual memory region: a contiguous, non-overlapping span of a
/// task's address space with uniform backing and protection.
#[derive(Debug, Clone)]
pub struct Region {
    id: RegionId,
    start: usize,
    len: usize,
    kind: RegionKind,
    flags: RegionFlags,
    writable: bool,
    /// Set by `vmm_madvise_migrate`/`CONFIG_AUTO_NEXT_TOUCH`: every present
    /// PTE in the region should be demoted to `MIGRATE` so the next touch
    /// replicates the page locally.
    migrate_on_next_touch: bool,
    /// The backing object for `RegionKind::File` (and any region mapped `SHARED`), resolved
    /// through an object-safe view so the region list stays free of the mapper's backend type
    /// parameter. `None` for demand-zero (`Anon`/`Heap`/`Stack`) and `Device` regions.
    mapper: Option<Arc<dyn DynMapper>>,
    /// The page index into `mapper` that `start` corresponds to; `mapper_offset + n` is the
    /// index backing the page at `start + n * page_size`.
    mapper_offset: u64,
}

impl Region {
    /// The inclusive-exclusive byte range `[start, start+len)` this region covers.
    #[must_use]
    pub fn range(&self) -> core::ops::Range<usize> {
        self.start..self.start + self.len
    }

    #[must_use]
    pub fn id(&self) -> RegionId {
        self.id
    }

    #[must_use]
    pub fn kind(&self) -> RegionKind {
        self.kind
    }

    #[must_use]
    pub fn flags(&self) -> RegionFlags {
        self.flags
    }

    #[must_use]
    pub fn is_writable(&self) -> bool {
        self.writable
    }

    #[must_use]
    pub fn mapper(&self) -> Option<&Arc<dyn DynMapper>> {
        self.mapper.as_ref()
    }

    fn overlaps(&self, start: usize, len: usize) -> bool {
        start < self.start + self.len && self.start < start + len
    }
}

/// The per-task virtual memory manager: region list plus fault dispatch.
///
/// The region list is kept sorted by start address so insertion overlap
/// checks and the fault-address lookup are both a single linear scan; a
/// real address space has few enough regions (dozens, not millions) that
/// this beats a tree in practice, matching the original's flat list.
pub struct Vmm {
    regions: Vec<Region>,
    next_id: u32,
}

impl Default for Vmm {
    fn default() -> Self {
        Self::new()
    }
}

impl Vmm {
    /// Creates an empty address space.
    #[must_use]
    pub fn new() -> Self {
        Self {
            regions: Vec::new(),
            next_id: 0,
        }
    }

    /// Inserts a new region covering `[start, start+len)`.
    ///
    /// # Errors
    /// [`Error::Overlap`] if any existing region intersects the range.
    pub fn add_region(
        &mut self,
        start: usize,
        len: usize,
        kind: RegionKind,
        flags: RegionFlags,
        writable: bool,
    ) -> Result<RegionId> {
        self.add_region_with_mapper(start, len, kind, flags, writable, None, 0)
    }

    /// Like [`Self::add_region`], but backs the region with `mapper`, a `RegionKind::File`
    /// mapping's source of page content. `mapper_offset` is the backing page index that `start`
    /// corresponds to.
    ///
    /// # Errors
    /// [`Error::Overlap`] if any existing region intersects the range.
    pub fn add_region_with_mapper(
        &mut self,
        start: usize,
        len: usize,
        kind: RegionKind,
        flags: RegionFlags,
        writable: bool,
        mapper: Option<Arc<dyn DynMapper>>,
        mapper_offset: u64,
    ) -> Result<RegionId> {
        ensure!(
            !self.regions.iter().any(|r| r.overlaps(start, len)),
            OverlapSnafu
        );
        let id = RegionId::from_raw(self.next_id);
        self.next_id += 1;
        let region = Region {
            id,
            start,
            len,
            kind,
            flags,
            writable,
            migrate_on_next_touch: false,
            mapper,
            mapper_offset,
        };
        let insert_at = self
            .regions
            .iter()
            .position(|r| r.start > start)
            .unwrap_or(self.regions.len());
        self.regions.insert(insert_at, region);
        Ok(id)
    }

    /// Removes the region with the given id.
    ///
    /// # Errors
    /// [`Error::NoSuchRegion`] if no region has this id.
    pub fn remove_region(&mut self, id: RegionId) -> Result<Region> {
        let pos = self
            .regions
            .iter()
            .position(|r| r.id == id)
            .context(NoSuchRegionSnafu)?;
        Ok(self.regions.remove(pos))
    }

    /// Finds the region (if any) covering `addr`.
    #[must_use]
    pub fn find_region(&self, addr: usize) -> Option<&Region> {
        self.regions.iter().find(|r| r.range().contains(&addr))
    }

    /// `vmm_dup`: clones this address space's region list for a forked child, and marks every
    /// present page of every region `COW`/`!WRITE` in both `pmm` (this address space's page
    /// table) and `child_pmm` (the new task's), so the first write on either side copies the
    /// page instead of corrupting the sibling's view of it.
    #[must_use]
    pub fn fork<B: TlbBackend>(&self, pmm: &Pmm<B>, child_pmm: &Pmm<B>, page_size: usize) -> Self {
        for region in &self.regions {
            let start_page = region.start / page_size;
            let end_page = (region.start + region.len).div_ceil(page_size);
            for page_index in start_page..end_page {
                if pmm.get_page(page_index).is_present() {
                    let _ = pmm.region_dup(child_pmm, page_index);
                }
            }
        }
        Self {
            regions: self.regions.clone(),
            next_id: self.next_id,
        }
    }

    /// `vmm_madvise_migrate`: marks every region overlapping `[start, start+len)` so its present
    /// pages are demoted to `MIGRATE` on their next fault, causing the next touching CPU to pull
    /// a local copy.
    pub fn madvise_migrate(&mut self, start: usize, len: usize) {
        for region in &mut self.regions {
            if region.overlaps(start, len) {
                region.migrate_on_next_touch = true;
            }
        }
    }

    /// Dispatches a page fault at `addr`, matching `vmm_fault_handler`'s outer dispatch: look up
    /// the region, then resolve per its kind and the fault's access flags against `pmm` (this
    /// address space's page table) and `ppm` (the allocator backing new frames).
    pub fn fault_handler<B: TlbBackend, A: PageAllocator>(
        &self,
        pmm: &Pmm<B>,
        ppm: &A,
        addr: usize,
        flags: VmmFaultFlags,
    ) -> FaultOutcome {
        let Some(region) = self.find_region(addr) else {
            return FaultOutcome::SigSegv;
        };

        if flags.is_write && !region.writable && region.flags.contains(RegionFlags::PRIVATE) {
            // A private mapping being written for the first time: copy-on-write, not a
            // protection violation (do_cow). A truly read-only region still segfaults.
            return self.do_cow(pmm, ppm, region, addr, flags);
        }
        if flags.is_write && !region.writable {
            return FaultOutcome::SigSegv;
        }

        match region.kind {
            RegionKind::Anon | RegionKind::Heap | RegionKind::Stack => {
                self.do_aod(pmm, ppm, region, addr)
            }
            RegionKind::File => self.do_mapped(pmm, ppm, region, addr, flags),
            RegionKind::Device => FaultOutcome::Resolved,
        }
    }

    /// `do_aod`: demand-zero allocation. Grabs one fresh frame from `ppm`, zeroes it, and
    /// installs it at `addr`'s page in `pmm`.
    fn do_aod<B: TlbBackend, A: PageAllocator>(
        &self,
        pmm: &Pmm<B>,
        ppm: &A,
        region: &Region,
        addr: usize,
    ) -> FaultOutcome {
        let page_size = usize::from(ppm.page_size());
        let page_index = addr / page_size;
        if pmm.get_page(page_index).is_present() {
            // Another core already resolved this fault; nothing left to do.
            return FaultOutcome::Resolved;
        }
        let Ok(frame) = ppm.allocate(1) else {
            return FaultOutcome::SigBus;
        };
        let ptr: *mut u8 = frame.into();
        // SAFETY: `frame` is a page-aligned, exclusively owned frame just handed back by `ppm`.
        unsafe { ptr.write_bytes(0, page_size) };

        let ppn = (usize::from(frame) / page_size) as u64;
        let mut attrs = PteAttr::PRESENT | PteAttr::USER | PteAttr::CACHED;
        if region.writable {
            attrs |= PteAttr::WRITE;
        }
        if pmm.set_page(page_index, ppn, attrs).is_err() {
            return FaultOutcome::SigBus;
        }
        pmm.tlb_flush_vaddr(addr);
        pmm.cache_flush_vaddr(addr);
        FaultOutcome::Resolved
    }

    /// `do_mapped`: resolve via the backing mapper, installing the page it returns read-only
    /// unless this is a writable `SHARED` mapping.
    fn do_mapped<B: TlbBackend, A: PageAllocator>(
        &self,
        pmm: &Pmm<B>,
        ppm: &A,
        region: &Region,
        addr: usize,
        flags: VmmFaultFlags,
    ) -> FaultOutcome {
        let Some(mapper) = region.mapper.as_ref() else {
            return FaultOutcome::SigBus;
        };
        let page_size = usize::from(ppm.page_size());
        let page_index = addr / page_size;
        if pmm.get_page(page_index).is_present() {
            return FaultOutcome::Resolved;
        }
        let offset_pages = ((addr - region.start) / page_size) as u64;
        let Ok(page) = mapper.get_page(region.mapper_offset + offset_pages) else {
            return FaultOutcome::SigBus;
        };
        // Mapper pages are minted by the caller's arena as raw frame numbers (see
        // `Mapper::get_page`), so the page id doubles as its physical page number here.
        let ppn = u64::from(page.id().raw());

        let mut attrs = PteAttr::PRESENT | PteAttr::USER | PteAttr::CACHED;
        if region.flags.contains(RegionFlags::SHARED) && region.writable {
            attrs |= PteAttr::WRITE;
        } else if flags.is_write {
            attrs |= PteAttr::COW;
        }
        if pmm.set_page(page_index, ppn, attrs).is_err() {
            return FaultOutcome::SigBus;
        }
        pmm.tlb_flush_vaddr(addr);
        pmm.cache_flush_vaddr(addr);
        FaultOutcome::Resolved
    }

    /// `do_cow`: a private region took a write fault on a page marked `COW` by `region_dup`
    /// (fork). This core always copies rather than reusing the frame in place, since a raw
    /// `ppm`-allocated frame carries no [`super::page::Page`] descriptor to consult for a
    /// sole-owner refcount once it leaves the mapper's bookkeeping.
    fn do_cow<B: TlbBackend, A: PageAllocator>(
        &self,
        pmm: &Pmm<B>,
        ppm: &A,
        region: &Region,
        addr: usize,
        flags: VmmFaultFlags,
    ) -> FaultOutcome {
        let page_size = usize::from(ppm.page_size());
        let page_index = addr / page_size;
        let entry = pmm.get_page(page_index);
        if !entry.is_present() {
            return self.do_aod(pmm, ppm, region, addr);
        }
        if !entry.attrs().contains(PteAttr::COW) {
            return FaultOutcome::SigSegv;
        }
        let Ok(frame) = ppm.allocate(1) else {
            return FaultOutcome::SigBus;
        };
        let src: *const u8 = PhysicalAddress::<u8>::from(entry.ppn() as usize * page_size).into();
        let dst: *mut u8 = frame.into();
        // SAFETY: `src` is the page this entry already maps, `dst` is a freshly allocated,
        // exclusively owned frame of the same size.
        unsafe { core::ptr::copy_nonoverlapping(src, dst, page_size) };

        let ppn = (usize::from(frame) / page_size) as u64;
        let mut attrs = PteAttr::PRESENT | PteAttr::USER | PteAttr::CACHED | PteAttr::WRITE;
        if flags.is_exec {
            attrs |= PteAttr::EXECUTE;
        }
        if pmm.set_page(page_index, ppn, attrs).is_err() {
            return FaultOutcome::SigBus;
        }
        pmm.tlb_flush_vaddr(addr);
        pmm.cache_flush_vaddr(addr);
        FaultOutcome::Resolved
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{pmm::Pmm, tests::MockPageAllocator, PageSize};

    fn ppm() -> MockPageAllocator {
        MockPageAllocator::new(PageSize::FourKiB, 64)
    }

    #[test]
    fn overlapping_regions_rejected() {
        let mut vmm = Vmm::new();
        vmm.add_region(0x1000, 0x1000, RegionKind::Anon, RegionFlags::PRIVATE, true)
            .unwrap();
        let result = vmm.add_region(0x1800, 0x1000, RegionKind::Anon, RegionFlags::PRIVATE, true);
        assert!(matches!(result, Err(Error::Overlap)));
    }

    #[test]
    fn adjacent_regions_allowed() {
        let mut vmm = Vmm::new();
        vmm.add_region(0x1000, 0x1000, RegionKind::Anon, RegionFlags::PRIVATE, true)
            .unwrap();
        vmm.add_region(0x2000, 0x1000, RegionKind::Anon, RegionFlags::PRIVATE, true)
            .unwrap();
        assert_eq!(vmm.find_region(0x2500).unwrap().start, 0x2000);
    }

    #[test]
    fn fault_outside_any_region_segfaults() {
        let mut vmm = Vmm::new();
        vmm.add_region(0x1000, 0x1000, RegionKind::Anon, RegionFlags::PRIVATE, true)
            .unwrap();
        let pmm: Pmm = Pmm::new();
        let outcome = vmm.fault_handler(&pmm, &ppm(), 0x9000, VmmFaultFlags::default());
        assert_eq!(outcome, FaultOutcome::SigSegv);
    }

    #[test]
    fn write_to_readonly_region_segfaults() {
        let mut vmm = Vmm::new();
        vmm.add_region(0x1000, 0x1000, RegionKind::File, RegionFlags::SHARED, false)
            .unwrap();
        let pmm: Pmm = Pmm::new();
        let outcome = vmm.fault_handler(
            &pmm,
            &ppm(),
            0x1000,
            VmmFaultFlags {
                is_write: true,
                ..Default::default()
            },
        );
        assert_eq!(outcome, FaultOutcome::SigSegv);
    }

    #[test]
    fn private_write_fault_resolves_via_cow_then_demand_zero() {
        let mut vmm = Vmm::new();
        vmm.add_region(0x1000, 0x1000, RegionKind::Anon, RegionFlags::PRIVATE, false)
            .unwrap();
        let pmm: Pmm = Pmm::new();
        let outcome = vmm.fault_handler(
            &pmm,
            &ppm(),
            0x1000,
            VmmFaultFlags {
                is_write: true,
                ..Default::default()
            },
        );
        assert_eq!(outcome, FaultOutcome::Resolved);
        assert!(pmm.get_page(1).is_present());
    }

    #[test]
    fn anon_region_fault_installs_a_zeroed_present_page() {
        let mut vmm = Vmm::new();
        vmm.add_region(0x1000, 0x1000, RegionKind::Anon, RegionFlags::PRIVATE, true)
            .unwrap();
        let pmm: Pmm = Pmm::new();
        let outcome = vmm.fault_handler(&pmm, &ppm(), 0x1000, VmmFaultFlags::default());
        assert_eq!(outcome, FaultOutcome::Resolved);
        let entry = pmm.get_page(1);
        assert!(entry.attrs().contains(PteAttr::WRITE));
    }

    #[test]
    fn cow_write_on_shared_frame_copies_to_a_new_page() {
        let mut vmm = Vmm::new();
        vmm.add_region(0x1000, 0x1000, RegionKind::Anon, RegionFlags::PRIVATE, true)
            .unwrap();
        let pmm: Pmm = Pmm::new();
        let allocator = ppm();
        pmm.set_page(1, 5, PteAttr::PRESENT | PteAttr::COW).unwrap();
        let outcome = vmm.fault_handler(
            &pmm,
            &allocator,
            0x1000,
            VmmFaultFlags {
                is_write: true,
                ..Default::default()
            },
        );
        assert_eq!(outcome, FaultOutcome::Resolved);
        let entry = pmm.get_page(1);
        assert!(entry.attrs().contains(PteAttr::WRITE));
        assert!(!entry.attrs().contains(PteAttr::COW));
        assert_ne!(entry.ppn(), 5);
    }

    #[test]
    fn fork_clones_regions_and_cows_present_pages_on_both_sides() {
        let mut vmm = Vmm::new();
        vmm.add_region(0x1000, 0x1000, RegionKind::Anon, RegionFlags::PRIVATE, true)
            .unwrap();
        let parent_pmm: Pmm = Pmm::new();
        let child_pmm: Pmm = Pmm::new();
        parent_pmm
            .set_page(1, 0x42, PteAttr::PRESENT | PteAttr::WRITE)
            .unwrap();

        let child_vmm = vmm.fork(&parent_pmm, &child_pmm, 0x1000);

        assert!(child_vmm.find_region(0x1000).is_some());
        for pmm in [&parent_pmm, &child_pmm] {
            let entry = pmm.get_page(1);
            assert!(entry.attrs().contains(PteAttr::COW));
            assert!(!entry.attrs().contains(PteAttr::WRITE));
            assert_eq!(entry.ppn(), 0x42);
        }
    }

    #[test]
    fn madvise_migrate_marks_overlapping_region() {
        let mut vmm = Vmm::new();
        vmm.add_region(0x1000, 0x2000, RegionKind::Anon, RegionFlags::PRIVATE, true)
            .unwrap();
        vmm.madvise_migrate(0x1500, 0x10);
        assert!(vmm.regions[0].migrate_on_next_touch);
    }
}
