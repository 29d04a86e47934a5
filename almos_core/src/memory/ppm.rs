//! Per-cluster Physical Page Manager: a lock-free buddy allocator over one
//! cluster's local RAM bank, plus the [`ClusterMemoryStats`] summary the
//! DQDT leaf-update step folds into the placement tree.
//!
//! Unlike a single global allocator, ALMOS gives every cluster its own
//! [`Ppm`] instance: a thread never contends with another cluster's
//! allocations, and the free-pages-per-order vector a [`Ppm`] reports is
//! exactly the `pages_tbl` entry `dqdt_update` folds bottom-up.

use core::{
    ptr::{null_mut, NonNull},
    sync::atomic::{AtomicPtr, Ordering},
};

use snafu::{ensure, OptionExt as _};

use alloc::sync::Arc;

use crate::{
    config::MAX_ORDER,
    dqdt::{self, MeshCoord, Node, Summary, Xorshift32},
};

use super::{PageSize, PhysicalAddress};

/// Errors a [`Ppm`] operation can fail with.
#[derive(Debug, snafu::Snafu)]
pub enum Error {
    /// No free block of the requested (or any larger) order was available.
    OutOfMemory,
    /// The requested order is `>= MAX_ORDER`, or the freed block's order does not match.
    InvalidOrder,
    /// The address given to [`Ppm::free`] is not a block this allocator owns.
    UnknownBlock,
}

type Result<T> = core::result::Result<T, Error>;

#[repr(C)]
struct FreeHeader {
    next_block: AtomicPtr<FreeHeader>,
}

/// A per-order snapshot of free block counts, folded bottom-up by the DQDT.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClusterMemoryStats {
    /// Free pages per buddy order (`pages_tbl[order]` free *blocks* of that order).
    pub pages_tbl: [u64; MAX_ORDER],
}

impl ClusterMemoryStats {
    /// Total free pages across every order, i.e. the `M` summary field.
    #[must_use]
    pub fn free_pages(&self) -> u64 {
        self.pages_tbl
            .iter()
            .enumerate()
            .map(|(order, &count)| count << order)
            .sum()
    }

    /// Folds `self` and `other` into an aggregate of both (used to fold a 4-wide set of
    /// child-summary slots into a parent DQDT node).
    #[must_use]
    pub fn fold(&self, other: &Self) -> Self {
        let mut pages_tbl = [0u64; MAX_ORDER];
        for order in 0..MAX_ORDER {
            pages_tbl[order] = self.pages_tbl[order] + other.pages_tbl[order];
        }
        Self { pages_tbl }
    }

    /// True if some block of order `>= order` exists anywhere in the summary.
    #[must_use]
    pub fn has_block_at_or_above(&self, order: usize) -> bool {
        self.pages_tbl[order..].iter().any(|&count| count > 0)
    }
}

/// The buddy-allocator page manager for one cluster's local RAM.
///
/// `MAX_ORDER` pages of order `MAX_ORDER-1` is the largest single
/// allocation this allocator will ever serve.
pub struct Ppm {
    base_addr: *mut u8,
    end_addr: *mut u8,
    page_size: PageSize,
    free_blocks: [AtomicPtr<FreeHeader>; MAX_ORDER],
}

unsafe impl Send for Ppm {}
unsafe impl Sync for Ppm {}

impl Ppm {
    /// Creates a manager over the physical range `[memory_start, memory_start+memory_length)`.
    /// The allocator starts with no memory in its free pool; call [`Self::add_memory_region`] to
    /// populate it from the BIB-described RAM bank for this cluster.
    ///
    /// # Safety
    /// `memory_start..memory_start+memory_length` must be valid, exclusively owned memory for
    /// the lifetime of the `Ppm`.
    pub unsafe fn new(page_size: PageSize, memory_start: *mut u8, memory_length: usize) -> Self {
        let page_len = usize::from(page_size);
        assert!(memory_start.is_aligned_to(page_len));
        assert_eq!(memory_length % page_len, 0);
        Self {
            base_addr: memory_start,
            end_addr: unsafe { memory_start.add(memory_length) },
            page_size,
            free_blocks: [const { AtomicPtr::new(null_mut()) }; MAX_ORDER],
        }
    }

    /// Adds a region of memory to the pool, splitting it into the largest blocks that fit.
    /// Returns `false` if the region is smaller than one page.
    ///
    /// # Safety
    /// `region_start..region_start+region_length` must lie within the range this allocator was
    /// constructed over, and must not already be part of the free pool.
    pub unsafe fn add_memory_region(&self, region_start: *mut u8, region_length: usize) -> bool {
        assert!(region_length > 0);
        assert!(region_start >= self.base_addr && region_start < self.end_addr);
        assert!(region_start.add(region_length) <= self.end_addr);
        let page_len = usize::from(self.page_size);
        let start_alignment_padding = region_start.align_offset(page_len);
        if region_length < page_len || region_length - start_alignment_padding < page_len {
            return false;
        }
        let mut block_start = NonNull::new(region_start.add(start_alignment_padding)).unwrap();
        let mut remaining_bytes = region_length;
        let mut order = MAX_ORDER - 1;
        while remaining_bytes > 0 {
            let block_len = (1 << order) * page_len;
            if remaining_bytes >= block_len {
                let block = block_start.cast();
                block.write(FreeHeader {
                    next_block: AtomicPtr::default(),
                });
                self.push_free(order, block);
                remaining_bytes -= block_len;
                block_start = block_start.add(block_len);
            } else {
                match order.checked_sub(1) {
                    Some(new_order) => order = new_order,
                    None => break,
                }
            }
        }
        true
    }

    fn pop_free(&self, order: usize) -> Option<NonNull<FreeHeader>> {
        let mut head = NonNull::new(self.free_blocks[order].load(Ordering::Acquire))?;
        loop {
            let new_head = unsafe { head.as_ref().next_block.load(Ordering::Relaxed) };
            match self.free_blocks[order].compare_exchange(
                head.as_ptr(),
                new_head,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Some(head),
                Err(h) => head = NonNull::new(h)?,
            }
        }
    }

    unsafe fn push_free(&self, order: usize, mut block: NonNull<FreeHeader>) {
        assert!(block.is_aligned_to(usize::from(self.page_size)));
        let mut head = self.free_blocks[order].load(Ordering::Acquire);
        loop {
            block.as_mut().next_block.store(head, Ordering::Relaxed);
            match self.free_blocks[order].compare_exchange(
                head,
                block.as_ptr(),
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(h) => head = h,
            }
        }
    }

    fn try_remove_buddy(&self, order: usize, buddy: NonNull<FreeHeader>) -> bool {
        let free_list = &self.free_blocks[order];
        'retry: loop {
            let mut prev_ptr: Option<NonNull<FreeHeader>> = None;
            let mut current_ptr = NonNull::new(free_list.load(Ordering::Acquire));
            while let Some(current) = current_ptr {
                let next_ptr = unsafe { current.as_ref().next_block.load(Ordering::Relaxed) };
                if current == buddy {
                    let success = if let Some(prev_ptr) = prev_ptr {
                        unsafe {
                            prev_ptr
                                .as_ref()
                                .next_block
                                .compare_exchange(
                                    current.as_ptr(),
                                    next_ptr,
                                    Ordering::AcqRel,
                                    Ordering::Acquire,
                                )
                                .is_ok()
                        }
                    } else {
                        free_list
                            .compare_exchange(
                                current.as_ptr(),
                                next_ptr,
                                Ordering::AcqRel,
                                Ordering::Acquire,
                            )
                            .is_ok()
                    };
                    if success {
                        return true;
                    }
                    continue 'retry;
                }
                prev_ptr = current_ptr;
                current_ptr = NonNull::new(next_ptr);
            }
            return false;
        }
    }

    fn block_in_free_list(&self, order: usize, block: NonNull<FreeHeader>) -> bool {
        let mut cur = NonNull::new(self.free_blocks[order].load(Ordering::Acquire));
        while let Some(n) = cur {
            if n == block {
                return true;
            }
            cur = unsafe { NonNull::new(n.as_ref().next_block.load(Ordering::Relaxed)) };
        }
        false
    }

    fn count_in_free_list(&self, order: usize) -> usize {
        let mut count = 0;
        let mut cur = NonNull::new(self.free_blocks[order].load(Ordering::Acquire));
        while let Some(n) = cur {
            count += 1;
            cur = unsafe { NonNull::new(n.as_ref().next_block.load(Ordering::Relaxed)) };
        }
        count
    }

    fn split_block_to_size(
        &self,
        block: NonNull<FreeHeader>,
        mut current_order: usize,
        desired_order: usize,
    ) -> NonNull<FreeHeader> {
        while current_order > desired_order {
            current_order -= 1;
            let new_size = 1 << current_order;
            unsafe {
                let new_block = block.cast::<u8>().add(new_size * self.page_size).cast();
                self.push_free(current_order, new_block);
            }
        }
        block
    }

    unsafe fn buddy_of(&self, block: NonNull<FreeHeader>, order: usize) -> NonNull<FreeHeader> {
        let offset: usize = unsafe { block.cast::<u8>().as_ptr().offset_from(self.base_addr) }
            .try_into()
            .unwrap();
        let buddy_offset = offset ^ (usize::from(self.page_size) * (1 << order));
        let ptr = unsafe { self.base_addr.add(buddy_offset) };
        NonNull::new(ptr).unwrap().cast()
    }

    /// Allocates `num_pages` pages, rounding up to the next power of two.
    ///
    /// # Errors
    /// [`Error::OutOfMemory`] if no block of sufficient order is free.
    /// [`Error::InvalidOrder`] if `num_pages` is zero or exceeds `2^(MAX_ORDER-1)`.
    pub fn allocate(&self, num_pages: usize) -> Result<PhysicalAddress<u8>> {
        ensure!(num_pages > 0, InvalidOrderSnafu);
        let block_size = num_pages
            .checked_next_power_of_two()
            .context(InvalidOrderSnafu)?;
        let order = block_size.ilog2() as usize;
        ensure!(order < MAX_ORDER, InvalidOrderSnafu);

        let mut actual_order = order;
        let free_block = loop {
            ensure!(actual_order < MAX_ORDER, OutOfMemorySnafu);
            if let Some(free) = self.pop_free(actual_order) {
                break free;
            }
            actual_order += 1;
        };
        let block = self.split_block_to_size(free_block, actual_order, order);
        Ok(PhysicalAddress::from(block.as_ptr().cast::<u8>()))
    }

    /// Frees a block of `num_pages` pages previously returned by [`Self::allocate`], coalescing
    /// with its buddy when possible.
    ///
    /// # Errors
    /// [`Error::UnknownBlock`] if `pages` is not within this allocator's range or has already
    /// been freed.
    pub fn free(&self, pages: PhysicalAddress<u8>, num_pages: usize) -> Result<()> {
        let pages_ptr: *mut u8 = pages.into();
        let block = NonNull::new(pages_ptr.cast()).context(UnknownBlockSnafu)?;
        ensure!(num_pages > 0, InvalidOrderSnafu);
        ensure!(
            pages_ptr >= self.base_addr && pages_ptr < self.end_addr,
            UnknownBlockSnafu
        );

        let block_size = num_pages
            .checked_next_power_of_two()
            .context(InvalidOrderSnafu)?;
        let order = block_size.ilog2() as usize;
        ensure!(order < MAX_ORDER, InvalidOrderSnafu);

        let buddy = unsafe { self.buddy_of(block, order) };
        if self.try_remove_buddy(order, buddy) {
            unsafe { self.push_free(order + 1, block) };
        } else {
            ensure!(!self.block_in_free_list(order, block), UnknownBlockSnafu);
            ensure!(!self.block_in_free_list(order + 1, block), UnknownBlockSnafu);
            ensure!(!self.block_in_free_list(order + 1, buddy), UnknownBlockSnafu);
            unsafe { self.push_free(order, block) };
        }
        Ok(())
    }

    /// The page size this allocator was built with.
    #[must_use]
    pub fn page_size(&self) -> PageSize {
        self.page_size
    }

    /// A snapshot of free blocks per order, the input to the DQDT leaf-summary fold.
    #[must_use]
    pub fn stats(&self) -> ClusterMemoryStats {
        let mut pages_tbl = [0u64; MAX_ORDER];
        for (order, slot) in pages_tbl.iter_mut().enumerate() {
            *slot = self.count_in_free_list(order) as u64;
        }
        ClusterMemoryStats { pages_tbl }
    }

    /// Exports this cluster's current state as the DQDT leaf summary `dqdt_update` folds
    /// bottom-up: free memory from [`Self::stats`], plus the live thread count and CPU
    /// utilization the scheduler tracks (this allocator has no view of either on its own).
    #[must_use]
    pub fn dqdt_summary(&self, thread_count: u32, utilization: u8) -> Summary {
        let stats = self.stats();
        Summary {
            free_pages: stats.free_pages(),
            thread_count,
            utilization,
            stats,
        }
    }

    /// Allocates `num_pages` locally, falling back to [`dqdt::mem_request`] when this cluster is
    /// out of memory: on [`Error::OutOfMemory`], consults the tree for the nearest cluster that
    /// still has capacity at this order and reports its coordinates instead of failing outright,
    /// matching `pmm_alloc_pages`'s fallback to `dqdt_mem_request` in the original allocator.
    ///
    /// # Errors
    /// The local [`Error`] alongside `Some(coord)` naming a cluster the caller could retry
    /// against, or `None` if the tree has no capacity anywhere either.
    pub fn allocate_or_relocate(
        &self,
        num_pages: usize,
        start: &Arc<Node>,
        path_to_root: &[&Arc<Node>],
        rng: &mut Xorshift32,
    ) -> core::result::Result<PhysicalAddress<u8>, (Error, Option<MeshCoord>)> {
        match self.allocate(num_pages) {
            Ok(addr) => Ok(addr),
            Err(Error::OutOfMemory) => {
                let min_order = num_pages
                    .checked_next_power_of_two()
                    .map_or(0, |b| b.ilog2() as usize);
                let relocation = dqdt::mem_request(start, path_to_root, min_order, rng);
                Err((Error::OutOfMemory, relocation))
            }
            Err(err) => Err((err, None)),
        }
    }
}

impl super::PageAllocator for Ppm {
    fn page_size(&self) -> PageSize {
        self.page_size
    }

    fn allocate(&self, num_pages: usize) -> super::Result<PhysicalAddress<u8>> {
        self.allocate(num_pages).map_err(|e| match e {
            Error::OutOfMemory => super::Error::OutOfMemory,
            Error::InvalidOrder | Error::UnknownBlock => super::Error::InvalidSize,
        })
    }

    fn free(&self, pages: PhysicalAddress<u8>, num_pages: usize) -> super::Result<()> {
        self.free(pages, num_pages).map_err(|e| match e {
            Error::OutOfMemory | Error::InvalidOrder => super::Error::InvalidSize,
            Error::UnknownBlock => super::Error::UnknownPtr,
        })
    }
}
