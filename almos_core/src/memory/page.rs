//! Physical page descriptors.
//!
//! One [`Page`] exists per physical page frame that is under mapper control
//! (as opposed to pages that only ever live in a [`super::ppm::Ppm`] free
//! list, which never need a descriptor until they are handed to a mapper or
//! a region).

use core::sync::atomic::{AtomicU32, Ordering};

use bitflags::bitflags;

use crate::collections::{MapperId, PageId};

bitflags! {
    /// Per-page state bits.
    ///
    /// `INLOAD` is the ghost-page marker: a reader that finds a page with
    /// `INLOAD` set must wait on it rather than using its contents, per the
    /// mapper's concurrent-load protocol.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageFlags: u32 {
        /// The page descriptor has been initialized (zeroed memory is not a valid page).
        const INIT    = 1 << 0;
        /// The page is used as a kernel buffer (bio), not file-backed content.
        const BUFFER  = 1 << 1;
        /// The page's content differs from its backing store and needs writeback.
        const DIRTY   = 1 << 2;
        /// The page must not be evicted or migrated (e.g. it backs a locked PTE).
        const PINNED  = 1 << 3;
        /// A ghost page: a placeholder inserted so a second reader waits instead of
        /// racing the first reader's I/O. Cleared once the read completes.
        const INLOAD  = 1 << 4;
    }
}

/// A physical page frame tracked by a [`super::mapper::Mapper`] or a region.
#[derive(Debug)]
pub struct Page {
    id: PageId,
    flags: AtomicU32,
    /// The mapper that owns this page's content, if any. Pages backing
    /// anonymous (demand-zero) regions have no mapper.
    mapper: Option<MapperId>,
    /// Offset in pages into the mapper's backing object.
    index: u64,
    refcount: AtomicU32,
}

impl Page {
    /// Creates a freshly allocated, not-yet-loaded page descriptor.
    #[must_use]
    pub fn new(id: PageId, mapper: Option<MapperId>, index: u64) -> Self {
        Self {
            id,
            flags: AtomicU32::new(PageFlags::INIT.bits()),
            mapper,
            index,
            refcount: AtomicU32::new(1),
        }
    }

    /// This page's arena handle.
    #[must_use]
    pub fn id(&self) -> PageId {
        self.id
    }

    /// The mapper that owns this page, if any.
    #[must_use]
    pub fn mapper(&self) -> Option<MapperId> {
        self.mapper
    }

    /// This page's offset into its mapper's backing object, in pages.
    #[must_use]
    pub fn index(&self) -> u64 {
        self.index
    }

    #[must_use]
    pub fn flags(&self) -> PageFlags {
        PageFlags::from_bits_truncate(self.flags.load(Ordering::Acquire))
    }

    pub fn set_flags(&self, flags: PageFlags) {
        self.flags.fetch_or(flags.bits(), Ordering::AcqRel);
    }

    pub fn clear_flags(&self, flags: PageFlags) {
        self.flags.fetch_and(!flags.bits(), Ordering::AcqRel);
    }

    /// Marks the page as a ghost page: present in the mapper's cache but not
    /// yet loaded. Concurrent faulters must wait for [`Page::clear_inload`].
    pub fn mark_inload(&self) {
        self.set_flags(PageFlags::INLOAD);
    }

    /// Clears the ghost-page marker once the backing I/O has completed.
    pub fn clear_inload(&self) {
        self.clear_flags(PageFlags::INLOAD);
    }

    #[must_use]
    pub fn is_inload(&self) -> bool {
        self.flags().contains(PageFlags::INLOAD)
    }

    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.flags().contains(PageFlags::DIRTY)
    }

    pub fn mark_dirty(&self) {
        self.set_flags(PageFlags::DIRTY);
    }

    pub fn clear_dirty(&self) {
        self.clear_flags(PageFlags::DIRTY);
    }

    #[must_use]
    pub fn is_pinned(&self) -> bool {
        self.flags().contains(PageFlags::PINNED)
    }

    pub fn refcount(&self) -> u32 {
        self.refcount.load(Ordering::Acquire)
    }

    /// Adds a reference, returning the new count.
    pub fn get(&self) -> u32 {
        self.refcount.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Drops a reference, returning the new count. The caller reclaims the page
    /// back to its [`super::ppm::Ppm`] when this reaches zero.
    pub fn put(&self) -> u32 {
        let prev = self.refcount.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "page refcount underflow");
        prev - 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collections::{Handle, MapperId};

    #[test]
    fn fresh_page_is_init_and_not_inload() {
        let page = Page::new(PageId::from_raw(0 as Handle), None, 0);
        assert!(page.flags().contains(PageFlags::INIT));
        assert!(!page.is_inload());
        assert_eq!(page.refcount(), 1);
    }

    #[test]
    fn inload_protocol() {
        let page = Page::new(PageId::from_raw(1), Some(MapperId::from_raw(0)), 3);
        page.mark_inload();
        assert!(page.is_inload());
        page.clear_inload();
        assert!(!page.is_inload());
    }

    #[test]
    fn refcounting() {
        let page = Page::new(PageId::from_raw(2), None, 0);
        assert_eq!(page.get(), 2);
        assert_eq!(page.put(), 1);
        assert_eq!(page.put(), 0);
    }

    #[test]
    fn dirty_tracking() {
        let page = Page::new(PageId::from_raw(3), None, 0);
        assert!(!page.is_dirty());
        page.mark_dirty();
        assert!(page.is_dirty());
        page.clear_dirty();
        assert!(!page.is_dirty());
    }
}
