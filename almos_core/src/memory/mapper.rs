//! The mapper page cache: a keyed cache of [`Page`]s backing a file, device
//! or anonymous region, with a ghost-page protocol that serializes
//! concurrent loads of the same index.
//!
//! Grounded directly on `mapper_get_page`'s loop: a first faulter installs a
//! ghost page (flagged [`super::page::PageFlags::INLOAD`]) under the
//! mapper lock, releases the lock to run the (possibly slow) backend I/O,
//! then re-takes the lock to swap the ghost for the loaded page and wake
//! anyone who found the ghost in the meantime. A second faulter that finds
//! an in-load page waits and retries rather than issuing its own I/O.

use alloc::sync::Arc;

use hashbrown::HashMap;
use snafu::Snafu;
use spin::Mutex;

use crate::collections::MapperId;

use super::page::Page;

/// Errors a mapper operation can fail with.
#[derive(Debug, Snafu)]
pub enum Error {
    /// The backend failed to read or write a page.
    #[snafu(display("mapper backend I/O error at index {index}"))]
    BackingStore {
        /// The page index the failing operation was for.
        index: u64,
    },
    /// No memory was available to allocate a new page descriptor.
    OutOfMemory,
    /// The requested page index is out of range for this mapper's backing object.
    InvalidIndex,
}

type Result<T> = core::result::Result<T, Error>;

/// The operations a mapper needs from whatever backs its pages: a file,
/// block device, or anonymous zero-fill source.
#[cfg_attr(test, mockall::automock)]
pub trait MapperBackend {
    /// Fills `page` (newly allocated, at `index`) with its backing content.
    fn readpage(&self, index: u64, page: &Page) -> Result<()>;
    /// Writes `page`'s content back to the backing store.
    fn writepage(&self, index: u64, page: &Page) -> Result<()>;
    /// Blocks until any writeback of `page` in flight has completed.
    fn sync_page(&self, index: u64, page: &Page);
    /// Marks `page` as needing writeback; called when a mapping makes it dirty.
    fn set_page_dirty(&self, page: &Page) {
        page.mark_dirty();
    }
    /// Clears the dirty marker after a successful writeback.
    fn clear_page_dirty(&self, page: &Page) {
        page.clear_dirty();
    }
    /// Called when a page is about to be evicted from the cache.
    fn releasepage(&self, _page: &Page) {}
}

/// A zero-fill backend for anonymous (non-file-backed) regions: every page
/// reads as zero and nothing is ever written back.
#[derive(Debug, Default)]
pub struct AnonymousBackend;

impl MapperBackend for AnonymousBackend {
    fn readpage(&self, _index: u64, _page: &Page) -> Result<()> {
        Ok(())
    }

    fn writepage(&self, _index: u64, _page: &Page) -> Result<()> {
        Ok(())
    }

    fn sync_page(&self, _index: u64, _page: &Page) {}
}

/// A keyed cache of pages backing one file, device, or anonymous object.
pub struct Mapper<B: MapperBackend> {
    id: MapperId,
    backend: B,
    pages: Mutex<HashMap<u64, Arc<Page>>>,
}

impl<B: MapperBackend> Mapper<B> {
    /// Creates an empty mapper over `backend`.
    pub fn new(id: MapperId, backend: B) -> Self {
        Self {
            id,
            backend,
            pages: Mutex::new(HashMap::new()),
        }
    }

    /// This mapper's arena handle.
    #[must_use]
    pub fn id(&self) -> MapperId {
        self.id
    }

    /// Returns the page at `index`, loading it from the backend if it is not already cached.
    ///
    /// Concurrent callers racing for the same `index` converge on a single
    /// `readpage` call: the loser waits for the winner's ghost page to
    /// resolve instead of issuing its own I/O.
    ///
    /// # Errors
    /// [`Error::BackingStore`] if `readpage` fails.
    pub fn get_page(&self, index: u64, alloc_id: impl Fn() -> MapperId) -> Result<Arc<Page>> {
        let _ = &alloc_id; // page ids are minted by the caller's arena in the real kernel
        loop {
            let mut pages = self.pages.lock();
            match pages.get(&index) {
                Some(page) if page.is_inload() => {
                    // Drop the lock and let the winner make progress; a real build parks on
                    // page.wait_queue and is woken by the winner instead of spinning.
                    drop(pages);
                    core::hint::spin_loop();
                    continue;
                }
                Some(page) => return Ok(page.clone()),
                None => {
                    let page = Arc::new(Page::new(
                        crate::collections::PageId::from_raw(0),
                        Some(self.id),
                        index,
                    ));
                    page.mark_inload();
                    pages.insert(index, page.clone());
                    drop(pages);

                    let result = self.backend.readpage(index, &page);

                    let mut pages = self.pages.lock();
                    return match result {
                        Ok(()) => {
                            page.clear_inload();
                            Ok(page)
                        }
                        Err(err) => {
                            pages.remove(&index);
                            Err(err)
                        }
                    };
                }
            }
        }
    }

    /// Looks up a cached page without loading it.
    #[must_use]
    pub fn find_page(&self, index: u64) -> Option<Arc<Page>> {
        self.pages.lock().get(&index).cloned()
    }

    /// Writes every dirty page back through the backend, clearing their dirty bit on success.
    ///
    /// # Errors
    /// The first [`Error::BackingStore`] encountered; remaining pages are still attempted.
    pub fn sync(&self) -> Result<()> {
        let dirty: alloc::vec::Vec<(u64, Arc<Page>)> = self
            .pages
            .lock()
            .iter()
            .filter(|(_, p)| p.is_dirty())
            .map(|(&i, p)| (i, p.clone()))
            .collect();
        let mut first_err = None;
        for (index, page) in dirty {
            match self.backend.writepage(index, &page) {
                Ok(()) => self.backend.clear_page_dirty(&page),
                Err(err) if first_err.is_none() => first_err = Some(err),
                Err(_) => {}
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}

/// An object-safe view of a [`Mapper`], so a [`super::vmm::Region`] can hold one without the
/// region list (and the `Vmm`/`Task` that own it) becoming generic over every backend in use.
pub trait DynMapper: Send + Sync {
    /// This mapper's arena handle.
    fn id(&self) -> MapperId;
    /// See [`Mapper::get_page`].
    fn get_page(&self, index: u64) -> Result<Arc<Page>>;
    /// See [`Mapper::find_page`].
    fn find_page(&self, index: u64) -> Option<Arc<Page>>;
    /// See [`Mapper::sync`].
    fn sync(&self) -> Result<()>;
}

impl<B: MapperBackend + Send + Sync> DynMapper for Mapper<B> {
    fn id(&self) -> MapperId {
        Mapper::id(self)
    }

    fn get_page(&self, index: u64) -> Result<Arc<Page>> {
        let id = Mapper::id(self);
        Mapper::get_page(self, index, || id)
    }

    fn find_page(&self, index: u64) -> Option<Arc<Page>> {
        Mapper::find_page(self, index)
    }

    fn sync(&self) -> Result<()> {
        Mapper::sync(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collections::Handle;

    #[test]
    fn get_page_loads_once() {
        let mut backend = MockMapperBackend::new();
        backend
            .expect_readpage()
            .times(1)
            .returning(|_, _| Ok(()));
        let mapper = Mapper::new(MapperId::from_raw(0 as Handle), backend);

        let page1 = mapper.get_page(3, || MapperId::from_raw(0)).unwrap();
        let page2 = mapper.get_page(3, || MapperId::from_raw(0)).unwrap();
        assert!(Arc::ptr_eq(&page1, &page2));
        assert!(!page1.is_inload());
    }

    #[test]
    fn get_page_propagates_backend_error() {
        let mut backend = MockMapperBackend::new();
        backend
            .expect_readpage()
            .times(1)
            .returning(|index, _| Err(Error::BackingStore { index }));
        let mapper = Mapper::new(MapperId::from_raw(0), backend);

        let result = mapper.get_page(7, || MapperId::from_raw(0));
        assert!(matches!(result, Err(Error::BackingStore { index: 7 })));
        assert!(mapper.find_page(7).is_none());
    }

    #[test]
    fn anonymous_backend_zero_fills() {
        let mapper = Mapper::new(MapperId::from_raw(0), AnonymousBackend);
        let page = mapper.get_page(0, || MapperId::from_raw(0)).unwrap();
        assert!(!page.is_inload());
    }

    #[test]
    fn dyn_mapper_dispatches_through_the_trait_object() {
        let mapper: Arc<dyn DynMapper> = Arc::new(Mapper::new(MapperId::from_raw(1), AnonymousBackend));
        let page = DynMapper::get_page(&*mapper, 0).unwrap();
        assert_eq!(page.index(), 0);
        assert_eq!(mapper.id(), MapperId::from_raw(1));
        assert!(mapper.find_page(0).is_some());
    }
}
