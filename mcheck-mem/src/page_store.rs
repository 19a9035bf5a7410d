use std::{cell::RefCell, hash::BuildHasher, rc::Rc};

use hashbrown::{hash_map::DefaultHashBuilder, HashMap};

use crate::{StoreError, StoreResult, PAGE_SIZE};

pub type PageData = [u8; PAGE_SIZE];

/// Represents an opaque index of a page stored in a [PageStore].
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PageIndex(u32);

impl std::fmt::Debug for PageIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("PageIndex").field(&self.0).finish()
    }
}

impl PageIndex {
    #[inline]
    pub fn as_u32(self) -> u32 {
        self.0
    }
}

struct Entry {
    data: Box<PageData>,
    refcount: usize,
    hash: u64,
}

struct Inner {
    /// The maximum number of distinct pages that can be alive at once.
    capacity: usize,
    entries: Vec<Entry>,
    free: Vec<PageIndex>,

    /// Maps the hash of page content to every live page with that hash.
    by_hash: HashMap<u64, Vec<PageIndex>>,
    hasher: DefaultHashBuilder,
}

impl Inner {
    fn entry(&self, index: PageIndex) -> &Entry {
        let entry = &self.entries[index.0 as usize];
        assert!(entry.refcount > 0, "access to released page: {index:?}");
        entry
    }

    fn alloc(&mut self, data: &[u8], hash: u64) -> StoreResult<PageIndex> {
        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                if self.entries.len() >= self.capacity {
                    tracing::warn!("Page store exceeded page limit {}", self.capacity);
                    return Err(StoreError::OutOfPages { capacity: self.capacity });
                }
                self.entries.push(Entry { data: Box::new([0; PAGE_SIZE]), refcount: 0, hash: 0 });
                PageIndex((self.entries.len() - 1).try_into().unwrap())
            }
        };

        let entry = &mut self.entries[index.0 as usize];
        entry.data.copy_from_slice(data);
        entry.refcount = 1;
        entry.hash = hash;
        self.by_hash.entry(hash).or_default().push(index);
        Ok(index)
    }
}

/// A content-addressed store of reference counted pages.
///
/// Storing a page whose content is already present returns the existing page with its refcount
/// incremented. A page is released once its refcount drops to zero and its slot is then reused.
///
/// The store is a cheap handle: clones refer to the same set of pages.
#[derive(Clone)]
pub struct PageStore {
    inner: Rc<RefCell<Inner>>,
}

impl std::fmt::Debug for PageStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("PageStore")
            .field("capacity", &inner.capacity)
            .field("allocated", &inner.entries.len())
            .field("free", &inner.free.len())
            .finish()
    }
}

impl PageStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Rc::new(RefCell::new(Inner {
                capacity,
                entries: vec![],
                free: vec![],
                by_hash: HashMap::new(),
                hasher: DefaultHashBuilder::default(),
            })),
        }
    }

    pub fn capacity(&self) -> usize {
        self.inner.borrow().capacity
    }

    /// The number of distinct pages currently referenced.
    pub fn live_pages(&self) -> usize {
        let inner = self.inner.borrow();
        inner.entries.len() - inner.free.len()
    }

    /// Store a copy of `data` (which must be exactly one page), returning a new reference to it.
    pub fn store_page(&self, data: &[u8]) -> StoreResult<PageIndex> {
        assert_eq!(data.len(), PAGE_SIZE, "page store only accepts whole pages");

        let mut inner = self.inner.borrow_mut();
        let hash = inner.hasher.hash_one(data);

        let existing = inner.by_hash.get(&hash).and_then(|bucket| {
            bucket.iter().copied().find(|index| &inner.entries[index.0 as usize].data[..] == data)
        });
        if let Some(index) = existing {
            inner.entries[index.0 as usize].refcount += 1;
            return Ok(index);
        }

        inner.alloc(data, hash)
    }

    /// Acquire an additional reference to an already stored page.
    pub fn ref_page(&self, index: PageIndex) {
        let mut inner = self.inner.borrow_mut();
        let entry = &mut inner.entries[index.0 as usize];
        assert!(entry.refcount > 0, "reference to released page: {index:?}");
        entry.refcount += 1;
    }

    /// Release a reference to a page, freeing the page once no references remain.
    pub fn unref_page(&self, index: PageIndex) {
        let mut inner = self.inner.borrow_mut();
        let entry = &mut inner.entries[index.0 as usize];
        assert!(entry.refcount > 0, "page refcount underflow: {index:?}");
        entry.refcount -= 1;
        if entry.refcount != 0 {
            return;
        }

        let hash = entry.hash;
        if let Some(bucket) = inner.by_hash.get_mut(&hash) {
            bucket.retain(|x| *x != index);
            if bucket.is_empty() {
                inner.by_hash.remove(&hash);
            }
        }
        inner.free.push(index);
    }

    pub fn refcount(&self, index: PageIndex) -> usize {
        self.inner.borrow().entries.get(index.0 as usize).map_or(0, |entry| entry.refcount)
    }

    /// Copy the content of the page at `index` into `out`.
    pub fn read_page(&self, index: PageIndex, out: &mut [u8]) {
        out.copy_from_slice(&self.inner.borrow().entry(index).data[..]);
    }

    /// Run `f` on the content of the page at `index`.
    ///
    /// `f` must not release pages from this store.
    pub fn with_page<R>(&self, index: PageIndex, f: impl FnOnce(&PageData) -> R) -> R {
        f(&self.inner.borrow().entry(index).data)
    }

    /// Returns the content hash computed when the page was stored.
    pub fn page_hash(&self, index: PageIndex) -> u64 {
        self.inner.borrow().entry(index).hash
    }

    /// Returns whether `self` and `other` are handles to the same store.
    pub fn same_store(&self, other: &PageStore) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

/// An owned list of page references.
///
/// Every page in the list holds exactly one reference that is released when the list is
/// dropped. Cloning the list acquires a new reference to every page.
pub struct PageList {
    store: PageStore,
    pages: Vec<PageIndex>,
}

impl PageList {
    pub fn new(store: &PageStore) -> Self {
        Self { store: store.clone(), pages: vec![] }
    }

    pub fn with_capacity(store: &PageStore, capacity: usize) -> Self {
        Self { store: store.clone(), pages: Vec::with_capacity(capacity) }
    }

    /// Store `data` in the page store and append the resulting reference.
    pub fn push_data(&mut self, data: &[u8]) -> StoreResult<PageIndex> {
        let index = self.store.store_page(data)?;
        self.pages.push(index);
        Ok(index)
    }

    /// Append an additional reference to a page that is already alive in the store.
    pub fn push_shared(&mut self, index: PageIndex) {
        self.store.ref_page(index);
        self.pages.push(index);
    }

    #[inline]
    pub fn pages(&self) -> &[PageIndex] {
        &self.pages
    }

    #[inline]
    pub fn get(&self, i: usize) -> Option<PageIndex> {
        self.pages.get(i).copied()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.pages.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    pub fn store(&self) -> &PageStore {
        &self.store
    }

    /// Copy the content of the `i`th page of the list into `out`.
    pub fn read_page(&self, i: usize, out: &mut [u8]) {
        self.store.read_page(self.pages[i], out)
    }
}

impl Clone for PageList {
    fn clone(&self) -> Self {
        for index in &self.pages {
            self.store.ref_page(*index);
        }
        Self { store: self.store.clone(), pages: self.pages.clone() }
    }
}

impl Drop for PageList {
    fn drop(&mut self) {
        for index in self.pages.drain(..) {
            self.store.unref_page(index);
        }
    }
}

impl PartialEq for PageList {
    fn eq(&self, other: &Self) -> bool {
        self.store.same_store(&other.store) && self.pages == other.pages
    }
}

impl std::fmt::Debug for PageList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.pages.iter().map(|x| x.0)).finish()
    }
}
