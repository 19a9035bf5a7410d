use std::hash::Hasher;

use crate::{
    is_page_aligned, is_soft_dirty, page_count, page_number, AddressSpace, PageList, PageStore,
    StoreError, StoreResult, PAGE_SIZE,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegionType {
    Heap,
    Data,
}

pub enum RegionData {
    /// A full copy of the region.
    Dense(Box<[u8]>),

    /// One page store reference for each page of the region.
    Sparse(PageList),
}

impl std::fmt::Debug for RegionData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Dense(bytes) => write!(f, "Dense({:#x} bytes)", bytes.len()),
            Self::Sparse(pages) => write!(f, "Sparse({} pages)", pages.len()),
        }
    }
}

/// The saved content of one contiguous range of the target's memory.
#[derive(Debug)]
pub struct RegionSnapshot {
    region_type: RegionType,

    /// The address the region is visible at while the target runs.
    start_addr: u64,

    /// The address the content was read from, this differs from `start_addr` for privatized
    /// mirrors of a segment.
    permanent_addr: u64,

    size: u64,
    data: RegionData,
}

impl RegionSnapshot {
    /// Capture `size` bytes at `permanent_addr` as a single copy.
    pub fn dense<S: AddressSpace + ?Sized>(
        space: &S,
        region_type: RegionType,
        start_addr: u64,
        permanent_addr: u64,
        size: u64,
    ) -> StoreResult<Self> {
        let mut data = vec![0; size as usize].into_boxed_slice();
        space.read_bytes(permanent_addr, &mut data)?;
        Ok(Self { region_type, start_addr, permanent_addr, size, data: RegionData::Dense(data) })
    }

    /// Capture `size` bytes at `permanent_addr` page by page into `store`.
    ///
    /// When `reference` is a sparse capture of the same region, every page that is not soft-dirty
    /// reuses the reference's page instead of reading the target's memory. Callers must only
    /// provide a reference if soft-dirty bits were reset right after `reference` was captured or
    /// restored.
    pub fn sparse<S: AddressSpace + ?Sized>(
        space: &S,
        store: &PageStore,
        region_type: RegionType,
        start_addr: u64,
        permanent_addr: u64,
        size: u64,
        reference: Option<&RegionSnapshot>,
    ) -> StoreResult<Self> {
        if !is_page_aligned(permanent_addr) || !is_page_aligned(size) {
            return Err(StoreError::Misaligned { addr: permanent_addr, size });
        }

        let count = page_count(size);
        let reference = reference
            .filter(|r| r.permanent_addr == permanent_addr)
            .and_then(|r| r.page_list())
            .filter(|r| r.store().same_store(store));

        let mut pagemap = vec![];
        if reference.is_some() {
            pagemap.resize(count, 0);
            space.read_pagemap(page_number(permanent_addr), &mut pagemap)?;
        }

        let mut pages = PageList::with_capacity(store, count);
        let mut buf = vec![0; PAGE_SIZE];
        let mut reused = 0;
        for i in 0..count {
            if let Some(index) = reference.and_then(|r| r.get(i)) {
                if !is_soft_dirty(pagemap[i]) {
                    pages.push_shared(index);
                    reused += 1;
                    continue;
                }
            }
            let addr = permanent_addr + (i * PAGE_SIZE) as u64;
            space.read_bytes(addr, &mut buf)?;
            pages.push_data(&buf)?;
        }

        tracing::trace!(
            "sparse capture of {permanent_addr:#x}: {count} pages ({reused} reused, {} read)",
            count - reused
        );
        Ok(Self { region_type, start_addr, permanent_addr, size, data: RegionData::Sparse(pages) })
    }

    /// Write the saved content back to the target's memory.
    ///
    /// For sparse regions, pages that are not soft-dirty and are shared with `reference` already
    /// hold the right content and are skipped. The same reset requirement as [Self::sparse]
    /// applies to `reference`.
    pub fn restore<S: AddressSpace + ?Sized>(
        &self,
        space: &mut S,
        reference: Option<&RegionSnapshot>,
    ) -> StoreResult<()> {
        let pages = match &self.data {
            RegionData::Dense(bytes) => return space.write_bytes(self.permanent_addr, bytes),
            RegionData::Sparse(pages) => pages,
        };

        let reference = reference
            .filter(|r| r.permanent_addr == self.permanent_addr)
            .and_then(|r| r.page_list())
            .filter(|r| r.store().same_store(pages.store()));

        let mut pagemap = vec![];
        if reference.is_some() {
            pagemap.resize(pages.len(), 0);
            space.read_pagemap(page_number(self.permanent_addr), &mut pagemap)?;
        }

        let mut buf = vec![0; PAGE_SIZE];
        let mut skipped = 0;
        for (i, index) in pages.pages().iter().enumerate() {
            if reference.and_then(|r| r.get(i)) == Some(*index) && !is_soft_dirty(pagemap[i]) {
                skipped += 1;
                continue;
            }
            pages.store().read_page(*index, &mut buf);
            space.write_bytes(self.permanent_addr + (i * PAGE_SIZE) as u64, &buf)?;
        }

        tracing::trace!(
            "restored {:#x}: {} pages ({skipped} skipped)",
            self.permanent_addr,
            pages.len()
        );
        Ok(())
    }

    pub fn region_type(&self) -> RegionType {
        self.region_type
    }

    pub fn start_addr(&self) -> u64 {
        self.start_addr
    }

    pub fn permanent_addr(&self) -> u64 {
        self.permanent_addr
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn data(&self) -> &RegionData {
        &self.data
    }

    pub fn page_list(&self) -> Option<&PageList> {
        match &self.data {
            RegionData::Sparse(pages) => Some(pages),
            RegionData::Dense(_) => None,
        }
    }

    /// Copy saved bytes, starting `offset` bytes into the region, into `buf`.
    pub fn read_saved(&self, offset: u64, buf: &mut [u8]) {
        assert!(offset + buf.len() as u64 <= self.size, "read outside of saved region");
        match &self.data {
            RegionData::Dense(bytes) => {
                buf.copy_from_slice(&bytes[offset as usize..offset as usize + buf.len()])
            }
            RegionData::Sparse(pages) => {
                let mut done = 0;
                while done < buf.len() {
                    let pos = offset as usize + done;
                    let (page, page_offset) = (pos / PAGE_SIZE, pos % PAGE_SIZE);
                    let len = (PAGE_SIZE - page_offset).min(buf.len() - done);
                    pages.store().with_page(pages.pages()[page], |data| {
                        buf[done..done + len].copy_from_slice(&data[page_offset..page_offset + len])
                    });
                    done += len;
                }
            }
        }
    }

    /// Returns whether both regions saved the same content for the same range.
    pub fn content_eq(&self, other: &RegionSnapshot) -> bool {
        if self.size != other.size || self.permanent_addr != other.permanent_addr {
            return false;
        }

        if let (Some(a), Some(b)) = (self.page_list(), other.page_list()) {
            if a.store().same_store(b.store()) {
                // Live pages are deduplicated, so equal content implies an equal index.
                return a.pages() == b.pages();
            }
        }

        let mut a = vec![0; PAGE_SIZE];
        let mut b = vec![0; PAGE_SIZE];
        let mut offset = 0;
        while offset < self.size {
            let len = (self.size - offset).min(PAGE_SIZE as u64) as usize;
            self.read_saved(offset, &mut a[..len]);
            other.read_saved(offset, &mut b[..len]);
            if a[..len] != b[..len] {
                return false;
            }
            offset += len as u64;
        }
        true
    }

    /// Feed the saved content into `state`.
    pub fn hash_content<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.permanent_addr);
        state.write_u64(self.size);
        match &self.data {
            RegionData::Dense(bytes) => state.write(bytes),
            RegionData::Sparse(pages) => {
                for index in pages.pages() {
                    state.write_u64(pages.store().page_hash(*index));
                }
            }
        }
    }
}
