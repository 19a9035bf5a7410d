use crate::{
    is_page_aligned, page_count, page_number, StoreError, StoreResult, PAGE_PRESENT, PAGE_SIZE,
    SOFT_DIRTY,
};

/// Access to the memory of a (possibly remote) process.
pub trait AddressSpace {
    /// Read `buf.len()` bytes starting at `addr`.
    fn read_bytes(&self, addr: u64, buf: &mut [u8]) -> StoreResult<()>;

    /// Write `buf` to memory starting at `addr`.
    fn write_bytes(&mut self, addr: u64, buf: &[u8]) -> StoreResult<()>;

    /// Fill `len` bytes starting at `addr` with zeroes.
    fn clear_bytes(&mut self, addr: u64, len: usize) -> StoreResult<()> {
        let zeroes = [0; PAGE_SIZE];
        let mut offset = 0;
        while offset < len {
            let chunk = (len - offset).min(PAGE_SIZE);
            self.write_bytes(addr + offset as u64, &zeroes[..chunk])?;
            offset += chunk;
        }
        Ok(())
    }

    /// Read the pagemap entries of `out.len()` consecutive pages starting at page `first_page`.
    fn read_pagemap(&self, first_page: u64, out: &mut [u64]) -> StoreResult<()>;

    /// Clear the soft-dirty bit of every page of the address space.
    fn reset_soft_dirty(&mut self) -> StoreResult<()>;
}

struct Mapping {
    start: u64,
    data: Vec<u8>,
    dirty: Vec<bool>,
}

impl Mapping {
    fn end(&self) -> u64 {
        self.start + self.data.len() as u64
    }
}

/// An address space backed by host buffers that tracks soft-dirty bits the way the kernel does.
///
/// Newly mapped pages start dirty.
#[derive(Default)]
pub struct BufferSpace {
    mappings: Vec<Mapping>,

    /// The number of pages touched by `write_bytes` since the last call to `take_page_writes`.
    page_writes: usize,
}

impl BufferSpace {
    pub fn new() -> Self {
        Self::default()
    }

    /// Map `size` bytes of zeroed memory at `start`.
    pub fn map(&mut self, start: u64, size: u64) {
        assert!(is_page_aligned(start) && is_page_aligned(size), "unaligned mapping");
        assert!(
            self.mappings.iter().all(|m| start + size <= m.start || m.end() <= start),
            "overlapping mapping at {start:#x}"
        );
        self.mappings.push(Mapping {
            start,
            data: vec![0; size as usize],
            dirty: vec![true; page_count(size)],
        });
    }

    /// Returns the number of pages written since the previous call.
    pub fn take_page_writes(&mut self) -> usize {
        std::mem::take(&mut self.page_writes)
    }

    /// Returns the number of pages that are currently soft-dirty.
    pub fn dirty_pages(&self) -> usize {
        self.mappings.iter().map(|m| m.dirty.iter().filter(|x| **x).count()).sum()
    }

    fn find(&self, addr: u64, len: usize) -> StoreResult<usize> {
        self.mappings
            .iter()
            .position(|m| m.start <= addr && addr + len as u64 <= m.end())
            .ok_or_else(|| {
                let err = std::io::Error::new(std::io::ErrorKind::InvalidInput, "unmapped memory");
                StoreError::io(addr, len, err)
            })
    }
}

impl AddressSpace for BufferSpace {
    fn read_bytes(&self, addr: u64, buf: &mut [u8]) -> StoreResult<()> {
        let mapping = &self.mappings[self.find(addr, buf.len())?];
        let offset = (addr - mapping.start) as usize;
        buf.copy_from_slice(&mapping.data[offset..offset + buf.len()]);
        Ok(())
    }

    fn write_bytes(&mut self, addr: u64, buf: &[u8]) -> StoreResult<()> {
        if buf.is_empty() {
            return Ok(());
        }
        let id = self.find(addr, buf.len())?;
        let mapping = &mut self.mappings[id];
        let offset = (addr - mapping.start) as usize;
        mapping.data[offset..offset + buf.len()].copy_from_slice(buf);

        let first = page_number(addr - mapping.start) as usize;
        let last = page_number(addr - mapping.start + buf.len() as u64 - 1) as usize;
        mapping.dirty[first..=last].fill(true);
        self.page_writes += last - first + 1;
        Ok(())
    }

    fn read_pagemap(&self, first_page: u64, out: &mut [u64]) -> StoreResult<()> {
        for (i, entry) in out.iter_mut().enumerate() {
            let addr = (first_page + i as u64) * PAGE_SIZE as u64;
            *entry = match self.mappings.iter().find(|m| m.start <= addr && addr < m.end()) {
                Some(m) if m.dirty[page_number(addr - m.start) as usize] => {
                    PAGE_PRESENT | SOFT_DIRTY
                }
                Some(_) => PAGE_PRESENT,
                None => 0,
            };
        }
        Ok(())
    }

    fn reset_soft_dirty(&mut self) -> StoreResult<()> {
        for mapping in &mut self.mappings {
            mapping.dirty.fill(false);
        }
        Ok(())
    }
}
