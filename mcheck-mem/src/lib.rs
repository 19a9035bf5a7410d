pub mod page_store;
pub mod region;
pub mod space;

#[cfg(test)]
mod tests;

pub use crate::{
    page_store::{PageIndex, PageList, PageStore},
    region::{RegionData, RegionSnapshot, RegionType},
    space::{AddressSpace, BufferSpace},
};

/// The number of bits required to represent any offset within a page.
pub const OFFSET_BITS: usize = 12;

/// The number of bytes in a single page of the target.
pub const PAGE_SIZE: usize = 1 << OFFSET_BITS;

pub const PAGE_MASK: u64 = (PAGE_SIZE - 1) as u64;

/// The default limit on the number of distinct pages kept alive by a single page store.
///
/// Currently this limit is set so that the maximum corresponds to ~4 GB of host memory.
pub const MAX_PAGES: usize = 1_000_000;

/// Set in a `/proc/<pid>/pagemap` entry when the page was written since the last reset of the
/// soft-dirty bits.
pub const SOFT_DIRTY: u64 = 1 << 55;

/// Set in a `/proc/<pid>/pagemap` entry when the page is present in RAM.
pub const PAGE_PRESENT: u64 = 1 << 63;

/// Set in a `/proc/<pid>/pagemap` entry when the page is swapped.
pub const PAGE_SWAPPED: u64 = 1 << 62;

#[inline]
pub const fn align_down(value: u64, alignment: u64) -> u64 {
    value & !(alignment - 1)
}

#[inline]
pub const fn align_up(value: u64, alignment: u64) -> u64 {
    align_down(value + (alignment - 1), alignment)
}

#[inline]
pub const fn is_page_aligned(value: u64) -> bool {
    value & PAGE_MASK == 0
}

/// The number of the page containing `addr`.
#[inline]
pub const fn page_number(addr: u64) -> u64 {
    addr >> OFFSET_BITS
}

#[inline]
pub const fn page_offset(addr: u64) -> u64 {
    addr & PAGE_MASK
}

/// The number of pages needed to hold `size` bytes.
#[inline]
pub const fn page_count(size: u64) -> usize {
    (align_up(size, PAGE_SIZE as u64) >> OFFSET_BITS) as usize
}

/// Whether the pagemap `entry` reports the page as modified since the last soft-dirty reset.
///
/// Pages that are swapped out have no reliable soft-dirty state, so they are always treated as
/// dirty.
#[inline]
pub const fn is_soft_dirty(entry: u64) -> bool {
    entry & SOFT_DIRTY != 0 || entry & PAGE_SWAPPED != 0
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The page store reached its configured capacity.
    OutOfPages { capacity: usize },

    /// Accessing the target address space failed.
    Io { addr: u64, len: usize, kind: std::io::ErrorKind, message: String },

    /// A sparse region must start on a page boundary and have a page-multiple size.
    Misaligned { addr: u64, size: u64 },
}

impl StoreError {
    pub fn io(addr: u64, len: usize, err: std::io::Error) -> Self {
        Self::Io { addr, len, kind: err.kind(), message: err.to_string() }
    }

    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::OutOfPages { .. } => "OutOfPages",
            Self::Io { .. } => "Io",
            Self::Misaligned { .. } => "Misaligned",
        }
    }
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::OutOfPages { capacity } => {
                write!(f, "page store exceeded its capacity of {capacity} pages")
            }
            Self::Io { addr, len, message, .. } => {
                write!(f, "failed to access {len:#x} bytes at {addr:#x}: {message}")
            }
            Self::Misaligned { addr, size } => {
                write!(f, "sparse region at {addr:#x} (size={size:#x}) is not page aligned")
            }
        }
    }
}

impl std::error::Error for StoreError {}

pub type StoreResult<T> = Result<T, StoreError>;
