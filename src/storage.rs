//! Storage layer implementation for tierdb.
//!
//! Pages flow through two layers here:
//!
//! - **Disk**: partitions backed by OS files, with a master page and bitmap
//!   header pages tracking which fixed-size data pages are allocated
//! - **Buffer**: pin-counted in-memory frames with a pluggable cache strategy
//!   and a no-force/steal write-back policy
//!
//! Every page is addressed by a global [`PageId`] that encodes the owning
//! partition and the local page number inside it.

pub mod buffer;
pub mod disk;
pub mod error;

use std::fmt;

pub use buffer::{BufferPool, Page, PageBuffer, PinGuard};
pub use disk::{DiskManager, DiskSpaceManager, MemoryDiskManager};
pub use error::{StorageError, StorageResult};

/// Size of every page on disk and in memory.
pub const PAGE_SIZE: usize = 4096;

/// Stride between partitions in the virtual page number space.
pub const MAX_PAGES_PER_PARTITION: u64 = 10_000_000_000;

pub type PartitionId = u32;

/// Global page identifier: `partition * MAX_PAGES_PER_PARTITION + local`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PageId(pub u64);

impl PageId {
    /// Sentinel for "no page"; stored on disk as the signed value -1.
    pub const INVALID: PageId = PageId(u64::MAX);

    pub fn new(partition: PartitionId, local: u64) -> Self {
        PageId(partition as u64 * MAX_PAGES_PER_PARTITION + local)
    }

    pub fn partition(&self) -> PartitionId {
        (self.0 / MAX_PAGES_PER_PARTITION) as PartitionId
    }

    pub fn local(&self) -> u64 {
        self.0 % MAX_PAGES_PER_PARTITION
    }

    pub fn is_valid(&self) -> bool {
        *self != Self::INVALID
    }

    /// Encoding used inside on-disk structures.
    pub fn to_i64(self) -> i64 {
        self.0 as i64
    }

    pub fn from_i64(raw: i64) -> Self {
        PageId(raw as u64)
    }
}

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_valid() {
            write!(f, "{}:{}", self.partition(), self.local())
        } else {
            write!(f, "invalid")
        }
    }
}
