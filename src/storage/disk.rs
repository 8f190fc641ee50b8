//! Physical page store.
//!
//! A partition is one OS file laid out as a master page, followed by blocks of
//! one header page plus [`DATA_PAGES_PER_HEADER`] data pages:
//!
//! ```text
//! | master | header 0 | data 0 .. data N-1 | header 1 | data N .. | ...
//! ```
//!
//! The master page holds a big-endian `u16` allocation count per header page;
//! each header page is a bitmap with one bit per data page in its block.

pub mod bitmap;
pub mod manager;
pub mod memory;
pub mod partition;

use crate::storage::{PageId, PartitionId, StorageResult, PAGE_SIZE};

pub use bitmap::HeaderBitmap;
pub use manager::DiskManager;
pub use memory::MemoryDiskManager;
pub use partition::Partition;

/// Number of header pages tracked by one master page (one `u16` each).
pub const HEADER_PAGES_PER_MASTER: usize = PAGE_SIZE / 2;

/// Number of data pages tracked by one header page (one bit each).
pub const DATA_PAGES_PER_HEADER: usize = PAGE_SIZE * 8;

/// Capacity of a single partition in data pages.
pub const DATA_PAGES_PER_PARTITION: u64 =
    (HEADER_PAGES_PER_MASTER as u64) * (DATA_PAGES_PER_HEADER as u64);

/// Page-granular storage keyed by virtual page number.
///
/// Implementations are shared between threads; each call takes whatever
/// internal locks it needs and releases them before returning.
pub trait DiskSpaceManager: Send + Sync {
    /// Allocate a partition with the next unused id.
    fn allocate_partition(&self) -> StorageResult<PartitionId>;

    /// Allocate (or reopen) the partition with a specific id.
    fn allocate_partition_at(&self, partition: PartitionId) -> StorageResult<PartitionId>;

    /// Release every page of a partition and delete its backing storage.
    fn free_partition(&self, partition: PartitionId) -> StorageResult<()>;

    /// Allocate the first free page in a partition.
    fn allocate_page(&self, partition: PartitionId) -> StorageResult<PageId>;

    /// Allocate a specific page.
    fn allocate_page_at(&self, page: PageId) -> StorageResult<PageId>;

    fn free_page(&self, page: PageId) -> StorageResult<()>;

    /// Read a whole page into `buf`, which must be exactly [`PAGE_SIZE`] bytes.
    fn read_page(&self, page: PageId, buf: &mut [u8]) -> StorageResult<()>;

    /// Write a whole page and force it to stable storage.
    fn write_page(&self, page: PageId, buf: &[u8]) -> StorageResult<()>;

    /// Whether `page` is currently allocated. Unknown partitions and
    /// out-of-range pages report `false`.
    fn is_allocated(&self, page: PageId) -> bool;

    fn partition_ids(&self) -> Vec<PartitionId>;

    fn allocated_page_count(&self, partition: PartitionId) -> StorageResult<u64>;

    /// Next id `allocate_partition` will hand out.
    fn current_partition_counter(&self) -> PartitionId;
}

pub(crate) fn check_page_buffer(len: usize) -> StorageResult<()> {
    if len != PAGE_SIZE {
        return Err(crate::storage::StorageError::InvalidArgument(format!(
            "buffer size must be PAGE_SIZE ({}), got {}",
            PAGE_SIZE, len
        )));
    }
    Ok(())
}
