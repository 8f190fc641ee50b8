use super::{check_page_buffer, DiskSpaceManager, DATA_PAGES_PER_PARTITION};
use crate::storage::{PageId, PartitionId, StorageError, StorageResult, PAGE_SIZE};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU32, Ordering};

type PageMap = BTreeMap<u64, Box<[u8; PAGE_SIZE]>>;

/// Disk space manager that keeps every partition in memory.
///
/// Same allocation and error semantics as [`super::DiskManager`]; nothing
/// survives the process.
#[derive(Default)]
pub struct MemoryDiskManager {
    partitions: Mutex<HashMap<PartitionId, PageMap>>,
    partition_counter: AtomicU32,
}

impl MemoryDiskManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn register(&self, partition: PartitionId) -> StorageResult<PartitionId> {
        let mut partitions = self.partitions.lock();
        if partitions.contains_key(&partition) {
            return Err(StorageError::AlreadyInUse(partition));
        }
        partitions.insert(partition, BTreeMap::new());
        Ok(partition)
    }

    fn check_range(local: u64) -> StorageResult<()> {
        if local >= DATA_PAGES_PER_PARTITION {
            return Err(StorageError::OutOfRange {
                local,
                max: DATA_PAGES_PER_PARTITION - 1,
            });
        }
        Ok(())
    }
}

impl DiskSpaceManager for MemoryDiskManager {
    fn allocate_partition(&self) -> StorageResult<PartitionId> {
        let partition = self.partition_counter.fetch_add(1, Ordering::SeqCst);
        self.register(partition)
    }

    fn allocate_partition_at(&self, partition: PartitionId) -> StorageResult<PartitionId> {
        self.partition_counter
            .fetch_max(partition.saturating_add(1), Ordering::SeqCst);
        self.register(partition)
    }

    fn free_partition(&self, partition: PartitionId) -> StorageResult<()> {
        self.partitions
            .lock()
            .remove(&partition)
            .map(|_| ())
            .ok_or(StorageError::NotFound(partition))
    }

    fn allocate_page(&self, partition: PartitionId) -> StorageResult<PageId> {
        let mut partitions = self.partitions.lock();
        let pages = partitions
            .get_mut(&partition)
            .ok_or(StorageError::NotFound(partition))?;

        // Keys are sorted, so the first gap is the first free page.
        let mut local = 0;
        for &used in pages.keys() {
            if used != local {
                break;
            }
            local += 1;
        }
        if local >= DATA_PAGES_PER_PARTITION {
            return Err(StorageError::PartitionFull(partition));
        }
        pages.insert(local, Box::new([0u8; PAGE_SIZE]));
        Ok(PageId::new(partition, local))
    }

    fn allocate_page_at(&self, page: PageId) -> StorageResult<PageId> {
        Self::check_range(page.local())?;
        let mut partitions = self.partitions.lock();
        let pages = partitions
            .get_mut(&page.partition())
            .ok_or(StorageError::NotFound(page.partition()))?;
        if pages.contains_key(&page.local()) {
            return Err(StorageError::AlreadyAllocated(page));
        }
        pages.insert(page.local(), Box::new([0u8; PAGE_SIZE]));
        Ok(page)
    }

    fn free_page(&self, page: PageId) -> StorageResult<()> {
        Self::check_range(page.local())?;
        let mut partitions = self.partitions.lock();
        let pages = partitions
            .get_mut(&page.partition())
            .ok_or(StorageError::NotFound(page.partition()))?;
        pages
            .remove(&page.local())
            .map(|_| ())
            .ok_or(StorageError::NotAllocated(page))
    }

    fn read_page(&self, page: PageId, buf: &mut [u8]) -> StorageResult<()> {
        check_page_buffer(buf.len())?;
        Self::check_range(page.local())?;
        let partitions = self.partitions.lock();
        let data = partitions
            .get(&page.partition())
            .ok_or(StorageError::NotFound(page.partition()))?
            .get(&page.local())
            .ok_or(StorageError::NotAllocated(page))?;
        buf.copy_from_slice(data.as_ref());
        Ok(())
    }

    fn write_page(&self, page: PageId, buf: &[u8]) -> StorageResult<()> {
        check_page_buffer(buf.len())?;
        Self::check_range(page.local())?;
        let mut partitions = self.partitions.lock();
        let data = partitions
            .get_mut(&page.partition())
            .ok_or(StorageError::NotFound(page.partition()))?
            .get_mut(&page.local())
            .ok_or(StorageError::NotAllocated(page))?;
        data.copy_from_slice(buf);
        Ok(())
    }

    fn is_allocated(&self, page: PageId) -> bool {
        self.partitions
            .lock()
            .get(&page.partition())
            .map(|pages| pages.contains_key(&page.local()))
            .unwrap_or(false)
    }

    fn partition_ids(&self) -> Vec<PartitionId> {
        let mut ids: Vec<_> = self.partitions.lock().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    fn allocated_page_count(&self, partition: PartitionId) -> StorageResult<u64> {
        self.partitions
            .lock()
            .get(&partition)
            .map(|pages| pages.len() as u64)
            .ok_or(StorageError::NotFound(partition))
    }

    fn current_partition_counter(&self) -> PartitionId {
        self.partition_counter.load(Ordering::SeqCst)
    }
}
