use super::{DiskSpaceManager, Partition};
use crate::storage::{PageId, PartitionId, StorageError, StorageResult};
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// File-backed disk space manager: one file per partition under `dir`,
/// named by its partition number.
///
/// The manager lock guards only the id → partition map. Page I/O happens
/// under the partition lock. Lock order is manager → partition.
pub struct DiskManager {
    dir: PathBuf,
    partitions: Mutex<HashMap<PartitionId, Arc<Mutex<Partition>>>>,
    partition_counter: AtomicU32,
}

impl DiskManager {
    /// Open a store rooted at `dir`, reopening every partition file in it.
    pub fn open(dir: &Path) -> StorageResult<Self> {
        fs::create_dir_all(dir)?;
        let manager = Self {
            dir: dir.to_path_buf(),
            partitions: Mutex::new(HashMap::new()),
            partition_counter: AtomicU32::new(0),
        };

        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let name = entry.file_name();
            match name.to_str().and_then(|s| s.parse::<PartitionId>().ok()) {
                Some(partition) => {
                    manager.allocate_partition_at(partition)?;
                }
                None => warn!("Skipping non-partition file {:?} in {:?}", name, dir),
            }
        }

        info!(
            "Opened disk manager at {:?} with {} partitions",
            dir,
            manager.partitions.lock().len()
        );
        Ok(manager)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn partition_path(&self, partition: PartitionId) -> PathBuf {
        self.dir.join(partition.to_string())
    }

    fn register_partition(&self, partition: PartitionId) -> StorageResult<PartitionId> {
        let slot = Arc::new(Mutex::new(Partition::unopened(
            partition,
            self.partition_path(partition),
        )));

        let load_result = {
            let mut partitions = self.partitions.lock();
            if partitions.contains_key(&partition) {
                return Err(StorageError::AlreadyInUse(partition));
            }
            partitions.insert(partition, slot.clone());
            let mut part = slot.lock();
            drop(partitions);
            part.load()
        };

        if let Err(e) = load_result {
            self.partitions.lock().remove(&partition);
            return Err(e);
        }
        info!("Allocated partition {}", partition);
        Ok(partition)
    }

    fn partition(&self, partition: PartitionId) -> StorageResult<Arc<Mutex<Partition>>> {
        self.partitions
            .lock()
            .get(&partition)
            .cloned()
            .ok_or(StorageError::NotFound(partition))
    }
}

impl DiskSpaceManager for DiskManager {
    fn allocate_partition(&self) -> StorageResult<PartitionId> {
        let partition = self.partition_counter.fetch_add(1, Ordering::SeqCst);
        self.register_partition(partition)
    }

    fn allocate_partition_at(&self, partition: PartitionId) -> StorageResult<PartitionId> {
        self.partition_counter
            .fetch_max(partition.saturating_add(1), Ordering::SeqCst);
        self.register_partition(partition)
    }

    fn free_partition(&self, partition: PartitionId) -> StorageResult<()> {
        let slot = {
            let mut partitions = self.partitions.lock();
            partitions
                .remove(&partition)
                .ok_or(StorageError::NotFound(partition))?
        };

        let mut part = slot.lock();
        part.free_all_pages()?;
        part.close();
        fs::remove_file(part.path())?;
        info!("Freed partition {}", partition);
        Ok(())
    }

    fn allocate_page(&self, partition: PartitionId) -> StorageResult<PageId> {
        let slot = self.partition(partition)?;
        let local = slot.lock().allocate_page()?;
        let page = PageId::new(partition, local);
        debug!("Allocated page {}", page);
        Ok(page)
    }

    fn allocate_page_at(&self, page: PageId) -> StorageResult<PageId> {
        let slot = self.partition(page.partition())?;
        slot.lock().allocate_page_at(page.local())?;
        debug!("Allocated page {}", page);
        Ok(page)
    }

    fn free_page(&self, page: PageId) -> StorageResult<()> {
        let slot = self.partition(page.partition())?;
        slot.lock().free_page(page.local())?;
        debug!("Freed page {}", page);
        Ok(())
    }

    fn read_page(&self, page: PageId, buf: &mut [u8]) -> StorageResult<()> {
        super::check_page_buffer(buf.len())?;
        let slot = self.partition(page.partition())?;
        let mut part = slot.lock();
        part.read_page(page.local(), buf)
    }

    fn write_page(&self, page: PageId, buf: &[u8]) -> StorageResult<()> {
        super::check_page_buffer(buf.len())?;
        let slot = self.partition(page.partition())?;
        let mut part = slot.lock();
        part.write_page(page.local(), buf)
    }

    fn is_allocated(&self, page: PageId) -> bool {
        match self.partition(page.partition()) {
            Ok(slot) => slot.lock().is_allocated(page.local()).unwrap_or(false),
            Err(_) => false,
        }
    }

    fn partition_ids(&self) -> Vec<PartitionId> {
        let mut ids: Vec<_> = self.partitions.lock().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    fn allocated_page_count(&self, partition: PartitionId) -> StorageResult<u64> {
        let slot = self.partition(partition)?;
        let count = slot.lock().allocated_pages();
        Ok(count)
    }

    fn current_partition_counter(&self) -> PartitionId {
        self.partition_counter.load(Ordering::SeqCst)
    }
}
