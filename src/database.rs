use crate::access::PageDirectory;
use crate::config::StoreConfig;
use crate::storage::{BufferPool, DiskManager, DiskSpaceManager, PageId, PartitionId, StorageError, StorageResult};
use log::info;
use std::sync::Arc;

/// Store opened from a [`StoreConfig`]: the partition files, a buffer pool
/// over them and access to page directories.
pub struct Database {
    disk: Arc<DiskManager>,
    buffer_pool: BufferPool,
}

impl Database {
    /// Open the store in `config.data_dir`, creating the directory if needed.
    pub fn open(config: &StoreConfig) -> StorageResult<Self> {
        if config.buffer_capacity == 0 {
            return Err(StorageError::InvalidArgument(
                "buffer pool needs at least one frame".to_string(),
            ));
        }
        let disk = Arc::new(DiskManager::open(&config.data_dir)?);
        let buffer_pool = BufferPool::new(disk.clone(), config.buffer_capacity);
        info!(
            "Opened store at {} with {} partitions and {} buffer frames",
            config.data_dir.display(),
            disk.partition_ids().len(),
            config.buffer_capacity
        );
        Ok(Self { disk, buffer_pool })
    }

    pub fn disk(&self) -> &Arc<DiskManager> {
        &self.disk
    }

    pub fn buffer_pool(&self) -> &BufferPool {
        &self.buffer_pool
    }

    /// Start a new page directory in `partition`. Its first header page is
    /// freshly allocated; keep `first_header()` of the result to reopen it.
    pub fn create_directory(&self, partition: PartitionId) -> StorageResult<PageDirectory> {
        let first_header = self.disk.allocate_page(partition)?;
        PageDirectory::open(self.buffer_pool.clone(), partition, first_header)
    }

    pub fn open_directory(&self, partition: PartitionId, first_header: PageId) -> StorageResult<PageDirectory> {
        PageDirectory::open(self.buffer_pool.clone(), partition, first_header)
    }

    /// Write back every dirty page.
    pub fn close(self) -> StorageResult<()> {
        self.buffer_pool.flush_all()?;
        info!("Closed store at {}", self.disk.dir().display());
        Ok(())
    }
}
