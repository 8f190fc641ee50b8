//! Buffer pool: pin-counted page frames over a [`DiskSpaceManager`].
//!
//! Write-back policy is no-force/steal. Writes stay in memory until a frame
//! is flushed explicitly or evicted, and an unpinned dirty frame may be
//! evicted (and written) at any time. Recovery relies on the page LSN kept
//! in the reserved region of each page.
//!
//! Lock order is manager lock → frame lock. The manager lock covers cache
//! lookups and victim selection only; page I/O happens under the frame lock.

pub mod frame;
pub mod lru;
pub mod page;
pub mod strategy;

use crate::storage::disk::DiskSpaceManager;
use crate::storage::{PageId, PartitionId, StorageError, StorageResult};
use frame::IoContext;
use log::{debug, warn};
use parking_lot::{Mutex, MutexGuard};
use std::collections::HashMap;
use std::sync::Arc;

pub use frame::{Frame, PageKind, EFFECTIVE_PAGE_SIZE, RESERVED_SPACE};
pub use lru::LruStrategy;
pub use page::{Page, PageBuffer, PinGuard};
pub use strategy::CacheStrategy;

#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<BufferPoolInner>,
}

struct BufferPoolInner {
    io: Arc<IoContext>,
    manager: Mutex<ManagerState>,
}

struct ManagerState {
    cache: Box<dyn CacheStrategy>,
    /// Frames that left the cache and may still be writing back. A miss on
    /// one of these pages waits on the frame lock before reading from disk.
    write_backs: HashMap<PageId, Arc<Frame>>,
}

impl BufferPool {
    /// Pool of `capacity` frames with LRU replacement.
    pub fn new(disk: Arc<dyn DiskSpaceManager>, capacity: usize) -> Self {
        Self::with_strategy(disk, Box::new(LruStrategy::new(capacity)))
    }

    pub fn with_strategy(disk: Arc<dyn DiskSpaceManager>, strategy: Box<dyn CacheStrategy>) -> Self {
        Self {
            inner: Arc::new(BufferPoolInner {
                io: Arc::new(IoContext::new(disk)),
                manager: Mutex::new(ManagerState {
                    cache: strategy,
                    write_backs: HashMap::new(),
                }),
            }),
        }
    }

    pub fn disk(&self) -> &Arc<dyn DiskSpaceManager> {
        &self.inner.io.disk
    }

    /// Pinned handle to `page`, reading it from disk on a miss.
    pub fn fetch_page(&self, page: PageId) -> StorageResult<Page> {
        self.fetch_frame(page, PageKind::Data, false)
    }

    /// Like [`fetch_page`](Self::fetch_page) for a log page, which has no
    /// reserved region.
    pub fn fetch_log_page(&self, page: PageId) -> StorageResult<Page> {
        self.fetch_frame(page, PageKind::Log, false)
    }

    /// Allocate a page in `partition` and return it pinned. Nothing is read
    /// from disk; the caller initializes the content.
    pub fn fetch_new_page(&self, partition: PartitionId) -> StorageResult<Page> {
        self.fetch_new(partition, PageKind::Data)
    }

    pub fn fetch_new_log_page(&self, partition: PartitionId) -> StorageResult<Page> {
        self.fetch_new(partition, PageKind::Log)
    }

    fn fetch_new(&self, partition: PartitionId, kind: PageKind) -> StorageResult<Page> {
        let disk = &self.inner.io.disk;
        let page = disk.allocate_page(partition)?;
        self.fetch_frame(page, kind, true).map_err(|e| {
            // Give the page back so a failed fetch does not leak it.
            if let Err(free_err) = disk.free_page(page) {
                warn!("Cannot release page {} after failed fetch: {}", page, free_err);
            }
            e
        })
    }

    fn fetch_frame(&self, page: PageId, kind: PageKind, newly_allocated: bool) -> StorageResult<Page> {
        let io = &self.inner.io;
        if !io.disk.is_allocated(page) {
            return Err(StorageError::NotAllocated(page));
        }

        let mut manager = self.inner.manager.lock();
        if let Some(frame) = manager.cache.get(page) {
            frame.pin_cached();
            frame.set_kind(kind);
            return Ok(Page::new(frame));
        }

        let pending = manager.write_backs.get(&page).cloned();
        let frame = Arc::new(Frame::new(page, kind, io.clone()));
        frame.pin_cached();
        let victim = loop {
            let victim = match manager.cache.put(page, frame.clone()) {
                Ok(victim) => victim,
                Err(e) => {
                    warn!(
                        "Cannot cache page {}: {} ({} frames)",
                        page,
                        e,
                        manager.cache.capacity()
                    );
                    return Err(e);
                }
            };
            match victim {
                Some(victim) if !victim.try_retire(false) => {
                    // Pinned through a handle after it was chosen. Put it
                    // back and let the strategy pick another frame.
                    manager.cache.remove(page);
                    manager.cache.put(victim.page_id(), victim)?;
                }
                victim => break victim,
            }
        };
        if let Some(victim) = &victim {
            manager
                .write_backs
                .insert(victim.page_id(), victim.clone());
        }
        let mut state = frame.lock_state();
        drop(manager);

        if let Some(victim) = &victim {
            debug!("Evicting page {} to load {}", victim.page_id(), page);
            match victim.invalidate() {
                Ok(()) => self.finish_write_back(victim),
                // The victim keeps its bytes in the write-back table.
                Err(e) => warn!("Write-back of page {} failed: {}", victim.page_id(), e),
            }
        }

        let mut adopted = false;
        let loaded = if newly_allocated {
            Ok(())
        } else {
            if let Some(pending) = &pending {
                // Blocks until an in-flight write-back finishes, then takes
                // the bytes over if that write-back failed.
                let mut pending_state = pending.lock_state();
                adopted = Frame::adopt_locked(&mut state, &mut pending_state);
            }
            if adopted {
                Ok(())
            } else {
                frame.load_locked(&mut state)
            }
        };
        drop(state);

        if adopted {
            if let Some(pending) = &pending {
                debug!("Page {} recovered from a failed write-back", page);
                self.finish_write_back(pending);
            }
        }

        match loaded {
            Ok(()) => Ok(Page::new(frame)),
            Err(e) => {
                let mut manager = self.inner.manager.lock();
                if manager
                    .cache
                    .peek(page)
                    .is_some_and(|cached| Arc::ptr_eq(&cached, &frame))
                {
                    manager.cache.remove(page);
                }
                drop(manager);
                frame.discard();
                Err(e)
            }
        }
    }

    /// Flush, invalidate and uncache the page's frame, then free the page on
    /// disk. Handles to the page may only be unpinned afterwards.
    pub fn free_page(&self, page: &Page) -> StorageResult<()> {
        let page_id = page.page_id();
        let manager = self.inner.manager.lock();
        match manager.cache.peek(page_id) {
            Some(frame) => self.retire(manager, frame, true)?,
            None => {
                drop(manager);
                page.frame().invalidate()?;
                self.finish_write_back(page.frame());
            }
        }
        self.inner.io.disk.free_page(page_id)
    }

    /// Invalidate every cached frame of `partition`, pinned or not, then
    /// free the partition on disk.
    pub fn free_partition(&self, partition: PartitionId) -> StorageResult<()> {
        let frames: Vec<_> = self
            .inner
            .manager
            .lock()
            .cache
            .frames()
            .into_iter()
            .filter(|f| f.page_id().partition() == partition)
            .collect();

        for frame in frames {
            let manager = self.inner.manager.lock();
            if manager
                .cache
                .peek(frame.page_id())
                .is_some_and(|cached| Arc::ptr_eq(&cached, &frame))
            {
                self.retire(manager, frame, true)?;
            }
        }
        self.inner.io.disk.free_partition(partition)
    }

    /// Evict `page` if it is cached and unpinned; otherwise do nothing.
    ///
    /// If the write-back fails the error is returned, but the dirty bytes
    /// stay with the pool: the next fetch of the page takes them over and
    /// [`flush_all`](Self::flush_all) retries the write.
    pub fn evict(&self, page: PageId) -> StorageResult<()> {
        let manager = self.inner.manager.lock();
        match manager.cache.peek(page) {
            Some(frame) => self.retire(manager, frame, false),
            None => Ok(()),
        }
    }

    /// Evict every unpinned frame.
    pub fn evict_all(&self) -> StorageResult<()> {
        let pages: Vec<_> = self
            .inner
            .manager
            .lock()
            .cache
            .frames()
            .iter()
            .map(|f| f.page_id())
            .collect();
        for page in pages {
            self.evict(page)?;
        }
        Ok(())
    }

    /// Write back every dirty frame without evicting anything, and retry
    /// write-backs of evicted frames that failed earlier.
    pub fn flush_all(&self) -> StorageResult<()> {
        let (frames, pending) = {
            let manager = self.inner.manager.lock();
            let pending: Vec<_> = manager.write_backs.values().cloned().collect();
            (manager.cache.frames(), pending)
        };
        for frame in frames {
            frame.flush()?;
        }
        for frame in pending {
            frame.invalidate()?;
            self.finish_write_back(&frame);
        }
        Ok(())
    }

    /// Page reads and writes issued by this pool.
    pub fn num_ios(&self) -> u64 {
        self.inner.io.num_ios()
    }

    pub fn cached_pages(&self) -> usize {
        self.inner.manager.lock().cache.len()
    }

    pub fn capacity(&self) -> usize {
        self.inner.manager.lock().cache.capacity()
    }

    /// Remove `frame` from the cache and invalidate it. Takes the manager
    /// guard so the frame is retired before the manager lock is released.
    /// Unless `force` is set, a frame pinned by a handle stays cached.
    ///
    /// A frame whose write-back fails stays in the write-back table with
    /// its dirty bytes.
    fn retire(
        &self,
        mut manager: MutexGuard<'_, ManagerState>,
        frame: Arc<Frame>,
        force: bool,
    ) -> StorageResult<()> {
        let page = frame.page_id();
        if !frame.try_retire(force) {
            return Ok(());
        }
        manager.cache.remove(page);
        manager.write_backs.insert(page, frame.clone());
        drop(manager);

        debug!("Invalidating page {}", page);
        if let Err(e) = frame.invalidate() {
            warn!("Write-back of page {} failed: {}", page, e);
            return Err(e);
        }
        self.finish_write_back(&frame);
        Ok(())
    }

    fn finish_write_back(&self, frame: &Arc<Frame>) {
        let mut manager = self.inner.manager.lock();
        let page = frame.page_id();
        if manager
            .write_backs
            .get(&page)
            .is_some_and(|pending| Arc::ptr_eq(pending, frame))
        {
            manager.write_backs.remove(&page);
        }
    }
}
