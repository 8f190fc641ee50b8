use super::Frame;
use crate::storage::{PageId, StorageResult};
use std::fmt::Debug;
use std::sync::Arc;

/// Page → frame mapping with a replacement order.
///
/// Not synchronized; the buffer pool calls it only under its manager lock.
pub trait CacheStrategy: Send + Debug {
    /// Look up a frame and mark it as most recently used.
    fn get(&mut self, page: PageId) -> Option<Arc<Frame>>;

    /// Look up a frame without touching the replacement order.
    fn peek(&self, page: PageId) -> Option<Arc<Frame>>;

    /// Insert a frame. Returns the frame that left the cache to make room
    /// (an evicted victim, or a frame previously cached for `page`).
    /// Fails with `AllPinned` if the cache is full and nothing can be evicted.
    fn put(&mut self, page: PageId, frame: Arc<Frame>) -> StorageResult<Option<Arc<Frame>>>;

    /// Remove and return the oldest unpinned frame.
    fn evict(&mut self) -> StorageResult<Arc<Frame>>;

    fn remove(&mut self, page: PageId) -> Option<Arc<Frame>>;

    fn frames(&self) -> Vec<Arc<Frame>>;

    fn len(&self) -> usize;

    fn capacity(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
