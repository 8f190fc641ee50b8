use super::strategy::CacheStrategy;
use super::Frame;
use crate::storage::{PageId, StorageError, StorageResult};
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug)]
struct Node {
    page: PageId,
    frame: Arc<Frame>,
    prev: Option<usize>,
    next: Option<usize>,
}

/// Least-recently-used cache strategy.
///
/// Entries live in an arena and form a doubly linked list through slot
/// indices, least recently used at `head`. Lookups, promotion and removal
/// are O(1); victim selection walks from `head` past pinned entries.
#[derive(Debug)]
pub struct LruStrategy {
    capacity: usize,
    nodes: Vec<Option<Node>>,
    free_slots: Vec<usize>,
    index: HashMap<PageId, usize>,
    head: Option<usize>,
    tail: Option<usize>,
}

impl LruStrategy {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            nodes: Vec::with_capacity(capacity),
            free_slots: Vec::new(),
            index: HashMap::with_capacity(capacity),
            head: None,
            tail: None,
        }
    }

    fn node(&self, slot: usize) -> &Node {
        self.nodes[slot].as_ref().expect("linked slot is occupied")
    }

    fn node_mut(&mut self, slot: usize) -> &mut Node {
        self.nodes[slot].as_mut().expect("linked slot is occupied")
    }

    fn detach(&mut self, slot: usize) {
        let (prev, next) = {
            let node = self.node(slot);
            (node.prev, node.next)
        };
        match prev {
            Some(p) => self.node_mut(p).next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.node_mut(n).prev = prev,
            None => self.tail = prev,
        }
        let node = self.node_mut(slot);
        node.prev = None;
        node.next = None;
    }

    fn push_back(&mut self, slot: usize) {
        let old_tail = self.tail;
        {
            let node = self.node_mut(slot);
            node.prev = old_tail;
            node.next = None;
        }
        match old_tail {
            Some(t) => self.node_mut(t).next = Some(slot),
            None => self.head = Some(slot),
        }
        self.tail = Some(slot);
    }

    fn remove_slot(&mut self, slot: usize) -> Arc<Frame> {
        self.detach(slot);
        let node = self.nodes[slot].take().expect("linked slot is occupied");
        self.index.remove(&node.page);
        self.free_slots.push(slot);
        node.frame
    }

    fn insert_node(&mut self, page: PageId, frame: Arc<Frame>) {
        let node = Node {
            page,
            frame,
            prev: None,
            next: None,
        };
        let slot = match self.free_slots.pop() {
            Some(slot) => {
                self.nodes[slot] = Some(node);
                slot
            }
            None => {
                self.nodes.push(Some(node));
                self.nodes.len() - 1
            }
        };
        self.index.insert(page, slot);
        self.push_back(slot);
    }
}

impl CacheStrategy for LruStrategy {
    fn get(&mut self, page: PageId) -> Option<Arc<Frame>> {
        let slot = *self.index.get(&page)?;
        self.detach(slot);
        self.push_back(slot);
        Some(self.node(slot).frame.clone())
    }

    fn peek(&self, page: PageId) -> Option<Arc<Frame>> {
        let slot = *self.index.get(&page)?;
        Some(self.node(slot).frame.clone())
    }

    fn put(&mut self, page: PageId, frame: Arc<Frame>) -> StorageResult<Option<Arc<Frame>>> {
        let displaced = if let Some(&slot) = self.index.get(&page) {
            Some(self.remove_slot(slot))
        } else if self.index.len() >= self.capacity {
            Some(self.evict()?)
        } else {
            None
        };
        self.insert_node(page, frame);
        Ok(displaced)
    }

    fn evict(&mut self) -> StorageResult<Arc<Frame>> {
        let mut cursor = self.head;
        while let Some(slot) = cursor {
            let node = self.node(slot);
            if !node.frame.is_pinned() {
                return Ok(self.remove_slot(slot));
            }
            cursor = node.next;
        }
        Err(StorageError::AllPinned)
    }

    fn remove(&mut self, page: PageId) -> Option<Arc<Frame>> {
        let slot = *self.index.get(&page)?;
        Some(self.remove_slot(slot))
    }

    fn frames(&self) -> Vec<Arc<Frame>> {
        let mut frames = Vec::with_capacity(self.index.len());
        let mut cursor = self.head;
        while let Some(slot) = cursor {
            let node = self.node(slot);
            frames.push(node.frame.clone());
            cursor = node.next;
        }
        frames
    }

    fn len(&self) -> usize {
        self.index.len()
    }

    fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::buffer::frame::tests::test_frame;
    use crate::storage::buffer::PageKind;
    use crate::storage::disk::MemoryDiskManager;
    use anyhow::Result;

    fn frames(n: usize) -> Result<Vec<Arc<Frame>>> {
        let disk = Arc::new(MemoryDiskManager::new());
        (0..n)
            .map(|_| Ok(Arc::new(test_frame(&disk, PageKind::Data)?)))
            .collect()
    }

    fn order(lru: &LruStrategy) -> Vec<PageId> {
        lru.frames().iter().map(|f| f.page_id()).collect()
    }

    #[test]
    fn test_basic_lru_operations() -> Result<()> {
        let f = frames(4)?;
        let mut lru = LruStrategy::new(3);
        assert!(lru.is_empty());
        assert!(matches!(lru.evict().unwrap_err(), StorageError::AllPinned));

        for frame in &f[..3] {
            assert!(lru.put(frame.page_id(), frame.clone())?.is_none());
        }
        assert_eq!(lru.len(), 3);

        // A is the least recently used and goes first.
        let evicted = lru.put(f[3].page_id(), f[3].clone())?;
        assert_eq!(evicted.map(|e| e.page_id()), Some(f[0].page_id()));
        assert!(lru.peek(f[0].page_id()).is_none());
        assert_eq!(lru.len(), 3);
        Ok(())
    }

    #[test]
    fn test_get_promotes() -> Result<()> {
        let f = frames(4)?;
        let mut lru = LruStrategy::new(3);
        for frame in &f[..3] {
            lru.put(frame.page_id(), frame.clone())?;
        }

        assert!(lru.get(f[0].page_id()).is_some());
        assert_eq!(
            order(&lru),
            vec![f[1].page_id(), f[2].page_id(), f[0].page_id()]
        );

        let evicted = lru.put(f[3].page_id(), f[3].clone())?;
        assert_eq!(evicted.map(|e| e.page_id()), Some(f[1].page_id()));
        Ok(())
    }

    #[test]
    fn test_peek_does_not_promote() -> Result<()> {
        let f = frames(3)?;
        let mut lru = LruStrategy::new(2);
        lru.put(f[0].page_id(), f[0].clone())?;
        lru.put(f[1].page_id(), f[1].clone())?;

        assert!(lru.peek(f[0].page_id()).is_some());
        let evicted = lru.put(f[2].page_id(), f[2].clone())?;
        assert_eq!(evicted.map(|e| e.page_id()), Some(f[0].page_id()));
        Ok(())
    }

    #[test]
    fn test_pinned_frames_are_skipped() -> Result<()> {
        let f = frames(4)?;
        let mut lru = LruStrategy::new(3);
        for frame in &f[..3] {
            lru.put(frame.page_id(), frame.clone())?;
        }
        f[0].pin()?;
        f[1].pin()?;

        let evicted = lru.put(f[3].page_id(), f[3].clone())?;
        assert_eq!(evicted.map(|e| e.page_id()), Some(f[2].page_id()));
        Ok(())
    }

    #[test]
    fn test_all_pinned() -> Result<()> {
        let f = frames(3)?;
        let mut lru = LruStrategy::new(2);
        for frame in &f[..2] {
            frame.pin()?;
            lru.put(frame.page_id(), frame.clone())?;
        }

        let err = lru.put(f[2].page_id(), f[2].clone()).unwrap_err();
        assert!(matches!(err, StorageError::AllPinned));
        assert_eq!(lru.len(), 2);
        assert!(lru.peek(f[2].page_id()).is_none());
        Ok(())
    }

    #[test]
    fn test_remove_and_slot_reuse() -> Result<()> {
        let f = frames(4)?;
        let mut lru = LruStrategy::new(3);
        for frame in &f[..3] {
            lru.put(frame.page_id(), frame.clone())?;
        }

        let removed = lru.remove(f[1].page_id());
        assert_eq!(removed.map(|r| r.page_id()), Some(f[1].page_id()));
        assert!(lru.remove(f[1].page_id()).is_none());
        assert_eq!(lru.len(), 2);

        assert!(lru.put(f[3].page_id(), f[3].clone())?.is_none());
        assert_eq!(lru.nodes.len(), 3);
        assert_eq!(
            order(&lru),
            vec![f[0].page_id(), f[2].page_id(), f[3].page_id()]
        );
        Ok(())
    }

    #[test]
    fn test_put_existing_page_displaces_old_frame() -> Result<()> {
        let f = frames(2)?;
        let mut lru = LruStrategy::new(2);
        lru.put(f[0].page_id(), f[0].clone())?;
        lru.put(f[1].page_id(), f[1].clone())?;

        let displaced = lru.put(f[0].page_id(), f[0].clone())?;
        assert!(displaced.is_some_and(|d| Arc::ptr_eq(&d, &f[0])));
        assert_eq!(order(&lru), vec![f[1].page_id(), f[0].page_id()]);
        Ok(())
    }
}
