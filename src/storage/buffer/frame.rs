use crate::storage::disk::DiskSpaceManager;
use crate::storage::{PageId, StorageError, StorageResult, PAGE_SIZE};
use byteorder::{BigEndian, ByteOrder};
use parking_lot::{Mutex, MutexGuard};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

/// Bytes reserved at the start of every non-log page for recovery metadata
/// (the page LSN lives in the first 8 of them).
pub const RESERVED_SPACE: usize = 36;

/// Bytes of an ordinary page visible to callers.
pub const EFFECTIVE_PAGE_SIZE: usize = PAGE_SIZE - RESERVED_SPACE;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageKind {
    /// Ordinary page with the reserved recovery region.
    Data,
    /// Log page: the whole page is payload.
    Log,
}

impl PageKind {
    fn data_offset(self) -> usize {
        match self {
            PageKind::Data => RESERVED_SPACE,
            PageKind::Log => 0,
        }
    }

    pub fn effective_page_size(self) -> usize {
        PAGE_SIZE - self.data_offset()
    }
}

/// Disk handle and I/O counter shared by a pool and all of its frames.
pub(crate) struct IoContext {
    pub(crate) disk: Arc<dyn DiskSpaceManager>,
    num_ios: AtomicU64,
}

impl IoContext {
    pub(crate) fn new(disk: Arc<dyn DiskSpaceManager>) -> Self {
        Self {
            disk,
            num_ios: AtomicU64::new(0),
        }
    }

    pub(crate) fn num_ios(&self) -> u64 {
        self.num_ios.load(Ordering::SeqCst)
    }

    fn record_io(&self) {
        self.num_ios.fetch_add(1, Ordering::SeqCst);
    }
}

pub(crate) struct FrameState {
    /// `None` once the bytes have been written back or handed to a newer frame.
    content: Option<Box<[u8; PAGE_SIZE]>>,
    dirty: bool,
    /// Set when the frame leaves the cache. A retired frame keeps its bytes
    /// until the write-back succeeds, but handles can no longer use them.
    retired: bool,
}

impl FrameState {
    fn live(&self, page: PageId) -> StorageResult<&[u8; PAGE_SIZE]> {
        match &self.content {
            Some(content) if !self.retired => Ok(&**content),
            _ => Err(StorageError::InvalidatedFrame(page)),
        }
    }

    fn live_mut(&mut self, page: PageId) -> StorageResult<&mut [u8; PAGE_SIZE]> {
        if self.retired {
            return Err(StorageError::InvalidatedFrame(page));
        }
        self.content
            .as_deref_mut()
            .ok_or(StorageError::InvalidatedFrame(page))
    }
}

/// In-memory copy of one page plus its bookkeeping.
///
/// The frame lock guards content and the dirty flag. The pin count is atomic
/// so the cache strategy can test it while holding only the manager lock.
/// Handle pins and retirement both happen under the frame lock, so a frame
/// is never retired while a handle holds a pin on it.
pub struct Frame {
    page_id: PageId,
    pin_count: AtomicU32,
    log_page: AtomicBool,
    state: Mutex<FrameState>,
    io: Arc<IoContext>,
}

impl Frame {
    pub(crate) fn new(page_id: PageId, kind: PageKind, io: Arc<IoContext>) -> Self {
        Self {
            page_id,
            pin_count: AtomicU32::new(0),
            log_page: AtomicBool::new(kind == PageKind::Log),
            state: Mutex::new(FrameState {
                content: Some(Box::new([0u8; PAGE_SIZE])),
                dirty: false,
                retired: false,
            }),
            io,
        }
    }

    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    /// Pin through an existing handle. Fails once the frame has left the
    /// cache; fetch the page again instead.
    pub fn pin(&self) -> StorageResult<()> {
        let state = self.state.lock();
        state.live(self.page_id)?;
        self.pin_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    /// Pin a frame found in the cache. The caller holds the manager lock,
    /// which keeps the frame from being retired underneath it.
    pub(crate) fn pin_cached(&self) {
        self.pin_count.fetch_add(1, Ordering::SeqCst);
    }

    pub fn unpin(&self) -> StorageResult<()> {
        self.pin_count
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |count| {
                count.checked_sub(1)
            })
            .map(|_| ())
            .map_err(|_| StorageError::UnpinViolation(self.page_id))
    }

    pub fn pin_count(&self) -> u32 {
        self.pin_count.load(Ordering::SeqCst)
    }

    pub fn is_pinned(&self) -> bool {
        self.pin_count() > 0
    }

    pub fn is_valid(&self) -> bool {
        self.state.lock().live(self.page_id).is_ok()
    }

    pub fn is_dirty(&self) -> bool {
        self.state.lock().dirty
    }

    pub fn kind(&self) -> PageKind {
        if self.log_page.load(Ordering::SeqCst) {
            PageKind::Log
        } else {
            PageKind::Data
        }
    }

    pub(crate) fn set_kind(&self, kind: PageKind) {
        self.log_page.store(kind == PageKind::Log, Ordering::SeqCst);
    }

    pub fn effective_page_size(&self) -> usize {
        self.kind().effective_page_size()
    }

    /// Copy `buf.len()` bytes starting at page-relative `offset`.
    pub fn read_bytes(&self, offset: usize, buf: &mut [u8]) -> StorageResult<()> {
        let start = self.checked_range(offset, buf.len())?;
        let state = self.state.lock();
        let content = state.live(self.page_id)?;
        buf.copy_from_slice(&content[start..start + buf.len()]);
        Ok(())
    }

    /// Copy `data` into the page at `offset` and mark the frame dirty. The
    /// write stays in memory until the frame is flushed or evicted.
    pub fn write_bytes(&self, offset: usize, data: &[u8]) -> StorageResult<()> {
        let start = self.checked_range(offset, data.len())?;
        let mut state = self.state.lock();
        let content = state.live_mut(self.page_id)?;
        content[start..start + data.len()].copy_from_slice(data);
        state.dirty = true;
        Ok(())
    }

    pub fn page_lsn(&self) -> StorageResult<u64> {
        if self.kind() == PageKind::Log {
            return Ok(0);
        }
        let state = self.state.lock();
        let content = state.live(self.page_id)?;
        Ok(BigEndian::read_u64(&content[..8]))
    }

    pub fn set_page_lsn(&self, lsn: u64) -> StorageResult<()> {
        if self.kind() == PageKind::Log {
            return Ok(());
        }
        let mut state = self.state.lock();
        let content = state.live_mut(self.page_id)?;
        BigEndian::write_u64(&mut content[..8], lsn);
        state.dirty = true;
        Ok(())
    }

    /// Write the page through to disk if dirty. On a retired frame whose
    /// write-back failed this retries the write.
    pub fn flush(&self) -> StorageResult<()> {
        let mut state = self.state.lock();
        self.flush_locked(&mut state)
    }

    /// Flush if dirty and release the content. Only `unpin` is legal on the
    /// frame afterwards. If the flush fails the frame stays retired and keeps
    /// its dirty bytes, so a later `invalidate` can retry.
    pub fn invalidate(&self) -> StorageResult<()> {
        let mut state = self.state.lock();
        self.invalidate_locked(&mut state)
    }

    pub(crate) fn lock_state(&self) -> MutexGuard<'_, FrameState> {
        self.state.lock()
    }

    pub(crate) fn flush_locked(&self, state: &mut FrameState) -> StorageResult<()> {
        if !state.dirty {
            return Ok(());
        }
        if let Some(content) = &state.content {
            self.io.disk.write_page(self.page_id, content.as_ref())?;
            self.io.record_io();
        }
        state.dirty = false;
        Ok(())
    }

    pub(crate) fn invalidate_locked(&self, state: &mut FrameState) -> StorageResult<()> {
        state.retired = true;
        self.flush_locked(state)?;
        state.content = None;
        Ok(())
    }

    /// Mark the frame as leaving the cache unless a handle still pins it and
    /// `force` is unset. Called under the manager lock.
    pub(crate) fn try_retire(&self, force: bool) -> bool {
        if !force && self.is_pinned() {
            return false;
        }
        let mut state = self.state.lock();
        // Recheck under the frame lock, which `pin` also takes.
        if !force && self.is_pinned() {
            return false;
        }
        state.retired = true;
        true
    }

    /// Move the bytes of a retired frame whose write-back has not happened
    /// into this fresh frame. Returns false if there was nothing to take.
    pub(crate) fn adopt_locked(state: &mut FrameState, retired: &mut FrameState) -> bool {
        match retired.content.take() {
            Some(content) => {
                state.content = Some(content);
                state.dirty = retired.dirty;
                retired.dirty = false;
                true
            }
            None => false,
        }
    }

    pub(crate) fn load_locked(&self, state: &mut FrameState) -> StorageResult<()> {
        let content = state.live_mut(self.page_id)?;
        self.io.disk.read_page(self.page_id, &mut content[..])?;
        self.io.record_io();
        state.dirty = false;
        Ok(())
    }

    /// Drop the content without writing it back.
    pub(crate) fn discard(&self) {
        let mut state = self.state.lock();
        state.content = None;
        state.dirty = false;
        state.retired = true;
    }

    fn checked_range(&self, offset: usize, len: usize) -> StorageResult<usize> {
        let limit = self.effective_page_size();
        match offset.checked_add(len) {
            Some(end) if end <= limit => Ok(offset + self.kind().data_offset()),
            _ => Err(StorageError::InvalidArgument(format!(
                "range {}+{} exceeds page payload of {} bytes",
                offset, len, limit
            ))),
        }
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("page_id", &self.page_id)
            .field("pin_count", &self.pin_count())
            .field("kind", &self.kind())
            .finish()
    }
}
