use super::{Frame, PageKind};
use crate::storage::{PageId, StorageResult};
use log::warn;
use std::fmt;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::sync::Arc;

/// Handle to a cached page.
///
/// Cloning a handle does not pin; any number of handles may share a frame.
/// Offsets are relative to the page's effective region.
#[derive(Clone)]
pub struct Page {
    frame: Arc<Frame>,
}

impl Page {
    pub(crate) fn new(frame: Arc<Frame>) -> Self {
        Self { frame }
    }

    pub fn page_id(&self) -> PageId {
        self.frame.page_id()
    }

    /// Take another pin on the page. Fails with `InvalidatedFrame` once the
    /// frame has been evicted or freed.
    pub fn pin(&self) -> StorageResult<()> {
        self.frame.pin()
    }

    pub fn unpin(&self) -> StorageResult<()> {
        self.frame.unpin()
    }

    /// Pin for the lifetime of the returned guard.
    pub fn pinned(&self) -> StorageResult<PinGuard<'_>> {
        self.pin()?;
        Ok(PinGuard { page: self })
    }

    pub fn pin_count(&self) -> u32 {
        self.frame.pin_count()
    }

    pub fn read_bytes(&self, offset: usize, buf: &mut [u8]) -> StorageResult<()> {
        self.frame.read_bytes(offset, buf)
    }

    pub fn write_bytes(&self, offset: usize, data: &[u8]) -> StorageResult<()> {
        self.frame.write_bytes(offset, data)
    }

    /// Copy of the whole effective region.
    pub fn read_all(&self) -> StorageResult<Vec<u8>> {
        let mut buf = vec![0u8; self.effective_page_size()];
        self.read_bytes(0, &mut buf)?;
        Ok(buf)
    }

    /// Cursor positioned at the start of the effective region.
    pub fn buffer(&self) -> PageBuffer {
        PageBuffer {
            page: self.clone(),
            position: 0,
        }
    }

    pub fn flush(&self) -> StorageResult<()> {
        self.frame.flush()
    }

    pub fn is_valid(&self) -> bool {
        self.frame.is_valid()
    }

    pub fn is_dirty(&self) -> bool {
        self.frame.is_dirty()
    }

    pub fn kind(&self) -> PageKind {
        self.frame.kind()
    }

    pub fn effective_page_size(&self) -> usize {
        self.frame.effective_page_size()
    }

    pub fn page_lsn(&self) -> StorageResult<u64> {
        self.frame.page_lsn()
    }

    pub fn set_page_lsn(&self, lsn: u64) -> StorageResult<()> {
        self.frame.set_page_lsn(lsn)
    }

    pub(crate) fn frame(&self) -> &Arc<Frame> {
        &self.frame
    }
}

impl PartialEq for Page {
    fn eq(&self, other: &Self) -> bool {
        self.page_id() == other.page_id()
    }
}

impl Eq for Page {}

impl fmt::Debug for Page {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Page")
            .field("page_id", &self.page_id())
            .field("pin_count", &self.pin_count())
            .finish()
    }
}

/// Unpins its page when dropped.
pub struct PinGuard<'a> {
    page: &'a Page,
}

impl Drop for PinGuard<'_> {
    fn drop(&mut self) {
        // Balanced by the pin taken in `Page::pinned`.
        if let Err(e) = self.page.unpin() {
            warn!("Unbalanced pin on page {}: {}", self.page.page_id(), e);
        }
    }
}

/// Positioned byte cursor over a page's effective region.
///
/// Each call goes through the frame lock, so typed access with
/// `byteorder::{ReadBytesExt, WriteBytesExt}` is safe but not atomic across
/// calls.
pub struct PageBuffer {
    page: Page,
    position: usize,
}

impl PageBuffer {
    pub fn position(&self) -> usize {
        self.position
    }

    pub fn set_position(&mut self, position: usize) {
        self.position = position;
    }

    pub fn remaining(&self) -> usize {
        self.page.effective_page_size().saturating_sub(self.position)
    }

    pub fn page(&self) -> &Page {
        &self.page
    }
}

fn to_io_error(e: crate::storage::StorageError) -> io::Error {
    io::Error::new(io::ErrorKind::Other, e)
}

impl Read for PageBuffer {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = buf.len().min(self.remaining());
        self.page
            .read_bytes(self.position, &mut buf[..n])
            .map_err(to_io_error)?;
        self.position += n;
        Ok(n)
    }
}

impl Write for PageBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = buf.len().min(self.remaining());
        self.page
            .write_bytes(self.position, &buf[..n])
            .map_err(to_io_error)?;
        self.position += n;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Seek for PageBuffer {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let end = self.page.effective_page_size() as i64;
        let target = match pos {
            SeekFrom::Start(offset) => offset as i64,
            SeekFrom::End(delta) => end + delta,
            SeekFrom::Current(delta) => self.position as i64 + delta,
        };
        if target < 0 || target > end {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("seek to {} outside page payload of {} bytes", target, end),
            ));
        }
        self.position = target as usize;
        Ok(self.position as u64)
    }
}
