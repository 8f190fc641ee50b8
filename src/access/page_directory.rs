//! Heap file organized by a page directory.
//!
//! A directory is a chain of header pages in one partition. Each header page
//! holds a small header followed by an array of data page entries:
//!
//! ```text
//! | allocated (1) | directory id (4) | next header (8) | entry 0 | entry 1 | ...
//! ```
//!
//! An entry is the data page number (8 bytes, -1 when the slot is empty) and
//! the free space left on that page (2 bytes). Data pages start with a
//! back-pointer to their entry: directory id (4), header index (4) and slot
//! index (2). Records go after the back-pointer, so the usable space of a data
//! page is [`EFFECTIVE_PAGE_SIZE`].

use crate::access::iterator::BacktrackingIterator;
use crate::storage::buffer::EFFECTIVE_PAGE_SIZE as BUFFER_PAGE_SIZE;
use crate::storage::{BufferPool, Page, PageId, PartitionId, StorageError, StorageResult};
use byteorder::{BigEndian, ByteOrder};
use log::debug;
use parking_lot::Mutex;

/// Size of the header at the start of a header page.
pub const HEADER_HEADER_SIZE: usize = 13;

/// Size of one data page entry in a header page.
pub const DATA_PAGE_ENTRY_SIZE: usize = 10;

/// Data page entries per header page.
pub const HEADER_ENTRY_COUNT: usize = (BUFFER_PAGE_SIZE - HEADER_HEADER_SIZE) / DATA_PAGE_ENTRY_SIZE;

/// Size of the back-pointer at the start of a data page.
pub const DATA_HEADER_SIZE: usize = 10;

/// Usable bytes of a data page.
pub const EFFECTIVE_PAGE_SIZE: usize = BUFFER_PAGE_SIZE - DATA_HEADER_SIZE;

const HEADER_ALLOCATED: u8 = 1;
const NEXT_HEADER_OFFSET: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct DataPageEntry {
    page: PageId,
    free_space: u16,
}

impl DataPageEntry {
    const EMPTY: DataPageEntry = DataPageEntry {
        page: PageId::INVALID,
        free_space: u16::MAX,
    };

    fn offset(slot: usize) -> usize {
        HEADER_HEADER_SIZE + slot * DATA_PAGE_ENTRY_SIZE
    }

    fn decode(raw: &[u8]) -> Self {
        Self {
            page: PageId::from_i64(BigEndian::read_i64(&raw[..8])),
            free_space: BigEndian::read_u16(&raw[8..DATA_PAGE_ENTRY_SIZE]),
        }
    }

    /// Entry in `slot` of a header page's bytes.
    fn in_header(header: &[u8], slot: usize) -> Self {
        Self::decode(&header[Self::offset(slot)..])
    }

    fn encode(&self) -> [u8; DATA_PAGE_ENTRY_SIZE] {
        let mut buf = [0u8; DATA_PAGE_ENTRY_SIZE];
        BigEndian::write_i64(&mut buf[..8], self.page.to_i64());
        BigEndian::write_u16(&mut buf[8..], self.free_space);
        buf
    }

    fn is_valid(&self) -> bool {
        self.page.is_valid()
    }
}

/// Back-pointer stored at the start of every data page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct BackPointer {
    directory_id: u32,
    header_index: u32,
    slot: u16,
}

impl BackPointer {
    fn read(page: &Page) -> StorageResult<Self> {
        let mut buf = [0u8; DATA_HEADER_SIZE];
        page.read_bytes(0, &mut buf)?;
        Ok(Self {
            directory_id: BigEndian::read_u32(&buf[..4]),
            header_index: BigEndian::read_u32(&buf[4..8]),
            slot: BigEndian::read_u16(&buf[8..]),
        })
    }

    fn write(&self, page: &Page) -> StorageResult<()> {
        let mut buf = [0u8; DATA_HEADER_SIZE];
        BigEndian::write_u32(&mut buf[..4], self.directory_id);
        BigEndian::write_u32(&mut buf[4..8], self.header_index);
        BigEndian::write_u16(&mut buf[8..], self.slot);
        page.write_bytes(0, &buf)
    }
}

/// In-memory record of one header page in the chain.
#[derive(Debug, Clone, Copy)]
struct HeaderPage {
    page_id: PageId,
    num_data_pages: usize,
}

pub struct PageDirectory {
    buffer_pool: BufferPool,
    partition: PartitionId,
    directory_id: u32,
    first_header: PageId,
    /// Header chain in order; it only grows. Also serializes space lookups.
    headers: Mutex<Vec<HeaderPage>>,
}

impl PageDirectory {
    /// Open the directory whose first header page is `first_header`, loading
    /// the whole header chain. A first header that was never initialized
    /// starts a new, empty directory with a random id. New header and data
    /// pages are allocated in `partition`.
    pub fn open(buffer_pool: BufferPool, partition: PartitionId, first_header: PageId) -> StorageResult<Self> {
        let mut headers = Vec::new();
        let mut directory_id = None;
        let mut next = first_header;

        while next.is_valid() {
            let page = buffer_pool.fetch_page(next)?;
            let loaded = load_header(&page, directory_id);
            page.unpin()?;
            let (id, num_data_pages, next_header) = loaded?;

            directory_id = Some(id);
            headers.push(HeaderPage {
                page_id: next,
                num_data_pages,
            });
            next = next_header;
        }

        let directory_id = directory_id.ok_or_else(|| {
            StorageError::InvalidArgument("first header page must be a valid page".to_string())
        })?;
        debug!(
            "Opened page directory {:08x} with {} header pages at {}",
            directory_id,
            headers.len(),
            first_header
        );

        Ok(Self {
            buffer_pool,
            partition,
            directory_id,
            first_header,
            headers: Mutex::new(headers),
        })
    }

    pub fn directory_id(&self) -> u32 {
        self.directory_id
    }

    pub fn partition(&self) -> PartitionId {
        self.partition
    }

    /// Page the directory was opened from.
    pub fn first_header(&self) -> PageId {
        self.first_header
    }

    pub fn effective_page_size(&self) -> usize {
        EFFECTIVE_PAGE_SIZE
    }

    pub fn num_header_pages(&self) -> usize {
        self.headers.lock().len()
    }

    pub fn num_data_pages(&self) -> usize {
        self.headers.lock().iter().map(|h| h.num_data_pages).sum()
    }

    /// Pinned handle to a data page of this directory.
    pub fn fetch_page(&self, page_id: PageId) -> StorageResult<Page> {
        let page = self.buffer_pool.fetch_page(page_id)?;
        match BackPointer::read(&page) {
            Ok(back) if back.directory_id == self.directory_id => Ok(page),
            Ok(back) => {
                page.unpin()?;
                Err(StorageError::DirectoryMismatch {
                    expected: self.directory_id,
                    found: back.directory_id,
                })
            }
            Err(e) => {
                page.unpin()?;
                Err(e)
            }
        }
    }

    /// Pinned handle to a data page with at least `required` free bytes.
    ///
    /// The space is deducted from the page's entry before returning; callers
    /// report what they actually left free through
    /// [`update_free_space`](Self::update_free_space).
    pub fn fetch_page_with_space(&self, required: usize) -> StorageResult<Page> {
        if required == 0 {
            return Err(StorageError::InvalidArgument(
                "cannot request zero bytes of space".to_string(),
            ));
        }
        if required > EFFECTIVE_PAGE_SIZE {
            return Err(StorageError::InvalidArgument(format!(
                "requested {} bytes, more than a page holds ({})",
                required, EFFECTIVE_PAGE_SIZE
            )));
        }

        let mut headers = self.headers.lock();
        let mut index = 0;
        loop {
            if index == headers.len() {
                self.append_header(&mut headers)?;
            }
            let header = &mut headers[index];
            let header_page = self.buffer_pool.fetch_page(header.page_id)?;
            let found = self.claim_space(&header_page, header, index, required);
            header_page.unpin()?;
            if let Some(page) = found? {
                return Ok(page);
            }
            index += 1;
        }
    }

    fn claim_space(
        &self,
        header_page: &Page,
        header: &mut HeaderPage,
        index: usize,
        required: usize,
    ) -> StorageResult<Option<Page>> {
        let bytes = header_page.read_all()?;
        let mut unused_slot = None;

        for slot in 0..HEADER_ENTRY_COUNT {
            let entry = DataPageEntry::in_header(&bytes, slot);
            if !entry.is_valid() {
                unused_slot.get_or_insert(slot);
                continue;
            }
            if entry.free_space as usize >= required {
                let claimed = DataPageEntry {
                    free_space: entry.free_space - required as u16,
                    ..entry
                };
                header_page.write_bytes(DataPageEntry::offset(slot), &claimed.encode())?;
                return self.buffer_pool.fetch_page(entry.page).map(Some);
            }
        }

        let Some(slot) = unused_slot else {
            return Ok(None);
        };

        let data_page = self.buffer_pool.fetch_new_page(self.partition)?;
        let back = BackPointer {
            directory_id: self.directory_id,
            header_index: index as u32,
            slot: slot as u16,
        };
        let entry = DataPageEntry {
            page: data_page.page_id(),
            free_space: (EFFECTIVE_PAGE_SIZE - required) as u16,
        };
        let registered = back
            .write(&data_page)
            .and_then(|_| header_page.write_bytes(DataPageEntry::offset(slot), &entry.encode()));
        if let Err(e) = registered {
            data_page.unpin()?;
            return Err(e);
        }

        header.num_data_pages += 1;
        debug!(
            "Directory {:08x} added data page {} at header {} slot {}",
            self.directory_id,
            data_page.page_id(),
            index,
            slot
        );
        Ok(Some(data_page))
    }

    fn append_header(&self, headers: &mut Vec<HeaderPage>) -> StorageResult<()> {
        let page = self.buffer_pool.fetch_new_page(self.partition)?;
        let written = init_header(&page, self.directory_id);
        page.unpin()?;
        written?;

        if let Some(tail) = headers.last() {
            let tail_page = self.buffer_pool.fetch_page(tail.page_id)?;
            let mut next = [0u8; 8];
            BigEndian::write_i64(&mut next, page.page_id().to_i64());
            let linked = tail_page.write_bytes(NEXT_HEADER_OFFSET, &next);
            tail_page.unpin()?;
            linked?;
        }

        debug!(
            "Directory {:08x} grew header chain to {} pages with {}",
            self.directory_id,
            headers.len() + 1,
            page.page_id()
        );
        headers.push(HeaderPage {
            page_id: page.page_id(),
            num_data_pages: 0,
        });
        Ok(())
    }

    /// Record that `page` now has `free_space` free bytes. A page reported
    /// entirely free is removed from the directory and freed.
    pub fn update_free_space(&self, page: &Page, free_space: usize) -> StorageResult<()> {
        if free_space == 0 || free_space > EFFECTIVE_PAGE_SIZE {
            return Err(StorageError::InvalidArgument(format!(
                "bad free space {} for a data page of {} bytes",
                free_space, EFFECTIVE_PAGE_SIZE
            )));
        }

        let mut headers = self.headers.lock();
        // Refetch so a stale or freed handle cannot update someone else's slot.
        let data_page = self.fetch_page(page.page_id())?;
        let result = self.record_free_space(&mut headers, &data_page, free_space);
        data_page.unpin()?;
        result
    }

    fn record_free_space(
        &self,
        headers: &mut [HeaderPage],
        data_page: &Page,
        free_space: usize,
    ) -> StorageResult<()> {
        let back = BackPointer::read(data_page)?;
        let slot = back.slot as usize;
        let header = headers
            .get_mut(back.header_index as usize)
            .filter(|_| slot < HEADER_ENTRY_COUNT)
            .ok_or_else(|| {
                StorageError::InvalidArgument(format!(
                    "page {} points at header {} slot {} outside the directory",
                    data_page.page_id(),
                    back.header_index,
                    back.slot
                ))
            })?;

        let header_page = self.buffer_pool.fetch_page(header.page_id)?;
        let result = self.rewrite_entry(&header_page, header, slot, data_page, free_space);
        header_page.unpin()?;
        result
    }

    fn rewrite_entry(
        &self,
        header_page: &Page,
        header: &mut HeaderPage,
        slot: usize,
        data_page: &Page,
        free_space: usize,
    ) -> StorageResult<()> {
        let offset = DataPageEntry::offset(slot);
        let mut raw = [0u8; DATA_PAGE_ENTRY_SIZE];
        header_page.read_bytes(offset, &mut raw)?;
        let entry = DataPageEntry::decode(&raw);
        if entry.page != data_page.page_id() {
            return Err(StorageError::NotAllocated(data_page.page_id()));
        }

        if free_space < EFFECTIVE_PAGE_SIZE {
            let updated = DataPageEntry {
                free_space: free_space as u16,
                ..entry
            };
            return header_page.write_bytes(offset, &updated.encode());
        }

        header_page.write_bytes(offset, &DataPageEntry::EMPTY.encode())?;
        header.num_data_pages -= 1;
        debug!(
            "Directory {:08x} released data page {}",
            self.directory_id,
            data_page.page_id()
        );
        self.buffer_pool.free_page(data_page)
    }

    /// Iterate every data page of the directory in header and slot order.
    /// Each item is a pinned page the caller must unpin.
    pub fn iter(&self) -> DataPageIter<'_> {
        DataPageIter {
            directory: self,
            cursor: Cursor::default(),
            prev: None,
            marked: None,
            entries: None,
        }
    }

    fn header_entries(&self, index: usize) -> StorageResult<Option<Vec<PageId>>> {
        let Some(page_id) = self.headers.lock().get(index).map(|h| h.page_id) else {
            return Ok(None);
        };
        let page = self.buffer_pool.fetch_page(page_id)?;
        let bytes = page.read_all();
        page.unpin()?;
        let bytes = bytes?;
        Ok(Some(
            (0..HEADER_ENTRY_COUNT)
                .map(|slot| DataPageEntry::in_header(&bytes, slot).page)
                .collect(),
        ))
    }
}

impl<'a> IntoIterator for &'a PageDirectory {
    type Item = StorageResult<Page>;
    type IntoIter = DataPageIter<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Parse a header page, initializing it if it was never written. Returns the
/// directory id, the number of data pages and the next header page.
fn load_header(page: &Page, expected_id: Option<u32>) -> StorageResult<(u32, usize, PageId)> {
    let bytes = page.read_all()?;
    if bytes[0] != HEADER_ALLOCATED {
        let id = expected_id.unwrap_or_else(rand::random::<u32>);
        init_header(page, id)?;
        return Ok((id, 0, PageId::INVALID));
    }

    let id = BigEndian::read_u32(&bytes[1..5]);
    if let Some(expected) = expected_id {
        if expected != id {
            return Err(StorageError::DirectoryMismatch {
                expected,
                found: id,
            });
        }
    }
    let next = PageId::from_i64(BigEndian::read_i64(&bytes[NEXT_HEADER_OFFSET..HEADER_HEADER_SIZE]));
    let num_data_pages = (0..HEADER_ENTRY_COUNT)
        .filter(|&slot| DataPageEntry::in_header(&bytes, slot).is_valid())
        .count();
    Ok((id, num_data_pages, next))
}

fn init_header(page: &Page, directory_id: u32) -> StorageResult<()> {
    let mut buf = vec![0u8; DataPageEntry::offset(HEADER_ENTRY_COUNT)];
    buf[0] = HEADER_ALLOCATED;
    BigEndian::write_u32(&mut buf[1..5], directory_id);
    BigEndian::write_i64(&mut buf[NEXT_HEADER_OFFSET..HEADER_HEADER_SIZE], PageId::INVALID.to_i64());
    let empty = DataPageEntry::EMPTY.encode();
    for slot in 0..HEADER_ENTRY_COUNT {
        let at = DataPageEntry::offset(slot);
        buf[at..at + DATA_PAGE_ENTRY_SIZE].copy_from_slice(&empty);
    }
    page.write_bytes(0, &buf)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Cursor {
    header: usize,
    slot: usize,
}

/// Lazy iterator over the data pages of a [`PageDirectory`].
///
/// Header entries are read once per header visit; pages freed while the
/// iterator is inside their header may still be yielded and then fail to
/// fetch.
pub struct DataPageIter<'a> {
    directory: &'a PageDirectory,
    /// Position to resume scanning from.
    cursor: Cursor,
    /// Position of the last page returned.
    prev: Option<Cursor>,
    marked: Option<Cursor>,
    entries: Option<(usize, Vec<PageId>)>,
}

impl DataPageIter<'_> {
    /// Make sure `entries` holds the cursor's header. Returns `false` past the
    /// end of the chain.
    fn load_entries(&mut self) -> StorageResult<bool> {
        let header = self.cursor.header;
        if matches!(&self.entries, Some((index, _)) if *index == header) {
            return Ok(true);
        }
        self.entries = self
            .directory
            .header_entries(header)?
            .map(|entries| (header, entries));
        Ok(self.entries.is_some())
    }

    fn next_header(&mut self) {
        self.cursor = Cursor {
            header: self.cursor.header + 1,
            slot: 0,
        };
    }
}

impl Iterator for DataPageIter<'_> {
    type Item = StorageResult<Page>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            match self.load_entries() {
                Ok(true) => {}
                Ok(false) => return None,
                Err(e) => {
                    self.next_header();
                    return Some(Err(e));
                }
            }
            let Some((header, entries)) = &self.entries else {
                return None;
            };
            let found = entries
                .iter()
                .enumerate()
                .skip(self.cursor.slot)
                .find(|(_, page)| page.is_valid())
                .map(|(slot, page)| (Cursor { header: *header, slot }, *page));

            match found {
                Some((at, page_id)) => {
                    self.prev = Some(at);
                    self.cursor = Cursor {
                        slot: at.slot + 1,
                        ..at
                    };
                    return Some(self.directory.fetch_page(page_id));
                }
                None => self.next_header(),
            }
        }
    }
}

impl BacktrackingIterator for DataPageIter<'_> {
    fn mark_prev(&mut self) {
        if let Some(prev) = self.prev {
            self.marked = Some(prev);
        }
    }

    fn mark_next(&mut self) {
        self.marked = Some(self.cursor);
    }

    fn reset(&mut self) {
        if let Some(marked) = self.marked {
            self.cursor = marked;
            self.prev = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::disk::{DiskSpaceManager, MemoryDiskManager};
    use anyhow::Result;
    use std::sync::Arc;

    struct Fixture {
        disk: Arc<MemoryDiskManager>,
        pool: BufferPool,
        partition: PartitionId,
        first_header: PageId,
    }

    fn setup() -> Result<Fixture> {
        let disk = Arc::new(MemoryDiskManager::new());
        let partition = disk.allocate_partition()?;
        let first_header = disk.allocate_page(partition)?;
        let pool = BufferPool::new(disk.clone(), 1024);
        Ok(Fixture {
            disk,
            pool,
            partition,
            first_header,
        })
    }

    fn open(f: &Fixture) -> Result<PageDirectory> {
        Ok(PageDirectory::open(f.pool.clone(), f.partition, f.first_header)?)
    }

    fn fetch(dir: &PageDirectory, required: usize) -> Result<Page> {
        let page = dir.fetch_page_with_space(required)?;
        page.unpin()?;
        Ok(page)
    }

    #[test]
    fn test_constants() {
        assert_eq!(HEADER_ENTRY_COUNT, 404);
        assert_eq!(EFFECTIVE_PAGE_SIZE, 4050);
    }

    #[test]
    fn test_create_page_directory() -> Result<()> {
        let f = setup()?;
        let dir = open(&f)?;
        assert_eq!(dir.num_header_pages(), 1);
        assert_eq!(dir.num_data_pages(), 0);
        assert_eq!(dir.effective_page_size(), 4050);
        assert_eq!(dir.partition(), f.partition);
        Ok(())
    }

    #[test]
    fn test_fetch_page_with_space() -> Result<()> {
        let f = setup()?;
        let dir = open(&f)?;
        let full = dir.effective_page_size();

        let p1 = fetch(&dir, full)?;
        let p2 = fetch(&dir, 1)?;
        let p3 = fetch(&dir, 60)?;
        let p4 = fetch(&dir, full - 60)?;
        let p5 = fetch(&dir, 120)?;

        assert_eq!(p1.page_id(), PageId::new(0, 1));
        assert_eq!(p2.page_id(), PageId::new(0, 2));
        assert_eq!(p3.page_id(), PageId::new(0, 2));
        assert_eq!(p4.page_id(), PageId::new(0, 3));
        assert_eq!(p5.page_id(), PageId::new(0, 2));

        assert_ne!(p1, p2);
        assert_eq!(p2, p3);
        assert_eq!(p3, p5);
        assert_ne!(p4, p5);
        assert_eq!(dir.num_data_pages(), 3);
        Ok(())
    }

    #[test]
    fn test_fetch_page_with_space_from_two_headers() -> Result<()> {
        let f = setup()?;
        let dir = open(&f)?;
        let full = dir.effective_page_size();

        let mut expected = 1;
        for _ in 0..HEADER_ENTRY_COUNT {
            assert_eq!(fetch(&dir, full)?.page_id(), PageId::new(0, expected));
            expected += 1;
        }
        // The second header page takes the next page number.
        for _ in 0..HEADER_ENTRY_COUNT {
            expected += 1;
            assert_eq!(fetch(&dir, full)?.page_id(), PageId::new(0, expected));
        }
        assert_eq!(dir.num_header_pages(), 2);
        assert_eq!(dir.num_data_pages(), 2 * HEADER_ENTRY_COUNT);
        Ok(())
    }

    #[test]
    fn test_fetch_page_with_space_invalid() -> Result<()> {
        let f = setup()?;
        let dir = open(&f)?;
        for size in [EFFECTIVE_PAGE_SIZE + 1, 0] {
            assert!(matches!(
                dir.fetch_page_with_space(size).unwrap_err(),
                StorageError::InvalidArgument(_)
            ));
        }
        Ok(())
    }

    #[test]
    fn test_fetch_page() -> Result<()> {
        let f = setup()?;
        let dir = open(&f)?;
        let full = dir.effective_page_size();

        let pages = [
            fetch(&dir, full)?,
            fetch(&dir, 1)?,
            fetch(&dir, 60)?,
            fetch(&dir, full - 60)?,
            fetch(&dir, 120)?,
        ];
        for page in &pages {
            let fetched = dir.fetch_page(page.page_id())?;
            fetched.unpin()?;
            assert_eq!(&fetched, page);
        }
        Ok(())
    }

    #[test]
    fn test_fetch_page_from_other_directory() -> Result<()> {
        let f = setup()?;
        let dir = open(&f)?;
        let other_header = f.disk.allocate_page(f.partition)?;
        let other = PageDirectory::open(f.pool.clone(), f.partition, other_header)?;
        assert_ne!(dir.directory_id(), other.directory_id());

        let page = fetch(&other, 10)?;
        assert!(matches!(
            dir.fetch_page(page.page_id()).unwrap_err(),
            StorageError::DirectoryMismatch { .. }
        ));
        assert_eq!(page.pin_count(), 0);
        Ok(())
    }

    #[test]
    fn test_update_free_space() -> Result<()> {
        let f = setup()?;
        let dir = open(&f)?;
        let p1 = fetch(&dir, dir.effective_page_size() - 10)?;

        dir.update_free_space(&p1, 10)?;
        let p2 = fetch(&dir, 10)?;
        assert_eq!(p1, p2);

        dir.update_free_space(&p1, 10)?;
        let p3 = fetch(&dir, 20)?;
        assert_ne!(p1, p3);
        Ok(())
    }

    #[test]
    fn test_update_free_space_of_page_size() -> Result<()> {
        let f = setup()?;
        let dir = open(&f)?;
        let full = dir.effective_page_size();
        let page = fetch(&dir, full)?;

        dir.update_free_space(&page, full)?;
        assert_eq!(dir.num_data_pages(), 0);
        assert!(!f.disk.is_allocated(page.page_id()));
        assert!(dir.update_free_space(&page, 10).is_err());

        for size in [0, full + 1] {
            assert!(matches!(
                dir.update_free_space(&page, size).unwrap_err(),
                StorageError::InvalidArgument(_)
            ));
        }

        // The slot is reused by the next request.
        let again = fetch(&dir, 1)?;
        assert_eq!(dir.num_data_pages(), 1);
        dir.fetch_page(again.page_id())?.unpin()?;
        Ok(())
    }

    fn distinct_pages(dir: &PageDirectory, requests: usize, size: usize) -> Result<Vec<Page>> {
        let mut pages: Vec<Page> = Vec::new();
        for _ in 0..requests {
            let page = fetch(dir, size)?;
            if pages.last() != Some(&page) {
                pages.push(page);
            }
        }
        Ok(pages)
    }

    fn collect(iter: DataPageIter<'_>) -> Result<Vec<Page>> {
        let mut pages = Vec::new();
        for page in iter {
            let page = page?;
            page.unpin()?;
            pages.push(page);
        }
        Ok(pages)
    }

    #[test]
    fn test_iterator() -> Result<()> {
        let f = setup()?;
        let dir = open(&f)?;
        let pages = distinct_pages(&dir, 100, dir.effective_page_size() / 2)?;
        assert_eq!(pages.len(), 50);
        assert_eq!(collect(dir.iter())?, pages);
        Ok(())
    }

    #[test]
    fn test_iterator_with_deletes() -> Result<()> {
        let f = setup()?;
        let dir = open(&f)?;
        let full = dir.effective_page_size();
        let pages = distinct_pages(&dir, 100, full / 2)?;

        let mut kept = Vec::new();
        for (i, page) in pages.into_iter().enumerate() {
            if i % 2 == 1 {
                dir.update_free_space(&page, full)?;
            } else {
                kept.push(page);
            }
        }
        assert_eq!(collect(dir.iter())?, kept);
        Ok(())
    }

    #[test]
    fn test_iterator_spans_headers() -> Result<()> {
        let f = setup()?;
        let dir = open(&f)?;
        let full = dir.effective_page_size();
        let pages = distinct_pages(&dir, HEADER_ENTRY_COUNT + 3, full)?;
        assert_eq!(dir.num_header_pages(), 2);
        assert_eq!(collect((&dir).into_iter())?, pages);
        Ok(())
    }

    #[test]
    fn test_iterator_mark_and_reset() -> Result<()> {
        let f = setup()?;
        let dir = open(&f)?;
        let pages = distinct_pages(&dir, 5, dir.effective_page_size())?;
        let id = |r: Option<StorageResult<Page>>| -> Result<PageId> {
            let page = r.ok_or_else(|| anyhow::anyhow!("iterator ended"))??;
            page.unpin()?;
            Ok(page.page_id())
        };

        let mut iter = dir.iter();
        assert_eq!(id(iter.next())?, pages[0].page_id());
        assert_eq!(id(iter.next())?, pages[1].page_id());
        iter.mark_prev();
        assert_eq!(id(iter.next())?, pages[2].page_id());
        iter.reset();
        assert_eq!(id(iter.next())?, pages[1].page_id());
        assert_eq!(id(iter.next())?, pages[2].page_id());

        iter.mark_next();
        for page in &pages[3..] {
            assert_eq!(id(iter.next())?, page.page_id());
        }
        assert!(iter.next().is_none());
        iter.reset();
        assert_eq!(id(iter.next())?, pages[3].page_id());
        Ok(())
    }

    #[test]
    fn test_reopen_directory() -> Result<()> {
        let f = setup()?;
        let (id, pages) = {
            let dir = open(&f)?;
            let full = dir.effective_page_size();
            let pages = distinct_pages(&dir, HEADER_ENTRY_COUNT + 2, full)?;
            (dir.directory_id(), pages)
        };

        let dir = open(&f)?;
        assert_eq!(dir.directory_id(), id);
        assert_eq!(dir.num_header_pages(), 2);
        assert_eq!(dir.num_data_pages(), HEADER_ENTRY_COUNT + 2);
        assert_eq!(collect(dir.iter())?, pages);

        // Full pages stay full after reopening.
        let next = fetch(&dir, 1)?;
        assert!(!pages.contains(&next));
        Ok(())
    }

    #[test]
    fn test_header_from_other_directory_is_rejected() -> Result<()> {
        let f = setup()?;
        let dir = open(&f)?;
        let full = dir.effective_page_size();
        distinct_pages(&dir, HEADER_ENTRY_COUNT + 1, full)?;

        let other_header = f.disk.allocate_page(f.partition)?;
        let other = PageDirectory::open(f.pool.clone(), f.partition, other_header)?;

        // Point the first chain at a header owned by a different directory.
        let first = f.pool.fetch_page(f.first_header)?;
        let mut next = [0u8; 8];
        BigEndian::write_i64(&mut next, other_header.to_i64());
        first.write_bytes(NEXT_HEADER_OFFSET, &next)?;
        first.unpin()?;

        let err = PageDirectory::open(f.pool.clone(), f.partition, f.first_header)
            .err()
            .ok_or_else(|| anyhow::anyhow!("mismatched chain opened"))?;
        assert!(matches!(
            err,
            StorageError::DirectoryMismatch { found, .. } if found == other.directory_id()
        ));
        Ok(())
    }
}
