use super::{
    check_page_buffer, HeaderBitmap, DATA_PAGES_PER_HEADER, DATA_PAGES_PER_PARTITION,
    HEADER_PAGES_PER_MASTER,
};
use crate::storage::{PageId, PartitionId, StorageError, StorageResult, PAGE_SIZE};
use byteorder::{BigEndian, ByteOrder};
use log::debug;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// One partition backed by one OS file.
///
/// Not synchronized: the owning manager wraps each partition in its own lock.
/// Page numbers here are local to the partition.
#[derive(Debug)]
pub struct Partition {
    id: PartitionId,
    path: PathBuf,
    file: Option<File>,
    master: Vec<u16>,
    headers: Vec<HeaderBitmap>,
}

impl Partition {
    /// Placeholder registered before the backing file is opened.
    pub(crate) fn unopened(id: PartitionId, path: PathBuf) -> Self {
        Self {
            id,
            path,
            file: None,
            master: vec![0; HEADER_PAGES_PER_MASTER],
            headers: vec![HeaderBitmap::new(); HEADER_PAGES_PER_MASTER],
        }
    }

    pub fn open(id: PartitionId, path: &Path) -> StorageResult<Self> {
        let mut partition = Self::unopened(id, path.to_path_buf());
        partition.load()?;
        Ok(partition)
    }

    /// Open the backing file, writing an empty master page if it is new and
    /// loading the master and in-use header pages otherwise.
    pub(crate) fn load(&mut self) -> StorageResult<()> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.path)?;
        let is_new = file.metadata()?.len() == 0;
        self.file = Some(file);

        if is_new {
            self.write_master_page()?;
            self.file()?.sync_data()?;
            return Ok(());
        }

        let mut buf = vec![0u8; PAGE_SIZE];
        self.read_at(0, &mut buf)?;
        for (header_index, chunk) in buf.chunks_exact(2).enumerate() {
            let count = BigEndian::read_u16(chunk);
            self.master[header_index] = count;
            if count != 0 {
                let mut header = vec![0u8; PAGE_SIZE];
                self.read_at(Self::header_page_offset(header_index), &mut header)?;
                self.headers[header_index] = HeaderBitmap::from_page(&header);
            }
        }
        debug!(
            "Loaded partition {} with {} allocated pages",
            self.id,
            self.allocated_pages()
        );
        Ok(())
    }

    pub fn id(&self) -> PartitionId {
        self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Allocate the first free data page: first header with room according
    /// to the master page, then the first clear bit in that header.
    pub fn allocate_page(&mut self) -> StorageResult<u64> {
        let header_index = self
            .master
            .iter()
            .position(|&count| (count as usize) < DATA_PAGES_PER_HEADER)
            .ok_or(StorageError::PartitionFull(self.id))?;
        let data_index = self.headers[header_index]
            .first_clear()
            .ok_or(StorageError::PartitionFull(self.id))?;
        self.do_allocate(header_index, data_index)
    }

    pub fn allocate_page_at(&mut self, local: u64) -> StorageResult<()> {
        if self.is_allocated(local)? {
            return Err(StorageError::AlreadyAllocated(PageId::new(self.id, local)));
        }
        let (header_index, data_index) = Self::split(local);
        self.do_allocate(header_index, data_index)?;
        Ok(())
    }

    pub fn free_page(&mut self, local: u64) -> StorageResult<()> {
        if !self.is_allocated(local)? {
            return Err(StorageError::NotAllocated(PageId::new(self.id, local)));
        }
        let (header_index, data_index) = Self::split(local);
        self.headers[header_index].clear(data_index);
        self.master[header_index] = self.headers[header_index].count_ones() as u16;
        self.persist_metadata(header_index)
    }

    /// Release every data page of the partition.
    pub fn free_all_pages(&mut self) -> StorageResult<()> {
        for header_index in 0..HEADER_PAGES_PER_MASTER {
            if self.master[header_index] == 0 {
                continue;
            }
            self.headers[header_index].clear_all();
            self.master[header_index] = 0;
            self.write_header_page(header_index)?;
        }
        self.write_master_page()?;
        self.file()?.sync_data()?;
        Ok(())
    }

    pub fn read_page(&mut self, local: u64, buf: &mut [u8]) -> StorageResult<()> {
        check_page_buffer(buf.len())?;
        if !self.is_allocated(local)? {
            return Err(StorageError::NotAllocated(PageId::new(self.id, local)));
        }
        self.read_at(Self::data_page_offset(local), buf)
    }

    pub fn write_page(&mut self, local: u64, buf: &[u8]) -> StorageResult<()> {
        check_page_buffer(buf.len())?;
        if !self.is_allocated(local)? {
            return Err(StorageError::NotAllocated(PageId::new(self.id, local)));
        }
        self.write_at(Self::data_page_offset(local), buf)?;
        self.file()?.sync_data()?;
        Ok(())
    }

    pub fn is_allocated(&self, local: u64) -> StorageResult<bool> {
        if local >= DATA_PAGES_PER_PARTITION {
            return Err(StorageError::OutOfRange {
                local,
                max: DATA_PAGES_PER_PARTITION - 1,
            });
        }
        let (header_index, data_index) = Self::split(local);
        Ok(self.headers[header_index].get(data_index))
    }

    pub fn allocated_pages(&self) -> u64 {
        self.master.iter().map(|&count| count as u64).sum()
    }

    /// Per-header allocation counts as mirrored in the master page.
    pub fn master_counts(&self) -> &[u16] {
        &self.master
    }

    pub fn file_size(&self) -> StorageResult<u64> {
        match &self.file {
            Some(file) => Ok(file.metadata()?.len()),
            None => Err(StorageError::NotFound(self.id)),
        }
    }

    /// Drop the file handle; later I/O fails with `NotFound`.
    pub fn close(&mut self) {
        self.file = None;
    }

    /// Byte offset of header page `header_index`.
    pub fn header_page_offset(header_index: usize) -> u64 {
        (1 + header_index as u64 * (DATA_PAGES_PER_HEADER as u64 + 1)) * PAGE_SIZE as u64
    }

    /// Byte offset of local data page `local`.
    pub fn data_page_offset(local: u64) -> u64 {
        (local / DATA_PAGES_PER_HEADER as u64 + 2 + local) * PAGE_SIZE as u64
    }

    fn split(local: u64) -> (usize, usize) {
        (
            (local / DATA_PAGES_PER_HEADER as u64) as usize,
            (local % DATA_PAGES_PER_HEADER as u64) as usize,
        )
    }

    fn do_allocate(&mut self, header_index: usize, data_index: usize) -> StorageResult<u64> {
        self.headers[header_index].set(data_index);
        self.master[header_index] = self.headers[header_index].count_ones() as u16;
        self.persist_metadata(header_index)?;
        Ok(header_index as u64 * DATA_PAGES_PER_HEADER as u64 + data_index as u64)
    }

    // TODO: a crash between the master and header writes leaves the two out
    // of sync; reconcile counts from the bitmaps on load once recovery lands.
    fn persist_metadata(&mut self, header_index: usize) -> StorageResult<()> {
        self.write_master_page()?;
        self.write_header_page(header_index)?;
        self.file()?.sync_data()?;
        Ok(())
    }

    fn write_master_page(&mut self) -> StorageResult<()> {
        let mut buf = vec![0u8; PAGE_SIZE];
        BigEndian::write_u16_into(&self.master, &mut buf);
        self.write_at(0, &buf)
    }

    fn write_header_page(&mut self, header_index: usize) -> StorageResult<()> {
        let buf = self.headers[header_index].to_page();
        self.write_at(Self::header_page_offset(header_index), &buf)
    }

    fn file(&mut self) -> StorageResult<&mut File> {
        let id = self.id;
        self.file.as_mut().ok_or(StorageError::NotFound(id))
    }

    /// Positioned read; bytes past the end of the file read as zero.
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> StorageResult<()> {
        let file = self.file()?;
        file.seek(SeekFrom::Start(offset))?;
        let mut filled = 0;
        while filled < buf.len() {
            let n = file.read(&mut buf[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        buf[filled..].fill(0);
        Ok(())
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> StorageResult<()> {
        let file = self.file()?;
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(buf)?;
        Ok(())
    }
}
