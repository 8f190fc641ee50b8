use anyhow::Result;
use byteorder::{BigEndian, ByteOrder};
use rand::Rng;
use std::sync::Arc;
use std::thread;
use tempfile::tempdir;
use tierdb::access::{BacktrackingIterator, PageDirectory};
use tierdb::config::StoreConfig;
use tierdb::database::Database;
use tierdb::storage::buffer::RESERVED_SPACE;
use tierdb::storage::{BufferPool, DiskManager, DiskSpaceManager, PageId, StorageError, PAGE_SIZE};

#[test]
fn test_write_flush_reopen_scenario() -> Result<()> {
    let dir = tempdir()?;
    let data = [0xDE, 0xAD, 0xBE, 0xEF];

    let page_id = {
        let disk = Arc::new(DiskManager::open(dir.path())?);
        let pool = BufferPool::new(disk.clone(), 16);

        assert_eq!(disk.allocate_partition_at(1)?, 1);
        let page = pool.fetch_new_page(1)?;
        assert_eq!(page.page_id(), PageId::new(1, 0));
        assert_eq!(page.page_id().partition(), 1);
        assert_eq!(page.page_id().local(), 0);

        page.write_bytes(67, &data)?;
        let mut read = [0u8; 4];
        page.read_bytes(67, &mut read)?;
        assert_eq!(read, data);

        page.flush()?;
        page.unpin()?;
        page.page_id()
    };

    let disk = Arc::new(DiskManager::open(dir.path())?);
    assert_eq!(disk.partition_ids(), vec![1]);
    assert_eq!(disk.current_partition_counter(), 2);
    let pool = BufferPool::new(disk, 16);
    let page = pool.fetch_page(page_id)?;
    let mut read = [0u8; 4];
    page.read_bytes(67, &mut read)?;
    page.unpin()?;
    assert_eq!(read, data);
    Ok(())
}

#[test]
fn test_allocation_state_survives_reopen() -> Result<()> {
    let dir = tempdir()?;
    let (kept, freed) = {
        let disk = DiskManager::open(dir.path())?;
        let part = disk.allocate_partition()?;
        let pages: Vec<PageId> = (0..10)
            .map(|_| disk.allocate_page(part))
            .collect::<Result<_, _>>()?;
        disk.free_page(pages[3])?;
        disk.free_page(pages[7])?;
        let freed = [pages[3], pages[7]];
        (pages, freed)
    };

    let disk = DiskManager::open(dir.path())?;
    assert_eq!(disk.allocated_page_count(0)?, 8);
    for page in &kept {
        assert_eq!(disk.is_allocated(*page), !freed.contains(page));
    }

    // Freed pages are handed out again before new ones.
    assert_eq!(disk.allocate_page(0)?, freed[0]);
    assert_eq!(disk.allocate_page(0)?, freed[1]);
    assert_eq!(disk.allocate_page(0)?, PageId::new(0, 10));
    assert!(matches!(
        disk.allocate_page_at(PageId::new(0, 10)).unwrap_err(),
        StorageError::AlreadyAllocated(_)
    ));
    Ok(())
}

#[test]
fn test_no_force_steal_on_disk() -> Result<()> {
    let dir = tempdir()?;
    let disk = Arc::new(DiskManager::open(dir.path())?);
    let pool = BufferPool::new(disk.clone(), 2);
    let part = disk.allocate_partition()?;

    let page = pool.fetch_new_page(part)?;
    page.write_bytes(0, b"steal")?;
    page.unpin()?;

    let mut raw = vec![0u8; PAGE_SIZE];
    disk.read_page(page.page_id(), &mut raw)?;
    assert_eq!(&raw[RESERVED_SPACE..RESERVED_SPACE + 5], &[0u8; 5]);

    // Two more pages push the dirty one out.
    pool.fetch_new_page(part)?.unpin()?;
    pool.fetch_new_page(part)?.unpin()?;
    assert!(!page.is_valid());

    disk.read_page(page.page_id(), &mut raw)?;
    assert_eq!(&raw[RESERVED_SPACE..RESERVED_SPACE + 5], b"steal");
    Ok(())
}

#[test]
fn test_concurrent_pin_and_evict() -> Result<()> {
    const PAGES: usize = 16;
    const THREADS: usize = 4;
    const ROUNDS: usize = 500;

    let dir = tempdir()?;
    let disk = Arc::new(DiskManager::open(dir.path())?);
    // Fewer frames than pages, but enough that one pin per thread never
    // exhausts the pool.
    let pool = BufferPool::new(disk.clone(), 8);
    let part = disk.allocate_partition()?;

    let mut pages = Vec::new();
    for _ in 0..PAGES {
        let page = pool.fetch_new_page(part)?;
        let mut tag = [0u8; 8];
        BigEndian::write_u64(&mut tag, page.page_id().0);
        page.write_bytes(0, &tag)?;
        page.unpin()?;
        pages.push(page.page_id());
    }
    let pages = Arc::new(pages);

    let handles: Vec<_> = (0..THREADS)
        .map(|t| {
            let pool = pool.clone();
            let pages = pages.clone();
            thread::spawn(move || -> Result<Vec<u32>> {
                let mut rng = rand::thread_rng();
                let mut counts = vec![0u32; PAGES];
                let slot = 8 + t * 4;
                for _ in 0..ROUNDS {
                    let i = rng.gen_range(0..PAGES);
                    let page = pool.fetch_page(pages[i])?;

                    let mut tag = [0u8; 8];
                    page.read_bytes(0, &mut tag)?;
                    assert_eq!(BigEndian::read_u64(&tag), pages[i].0);

                    let mut counter = [0u8; 4];
                    page.read_bytes(slot, &mut counter)?;
                    let value = BigEndian::read_u32(&counter) + 1;
                    BigEndian::write_u32(&mut counter, value);
                    page.write_bytes(slot, &counter)?;
                    counts[i] += 1;

                    page.unpin()?;
                    if rng.gen_bool(0.1) {
                        pool.evict(pages[i])?;
                    }
                }
                Ok(counts)
            })
        })
        .collect();

    let mut expected = vec![vec![0u32; PAGES]; THREADS];
    for (t, handle) in handles.into_iter().enumerate() {
        expected[t] = handle.join().expect("worker panicked")?;
    }

    pool.flush_all()?;
    for (i, page_id) in pages.iter().enumerate() {
        let page = pool.fetch_page(*page_id)?;
        assert_eq!(page.pin_count(), 1);
        for (t, counts) in expected.iter().enumerate() {
            let mut counter = [0u8; 4];
            page.read_bytes(8 + t * 4, &mut counter)?;
            assert_eq!(BigEndian::read_u32(&counter), counts[i]);
        }
        page.unpin()?;
    }
    Ok(())
}

#[test]
fn test_concurrent_directory_requests() -> Result<()> {
    const THREADS: usize = 4;
    const REQUESTS: usize = 50;
    const RECORD: usize = 100;

    let dir = tempdir()?;
    let db = Database::open(&StoreConfig::new(dir.path()).buffer_capacity(64))?;
    let part = db.disk().allocate_partition()?;
    let directory = Arc::new(db.create_directory(part)?);

    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let directory = directory.clone();
            thread::spawn(move || -> Result<Vec<PageId>> {
                let mut seen = Vec::new();
                for _ in 0..REQUESTS {
                    let page = directory.fetch_page_with_space(RECORD)?;
                    seen.push(page.page_id());
                    page.unpin()?;
                }
                Ok(seen)
            })
        })
        .collect();

    let mut used = Vec::new();
    for handle in handles {
        used.extend(handle.join().expect("worker panicked")?);
    }

    let per_page = directory.effective_page_size() / RECORD;
    let expected_pages = (THREADS * REQUESTS).div_ceil(per_page);
    assert_eq!(directory.num_data_pages(), expected_pages);
    for page in directory.iter() {
        let page = page?;
        let uses = used.iter().filter(|&&p| p == page.page_id()).count();
        assert!(uses <= per_page);
        page.unpin()?;
    }
    Ok(())
}

#[test]
fn test_directory_rescan_with_mark() -> Result<()> {
    let dir = tempdir()?;
    let db = Database::open(&StoreConfig::new(dir.path()).buffer_capacity(16))?;
    let part = db.disk().allocate_partition()?;
    let directory: PageDirectory = db.create_directory(part)?;
    let full = directory.effective_page_size();

    let mut pages = Vec::new();
    for _ in 0..4 {
        let page = directory.fetch_page_with_space(full)?;
        pages.push(page.page_id());
        page.unpin()?;
    }

    // Nested-loop style: for every outer page, rescan the inner pages from a mark.
    let mut inner = directory.iter();
    let first = inner.next().ok_or_else(|| anyhow::anyhow!("empty directory"))??;
    first.unpin()?;
    inner.mark_prev();

    let mut passes = 0;
    for outer in directory.iter() {
        outer?.unpin()?;
        inner.reset();
        let mut scanned = Vec::new();
        for page in inner.by_ref() {
            let page = page?;
            scanned.push(page.page_id());
            page.unpin()?;
        }
        assert_eq!(scanned, pages);
        passes += 1;
    }
    assert_eq!(passes, 4);
    db.close()?;
    Ok(())
}
