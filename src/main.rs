//! tierdb admin tool - inspect and maintain a page store

use anyhow::{bail, Context, Result};
use clap::{Parser as ClapParser, Subcommand};
use std::path::PathBuf;
use tierdb::config::StoreConfig;
use tierdb::database::Database;
use tierdb::storage::{DiskSpaceManager, PageId};

/// tierdb - page store administration
#[derive(ClapParser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Data directory
    #[arg(short = 'D', long, default_value = "./tierdb_data")]
    data_dir: PathBuf,

    /// Buffer pool size in frames
    #[arg(short = 'c', long, default_value = "1024")]
    capacity: usize,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List partitions and their allocated page counts
    Stat,
    /// Create a partition
    AllocPartition {
        /// Partition number to use instead of the next free one
        #[arg(long)]
        id: Option<u32>,
    },
    /// Delete a partition and its file
    FreePartition { id: u32 },
    /// Allocate a page in a partition
    AllocPage { partition: u32 },
    /// Free a page (`partition:local` or a raw page number)
    FreePage {
        #[arg(value_parser = parse_page_id)]
        page: PageId,
    },
    /// Hex dump part of a page's payload
    Dump {
        #[arg(value_parser = parse_page_id)]
        page: PageId,
        #[arg(long, default_value = "0")]
        offset: usize,
        #[arg(long, default_value = "256")]
        len: usize,
    },
}

fn parse_page_id(s: &str) -> Result<PageId, String> {
    match s.split_once(':') {
        Some((partition, local)) => {
            let partition = partition
                .parse()
                .map_err(|e| format!("bad partition '{}': {}", partition, e))?;
            let local = local
                .parse()
                .map_err(|e| format!("bad page '{}': {}", local, e))?;
            Ok(PageId::new(partition, local))
        }
        None => s
            .parse()
            .map(PageId)
            .map_err(|e| format!("bad page number '{}': {}", s, e)),
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.debug { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level)).init();

    let config = StoreConfig::new(&args.data_dir).buffer_capacity(args.capacity);
    let db = Database::open(&config)
        .with_context(|| format!("Failed to open store at {}", args.data_dir.display()))?;

    run(&db, args.command)?;
    db.close().context("Failed to flush store")?;
    Ok(())
}

fn run(db: &Database, command: Command) -> Result<()> {
    let disk = db.disk();
    match command {
        Command::Stat => {
            let mut ids = disk.partition_ids();
            ids.sort_unstable();
            println!("Data directory: {}", disk.dir().display());
            println!("Next partition: {}", disk.current_partition_counter());
            for id in ids {
                println!("  partition {:>5}: {} pages", id, disk.allocated_page_count(id)?);
            }
        }
        Command::AllocPartition { id } => {
            let id = match id {
                Some(id) => disk.allocate_partition_at(id)?,
                None => disk.allocate_partition()?,
            };
            println!("Allocated partition {}", id);
        }
        Command::FreePartition { id } => {
            db.buffer_pool().free_partition(id)?;
            println!("Freed partition {}", id);
        }
        Command::AllocPage { partition } => {
            let page = disk.allocate_page(partition)?;
            println!("Allocated page {} ({})", page, page.0);
        }
        Command::FreePage { page } => {
            let handle = db.buffer_pool().fetch_page(page)?;
            db.buffer_pool().free_page(&handle)?;
            handle.unpin()?;
            println!("Freed page {}", page);
        }
        Command::Dump { page, offset, len } => {
            let (lsn, bytes) = snapshot(db, page)?;
            if offset >= bytes.len() {
                bail!("offset {} is past the page payload of {} bytes", offset, bytes.len());
            }
            let end = offset.saturating_add(len).min(bytes.len());
            println!("Page {} (lsn {})", page, lsn);
            print_hex(&bytes[offset..end], offset);
        }
    }
    Ok(())
}

/// Page LSN and payload, both read while the page is pinned.
fn snapshot(db: &Database, page: PageId) -> Result<(u64, Vec<u8>)> {
    let handle = db.buffer_pool().fetch_page(page)?;
    let read = handle
        .page_lsn()
        .and_then(|lsn| Ok((lsn, handle.read_all()?)));
    handle.unpin()?;
    Ok(read?)
}

fn print_hex(bytes: &[u8], base: usize) {
    for (i, chunk) in bytes.chunks(16).enumerate() {
        let hex: Vec<String> = chunk.iter().map(|b| format!("{:02x}", b)).collect();
        let ascii: String = chunk
            .iter()
            .map(|&b| if b.is_ascii_graphic() { b as char } else { '.' })
            .collect();
        println!("{:08x}  {:<47}  {}", base + i * 16, hex.join(" "), ascii);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_parse_page_id() {
        assert_eq!(parse_page_id("2:7"), Ok(PageId::new(2, 7)));
        assert_eq!(parse_page_id("20000000007"), Ok(PageId(20_000_000_007)));
        assert!(parse_page_id("x:1").is_err());
        assert!(parse_page_id("").is_err());
    }

    #[test]
    fn test_snapshot_reads_lsn_of_evicted_page() -> Result<()> {
        let dir = tempdir()?;
        let db = Database::open(&StoreConfig::new(dir.path()).buffer_capacity(4))?;
        let part = db.disk().allocate_partition()?;

        let page = db.buffer_pool().fetch_new_page(part)?;
        page.set_page_lsn(42)?;
        page.write_bytes(0, b"dump")?;
        page.unpin()?;
        db.buffer_pool().evict_all()?;

        let (lsn, bytes) = snapshot(&db, page.page_id())?;
        assert_eq!(lsn, 42);
        assert_eq!(&bytes[..4], b"dump");

        // The snapshot leaves the page unpinned.
        let again = db.buffer_pool().fetch_page(page.page_id())?;
        assert_eq!(again.pin_count(), 1);
        again.unpin()?;
        Ok(())
    }
}
