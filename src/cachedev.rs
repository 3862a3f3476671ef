//! # Cache Device
//!
//! The SSD file shared by the write-cache journal and the read-cache slots.
//! Regions are disjoint by construction:
//!
//! ```text
//! page 0                    CacheSuper
//! page 1                    WriteSuper
//! page 2                    ReadSuper
//! [3, meta_limit)           write-cache checkpoint metadata (two halves)
//! [journal_base, journal_limit)   write-cache journal ring
//! [map_start, +map_blocks)  read-cache flat map
//! [bitmap_start, +bitmap_blocks)  read-cache validity bitmaps
//! [slot_base, end)          read-cache chunk slots
//! ```
//!
//! I/O is positional and page-granular; nothing here seeks. The device trait
//! is the capability set the caches program against, so tests can substitute
//! an in-memory device if they ever need to.

use std::fs::{File, OpenOptions};
use std::io::IoSlice;
use std::os::unix::fs::FileExt;
use std::path::Path;

use eyre::{ensure, Result, WrapErr};
use tracing::info;
use zerocopy::IntoBytes;

use crate::config::{JOURNAL_MIN_PAGES, PAGES_PER_UNIT, PAGE_SIZE, UNIT_SECTORS};
use crate::error::EngineError;
use crate::ondisk::{CacheSuper, ReadSuper, WriteSuper};

/// Positional I/O over the cache SSD.
pub trait CacheDevice: Send + Sync {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<()>;
    fn write_at(&self, buf: &[u8], offset: u64) -> Result<()>;

    /// Gather write: segments land back to back starting at `offset`.
    fn write_vectored_at(&self, bufs: &[IoSlice<'_>], offset: u64) -> Result<()> {
        let mut off = offset;
        for buf in bufs {
            self.write_at(buf, off)?;
            off += buf.len() as u64;
        }
        Ok(())
    }

    /// Make everything written so far durable.
    fn sync(&self) -> Result<()>;

    fn len(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Cache device backed by a regular file.
#[derive(Debug)]
pub struct FileDevice {
    file: File,
    len: u64,
}

impl FileDevice {
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| EngineError::Io(format!("open cache device {path:?}: {e}")))?;
        let len = file
            .metadata()
            .map_err(|e| EngineError::Io(format!("stat {path:?}: {e}")))?
            .len();
        Ok(Self { file, len })
    }
}

impl CacheDevice for FileDevice {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<()> {
        self.file
            .read_exact_at(buf, offset)
            .map_err(|e| EngineError::Io(format!("cache read at {offset}: {e}")).into())
    }

    fn write_at(&self, buf: &[u8], offset: u64) -> Result<()> {
        self.file
            .write_all_at(buf, offset)
            .map_err(|e| EngineError::Io(format!("cache write at {offset}: {e}")).into())
    }

    fn sync(&self) -> Result<()> {
        self.file
            .sync_data()
            .map_err(|e| EngineError::Io(format!("cache sync: {e}")).into())
    }

    fn len(&self) -> u64 {
        self.len
    }
}

/// Where everything lives on the cache device, in pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheGeometry {
    pub total_pages: u32,
    pub write_super_page: u32,
    pub read_super_page: u32,
    pub meta_base: u32,
    pub meta_limit: u32,
    pub journal_base: u32,
    pub journal_limit: u32,
    pub map_start: u32,
    pub map_blocks: u32,
    pub bitmap_start: u32,
    pub bitmap_blocks: u32,
    pub slot_base: u32,
    pub units: u32,
}

fn div_round_up(n: u32, m: u32) -> u32 {
    (n + m - 1) / m
}

impl CacheGeometry {
    /// Split `cache_size` bytes between the journal and the slot cache.
    ///
    /// The write side (metadata region plus journal ring) takes half the
    /// device; the read side takes what remains after its own map and
    /// bitmap overhead.
    pub fn compute(cache_size: usize) -> Result<Self> {
        let total_pages = (cache_size / PAGE_SIZE) as u32;
        ensure!(
            total_pages >= 64,
            EngineError::Format(format!("cache too small: {total_pages} pages"))
        );

        let write_pages = total_pages / 2;
        // Even number of metadata pages so the two checkpoint halves match.
        let meta_pages = (write_pages / 16).clamp(4, 256) & !1;
        let meta_base = 3;
        let meta_limit = meta_base + meta_pages;
        let journal_base = meta_limit;
        let journal_limit = 3 + write_pages;
        ensure!(
            journal_limit - journal_base >= JOURNAL_MIN_PAGES,
            EngineError::Format("journal ring too small".into())
        );

        let read_pages = total_pages - journal_limit;
        let mut units = read_pages / PAGES_PER_UNIT as u32;
        let (map_blocks, bitmap_blocks) = loop {
            ensure!(
                units > 0,
                EngineError::Format("no room for read-cache slots".into())
            );
            let map_blocks = div_round_up(units * 8, PAGE_SIZE as u32);
            let bitmap_blocks = div_round_up(units * 2, PAGE_SIZE as u32);
            if units * PAGES_PER_UNIT as u32 + map_blocks + bitmap_blocks <= read_pages {
                break (map_blocks, bitmap_blocks);
            }
            units -= 1;
        };

        let map_start = journal_limit;
        let bitmap_start = map_start + map_blocks;
        let slot_base = bitmap_start + bitmap_blocks;

        Ok(Self {
            total_pages,
            write_super_page: 1,
            read_super_page: 2,
            meta_base,
            meta_limit,
            journal_base,
            journal_limit,
            map_start,
            map_blocks,
            bitmap_start,
            bitmap_blocks,
            slot_base,
            units,
        })
    }
}

/// Create and format a fresh cache file. Existing contents are destroyed.
pub fn format(path: &Path, cache_size: usize, vol_uuid: [u8; 16]) -> Result<CacheGeometry> {
    let geo = CacheGeometry::compute(cache_size)?;

    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)
        .wrap_err_with(|| format!("failed to create cache file {path:?}"))?;
    file.set_len(geo.total_pages as u64 * PAGE_SIZE as u64)
        .wrap_err("failed to size cache file")?;

    let mut page = vec![0u8; PAGE_SIZE];

    let cache_super = CacheSuper::new(vol_uuid, geo.write_super_page, geo.read_super_page, 0);
    page[..cache_super.as_bytes().len()].copy_from_slice(cache_super.as_bytes());
    file.write_all_at(&page, 0)?;

    page.fill(0);
    let write_super = WriteSuper::new(
        vol_uuid,
        geo.meta_base,
        geo.meta_limit,
        geo.journal_base,
        geo.journal_limit,
    );
    page[..write_super.as_bytes().len()].copy_from_slice(write_super.as_bytes());
    file.write_all_at(&page, geo.write_super_page as u64 * PAGE_SIZE as u64)?;

    page.fill(0);
    let read_super = ReadSuper::new(
        vol_uuid,
        UNIT_SECTORS as u32,
        geo.slot_base,
        geo.units,
        geo.map_start,
        geo.map_blocks,
        geo.bitmap_start,
        geo.bitmap_blocks,
    );
    page[..read_super.as_bytes().len()].copy_from_slice(read_super.as_bytes());
    file.write_all_at(&page, geo.read_super_page as u64 * PAGE_SIZE as u64)?;

    file.sync_all().wrap_err("failed to sync cache file")?;
    info!(
        ?path,
        journal_pages = geo.journal_limit - geo.journal_base,
        units = geo.units,
        "formatted cache device"
    );
    Ok(geo)
}

/// Validate page 0 and return the parsed cache super.
pub fn read_cache_super(dev: &dyn CacheDevice) -> Result<CacheSuper> {
    let mut page = vec![0u8; PAGE_SIZE];
    dev.read_at(&mut page, 0)?;
    Ok(*CacheSuper::parse(&page)?)
}
