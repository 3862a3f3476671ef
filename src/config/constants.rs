//! # Engine Configuration Constants
//!
//! Centralized constants for the storage engine. Interdependent values are
//! co-located and enforced with compile-time assertions so a change to one
//! cannot silently break another.
//!
//! ## Dependency Graph
//!
//! ```text
//! SECTOR_SIZE (512 bytes)
//!       │
//!       ├─> PAGE_SIZE (4096 bytes, 8 sectors)
//!       │     All journal and cache-device addressing is in 4 KiB pages.
//!       │
//!       └─> SECTORS_PER_PAGE (derived: PAGE_SIZE / SECTOR_SIZE)
//!
//! UNIT_SECTORS (128 sectors = 64 KiB read-cache chunk)
//!       │
//!       ├─> PAGES_PER_UNIT (derived: UNIT_SECTORS / SECTORS_PER_PAGE)
//!       │     Must be <= 16: each slot's validity mask is a u16 with one
//!       │     bit per 4 KiB page.
//!       │
//!       └─> read-cache geometry in cachedev::CacheGeometry
//!
//! XLATE_CKPT_INTERVAL (100 batches)
//!       │
//!       └─> translation checkpoint thread trigger; bounds how many DATA
//!           objects recovery must roll forward past the last checkpoint
//! ```
//!
//! ## Critical Invariants
//!
//! 1. `PAGE_SIZE == SECTOR_SIZE * SECTORS_PER_PAGE`
//! 2. `PAGES_PER_UNIT <= 16` (validity mask width)
//! 3. `JOURNAL_MIN_PAGES >= 8` (a record plus checkpoint slack; the ring is
//!    never allowed to fill completely)

/// Virtual-disk sector size. All LBAs are in units of this.
pub const SECTOR_SIZE: usize = 512;

/// Cache-device page size. Journal records and cache metadata are
/// page-granular.
pub const PAGE_SIZE: usize = 4096;

/// Sectors per cache-device page.
pub const SECTORS_PER_PAGE: usize = PAGE_SIZE / SECTOR_SIZE;

/// Read-cache chunk size in sectors (64 KiB).
pub const UNIT_SECTORS: usize = 128;

/// 4 KiB pages per read-cache chunk.
pub const PAGES_PER_UNIT: usize = UNIT_SECTORS / SECTORS_PER_PAGE;

/// Smallest journal ring we will format. Keeps room for one maximal record
/// plus the slack that checkpointing relies on.
pub const JOURNAL_MIN_PAGES: u32 = 8;

/// Translation checkpoint every this many sealed batches.
pub const XLATE_CKPT_INTERVAL: u32 = 100;

/// Translation flush thread wakes at this period.
pub const XLATE_FLUSH_PERIOD_MS: u64 = 500;

/// A non-empty batch idle for this long is sealed by the flush thread.
pub const XLATE_FLUSH_TIMEOUT_MS: u64 = 2000;

/// Write-cache writer thread wake period (group-commit timer).
pub const WCACHE_FLUSH_PERIOD_MS: u64 = 50;

/// Write-cache checkpoint thread wake period.
pub const WCACHE_CKPT_PERIOD_MS: u64 = 100;

/// Write-cache checkpoint forced after this long with a dirty map.
pub const WCACHE_CKPT_TIMEOUT_MS: u64 = 5000;

/// Read-cache eviction thread wake period.
pub const RCACHE_EVICT_PERIOD_MS: u64 = 2000;

/// Read-cache metadata flushed at least this often while dirty.
pub const RCACHE_FLUSH_TIMEOUT_MS: u64 = 15_000;

const _: () = assert!(
    PAGE_SIZE == SECTOR_SIZE * SECTORS_PER_PAGE,
    "PAGE_SIZE must be a whole number of sectors"
);

const _: () = assert!(
    PAGES_PER_UNIT <= 16,
    "read-cache validity mask is a u16, one bit per page in a chunk"
);

const _: () = assert!(
    UNIT_SECTORS % SECTORS_PER_PAGE == 0,
    "read-cache chunks must be page-aligned"
);

const _: () = assert!(JOURNAL_MIN_PAGES >= 8);
