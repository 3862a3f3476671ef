//! # Write Cache
//!
//! An on-SSD circular journal that makes writes durable before they reach
//! the object backend. Writes are acknowledged once their journal record is
//! on the cache device; a copy is forwarded to the translation layer, which
//! batches it toward an object in its own time.
//!
//! ## Journal Ring
//!
//! The ring is a page range `[base, limit)`. Each group commit produces one
//! record: a header page (magic, type, sequence, length, CRC, extent array)
//! followed by payload pages. An allocation that would cross `limit` first
//! emits a one-page PAD record covering the tail and restarts at `base`.
//! `[oldest, next)` (mod ring size) holds live records; `next == oldest`
//! means empty; checkpoints keep enough slack that the ring never fills.
//!
//! ## Maps
//!
//! The forward map (LBA → SSD sector) serves read hits; the reverse map
//! (SSD sector → LBA) exists so eviction can find and trim the forward
//! entries of a record it is about to overwrite. The two are updated
//! together under the cache lock and must stay exact inverses.
//!
//! ## Group Commit
//!
//! `writev` queues a job and returns a completion handle. The writer thread
//! drains the queue (immediately when idle, in batches while a commit is
//! in flight), allocates pages, writes PAD and record in at most two device
//! operations, syncs, then publishes map entries, forwards each job to the
//! translation layer, and fires completions.
//!
//! ## Checkpoints
//!
//! A checkpoint serializes the forward map and the record-length table into
//! one half of the metadata region, then rewrites the superblock. Halves
//! alternate so a crash mid-checkpoint leaves the previous one intact.
//! Only records durable on SSD are described: the persisted `next` and
//! `seq` are those of the oldest not-yet-acknowledged record, so replay
//! never resurrects a write whose device write had not completed.
//!
//! ## Recovery
//!
//! Load the superblock, rebuild the maps and page descriptors from the last
//! checkpoint, then roll the log forward from `next`: each record is
//! validated (magic, type, expected sequence, CRC), applied to the maps,
//! and re-forwarded to the translation layer. The first invalid header ends
//! the scan. If anything was applied, a fresh checkpoint is written.

use std::io::IoSlice;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use eyre::{bail, ensure, Result, WrapErr};
use parking_lot::{Condvar, Mutex};
use smallvec::SmallVec;
use tracing::{debug, error, info, warn};
use zerocopy::little_endian::{U32, U64};
use zerocopy::IntoBytes;

use crate::cachedev::CacheDevice;
use crate::config::{
    Config, PAGE_SIZE, SECTORS_PER_PAGE, SECTOR_SIZE, WCACHE_CKPT_PERIOD_MS,
    WCACHE_CKPT_TIMEOUT_MS, WCACHE_FLUSH_PERIOD_MS,
};
use crate::error::EngineError;
use crate::extmap::{Extent, ExtentMap, LbaPtr, SectorPtr};
use crate::ondisk::{
    decode_entries, encode_entries, journal_page_crc, JournalExtent, JournalHeader, LengthEntry,
    MapEntry, WriteSuper, JOURNAL_HEADER_SIZE, J_DATA, J_PAD,
};
use crate::request::{Completion, ReadRequest};
use crate::translate::Translate;

/// Journal page state machine: `None → (Hdr | Pad | Data) → None`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageState {
    None,
    Hdr,
    Pad,
    Data,
}

#[derive(Debug, Clone, Copy)]
struct PageDesc {
    state: PageState,
    n_pages: u32,
}

impl PageDesc {
    const NONE: PageDesc = PageDesc {
        state: PageState::None,
        n_pages: 0,
    };
}

/// In-memory mirror of the write superblock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SuperState {
    pub seq: u64,
    pub meta_base: u32,
    pub meta_limit: u32,
    pub base: u32,
    pub limit: u32,
    pub next: u32,
    pub oldest: u32,
    pub map_start: u32,
    pub map_blocks: u32,
    pub map_entries: u32,
    pub len_start: u32,
    pub len_blocks: u32,
    pub len_entries: u32,
}

impl SuperState {
    fn from_ondisk(s: &WriteSuper) -> Self {
        Self {
            seq: s.seq.get(),
            meta_base: s.meta_base.get(),
            meta_limit: s.meta_limit.get(),
            base: s.base.get(),
            limit: s.limit.get(),
            next: s.next.get(),
            oldest: s.oldest.get(),
            map_start: s.map_start.get(),
            map_blocks: s.map_blocks.get(),
            map_entries: s.map_entries.get(),
            len_start: s.len_start.get(),
            len_blocks: s.len_blocks.get(),
            len_entries: s.len_entries.get(),
        }
    }

    fn to_ondisk(self, vol_uuid: [u8; 16]) -> WriteSuper {
        let mut s = WriteSuper::new(vol_uuid, self.meta_base, self.meta_limit, self.base, self.limit);
        s.seq = U64::new(self.seq);
        s.next = U32::new(self.next);
        s.oldest = U32::new(self.oldest);
        s.map_start = U32::new(self.map_start);
        s.map_blocks = U32::new(self.map_blocks);
        s.map_entries = U32::new(self.map_entries);
        s.len_start = U32::new(self.len_start);
        s.len_blocks = U32::new(self.len_blocks);
        s.len_entries = U32::new(self.len_entries);
        s
    }

    fn ring_pages(&self) -> u32 {
        self.limit - self.base
    }
}

struct WriteJob {
    lba: u64,
    data: Vec<u8>,
    completion: Arc<Completion>,
}

/// An in-flight record: pages reserved, device write not yet complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct OutstandingRec {
    page: u32,
    len: u32,
    seq: u64,
}

struct WcState {
    sup: SuperState,
    map: ExtentMap<SectorPtr>,
    rmap: ExtentMap<LbaPtr>,
    cache_blocks: Vec<PageDesc>,
    outstanding: Vec<OutstandingRec>,
    next_acked_page: u32,
    next_acked_seq: u64,
    work: Vec<WriteJob>,
    outstanding_writes: u32,
    total_write_pages: u32,
    map_dirty: bool,
    ckpt_in_progress: bool,
}

impl WcState {
    fn desc(&self, page: u32) -> PageDesc {
        self.cache_blocks[(page - self.sup.base) as usize]
    }

    fn set_desc(&mut self, page: u32, desc: PageDesc) {
        let base = self.sup.base;
        self.cache_blocks[(page - base) as usize] = desc;
    }

    fn record_outstanding(&mut self, page: u32, len: u32, seq: u64) {
        self.outstanding.push(OutstandingRec { page, len, seq });
        self.refresh_acked();
    }

    fn notify_complete(&mut self, page: u32, len: u32) {
        if let Some(pos) = self
            .outstanding
            .iter()
            .position(|r| r.page == page && r.len == len)
        {
            self.outstanding.remove(pos);
        }
        self.refresh_acked();
    }

    /// Everything below the oldest in-flight record is durable.
    fn refresh_acked(&mut self) {
        match self.outstanding.first() {
            Some(r) => {
                self.next_acked_page = r.page;
                self.next_acked_seq = r.seq;
            }
            None => {
                self.next_acked_page = self.sup.next;
                self.next_acked_seq = self.sup.seq;
            }
        }
    }

    fn in_valid_ring(&self, page: u32) -> bool {
        let (oldest, next) = (self.sup.oldest, self.next_acked_page);
        if oldest <= next {
            page >= oldest && page < next
        } else {
            page >= oldest || page < next
        }
    }
}

struct WcShared {
    dev: Arc<dyn CacheDevice>,
    be: Translate,
    super_page: u32,
    vol_uuid: [u8; 16],
    write_batch: usize,
    max_write_pages: u32,
    running: AtomicBool,
    halted: AtomicBool,
    state: Mutex<WcState>,
    work_cv: Condvar,
    write_cv: Condvar,
    misc_cv: Condvar,
}

/// The write cache. Cheap to clone.
#[derive(Clone)]
pub struct WriteCache {
    shared: Arc<WcShared>,
    handles: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl WriteCache {
    /// Load the superblock, recover the maps, roll the journal forward, and
    /// start the writer and checkpoint threads.
    pub fn open(
        dev: Arc<dyn CacheDevice>,
        super_page: u32,
        be: Translate,
        cfg: &Config,
    ) -> Result<Self> {
        let mut page = vec![0u8; PAGE_SIZE];
        dev.read_at(&mut page, super_page as u64 * PAGE_SIZE as u64)
            .wrap_err("failed to read write-cache superblock")?;
        let ondisk = WriteSuper::parse(&page)?;
        let vol_uuid = ondisk.vol_uuid;
        let sup = SuperState::from_ondisk(ondisk);
        ensure!(
            sup.base < sup.limit,
            EngineError::Format("write-cache ring is empty".into())
        );

        let n_pages = sup.ring_pages();
        let state = WcState {
            sup,
            map: ExtentMap::new(),
            rmap: ExtentMap::new(),
            cache_blocks: vec![PageDesc::NONE; n_pages as usize],
            outstanding: Vec::new(),
            next_acked_page: sup.next,
            next_acked_seq: sup.seq,
            work: Vec::new(),
            outstanding_writes: 0,
            total_write_pages: 0,
            map_dirty: false,
            ckpt_in_progress: false,
        };

        let shared = Arc::new(WcShared {
            dev,
            be,
            super_page,
            vol_uuid,
            write_batch: cfg.wcache_batch,
            max_write_pages: n_pages / 2,
            running: AtomicBool::new(true),
            halted: AtomicBool::new(false),
            state: Mutex::new(state),
            work_cv: Condvar::new(),
            write_cv: Condvar::new(),
            misc_cv: Condvar::new(),
        });

        let this = Self {
            shared,
            handles: Arc::new(Mutex::new(Vec::new())),
        };
        this.read_map_entries()?;
        this.roll_log_forward()?;

        let mut handles = this.handles.lock();
        {
            let shared = Arc::clone(&this.shared);
            handles.push(
                std::thread::Builder::new()
                    .name("wcache-writer".into())
                    .spawn(move || writer_thread(&shared))
                    .wrap_err("failed to spawn write-cache writer")?,
            );
        }
        {
            let shared = Arc::clone(&this.shared);
            handles.push(
                std::thread::Builder::new()
                    .name("wcache-ckpt".into())
                    .spawn(move || ckpt_thread(&shared))
                    .wrap_err("failed to spawn write-cache checkpoint thread")?,
            );
        }
        drop(handles);
        Ok(this)
    }

    /// Rebuild the forward/reverse maps and page descriptors from the last
    /// checkpoint.
    fn read_map_entries(&self) -> Result<()> {
        let sh = &self.shared;
        let mut state = sh.state.lock();
        let sup = state.sup;

        if sup.map_entries > 0 {
            let mut buf = vec![0u8; sup.map_blocks as usize * PAGE_SIZE];
            sh.dev
                .read_at(&mut buf, sup.map_start as u64 * PAGE_SIZE as u64)?;
            let entries: Vec<MapEntry> = decode_entries(
                &buf,
                0,
                sup.map_entries * std::mem::size_of::<MapEntry>() as u32,
            )?;
            for e in &entries {
                state
                    .map
                    .update(e.lba(), e.lba() + e.sectors(), SectorPtr(e.plba.get()), None);
                state
                    .rmap
                    .update(e.plba.get(), e.plba.get() + e.sectors(), LbaPtr(e.lba()), None);
            }
        }

        if sup.len_entries > 0 {
            let mut buf = vec![0u8; sup.len_blocks as usize * PAGE_SIZE];
            sh.dev
                .read_at(&mut buf, sup.len_start as u64 * PAGE_SIZE as u64)?;
            let lengths: Vec<LengthEntry> = decode_entries(
                &buf,
                0,
                sup.len_entries * std::mem::size_of::<LengthEntry>() as u32,
            )?;
            for l in &lengths {
                let (page, len) = (l.page.get(), l.len.get());
                ensure!(
                    page >= sup.base && page + len <= sup.limit,
                    EngineError::Format(format!("record boundary [{page}, +{len}) outside ring"))
                );
                state.set_desc(
                    page,
                    PageDesc {
                        state: PageState::Hdr,
                        n_pages: len,
                    },
                );
                for i in 1..len {
                    state.set_desc(
                        page + i,
                        PageDesc {
                            state: PageState::Data,
                            n_pages: 0,
                        },
                    );
                }
            }
        }
        Ok(())
    }

    /// Replay journal records newer than the checkpoint. Stops at the first
    /// invalid header; everything before it is accepted.
    fn roll_log_forward(&self) -> Result<()> {
        let sh = &self.shared;
        let mut dirty = false;
        let mut page_buf = vec![0u8; PAGE_SIZE];

        loop {
            let (next, expect_seq) = {
                let state = sh.state.lock();
                (state.sup.next, state.sup.seq)
            };
            sh.dev
                .read_at(&mut page_buf, next as u64 * PAGE_SIZE as u64)?;
            let hdr = match JournalHeader::parse(&page_buf) {
                Ok(h) => *h,
                Err(_) => break,
            };
            let rec_type = hdr.rec_type.get();
            if !hdr.is_valid_magic()
                || (rec_type != J_DATA && rec_type != J_PAD)
                || hdr.seq.get() != expect_seq
                || hdr.crc32.get() != journal_page_crc(&page_buf)
            {
                break;
            }

            let mut state = sh.state.lock();
            state.sup.seq += 1;

            if rec_type == J_PAD {
                let n_pad = state.sup.limit - next;
                state.set_desc(
                    next,
                    PageDesc {
                        state: PageState::Pad,
                        n_pages: n_pad,
                    },
                );
                for p in next + 1..state.sup.limit {
                    state.set_desc(p, PageDesc::NONE);
                }
                state.sup.next = state.sup.base;
                state.refresh_acked();
                continue;
            }

            let len = hdr.len_pages.get();
            if len < 1 || next + len > state.sup.limit {
                // Corrupt length: treat as end of log.
                state.sup.seq -= 1;
                break;
            }
            state.set_desc(
                next,
                PageDesc {
                    state: PageState::Hdr,
                    n_pages: len,
                },
            );
            for p in next + 1..next + len {
                state.set_desc(
                    p,
                    PageDesc {
                        state: PageState::Data,
                        n_pages: 0,
                    },
                );
            }

            let extents: Vec<JournalExtent> =
                match decode_entries(&page_buf, hdr.extent_offset.get(), hdr.extent_len.get()) {
                    Ok(e) => e,
                    Err(_) => break,
                };
            drop(state);

            let mut payload = vec![0u8; (len - 1) as usize * PAGE_SIZE];
            sh.dev
                .read_at(&mut payload, (next + 1) as u64 * PAGE_SIZE as u64)?;

            let mut state = sh.state.lock();
            let mut plba = (next + 1) as u64 * SECTORS_PER_PAGE as u64;
            let mut offset = 0usize;
            let mut displaced = Vec::new();
            for e in &extents {
                let sectors = e.sectors();
                let bytes = sectors as usize * SECTOR_SIZE;
                displaced.clear();
                state
                    .map
                    .update(e.lba(), e.lba() + sectors, SectorPtr(plba), Some(&mut displaced));
                for d in &displaced {
                    let (pbase, plen) = (d.value.0, d.len());
                    state.rmap.trim(pbase, pbase + plen);
                }
                state
                    .rmap
                    .update(plba, plba + sectors, LbaPtr(e.lba()), None);
                state.map_dirty = true;
                drop(state);

                sh.be
                    .writev(e.lba() * SECTOR_SIZE as u64, &payload[offset..offset + bytes])
                    .wrap_err("failed to re-forward journal extent")?;

                state = sh.state.lock();
                offset += bytes;
                plba += sectors;
            }

            state.sup.next = next + len;
            if state.sup.next == state.sup.limit {
                state.sup.next = state.sup.base;
            }
            state.refresh_acked();
            dirty = true;
            debug!(page = next, len, "replayed journal record");
        }

        if dirty {
            self.write_checkpoint()?;
            info!("write cache replayed journal and checkpointed");
        }
        Ok(())
    }

    /// Queue a durable write of `data` at byte `offset`. The returned
    /// completion fires once the journal record is on SSD and the write has
    /// been forwarded to the translation layer. Blocks only on the write
    /// window.
    pub fn writev(&self, offset_bytes: u64, data: Vec<u8>) -> Result<Arc<Completion>> {
        let sh = &self.shared;
        ensure!(
            offset_bytes % SECTOR_SIZE as u64 == 0
                && !data.is_empty()
                && data.len() % SECTOR_SIZE == 0,
            EngineError::Format("write not sector-aligned".into())
        );
        if sh.halted.load(Ordering::Acquire) {
            bail!(EngineError::Io("write cache halted".into()));
        }
        let sectors = (data.len() / SECTOR_SIZE) as u64;
        self.get_room(sectors)?;

        let completion = Completion::new();
        let mut state = sh.state.lock();
        state.work.push(WriteJob {
            lba: offset_bytes / SECTOR_SIZE as u64,
            data,
            completion: Arc::clone(&completion),
        });
        if state.outstanding_writes == 0 || state.work.len() >= sh.write_batch {
            sh.work_cv.notify_one();
        }
        Ok(completion)
    }

    /// Reserve write-window room for `sectors`; blocks while the window is
    /// full.
    pub fn get_room(&self, sectors: u64) -> Result<()> {
        let sh = &self.shared;
        let pages = (sectors as u32).div_ceil(SECTORS_PER_PAGE as u32);
        ensure!(
            pages <= sh.max_write_pages,
            EngineError::Format(format!(
                "write of {pages} pages exceeds window of {}",
                sh.max_write_pages
            ))
        );
        let mut state = sh.state.lock();
        while state.total_write_pages + pages > sh.max_write_pages {
            if !sh.running.load(Ordering::Acquire) {
                bail!(EngineError::Cancelled);
            }
            sh.write_cv.wait(&mut state);
        }
        state.total_write_pages += pages;
        Ok(())
    }

    pub fn release_room(&self, sectors: u64) {
        let sh = &self.shared;
        let pages = (sectors as u32).div_ceil(SECTORS_PER_PAGE as u32);
        let mut state = sh.state.lock();
        state.total_write_pages = state.total_write_pages.saturating_sub(pages);
        if state.total_write_pages < sh.max_write_pages {
            sh.write_cv.notify_all();
        }
    }

    /// Block until every queued and in-flight write has completed.
    pub fn flush(&self) {
        let sh = &self.shared;
        let mut state = sh.state.lock();
        while state.total_write_pages > 0 && sh.running.load(Ordering::Acquire) {
            sh.write_cv.wait(&mut state);
        }
    }

    /// Resolve the front of `[offset, offset + bytes)` against the forward
    /// map: `skip` bytes are not cached here (serve them elsewhere), the
    /// next `read` bytes are produced by the returned request, and the
    /// caller slices off the remainder and asks again.
    pub fn async_read(&self, offset_bytes: u64, bytes: usize) -> (usize, usize, Option<ReadRequest>) {
        let sh = &self.shared;
        let base = offset_bytes / SECTOR_SIZE as u64;
        let limit = base + (bytes / SECTOR_SIZE) as u64;

        let state = sh.state.lock();
        let first = state.map.lookup(base).next();
        match first {
            None => (bytes, 0, None),
            Some(e) if e.base >= limit => (bytes, 0, None),
            Some(e) => {
                let e = e.clipped(base.max(e.base), limit);
                if e.base > base {
                    ((e.base - base) as usize * SECTOR_SIZE, 0, None)
                } else {
                    let read_len = e.len() as usize * SECTOR_SIZE;
                    let nvme_offset = e.value.0 * SECTOR_SIZE as u64;
                    drop(state);
                    let req = ReadRequest::new(Arc::clone(&sh.dev), nvme_offset, read_len);
                    (0, read_len, Some(req))
                }
            }
        }
    }

    /// Remove `[base, limit)` sector mappings, as for a discard.
    pub fn trim(&self, base: u64, limit: u64) {
        let mut state = self.shared.state.lock();
        let pieces: Vec<Extent<SectorPtr>> = state.map.overlapping(base, limit).collect();
        for p in pieces {
            state.rmap.trim(p.value.0, p.value.0 + p.len());
        }
        state.map.trim(base, limit);
        state.map_dirty = true;
    }

    /// Forward-map extents over `[base, limit)`, for diagnostics and tests.
    pub fn getmap(&self, base: u64, limit: u64) -> Vec<Extent<SectorPtr>> {
        self.shared.state.lock().map.overlapping(base, limit).collect()
    }

    /// Reverse-map extents over `[base, limit)` SSD sectors.
    pub fn get_reverse(&self, base: u64, limit: u64) -> Vec<Extent<LbaPtr>> {
        self.shared
            .state
            .lock()
            .rmap
            .overlapping(base, limit)
            .collect()
    }

    pub fn get_super(&self) -> SuperState {
        self.shared.state.lock().sup
    }

    pub fn page_state(&self, page: u32) -> PageState {
        let state = self.shared.state.lock();
        state.desc(page).state
    }

    /// Read the record header at `page`; returns the first page of the next
    /// record and, for DATA records, the extent list.
    pub fn get_oldest(&self, page: u32) -> Result<(u32, Vec<JournalExtent>)> {
        let sh = &self.shared;
        let mut buf = vec![0u8; PAGE_SIZE];
        sh.dev.read_at(&mut buf, page as u64 * PAGE_SIZE as u64)?;
        let hdr = JournalHeader::parse(&buf)?;
        ensure!(
            hdr.is_valid_magic(),
            EngineError::Format(format!("bad journal header at page {page}"))
        );
        let (limit, base) = {
            let state = sh.state.lock();
            (state.sup.limit, state.sup.base)
        };
        let mut next = page + hdr.len_pages.get();
        if next >= limit {
            next = base;
        }
        let extents = if hdr.rec_type.get() == J_DATA {
            decode_entries(&buf, hdr.extent_offset.get(), hdr.extent_len.get())?
        } else {
            Vec::new()
        };
        Ok((next, extents))
    }

    pub fn reset(&self) {
        let mut state = self.shared.state.lock();
        state.map.reset();
        state.rmap.reset();
    }

    /// Force a checkpoint if the map has changed since the last one.
    pub fn do_write_checkpoint(&self) -> Result<()> {
        if self.shared.state.lock().map_dirty {
            self.write_checkpoint()?;
        }
        Ok(())
    }

    fn write_checkpoint(&self) -> Result<()> {
        write_checkpoint(&self.shared)
    }
}

fn write_checkpoint(sh: &Arc<WcShared>) -> Result<()> {
    {
        let mut state = sh.state.lock();
        if state.ckpt_in_progress {
            return Ok(());
        }
        state.ckpt_in_progress = true;

        // Record boundaries for every durable HDR in the valid region.
        let mut lengths: Vec<LengthEntry> = Vec::new();
        for page in state.sup.base..state.sup.limit {
            let desc = state.desc(page);
            if desc.state == PageState::Hdr && state.in_valid_ring(page) {
                lengths.push(LengthEntry {
                    page: U32::new(page),
                    len: U32::new(desc.n_pages),
                });
            }
        }

        let entries: Vec<MapEntry> = state
            .map
            .iter()
            .map(|e| MapEntry::new(e.base, e.len(), e.value.0))
            .collect();

        let map_bytes = encode_entries(&entries);
        let len_bytes = encode_entries(&lengths);
        let map_pages = (map_bytes.len() as u32).div_ceil(PAGE_SIZE as u32);
        let len_pages = (len_bytes.len() as u32).div_ceil(PAGE_SIZE as u32);

        // Alternate halves of the metadata region.
        let half = (state.sup.meta_limit - state.sup.meta_base) / 2;
        let blockno = if state.sup.map_start == state.sup.meta_base {
            state.sup.meta_base + half
        } else {
            state.sup.meta_base
        };
        if map_pages + len_pages > half {
            state.ckpt_in_progress = false;
            bail!(EngineError::Format(format!(
                "checkpoint needs {} pages, metadata half holds {half}",
                map_pages + len_pages
            )));
        }

        state.sup.map_start = blockno;
        state.sup.map_blocks = map_pages;
        state.sup.map_entries = entries.len() as u32;
        state.sup.len_start = blockno + map_pages;
        state.sup.len_blocks = len_pages;
        state.sup.len_entries = lengths.len() as u32;

        let mut super_copy = state.sup;
        super_copy.next = state.next_acked_page;
        super_copy.seq = state.next_acked_seq;
        drop(state);

        let res = (|| -> Result<()> {
            let mut meta = Vec::with_capacity((map_pages + len_pages) as usize * PAGE_SIZE);
            meta.extend_from_slice(&map_bytes);
            meta.resize(map_pages as usize * PAGE_SIZE, 0);
            meta.extend_from_slice(&len_bytes);
            meta.resize((map_pages + len_pages) as usize * PAGE_SIZE, 0);
            if !meta.is_empty() {
                sh.dev
                    .write_at(&meta, blockno as u64 * PAGE_SIZE as u64)?;
            }

            let mut page = vec![0u8; PAGE_SIZE];
            let ondisk = super_copy.to_ondisk(sh.vol_uuid);
            page[..ondisk.as_bytes().len()].copy_from_slice(ondisk.as_bytes());
            sh.dev
                .write_at(&page, sh.super_page as u64 * PAGE_SIZE as u64)?;
            sh.dev.sync()
        })();

        let mut state = sh.state.lock();
        state.ckpt_in_progress = false;
        match res {
            Ok(()) => {
                state.map_dirty = false;
                debug!(
                    entries = super_copy.map_entries,
                    records = super_copy.len_entries,
                    "wrote write-cache checkpoint"
                );
                Ok(())
            }
            Err(e) => {
                sh.halted.store(true, Ordering::Release);
                error!(error = %e, "write-cache checkpoint failed, halting");
                Err(e)
            }
        }
    }
}

impl WriteCache {
    /// Stop the writer and checkpoint threads. Queued jobs are committed
    /// first; the journal itself is the persistent state, so no final
    /// checkpoint is taken.
    pub fn shutdown(&self) {
        let sh = &self.shared;
        if !sh.running.swap(false, Ordering::AcqRel) {
            return;
        }
        {
            let _state = sh.state.lock();
            sh.work_cv.notify_all();
            sh.write_cv.notify_all();
            sh.misc_cv.notify_all();
        }
        let mut handles = self.handles.lock();
        for h in handles.drain(..) {
            let _ = h.join();
        }
        info!("write cache stopped");
    }
}

/// Clear map entries whose journal records live in `[page, limit)` and
/// advance `oldest` past them. Called before those pages are overwritten.
fn evict(state: &mut WcState, page: u32, limit: u32) {
    let base = state.sup.base;

    let mut page = page;
    while page < limit && state.desc(page).state == PageState::None {
        page += 1;
    }
    if page == limit {
        return;
    }

    debug_assert_eq!(page, state.sup.oldest, "eviction must start at oldest");
    if state.desc(page).state == PageState::Pad {
        state.set_desc(page, PageDesc::NONE);
        state.sup.oldest = base;
        return;
    }

    debug_assert_eq!(state.desc(state.sup.oldest).state, PageState::Hdr);
    let mut oldest = state.sup.oldest;
    while oldest < limit {
        let len = state.desc(oldest).n_pages.max(1);
        let s_base = oldest as u64 * SECTORS_PER_PAGE as u64;
        let s_limit = s_base + len as u64 * SECTORS_PER_PAGE as u64;

        let covered: Vec<Extent<LbaPtr>> = state.rmap.overlapping(s_base, s_limit).collect();
        for c in covered {
            state.map.trim(c.value.0, c.value.0 + c.len());
        }
        state.rmap.trim(s_base, s_limit);

        for p in oldest..oldest + len {
            state.set_desc(p, PageDesc::NONE);
        }
        oldest += len;
    }

    debug_assert!(oldest <= state.sup.limit);
    if oldest == state.sup.limit {
        oldest = base;
    }
    state.sup.oldest = oldest;
    state.map_dirty = true;
}

/// Reserve `n` contiguous pages; returns `(page, pad, n_pad)` where `pad`
/// is the page of a PAD record covering the ring tail (0 if none). Evicts
/// whatever the reservation overwrites.
fn allocate(state: &mut WcState, n: u32) -> (u32, u32, u32) {
    let mut pad = 0;
    let mut n_pad = 0;
    if state.sup.limit - state.sup.next < n {
        pad = state.sup.next;
        n_pad = state.sup.limit - pad;
        evict(state, pad, state.sup.limit);
        state.sup.next = state.sup.base;
    }

    let val = state.sup.next;
    evict(state, val, val + n);
    state.sup.next += n;
    if state.sup.next == state.sup.limit {
        state.sup.next = state.sup.base;
    }
    (val, pad, n_pad)
}

fn build_header_page(
    vol_uuid: [u8; 16],
    rec_type: u32,
    seq: u64,
    len_pages: u32,
    extents: &[JournalExtent],
) -> Vec<u8> {
    let mut page = vec![0u8; PAGE_SIZE];
    let mut hdr = JournalHeader::new(vol_uuid, rec_type, seq, len_pages);
    if !extents.is_empty() {
        hdr.extent_offset = U32::new(JOURNAL_HEADER_SIZE as u32);
        hdr.extent_len = U32::new((extents.len() * 8) as u32);
    }
    page[..JOURNAL_HEADER_SIZE].copy_from_slice(hdr.as_bytes());
    let ext_bytes = encode_entries(extents);
    page[JOURNAL_HEADER_SIZE..JOURNAL_HEADER_SIZE + ext_bytes.len()].copy_from_slice(&ext_bytes);

    let crc = journal_page_crc(&page);
    let off = std::mem::offset_of!(JournalHeader, crc32);
    page[off..off + 4].copy_from_slice(&crc.to_le_bytes());
    page
}

/// One group commit: allocate, write PAD and record, sync, publish, forward.
fn send_writes(shared: &Arc<WcShared>, mut state: parking_lot::MutexGuard<'_, WcState>) {
    let jobs: Vec<WriteJob> = state.work.drain(..).collect();
    if jobs.is_empty() {
        return;
    }

    let sectors: u64 = jobs.iter().map(|j| (j.data.len() / SECTOR_SIZE) as u64).sum();
    let pages = (sectors as u32).div_ceil(SECTORS_PER_PAGE as u32);

    let (page, pad, n_pad) = allocate(&mut state, pages + 1);

    if pad != 0 {
        state.set_desc(
            pad,
            PageDesc {
                state: PageState::Pad,
                n_pages: n_pad,
            },
        );
        for p in pad + 1..state.sup.limit {
            state.set_desc(p, PageDesc::NONE);
        }
    }
    state.set_desc(
        page,
        PageDesc {
            state: PageState::Hdr,
            n_pages: pages + 1,
        },
    );
    for p in page + 1..page + 1 + pages {
        state.set_desc(
            p,
            PageDesc {
                state: PageState::Data,
                n_pages: 0,
            },
        );
    }

    let pad_seq = if pad != 0 {
        let s = state.sup.seq;
        state.sup.seq += 1;
        state.record_outstanding(pad, n_pad, s);
        Some(s)
    } else {
        None
    };
    let data_seq = state.sup.seq;
    state.sup.seq += 1;
    state.record_outstanding(page, pages + 1, data_seq);
    state.outstanding_writes += 1;

    let extents: Vec<JournalExtent> = jobs
        .iter()
        .map(|j| JournalExtent::new(j.lba, (j.data.len() / SECTOR_SIZE) as u64))
        .collect();
    drop(state);

    let io_result = (|| -> Result<()> {
        if let Some(ps) = pad_seq {
            let pad_page = build_header_page(shared.vol_uuid, J_PAD, ps, n_pad, &[]);
            shared
                .dev
                .write_at(&pad_page, pad as u64 * PAGE_SIZE as u64)?;
        }

        let hdr_page = build_header_page(shared.vol_uuid, J_DATA, data_seq, pages + 1, &extents);
        let tail_pad = vec![0u8; pages as usize * PAGE_SIZE - sectors as usize * SECTOR_SIZE];
        let mut iovs: SmallVec<[IoSlice; 10]> = SmallVec::with_capacity(jobs.len() + 2);
        iovs.push(IoSlice::new(&hdr_page));
        for j in &jobs {
            iovs.push(IoSlice::new(&j.data));
        }
        if !tail_pad.is_empty() {
            iovs.push(IoSlice::new(&tail_pad));
        }
        shared
            .dev
            .write_vectored_at(&iovs, page as u64 * PAGE_SIZE as u64)?;
        shared.dev.sync()
    })();

    let mut state = shared.state.lock();
    if let Err(e) = io_result {
        // Durability is broken; refuse further writes and fail the batch.
        shared.halted.store(true, Ordering::Release);
        error!(error = %e, "journal commit failed, halting write cache");
        if pad != 0 {
            state.notify_complete(pad, n_pad);
        }
        state.notify_complete(page, pages + 1);
        state.outstanding_writes -= 1;
        drop(state);
        for j in jobs {
            let sectors = (j.data.len() / SECTOR_SIZE) as u64;
            j.completion.fail(format!("journal commit failed: {e}"));
            release_room_inner(shared, sectors);
        }
        return;
    }

    let mut plba = (page + 1) as u64 * SECTORS_PER_PAGE as u64;
    let mut displaced = Vec::new();
    for j in &jobs {
        let sectors = (j.data.len() / SECTOR_SIZE) as u64;
        displaced.clear();
        state
            .map
            .update(j.lba, j.lba + sectors, SectorPtr(plba), Some(&mut displaced));
        for d in &displaced {
            let (pbase, plen) = (d.value.0, d.len());
            state.rmap.trim(pbase, pbase + plen);
        }
        state.rmap.update(plba, plba + sectors, LbaPtr(j.lba), None);
        state.map_dirty = true;
        plba += sectors;
    }
    state.outstanding_writes -= 1;
    if pad != 0 {
        state.notify_complete(pad, n_pad);
    }
    state.notify_complete(page, pages + 1);
    drop(state);

    // Forward to the translation layer and acknowledge, outside the lock.
    for j in jobs {
        let sectors = (j.data.len() / SECTOR_SIZE) as u64;
        if let Err(e) = shared.be.writev(j.lba * SECTOR_SIZE as u64, &j.data) {
            warn!(lba = j.lba, error = %e, "failed to forward write to translation layer");
        }
        j.completion.complete();
        release_room_inner(shared, sectors);
    }
}

fn release_room_inner(shared: &Arc<WcShared>, sectors: u64) {
    let pages = (sectors as u32).div_ceil(SECTORS_PER_PAGE as u32);
    let mut state = shared.state.lock();
    state.total_write_pages = state.total_write_pages.saturating_sub(pages);
    shared.write_cv.notify_all();
}

fn writer_thread(shared: &Arc<WcShared>) {
    let period = Duration::from_millis(WCACHE_FLUSH_PERIOD_MS);
    loop {
        let state = {
            let mut state = shared.state.lock();
            while state.work.is_empty() {
                if !shared.running.load(Ordering::Acquire) {
                    return;
                }
                shared.work_cv.wait_for(&mut state, period);
            }
            state
        };
        send_writes(shared, state);
    }
}

fn ckpt_thread(shared: &Arc<WcShared>) {
    let period = Duration::from_millis(WCACHE_CKPT_PERIOD_MS);
    let timeout = Duration::from_millis(WCACHE_CKPT_TIMEOUT_MS);
    let mut t0 = Instant::now();
    let (mut next0, ring) = {
        let state = shared.state.lock();
        (state.sup.next, state.sup.ring_pages())
    };
    let interval = ring / 4;

    loop {
        let do_ckpt = {
            let mut state = shared.state.lock();
            if !shared.running.load(Ordering::Acquire) {
                return;
            }
            shared.misc_cv.wait_for(&mut state, period);
            if !shared.running.load(Ordering::Acquire) {
                return;
            }
            let advanced = (state.sup.next + ring - next0) % ring;
            advanced > interval || (t0.elapsed() > timeout && state.map_dirty)
        };
        if do_ckpt {
            {
                let state = shared.state.lock();
                next0 = state.sup.next;
            }
            t0 = Instant::now();
            if let Err(e) = write_checkpoint(shared) {
                warn!(error = %e, "periodic write-cache checkpoint failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{FileBackend, ObjectBackend};
    use crate::cachedev::{self, FileDevice};
    use crate::translate::{format_volume, ObjMap, Translate};
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        cache_path: std::path::PathBuf,
        backend: Arc<FileBackend>,
        omap: Arc<ObjMap>,
        xlate: Translate,
        wcache: WriteCache,
        cfg: Config,
    }

    fn setup(cache_pages: usize) -> Fixture {
        let dir = TempDir::new().unwrap();
        let cfg = Config {
            cache_size: cache_pages * PAGE_SIZE,
            ..Config::default()
        };
        let backend = Arc::new(FileBackend::new(dir.path().join("objects"), "vol").unwrap());
        let uuid = *uuid::Uuid::new_v4().as_bytes();
        format_volume(backend.as_ref(), 1 << 30, uuid).unwrap();
        let omap = Arc::new(ObjMap::new());
        let (xlate, _) = Translate::open(
            Arc::clone(&backend) as Arc<dyn ObjectBackend>,
            Arc::clone(&omap),
            &cfg,
            false,
        )
        .unwrap();

        let cache_path = dir.path().join("cache");
        cachedev::format(&cache_path, cfg.cache_size, uuid).unwrap();
        let dev = Arc::new(FileDevice::open(&cache_path).unwrap());
        let wcache =
            WriteCache::open(dev as Arc<dyn CacheDevice>, 1, xlate.clone(), &cfg).unwrap();

        Fixture {
            _dir: dir,
            cache_path,
            backend,
            omap,
            xlate,
            wcache,
            cfg,
        }
    }

    fn patterned(len: usize, seed: u8) -> Vec<u8> {
        (0..len).map(|i| seed.wrapping_add(i as u8)).collect()
    }

    /// Read through the write cache, falling through to the translation
    /// layer for skipped ranges, the way the volume read path does.
    fn read_through(wc: &WriteCache, xlate: &Translate, offset: u64, len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; len];
        let mut off = 0usize;
        while off < len {
            let (skip, read, req) = wc.async_read(offset + off as u64, len - off);
            if skip > 0 {
                xlate
                    .readv(offset + off as u64, &mut buf[off..off + skip])
                    .unwrap();
                off += skip;
            }
            if let Some(r) = req {
                r.run(&mut buf[off..off + read]).unwrap();
                off += read;
            }
        }
        buf
    }

    #[test]
    fn test_write_durable_then_read_back() {
        let fx = setup(256);
        let data = patterned(4096, 0xA5);

        let c = fx.wcache.writev(0, data.clone()).unwrap();
        c.wait().unwrap();

        // Served from the SSD journal via async_read.
        let (skip, read, req) = fx.wcache.async_read(0, 4096);
        assert_eq!((skip, read), (0, 4096));
        let mut out = vec![0u8; 4096];
        req.unwrap().run(&mut out).unwrap();
        assert_eq!(out, data);

        // Also forwarded to the translation layer.
        let mut out = vec![0u8; 4096];
        fx.xlate.readv(0, &mut out).unwrap();
        assert_eq!(out, data);

        fx.wcache.flush();
        fx.wcache.shutdown();
        fx.xlate.shutdown();
    }

    #[test]
    fn test_async_read_skip_and_slice() {
        let fx = setup(256);
        let data = patterned(4096, 0x21);
        fx.wcache.writev(4096, data.clone()).unwrap().wait().unwrap();

        // Nothing mapped at 0: the gap up to the hit is a skip.
        let (skip, read, req) = fx.wcache.async_read(0, 3 * 4096);
        assert_eq!((skip, read), (4096, 0));
        assert!(req.is_none());

        // The hit itself.
        let (skip, read, req) = fx.wcache.async_read(4096, 2 * 4096);
        assert_eq!((skip, read), (0, 4096));
        let mut out = vec![0u8; 4096];
        req.unwrap().run(&mut out).unwrap();
        assert_eq!(out, data);

        // Tail past the hit: all skip.
        let (skip, read, req) = fx.wcache.async_read(2 * 4096, 4096);
        assert_eq!((skip, read), (4096, 0));
        assert!(req.is_none());

        fx.wcache.shutdown();
        fx.xlate.shutdown();
    }

    #[test]
    fn test_forward_reverse_maps_stay_inverse() {
        let fx = setup(256);
        for (lba, seed) in [(0u64, 1u8), (64, 2), (32, 3), (0, 4)] {
            fx.wcache
                .writev(lba * SECTOR_SIZE as u64, patterned(8192, seed))
                .unwrap()
                .wait()
                .unwrap();
        }

        let fwd = fx.wcache.getmap(0, 1 << 20);
        assert!(!fwd.is_empty());
        for e in &fwd {
            let rev = fx.wcache.get_reverse(e.value.0, e.value.0 + e.len());
            assert_eq!(rev.len(), 1, "reverse entry missing for {e:?}");
            assert_eq!(rev[0].value.0, e.base);
            assert_eq!(rev[0].len(), e.len());
        }

        // No reverse entry without a forward entry: total coverage matches.
        let fwd_total: u64 = fwd.iter().map(|e| e.len()).sum();
        let ring_sectors = {
            let sup = fx.wcache.get_super();
            (sup.base as u64 * SECTORS_PER_PAGE as u64, sup.limit as u64 * SECTORS_PER_PAGE as u64)
        };
        let rev_total: u64 = fx
            .wcache
            .get_reverse(ring_sectors.0, ring_sectors.1)
            .iter()
            .map(|e| e.len())
            .sum();
        assert_eq!(fwd_total, rev_total);

        fx.wcache.shutdown();
        fx.xlate.shutdown();
    }

    #[test]
    fn test_group_commit_many_writers() {
        let fx = setup(256);
        let mut completions = Vec::new();
        for i in 0..16u64 {
            let c = fx
                .wcache
                .writev(i * 4096, patterned(4096, i as u8))
                .unwrap();
            completions.push(c);
        }
        for c in completions {
            c.wait().unwrap();
        }
        for i in 0..16u64 {
            let out = read_through(&fx.wcache, &fx.xlate, i * 4096, 4096);
            assert_eq!(out, patterned(4096, i as u8), "write {i}");
        }
        fx.wcache.shutdown();
        fx.xlate.shutdown();
    }

    #[test]
    fn test_replay_after_crash_restores_writes() {
        let fx = setup(256);
        let data = patterned(4096, 0xA5);
        fx.wcache.writev(0, data.clone()).unwrap().wait().unwrap();

        // Crash: stop threads without checkpointing; the batch never left
        // the translation layer's memory.
        fx.wcache.shutdown();
        fx.xlate.shutdown();

        // Restart both layers from disk. Journal replay re-forwards the
        // write into the fresh translation layer.
        let omap2 = Arc::new(ObjMap::new());
        let (xlate2, _) = Translate::open(
            Arc::clone(&fx.backend) as Arc<dyn ObjectBackend>,
            Arc::clone(&omap2),
            &fx.cfg,
            false,
        )
        .unwrap();
        let dev = Arc::new(FileDevice::open(&fx.cache_path).unwrap());
        let wcache2 =
            WriteCache::open(dev as Arc<dyn CacheDevice>, 1, xlate2.clone(), &fx.cfg).unwrap();

        let out = read_through(&wcache2, &xlate2, 0, 4096);
        assert_eq!(out, data);
        let mut out = vec![0u8; 4096];
        xlate2.readv(0, &mut out).unwrap();
        assert_eq!(out, data);

        // Replay checkpointed; a further restart replays nothing but sees
        // the same maps.
        let map_before = wcache2.getmap(0, 1 << 20);
        wcache2.shutdown();
        xlate2.shutdown();

        let omap3 = Arc::new(ObjMap::new());
        let (xlate3, _) = Translate::open(
            Arc::clone(&fx.backend) as Arc<dyn ObjectBackend>,
            omap3,
            &fx.cfg,
            false,
        )
        .unwrap();
        let dev = Arc::new(FileDevice::open(&fx.cache_path).unwrap());
        let wcache3 =
            WriteCache::open(dev as Arc<dyn CacheDevice>, 1, xlate3.clone(), &fx.cfg).unwrap();
        assert_eq!(wcache3.getmap(0, 1 << 20), map_before);
        wcache3.shutdown();
        xlate3.shutdown();
    }

    #[test]
    fn test_ring_wrap_pad_and_eviction() {
        // 64-page cache: journal ring is 28 pages; an 8 KiB write makes a
        // 3-page record, so the tenth record forces a PAD and eviction.
        let fx = setup(64);
        let sup0 = fx.wcache.get_super();
        let ring = sup0.ring_pages();
        assert_eq!(ring, 28);

        let writes = 16u64;
        for i in 0..writes {
            fx.wcache
                .writev(i * 16 * SECTOR_SIZE as u64, patterned(8192, i as u8))
                .unwrap()
                .wait()
                .unwrap();
        }

        // The first record's extents were evicted from the forward map.
        assert!(
            fx.wcache.getmap(0, 16).is_empty(),
            "evicted extents still mapped"
        );

        let sup = fx.wcache.get_super();
        assert!(sup.oldest >= sup.base && sup.oldest < sup.limit);
        assert!(sup.next >= sup.base && sup.next < sup.limit);

        // Reads of evicted ranges fall through to the translation layer.
        let out = read_through(&fx.wcache, &fx.xlate, 0, 8192);
        assert_eq!(out, patterned(8192, 0));

        // Recent writes still hit the journal.
        let last = writes - 1;
        let out = read_through(&fx.wcache, &fx.xlate, last * 16 * SECTOR_SIZE as u64, 8192);
        assert_eq!(out, patterned(8192, last as u8));

        fx.wcache.shutdown();
        fx.xlate.shutdown();
    }

    #[test]
    fn test_checkpoint_alternates_and_recovers() {
        let fx = setup(256);
        fx.wcache
            .writev(0, patterned(8192, 5))
            .unwrap()
            .wait()
            .unwrap();
        fx.wcache.do_write_checkpoint().unwrap();
        let sup1 = fx.wcache.get_super();
        assert!(sup1.map_entries > 0);
        assert!(sup1.len_entries > 0);

        fx.wcache
            .writev(64 * SECTOR_SIZE as u64, patterned(4096, 6))
            .unwrap()
            .wait()
            .unwrap();
        fx.wcache.do_write_checkpoint().unwrap();
        let sup2 = fx.wcache.get_super();
        assert_ne!(
            sup1.map_start, sup2.map_start,
            "checkpoint must alternate metadata halves"
        );

        let map_before = fx.wcache.getmap(0, 1 << 20);
        fx.wcache.shutdown();
        fx.xlate.shutdown();

        // Recover purely from the checkpoint; nothing to replay.
        let omap2 = Arc::new(ObjMap::new());
        let (xlate2, _) = Translate::open(
            Arc::clone(&fx.backend) as Arc<dyn ObjectBackend>,
            omap2,
            &fx.cfg,
            false,
        )
        .unwrap();
        let dev = Arc::new(FileDevice::open(&fx.cache_path).unwrap());
        let wcache2 =
            WriteCache::open(dev as Arc<dyn CacheDevice>, 1, xlate2.clone(), &fx.cfg).unwrap();
        assert_eq!(wcache2.getmap(0, 1 << 20), map_before);
        assert_eq!(wcache2.get_super().seq, sup2.seq);
        wcache2.shutdown();
        xlate2.shutdown();
    }

    #[test]
    fn test_trim_clears_both_maps() {
        let fx = setup(256);
        fx.wcache
            .writev(0, patterned(8192, 9))
            .unwrap()
            .wait()
            .unwrap();
        assert!(!fx.wcache.getmap(0, 16).is_empty());

        let fwd = fx.wcache.getmap(0, 16);
        fx.wcache.trim(0, 16);
        assert!(fx.wcache.getmap(0, 16).is_empty());
        for e in fwd {
            assert!(
                fx.wcache
                    .get_reverse(e.value.0, e.value.0 + e.len())
                    .is_empty()
            );
        }
        fx.wcache.shutdown();
        fx.xlate.shutdown();
    }

    #[test]
    fn test_flush_waits_for_drain() {
        let fx = setup(256);
        let mut cs = Vec::new();
        for i in 0..8u64 {
            cs.push(fx.wcache.writev(i * 4096, patterned(4096, 0x40 + i as u8)).unwrap());
        }
        fx.wcache.flush();
        for c in cs {
            assert!(c.is_complete());
        }
        fx.wcache.shutdown();
        fx.xlate.shutdown();
    }

    #[test]
    fn test_page_descriptor_states() {
        let fx = setup(256);
        fx.wcache
            .writev(0, patterned(4096, 1))
            .unwrap()
            .wait()
            .unwrap();
        let sup = fx.wcache.get_super();
        assert_eq!(fx.wcache.page_state(sup.base), PageState::Hdr);
        assert_eq!(fx.wcache.page_state(sup.base + 1), PageState::Data);
        assert_eq!(fx.wcache.page_state(sup.next), PageState::None);

        let (next, extents) = fx.wcache.get_oldest(sup.base).unwrap();
        assert_eq!(next, sup.base + 2);
        assert_eq!(extents.len(), 1);
        assert_eq!(extents[0].lba(), 0);
        assert_eq!(extents[0].sectors(), 8);

        fx.wcache.shutdown();
        fx.xlate.shutdown();
    }

    #[test]
    fn test_fixture_unused_fields() {
        // Keep the fixture exhaustive for the tests that need it.
        let fx = setup(64);
        assert!(fx.omap.read().is_empty());
        fx.wcache.shutdown();
        fx.xlate.shutdown();
    }
}
