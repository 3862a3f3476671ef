//! # Read Cache
//!
//! Fixed-slot cache of aligned 64 KiB chunks of backend objects, kept on
//! the shared SSD cache device. Slots are keyed by `(object, chunk-index)`
//! rather than by LBA, so an object's chunk is admitted once no matter how many
//! LBA ranges map into it.
//!
//! ## Validity Masks
//!
//! Each slot carries a 16-bit mask, one bit per 4 KiB page of the chunk. A
//! read is a hit only when every page it touches is set; otherwise the
//! whole chunk is fetched from the backend, the needed sub-range copied
//! out, and the chunk admitted (overwriting whatever partial mask was
//! there).
//!
//! ## Admission & Eviction
//!
//! `add` admits into a free slot, or refreshes an existing mapping. With no
//! free slot the add is dropped; eviction happens only in the background
//! thread, which wakes every couple of seconds, random-evicts down to a
//! quarter-free when free slots run low, and flushes the slot table and
//! masks to SSD after evicting or at least every fifteen seconds while
//! dirty.
//!
//! ## Concurrency
//!
//! One mutex covers the slot table, masks, free list, and hash index. A
//! per-slot busy flag with a condvar serializes admits to the same slot;
//! the lock is dropped around device and backend I/O.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use eyre::{ensure, Result, WrapErr};
use hashbrown::HashMap;
use parking_lot::{Condvar, Mutex};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, info, warn};
use zerocopy::little_endian::U32;

use crate::backend::{ObjectBackend, ObjectId};
use crate::cachedev::CacheDevice;
use crate::config::{
    PAGE_SIZE, RCACHE_EVICT_PERIOD_MS, RCACHE_FLUSH_TIMEOUT_MS, SECTORS_PER_PAGE, SECTOR_SIZE,
};
use crate::error::{is_not_found, EngineError};
use crate::extmap::{Extent, ObjOffset};
use crate::ondisk::{decode_entries, encode_entries, FlatMapEntry, ReadSuper};
use crate::translate::{ObjMap, Translate};

/// Identifies one cached chunk: object sequence and chunk index within it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChunkKey {
    pub obj: u32,
    pub chunk: u32,
}

impl ChunkKey {
    const EMPTY: ChunkKey = ChunkKey { obj: 0, chunk: 0 };

    fn is_empty(&self) -> bool {
        *self == Self::EMPTY
    }
}

/// Geometry lifted from the read superblock.
#[derive(Debug, Clone, Copy)]
struct RcGeometry {
    unit_sectors: u64,
    base: u32,
    units: usize,
    map_start: u32,
    map_blocks: u32,
    bitmap_start: u32,
    bitmap_blocks: u32,
}

struct RcState {
    map: HashMap<ChunkKey, usize>,
    flat_map: Vec<ChunkKey>,
    bitmap: Vec<u16>,
    free_blks: Vec<usize>,
    busy: Vec<bool>,
    map_dirty: bool,
    rng: StdRng,
}

struct RcShared {
    dev: Arc<dyn CacheDevice>,
    backend: Arc<dyn ObjectBackend>,
    omap: Arc<ObjMap>,
    be: Translate,
    geo: RcGeometry,
    running: AtomicBool,
    state: Mutex<RcState>,
    busy_cv: Condvar,
    misc_cv: Condvar,
}

/// The read cache. Cheap to clone.
#[derive(Clone)]
pub struct ReadCache {
    shared: Arc<RcShared>,
    handles: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

/// Mask of the 4 KiB pages touched by `[base, limit)` within the chunk
/// containing `base`. All arguments in sectors; `limit` is clamped to the
/// chunk boundary.
fn page_mask(base: u64, limit: u64, unit: u64) -> u16 {
    let top = (base + 1).div_ceil(unit) * unit;
    let limit = limit.min(top);
    let base_page = base / SECTORS_PER_PAGE as u64;
    let limit_page = limit.div_ceil(SECTORS_PER_PAGE as u64);
    let unit_pages = unit / SECTORS_PER_PAGE as u64;

    let mut val = 0u16;
    let mut bit = base_page % unit_pages;
    for _ in base_page..limit_page {
        val |= 1 << bit;
        bit += 1;
    }
    val
}

impl ReadCache {
    /// Load the slot table and masks from the cache device and start the
    /// eviction thread.
    pub fn open(
        dev: Arc<dyn CacheDevice>,
        super_page: u32,
        backend: Arc<dyn ObjectBackend>,
        omap: Arc<ObjMap>,
        be: Translate,
        background: bool,
    ) -> Result<Self> {
        let mut page = vec![0u8; PAGE_SIZE];
        dev.read_at(&mut page, super_page as u64 * PAGE_SIZE as u64)
            .wrap_err("failed to read read-cache superblock")?;
        let sup = ReadSuper::parse(&page)?;
        let geo = RcGeometry {
            unit_sectors: sup.unit_sectors.get() as u64,
            base: sup.base.get(),
            units: sup.units.get() as usize,
            map_start: sup.map_start.get(),
            map_blocks: sup.map_blocks.get(),
            bitmap_start: sup.bitmap_start.get(),
            bitmap_blocks: sup.bitmap_blocks.get(),
        };
        ensure!(
            geo.unit_sectors % SECTORS_PER_PAGE as u64 == 0 && geo.unit_sectors <= 128,
            EngineError::Format(format!("unsupported chunk size {}", geo.unit_sectors))
        );

        let mut buf = vec![0u8; geo.map_blocks as usize * PAGE_SIZE];
        dev.read_at(&mut buf, geo.map_start as u64 * PAGE_SIZE as u64)?;
        let flat_entries: Vec<FlatMapEntry> = decode_entries(&buf, 0, (geo.units * 8) as u32)?;

        let mut buf = vec![0u8; geo.bitmap_blocks as usize * PAGE_SIZE];
        dev.read_at(&mut buf, geo.bitmap_start as u64 * PAGE_SIZE as u64)?;
        let mut bitmap: Vec<u16> = buf[..geo.units * 2]
            .chunks_exact(2)
            .map(|c| u16::from_le_bytes([c[0], c[1]]))
            .collect();

        let mut map = HashMap::new();
        let mut flat_map = Vec::with_capacity(geo.units);
        let mut free_blks = Vec::new();
        for (i, fe) in flat_entries.iter().enumerate() {
            let key = ChunkKey {
                obj: fe.obj.get(),
                chunk: fe.chunk.get(),
            };
            if key.is_empty() {
                free_blks.push(i);
                bitmap[i] = 0;
            } else {
                map.insert(key, i);
            }
            flat_map.push(key);
        }

        let shared = Arc::new(RcShared {
            dev,
            backend,
            omap,
            be,
            geo,
            running: AtomicBool::new(true),
            state: Mutex::new(RcState {
                map,
                flat_map,
                bitmap,
                free_blks,
                busy: vec![false; geo.units],
                map_dirty: false,
                rng: StdRng::seed_from_u64(17),
            }),
            busy_cv: Condvar::new(),
            misc_cv: Condvar::new(),
        });

        let this = Self {
            shared,
            handles: Arc::new(Mutex::new(Vec::new())),
        };
        if background {
            let shared = Arc::clone(&this.shared);
            this.handles.lock().push(
                std::thread::Builder::new()
                    .name("rcache-evict".into())
                    .spawn(move || evict_thread(&shared))
                    .wrap_err("failed to spawn read-cache eviction thread")?,
            );
        }
        info!(
            units = this.shared.geo.units,
            cached = this.shared.state.lock().map.len(),
            "read cache opened"
        );
        Ok(this)
    }

    /// Admit `sectors` of object data starting at `oo` (page-aligned,
    /// whole pages). Chunks without a free slot are dropped silently.
    pub fn add(&self, mut oo: ObjOffset, mut sectors: u64, buf: &[u8]) -> Result<()> {
        let sh = &self.shared;
        let unit = sh.geo.unit_sectors;
        ensure!(
            oo.obj != 0 && oo.offset % SECTORS_PER_PAGE as u64 == 0,
            EngineError::Format("read-cache add must be page-aligned into a real object".into())
        );
        // Whole pages only; a trailing partial page cannot be marked valid.
        sectors -= sectors % SECTORS_PER_PAGE as u64;
        let mut buf_off = 0usize;

        while sectors > 0 {
            let chunk = (oo.offset / unit) as u32;
            let key = ChunkKey { obj: oo.obj, chunk };

            let mut state = sh.state.lock();
            let slot = match state.map.get(&key) {
                Some(&s) => s,
                None => match state.free_blks.pop() {
                    Some(s) => s,
                    None => {
                        debug!(?key, "no free read-cache slot, dropping admit");
                        return Ok(());
                    }
                },
            };
            while state.busy[slot] {
                sh.busy_cv.wait(&mut state);
            }
            state.busy[slot] = true;
            let mut mask = state.bitmap[slot];
            drop(state);

            let pages_per_unit = unit / SECTORS_PER_PAGE as u64;
            let first_page = (oo.offset / SECTORS_PER_PAGE as u64) % pages_per_unit;
            let avail_pages = pages_per_unit - first_page;
            let want_pages = sectors / SECTORS_PER_PAGE as u64;
            let n_pages = avail_pages.min(want_pages);

            for i in 0..n_pages {
                mask |= 1 << (first_page + i);
            }

            let slot_page = sh.geo.base as u64 + slot as u64 * pages_per_unit + first_page;
            let bytes = n_pages as usize * PAGE_SIZE;
            let res = sh
                .dev
                .write_at(&buf[buf_off..buf_off + bytes], slot_page * PAGE_SIZE as u64);

            let mut state = sh.state.lock();
            state.busy[slot] = false;
            sh.busy_cv.notify_all();
            match res {
                Ok(()) => {
                    state.map.insert(key, slot);
                    state.bitmap[slot] = mask;
                    state.flat_map[slot] = key;
                    state.map_dirty = true;
                }
                Err(e) => {
                    // Slot contents unknown; give the slot back empty.
                    state.map.remove(&key);
                    state.bitmap[slot] = 0;
                    state.flat_map[slot] = ChunkKey::EMPTY;
                    if !state.free_blks.contains(&slot) {
                        state.free_blks.push(slot);
                    }
                    drop(state);
                    warn!(error = %e, "read-cache slot write failed");
                    return Err(e);
                }
            }
            drop(state);

            buf_off += bytes;
            sectors -= n_pages * SECTORS_PER_PAGE as u64;
            oo.offset += n_pages * SECTORS_PER_PAGE as u64;
        }
        Ok(())
    }

    /// Resolve `[offset, offset + buf.len())` through the object map and
    /// serve it: chunk hits from SSD, misses by fetching the whole chunk
    /// from the backend (admitting it afterwards), unmapped ranges as
    /// zeros. Objects still in translation memory fall through to the
    /// translation layer.
    pub fn read(&self, offset_bytes: u64, buf: &mut [u8]) -> Result<()> {
        let sh = &self.shared;
        let unit = sh.geo.unit_sectors;
        ensure!(
            offset_bytes % SECTOR_SIZE as u64 == 0 && buf.len() % SECTOR_SIZE == 0,
            EngineError::Format("read not sector-aligned".into())
        );
        let lba = offset_bytes / SECTOR_SIZE as u64;
        let sectors = (buf.len() / SECTOR_SIZE) as u64;

        let extents: Vec<Extent<ObjOffset>> = {
            let map = sh.omap.read();
            map.overlapping(lba, lba + sectors).collect()
        };

        // Admissions deferred until the read is done.
        let mut to_add: Vec<(ObjOffset, u64, Vec<u8>)> = Vec::new();

        let mut pos = lba;
        let mut buf_off = 0usize;
        for ext in &extents {
            if ext.base > pos {
                let gap = ((ext.base - pos) * SECTOR_SIZE as u64) as usize;
                buf[buf_off..buf_off + gap].fill(0);
                buf_off += gap;
                pos = ext.base;
            }

            let mut remaining = ext.len();
            let mut ptr = ext.value;
            while remaining > 0 {
                let chunk = (ptr.offset / unit) as u32;
                let blk_offset = ptr.offset % unit;
                let span = remaining.min(unit - blk_offset);
                let bytes = (span * SECTOR_SIZE as u64) as usize;
                let key = ChunkKey { obj: ptr.obj, chunk };

                let hit_slot = {
                    let state = sh.state.lock();
                    match state.map.get(&key) {
                        Some(&slot) => {
                            let access = page_mask(blk_offset, blk_offset + span, unit);
                            if (access & state.bitmap[slot]) == access {
                                Some(slot)
                            } else {
                                None
                            }
                        }
                        None => None,
                    }
                };

                match hit_slot {
                    Some(slot) => {
                        let pages_per_unit = unit / SECTORS_PER_PAGE as u64;
                        let slot_sector = (sh.geo.base as u64 + slot as u64 * pages_per_unit)
                            * SECTORS_PER_PAGE as u64
                            + blk_offset;
                        sh.dev.read_at(
                            &mut buf[buf_off..buf_off + bytes],
                            slot_sector * SECTOR_SIZE as u64,
                        )?;
                    }
                    None => {
                        let chunk_base = chunk as u64 * unit;
                        let mut chunk_buf = vec![0u8; (unit * SECTOR_SIZE as u64) as usize];
                        match sh.backend.read_object(
                            ObjectId::Seq(ptr.obj),
                            &mut chunk_buf,
                            chunk_base * SECTOR_SIZE as u64,
                        ) {
                            Ok(got) => {
                                let start = (blk_offset * SECTOR_SIZE as u64) as usize;
                                let finish = start + bytes;
                                let have = got.min(finish);
                                let copied = have.saturating_sub(start);
                                if copied > 0 {
                                    buf[buf_off..buf_off + copied]
                                        .copy_from_slice(&chunk_buf[start..start + copied]);
                                }
                                buf[buf_off + copied..buf_off + bytes].fill(0);
                                let admit_sectors = (got / SECTOR_SIZE) as u64;
                                if admit_sectors >= SECTORS_PER_PAGE as u64 {
                                    to_add.push((
                                        ObjOffset {
                                            obj: ptr.obj,
                                            offset: chunk_base,
                                        },
                                        admit_sectors,
                                        chunk_buf,
                                    ));
                                }
                            }
                            Err(e) if is_not_found(&e) => {
                                // Object not on the backend yet: the data is
                                // still in a translation-layer batch.
                                sh.be
                                    .readv(pos * SECTOR_SIZE as u64, &mut buf[buf_off..buf_off + bytes])?;
                            }
                            Err(e) => {
                                warn!(obj = ptr.obj, error = %e, "backend chunk read failed, zero-filling");
                                buf[buf_off..buf_off + bytes].fill(0);
                            }
                        }
                    }
                }

                ptr.offset += span;
                pos += span;
                buf_off += bytes;
                remaining -= span;
            }
        }

        if buf_off < buf.len() {
            buf[buf_off..].fill(0);
        }

        for (oo, sectors, chunk_buf) in to_add {
            self.add(oo, sectors, &chunk_buf)?;
        }
        Ok(())
    }

    /// True if the chunk is currently admitted.
    pub fn chunk_cached(&self, key: ChunkKey) -> bool {
        self.shared.state.lock().map.contains_key(&key)
    }

    pub fn cached_chunks(&self) -> usize {
        self.shared.state.lock().map.len()
    }

    pub fn free_slots(&self) -> usize {
        self.shared.state.lock().free_blks.len()
    }

    pub fn mask_for(&self, key: ChunkKey) -> Option<u16> {
        let state = self.shared.state.lock();
        state.map.get(&key).map(|&slot| state.bitmap[slot])
    }

    /// Evict up to `n` randomly chosen slots.
    pub fn do_evict(&self, n: usize) {
        let mut state = self.shared.state.lock();
        evict(&mut state, self.shared.geo.units, n);
    }

    /// Write the slot table and validity masks to the cache device.
    pub fn flush_metadata(&self) -> Result<()> {
        flush_metadata(&self.shared)
    }

    /// Stop the eviction thread, flushing metadata if dirty.
    pub fn shutdown(&self) {
        let sh = &self.shared;
        if !sh.running.swap(false, Ordering::AcqRel) {
            return;
        }
        {
            let _state = sh.state.lock();
            sh.misc_cv.notify_all();
            sh.busy_cv.notify_all();
        }
        let mut handles = self.handles.lock();
        for h in handles.drain(..) {
            let _ = h.join();
        }
        if self.shared.state.lock().map_dirty {
            if let Err(e) = self.flush_metadata() {
                warn!(error = %e, "failed to flush read-cache metadata on shutdown");
            }
        }
        info!("read cache stopped");
    }
}

fn flush_metadata(sh: &Arc<RcShared>) -> Result<()> {
    let (flat, bitmap) = {
        let mut state = sh.state.lock();
        state.map_dirty = false;
        (state.flat_map.clone(), state.bitmap.clone())
    };

    let entries: Vec<FlatMapEntry> = flat
        .iter()
        .map(|k| FlatMapEntry {
            obj: U32::new(k.obj),
            chunk: U32::new(k.chunk),
        })
        .collect();
    let mut map_bytes = encode_entries(&entries);
    map_bytes.resize(sh.geo.map_blocks as usize * PAGE_SIZE, 0);
    sh.dev
        .write_at(&map_bytes, sh.geo.map_start as u64 * PAGE_SIZE as u64)?;

    let mut bm_bytes = Vec::with_capacity(bitmap.len() * 2);
    for m in &bitmap {
        bm_bytes.extend_from_slice(&m.to_le_bytes());
    }
    bm_bytes.resize(sh.geo.bitmap_blocks as usize * PAGE_SIZE, 0);
    sh.dev
        .write_at(&bm_bytes, sh.geo.bitmap_start as u64 * PAGE_SIZE as u64)?;
    sh.dev.sync()
}

fn evict(state: &mut RcState, units: usize, n: usize) {
    for _ in 0..n {
        let j = state.rng.gen_range(0..units);
        if state.busy[j] {
            continue;
        }
        state.bitmap[j] = 0;
        let key = state.flat_map[j];
        if !key.is_empty() {
            state.map.remove(&key);
            state.flat_map[j] = ChunkKey::EMPTY;
            state.free_blks.push(j);
            state.map_dirty = true;
        }
    }
}

fn evict_thread(shared: &Arc<RcShared>) {
    let period = Duration::from_millis(RCACHE_EVICT_PERIOD_MS);
    let flush_timeout = Duration::from_millis(RCACHE_FLUSH_TIMEOUT_MS);
    let units = shared.geo.units;
    let mut t0 = Instant::now();

    loop {
        let evicted = {
            let mut state = shared.state.lock();
            if !shared.running.load(Ordering::Acquire) {
                return;
            }
            shared.misc_cv.wait_for(&mut state, period);
            if !shared.running.load(Ordering::Acquire) {
                return;
            }
            if !state.map_dirty {
                continue;
            }
            let n = if state.free_blks.len() < units / 16 {
                units / 4 - state.free_blks.len()
            } else {
                0
            };
            if n > 0 {
                evict(&mut state, units, n);
            }
            n
        };

        if evicted > 0 || t0.elapsed() > flush_timeout {
            t0 = Instant::now();
            if let Err(e) = flush_metadata(shared) {
                warn!(error = %e, "failed to flush read-cache metadata");
            }
        }
    }
}
