//! # Translation Layer
//!
//! Batches incoming writes into immutable DATA objects, owns the
//! authoritative LBA → (object, offset) map, writes checkpoint objects, and
//! serves reads that miss the caches.
//!
//! ## Write Path
//!
//! `writev` copies payload into the current batch and publishes the mapping
//! immediately, pointing at the in-memory batch. When a batch fills (or
//! `flush` / the flush timer seals it), it is queued for the writer pool.
//! A worker builds the object header, writes the object to the backend in
//! one gather write, then republishes the batch's map entries with
//! object-relative offsets. Only ranges still pointing at the batch are
//! republished, so a newer batch that overwrote part of this one in the
//! meantime is never clobbered by a slower worker.
//!
//! ## Object Accounting
//!
//! `object_info` tracks `{hdr, data, live}` sectors per object from the
//! moment a batch is created. Displaced map extents decrement the displaced
//! object's live count; an object at zero live sectors is dead weight the
//! deferred-delete list may eventually reclaim (no code path drives deletion
//! today).
//!
//! ## Recovery
//!
//! `open` reads the super object, replays the checkpoint list into
//! `object_info` and the map, then rolls forward through DATA objects past
//! the last checkpoint until a read fails. The next object sequence number
//! is one past everything seen.
//!
//! ## Locking
//!
//! One mutex covers batches, the work queue, and `object_info`; the object
//! map has its own reader-writer lock. Lock order is state mutex before map
//! lock; neither is held across backend I/O.

pub mod batch;

use std::collections::VecDeque;
use std::io::IoSlice;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use eyre::{bail, ensure, Result, WrapErr};
use hashbrown::HashMap;
use parking_lot::{Condvar, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use smallvec::SmallVec;
use tracing::{debug, error, info, warn};
use zerocopy::little_endian::U32;
use zerocopy::IntoBytes;

use crate::backend::{ObjectBackend, ObjectId};
use crate::config::{
    Config, SECTOR_SIZE, XLATE_CKPT_INTERVAL, XLATE_FLUSH_PERIOD_MS, XLATE_FLUSH_TIMEOUT_MS,
};
use crate::error::EngineError;
use crate::extmap::{Extent, ExtentMap, ObjOffset};
use crate::ondisk::{
    decode_entries, encode_entries, CkptHeader, CkptMapEntry, CkptObjEntry, DataHeader,
    DataMapEntry, ObjHeader, SuperHeader, CKPT_HEADER_SIZE, DATA_HEADER_SIZE, OBJ_CKPT, OBJ_DATA,
    OBJ_HEADER_SIZE, OBJ_SUPER, SUPER_HEADER_SIZE,
};

use batch::Batch;

/// The object map and its lock, shared with the read cache.
#[derive(Debug, Default)]
pub struct ObjMap {
    map: RwLock<ExtentMap<ObjOffset>>,
}

impl ObjMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn read(&self) -> RwLockReadGuard<'_, ExtentMap<ObjOffset>> {
        self.map.read()
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, ExtentMap<ObjOffset>> {
        self.map.write()
    }
}

/// Per-object accounting, all sizes in sectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjInfo {
    pub hdr_sectors: u32,
    pub data_sectors: u32,
    pub live_sectors: u32,
    pub obj_type: u32,
}

type SharedBatch = Arc<Mutex<Batch>>;

struct XlateState {
    current: Option<SharedBatch>,
    free: Vec<SharedBatch>,
    queue: VecDeque<SharedBatch>,
    in_mem: HashMap<u32, SharedBatch>,
    object_info: HashMap<u32, ObjInfo>,
    last_ckpt: u32,
    active_workers: usize,
}

struct XlateShared {
    backend: Arc<dyn ObjectBackend>,
    omap: Arc<ObjMap>,
    batch_size: usize,
    window: usize,
    vol_uuid: [u8; 16],
    vol_size_sectors: u64,
    batch_seq: AtomicU32,
    write_failures: AtomicU64,
    halted: AtomicBool,
    running: AtomicBool,
    state: Mutex<XlateState>,
    work_cv: Condvar,
    window_cv: Condvar,
    misc_cv: Condvar,
}

/// Handle to the translation layer. Cheap to clone; the write cache holds
/// one to forward journaled writes.
#[derive(Clone)]
pub struct Translate {
    shared: Arc<XlateShared>,
    handles: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

/// Write a fresh volume super object: empty checkpoint/clone/snapshot
/// lists, first allocatable sequence number 1.
pub fn format_volume(backend: &dyn ObjectBackend, size_bytes: u64, vol_uuid: [u8; 16]) -> Result<()> {
    ensure!(
        size_bytes % SECTOR_SIZE as u64 == 0,
        EngineError::Format("volume size must be sector-aligned".into())
    );
    write_super_object(backend, vol_uuid, size_bytes / SECTOR_SIZE as u64, 1, &[])
}

fn write_super_object(
    backend: &dyn ObjectBackend,
    vol_uuid: [u8; 16],
    vol_size_sectors: u64,
    next_obj: u32,
    ckpts: &[u32],
) -> Result<()> {
    let body = OBJ_HEADER_SIZE + SUPER_HEADER_SIZE;
    let ckpts_le: Vec<U32> = ckpts.iter().map(|&c| U32::new(c)).collect();
    let ckpts_bytes = encode_entries(&ckpts_le);
    let total = body + ckpts_bytes.len();
    let hdr_sectors = total.div_ceil(SECTOR_SIZE) as u32;

    let hdr = ObjHeader::new(vol_uuid, OBJ_SUPER, 0, hdr_sectors, 0);
    let sh = SuperHeader::new(
        vol_size_sectors,
        next_obj,
        body as u32,
        ckpts_bytes.len() as u32,
        0,
        0,
        0,
        0,
    );

    let mut buf = Vec::with_capacity(total);
    buf.extend_from_slice(hdr.as_bytes());
    buf.extend_from_slice(sh.as_bytes());
    buf.extend_from_slice(&ckpts_bytes);
    backend
        .write_object(ObjectId::Super, &[IoSlice::new(&buf)])
        .wrap_err("failed to write volume super object")
}

/// Read an object's header region: first page, then the rest if the header
/// says it is longer.
fn read_header_buf(backend: &dyn ObjectBackend, id: ObjectId) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; 4096];
    let n = backend.read_object(id, &mut buf, 0)?;
    ensure!(
        n >= OBJ_HEADER_SIZE,
        EngineError::Format(format!("object {} truncated: {n} bytes", backend.object_name(id)))
    );
    buf.truncate(n);
    let hdr_bytes = ObjHeader::parse(&buf)?.hdr_sectors.get() as usize * SECTOR_SIZE;
    if hdr_bytes > buf.len() {
        let mut full = vec![0u8; hdr_bytes];
        let n = backend.read_object(id, &mut full, 0)?;
        full.truncate(n);
        return Ok(full);
    }
    Ok(buf)
}

impl Translate {
    /// Recover from the backend and start the writer pool plus background
    /// checkpoint (and optionally flush-timer) threads. Returns the handle
    /// and the volume size in bytes.
    pub fn open(
        backend: Arc<dyn ObjectBackend>,
        omap: Arc<ObjMap>,
        cfg: &Config,
        timed_flush: bool,
    ) -> Result<(Self, u64)> {
        let super_buf = backend
            .read_object_full(ObjectId::Super)
            .wrap_err("failed to read volume super object")?;
        let hdr = ObjHeader::parse(&super_buf)?;
        ensure!(
            hdr.obj_type.get() == OBJ_SUPER,
            EngineError::Format("super object has wrong type".into())
        );
        let vol_uuid = hdr.vol_uuid;
        let sh = SuperHeader::parse(&super_buf[OBJ_HEADER_SIZE..])?;
        let vol_size_sectors = sh.vol_size.get();
        let ckpts: Vec<U32> = decode_entries(&super_buf, sh.ckpts_offset.get(), sh.ckpts_len.get())?;

        let shared = Arc::new(XlateShared {
            backend,
            omap,
            batch_size: cfg.batch_size,
            window: cfg.xlate_window,
            vol_uuid,
            vol_size_sectors,
            batch_seq: AtomicU32::new(sh.next_obj.get().max(1)),
            write_failures: AtomicU64::new(0),
            halted: AtomicBool::new(false),
            running: AtomicBool::new(true),
            state: Mutex::new(XlateState {
                current: None,
                free: Vec::new(),
                queue: VecDeque::new(),
                in_mem: HashMap::new(),
                object_info: HashMap::new(),
                last_ckpt: 0,
                active_workers: 0,
            }),
            work_cv: Condvar::new(),
            window_cv: Condvar::new(),
            misc_cv: Condvar::new(),
        });

        let this = Self {
            shared,
            handles: Arc::new(Mutex::new(Vec::new())),
        };
        this.recover(&ckpts)?;

        let mut handles = this.handles.lock();
        for i in 0..cfg.xlate_threads {
            let shared = Arc::clone(&this.shared);
            handles.push(
                std::thread::Builder::new()
                    .name(format!("xlate-worker-{i}"))
                    .spawn(move || worker_thread(&shared))
                    .wrap_err("failed to spawn translation worker")?,
            );
        }
        {
            let t = this.clone();
            handles.push(
                std::thread::Builder::new()
                    .name("xlate-ckpt".into())
                    .spawn(move || ckpt_thread(&t))
                    .wrap_err("failed to spawn checkpoint thread")?,
            );
        }
        if timed_flush {
            let t = this.clone();
            handles.push(
                std::thread::Builder::new()
                    .name("xlate-flush".into())
                    .spawn(move || flush_thread(&t))
                    .wrap_err("failed to spawn flush thread")?,
            );
        }
        drop(handles);

        Ok((this, vol_size_sectors * SECTOR_SIZE as u64))
    }

    fn recover(&self, ckpts: &[U32]) -> Result<()> {
        let sh = &self.shared;
        let mut state = sh.state.lock();
        let mut map = sh.omap.write();
        let mut next_seq = sh.batch_seq.load(Ordering::Acquire);

        for ck in ckpts {
            let ck = ck.get();
            let buf = read_header_buf(sh.backend.as_ref(), ObjectId::Seq(ck))
                .wrap_err_with(|| format!("failed to read checkpoint {ck}"))?;
            let hdr = ObjHeader::parse(&buf)?;
            ensure!(
                hdr.obj_type.get() == OBJ_CKPT,
                EngineError::Format(format!("object {ck} is not a checkpoint"))
            );
            let ch = CkptHeader::parse(&buf[OBJ_HEADER_SIZE..])?;
            let objects: Vec<CkptObjEntry> =
                decode_entries(&buf, ch.objs_offset.get(), ch.objs_len.get())?;
            let entries: Vec<CkptMapEntry> =
                decode_entries(&buf, ch.map_offset.get(), ch.map_len.get())?;

            for o in &objects {
                state.object_info.insert(
                    o.seq.get(),
                    ObjInfo {
                        hdr_sectors: o.hdr_sectors.get(),
                        data_sectors: o.data_sectors.get(),
                        live_sectors: o.live_sectors.get(),
                        obj_type: OBJ_DATA,
                    },
                );
            }
            for e in &entries {
                map.update(
                    e.lba(),
                    e.lba() + e.sectors(),
                    ObjOffset {
                        obj: e.obj.get(),
                        offset: e.offset.get() as u64,
                    },
                    None,
                );
            }
            state.last_ckpt = ck;
            next_seq = next_seq.max(ck + 1);
        }

        // Roll forward through data objects written after the checkpoint.
        let mut seq = if state.last_ckpt > 0 {
            state.last_ckpt + 1
        } else {
            1
        };
        loop {
            let buf = match read_header_buf(sh.backend.as_ref(), ObjectId::Seq(seq)) {
                Ok(buf) => buf,
                Err(_) => break,
            };
            let hdr = match ObjHeader::parse(&buf) {
                Ok(h) if h.obj_type.get() == OBJ_DATA => *h,
                _ => break,
            };
            let dh = match DataHeader::parse(&buf[OBJ_HEADER_SIZE..]) {
                Ok(dh) => *dh,
                Err(_) => break,
            };
            let entries: Vec<DataMapEntry> =
                match decode_entries(&buf, dh.map_offset.get(), dh.map_len.get()) {
                    Ok(e) => e,
                    Err(_) => break,
                };

            state.object_info.insert(
                seq,
                ObjInfo {
                    hdr_sectors: hdr.hdr_sectors.get(),
                    data_sectors: hdr.data_sectors.get(),
                    live_sectors: hdr.data_sectors.get(),
                    obj_type: OBJ_DATA,
                },
            );
            let mut offset = hdr.hdr_sectors.get() as u64;
            let mut displaced = Vec::new();
            for e in &entries {
                displaced.clear();
                map.update(
                    e.lba(),
                    e.lba() + e.sectors(),
                    ObjOffset { obj: seq, offset },
                    Some(&mut displaced),
                );
                account_displaced(&mut state.object_info, &displaced, seq);
                offset += e.sectors();
            }
            debug!(seq, entries = entries.len(), "rolled forward data object");
            next_seq = next_seq.max(seq + 1);
            seq += 1;
        }

        sh.batch_seq.store(next_seq.max(1), Ordering::Release);
        info!(
            next_seq,
            objects = state.object_info.len(),
            extents = map.len(),
            "translation layer recovered"
        );
        Ok(())
    }

    /// Copy `data` into the current batch and publish the mapping. Returns
    /// bytes written. Blocks only when the writer window is full.
    pub fn writev(&self, offset_bytes: u64, data: &[u8]) -> Result<usize> {
        let sh = &self.shared;
        ensure!(
            offset_bytes % SECTOR_SIZE as u64 == 0 && data.len() % SECTOR_SIZE == 0,
            EngineError::Format("write not sector-aligned".into())
        );
        ensure!(
            data.len() <= sh.batch_size,
            EngineError::Format(format!(
                "write of {} bytes exceeds batch size {}",
                data.len(),
                sh.batch_size
            ))
        );
        if data.is_empty() {
            return Ok(0);
        }
        if sh.halted.load(Ordering::Acquire) {
            bail!(EngineError::Io("translation layer halted".into()));
        }

        let lba = offset_bytes / SECTOR_SIZE as u64;
        let sectors = (data.len() / SECTOR_SIZE) as u64;

        let mut state = sh.state.lock();

        // Seal a full batch, then wait for writer-window room; re-check
        // after every wait since the world changes while we sleep.
        loop {
            let seal = match &state.current {
                Some(b) => b.lock().would_overflow(data.len()),
                None => false,
            };
            if seal {
                self.seal_locked(&mut state);
            }
            if state.queue.len() >= sh.window && sh.running.load(Ordering::Acquire) {
                sh.window_cv.wait(&mut state);
                continue;
            }
            break;
        }

        if state.current.is_none() {
            let seq = sh.batch_seq.fetch_add(1, Ordering::AcqRel);
            let b = state
                .free
                .pop()
                .unwrap_or_else(|| Arc::new(Mutex::new(Batch::new(sh.batch_size))));
            b.lock().reset(seq);
            state.in_mem.insert(seq, Arc::clone(&b));
            state.object_info.insert(
                seq,
                ObjInfo {
                    hdr_sectors: 0,
                    data_sectors: 0,
                    live_sectors: 0,
                    obj_type: OBJ_DATA,
                },
            );
            state.current = Some(b);
        }

        let current = Arc::clone(state.current.as_ref().unwrap());
        let (seq, sector_offset) = {
            let mut b = current.lock();
            let off = b.append(lba, data);
            (b.seq, off)
        };
        if let Some(oi) = state.object_info.get_mut(&seq) {
            oi.data_sectors += sectors as u32;
            oi.live_sectors += sectors as u32;
        }

        let mut displaced = Vec::new();
        {
            let mut map = sh.omap.write();
            map.update(
                lba,
                lba + sectors,
                ObjOffset {
                    obj: seq,
                    offset: sector_offset,
                },
                Some(&mut displaced),
            );
        }
        account_displaced(&mut state.object_info, &displaced, seq);

        Ok(data.len())
    }

    /// Resolve and read `[offset, offset + buf.len())`. Unmapped ranges
    /// zero-fill; in-memory batches are served directly; backend read
    /// failures degrade to zero-filled short reads.
    pub fn readv(&self, offset_bytes: u64, buf: &mut [u8]) -> Result<usize> {
        let sh = &self.shared;
        ensure!(
            offset_bytes % SECTOR_SIZE as u64 == 0 && buf.len() % SECTOR_SIZE == 0,
            EngineError::Format("read not sector-aligned".into())
        );
        let base = offset_bytes / SECTOR_SIZE as u64;
        let limit = base + (buf.len() / SECTOR_SIZE) as u64;

        // (object, object byte offset, buffer byte range) for backend reads,
        // gathered under the locks and issued after releasing them.
        let mut backend_regions: SmallVec<[(u32, u64, std::ops::Range<usize>); 4]> =
            SmallVec::new();

        {
            let state = sh.state.lock();
            let map = sh.omap.read();
            let mut prev = base;
            for ext in map.overlapping(base, limit) {
                let buf_off = ((ext.base - base) * SECTOR_SIZE as u64) as usize;
                if ext.base > prev {
                    let gap = ((prev - base) * SECTOR_SIZE as u64) as usize..buf_off;
                    buf[gap].fill(0);
                }
                let byte_len = (ext.len() * SECTOR_SIZE as u64) as usize;
                let byte_off = ext.value.offset * SECTOR_SIZE as u64;
                if let Some(b) = state.in_mem.get(&ext.value.obj) {
                    let b = b.lock();
                    buf[buf_off..buf_off + byte_len]
                        .copy_from_slice(&b.buf[byte_off as usize..byte_off as usize + byte_len]);
                } else {
                    backend_regions.push((ext.value.obj, byte_off, buf_off..buf_off + byte_len));
                }
                prev = ext.limit;
            }
            if prev < limit {
                let tail = ((prev - base) * SECTOR_SIZE as u64) as usize..buf.len();
                buf[tail].fill(0);
            }
        }

        for (obj, byte_off, range) in backend_regions {
            let slice = &mut buf[range];
            match sh.backend.read_object(ObjectId::Seq(obj), slice, byte_off) {
                Ok(n) if n < slice.len() => {
                    warn!(obj, short = slice.len() - n, "short backend read, zero-filling");
                    slice[n..].fill(0);
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(obj, error = %e, "backend read failed, zero-filling");
                    slice.fill(0);
                }
            }
        }
        Ok(buf.len())
    }

    fn seal_locked(&self, state: &mut XlateState) {
        if let Some(b) = state.current.take() {
            if b.lock().is_empty() {
                state.current = Some(b);
                return;
            }
            state.queue.push_back(b);
            self.shared.work_cv.notify_one();
        }
    }

    /// Seal the current batch, if non-empty, and hand it to the writer
    /// pool. Returns the sealed batch's sequence number, or 0.
    pub fn flush(&self) -> u32 {
        let mut state = self.shared.state.lock();
        let seq = match &state.current {
            Some(b) => {
                let b = b.lock();
                if b.is_empty() {
                    0
                } else {
                    b.seq
                }
            }
            None => 0,
        };
        if seq != 0 {
            self.seal_locked(&mut state);
        }
        seq
    }

    /// Block until the writer pool has drained every queued batch.
    pub fn drain(&self) {
        let mut state = self.shared.state.lock();
        while !state.queue.is_empty() || state.active_workers > 0 {
            self.shared.window_cv.wait(&mut state);
        }
    }

    /// Seal, drain, and write a checkpoint object followed by the super
    /// object. Returns the checkpoint's sequence number.
    pub fn checkpoint(&self) -> Result<u32> {
        self.flush();
        self.drain();
        if self.shared.halted.load(Ordering::Acquire) {
            bail!(EngineError::Io("translation layer halted".into()));
        }
        let seq = self.shared.batch_seq.fetch_add(1, Ordering::AcqRel);
        self.write_checkpoint(seq)?;
        Ok(seq)
    }

    fn write_checkpoint(&self, seq: u32) -> Result<()> {
        let sh = &self.shared;

        // Snapshot map and object table together, state lock held so no
        // write can interleave. Extents still pointing into in-memory
        // batches are excluded: their offsets are batch-relative until the
        // worker republishes them, and the journal replays those writes on
        // recovery anyway.
        let ckpt_seq_bytes = encode_entries(&[U32::new(seq)]);
        let (entries, objs_bytes, hdr_sectors) = {
            let mut state = sh.state.lock();
            let map = sh.omap.read();
            let entries: Vec<CkptMapEntry> = map
                .iter()
                .filter(|e| !state.in_mem.contains_key(&e.value.obj))
                .map(|e| CkptMapEntry::new(e.base, e.len(), e.value.obj, e.value.offset as u32))
                .collect();
            drop(map);

            let mut objects: Vec<CkptObjEntry> = state
                .object_info
                .iter()
                .filter(|&(obj, oi)| oi.obj_type == OBJ_DATA && !state.in_mem.contains_key(obj))
                .map(|(&obj, oi)| CkptObjEntry {
                    seq: U32::new(obj),
                    hdr_sectors: U32::new(oi.hdr_sectors),
                    data_sectors: U32::new(oi.data_sectors),
                    live_sectors: U32::new(oi.live_sectors),
                })
                .collect();
            objects.sort_by_key(|o| o.seq.get());
            let objs_bytes = encode_entries(&objects);

            let map_bytes_len = entries.len() * std::mem::size_of::<CkptMapEntry>();
            let total = OBJ_HEADER_SIZE
                + CKPT_HEADER_SIZE
                + ckpt_seq_bytes.len()
                + objs_bytes.len()
                + map_bytes_len;
            let hdr_sectors = total.div_ceil(SECTOR_SIZE) as u32;
            state.object_info.insert(
                seq,
                ObjInfo {
                    hdr_sectors,
                    data_sectors: 0,
                    live_sectors: 0,
                    obj_type: OBJ_CKPT,
                },
            );
            (entries, objs_bytes, hdr_sectors)
        };
        let map_bytes = encode_entries(&entries);

        let o1 = (OBJ_HEADER_SIZE + CKPT_HEADER_SIZE) as u32;
        let o2 = o1 + ckpt_seq_bytes.len() as u32;
        let o3 = o2 + objs_bytes.len() as u32;

        let hdr = ObjHeader::new(sh.vol_uuid, OBJ_CKPT, seq, hdr_sectors, 0);
        let ch = CkptHeader {
            ckpts_offset: U32::new(o1),
            ckpts_len: U32::new(ckpt_seq_bytes.len() as u32),
            objs_offset: U32::new(o2),
            objs_len: U32::new(objs_bytes.len() as u32),
            deletes_offset: U32::new(0),
            deletes_len: U32::new(0),
            map_offset: U32::new(o3),
            map_len: U32::new(map_bytes.len() as u32),
        };

        sh.backend
            .write_object(
                ObjectId::Seq(seq),
                &[
                    IoSlice::new(hdr.as_bytes()),
                    IoSlice::new(ch.as_bytes()),
                    IoSlice::new(&ckpt_seq_bytes),
                    IoSlice::new(&objs_bytes),
                    IoSlice::new(&map_bytes),
                ],
            )
            .wrap_err("failed to write checkpoint object")?;

        // The checkpoint is durable; only now may the super point at it.
        write_super_object(
            sh.backend.as_ref(),
            sh.vol_uuid,
            sh.vol_size_sectors,
            sh.batch_seq.load(Ordering::Acquire),
            &[seq],
        )?;

        sh.state.lock().last_ckpt = seq;
        info!(seq, extents = entries.len(), "wrote translation checkpoint");
        Ok(())
    }

    /// Sectors accumulated in the current batch.
    pub fn frontier(&self) -> u64 {
        let state = self.shared.state.lock();
        match &state.current {
            Some(b) => b.lock().sectors(),
            None => 0,
        }
    }

    pub fn mapsize(&self) -> usize {
        self.shared.omap.read().len()
    }

    /// Map extents overlapping `[base, limit)`, for diagnostics and tests.
    pub fn getmap(&self, base: u64, limit: u64) -> Vec<Extent<ObjOffset>> {
        self.shared.omap.read().overlapping(base, limit).collect()
    }

    pub fn reset(&self) {
        self.shared.omap.write().reset();
    }

    pub fn write_failures(&self) -> u64 {
        self.shared.write_failures.load(Ordering::Acquire)
    }

    pub fn object_info(&self, seq: u32) -> Option<ObjInfo> {
        self.shared.state.lock().object_info.get(&seq).copied()
    }

    pub fn batch_seq(&self) -> u32 {
        self.shared.batch_seq.load(Ordering::Acquire)
    }

    pub fn vol_uuid(&self) -> [u8; 16] {
        self.shared.vol_uuid
    }

    /// Stop the writer pool and background threads. Queued batches are
    /// drained. The current unsealed batch is intentionally not sealed:
    /// its writes are still journaled by the write cache and replay on the
    /// next open.
    pub fn shutdown(&self) {
        let sh = &self.shared;
        if !sh.running.swap(false, Ordering::AcqRel) {
            return;
        }
        {
            let _state = sh.state.lock();
            sh.work_cv.notify_all();
            sh.window_cv.notify_all();
            sh.misc_cv.notify_all();
        }
        let mut handles = self.handles.lock();
        for h in handles.drain(..) {
            let _ = h.join();
        }
        info!("translation layer stopped");
    }
}

fn account_displaced(
    object_info: &mut HashMap<u32, ObjInfo>,
    displaced: &[Extent<ObjOffset>],
    skip_obj: u32,
) {
    for d in displaced {
        if d.value.obj == skip_obj {
            continue;
        }
        if let Some(oi) = object_info.get_mut(&d.value.obj) {
            oi.live_sectors = oi.live_sectors.saturating_sub(d.len() as u32);
        }
    }
}

/// Build the DATA object header region, zero-padded to `hdr_sectors`.
fn make_data_header(
    vol_uuid: [u8; 16],
    batch: &Batch,
    hdr_sectors: u32,
    last_ckpt: u32,
) -> Vec<u8> {
    let mut buf = vec![0u8; hdr_sectors as usize * SECTOR_SIZE];
    let hdr = ObjHeader::new(
        vol_uuid,
        OBJ_DATA,
        batch.seq,
        hdr_sectors,
        batch.sectors() as u32,
    );

    let o1 = (OBJ_HEADER_SIZE + DATA_HEADER_SIZE) as u32;
    let entries: Vec<DataMapEntry> = batch
        .entries
        .iter()
        .map(|e| DataMapEntry::new(e.lba, e.sectors))
        .collect();
    let map_bytes = encode_entries(&entries);
    let dh = DataHeader {
        last_data_obj: U32::new(batch.seq),
        ckpts_offset: U32::new(o1),
        ckpts_len: U32::new(4),
        objs_cleaned_offset: U32::new(0),
        objs_cleaned_len: U32::new(0),
        map_offset: U32::new(o1 + 4),
        map_len: U32::new(map_bytes.len() as u32),
    };

    let mut off = 0;
    for part in [hdr.as_bytes(), dh.as_bytes(), &last_ckpt.to_le_bytes()[..]] {
        buf[off..off + part.len()].copy_from_slice(part);
        off += part.len();
    }
    buf[off..off + map_bytes.len()].copy_from_slice(&map_bytes);
    buf
}

fn worker_thread(sh: &Arc<XlateShared>) {
    loop {
        let (batch, last_ckpt) = {
            let mut state = sh.state.lock();
            loop {
                if let Some(b) = state.queue.pop_front() {
                    state.active_workers += 1;
                    sh.window_cv.notify_all();
                    break (b, state.last_ckpt);
                }
                if !sh.running.load(Ordering::Acquire) {
                    return;
                }
                sh.work_cv.wait(&mut state);
            }
        };

        let (seq, hdr_buf, payload) = {
            // State lock before batch lock, everywhere.
            let mut state = sh.state.lock();
            let b = batch.lock();
            let hdr_sectors = b.header_bytes().div_ceil(SECTOR_SIZE) as u32;
            if let Some(oi) = state.object_info.get_mut(&b.seq) {
                oi.hdr_sectors = hdr_sectors;
            }
            let hdr_buf = make_data_header(sh.vol_uuid, &b, hdr_sectors, last_ckpt);
            (b.seq, hdr_buf, b.buf.clone())
        };

        let res = sh.backend.write_object(
            ObjectId::Seq(seq),
            &[IoSlice::new(&hdr_buf), IoSlice::new(&payload)],
        );

        let mut state = sh.state.lock();
        match res {
            Ok(()) => {
                // Republish this batch's extents with object-relative
                // offsets. Only ranges still pointing at this batch are
                // touched, so newer overwrites survive slow workers.
                let hdr_sectors = (hdr_buf.len() / SECTOR_SIZE) as u64;
                let mut map = sh.omap.write();
                let b = batch.lock();
                let mut e_off = 0u64;
                for e in &b.entries {
                    let pieces: Vec<Extent<ObjOffset>> = map
                        .overlapping(e.lba, e.lba + e.sectors)
                        .filter(|p| p.value.obj == seq)
                        .collect();
                    for p in pieces {
                        map.update(
                            p.base,
                            p.limit,
                            ObjOffset {
                                obj: seq,
                                offset: hdr_sectors + e_off + (p.base - e.lba),
                            },
                            None,
                        );
                    }
                    e_off += e.sectors;
                }
                drop(map);
                drop(b);
                state.in_mem.remove(&seq);
                state.free.push(batch);
                debug!(seq, "wrote data object");
            }
            Err(e) => {
                sh.write_failures.fetch_add(1, Ordering::AcqRel);
                sh.halted.store(true, Ordering::Release);
                error!(seq, error = %e, "backend object write failed, halting translation");
                // Keep the batch in_mem so reads continue to be served; the
                // map is left untouched.
            }
        }
        state.active_workers -= 1;
        sh.window_cv.notify_all();
    }
}

fn ckpt_thread(t: &Translate) {
    let sh = &t.shared;
    let period = Duration::from_millis(1000);
    let mut seq0 = sh.batch_seq.load(Ordering::Acquire);

    loop {
        {
            let mut state = sh.state.lock();
            if !sh.running.load(Ordering::Acquire) {
                return;
            }
            sh.misc_cv.wait_for(&mut state, period);
            if !sh.running.load(Ordering::Acquire) {
                return;
            }
        }
        let seq = sh.batch_seq.load(Ordering::Acquire);
        if seq.wrapping_sub(seq0) > XLATE_CKPT_INTERVAL {
            seq0 = seq;
            if let Err(e) = t.checkpoint() {
                warn!(error = %e, "periodic checkpoint failed");
            }
        }
    }
}

fn flush_thread(t: &Translate) {
    let sh = &t.shared;
    let period = Duration::from_millis(XLATE_FLUSH_PERIOD_MS);
    let timeout = Duration::from_millis(XLATE_FLUSH_TIMEOUT_MS);
    let mut mark: (u32, usize) = (0, 0);
    let mut t0 = Instant::now();

    loop {
        let frontier = {
            let mut state = sh.state.lock();
            if !sh.running.load(Ordering::Acquire) {
                return;
            }
            sh.misc_cv.wait_for(&mut state, period);
            if !sh.running.load(Ordering::Acquire) {
                return;
            }
            match &state.current {
                Some(b) => {
                    let b = b.lock();
                    Some((b.seq, b.len()))
                }
                None => None,
            }
        };

        match frontier {
            Some((seq, len)) if len > 0 && (seq, len) == mark => {
                if t0.elapsed() > timeout {
                    debug!(seq, "flushing idle batch");
                    t.flush();
                }
            }
            Some((seq, len)) => {
                mark = (seq, len);
                t0 = Instant::now();
            }
            None => {
                mark = (0, 0);
                t0 = Instant::now();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::FileBackend;
    use tempfile::TempDir;

    fn small_cfg() -> Config {
        Config {
            batch_size: 16 * 1024,
            xlate_threads: 2,
            ..Config::default()
        }
    }

    fn setup(cfg: &Config) -> (TempDir, Arc<FileBackend>, Arc<ObjMap>, Translate) {
        let dir = TempDir::new().unwrap();
        let backend = Arc::new(FileBackend::new(dir.path(), "vol").unwrap());
        format_volume(backend.as_ref(), 1 << 30, *uuid::Uuid::new_v4().as_bytes()).unwrap();
        let omap = Arc::new(ObjMap::new());
        let (xlate, size) =
            Translate::open(Arc::clone(&backend) as Arc<dyn ObjectBackend>, Arc::clone(&omap), cfg, false)
                .unwrap();
        assert_eq!(size, 1 << 30);
        (dir, backend, omap, xlate)
    }

    fn patterned(len: usize, seed: u8) -> Vec<u8> {
        (0..len).map(|i| seed.wrapping_add(i as u8)).collect()
    }

    #[test]
    fn test_write_read_round_trip_in_mem() {
        let cfg = small_cfg();
        let (_dir, _be, _omap, xlate) = setup(&cfg);

        let data = patterned(4096, 0xA5);
        assert_eq!(xlate.writev(0, &data).unwrap(), 4096);
        assert_eq!(xlate.frontier(), 8);

        // Served from the in-memory batch before any flush.
        let mut buf = vec![0u8; 4096];
        xlate.readv(0, &mut buf).unwrap();
        assert_eq!(buf, data);
        xlate.shutdown();
    }

    #[test]
    fn test_flush_writes_object_and_reads_from_backend() {
        let cfg = small_cfg();
        let (_dir, backend, _omap, xlate) = setup(&cfg);

        let data = patterned(8192, 1);
        xlate.writev(512 * 8, &data).unwrap();
        let seq = xlate.flush();
        assert_ne!(seq, 0);
        xlate.drain();

        // Object exists on the backend with a parseable header.
        let buf = read_header_buf(backend.as_ref(), ObjectId::Seq(seq)).unwrap();
        let hdr = ObjHeader::parse(&buf).unwrap();
        assert_eq!(hdr.obj_type.get(), OBJ_DATA);
        assert_eq!(hdr.data_sectors.get(), 16);

        let mut out = vec![0u8; 8192];
        xlate.readv(512 * 8, &mut out).unwrap();
        assert_eq!(out, data);
        xlate.shutdown();
    }

    #[test]
    fn test_unmapped_reads_zero_fill() {
        let cfg = small_cfg();
        let (_dir, _be, _omap, xlate) = setup(&cfg);

        xlate.writev(4096, &patterned(512, 7)).unwrap();

        // Gap before, mapped sector, gap after.
        let mut buf = vec![0xFFu8; 4096 + 512 + 4096];
        xlate.readv(0, &mut buf).unwrap();
        assert!(buf[..4096].iter().all(|&b| b == 0));
        assert_eq!(&buf[4096..4608], &patterned(512, 7)[..]);
        assert!(buf[4608..].iter().all(|&b| b == 0));
        xlate.shutdown();
    }

    #[test]
    fn test_batch_rotation_creates_multiple_objects() {
        let cfg = small_cfg();
        let (_dir, _be, _omap, xlate) = setup(&cfg);

        // 2x batch_size of sequential writes.
        let chunk = patterned(4096, 3);
        for i in 0..8u64 {
            xlate.writev(i * 4096, &chunk).unwrap();
        }
        xlate.flush();
        xlate.drain();

        // At least two data objects, and the map covers the full range.
        let exts = xlate.getmap(0, 64);
        let covered: u64 = exts.iter().map(|e| e.len()).sum();
        assert_eq!(covered, 64);
        let objs: std::collections::BTreeSet<u32> = exts.iter().map(|e| e.value.obj).collect();
        assert!(objs.len() >= 2, "expected multiple objects, got {objs:?}");

        let mut out = vec![0u8; 8 * 4096];
        xlate.readv(0, &mut out).unwrap();
        for i in 0..8 {
            assert_eq!(&out[i * 4096..(i + 1) * 4096], &chunk[..], "chunk {i}");
        }
        xlate.shutdown();
    }

    #[test]
    fn test_overwrite_decrements_live_sectors() {
        let cfg = small_cfg();
        let (_dir, _be, _omap, xlate) = setup(&cfg);

        xlate.writev(0, &patterned(4096, 0xA5)).unwrap();
        let first = xlate.flush();
        xlate.drain();
        let before = xlate.object_info(first).unwrap();
        assert_eq!(before.live_sectors, 8);

        xlate.writev(0, &patterned(4096, 0x5A)).unwrap();
        let after = xlate.object_info(first).unwrap();
        assert_eq!(after.live_sectors, 0);

        let mut out = vec![0u8; 4096];
        xlate.readv(0, &mut out).unwrap();
        assert_eq!(out, patterned(4096, 0x5A));
        xlate.shutdown();
    }

    #[test]
    fn test_checkpoint_and_recovery() {
        let cfg = small_cfg();
        let (dir, backend, _omap, xlate) = setup(&cfg);

        let data = patterned(8192, 0x11);
        xlate.writev(0, &data).unwrap();
        xlate.writev(1 << 20, &patterned(4096, 0x22)).unwrap();
        let ckpt = xlate.checkpoint().unwrap();
        assert!(ckpt > 0);

        // More writes after the checkpoint, flushed as data objects.
        xlate.writev(2 << 20, &patterned(4096, 0x33)).unwrap();
        xlate.flush();
        xlate.drain();
        let map_before: Vec<_> = xlate.getmap(0, 1 << 16);
        let size_before = xlate.mapsize();
        xlate.shutdown();
        drop(xlate);

        // Reopen: checkpoint replay plus data-object roll-forward.
        let omap2 = Arc::new(ObjMap::new());
        let (xlate2, _) = Translate::open(
            Arc::clone(&backend) as Arc<dyn ObjectBackend>,
            Arc::clone(&omap2),
            &cfg,
            false,
        )
        .unwrap();
        assert_eq!(xlate2.mapsize(), size_before);
        assert_eq!(xlate2.getmap(0, 1 << 16), map_before);

        let mut out = vec![0u8; 8192];
        xlate2.readv(0, &mut out).unwrap();
        assert_eq!(out, data);
        let mut out = vec![0u8; 4096];
        xlate2.readv(2 << 20, &mut out).unwrap();
        assert_eq!(out, patterned(4096, 0x33));

        // Idempotent: a second recovery from the same state is identical.
        xlate2.shutdown();
        let omap3 = Arc::new(ObjMap::new());
        let (xlate3, _) = Translate::open(
            Arc::clone(&backend) as Arc<dyn ObjectBackend>,
            Arc::clone(&omap3),
            &cfg,
            false,
        )
        .unwrap();
        assert_eq!(xlate3.mapsize(), size_before);
        assert_eq!(xlate3.batch_seq(), xlate2.batch_seq());
        xlate3.shutdown();
        drop(dir);
    }

    #[test]
    fn test_recovery_without_checkpoint_scans_from_first_object() {
        let cfg = small_cfg();
        let (_dir, backend, _omap, xlate) = setup(&cfg);

        xlate.writev(0, &patterned(4096, 9)).unwrap();
        xlate.flush();
        xlate.drain();
        xlate.shutdown();

        let omap2 = Arc::new(ObjMap::new());
        let (xlate2, _) = Translate::open(
            Arc::clone(&backend) as Arc<dyn ObjectBackend>,
            omap2,
            &cfg,
            false,
        )
        .unwrap();
        let mut out = vec![0u8; 4096];
        xlate2.readv(0, &mut out).unwrap();
        assert_eq!(out, patterned(4096, 9));
        xlate2.shutdown();
    }
}
