//! # Volume
//!
//! The container that wires a volume together: object backend, object map,
//! translation layer, write cache, and read cache. Owns startup order
//! (translation first, so journal replay has somewhere to forward), the
//! aligned read/write entry points, and teardown order (write cache first,
//! which breaks the write-cache → translation reference).
//!
//! ## Read path
//!
//! A read walks the write-cache forward map slice by slice: cached ranges
//! are read from the journal, skipped ranges fall through to the read
//! cache, which resolves the object map and fetches chunks from the
//! backend on miss. Unmapped ranges read as zeros.
//!
//! ## Write path
//!
//! A write reserves write-window room, lands in the journal via group
//! commit, and is acknowledged when durable on the cache device. The
//! translation layer turns it into object data asynchronously.

use std::path::Path;
use std::sync::Arc;

use eyre::{bail, ensure, Result, WrapErr};
use tracing::info;
use uuid::Uuid;

use crate::backend::{FileBackend, ObjectBackend};
use crate::cachedev::{self, read_cache_super, CacheDevice, FileDevice};
use crate::config::{BackendKind, Config, SECTOR_SIZE};
use crate::error::EngineError;
use crate::rcache::ReadCache;
use crate::request::Completion;
use crate::translate::{format_volume, ObjMap, Translate};
use crate::wcache::WriteCache;

/// One open volume.
pub struct Volume {
    backend: Arc<dyn ObjectBackend>,
    omap: Arc<ObjMap>,
    xlate: Translate,
    wcache: WriteCache,
    rcache: ReadCache,
    size_bytes: u64,
}

fn cache_path(cfg: &Config, name: &str) -> std::path::PathBuf {
    cfg.cache_dir.join(format!("{name}.cache"))
}

fn make_backend(cfg: &Config, dir: &Path, name: &str) -> Result<Arc<dyn ObjectBackend>> {
    match cfg.backend {
        BackendKind::File => Ok(Arc::new(FileBackend::new(dir, name)?)),
        BackendKind::ObjectStore => bail!(EngineError::Format(
            "object-store backend is not wired in this build".into()
        )),
    }
}

impl Volume {
    /// Create a fresh volume: super object on the backend, formatted cache
    /// file under `cache_dir`.
    pub fn create(cfg: &Config, dir: &Path, name: &str, size_bytes: u64) -> Result<()> {
        cfg.validate()?;
        let backend = make_backend(cfg, dir, name)?;
        let vol_uuid = *Uuid::new_v4().as_bytes();
        format_volume(backend.as_ref(), size_bytes, vol_uuid)?;
        cachedev::format(&cache_path(cfg, name), cfg.cache_size, vol_uuid)?;
        info!(name, size_bytes, "created volume");
        Ok(())
    }

    /// Open and recover a volume: translation layer first, then the write
    /// cache (journal replay re-forwards into translation), then the read
    /// cache.
    pub fn open(cfg: &Config, dir: &Path, name: &str) -> Result<Self> {
        cfg.validate()?;
        let backend = make_backend(cfg, dir, name)?;
        let omap = Arc::new(ObjMap::new());
        let (xlate, size_bytes) =
            Translate::open(Arc::clone(&backend), Arc::clone(&omap), cfg, true)
                .wrap_err("failed to open translation layer")?;

        let dev: Arc<dyn CacheDevice> = Arc::new(
            FileDevice::open(&cache_path(cfg, name)).wrap_err("failed to open cache device")?,
        );
        let cs = read_cache_super(dev.as_ref())?;
        ensure!(
            cs.vol_uuid == xlate.vol_uuid(),
            EngineError::Format("cache device belongs to a different volume".into())
        );

        let wcache = WriteCache::open(Arc::clone(&dev), cs.write_super.get(), xlate.clone(), cfg)
            .wrap_err("failed to open write cache")?;
        let rcache = ReadCache::open(
            dev,
            cs.read_super.get(),
            Arc::clone(&backend),
            Arc::clone(&omap),
            xlate.clone(),
            true,
        )
        .wrap_err("failed to open read cache")?;

        info!(name, size_bytes, "opened volume");
        Ok(Self {
            backend,
            omap,
            xlate,
            wcache,
            rcache,
            size_bytes,
        })
    }

    pub fn size(&self) -> u64 {
        self.size_bytes
    }

    /// The object backend this volume stores into.
    pub fn backend(&self) -> &Arc<dyn ObjectBackend> {
        &self.backend
    }

    /// Durable write: returns once the journal record is on SSD.
    pub fn write(&self, offset_bytes: u64, data: &[u8]) -> Result<()> {
        self.write_async(offset_bytes, data)?
            .wait()
            .map_err(|e| EngineError::Io(e).into())
    }

    /// Start a write; the completion fires when it is durable.
    pub fn write_async(&self, offset_bytes: u64, data: &[u8]) -> Result<Arc<Completion>> {
        ensure!(
            offset_bytes + data.len() as u64 <= self.size_bytes,
            EngineError::Format("write past end of volume".into())
        );
        self.wcache.writev(offset_bytes, data.to_vec())
    }

    /// Read `buf.len()` bytes at `offset_bytes`. Unwritten ranges are
    /// zeros.
    pub fn read(&self, offset_bytes: u64, buf: &mut [u8]) -> Result<()> {
        ensure!(
            offset_bytes % SECTOR_SIZE as u64 == 0 && buf.len() % SECTOR_SIZE == 0,
            EngineError::Format("read not sector-aligned".into())
        );
        let mut off = 0usize;
        while off < buf.len() {
            let (skip, read, req) = self
                .wcache
                .async_read(offset_bytes + off as u64, buf.len() - off);
            if skip > 0 {
                self.rcache
                    .read(offset_bytes + off as u64, &mut buf[off..off + skip])?;
                off += skip;
            }
            if let Some(r) = req {
                r.run(&mut buf[off..off + read])?;
                off += read;
            }
        }
        Ok(())
    }

    /// Drain in-flight writes and seal the current translation batch.
    pub fn flush(&self) {
        self.wcache.flush();
        self.xlate.flush();
    }

    /// Drop the mapping for `[offset, offset + len)`; subsequent reads of
    /// the range return zeros.
    pub fn discard(&self, offset_bytes: u64, len: u64) -> Result<()> {
        ensure!(
            offset_bytes % SECTOR_SIZE as u64 == 0 && len % SECTOR_SIZE as u64 == 0,
            EngineError::Format("discard not sector-aligned".into())
        );
        let base = offset_bytes / SECTOR_SIZE as u64;
        let limit = base + len / SECTOR_SIZE as u64;
        self.wcache.trim(base, limit);
        self.omap.write().trim(base, limit);
        Ok(())
    }

    /// Force checkpoints in both cache and translation layers.
    pub fn checkpoint(&self) -> Result<u32> {
        self.wcache.do_write_checkpoint()?;
        self.xlate.checkpoint()
    }

    /// Stop background work. Write cache first: it holds the translation
    /// handle and must stop forwarding before translation stops.
    pub fn shutdown(&self) {
        self.wcache.shutdown();
        self.xlate.shutdown();
        self.rcache.shutdown();
    }
}

impl Drop for Volume {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn small_cfg(dir: &TempDir, cache_pages: usize) -> Config {
        Config {
            batch_size: 64 * 1024,
            cache_dir: dir.path().join("cache"),
            cache_size: cache_pages * crate::config::PAGE_SIZE,
            ..Config::default()
        }
    }

    fn create_and_open(dir: &TempDir, cfg: &Config) -> Volume {
        std::fs::create_dir_all(&cfg.cache_dir).unwrap();
        let obj_dir = dir.path().join("objects");
        Volume::create(cfg, &obj_dir, "vol", 1 << 30).unwrap();
        Volume::open(cfg, &obj_dir, "vol").unwrap()
    }

    fn reopen(dir: &TempDir, cfg: &Config) -> Volume {
        Volume::open(cfg, &dir.path().join("objects"), "vol").unwrap()
    }

    fn patterned(len: usize, seed: u8) -> Vec<u8> {
        (0..len).map(|i| seed.wrapping_add(i as u8)).collect()
    }

    #[test]
    fn test_fresh_volume_write_flush_read() {
        let dir = TempDir::new().unwrap();
        let cfg = small_cfg(&dir, 256);
        let vol = create_and_open(&dir, &cfg);

        let data = vec![0xA5u8; 4096];
        vol.write(0, &data).unwrap();
        vol.flush();

        let mut out = vec![0u8; 4096];
        vol.read(0, &mut out).unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn test_restart_before_batch_seal_replays_journal() {
        let dir = TempDir::new().unwrap();
        let cfg = small_cfg(&dir, 256);
        let data = vec![0xA5u8; 4096];
        {
            let vol = create_and_open(&dir, &cfg);
            vol.write(0, &data).unwrap();
            // Dropped with the batch unsealed: nothing reached the backend.
        }

        let vol = reopen(&dir, &cfg);
        let mut out = vec![0u8; 4096];
        vol.read(0, &mut out).unwrap();
        assert_eq!(out, data, "journal replay must restore the write");
    }

    #[test]
    fn test_overwrite_after_checkpoint_drops_live_sectors() {
        let dir = TempDir::new().unwrap();
        let cfg = small_cfg(&dir, 256);
        let vol = create_and_open(&dir, &cfg);

        vol.write(0, &vec![0xA5u8; 4096]).unwrap();
        vol.checkpoint().unwrap();

        // The checkpoint drained the writer pool: the first write's object
        // is on the backend now.
        let first_obj = vol
            .xlate
            .getmap(0, 8)
            .first()
            .map(|e| e.value.obj)
            .expect("first write must be mapped");
        assert_eq!(vol.xlate.object_info(first_obj).unwrap().live_sectors, 8);

        vol.write(0, &vec![0x5Au8; 4096]).unwrap();
        vol.flush();
        vol.xlate.drain();

        let mut out = vec![0u8; 4096];
        vol.read(0, &mut out).unwrap();
        assert!(out.iter().all(|&b| b == 0x5A));
        assert_eq!(
            vol.xlate.object_info(first_obj).unwrap().live_sectors,
            0,
            "overwritten object must lose its live sectors"
        );
    }

    #[test]
    fn test_sequential_writes_span_objects() {
        let dir = TempDir::new().unwrap();
        let cfg = small_cfg(&dir, 1024);
        let vol = create_and_open(&dir, &cfg);

        // 2x batch_size of sequential data.
        let total = 2 * cfg.batch_size;
        let chunk = 16 * 1024;
        for i in 0..total / chunk {
            vol.write((i * chunk) as u64, &patterned(chunk, i as u8))
                .unwrap();
        }
        vol.flush();
        vol.xlate.drain();

        let sectors = (total / SECTOR_SIZE) as u64;
        let exts = vol.xlate.getmap(0, sectors);
        let covered: u64 = exts.iter().map(|e| e.len()).sum();
        assert_eq!(covered, sectors, "object map must cover the whole range");
        let objs: std::collections::BTreeSet<u32> = exts.iter().map(|e| e.value.obj).collect();
        assert!(objs.len() >= 2, "expected at least two data objects");

        let mut out = vec![0u8; chunk];
        for i in 0..total / chunk {
            vol.read((i * chunk) as u64, &mut out).unwrap();
            assert_eq!(out, patterned(chunk, i as u8), "chunk {i}");
        }
    }

    #[test]
    fn test_journal_eviction_falls_through_to_read_cache() {
        let dir = TempDir::new().unwrap();
        // Tiny cache: 28-page journal ring, one read-cache slot.
        let cfg = small_cfg(&dir, 64);
        let vol = create_and_open(&dir, &cfg);

        let old = patterned(8192, 0xE0);
        vol.write(0, &old).unwrap();
        vol.flush();
        vol.xlate.drain();

        // Push enough writes through the ring to evict the first record.
        for i in 1..16u64 {
            vol.write(i * 8192, &patterned(8192, i as u8)).unwrap();
        }
        assert!(
            vol.wcache.getmap(0, 16).is_empty(),
            "first record should have been evicted"
        );

        // The read falls through the write cache to the read cache, which
        // fetches the object chunk from the backend.
        let mut out = vec![0u8; 8192];
        vol.read(0, &mut out).unwrap();
        assert_eq!(out, old);
        assert!(vol.rcache.cached_chunks() > 0, "chunk should be admitted");
    }

    #[test]
    fn test_unwritten_ranges_read_zero() {
        let dir = TempDir::new().unwrap();
        let cfg = small_cfg(&dir, 256);
        let vol = create_and_open(&dir, &cfg);

        vol.write(8192, &patterned(4096, 1)).unwrap();
        let mut out = vec![0xFFu8; 4 * 4096];
        vol.read(0, &mut out).unwrap();
        assert!(out[..8192].iter().all(|&b| b == 0));
        assert_eq!(&out[8192..12288], &patterned(4096, 1)[..]);
        assert!(out[12288..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_discard_reads_back_zero() {
        let dir = TempDir::new().unwrap();
        let cfg = small_cfg(&dir, 256);
        let vol = create_and_open(&dir, &cfg);

        vol.write(0, &patterned(8192, 3)).unwrap();
        vol.discard(0, 4096).unwrap();

        let mut out = vec![0xFFu8; 8192];
        vol.read(0, &mut out).unwrap();
        assert!(out[..4096].iter().all(|&b| b == 0), "discarded range");
        assert_eq!(&out[4096..], &patterned(8192, 3)[4096..], "kept range");
    }

    #[test]
    fn test_restart_after_checkpoint_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let cfg = small_cfg(&dir, 256);
        let data = patterned(16 * 1024, 0x42);
        {
            let vol = create_and_open(&dir, &cfg);
            vol.write(0, &data).unwrap();
            vol.write(1 << 20, &patterned(4096, 7)).unwrap();
            vol.checkpoint().unwrap();
        }

        let (size1, map1) = {
            let vol = reopen(&dir, &cfg);
            let mut out = vec![0u8; data.len()];
            vol.read(0, &mut out).unwrap();
            assert_eq!(out, data);
            (vol.xlate.mapsize(), vol.xlate.getmap(0, 1 << 16))
        };

        // A second recovery from identical on-disk state sees identical maps.
        let vol = reopen(&dir, &cfg);
        assert_eq!(vol.xlate.mapsize(), size1);
        assert_eq!(vol.xlate.getmap(0, 1 << 16), map1);
        let mut out = vec![0u8; data.len()];
        vol.read(0, &mut out).unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn test_write_past_end_rejected() {
        let dir = TempDir::new().unwrap();
        let cfg = small_cfg(&dir, 256);
        std::fs::create_dir_all(&cfg.cache_dir).unwrap();
        let obj_dir = dir.path().join("objects");
        Volume::create(&cfg, &obj_dir, "vol", 1 << 20).unwrap();
        let vol = Volume::open(&cfg, &obj_dir, "vol").unwrap();

        assert!(vol.write(1 << 20, &[0u8; 512]).is_err());
        assert!(vol.write((1 << 20) - 512, &[0u8; 512]).is_ok());
    }

    #[test]
    fn test_backend_field_reachable() {
        // The container owns the backend for the lifetime of the caches.
        let dir = TempDir::new().unwrap();
        let cfg = small_cfg(&dir, 256);
        let vol = create_and_open(&dir, &cfg);
        assert_eq!(vol.backend.object_name(crate::backend::ObjectId::Super), "vol");
        assert!(vol.size() == 1 << 30);
    }
}
