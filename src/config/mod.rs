//! # Engine Configuration
//!
//! Runtime options for the storage engine, with defaults that match the
//! shipped tuning. Every option can be overridden from the environment
//! (`OBJDISK_<OPTION>`), which keeps deployment scripting out of the library
//! API.
//!
//! Numeric constants that are not operator-tunable live in [`constants`].

pub mod constants;
pub use constants::*;

use std::path::PathBuf;

use eyre::{bail, Result, WrapErr};

/// Which object backend the volume talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// One file per object under a directory. Default.
    File,
    /// Remote object store. Recognized in configuration but not wired in
    /// this crate; selecting it is a configuration error.
    ObjectStore,
}

/// Engine options.
#[derive(Debug, Clone)]
pub struct Config {
    /// Translation-layer batch buffer size in bytes. One sealed batch
    /// becomes one DATA object.
    pub batch_size: usize,
    /// Write-cache group commit: dispatch once this many requests queue up.
    pub wcache_batch: usize,
    /// Directory holding the SSD cache file.
    pub cache_dir: PathBuf,
    /// Translation writer pool size.
    pub xlate_threads: usize,
    /// Maximum sealed batches queued ahead of the writer pool.
    pub xlate_window: usize,
    /// Object backend selection.
    pub backend: BackendKind,
    /// Total cache file size in bytes, split between the write journal and
    /// the read cache.
    pub cache_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            batch_size: 8 * 1024 * 1024,
            wcache_batch: 8,
            cache_dir: PathBuf::from("/tmp"),
            xlate_threads: 2,
            xlate_window: 8,
            backend: BackendKind::File,
            cache_size: 8199 * PAGE_SIZE,
        }
    }
}

impl Config {
    /// Default configuration with environment overrides applied.
    pub fn from_env() -> Result<Self> {
        let mut cfg = Self::default();

        if let Some(v) = env_var("OBJDISK_BATCH_SIZE") {
            cfg.batch_size = parse_num(&v, "OBJDISK_BATCH_SIZE")?;
        }
        if let Some(v) = env_var("OBJDISK_WCACHE_BATCH") {
            cfg.wcache_batch = parse_num(&v, "OBJDISK_WCACHE_BATCH")?;
        }
        if let Some(v) = env_var("OBJDISK_CACHE_DIR") {
            cfg.cache_dir = PathBuf::from(v);
        }
        if let Some(v) = env_var("OBJDISK_XLATE_THREADS") {
            cfg.xlate_threads = parse_num(&v, "OBJDISK_XLATE_THREADS")?;
        }
        if let Some(v) = env_var("OBJDISK_XLATE_WINDOW") {
            cfg.xlate_window = parse_num(&v, "OBJDISK_XLATE_WINDOW")?;
        }
        if let Some(v) = env_var("OBJDISK_BACKEND") {
            cfg.backend = match v.as_str() {
                "file" => BackendKind::File,
                "object-store" => BackendKind::ObjectStore,
                other => bail!("unknown OBJDISK_BACKEND value: {other:?}"),
            };
        }
        if let Some(v) = env_var("OBJDISK_CACHE_SIZE") {
            cfg.cache_size = parse_num(&v, "OBJDISK_CACHE_SIZE")?;
        }

        cfg.validate()?;
        Ok(cfg)
    }

    /// Sanity-check option interactions before the engine starts.
    pub fn validate(&self) -> Result<()> {
        eyre::ensure!(
            self.batch_size % SECTOR_SIZE == 0 && self.batch_size > 0,
            "batch_size must be a positive multiple of {SECTOR_SIZE}"
        );
        eyre::ensure!(self.wcache_batch > 0, "wcache_batch must be positive");
        eyre::ensure!(self.xlate_threads > 0, "xlate_threads must be positive");
        eyre::ensure!(self.xlate_window > 0, "xlate_window must be positive");
        eyre::ensure!(
            self.cache_size >= 64 * PAGE_SIZE,
            "cache_size too small: {} < {}",
            self.cache_size,
            64 * PAGE_SIZE
        );
        Ok(())
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn parse_num(v: &str, name: &str) -> Result<usize> {
    v.parse::<usize>()
        .wrap_err_with(|| format!("invalid numeric value for {name}: {v:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = Config::default();
        assert_eq!(cfg.batch_size, 8 * 1024 * 1024);
        assert_eq!(cfg.wcache_batch, 8);
        assert_eq!(cfg.xlate_threads, 2);
        assert_eq!(cfg.xlate_window, 8);
        assert_eq!(cfg.backend, BackendKind::File);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_unaligned_batch() {
        let cfg = Config {
            batch_size: 1000,
            ..Config::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_tiny_cache() {
        let cfg = Config {
            cache_size: PAGE_SIZE,
            ..Config::default()
        };
        assert!(cfg.validate().is_err());
    }
}
