//! # Object Backend
//!
//! The translation layer stores the volume as a sequence of immutable
//! numbered objects. This module defines the backend capability set and the
//! file-per-object implementation used for local deployments and tests.
//!
//! Objects are write-once: `write_object` truncates and replaces, readers
//! never observe a partially updated object because the translation layer
//! only publishes map entries after the write returns.
//!
//! ## Naming
//!
//! Numbered objects live at `<prefix>.<8-hex-seq>`; the volume super object
//! lives at the bare prefix.

use std::fs::{File, OpenOptions};
use std::io::{IoSlice, Read, Write};
use std::os::unix::fs::FileExt;
use std::path::PathBuf;

use eyre::{Result, WrapErr};
use tracing::debug;

use crate::error::EngineError;

/// Object identity: the super object or a numbered data/checkpoint object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectId {
    Super,
    Seq(u32),
}

/// Capability set for object storage. Anything offering these calls can back
/// a volume; calls must be thread-safe for disjoint object names.
pub trait ObjectBackend: Send + Sync {
    /// Create or replace an object from gathered buffers.
    fn write_object(&self, id: ObjectId, bufs: &[IoSlice<'_>]) -> Result<()>;

    /// Read `buf.len()` bytes at `offset`; returns bytes read (short at the
    /// end of the object).
    fn read_object(&self, id: ObjectId, buf: &mut [u8], offset: u64) -> Result<usize>;

    /// Read a whole object.
    fn read_object_full(&self, id: ObjectId) -> Result<Vec<u8>>;

    /// Remove an object. Missing objects are not an error.
    fn delete_object(&self, id: ObjectId) -> Result<()>;

    /// Display name, for logs and the file backend's paths.
    fn object_name(&self, id: ObjectId) -> String;
}

/// One file per object under a directory.
#[derive(Debug)]
pub struct FileBackend {
    dir: PathBuf,
    prefix: String,
}

impl FileBackend {
    pub fn new(dir: impl Into<PathBuf>, prefix: impl Into<String>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)
            .wrap_err_with(|| format!("failed to create backend directory {dir:?}"))?;
        Ok(Self {
            dir,
            prefix: prefix.into(),
        })
    }

    fn path(&self, id: ObjectId) -> PathBuf {
        self.dir.join(self.object_name(id))
    }

    fn open_for_read(&self, id: ObjectId) -> Result<File> {
        let path = self.path(id);
        match File::open(&path) {
            Ok(f) => Ok(f),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(EngineError::NotFound(self.object_name(id)).into())
            }
            Err(e) => Err(EngineError::Io(format!("open {path:?}: {e}")).into()),
        }
    }
}

impl ObjectBackend for FileBackend {
    fn write_object(&self, id: ObjectId, bufs: &[IoSlice<'_>]) -> Result<()> {
        let path = self.path(id);
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .map_err(|e| EngineError::Io(format!("create {path:?}: {e}")))?;
        for buf in bufs {
            file.write_all(buf)
                .map_err(|e| EngineError::Io(format!("write {path:?}: {e}")))?;
        }
        file.sync_all()
            .map_err(|e| EngineError::Io(format!("sync {path:?}: {e}")))?;
        debug!(object = %self.object_name(id), "wrote object");
        Ok(())
    }

    fn read_object(&self, id: ObjectId, buf: &mut [u8], offset: u64) -> Result<usize> {
        let file = self.open_for_read(id)?;
        let mut total = 0;
        while total < buf.len() {
            let n = file
                .read_at(&mut buf[total..], offset + total as u64)
                .map_err(|e| EngineError::Io(format!("read {}: {e}", self.object_name(id))))?;
            if n == 0 {
                break;
            }
            total += n;
        }
        Ok(total)
    }

    fn read_object_full(&self, id: ObjectId) -> Result<Vec<u8>> {
        let mut file = self.open_for_read(id)?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf)
            .map_err(|e| EngineError::Io(format!("read {}: {e}", self.object_name(id))))?;
        Ok(buf)
    }

    fn delete_object(&self, id: ObjectId) -> Result<()> {
        let path = self.path(id);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(EngineError::Io(format!("delete {path:?}: {e}")).into()),
        }
    }

    fn object_name(&self, id: ObjectId) -> String {
        match id {
            ObjectId::Super => self.prefix.clone(),
            ObjectId::Seq(seq) => format!("{}.{:08x}", self.prefix, seq),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::is_not_found;
    use tempfile::TempDir;

    fn backend() -> (TempDir, FileBackend) {
        let dir = TempDir::new().unwrap();
        let be = FileBackend::new(dir.path(), "vol").unwrap();
        (dir, be)
    }

    #[test]
    fn test_object_naming() {
        let (_dir, be) = backend();
        assert_eq!(be.object_name(ObjectId::Super), "vol");
        assert_eq!(be.object_name(ObjectId::Seq(0x1f)), "vol.0000001f");
        assert_eq!(be.object_name(ObjectId::Seq(0xdead_beef)), "vol.deadbeef");
    }

    #[test]
    fn test_write_read_round_trip() {
        let (_dir, be) = backend();
        let hdr = vec![1u8; 512];
        let payload = vec![2u8; 1024];
        be.write_object(
            ObjectId::Seq(1),
            &[IoSlice::new(&hdr), IoSlice::new(&payload)],
        )
        .unwrap();

        let full = be.read_object_full(ObjectId::Seq(1)).unwrap();
        assert_eq!(full.len(), 1536);
        assert!(full[..512].iter().all(|&b| b == 1));
        assert!(full[512..].iter().all(|&b| b == 2));

        let mut buf = vec![0u8; 256];
        let n = be.read_object(ObjectId::Seq(1), &mut buf, 512).unwrap();
        assert_eq!(n, 256);
        assert!(buf.iter().all(|&b| b == 2));
    }

    #[test]
    fn test_short_read_at_tail() {
        let (_dir, be) = backend();
        be.write_object(ObjectId::Seq(2), &[IoSlice::new(&[9u8; 100])])
            .unwrap();
        let mut buf = vec![0u8; 256];
        let n = be.read_object(ObjectId::Seq(2), &mut buf, 50).unwrap();
        assert_eq!(n, 50);
    }

    #[test]
    fn test_missing_object_is_not_found() {
        let (_dir, be) = backend();
        let err = be.read_object_full(ObjectId::Seq(77)).unwrap_err();
        assert!(is_not_found(&err));

        // Deleting a missing object succeeds.
        be.delete_object(ObjectId::Seq(77)).unwrap();
    }

    #[test]
    fn test_rewrite_truncates() {
        let (_dir, be) = backend();
        be.write_object(ObjectId::Super, &[IoSlice::new(&[1u8; 4096])])
            .unwrap();
        be.write_object(ObjectId::Super, &[IoSlice::new(&[2u8; 100])])
            .unwrap();
        let full = be.read_object_full(ObjectId::Super).unwrap();
        assert_eq!(full.len(), 100);
        assert!(full.iter().all(|&b| b == 2));
    }
}
