//! Completion handles for asynchronous acknowledgement.
//!
//! A write is handed to the write cache and acknowledged later, once its
//! journal record is durable. The handle is shared between the submitter and
//! the commit path; buffers are owned by the job, so nothing here borrows
//! from the submitting stack frame.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::cachedev::CacheDevice;
use eyre::Result;

/// Shared completion state for one submitted operation.
#[derive(Debug, Default)]
pub struct Completion {
    done: AtomicBool,
    error: Mutex<Option<String>>,
    cv: Condvar,
    lock: Mutex<()>,
}

impl Completion {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Mark successful; wakes waiters.
    pub fn complete(&self) {
        let _guard = self.lock.lock();
        self.done.store(true, Ordering::Release);
        self.cv.notify_all();
    }

    /// Mark failed; wakes waiters with the message.
    pub fn fail(&self, error: String) {
        let _guard = self.lock.lock();
        *self.error.lock() = Some(error);
        self.done.store(true, Ordering::Release);
        self.cv.notify_all();
    }

    pub fn is_complete(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    /// Block until the operation settles.
    pub fn wait(&self) -> Result<(), String> {
        let mut guard = self.lock.lock();
        while !self.done.load(Ordering::Acquire) {
            self.cv.wait(&mut guard);
        }
        drop(guard);
        match self.error.lock().take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// A prepared cache-device read, returned by `WriteCache::async_read`. The
/// caller runs it after dropping the cache lock.
pub struct ReadRequest {
    dev: Arc<dyn CacheDevice>,
    offset: u64,
    len: usize,
}

impl ReadRequest {
    pub fn new(dev: Arc<dyn CacheDevice>, offset: u64, len: usize) -> Self {
        Self { dev, offset, len }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Perform the read into `buf`, which must be exactly `len` bytes.
    pub fn run(&self, buf: &mut [u8]) -> Result<()> {
        debug_assert_eq!(buf.len(), self.len);
        self.dev.read_at(buf, self.offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_complete_wakes_waiter() {
        let c = Completion::new();
        let c2 = Arc::clone(&c);
        let h = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            c2.complete();
        });
        assert_eq!(c.wait(), Ok(()));
        assert!(c.is_complete());
        h.join().unwrap();
    }

    #[test]
    fn test_fail_carries_message() {
        let c = Completion::new();
        c.fail("device gone".into());
        assert_eq!(c.wait(), Err("device gone".into()));
    }

    #[test]
    fn test_wait_after_complete_returns_immediately() {
        let c = Completion::new();
        c.complete();
        assert_eq!(c.wait(), Ok(()));
    }
}
