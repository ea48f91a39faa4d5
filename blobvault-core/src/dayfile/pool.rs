//! Bounded pool of open day files
//!
//! Every day file gets a slot that lives as long as the pool. A slot carries a
//! reference count, an optional open handle and the append state of the file.
//! At most `max_open` slots hold an open handle; when the bound is reached the
//! least recently used idle slot (reference count zero) is closed. If every
//! open slot is busy, acquirers wait for a release.
//!
//! A disabled slot (its file was expired) refuses to open again.

use crate::{BlobError, Result};
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, VecDeque};
use std::fs::{File, OpenOptions};
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

/// End-of-file counter value meaning "not resolved yet"
pub const UNKNOWN_EOF: u64 = u64::MAX;

/// Per-file append bookkeeping that survives closing and reopening
#[derive(Debug)]
pub struct AppendState {
    /// Serialises seek-to-end appends and end-of-file resolution
    pub lock: Mutex<()>,
    /// Logical end of file for positional appends
    pub eof: AtomicU64,
}

impl Default for AppendState {
    fn default() -> Self {
        Self {
            lock: Mutex::new(()),
            eof: AtomicU64::new(UNKNOWN_EOF),
        }
    }
}

#[derive(Default)]
struct Slot {
    file: Option<Arc<File>>,
    refs: usize,
    disabled: bool,
    append: Arc<AppendState>,
}

#[derive(Default)]
struct PoolState {
    slots: HashMap<String, Slot>,
    /// Slots holding an open file, least recently used first
    lru: VecDeque<String>,
}

impl PoolState {
    fn touch(&mut self, name: &str) {
        if let Some(pos) = self.lru.iter().position(|n| n == name) {
            self.lru.remove(pos);
        }
        self.lru.push_back(name.to_string());
    }

    /// Drop the slot of `name` if nothing refers to it and it carries no
    /// state worth keeping.
    fn forget_unused(&mut self, name: &str) {
        let unused = self.slots.get(name).map_or(false, |slot| {
            slot.refs == 0
                && !slot.disabled
                && slot.file.is_none()
                && Arc::strong_count(&slot.append) == 1
                && slot.append.eof.load(Ordering::Acquire) == UNKNOWN_EOF
        });
        if unused {
            self.slots.remove(name);
        }
    }

    /// Close the least recently used idle file. Returns false if all are busy.
    fn evict_idle(&mut self) -> bool {
        let victim = self
            .lru
            .iter()
            .position(|n| self.slots.get(n).map_or(true, |s| s.refs == 0));

        match victim {
            Some(pos) => {
                if let Some(name) = self.lru.remove(pos) {
                    if let Some(slot) = self.slots.get_mut(&name) {
                        slot.file = None;
                    }
                    debug!("Closed idle day file {}", name);
                }
                true
            }
            None => false,
        }
    }
}

/// Open-file pool for one backend directory
pub struct FilePool {
    dir: PathBuf,
    max_open: usize,
    state: Mutex<PoolState>,
    released: Condvar,
}

/// A referenced, open day file. Dropping it releases the reference.
pub struct PooledFile<'a> {
    pool: &'a FilePool,
    name: String,
    file: Arc<File>,
    append: Arc<AppendState>,
}

impl PooledFile<'_> {
    pub fn file(&self) -> &File {
        &self.file
    }

    pub fn append_state(&self) -> &AppendState {
        &self.append
    }
}

impl Drop for PooledFile<'_> {
    fn drop(&mut self) {
        self.pool.release(&self.name);
    }
}

impl FilePool {
    /// Create a pool over `dir` allowing `max_open` simultaneously open files
    pub fn new(dir: impl Into<PathBuf>, max_open: usize) -> Self {
        Self {
            dir: dir.into(),
            max_open: max_open.max(1),
            state: Mutex::new(PoolState::default()),
            released: Condvar::new(),
        }
    }

    /// Reference `name`, opening it if necessary.
    ///
    /// With `create` unset a missing file is reported as
    /// [`BlobError::NotFound`].
    pub fn acquire(&self, name: &str, create: bool) -> Result<PooledFile<'_>> {
        let mut state = self.state.lock();
        loop {
            let slot = state.slots.entry(name.to_string()).or_default();
            if slot.disabled {
                return Err(BlobError::PoolDisabled(name.to_string()));
            }

            if let Some(file) = slot.file.clone() {
                slot.refs += 1;
                let append = slot.append.clone();
                state.touch(name);
                return Ok(self.handle(name, file, append));
            }

            if state.lru.len() < self.max_open {
                let file = match self.open_file(name, create) {
                    Ok(file) => Arc::new(file),
                    Err(e) => {
                        state.forget_unused(name);
                        return Err(e);
                    }
                };
                let slot = state.slots.entry(name.to_string()).or_default();
                slot.file = Some(file.clone());
                slot.refs += 1;
                let append = slot.append.clone();
                state.touch(name);
                return Ok(self.handle(name, file, append));
            }

            if !state.evict_idle() {
                self.released.wait(&mut state);
            }
        }
    }

    /// Close `name` for good and refuse further opens.
    pub fn disable(&self, name: &str) {
        let mut state = self.state.lock();
        let slot = state.slots.entry(name.to_string()).or_default();
        slot.disabled = true;
        slot.file = None;
        if let Some(pos) = state.lru.iter().position(|n| n == name) {
            state.lru.remove(pos);
        }
        self.released.notify_all();
    }

    /// Number of currently open files
    pub fn open_count(&self) -> usize {
        self.state.lock().lru.len()
    }

    /// Number of files the pool keeps bookkeeping for
    pub fn slot_count(&self) -> usize {
        self.state.lock().slots.len()
    }

    fn release(&self, name: &str) {
        let mut state = self.state.lock();
        if let Some(slot) = state.slots.get_mut(name) {
            slot.refs = slot.refs.saturating_sub(1);
        }
        self.released.notify_all();
    }

    fn handle(&self, name: &str, file: Arc<File>, append: Arc<AppendState>) -> PooledFile<'_> {
        PooledFile {
            pool: self,
            name: name.to_string(),
            file,
            append,
        }
    }

    fn open_file(&self, name: &str, create: bool) -> Result<File> {
        let path = self.dir.join(name);
        OpenOptions::new()
            .read(true)
            .write(true)
            .create(create)
            .open(&path)
            .map_err(|e| match e.kind() {
                ErrorKind::NotFound => BlobError::NotFound(format!("day file {}", name)),
                _ => BlobError::Io(e),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    #[test]
    fn test_acquire_creates_and_reuses() {
        let temp_dir = TempDir::new().unwrap();
        let pool = FilePool::new(temp_dir.path(), 4);

        {
            let handle = pool.acquire("20240110", true).unwrap();
            let mut file = handle.file();
            file.write_all(b"abc").unwrap();
        }
        assert!(temp_dir.path().join("20240110").exists());

        let handle = pool.acquire("20240110", false).unwrap();
        assert_eq!(handle.file().metadata().unwrap().len(), 3);
        assert_eq!(pool.open_count(), 1);
    }

    #[test]
    fn test_missing_file_without_create() {
        let temp_dir = TempDir::new().unwrap();
        let pool = FilePool::new(temp_dir.path(), 4);
        let err = pool.acquire("20240110", false).err().unwrap();
        assert!(matches!(err, BlobError::NotFound(_)));
    }

    #[test]
    fn test_missing_files_leave_no_slots() {
        let temp_dir = TempDir::new().unwrap();
        let pool = FilePool::new(temp_dir.path(), 4);
        drop(pool.acquire("20240101", true).unwrap());

        for day in 0..1000 {
            let name = format!("{:08}", 30000000 + day);
            assert!(pool.acquire(&name, false).is_err());
        }
        assert_eq!(pool.slot_count(), 1);
    }

    #[test]
    fn test_bound_evicts_idle_files() {
        let temp_dir = TempDir::new().unwrap();
        let pool = FilePool::new(temp_dir.path(), 2);

        for name in ["20240101", "20240102", "20240103", "20240104"] {
            drop(pool.acquire(name, true).unwrap());
            assert!(pool.open_count() <= 2);
        }
        assert_eq!(pool.open_count(), 2);
    }

    #[test]
    fn test_busy_files_are_not_evicted() {
        let temp_dir = TempDir::new().unwrap();
        let pool = FilePool::new(temp_dir.path(), 2);

        let busy = pool.acquire("20240101", true).unwrap();
        drop(pool.acquire("20240102", true).unwrap());
        drop(pool.acquire("20240103", true).unwrap());

        // The busy file is still referenced and open.
        assert_eq!(pool.open_count(), 2);
        assert!(busy.file().metadata().is_ok());
    }

    #[test]
    fn test_waiter_is_woken_by_release() {
        let temp_dir = TempDir::new().unwrap();
        let pool = Arc::new(FilePool::new(temp_dir.path(), 1));

        let held = pool.acquire("20240101", true).unwrap();
        let waiter = {
            let pool = pool.clone();
            std::thread::spawn(move || {
                pool.acquire("20240102", true).map(|_| ()).is_ok()
            })
        };
        std::thread::sleep(std::time::Duration::from_millis(50));
        drop(held);
        assert!(waiter.join().unwrap());
    }

    #[test]
    fn test_disabled_file_refuses_open() {
        let temp_dir = TempDir::new().unwrap();
        let pool = FilePool::new(temp_dir.path(), 2);

        drop(pool.acquire("20240101", true).unwrap());
        pool.disable("20240101");
        assert_eq!(pool.open_count(), 0);

        let err = pool.acquire("20240101", true).err().unwrap();
        assert!(matches!(err, BlobError::PoolDisabled(_)));
    }
}
