//! Day-file backend
//!
//! One append-only file per UTC day, named `YYYYMMDD`, inside the backend
//! directory. Keys are three zig-zag varints: day number, record offset and
//! framed record length. Expiry unlinks whole day files.

mod pool;
mod record;

pub use pool::{AppendState, FilePool, PooledFile};
pub use record::{frame, read_record, AppendMode, RECORD_HEADER};

use crate::codec::varint::{put_varint, read_varint, MAX_VARINT_LEN};
use crate::compression::Compressed;
use crate::config::StorageConfig;
use crate::storage::BlobStorage;
use crate::{BlobError, Cutoff, DayKey, Result, Timestamp};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Day-file backend
pub struct DayFileStorage {
    dir: PathBuf,
    pool: FilePool,
    mode: AppendMode,
    sizes: SizeTracker,
    capacity: i64,
    cutoff: Cutoff,
    /// Stores hold it shared, expiry exclusively, so no append lands in a
    /// file that is being unlinked.
    expire_lock: RwLock<()>,
}

impl DayFileStorage {
    /// Open the backend in `dir`, picking up existing day files
    pub fn open(dir: &Path, config: &StorageConfig) -> Result<Self> {
        fs::create_dir_all(dir)?;

        let sizes = SizeTracker::default();
        let mut found = 0;
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if DayKey::parse(&name).is_some() {
                sizes.set_file(&name, entry.metadata()?.len() as i64);
                found += 1;
            }
        }
        info!("Opened day-file storage {:?} with {} day files", dir, found);

        Ok(Self {
            dir: dir.to_path_buf(),
            pool: FilePool::new(dir, config.max_open_files()),
            mode: AppendMode::from_config(config),
            sizes,
            capacity: config.capacity_bytes(),
            cutoff: Cutoff::new(),
            expire_lock: RwLock::new(()),
        })
    }

    /// Bytes currently accounted to day files
    pub fn used_bytes(&self) -> i64 {
        self.sizes.total()
    }

    fn parse_key(key: &[u8]) -> Result<(DayKey, u64, usize)> {
        let invalid = || BlobError::InvalidKey(format!("{} byte day-file key", key.len()));

        let (day, used) = read_varint(key).ok_or_else(invalid)?;
        let rest = &key[used..];
        let (offset, used) = read_varint(rest).ok_or_else(invalid)?;
        let rest = &rest[used..];
        let (len, _) = read_varint(rest).ok_or_else(invalid)?;

        if offset < 0 || len < RECORD_HEADER as i64 {
            return Err(invalid());
        }
        Ok((DayKey::from_day_number(day), offset as u64, len as usize))
    }
}

impl BlobStorage for DayFileStorage {
    fn store(&self, blob: &[u8], at: Timestamp) -> Result<Vec<u8>> {
        let day = DayKey::from_timestamp(at);
        let record = frame(&Compressed::new(blob)?)?;

        let _guard = self.expire_lock.read();
        self.cutoff.admit(at)?;
        let offset = {
            let handle = self.pool.acquire(day.as_str(), true)?;
            self.mode
                .append(handle.file(), handle.append_state(), &record)?
        };
        self.sizes.add_file(day.as_str(), record.len() as i64);

        let mut key = Vec::with_capacity(3 * MAX_VARINT_LEN);
        put_varint(day.day_number(), &mut key);
        put_varint(offset as i64, &mut key);
        put_varint(record.len() as i64, &mut key);
        Ok(key)
    }

    fn load_into(&self, key: &[u8], into: &mut Vec<u8>) -> Result<usize> {
        let (day, offset, len) = Self::parse_key(key)?;

        if let Some(cutoff_day) = self.cutoff.day() {
            if day < cutoff_day {
                return Err(BlobError::NotFound(format!("day {} has expired", day)));
            }
        }

        let handle = self.pool.acquire(day.as_str(), false)?;
        read_record(handle.file(), offset, len, into)
    }

    fn expire(&self, cutoff: Timestamp) -> Result<()> {
        let _guard = self.expire_lock.write();
        self.cutoff.raise(cutoff);
        let cutoff_day = match self.cutoff.day() {
            Some(day) => day,
            None => return Ok(()),
        };

        let mut removed = 0;
        let mut first_error = None;
        for entry in fs::read_dir(&self.dir)? {
            let name = entry?.file_name().to_string_lossy().to_string();
            match DayKey::parse(&name) {
                Some(day) if day < cutoff_day => {}
                _ => continue,
            }

            self.pool.disable(&name);
            match fs::remove_file(self.dir.join(&name)) {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => {
                    warn!("Failed to remove expired day file {}: {}", name, e);
                    first_error.get_or_insert(e);
                }
            }
            self.sizes.set_file(&name, 0);
        }

        info!(
            "Expired {} day files before {} in {:?}",
            removed, cutoff_day, self.dir
        );
        match first_error {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }

    fn free_capacity(&self) -> i64 {
        (self.capacity - self.sizes.total()).max(0)
    }
}

/// Per-file byte accounting
#[derive(Default)]
struct SizeTracker {
    inner: Mutex<SizeState>,
}

#[derive(Default)]
struct SizeState {
    files: HashMap<String, i64>,
    total: i64,
}

impl SizeTracker {
    fn set_file(&self, name: &str, size: i64) {
        let mut state = self.inner.lock();
        let previous = if size != 0 {
            state.files.insert(name.to_string(), size)
        } else {
            state.files.remove(name)
        };
        state.total += size - previous.unwrap_or(0);
    }

    fn add_file(&self, name: &str, diff: i64) {
        let mut state = self.inner.lock();
        *state.files.entry(name.to_string()).or_insert(0) += diff;
        state.total += diff;
    }

    fn total(&self) -> i64 {
        self.inner.lock().total
    }
}
