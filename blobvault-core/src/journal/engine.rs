//! Journal-backed storage engine
//!
//! Layout of `journal.dat`:
//!
//! ```text
//! 0                 8                                JOURNAL_SIZE
//! | master pointer  | write-ahead region             | data region ...
//! ```
//!
//! The master record (32 bytes, big-endian) holds the handles of the day
//! index, the freed-bytes counter and the free list head, plus padding.
//! Handles are absolute file offsets; 0 means none.
//!
//! `store` and `expire` run under one lock. Each store is one transaction
//! that reserves and links extents; the payload is written after the commit.
//! Each reclaimed day bucket is its own transaction. `load` reads committed
//! extents without the lock.

use super::blocklist::{self, Extent, ExtentHeader, ListHead, EXTENT_HEADER};
use super::pager::Pager;
use super::skiplist::SkipList;
use super::wal::{SyncPolicy, JOURNAL_SIZE};
use crate::compression::{unframe, Compressed, LENGTH_PREFIX};
use crate::config::{StorageConfig, OPTION_NOSYNC};
use crate::storage::BlobStorage;
use crate::{BlobError, Cutoff, DayKey, Result, Timestamp};
use bytes::{Buf, BufMut};
use parking_lot::Mutex;
use std::fs::File;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Data file inside the backend directory
pub const DATA_FILE: &str = "journal.dat";

/// Size of the master record
pub const MASTER_RECORD: u64 = 32;

const MASTER_POINTER: u64 = 0;

/// Root handles of the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MasterRecord {
    pub day_index: u64,
    pub track_record: u64,
    pub free_block_list: u64,
}

impl MasterRecord {
    fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(MASTER_RECORD as usize);
        buf.put_u64(self.day_index);
        buf.put_u64(self.track_record);
        buf.put_u64(self.free_block_list);
        buf.put_u64(0);
        buf
    }

    fn decode(raw: &[u8]) -> Self {
        let mut cursor = raw;
        Self {
            day_index: cursor.get_u64(),
            track_record: cursor.get_u64(),
            free_block_list: cursor.get_u64(),
        }
    }

    /// Lay out an empty engine inside the open transaction
    fn create(pager: &mut Pager) -> Self {
        let record = pager.allocate(MASTER_RECORD);
        let master = Self {
            day_index: SkipList::create(pager),
            track_record: pager.allocate(8),
            free_block_list: ListHead::create(pager),
        };
        pager.write_u64(master.track_record, 0);
        pager.write(record, &master.encode());
        pager.write_u64(MASTER_POINTER, record);
        master
    }

    fn load(pager: &Pager) -> Result<Self> {
        let record = pager.read_u64(MASTER_POINTER)?;
        let end = pager.committed_end();
        if record < JOURNAL_SIZE || record + MASTER_RECORD > end {
            return Err(BlobError::Corruption(format!(
                "master pointer {} outside the data region",
                record
            )));
        }

        let master = Self::decode(&pager.read(record, MASTER_RECORD as usize)?);
        for handle in [master.day_index, master.track_record, master.free_block_list] {
            if handle < JOURNAL_SIZE || handle >= end {
                return Err(BlobError::Corruption(format!(
                    "master record handle {} outside the data region",
                    handle
                )));
            }
        }
        Ok(master)
    }
}

/// State behind the writer lock
struct Journal {
    pager: Pager,
    master: MasterRecord,
    index: SkipList,
}

impl Journal {
    fn read_freed(&self) -> Result<i64> {
        Ok(self.pager.read_u64(self.master.track_record)? as i64)
    }

    fn write_freed(&mut self, freed: i64) {
        self.pager.write_u64(self.master.track_record, freed.max(0) as u64);
    }

    /// Reserve and link extents for `len` bytes in the bucket of `day`
    fn reserve(&mut self, day: &DayKey, len: u64) -> Result<Vec<Extent>> {
        let bucket = match self.index.get(&self.pager, day.as_bytes())? {
            Some(bucket) => bucket,
            None => {
                let bucket = ListHead::create(&mut self.pager);
                self.index.insert(&mut self.pager, day.as_bytes(), bucket)?;
                debug!("Created journal bucket {} at {}", day, bucket);
                bucket
            }
        };

        let allocation = blocklist::allocate(&mut self.pager, self.master.free_block_list, len)?;
        blocklist::chainify(&mut self.pager, bucket, &allocation.extents)?;

        if allocation.reclaimed > 0 {
            let freed = self.read_freed()? - allocation.reclaimed as i64;
            self.write_freed(freed);
        }
        Ok(allocation.extents)
    }

    /// Move the oldest bucket before `bound` to the free list
    fn reclaim_next(&mut self, bound: &DayKey) -> Result<Option<(Vec<u8>, ListHead)>> {
        let (day, bucket) = match self
            .index
            .consume_first_below(&mut self.pager, bound.as_bytes())?
        {
            Some(entry) => entry,
            None => return Ok(None),
        };

        let list = ListHead::read(&self.pager, bucket)?;
        blocklist::splice(&mut self.pager, self.master.free_block_list, &list)?;
        let freed = self.read_freed()? + list.total as i64;
        self.write_freed(freed);
        Ok(Some((day, list)))
    }

    /// Flag the extents of a reclaimed bucket so stale keys stop loading
    fn stamp_free(&self, list: &ListHead) -> Result<()> {
        let file = self.pager.file();
        let mut offset = list.first;
        let mut budget = list.total / EXTENT_HEADER + 1;
        while offset != 0 && budget > 0 {
            let header = ExtentHeader::read_at(&file, offset)?;
            self.pager
                .write_direct(offset + 12, &header.free_marker())?;
            if offset == list.last {
                break;
            }
            offset = header.next;
            budget -= 1;
        }
        self.pager.sync_direct()
    }
}

/// Journal-backed storage engine
pub struct JournalStorage {
    inner: Mutex<Journal>,
    file: Arc<File>,
    /// Committed end of file
    data_end: AtomicU64,
    /// Cached freed-bytes counter
    freed: AtomicI64,
    capacity: i64,
    cutoff: Cutoff,
}

impl JournalStorage {
    /// Open the engine in `dir`, creating or recovering `journal.dat`
    pub fn open(dir: &Path, config: &StorageConfig) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(DATA_FILE);
        let sync = if config.has_option(OPTION_NOSYNC) {
            SyncPolicy::None
        } else {
            SyncPolicy::Immediate
        };

        let (mut pager, fresh) = Pager::open(&path, sync)?;
        let master = if fresh {
            let master = MasterRecord::create(&mut pager);
            pager.commit()?;
            info!("Created journal {:?}", path);
            master
        } else {
            MasterRecord::load(&pager)?
        };

        let index = SkipList::open(&pager, master.day_index)?;
        let journal = Journal {
            pager,
            master,
            index,
        };
        let freed = journal.read_freed()?;
        let data_end = journal.pager.committed_end();

        info!(
            "Opened journal storage {:?}: {} data bytes, {} freed",
            dir,
            data_end - JOURNAL_SIZE,
            freed
        );

        Ok(Self {
            file: journal.pager.file(),
            inner: Mutex::new(journal),
            data_end: AtomicU64::new(data_end),
            freed: AtomicI64::new(freed),
            capacity: config.capacity_bytes(),
            cutoff: Cutoff::new(),
        })
    }

    /// Day buckets currently indexed
    pub fn days(&self) -> Result<Vec<DayKey>> {
        let journal = self.inner.lock();
        Ok(journal
            .index
            .entries(&journal.pager)?
            .into_iter()
            .filter_map(|(key, _)| DayKey::from_bytes(&key))
            .collect())
    }

    /// Bytes sitting on the free list
    pub fn freed_bytes(&self) -> i64 {
        self.freed.load(Ordering::Acquire)
    }

    fn publish(&self, journal: &Journal) -> Result<()> {
        self.data_end
            .store(journal.pager.committed_end(), Ordering::Release);
        self.freed.store(journal.read_freed()?, Ordering::Release);
        Ok(())
    }

    fn parse_key(&self, key: &[u8]) -> Result<u64> {
        let raw: [u8; 8] = key
            .try_into()
            .map_err(|_| BlobError::InvalidKey(format!("{} byte journal key", key.len())))?;
        let offset = u64::from_be_bytes(raw);
        let end = self.data_end.load(Ordering::Acquire);
        if offset < JOURNAL_SIZE || offset.saturating_add(EXTENT_HEADER) > end {
            return Err(BlobError::InvalidKey(format!(
                "journal offset {} outside the data region",
                offset
            )));
        }
        Ok(offset)
    }
}

impl BlobStorage for JournalStorage {
    fn store(&self, blob: &[u8], at: Timestamp) -> Result<Vec<u8>> {
        self.cutoff.admit(at)?;

        let day = DayKey::from_timestamp(at);
        let framed = Compressed::new(blob)?.framed();

        let mut journal = self.inner.lock();
        let extents = match journal.reserve(&day, framed.len() as u64) {
            Ok(extents) => extents,
            Err(e) => {
                journal.pager.rollback();
                return Err(e);
            }
        };
        journal.pager.commit()?;
        self.publish(&journal)?;

        let mut rest = &framed[..];
        for extent in &extents {
            let (piece, tail) = rest.split_at(extent.used as usize);
            journal.pager.write_direct(extent.payload_offset(), piece)?;
            rest = tail;
        }
        journal.pager.sync_direct()?;

        let key = extents
            .first()
            .map(|extent| extent.offset)
            .ok_or_else(|| BlobError::Corruption("allocation returned no extents".into()))?;
        Ok(key.to_be_bytes().to_vec())
    }

    /// Keys are extent offsets. An expired key fails with `NotFound` until
    /// its extent is handed out again; after that it reads the new blob.
    fn load_into(&self, key: &[u8], into: &mut Vec<u8>) -> Result<usize> {
        let first = self.parse_key(key)?;
        let end = self.data_end.load(Ordering::Acquire);

        into.clear();
        let mut offset = first;
        let mut budget = (end - JOURNAL_SIZE) / EXTENT_HEADER;
        loop {
            if budget == 0 || offset < JOURNAL_SIZE || offset + EXTENT_HEADER > end {
                return Err(BlobError::Corruption(format!(
                    "extent chain from {} breaks at {}",
                    first, offset
                )));
            }
            budget -= 1;

            let header = ExtentHeader::read_at(&self.file, offset)?;
            if header.free {
                return Err(BlobError::NotFound(format!(
                    "blob at {} has expired",
                    first
                )));
            }
            if header.used > header.cap
                || offset + EXTENT_HEADER + header.used as u64 > end
            {
                return Err(BlobError::Corruption(format!(
                    "extent at {} claims {} of {} bytes",
                    offset, header.used, header.cap
                )));
            }

            let start = into.len();
            into.resize(start + header.used as usize, 0);
            self.file
                .read_exact_at(&mut into[start..], offset + EXTENT_HEADER)?;

            if header.end_of_blob {
                break;
            }
            if header.next == 0 {
                return Err(BlobError::Corruption(format!(
                    "extent chain from {} ends without end-of-blob",
                    first
                )));
            }
            offset = header.next;
        }

        let (decompressed_len, _) = unframe(into)?;
        into.drain(..LENGTH_PREFIX);
        Ok(decompressed_len as usize)
    }

    fn expire(&self, cutoff: Timestamp) -> Result<()> {
        self.cutoff.raise(cutoff);
        // A lower cutoff still resumes an interrupted pass at the current one.
        let bound = match self.cutoff.day() {
            Some(day) => day,
            None => return Ok(()),
        };

        let mut journal = self.inner.lock();
        let mut reclaimed = 0;
        loop {
            let (day, list) = match journal.reclaim_next(&bound) {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => {
                    journal.pager.rollback();
                    return Err(e);
                }
            };
            journal.pager.commit()?;
            self.publish(&journal)?;

            if let Err(e) = journal.stamp_free(&list) {
                warn!("Failed to mark reclaimed extents free: {}", e);
            }
            debug!(
                "Reclaimed journal bucket {} ({} bytes)",
                String::from_utf8_lossy(&day),
                list.total
            );
            reclaimed += 1;
        }

        info!(
            "Expired {} journal buckets before {}, {} bytes freed",
            reclaimed,
            bound,
            self.freed_bytes()
        );
        Ok(())
    }

    fn free_capacity(&self) -> i64 {
        let used = self.data_end.load(Ordering::Acquire) - JOURNAL_SIZE;
        (self.capacity - used as i64 + self.freed_bytes()).max(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Size;
    use crate::types::ts;
    use rand::RngCore;
    use tempfile::TempDir;

    fn config() -> StorageConfig {
        StorageConfig::new("journal", Size::mib(16)).with_option(OPTION_NOSYNC)
    }

    fn open(dir: &TempDir) -> JournalStorage {
        JournalStorage::open(dir.path(), &config()).unwrap()
    }

    #[test]
    fn test_master_record_layout() {
        let master = MasterRecord {
            day_index: JOURNAL_SIZE + 32,
            track_record: JOURNAL_SIZE + 160,
            free_block_list: JOURNAL_SIZE + 168,
        };
        let raw = master.encode();
        assert_eq!(raw.len(), MASTER_RECORD as usize);
        assert_eq!(&raw[24..], &[0; 8]);
        assert_eq!(MasterRecord::decode(&raw), master);
    }

    #[test]
    fn test_store_load() {
        let temp_dir = TempDir::new().unwrap();
        let storage = open(&temp_dir);

        let key = storage.store(b"hello", ts(2024, 1, 10)).unwrap();
        assert_eq!(key.len(), 8);
        assert!(u64::from_be_bytes(key.clone().try_into().unwrap()) >= JOURNAL_SIZE);

        let loaded = storage.load(&key).unwrap();
        assert_eq!(loaded.decompressed_len, 0);
        assert_eq!(loaded.data, b"hello".to_vec());
    }

    #[test]
    fn test_compressible_blob() {
        let temp_dir = TempDir::new().unwrap();
        let storage = open(&temp_dir);

        let blob = vec![b'a'; 50_000];
        let key = storage.store(&blob, ts(2024, 1, 10)).unwrap();
        let loaded = storage.load(&key).unwrap();
        assert_eq!(loaded.decompressed_len, blob.len());
        assert!(loaded.data.len() < blob.len());
        assert_eq!(loaded.decompress().unwrap(), blob);
    }

    #[test]
    fn test_reopen() {
        let temp_dir = TempDir::new().unwrap();
        let keys: Vec<_> = {
            let storage = open(&temp_dir);
            (1..=5)
                .map(|day| {
                    let blob = vec![day as u8; 100 * day as usize];
                    (storage.store(&blob, ts(2024, 1, day)).unwrap(), blob)
                })
                .collect()
        };

        let storage = open(&temp_dir);
        assert_eq!(storage.days().unwrap().len(), 5);
        for (key, blob) in keys {
            assert_eq!(storage.load(&key).unwrap().decompress().unwrap(), blob);
        }
    }

    #[test]
    fn test_expire_frees_buckets() {
        let temp_dir = TempDir::new().unwrap();
        let storage = open(&temp_dir);

        let old = storage.store(b"old", ts(2024, 1, 5)).unwrap();
        let boundary = storage.store(b"boundary", ts(2024, 1, 8)).unwrap();
        let new = storage.store(b"new", ts(2024, 1, 10)).unwrap();

        let before = storage.free_capacity();
        storage.expire(ts(2024, 1, 8)).unwrap();

        assert!(storage.free_capacity() > before);
        assert_eq!(storage.freed_bytes(), (EXTENT_HEADER + 7) as i64);
        assert!(matches!(storage.load(&old), Err(BlobError::NotFound(_))));
        assert_eq!(storage.load(&boundary).unwrap().data, b"boundary".to_vec());
        assert_eq!(storage.load(&new).unwrap().data, b"new".to_vec());
        assert_eq!(
            storage.days().unwrap(),
            vec![
                DayKey::from_timestamp(ts(2024, 1, 8)),
                DayKey::from_timestamp(ts(2024, 1, 10))
            ]
        );
    }

    #[test]
    fn test_freed_space_is_reused() {
        let temp_dir = TempDir::new().unwrap();
        let storage = open(&temp_dir);

        let mut rng = rand::thread_rng();
        let mut blob = vec![0u8; 4096];
        for day in 1..=3 {
            rng.fill_bytes(&mut blob);
            storage.store(&blob, ts(2024, 1, day)).unwrap();
        }
        storage.expire(ts(2024, 1, 4)).unwrap();
        let freed = storage.freed_bytes();
        assert_eq!(freed, 3 * (EXTENT_HEADER as i64 + 4100));

        let end = storage.data_end.load(Ordering::Acquire);
        rng.fill_bytes(&mut blob);
        let key = storage.store(&blob, ts(2024, 1, 5)).unwrap();

        // Served from the free list: the file did not grow for the extent.
        assert!(u64::from_be_bytes(key.clone().try_into().unwrap()) < end);
        assert_eq!(storage.freed_bytes(), freed - (EXTENT_HEADER as i64 + 4100));
        assert_eq!(storage.load(&key).unwrap().data, blob);
    }

    #[test]
    fn test_stale_key_after_reuse() {
        let temp_dir = TempDir::new().unwrap();
        let storage = open(&temp_dir);

        let old = storage.store(b"old", ts(2024, 1, 1)).unwrap();
        storage.expire(ts(2024, 1, 2)).unwrap();
        assert!(matches!(storage.load(&old), Err(BlobError::NotFound(_))));

        let new = storage.store(b"new", ts(2024, 1, 3)).unwrap();
        assert_eq!(new, old);
        assert_eq!(storage.load(&old).unwrap().data, b"new".to_vec());
    }

    #[test]
    fn test_blob_spanning_freed_extents() {
        let temp_dir = TempDir::new().unwrap();
        let storage = open(&temp_dir);

        let mut rng = rand::thread_rng();
        for day in 1..=4 {
            let mut small = vec![0u8; 500];
            rng.fill_bytes(&mut small);
            storage.store(&small, ts(2024, 1, day)).unwrap();
        }
        storage.expire(ts(2024, 1, 5)).unwrap();

        let mut blob = vec![0u8; 3000];
        rng.fill_bytes(&mut blob);
        let key = storage.store(&blob, ts(2024, 1, 6)).unwrap();
        assert_eq!(storage.load(&key).unwrap().data, blob);
        assert_eq!(storage.freed_bytes(), 0);
    }

    #[test]
    fn test_store_before_cutoff_is_refused() {
        let temp_dir = TempDir::new().unwrap();
        let storage = open(&temp_dir);

        storage.expire(ts(2024, 1, 8)).unwrap();
        assert!(storage
            .store(b"late", ts(2024, 1, 7))
            .unwrap_err()
            .is_policy_rejection());
    }

    #[test]
    fn test_free_capacity() {
        let temp_dir = TempDir::new().unwrap();
        let storage = open(&temp_dir);
        let start = storage.free_capacity();
        assert!(start <= 16 << 20);

        let mut blob = vec![0u8; 10_000];
        rand::thread_rng().fill_bytes(&mut blob);
        storage.store(&blob, ts(2024, 1, 1)).unwrap();
        assert!(storage.free_capacity() <= start - 10_000);

        let tiny = JournalStorage::open(
            &temp_dir.path().join("tiny"),
            &StorageConfig::new("journal", Size::default()).with_option(OPTION_NOSYNC),
        )
        .unwrap();
        assert_eq!(tiny.free_capacity(), 0);
    }

    #[test]
    fn test_invalid_keys() {
        let temp_dir = TempDir::new().unwrap();
        let storage = open(&temp_dir);
        storage.store(b"x", ts(2024, 1, 1)).unwrap();

        assert!(matches!(storage.load(b"1234"), Err(BlobError::InvalidKey(_))));
        assert!(matches!(
            storage.load(&8u64.to_be_bytes()),
            Err(BlobError::InvalidKey(_))
        ));
        assert!(matches!(
            storage.load(&u64::MAX.to_be_bytes()),
            Err(BlobError::InvalidKey(_))
        ));
    }

    #[test]
    fn test_crash_before_apply_is_replayed() {
        let temp_dir = TempDir::new().unwrap();
        {
            let storage = open(&temp_dir);
            storage.store(b"committed", ts(2024, 1, 1)).unwrap();

            let mut journal = storage.inner.lock();
            let day = DayKey::from_timestamp(ts(2024, 1, 2));
            journal.reserve(&day, 64).unwrap();
            journal.pager.log_only().unwrap();
        }

        let storage = open(&temp_dir);
        assert_eq!(storage.days().unwrap().len(), 2);
    }

    #[test]
    fn test_uncommitted_transaction_is_invisible() {
        let temp_dir = TempDir::new().unwrap();
        let end = {
            let storage = open(&temp_dir);
            storage.store(b"committed", ts(2024, 1, 1)).unwrap();
            let end = storage.data_end.load(Ordering::Acquire);

            let mut journal = storage.inner.lock();
            let day = DayKey::from_timestamp(ts(2024, 1, 2));
            journal.reserve(&day, 64).unwrap();
            // Dropped without commit.
            end
        };

        let storage = open(&temp_dir);
        assert_eq!(storage.days().unwrap().len(), 1);
        assert_eq!(storage.data_end.load(Ordering::Acquire), end);
    }
}
