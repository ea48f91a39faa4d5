//! B-tree allocator backend
//!
//! One record file per instance. Record 1 holds the handle of the current
//! day index record (day-key to the head of that day's chunk list). Every
//! store writes a fresh index copy, syncs it, then swings record 1 to it, so
//! a torn write never damages the index that is in effect. A blob is split into
//! chunks of at most 64 KiB, each stored as its own record:
//!
//! - 8 bytes: next handle, big-endian
//! - 1 byte: flags (has-next, has-more)
//! - chunk bytes; the first chunk starts with the 4-byte decompressed length
//!
//! Chunks are linked newest first. The last chunk of a blob points at the
//! previous head of the day with has-more cleared, which is where a load
//! stops. Chunks are never reclaimed.

mod records;

pub use records::{Records, ATOM};

use crate::compression::{unframe, Compressed};
use crate::config::StorageConfig;
use crate::storage::BlobStorage;
use crate::{BlobError, Cutoff, DayKey, Result, Timestamp};
use bytes::{Buf, BufMut};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, info, warn};

/// Data file inside the backend directory
pub const DATA_FILE: &str = "btree.dat";

/// Largest chunk stored in one record
pub const CHUNK_SIZE: usize = 0x10000;

const ROOT_HANDLE: u64 = 1;
const CHUNK_HEADER: usize = 9;
const HAS_NEXT: u8 = 1;
const HAS_MORE: u8 = 2;

type DayIndex = BTreeMap<[u8; DayKey::LEN], u64>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct ChunkHeader {
    next: u64,
    has_next: bool,
    has_more: bool,
}

impl ChunkHeader {
    fn encode(&self, buf: &mut Vec<u8>) {
        let mut flags = 0;
        if self.has_next {
            flags |= HAS_NEXT;
        }
        if self.has_more {
            flags |= HAS_MORE;
        }
        buf.put_u64(self.next);
        buf.put_u8(flags);
    }

    fn decode(record: &[u8]) -> Result<(Self, &[u8])> {
        if record.len() < CHUNK_HEADER {
            return Err(BlobError::Corruption(format!(
                "chunk record of {} bytes",
                record.len()
            )));
        }
        let mut cursor = record;
        let next = cursor.get_u64();
        let flags = cursor.get_u8();
        let header = Self {
            next,
            has_next: flags & HAS_NEXT != 0,
            has_more: flags & HAS_MORE != 0,
        };
        Ok((header, &record[CHUNK_HEADER..]))
    }

    /// Whether the next record belongs to the same blob
    fn continues(&self) -> bool {
        self.has_next && self.has_more
    }
}

/// Day index together with the record currently holding it
struct IndexState {
    days: DayIndex,
    handle: u64,
}

/// B-tree allocator backend
pub struct BTreeStorage {
    records: Records,
    index: Mutex<IndexState>,
    cutoff: Cutoff,
}

impl BTreeStorage {
    /// Open the backend in `dir`
    pub fn open(dir: &Path, _config: &StorageConfig) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let records = Records::open(&dir.join(DATA_FILE))?;

        if records.is_empty() {
            let root = records.alloc(&0u64.to_be_bytes())?;
            if root != ROOT_HANDLE {
                return Err(BlobError::Corruption(format!(
                    "index root landed on handle {}",
                    root
                )));
            }
        }

        let root = records.get(ROOT_HANDLE)?;
        let handle = <[u8; 8]>::try_from(root.as_slice())
            .map(u64::from_be_bytes)
            .map_err(|_| BlobError::Corruption(format!("index root of {} bytes", root.len())))?;

        // Handle 0 means the first index was never swung in.
        let index = if handle == 0 {
            let days = DayIndex::new();
            let handle = records.alloc(&encode_index(&days)?)?;
            records.sync()?;
            records.set(ROOT_HANDLE, &handle.to_be_bytes())?;
            IndexState { days, handle }
        } else {
            let days = bincode::deserialize(&records.get(handle)?)
                .map_err(|e| BlobError::Corruption(format!("day index: {}", e)))?;
            IndexState { days, handle }
        };

        info!(
            "Opened btree storage {:?} with {} day buckets",
            dir,
            index.days.len()
        );

        Ok(Self {
            records,
            index: Mutex::new(index),
            cutoff: Cutoff::new(),
        })
    }

    /// Day buckets that hold at least one blob
    pub fn days(&self) -> Vec<DayKey> {
        self.index
            .lock()
            .days
            .keys()
            .filter_map(|key| DayKey::from_bytes(key))
            .collect()
    }

    /// Persist `days` as a new index record and point the root at it.
    fn swap_index(&self, days: &DayIndex) -> Result<u64> {
        let handle = self.records.alloc(&encode_index(days)?)?;
        let swung = self
            .records
            .sync()
            .and_then(|_| self.records.set(ROOT_HANDLE, &handle.to_be_bytes()));
        if let Err(e) = swung {
            if let Err(free_err) = self.records.free(handle) {
                warn!(
                    "Could not release unused day index record {}: {}",
                    handle, free_err
                );
            }
            return Err(e);
        }
        Ok(handle)
    }

    fn parse_key(key: &[u8]) -> Result<u64> {
        let raw: [u8; 8] = key
            .try_into()
            .map_err(|_| BlobError::InvalidKey(format!("{} byte btree key", key.len())))?;
        Ok(u64::from_be_bytes(raw))
    }
}

impl BlobStorage for BTreeStorage {
    fn store(&self, blob: &[u8], at: Timestamp) -> Result<Vec<u8>> {
        self.cutoff.admit(at)?;

        let day = DayKey::from_timestamp(at).to_bytes();
        let framed = Compressed::new(blob)?.framed();

        let mut index = self.index.lock();
        let previous = index.days.get(&day).copied();

        let mut header = ChunkHeader {
            next: previous.unwrap_or(0),
            has_next: previous.is_some(),
            has_more: false,
        };
        let mut buf = Vec::with_capacity(CHUNK_HEADER + CHUNK_SIZE);
        // Backwards, so every chunk knows its successor when written.
        for chunk in framed.chunks(CHUNK_SIZE).rev() {
            buf.clear();
            header.encode(&mut buf);
            buf.put_slice(chunk);
            header = ChunkHeader {
                next: self.records.alloc(&buf)?,
                has_next: true,
                has_more: true,
            };
        }
        let head = header.next;

        index.days.insert(day, head);
        match self.swap_index(&index.days) {
            Ok(handle) => {
                let old = std::mem::replace(&mut index.handle, handle);
                if let Err(e) = self.records.free(old) {
                    warn!("Could not release old day index record {}: {}", old, e);
                }
            }
            Err(e) => {
                match previous {
                    Some(old) => index.days.insert(day, old),
                    None => index.days.remove(&day),
                };
                return Err(e);
            }
        }

        Ok(head.to_be_bytes().to_vec())
    }

    fn load_into(&self, key: &[u8], into: &mut Vec<u8>) -> Result<usize> {
        let mut handle = Self::parse_key(key)?;

        let record = self.records.get(handle)?;
        let (mut header, chunk) = ChunkHeader::decode(&record)?;
        let (decompressed_len, payload) = unframe(chunk)?;

        into.clear();
        into.extend_from_slice(payload);

        // Chunks are never shorter than one atom, which bounds a sane chain.
        let mut budget = self.records.size() / ATOM;
        while header.continues() {
            if budget == 0 {
                return Err(BlobError::Corruption(format!(
                    "chunk chain from {} does not terminate",
                    handle
                )));
            }
            budget -= 1;

            handle = header.next;
            let record = self.records.get(handle)?;
            let (next, chunk) = ChunkHeader::decode(&record)?;
            into.extend_from_slice(chunk);
            header = next;
        }

        Ok(decompressed_len as usize)
    }

    fn expire(&self, cutoff: Timestamp) -> Result<()> {
        if self.cutoff.raise(cutoff) {
            debug!("Raised btree cutoff to {}, nothing is reclaimed", cutoff);
        }
        Ok(())
    }

    fn free_capacity(&self) -> i64 {
        0
    }
}

fn encode_index(index: &DayIndex) -> Result<Vec<u8>> {
    bincode::serialize(index).map_err(|e| BlobError::Corruption(format!("day index: {}", e)))
}
