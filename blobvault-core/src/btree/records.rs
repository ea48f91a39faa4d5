//! Handle-addressed record allocator
//!
//! The file is a sequence of 16-byte atoms. Atom 0 is the file header; every
//! record starts on an atom boundary and its handle is its atom index, so
//! handle 0 never names a record.
//!
//! Record layout:
//! - 1 byte: tag (used, forward or free)
//! - 3 bytes: reserved
//! - 4 bytes: payload length, big-endian
//! - 8 bytes: payload capacity in bytes, big-endian, a multiple of the atom
//! - capacity bytes: payload, zero padded
//!
//! A record that outgrows its capacity moves, and the slot at its handle
//! becomes a forward to the new location. Handles never change.

use crate::{BlobError, Result};
use bytes::{Buf, BufMut};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use tracing::{debug, info, warn};

/// Allocation unit in bytes
pub const ATOM: u64 = 16;

const HEADER: usize = 16;
const MAGIC: &[u8; 8] = b"BVRECS01";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum Tag {
    Used = 0xA1,
    Forward = 0xA2,
    Free = 0xA3,
}

impl TryFrom<u8> for Tag {
    type Error = BlobError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0xA1 => Ok(Tag::Used),
            0xA2 => Ok(Tag::Forward),
            0xA3 => Ok(Tag::Free),
            _ => Err(BlobError::Corruption(format!(
                "invalid record tag {:#04x}",
                value
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct RecordHeader {
    tag: Tag,
    len: u32,
    cap: u64,
}

impl RecordHeader {
    fn encode(&self, buf: &mut Vec<u8>) {
        buf.put_u8(self.tag as u8);
        buf.put_slice(&[0; 3]);
        buf.put_u32(self.len);
        buf.put_u64(self.cap);
    }

    fn decode(raw: &[u8; HEADER]) -> Result<Self> {
        let mut cursor = &raw[..];
        let tag = Tag::try_from(cursor.get_u8())?;
        cursor.advance(3);
        let len = cursor.get_u32();
        let cap = cursor.get_u64();
        if len as u64 > cap || cap % ATOM != 0 {
            return Err(BlobError::Corruption(format!(
                "record header claims {} bytes in a capacity of {}",
                len, cap
            )));
        }
        Ok(Self { tag, len, cap })
    }
}

struct AllocState {
    /// Offset one past the last record
    end: u64,
    /// Free records by capacity
    free: BTreeMap<u64, Vec<u64>>,
}

impl AllocState {
    fn take_free(&mut self, need: u64) -> Option<(u64, u64)> {
        let cap = *self.free.range(need..).next()?.0;
        let handles = self.free.get_mut(&cap)?;
        let handle = handles.pop()?;
        if handles.is_empty() {
            self.free.remove(&cap);
        }
        Some((handle, cap))
    }
}

/// Record allocator over one file
pub struct Records {
    file: File,
    state: Mutex<AllocState>,
}

impl Records {
    /// Open or create the record file at `path`, rebuilding the free list.
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        let len = file.metadata()?.len();

        let mut state = AllocState {
            end: ATOM,
            free: BTreeMap::new(),
        };

        if len == 0 {
            let mut header = MAGIC.to_vec();
            header.resize(ATOM as usize, 0);
            file.write_all_at(&header, 0)?;
            info!("Created record file {:?}", path);
        } else {
            let mut magic = [0u8; 8];
            file.read_exact_at(&mut magic, 0)?;
            if &magic != MAGIC {
                return Err(BlobError::Corruption(format!(
                    "{:?} is not a record file",
                    path
                )));
            }
            let records = Self::scan(&file, len, &mut state)?;
            info!(
                "Opened record file {:?}: {} records, {} free",
                path,
                records,
                state.free.values().map(Vec::len).sum::<usize>()
            );
        }

        Ok(Self {
            file,
            state: Mutex::new(state),
        })
    }

    fn scan(file: &File, len: u64, state: &mut AllocState) -> Result<usize> {
        let mut offset = ATOM;
        let mut records = 0;
        while offset < len {
            let header = match read_header_at(file, offset, len) {
                Ok(header) if offset + HEADER as u64 + header.cap <= len => header,
                Ok(_) | Err(BlobError::Corruption(_)) => {
                    // Torn append; everything from here on is unreferenced.
                    warn!(
                        "Ignoring {} trailing bytes of record file at {}",
                        len - offset,
                        offset
                    );
                    break;
                }
                Err(e) => return Err(e),
            };
            if header.tag == Tag::Free {
                state.free.entry(header.cap).or_default().push(offset / ATOM);
            }
            offset += HEADER as u64 + header.cap;
            records += 1;
        }
        state.end = offset;
        Ok(records)
    }

    /// Whether no record has been allocated yet
    pub fn is_empty(&self) -> bool {
        self.state.lock().end == ATOM
    }

    /// Bytes covered by records, including the file header
    pub fn size(&self) -> u64 {
        self.state.lock().end
    }

    /// Store `data` in a new record and return its handle.
    pub fn alloc(&self, data: &[u8]) -> Result<u64> {
        let mut state = self.state.lock();
        self.alloc_locked(&mut state, data, 0)
    }

    /// Read the payload of the record at `handle`, following a forward.
    pub fn get(&self, handle: u64) -> Result<Vec<u8>> {
        let end = self.state.lock().end;
        let (offset, header) = self.resolve(handle, end)?;

        let mut data = vec![0u8; header.len as usize];
        self.file.read_exact_at(&mut data, offset + HEADER as u64)?;
        Ok(data)
    }

    /// Replace the payload at `handle`, moving the record if it outgrew its
    /// capacity.
    pub fn set(&self, handle: u64, data: &[u8]) -> Result<()> {
        let mut state = self.state.lock();
        let (offset, header) = self.resolve(handle, state.end)?;

        if data.len() as u64 <= header.cap {
            return self.write_record(offset, Tag::Used, data, header.cap);
        }

        let moved = self.alloc_locked(&mut state, data, header.cap * 2)?;
        let slot = handle * ATOM;
        let slot_cap = read_header_at(&self.file, slot, state.end)?.cap;
        self.write_record(slot, Tag::Forward, &moved.to_be_bytes(), slot_cap)?;
        if offset != slot {
            self.release_locked(&mut state, offset, header.cap)?;
        }
        debug!("Moved record {} to {}", handle, moved);
        Ok(())
    }

    /// Release `handle` and, if it was moved, the record it forwards to.
    pub fn free(&self, handle: u64) -> Result<()> {
        let mut state = self.state.lock();
        let (offset, header) = self.resolve(handle, state.end)?;

        let slot = handle * ATOM;
        if offset != slot {
            let slot_cap = read_header_at(&self.file, slot, state.end)?.cap;
            self.release_locked(&mut state, slot, slot_cap)?;
        }
        self.release_locked(&mut state, offset, header.cap)
    }

    /// Flush written records to disk
    pub fn sync(&self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }

    fn alloc_locked(&self, state: &mut AllocState, data: &[u8], min_cap: u64) -> Result<u64> {
        let need = capacity_for(data.len()).max(min_cap);

        let (offset, cap) = match state.take_free(need) {
            Some((handle, cap)) => (handle * ATOM, cap),
            None => {
                let offset = state.end;
                state.end += HEADER as u64 + need;
                (offset, need)
            }
        };

        if let Err(e) = self.write_record(offset, Tag::Used, data, cap) {
            if offset + HEADER as u64 + cap == state.end {
                state.end = offset;
            } else {
                state.free.entry(cap).or_default().push(offset / ATOM);
            }
            return Err(e);
        }
        Ok(offset / ATOM)
    }

    fn release_locked(&self, state: &mut AllocState, offset: u64, cap: u64) -> Result<()> {
        self.write_record(offset, Tag::Free, &[], cap)?;
        state.free.entry(cap).or_default().push(offset / ATOM);
        Ok(())
    }

    /// Location and header of the live record behind `handle`
    fn resolve(&self, handle: u64, end: u64) -> Result<(u64, RecordHeader)> {
        let offset = handle
            .checked_mul(ATOM)
            .filter(|offset| handle != 0 && fits(*offset, end))
            .ok_or_else(|| BlobError::InvalidKey(format!("record handle {}", handle)))?;

        let header = read_header_at(&self.file, offset, end)?;
        match header.tag {
            Tag::Used => Ok((offset, header)),
            Tag::Free => Err(BlobError::NotFound(format!("record {} is free", handle))),
            Tag::Forward => {
                let mut target = [0u8; 8];
                self.file.read_exact_at(&mut target, offset + HEADER as u64)?;
                let target = u64::from_be_bytes(target);
                let target_offset = target
                    .checked_mul(ATOM)
                    .filter(|o| target != 0 && fits(*o, end))
                    .ok_or_else(|| {
                        BlobError::Corruption(format!("record {} forwards to {}", handle, target))
                    })?;
                let moved = read_header_at(&self.file, target_offset, end)?;
                if moved.tag != Tag::Used {
                    return Err(BlobError::Corruption(format!(
                        "record {} forwards to a {:?} record",
                        handle, moved.tag
                    )));
                }
                Ok((target_offset, moved))
            }
        }
    }

    fn write_record(&self, offset: u64, tag: Tag, data: &[u8], cap: u64) -> Result<()> {
        let len = u32::try_from(data.len())
            .map_err(|_| BlobError::Corruption(format!("record of {} bytes", data.len())))?;
        let mut buf = Vec::with_capacity(HEADER + cap as usize);
        RecordHeader { tag, len, cap }
        .encode(&mut buf);
        buf.put_slice(data);
        buf.resize(HEADER + cap as usize, 0);
        self.file.write_all_at(&buf, offset)?;
        Ok(())
    }
}

fn capacity_for(len: usize) -> u64 {
    ((len as u64 + ATOM - 1) / ATOM * ATOM).max(ATOM)
}

fn fits(offset: u64, end: u64) -> bool {
    offset
        .checked_add(HEADER as u64)
        .map_or(false, |header_end| header_end <= end)
}

fn read_header_at(file: &File, offset: u64, end: u64) -> Result<RecordHeader> {
    if !fits(offset, end) {
        return Err(BlobError::Corruption(format!(
            "record header at {} crosses end of file",
            offset
        )));
    }
    let mut raw = [0u8; HEADER];
    file.read_exact_at(&mut raw, offset)?;
    RecordHeader::decode(&raw)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open(dir: &TempDir) -> Records {
        Records::open(&dir.path().join("records.dat")).unwrap()
    }

    #[test]
    fn test_first_handle_is_one() {
        let temp_dir = TempDir::new().unwrap();
        let records = open(&temp_dir);
        assert!(records.is_empty());

        assert_eq!(records.alloc(b"index").unwrap(), 1);
        assert_eq!(records.get(1).unwrap(), b"index".to_vec());
        assert!(!records.is_empty());
    }

    #[test]
    fn test_handles_follow_capacity() {
        let temp_dir = TempDir::new().unwrap();
        let records = open(&temp_dir);

        let a = records.alloc(&[1; 20]).unwrap();
        let b = records.alloc(&[2; 3]).unwrap();
        // 16 header + 32 capacity = 3 atoms.
        assert_eq!(b, a + 3);
        assert_eq!(records.get(a).unwrap(), vec![1; 20]);
        assert_eq!(records.get(b).unwrap(), vec![2; 3]);
    }

    #[test]
    fn test_set_in_place_and_moved() {
        let temp_dir = TempDir::new().unwrap();
        let records = open(&temp_dir);

        let handle = records.alloc(b"small").unwrap();
        records.set(handle, b"smaller").unwrap();
        assert_eq!(records.get(handle).unwrap(), b"smaller".to_vec());

        let big = vec![7u8; 100];
        records.set(handle, &big).unwrap();
        assert_eq!(records.get(handle).unwrap(), big);

        // A second move frees the first target.
        let bigger = vec![8u8; 1000];
        records.set(handle, &bigger).unwrap();
        assert_eq!(records.get(handle).unwrap(), bigger);
        let reused = records.alloc(&[9u8; 100]).unwrap();
        assert_eq!(records.get(reused).unwrap(), vec![9u8; 100]);
        assert_eq!(records.get(handle).unwrap(), bigger);
    }

    #[test]
    fn test_free_releases_slot_and_target() {
        let temp_dir = TempDir::new().unwrap();
        let records = open(&temp_dir);

        let handle = records.alloc(b"slot").unwrap();
        records.set(handle, &[3u8; 100]).unwrap();
        let size = records.size();

        records.free(handle).unwrap();
        assert!(matches!(records.get(handle), Err(BlobError::NotFound(_))));

        // Both the 16-byte slot and the moved 112-byte record come back.
        assert_eq!(records.alloc(b"again").unwrap(), handle);
        let reused = records.alloc(&[4u8; 100]).unwrap();
        assert_eq!(records.get(reused).unwrap(), vec![4u8; 100]);
        assert_eq!(records.size(), size);
    }

    #[test]
    fn test_invalid_handles() {
        let temp_dir = TempDir::new().unwrap();
        let records = open(&temp_dir);
        records.alloc(b"x").unwrap();

        assert!(matches!(records.get(0), Err(BlobError::InvalidKey(_))));
        assert!(matches!(records.get(1 << 40), Err(BlobError::InvalidKey(_))));
        assert!(matches!(records.get(u64::MAX), Err(BlobError::InvalidKey(_))));
    }

    #[test]
    fn test_reopen_rebuilds_free_list() {
        let temp_dir = TempDir::new().unwrap();
        let (handle, size) = {
            let records = open(&temp_dir);
            let handle = records.alloc(b"grows").unwrap();
            records.set(handle, &[1u8; 64]).unwrap();
            records.set(handle, &[2u8; 512]).unwrap();
            (handle, records.size())
        };

        let records = open(&temp_dir);
        assert_eq!(records.size(), size);
        assert_eq!(records.get(handle).unwrap(), vec![2u8; 512]);

        // The freed 64 byte record is handed out before the file grows.
        records.alloc(&[3u8; 60]).unwrap();
        assert_eq!(records.size(), size);
    }

    #[test]
    fn test_torn_tail_is_ignored() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("records.dat");
        let handle = {
            let records = Records::open(&path).unwrap();
            records.alloc(b"whole").unwrap()
        };

        let file = OpenOptions::new().write(true).open(&path).unwrap();
        let len = file.metadata().unwrap().len();
        file.write_all_at(&[0xA1, 0, 0, 0, 0, 0, 0, 9], len).unwrap();

        let records = Records::open(&path).unwrap();
        assert_eq!(records.size(), len);
        assert_eq!(records.get(handle).unwrap(), b"whole".to_vec());
    }

    #[test]
    fn test_foreign_file_is_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("records.dat");
        std::fs::write(&path, b"definitely not a record file").unwrap();
        assert!(Records::open(&path).err().unwrap().is_corruption());
    }
}
