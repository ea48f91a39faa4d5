//! Journaled data file
//!
//! Structural writes are buffered as pending writes until `commit`, which
//! logs them as one record in the write-ahead region, applies them in place
//! and then clears the region. Reads see pending writes on top of the file.
//! A record left behind by a crash is replayed on open; a torn one is
//! discarded, which leaves the file as it was before that transaction.
//!
//! Blob payloads bypass the log (`write_direct`), they only ever land in
//! space a committed transaction has already reserved.

use super::wal::{SyncPolicy, WalRecord, JOURNAL_SIZE, WAL_CAPACITY, WAL_START};
use crate::{BlobError, Result};
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Allocation alignment in the data region
pub const ALIGN: u64 = 8;

/// The journaled data file
pub struct Pager {
    file: Arc<File>,
    sync: SyncPolicy,
    pending: Vec<(u64, Vec<u8>)>,
    /// End of file including reservations of the open transaction
    end: u64,
    /// End of file as of the last commit
    committed_end: u64,
    seq: u64,
}

impl Pager {
    /// Open `path`, recovering an interrupted commit.
    ///
    /// The flag is true when the file holds no committed data yet.
    pub fn open(path: &Path, sync: SyncPolicy) -> Result<(Self, bool)> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;

        let mut pager = Self {
            file: Arc::new(file),
            sync,
            pending: Vec::new(),
            end: 0,
            committed_end: 0,
            seq: 0,
        };

        pager.recover()?;

        let len = pager.file.metadata()?.len();
        let fresh = len <= JOURNAL_SIZE;
        if len < JOURNAL_SIZE {
            pager.file.set_len(JOURNAL_SIZE)?;
            pager.sync_file()?;
        }
        pager.committed_end = len.max(JOURNAL_SIZE);
        pager.end = pager.committed_end;

        Ok((pager, fresh))
    }

    fn recover(&mut self) -> Result<()> {
        let len = self.file.metadata()?.len();
        if len < WAL_START + 4 {
            return Ok(());
        }

        let mut prefix = [0u8; 4];
        self.file.read_exact_at(&mut prefix, WAL_START)?;
        let record_len = WalRecord::peek_len(&prefix)?;
        if record_len == 0 {
            return Ok(());
        }

        let available = len.min(JOURNAL_SIZE).saturating_sub(WAL_START) as usize;
        let record = if record_len + 4 <= available {
            let mut raw = vec![0u8; record_len + 4];
            self.file.read_exact_at(&mut raw, WAL_START)?;
            WalRecord::deserialize_with_checksum(&raw)
        } else {
            Err(BlobError::Corruption("Incomplete entry".into()))
        };

        match record {
            Ok(record) => {
                info!(
                    "Replaying journal record {} with {} writes",
                    record.seq,
                    record.writes.len()
                );
                self.seq = record.seq;
                self.apply(&record)?;
            }
            Err(e) => {
                warn!("Discarding torn journal record: {}", e);
            }
        }
        self.clear_log()
    }

    /// Reserve `len` bytes at the end of the data region
    pub fn allocate(&mut self, len: u64) -> u64 {
        let offset = (self.end + ALIGN - 1) / ALIGN * ALIGN;
        self.end = offset + len;
        offset
    }

    /// Buffer a structural write
    pub fn write(&mut self, offset: u64, data: &[u8]) {
        self.pending.push((offset, data.to_vec()));
    }

    /// Read through pending writes
    pub fn read(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];

        let on_disk = self.committed_end.saturating_sub(offset).min(len as u64) as usize;
        if on_disk > 0 {
            self.file.read_exact_at(&mut buf[..on_disk], offset)?;
        }

        let read_end = offset + len as u64;
        for (write_offset, data) in &self.pending {
            let write_end = write_offset + data.len() as u64;
            if *write_offset >= read_end || write_end <= offset {
                continue;
            }
            let from = offset.max(*write_offset);
            let to = read_end.min(write_end);
            buf[(from - offset) as usize..(to - offset) as usize]
                .copy_from_slice(&data[(from - write_offset) as usize..(to - write_offset) as usize]);
        }
        Ok(buf)
    }

    /// Read a big-endian u64 through pending writes
    pub fn read_u64(&self, offset: u64) -> Result<u64> {
        let raw = self.read(offset, 8)?;
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&raw);
        Ok(u64::from_be_bytes(bytes))
    }

    /// Buffer a big-endian u64
    pub fn write_u64(&mut self, offset: u64, value: u64) {
        self.write(offset, &value.to_be_bytes());
    }

    /// Make the open transaction durable.
    ///
    /// On error the transaction is rolled back in memory; if the record made
    /// it to disk it is replayed on the next open.
    pub fn commit(&mut self) -> Result<()> {
        if self.pending.is_empty() && self.end == self.committed_end {
            return Ok(());
        }

        let result = self.log().and_then(|record| {
            self.apply(&record)?;
            self.clear_log()
        });

        match result {
            Ok(()) => {
                self.committed_end = self.end;
                self.pending.clear();
                Ok(())
            }
            Err(e) => {
                self.rollback();
                Err(e)
            }
        }
    }

    /// Drop the open transaction
    pub fn rollback(&mut self) {
        if !self.pending.is_empty() {
            debug!("Rolling back {} pending writes", self.pending.len());
        }
        self.pending.clear();
        self.end = self.committed_end;
    }

    /// Write into committed space without logging
    pub fn write_direct(&self, offset: u64, data: &[u8]) -> Result<()> {
        if offset < JOURNAL_SIZE || offset + data.len() as u64 > self.committed_end {
            return Err(BlobError::Corruption(format!(
                "direct write of {} bytes at {} outside the data region",
                data.len(),
                offset
            )));
        }
        self.file.write_all_at(data, offset)?;
        Ok(())
    }

    /// Flush direct writes according to the sync policy
    pub fn sync_direct(&self) -> Result<()> {
        self.sync_file()
    }

    /// Shared handle for lock-free reads of committed data
    pub fn file(&self) -> Arc<File> {
        self.file.clone()
    }

    /// End of file as of the last commit
    pub fn committed_end(&self) -> u64 {
        self.committed_end
    }

    fn log(&mut self) -> Result<WalRecord> {
        let record = WalRecord {
            seq: self.seq + 1,
            new_end: self.end,
            writes: std::mem::take(&mut self.pending),
        };

        let encoded = record.serialize_with_checksum();
        if encoded.len() > WAL_CAPACITY {
            self.pending = record.writes;
            return Err(BlobError::TransactionTooLarge {
                size: encoded.len(),
                limit: WAL_CAPACITY,
            });
        }

        self.file.write_all_at(&encoded, WAL_START)?;
        self.sync_file()?;
        self.seq = record.seq;
        Ok(record)
    }

    fn apply(&self, record: &WalRecord) -> Result<()> {
        if self.file.metadata()?.len() < record.new_end {
            self.file.set_len(record.new_end)?;
        }
        for (offset, data) in &record.writes {
            self.file.write_all_at(data, *offset)?;
        }
        self.sync_file()
    }

    fn clear_log(&self) -> Result<()> {
        self.file.write_all_at(&[0; 4], WAL_START)?;
        self.sync_file()
    }

    fn sync_file(&self) -> Result<()> {
        if self.sync == SyncPolicy::Immediate {
            self.file.sync_data()?;
        }
        Ok(())
    }

    /// Log the open transaction without applying it, as a crash would.
    #[cfg(test)]
    pub(crate) fn log_only(&mut self) -> Result<()> {
        self.log().map(|_| ())
    }
}
