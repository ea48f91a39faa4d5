//! Day-file record framing and append strategies
//!
//! Record layout:
//! - 4 bytes: decompressed length, big-endian (0 = stored raw)
//! - 4 bytes: payload length, big-endian
//! - N bytes: payload

use super::pool::{AppendState, UNKNOWN_EOF};
use crate::compression::Compressed;
use crate::config::{StorageConfig, OPTION_PWRITE};
use crate::{BlobError, Result};
use bytes::{Buf, BufMut};
use std::fs::File;
use std::io::{Seek, SeekFrom, Write};
use std::os::unix::fs::FileExt;
use std::sync::atomic::Ordering;
use tracing::warn;

/// Size of the record header in bytes
pub const RECORD_HEADER: usize = 8;

/// Frame a compressed blob as a day-file record
pub fn frame(compressed: &Compressed) -> Result<Vec<u8>> {
    let payload_len = u32::try_from(compressed.payload.len())
        .map_err(|_| BlobError::Compression("payload exceeds 4 GiB".into()))?;

    let mut buf = Vec::with_capacity(RECORD_HEADER + compressed.payload.len());
    buf.put_u32(compressed.decompressed_len);
    buf.put_u32(payload_len);
    buf.put_slice(&compressed.payload);
    Ok(buf)
}

/// Read the record at `offset` whose framed length is `record_len`.
///
/// The payload replaces the contents of `into`; the decompressed length is
/// returned.
pub fn read_record(file: &File, offset: u64, record_len: usize, into: &mut Vec<u8>) -> Result<usize> {
    let file_len = file.metadata()?.len();
    let record_end = offset.checked_add(record_len as u64);
    if record_end.map_or(true, |end| end > file_len) {
        return Err(BlobError::Corruption(format!(
            "record of {} bytes at {} overruns a file of {} bytes",
            record_len, offset, file_len
        )));
    }

    let mut header = [0u8; RECORD_HEADER];
    file.read_exact_at(&mut header, offset)?;

    let mut cursor = &header[..];
    let decompressed_len = cursor.get_u32() as usize;
    let payload_len = cursor.get_u32() as usize;

    if payload_len + RECORD_HEADER > record_len {
        return Err(BlobError::Corruption(format!(
            "record at {} claims {} payload bytes, key allows {}",
            offset,
            payload_len,
            record_len.saturating_sub(RECORD_HEADER)
        )));
    }

    into.clear();
    into.resize(payload_len, 0);
    file.read_exact_at(into, offset + RECORD_HEADER as u64)?;

    Ok(decompressed_len)
}

/// How records are appended to a day file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendMode {
    /// Seek to the end and write, under the file's append lock
    SeekEnd,
    /// Reserve a range on the atomic end-of-file counter and write there
    Positional,
}

impl AppendMode {
    /// Pick the mode from the `pwrite` option
    pub fn from_config(config: &StorageConfig) -> Self {
        if config.has_option(OPTION_PWRITE) {
            AppendMode::Positional
        } else {
            AppendMode::SeekEnd
        }
    }

    /// Append `record` and return the offset it was written at
    pub fn append(self, file: &File, state: &AppendState, record: &[u8]) -> Result<u64> {
        match self {
            AppendMode::SeekEnd => append_seek_end(file, state, record),
            AppendMode::Positional => append_positional(file, state, record),
        }
    }
}

fn append_seek_end(file: &File, state: &AppendState, record: &[u8]) -> Result<u64> {
    let _guard = state.lock.lock();
    let mut file = file;
    let offset = file.seek(SeekFrom::End(0))?;
    file.write_all(record)?;
    Ok(offset)
}

/// Reservation is a compare-and-swap on the end-of-file counter, so
/// concurrent writers always get disjoint ranges. A failed write abandons its
/// range: the counter never moves backwards, and the hole is never referenced
/// by any key.
fn append_positional(file: &File, state: &AppendState, record: &[u8]) -> Result<u64> {
    let len = record.len() as u64;

    let start = loop {
        let current = state.eof.load(Ordering::Acquire);
        if current == UNKNOWN_EOF {
            let _guard = state.lock.lock();
            let physical = file.metadata()?.len();
            // Lost races are fine, someone else resolved it.
            let _ = state.eof.compare_exchange(
                UNKNOWN_EOF,
                physical,
                Ordering::AcqRel,
                Ordering::Acquire,
            );
            continue;
        }

        let end = current
            .checked_add(len)
            .filter(|end| *end != UNKNOWN_EOF)
            .ok_or_else(|| BlobError::Corruption("day file offset overflow".into()))?;
        if state
            .eof
            .compare_exchange_weak(current, end, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            break current;
        }
    };

    if let Err(e) = file.write_all_at(record, start) {
        warn!(
            "Positional append of {} bytes at {} failed, range abandoned: {}",
            len, start, e
        );
        return Err(e.into());
    }
    Ok(start)
}
