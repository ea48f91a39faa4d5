//! Write-ahead region
//!
//! The first `JOURNAL_SIZE` bytes of the data file are reserved. Offset 0
//! holds the 8-byte master pointer; the rest is the write-ahead region, which
//! holds at most one commit record at `WAL_START`:
//!
//! - 4 bytes: record length (excluding this field), 0 = empty
//! - 8 bytes: sequence number
//! - 8 bytes: data file end after the transaction
//! - 4 bytes: write count
//! - per write: 8 bytes offset, 4 bytes length, bytes
//! - 4 bytes: CRC32 of everything after the length field
//!
//! All integers are big-endian.

use crate::{BlobError, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Bytes reserved at the head of the data file
pub const JOURNAL_SIZE: u64 = 1 << 24;

/// Offset of the commit record
pub const WAL_START: u64 = 8;

/// Largest commit record that fits the region
pub const WAL_CAPACITY: usize = (JOURNAL_SIZE - WAL_START) as usize;

const LEN_FIELD: usize = 4;
const FIXED: usize = 8 + 8 + 4;
const CHECKSUM: usize = 4;
const WRITE_HEADER: usize = 8 + 4;

/// When committed state is forced to disk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncPolicy {
    /// fsync at every commit step (safest)
    #[default]
    Immediate,
    /// Never sync, the OS decides (tests and benchmarks)
    None,
}

/// One committed transaction: a batch of writes plus the new end of file
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WalRecord {
    pub seq: u64,
    pub new_end: u64,
    pub writes: Vec<(u64, Vec<u8>)>,
}

impl WalRecord {
    /// Size of the serialized record
    pub fn encoded_len(&self) -> usize {
        LEN_FIELD
            + FIXED
            + self
                .writes
                .iter()
                .map(|(_, data)| WRITE_HEADER + data.len())
                .sum::<usize>()
            + CHECKSUM
    }

    /// Serialize with length prefix and CRC checksum
    pub fn serialize_with_checksum(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());

        // Reserve space for length prefix
        buf.put_u32(0);

        buf.put_u64(self.seq);
        buf.put_u64(self.new_end);
        buf.put_u32(self.writes.len() as u32);
        for (offset, data) in &self.writes {
            buf.put_u64(*offset);
            buf.put_u32(data.len() as u32);
            buf.put_slice(data);
        }

        let checksum = crc32fast::hash(&buf[LEN_FIELD..]);
        buf.put_u32(checksum);

        let len = (buf.len() - LEN_FIELD) as u32;
        buf[..LEN_FIELD].copy_from_slice(&len.to_be_bytes());

        buf.freeze()
    }

    /// Length of the record starting with `prefix`, 0 if the region is empty
    pub fn peek_len(prefix: &[u8]) -> Result<usize> {
        if prefix.len() < LEN_FIELD {
            return Err(BlobError::Corruption("Entry too short".into()));
        }
        Ok((&prefix[..LEN_FIELD]).get_u32() as usize)
    }

    /// Deserialize a record, validating its checksum
    pub fn deserialize_with_checksum(data: &[u8]) -> Result<Self> {
        let len = Self::peek_len(data)?;
        if len < FIXED + CHECKSUM || data.len() < LEN_FIELD + len {
            return Err(BlobError::Corruption("Incomplete entry".into()));
        }

        let body = &data[LEN_FIELD..LEN_FIELD + len - CHECKSUM];
        let expected = (&data[LEN_FIELD + len - CHECKSUM..]).get_u32();
        let actual = crc32fast::hash(body);
        if expected != actual {
            return Err(BlobError::ChecksumMismatch { expected, actual });
        }

        let mut cursor = body;
        let seq = cursor.get_u64();
        let new_end = cursor.get_u64();
        let count = cursor.get_u32() as usize;

        let mut writes = Vec::with_capacity(count.min(cursor.len() / WRITE_HEADER));
        for _ in 0..count {
            if cursor.remaining() < WRITE_HEADER {
                return Err(BlobError::Corruption("Truncated write header".into()));
            }
            let offset = cursor.get_u64();
            let len = cursor.get_u32() as usize;
            if cursor.remaining() < len {
                return Err(BlobError::Corruption("Truncated write payload".into()));
            }
            writes.push((offset, cursor[..len].to_vec()));
            cursor.advance(len);
        }

        Ok(Self {
            seq,
            new_end,
            writes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> WalRecord {
        WalRecord {
            seq: 7,
            new_end: JOURNAL_SIZE + 4096,
            writes: vec![(0, vec![1, 2, 3]), (JOURNAL_SIZE + 8, vec![9; 40])],
        }
    }

    #[test]
    fn test_serialize_deserialize() {
        let record = record();
        let bytes = record.serialize_with_checksum();
        assert_eq!(bytes.len(), record.encoded_len());
        assert_eq!(WalRecord::peek_len(&bytes).unwrap(), bytes.len() - 4);

        let decoded = WalRecord::deserialize_with_checksum(&bytes).unwrap();
        assert_eq!(decoded, record);
    }

    #[test]
    fn test_checksum_validation() {
        let mut bytes = record().serialize_with_checksum().to_vec();
        bytes[20] ^= 0xFF;

        let result = WalRecord::deserialize_with_checksum(&bytes);
        assert!(matches!(result, Err(BlobError::ChecksumMismatch { .. })));
    }

    #[test]
    fn test_torn_record() {
        let bytes = record().serialize_with_checksum();
        let result = WalRecord::deserialize_with_checksum(&bytes[..bytes.len() - 10]);
        assert!(result.unwrap_err().is_corruption());
    }

    #[test]
    fn test_empty_region() {
        assert_eq!(WalRecord::peek_len(&[0, 0, 0, 0]).unwrap(), 0);
        assert!(WalRecord::deserialize_with_checksum(&[0; 32]).is_err());
    }
}
