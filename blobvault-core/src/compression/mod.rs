//! LZ4 block framing shared by every backend
//!
//! Blobs are stored as an LZ4 block behind a 4-byte big-endian prefix holding
//! the decompressed length. A prefix of 0 means the payload is stored raw,
//! which happens whenever compression does not make the blob smaller.
//!
//! Backends hand the payload back still compressed together with the prefix
//! value; decompression is the consumer's business ([`decompress`]).

use crate::{BlobError, Result};
use bytes::{Buf, BufMut};

/// Size of the decompressed-length prefix in bytes
pub const LENGTH_PREFIX: usize = 4;

/// A compressed (or deliberately raw) blob
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Compressed {
    /// Original length, 0 if `payload` is the raw blob
    pub decompressed_len: u32,
    /// LZ4 block or raw bytes
    pub payload: Vec<u8>,
}

impl Compressed {
    /// Compress a blob, falling back to raw storage when LZ4 does not help.
    pub fn new(blob: &[u8]) -> Result<Self> {
        let len = u32::try_from(blob.len()).map_err(|_| {
            BlobError::Compression(format!("blob of {} bytes is too large", blob.len()))
        })?;

        if !blob.is_empty() {
            let block = lz4_flex::block::compress(blob);
            if block.len() < blob.len() {
                return Ok(Self {
                    decompressed_len: len,
                    payload: block,
                });
            }
        }

        Ok(Self {
            decompressed_len: 0,
            payload: blob.to_vec(),
        })
    }

    /// Whether the payload is stored uncompressed
    pub fn is_raw(&self) -> bool {
        self.decompressed_len == 0
    }

    /// Prefix plus payload, the layout the chained backends persist.
    pub fn framed(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(LENGTH_PREFIX + self.payload.len());
        buf.put_u32(self.decompressed_len);
        buf.put_slice(&self.payload);
        buf
    }
}

/// Split a framed buffer into its prefix value and payload.
pub fn unframe(framed: &[u8]) -> Result<(u32, &[u8])> {
    if framed.len() < LENGTH_PREFIX {
        return Err(BlobError::Corruption(format!(
            "framed blob of {} bytes has no length prefix",
            framed.len()
        )));
    }
    let mut prefix = &framed[..LENGTH_PREFIX];
    Ok((prefix.get_u32(), &framed[LENGTH_PREFIX..]))
}

/// Restore the original blob from a payload and its length hint.
pub fn decompress(payload: &[u8], decompressed_len: usize) -> Result<Vec<u8>> {
    if decompressed_len == 0 {
        return Ok(payload.to_vec());
    }
    let blob = lz4_flex::block::decompress(payload, decompressed_len)
        .map_err(|e| BlobError::Compression(e.to_string()))?;
    if blob.len() != decompressed_len {
        return Err(BlobError::Compression(format!(
            "expected {} bytes, got {}",
            decompressed_len,
            blob.len()
        )));
    }
    Ok(blob)
}
