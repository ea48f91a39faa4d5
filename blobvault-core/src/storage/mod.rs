//! Storage contract shared by every backend
//!
//! A backend accepts compressed blobs tagged with a timestamp, hands out an
//! opaque key, serves the blob back by key and drops whole day buckets once
//! they fall behind the retention cutoff. Callers pick a backend by
//! [`BlobStorage::free_capacity`] and never interpret keys.

mod identity;
mod registry;

pub use identity::{get_or_create_uuid, ID_CONF};
pub use registry::{open_storages, Backend, BackendLoader, BackendRegistry};

use crate::compression;
use crate::{Result, Timestamp};

/// The four operations every backend implements.
///
/// Implementations are shared across request threads and synchronise
/// internally.
pub trait BlobStorage: Send + Sync {
    /// Persist `blob` in the day bucket of `at` and return its key.
    ///
    /// Fails with [`crate::BlobError::BeforeCutoff`] if `at` lies before the
    /// current retention cutoff.
    fn store(&self, blob: &[u8], at: Timestamp) -> Result<Vec<u8>>;

    /// Replace the contents of `into` with the stored payload of `key`.
    ///
    /// The payload is returned as stored, possibly still LZ4-compressed. The
    /// return value is the decompressed length, 0 if the payload is raw.
    fn load_into(&self, key: &[u8], into: &mut Vec<u8>) -> Result<usize>;

    /// Raise the cutoff to `cutoff` and reclaim every day bucket before its
    /// day. Never lowers the cutoff.
    fn expire(&self, cutoff: Timestamp) -> Result<()>;

    /// Best-effort estimate of the bytes left before capacity is exhausted.
    fn free_capacity(&self) -> i64;

    /// Load into a fresh buffer.
    fn load(&self, key: &[u8]) -> Result<LoadedBlob> {
        let mut data = Vec::new();
        let decompressed_len = self.load_into(key, &mut data)?;
        Ok(LoadedBlob {
            data,
            decompressed_len,
        })
    }
}

/// A payload as handed back by [`BlobStorage::load`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedBlob {
    /// Stored payload
    pub data: Vec<u8>,
    /// Original length, 0 if `data` is the raw blob
    pub decompressed_len: usize,
}

impl LoadedBlob {
    /// Original blob bytes
    pub fn decompress(&self) -> Result<Vec<u8>> {
        compression::decompress(&self.data, self.decompressed_len)
    }
}
