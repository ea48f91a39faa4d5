//! BlobVault Core - day-partitioned blob storage backends
//!
//! Clients hand in opaque blobs tagged with a timestamp; a backend compresses
//! and persists them, returns an opaque key, serves them back by key and
//! drops whole day buckets once they fall behind a retention cutoff.
//!
//! # Architecture
//!
//! - **Codec**: binary-safe encoding for keys, node ids and timestamps on the wire
//! - **Storage contract**: the [`BlobStorage`] trait and the backend registry
//! - **Day-file backend**: one append-only file per UTC day
//! - **B-tree backend**: chunk chains in a handle-addressed record file
//! - **Journal engine**: write-ahead-logged data file with a skip-list day
//!   index, extent allocator and free list

pub mod btree;
pub mod codec;
pub mod compression;
pub mod config;
pub mod dayfile;
pub mod journal;
pub mod storage;

mod error;
mod types;

pub use error::{BlobError, Result};
pub use storage::{open_storages, Backend, BackendRegistry, BlobStorage, LoadedBlob};
pub use types::*;

/// BlobVault version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
