//! Error types for BlobVault

use thiserror::Error;

/// Result type alias for BlobVault operations
pub type Result<T> = std::result::Result<T, BlobError>;

/// BlobVault error types
#[derive(Error, Debug)]
pub enum BlobError {
    /// IO operation failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Data corruption detected
    #[error("Data corruption: {0}")]
    Corruption(String),

    /// Checksum mismatch
    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    /// Key does not have the shape the backend hands out
    #[error("Invalid key: {0}")]
    InvalidKey(String),

    /// Blob, bucket or record does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Store timestamp lies before the retention cutoff
    #[error("Timestamp {timestamp} is before the retention cutoff {cutoff}")]
    BeforeCutoff { timestamp: i64, cutoff: i64 },

    /// Compression/decompression error
    #[error("Compression error: {0}")]
    Compression(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Backend method is not registered
    #[error("No such storage method: {0:?}")]
    UnknownMethod(String),

    /// File was expired and may not be reopened
    #[error("File is disabled: {0}")]
    PoolDisabled(String),

    /// Journal transaction does not fit the write-ahead region
    #[error("Transaction of {size} bytes exceeds journal capacity of {limit} bytes")]
    TransactionTooLarge { size: usize, limit: usize },
}

impl BlobError {
    /// Check if error indicates corruption
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            BlobError::Corruption(_) | BlobError::ChecksumMismatch { .. }
        )
    }

    /// Check if error is an expected policy rejection rather than a failure
    pub fn is_policy_rejection(&self) -> bool {
        matches!(self, BlobError::BeforeCutoff { .. })
    }
}
