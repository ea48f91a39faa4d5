//! Backend configuration
//!
//! A storage root holds `storage.conf`, one TOML table per backend instance:
//!
//! ```toml
//! [vol0]
//! method = "journal"
//! capacity = { G = 2 }
//!
//! [vol1]
//! method = "dayfile"
//! capacity = { M = 500 }
//! options = ["pwrite"]
//! max_open = 32
//! ```
//!
//! Each table name is the instance's sub-directory under the root.

use crate::{BlobError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Name of the backend table file inside a storage root
pub const STORAGE_CONF: &str = "storage.conf";

/// Open-file bound used when `max_open` is absent or zero
pub const DEFAULT_MAX_OPEN: usize = 64;

/// Day-file option: positional writes on an atomic end-of-file counter
pub const OPTION_PWRITE: &str = "pwrite";

/// Journal option: skip fsync on commit
pub const OPTION_NOSYNC: &str = "nosync";

/// A size given as independent binary-unit components that are summed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Size {
    #[serde(default, rename = "K")]
    pub kib: u16,
    #[serde(default, rename = "M")]
    pub mib: u16,
    #[serde(default, rename = "G")]
    pub gib: u16,
    #[serde(default, rename = "T")]
    pub tib: u16,
    #[serde(default, rename = "P")]
    pub pib: u16,
}

impl Size {
    /// Shorthand for a size in mebibytes
    pub fn mib(mib: u16) -> Self {
        Self {
            mib,
            ..Default::default()
        }
    }

    /// Total size in bytes
    pub fn bytes(&self) -> i64 {
        ((self.kib as i64) << 10)
            + ((self.mib as i64) << 20)
            + ((self.gib as i64) << 30)
            + ((self.tib as i64) << 40)
            + ((self.pib as i64) << 50)
    }
}

/// Configuration of one backend instance
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Backend implementation, see [`crate::storage::BackendRegistry`]
    pub method: String,
    /// Configured capacity; absent means zero
    #[serde(default)]
    pub capacity: Option<Size>,
    /// Free-form flags
    #[serde(default)]
    pub options: Vec<String>,
    /// Open-file pool bound (day-file backend only)
    #[serde(default)]
    pub max_open: usize,
}

impl StorageConfig {
    /// Configuration for `method` with the given capacity
    pub fn new(method: impl Into<String>, capacity: Size) -> Self {
        Self {
            method: method.into(),
            capacity: Some(capacity),
            ..Default::default()
        }
    }

    /// Add an option flag
    pub fn with_option(mut self, flag: impl Into<String>) -> Self {
        self.options.push(flag.into());
        self
    }

    /// Capacity in bytes
    pub fn capacity_bytes(&self) -> i64 {
        self.capacity.map(|c| c.bytes()).unwrap_or(0)
    }

    /// Whether an option flag is set
    pub fn has_option(&self, flag: &str) -> bool {
        self.options.iter().any(|o| o == flag)
    }

    /// Effective open-file bound
    pub fn max_open_files(&self) -> usize {
        if self.max_open == 0 {
            DEFAULT_MAX_OPEN
        } else {
            self.max_open
        }
    }
}

/// Parse the backend table of a storage root.
pub fn load_storage_config(root: &Path) -> Result<BTreeMap<String, StorageConfig>> {
    let path = root.join(STORAGE_CONF);
    let text = std::fs::read_to_string(&path)?;
    parse_storage_config(&text)
}

/// Parse backend tables from TOML text.
pub fn parse_storage_config(text: &str) -> Result<BTreeMap<String, StorageConfig>> {
    toml::from_str(text).map_err(|e| BlobError::Config(e.to_string()))
}
