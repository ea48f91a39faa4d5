//! Journal-backed engine
//!
//! A single data file whose structural changes all go through a
//! write-ahead region at its head. A persistent skip list maps day-keys to
//! extent lists; reclaimed day buckets are spliced onto a free list that
//! later allocations draw from first.

pub mod blocklist;
mod engine;
pub mod pager;
pub mod skiplist;
pub mod wal;

pub use engine::{JournalStorage, MasterRecord, DATA_FILE, MASTER_RECORD};
pub use wal::{SyncPolicy, WalRecord, JOURNAL_SIZE, WAL_START};
