//! Contract tests run against every backend through `BlobStorage`

use blobvault_core::btree::BTreeStorage;
use blobvault_core::config::{Size, StorageConfig, OPTION_NOSYNC, OPTION_PWRITE};
use blobvault_core::dayfile::DayFileStorage;
use blobvault_core::journal::{JournalStorage, WalRecord, DATA_FILE, JOURNAL_SIZE, WAL_START};
use blobvault_core::{open_storages, BackendRegistry, BlobStorage, DayKey};
use chrono::NaiveDate;
use rand::RngCore;
use std::os::unix::fs::FileExt;
use std::path::Path;
use tempfile::TempDir;

fn ts(year: i32, month: u32, day: u32) -> i64 {
    NaiveDate::from_ymd_opt(year, month, day)
        .and_then(|d| d.and_hms_opt(12, 0, 0))
        .map(|dt| dt.and_utc().timestamp())
        .unwrap()
}

fn backends(dir: &Path) -> Vec<(&'static str, Box<dyn BlobStorage>)> {
    let capacity = Size::mib(1);
    vec![
        (
            "dayfile",
            Box::new(
                DayFileStorage::open(&dir.join("dayfile"), &StorageConfig::new("dayfile", capacity))
                    .unwrap(),
            ),
        ),
        (
            "dayfile-pwrite",
            Box::new(
                DayFileStorage::open(
                    &dir.join("pwrite"),
                    &StorageConfig::new("dayfile", capacity).with_option(OPTION_PWRITE),
                )
                .unwrap(),
            ),
        ),
        (
            "btree",
            Box::new(
                BTreeStorage::open(&dir.join("btree"), &StorageConfig::new("btree", capacity))
                    .unwrap(),
            ),
        ),
        (
            "journal",
            Box::new(
                JournalStorage::open(
                    &dir.join("journal"),
                    &StorageConfig::new("journal", capacity).with_option(OPTION_NOSYNC),
                )
                .unwrap(),
            ),
        ),
    ]
}

#[test]
fn concrete_scenario() {
    let temp_dir = TempDir::new().unwrap();

    for (name, storage) in backends(temp_dir.path()) {
        let hello = storage.store(b"hello", ts(2024, 1, 10)).unwrap();
        assert!(!hello.is_empty(), "{}", name);
        let loaded = storage.load(&hello).unwrap();
        assert_eq!(loaded.decompress().unwrap(), b"hello".to_vec(), "{}", name);

        let early = storage.store(b"early", ts(2024, 1, 5)).unwrap();
        assert_eq!(storage.load(&early).unwrap().data, b"early".to_vec(), "{}", name);

        storage.expire(ts(2024, 1, 8)).unwrap();

        // The btree backend reclaims nothing on expiry.
        if name != "btree" {
            assert!(storage.load(&early).is_err(), "{}", name);
        }
        assert_eq!(storage.load(&hello).unwrap().data, b"hello".to_vec(), "{}", name);
    }
}

#[test]
fn retention_is_monotonic() {
    let temp_dir = TempDir::new().unwrap();

    for (name, storage) in backends(temp_dir.path()) {
        storage.expire(ts(2024, 1, 8)).unwrap();
        storage.expire(ts(2024, 1, 2)).unwrap();

        let err = storage.store(b"late", ts(2024, 1, 7)).unwrap_err();
        assert!(err.is_policy_rejection(), "{}: {}", name, err);
        assert!(storage.store(b"on time", ts(2024, 1, 8)).is_ok(), "{}", name);
    }
}

#[test]
fn free_capacity_never_grows_while_storing() {
    let temp_dir = TempDir::new().unwrap();
    let mut rng = rand::thread_rng();

    for (name, storage) in backends(temp_dir.path()) {
        let mut last = storage.free_capacity();
        assert!(last >= 0, "{}", name);
        for day in 1..=20 {
            let mut blob = vec![0u8; 1000 * day as usize];
            rng.fill_bytes(&mut blob);
            storage.store(&blob, ts(2024, 3, day)).unwrap();

            let now = storage.free_capacity();
            assert!(now >= 0 && now <= last, "{}: {} after {}", name, now, last);
            last = now;
        }
    }
}

#[test]
fn chained_blob_roundtrip() {
    let temp_dir = TempDir::new().unwrap();
    let mut blob = vec![0u8; 200 * 1024];
    rand::thread_rng().fill_bytes(&mut blob);

    for (name, storage) in backends(temp_dir.path()) {
        let key = storage.store(&blob, ts(2024, 1, 10)).unwrap();
        let loaded = storage.load(&key).unwrap();
        assert_eq!(loaded.decompress().unwrap(), blob, "{}", name);
    }
}

#[test]
fn concurrent_stores() {
    let temp_dir = TempDir::new().unwrap();

    for (name, storage) in backends(temp_dir.path()) {
        let storage: &dyn BlobStorage = storage.as_ref();
        let keys: Vec<(Vec<u8>, Vec<u8>)> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8u8)
                .map(|worker| {
                    scope.spawn(move || {
                        (0..16u8)
                            .map(|i| {
                                let blob = vec![worker, i, worker ^ i];
                                let day = 1 + (i as u32 % 4);
                                (storage.store(&blob, ts(2024, 5, day)).unwrap(), blob)
                            })
                            .collect::<Vec<_>>()
                    })
                })
                .collect();
            handles
                .into_iter()
                .flat_map(|handle| handle.join().unwrap())
                .collect()
        });

        for (key, blob) in keys {
            assert_eq!(storage.load(&key).unwrap().data, blob, "{}", name);
        }
    }
}

#[test]
fn storage_root_from_config() {
    let temp_dir = TempDir::new().unwrap();
    std::fs::write(
        temp_dir.path().join("storage.conf"),
        r#"
            [hot]
            method = "basedb"
            capacity = { M = 64 }
            options = ["nosync"]

            [cold]
            method = "dayfile"
            capacity = { G = 1 }
        "#,
    )
    .unwrap();

    let backends = open_storages(temp_dir.path(), &BackendRegistry::with_defaults()).unwrap();
    let best = backends
        .iter()
        .max_by_key(|backend| backend.storage.free_capacity())
        .unwrap();
    assert_eq!(best.name, "cold");

    let key = best.storage.store(b"routed", ts(2024, 1, 1)).unwrap();
    assert_eq!(best.storage.load(&key).unwrap().data, b"routed".to_vec());
}

fn journal_config() -> StorageConfig {
    StorageConfig::new("journal", Size::mib(1)).with_option(OPTION_NOSYNC)
}

/// Handle of the freed-bytes counter, read straight from the master record
fn track_record(dir: &Path) -> (std::fs::File, u64) {
    let file = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open(dir.join(DATA_FILE))
        .unwrap();
    let mut word = [0u8; 8];
    file.read_exact_at(&mut word, 0).unwrap();
    let master = u64::from_be_bytes(word);
    assert!(master >= JOURNAL_SIZE);
    file.read_exact_at(&mut word, master + 8).unwrap();
    (file, u64::from_be_bytes(word))
}

#[test]
fn journal_replays_committed_record() {
    let temp_dir = TempDir::new().unwrap();
    let key = {
        let storage = JournalStorage::open(temp_dir.path(), &journal_config()).unwrap();
        storage.store(b"kept", ts(2024, 1, 10)).unwrap()
    };

    let (file, track) = track_record(temp_dir.path());
    let record = WalRecord {
        seq: 1000,
        new_end: file.metadata().unwrap().len(),
        writes: vec![(track, 4096u64.to_be_bytes().to_vec())],
    };
    file.write_all_at(&record.serialize_with_checksum(), WAL_START)
        .unwrap();
    drop(file);

    let storage = JournalStorage::open(temp_dir.path(), &journal_config()).unwrap();
    assert_eq!(storage.freed_bytes(), 4096);
    assert_eq!(storage.load(&key).unwrap().data, b"kept".to_vec());
}

#[test]
fn journal_discards_torn_record() {
    let temp_dir = TempDir::new().unwrap();
    let key = {
        let storage = JournalStorage::open(temp_dir.path(), &journal_config()).unwrap();
        storage.store(b"kept", ts(2024, 1, 10)).unwrap()
    };

    let (file, track) = track_record(temp_dir.path());
    let record = WalRecord {
        seq: 1000,
        new_end: file.metadata().unwrap().len(),
        writes: vec![(track, 4096u64.to_be_bytes().to_vec())],
    };
    let mut raw = record.serialize_with_checksum().to_vec();
    let last = raw.len() - 1;
    raw[last] ^= 0xFF;
    file.write_all_at(&raw, WAL_START).unwrap();
    drop(file);

    let storage = JournalStorage::open(temp_dir.path(), &journal_config()).unwrap();
    assert_eq!(storage.freed_bytes(), 0);
    assert_eq!(storage.load(&key).unwrap().data, b"kept".to_vec());
    assert_eq!(
        storage.days().unwrap(),
        vec![DayKey::from_timestamp(ts(2024, 1, 10))]
    );
}

#[test]
fn journal_expiry_survives_reopen() {
    let temp_dir = TempDir::new().unwrap();
    let (old, new) = {
        let storage = JournalStorage::open(temp_dir.path(), &journal_config()).unwrap();
        let old = storage.store(b"old", ts(2024, 1, 5)).unwrap();
        let new = storage.store(b"new", ts(2024, 1, 10)).unwrap();
        storage.expire(ts(2024, 1, 8)).unwrap();
        (old, new)
    };

    let storage = JournalStorage::open(temp_dir.path(), &journal_config()).unwrap();
    assert!(storage.freed_bytes() > 0);
    assert!(storage.load(&old).is_err());
    assert_eq!(storage.load(&new).unwrap().data, b"new".to_vec());
}
