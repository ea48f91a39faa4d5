//! Core types for BlobVault

use crate::{BlobError, Result};
use chrono::{DateTime, Datelike, NaiveDate};
use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};

/// Timestamp in seconds since Unix epoch
pub type Timestamp = i64;

/// Seconds in one UTC day
pub const SECONDS_PER_DAY: i64 = 24 * 60 * 60;

/// 0000-01-01T00:00:00Z
const MIN_TIMESTAMP: Timestamp = -62_167_219_200;
/// 9999-12-31T23:59:59Z
const MAX_TIMESTAMP: Timestamp = 253_402_300_799;

/// UTC calendar day of a blob, rendered as the 8 ASCII digits `YYYYMMDD`.
///
/// The byte form sorts chronologically, so it doubles as an index key and as
/// a day-file name. Timestamps outside years 0000..=9999 are clamped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DayKey([u8; 8]);

impl DayKey {
    /// Length of the textual form
    pub const LEN: usize = 8;

    /// Day bucket containing `ts`
    pub fn from_timestamp(ts: Timestamp) -> Self {
        let ts = ts.clamp(MIN_TIMESTAMP, MAX_TIMESTAMP);
        let date = DateTime::from_timestamp(ts, 0)
            .map(|dt| dt.date_naive())
            .unwrap_or(NaiveDate::MIN);
        Self::from_date(date)
    }

    /// Day bucket for a day number (days since 1970-01-01)
    pub fn from_day_number(day: i64) -> Self {
        Self::from_timestamp(day.saturating_mul(SECONDS_PER_DAY))
    }

    /// Parse an 8-digit day name, rejecting anything that is not a real date.
    pub fn parse(name: &str) -> Option<Self> {
        if name.len() != Self::LEN || !name.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        NaiveDate::parse_from_str(name, "%Y%m%d")
            .ok()
            .map(Self::from_date)
    }

    fn from_date(date: NaiveDate) -> Self {
        let year = date.year().clamp(0, 9999) as u32;
        let text = format!("{:04}{:02}{:02}", year, date.month(), date.day());
        let mut key = [b'0'; 8];
        key.copy_from_slice(text.as_bytes());
        Self(key)
    }

    fn date(&self) -> NaiveDate {
        NaiveDate::parse_from_str(self.as_str(), "%Y%m%d").unwrap_or(NaiveDate::MIN)
    }

    /// Days since 1970-01-01 (negative before the epoch)
    pub fn day_number(&self) -> i64 {
        self.start().div_euclid(SECONDS_PER_DAY)
    }

    /// Midnight UTC at the start of this day
    pub fn start(&self) -> Timestamp {
        self.date()
            .and_hms_opt(0, 0, 0)
            .map(|dt| dt.and_utc().timestamp())
            .unwrap_or(MIN_TIMESTAMP)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn to_bytes(self) -> [u8; 8] {
        self.0
    }

    /// Inverse of [`DayKey::to_bytes`]
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        std::str::from_utf8(bytes).ok().and_then(Self::parse)
    }

    pub fn as_str(&self) -> &str {
        // Always ASCII digits.
        std::str::from_utf8(&self.0).unwrap_or("00000101")
    }
}

impl fmt::Display for DayKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Retention cutoff of a backend instance.
///
/// Only ever moves forward. Stores strictly before it are refused.
#[derive(Debug)]
pub struct Cutoff(AtomicI64);

impl Cutoff {
    /// No cutoff yet
    pub fn new() -> Self {
        Self(AtomicI64::new(i64::MIN))
    }

    /// Current cutoff
    pub fn get(&self) -> Timestamp {
        self.0.load(Ordering::Acquire)
    }

    /// Raise the cutoff to `ts`. Returns false if it was already at or past it.
    pub fn raise(&self, ts: Timestamp) -> bool {
        self.0.fetch_max(ts, Ordering::AcqRel) < ts
    }

    /// Refuse timestamps before the cutoff
    pub fn admit(&self, ts: Timestamp) -> Result<()> {
        let cutoff = self.get();
        if ts < cutoff {
            return Err(BlobError::BeforeCutoff {
                timestamp: ts,
                cutoff,
            });
        }
        Ok(())
    }

    /// Day bucket of the cutoff; buckets before it are gone
    pub fn day(&self) -> Option<DayKey> {
        match self.get() {
            i64::MIN => None,
            ts => Some(DayKey::from_timestamp(ts)),
        }
    }
}

impl Default for Cutoff {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
pub(crate) fn ts(year: i32, month: u32, day: u32) -> Timestamp {
    NaiveDate::from_ymd_opt(year, month, day)
        .and_then(|d| d.and_hms_opt(12, 0, 0))
        .map(|dt| dt.and_utc().timestamp())
        .unwrap()
}
