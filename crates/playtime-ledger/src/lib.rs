//! Durable storage for consumed playtime.
//!
//! The ledger maps each user to the seconds they consumed on each UTC
//! calendar day. It is persisted as a single JSON document:
//!
//! ```json
//! {
//!   "4d2a...": { "2025-01-15": 3120, "2025-01-16": 600 }
//! }
//! ```
//!
//! # Crash Safety
//!
//! [`DailyLedger::save`] writes into a temporary file in the same directory
//! as the target, syncs it, and renames it over the real path. A crash at
//! any point leaves either the previous ledger or the new one on disk, never
//! a truncated mix of both.
//!
//! # Thread Safety
//!
//! `DailyLedger` is a plain value with no interior mutability. Callers that
//! share it across threads wrap it in their own lock.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use thiserror::Error;

/// The all-zero GUID some media hosts report when no user is signed in.
const EMPTY_GUID: &str = "00000000-0000-0000-0000-000000000000";

/// Ledger persistence errors.
#[derive(Debug, Error)]
pub enum LedgerError {
    /// Reading, writing, or syncing a file failed.
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    /// The ledger could not be encoded or decoded.
    #[error("invalid ledger JSON: {0}")]
    Json(#[from] serde_json::Error),
    /// The atomic rename over the ledger path failed.
    #[error("failed to replace {path}: {source}")]
    Persist {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Stable identifier for a human account.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns `true` for the reserved "no authenticated user" identifier.
    pub fn is_empty_sentinel(&self) -> bool {
        let trimmed = self.0.trim();
        trimmed.is_empty()
            || trimmed.eq_ignore_ascii_case(EMPTY_GUID)
            || trimmed.chars().all(|c| c == '0')
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UserId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for UserId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Per-user, per-day accumulated playtime in whole seconds.
///
/// A missing user or day means zero seconds. Buckets only grow, except
/// through [`DailyLedger::reset_day`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DailyLedger {
    entries: BTreeMap<UserId, BTreeMap<NaiveDate, u64>>,
}

impl DailyLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Seconds recorded for `user` on `day`, zero if nothing was recorded.
    pub fn completed_seconds(&self, user: &UserId, day: NaiveDate) -> u64 {
        self.entries
            .get(user)
            .and_then(|days| days.get(&day))
            .copied()
            .unwrap_or(0)
    }

    /// Adds `delta` seconds to the bucket for `user` on `day`.
    ///
    /// A zero delta leaves the ledger untouched, so no empty buckets appear.
    pub fn add_seconds(&mut self, user: &UserId, day: NaiveDate, delta: u64) {
        if delta == 0 {
            return;
        }
        let bucket = self
            .entries
            .entry(user.clone())
            .or_default()
            .entry(day)
            .or_insert(0);
        *bucket = bucket.saturating_add(delta);
    }

    /// Folds the wall-clock interval `[from, to)` into the ledger, crediting
    /// each UTC day the interval touches with its own share.
    ///
    /// Returns the total number of seconds credited.
    pub fn add_interval(&mut self, user: &UserId, from: DateTime<Utc>, to: DateTime<Utc>) -> u64 {
        let mut total = 0;
        for (day, seconds) in split_at_midnights(from, to) {
            self.add_seconds(user, day, seconds);
            total += seconds;
        }
        total
    }

    /// Deletes the bucket for `user` on `day`.
    ///
    /// Returns the number of seconds that were removed.
    pub fn reset_day(&mut self, user: &UserId, day: NaiveDate) -> u64 {
        let Some(days) = self.entries.get_mut(user) else {
            return 0;
        };
        let removed = days.remove(&day).unwrap_or(0);
        if days.is_empty() {
            self.entries.remove(user);
        }
        removed
    }

    /// Users with at least one recorded day, in sorted order.
    pub fn users(&self) -> impl Iterator<Item = &UserId> {
        self.entries.keys()
    }

    /// All recorded days for `user`, oldest first.
    pub fn days_for(&self, user: &UserId) -> Vec<(NaiveDate, u64)> {
        self.entries
            .get(user)
            .map(|days| days.iter().map(|(d, s)| (*d, *s)).collect())
            .unwrap_or_default()
    }

    /// Reads a ledger from `path`, surfacing every failure.
    ///
    /// A missing, empty, or whitespace-only file is an empty ledger.
    pub fn read(path: &Path) -> Result<Self, LedgerError> {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::new()),
            Err(source) => {
                return Err(LedgerError::Io {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };
        if content.trim().is_empty() {
            return Ok(Self::new());
        }
        Ok(serde_json::from_str(&content)?)
    }

    /// Loads a ledger from `path` for a long-running process.
    ///
    /// Never fails: unreadable or malformed data is logged and the process
    /// starts from an empty ledger.
    pub fn load(path: &Path) -> Self {
        match Self::read(path) {
            Ok(ledger) => {
                tracing::debug!(path = %path.display(), users = ledger.entries.len(), "loaded ledger");
                ledger
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "could not load ledger, starting empty");
                Self::new()
            }
        }
    }

    /// Atomically writes the ledger to `path`.
    pub fn save(&self, path: &Path) -> Result<(), LedgerError> {
        let dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let io_err = |source: std::io::Error| LedgerError::Io {
            path: dir.to_path_buf(),
            source,
        };

        fs::create_dir_all(dir).map_err(io_err)?;

        let json = serde_json::to_vec_pretty(self)?;
        let mut tmp = NamedTempFile::new_in(dir).map_err(io_err)?;
        tmp.write_all(&json).map_err(io_err)?;
        tmp.as_file().sync_all().map_err(io_err)?;
        tmp.persist(path).map_err(|e| LedgerError::Persist {
            path: path.to_path_buf(),
            source: e.error,
        })?;

        tracing::debug!(path = %path.display(), bytes = json.len(), "saved ledger");
        Ok(())
    }
}

/// Splits `[from, to)` at every UTC midnight it crosses.
///
/// Each segment is credited to the calendar day it starts on. Segments are
/// whole seconds; an empty or inverted interval yields nothing.
pub fn split_at_midnights(from: DateTime<Utc>, to: DateTime<Utc>) -> Vec<(NaiveDate, u64)> {
    let mut segments = Vec::new();
    let mut cursor = from;

    while cursor < to {
        let day = cursor.date_naive();
        let Some(next_day) = day.succ_opt() else {
            break;
        };
        let next_midnight = next_day.and_time(NaiveTime::MIN).and_utc();
        let segment_end = to.min(next_midnight);
        let seconds = u64::try_from((segment_end - cursor).num_seconds()).unwrap_or(0);
        if seconds > 0 {
            segments.push((day, seconds));
        }
        cursor = segment_end;
    }

    segments
}

/// Formats a day the way it appears as a ledger key.
pub fn day_key(day: NaiveDate) -> String {
    day.format("%Y-%m-%d").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn day(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn at(y: i32, m: u32, d: u32, h: u32, min: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, s).unwrap()
    }

    #[test]
    fn missing_entries_read_as_zero() {
        let ledger = DailyLedger::new();
        assert_eq!(ledger.completed_seconds(&"alice".into(), day(2025, 1, 15)), 0);
    }

    #[test]
    fn add_seconds_accumulates_per_day() {
        let mut ledger = DailyLedger::new();
        let alice = UserId::from("alice");

        ledger.add_seconds(&alice, day(2025, 1, 15), 30);
        ledger.add_seconds(&alice, day(2025, 1, 15), 45);
        ledger.add_seconds(&alice, day(2025, 1, 16), 10);

        assert_eq!(ledger.completed_seconds(&alice, day(2025, 1, 15)), 75);
        assert_eq!(ledger.completed_seconds(&alice, day(2025, 1, 16)), 10);
    }

    #[test]
    fn zero_delta_creates_no_bucket() {
        let mut ledger = DailyLedger::new();
        ledger.add_seconds(&"alice".into(), day(2025, 1, 15), 0);
        assert!(ledger.is_empty());
    }

    #[test]
    fn reset_day_removes_only_that_bucket() {
        let mut ledger = DailyLedger::new();
        let alice = UserId::from("alice");
        ledger.add_seconds(&alice, day(2025, 1, 14), 100);
        ledger.add_seconds(&alice, day(2025, 1, 15), 200);

        assert_eq!(ledger.reset_day(&alice, day(2025, 1, 15)), 200);
        assert_eq!(ledger.completed_seconds(&alice, day(2025, 1, 15)), 0);
        assert_eq!(ledger.completed_seconds(&alice, day(2025, 1, 14)), 100);

        assert_eq!(ledger.reset_day(&alice, day(2025, 1, 14)), 100);
        assert!(ledger.is_empty());
        assert_eq!(ledger.reset_day(&"bob".into(), day(2025, 1, 14)), 0);
    }

    #[test]
    fn split_within_one_day_is_single_segment() {
        let segments = split_at_midnights(at(2025, 1, 15, 10, 0, 0), at(2025, 1, 15, 10, 30, 0));
        assert_eq!(segments, vec![(day(2025, 1, 15), 1800)]);
    }

    #[test]
    fn split_across_midnight_credits_each_day() {
        let segments = split_at_midnights(at(2025, 1, 15, 23, 50, 0), at(2025, 1, 16, 0, 5, 0));
        assert_eq!(
            segments,
            vec![(day(2025, 1, 15), 600), (day(2025, 1, 16), 300)]
        );
    }

    #[test]
    fn split_spanning_full_days() {
        let segments = split_at_midnights(at(2025, 1, 15, 12, 0, 0), at(2025, 1, 17, 1, 0, 0));
        assert_eq!(
            segments,
            vec![
                (day(2025, 1, 15), 43_200),
                (day(2025, 1, 16), 86_400),
                (day(2025, 1, 17), 3_600),
            ]
        );
    }

    #[test]
    fn split_ending_exactly_at_midnight_stays_on_first_day() {
        let segments = split_at_midnights(at(2025, 1, 15, 23, 0, 0), at(2025, 1, 16, 0, 0, 0));
        assert_eq!(segments, vec![(day(2025, 1, 15), 3600)]);
    }

    #[test]
    fn split_of_inverted_interval_is_empty() {
        let t = at(2025, 1, 15, 12, 0, 0);
        assert!(split_at_midnights(t, t).is_empty());
        assert!(split_at_midnights(t, t - chrono::Duration::seconds(5)).is_empty());
    }

    #[test]
    fn add_interval_uses_midnight_split() {
        let mut ledger = DailyLedger::new();
        let alice = UserId::from("alice");
        let credited =
            ledger.add_interval(&alice, at(2025, 1, 15, 23, 59, 0), at(2025, 1, 16, 0, 1, 0));

        assert_eq!(credited, 120);
        assert_eq!(ledger.completed_seconds(&alice, day(2025, 1, 15)), 60);
        assert_eq!(ledger.completed_seconds(&alice, day(2025, 1, 16)), 60);
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.json");

        let mut ledger = DailyLedger::new();
        ledger.add_seconds(&"alice".into(), day(2025, 1, 15), 550);
        ledger.add_seconds(&"bob".into(), day(2025, 1, 14), 42);
        ledger.save(&path).unwrap();

        assert_eq!(DailyLedger::load(&path), ledger);
    }

    #[test]
    fn saved_layout_is_nested_user_day_map() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.json");

        let mut ledger = DailyLedger::new();
        ledger.add_seconds(&"alice".into(), day(2025, 1, 15), 550);
        ledger.save(&path).unwrap();

        let value: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(value, serde_json::json!({"alice": {"2025-01-15": 550}}));
    }

    #[test]
    fn save_creates_parent_directory_and_leaves_no_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("ledger.json");

        let mut ledger = DailyLedger::new();
        ledger.add_seconds(&"alice".into(), day(2025, 1, 15), 1);
        ledger.save(&path).unwrap();
        ledger.save(&path).unwrap();

        let names: Vec<_> = fs::read_dir(path.parent().unwrap())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(names, vec![std::ffi::OsString::from("ledger.json")]);
    }

    #[test]
    fn load_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(DailyLedger::load(&dir.path().join("absent.json")).is_empty());
    }

    #[test]
    fn load_empty_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.json");
        fs::write(&path, "  \n").unwrap();
        assert!(DailyLedger::read(&path).unwrap().is_empty());
    }

    #[test]
    fn load_malformed_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.json");
        fs::write(&path, r#"{"alice": {"2025-01-15": -5}}"#).unwrap();

        assert!(matches!(DailyLedger::read(&path), Err(LedgerError::Json(_))));
        assert!(DailyLedger::load(&path).is_empty());
    }

    #[test]
    fn empty_sentinel_detection() {
        assert!(UserId::from("").is_empty_sentinel());
        assert!(UserId::from(EMPTY_GUID).is_empty_sentinel());
        assert!(UserId::from("00000000000000000000000000000000").is_empty_sentinel());
        assert!(!UserId::from("4d2a9c").is_empty_sentinel());
    }

    #[test]
    fn day_key_is_iso_date() {
        assert_eq!(day_key(day(2025, 3, 7)), "2025-03-07");
    }
}
