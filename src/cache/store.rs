//! On-disk result cache with atomic two-file commits
//!
//! Files in the cache directory:
//! - `chart_data.json` - the merged `CacheData`
//! - `last_update.json` - `{"last_data_point": "<naive ISO-8601>"}`
//!
//! A commit writes both files to temporaries in the same directory, fsyncs
//! them, and renames them over the live files while holding the exclusive
//! lock. Readers hold the shared lock for one read of cursor then data.
//! The previous data file is kept as `.chart_data.json.old` until the cursor
//! rename succeeds, and is moved back if it fails.

use super::merge::CacheData;
use crate::pipeline::db::StoreError;
use chrono::{DateTime, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use tempfile::NamedTempFile;

pub const CHART_DATA_FILE: &str = "chart_data.json";
pub const LAST_UPDATE_FILE: &str = "last_update.json";
const DATA_BACKUP_FILE: &str = ".chart_data.json.old";

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("Cache IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Cache JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Unreadable cursor timestamp: {0}")]
    InvalidCursor(String),

    #[error("Cursor would move backwards ({current} -> {proposed})")]
    CursorRegression {
        current: NaiveDateTime,
        proposed: NaiveDateTime,
    },

    #[error("Refusing to commit an empty cache")]
    EmptyBatch,

    #[error("Cache lock poisoned")]
    LockPoisoned,

    #[error("Strength store error: {0}")]
    Store(#[from] StoreError),
}

#[derive(Debug, Serialize, Deserialize)]
struct CursorFile {
    #[serde(alias = "timestamp")]
    last_data_point: String,
}

/// Parse a cursor as written by any writer of `last_update.json`
///
/// Accepts naive ISO-8601 (`T` or space separated) and RFC 3339 with an
/// offset, in which case the offset is dropped.
fn parse_cursor(raw: &str) -> Result<NaiveDateTime, CacheError> {
    let raw = raw.trim();
    raw.parse::<NaiveDateTime>()
        .or_else(|_| NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f"))
        .or_else(|_| DateTime::parse_from_rfc3339(raw).map(|dt| dt.naive_local()))
        .map_err(|_| CacheError::InvalidCursor(raw.to_string()))
}

fn format_cursor(cursor: NaiveDateTime) -> String {
    cursor.format("%Y-%m-%dT%H:%M:%S%.f").to_string()
}

/// Handle to a cache directory, cheap to clone and share between tasks
///
/// The lock only orders readers and writers sharing this handle's process.
/// Readers in other processes (`cache_dump`, dashboards) take no lock: each
/// file they open is always a complete write, but between their cursor read
/// and data read a commit may land, so they can see data newer than the
/// cursor. They never see a cursor ahead of its data.
#[derive(Debug, Clone)]
pub struct ResultCache {
    dir: PathBuf,
    lock: Arc<RwLock<()>>,
}

impl ResultCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            lock: Arc::new(RwLock::new(())),
        }
    }

    /// Handle to `dir`, creating the directory if needed
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, CacheError> {
        let cache = Self::new(dir);
        fs::create_dir_all(&cache.dir)?;
        Ok(cache)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn data_path(&self) -> PathBuf {
        self.dir.join(CHART_DATA_FILE)
    }

    pub fn cursor_path(&self) -> PathBuf {
        self.dir.join(LAST_UPDATE_FILE)
    }

    /// Committed cursor, `None` before the first commit
    pub fn cursor(&self) -> Result<Option<NaiveDateTime>, CacheError> {
        let _guard = self.lock.read().map_err(|_| CacheError::LockPoisoned)?;
        self.read_cursor()
    }

    /// Committed cursor and data, `None` before the first commit
    ///
    /// The data file is only read once the cursor file has parsed.
    pub fn read(&self) -> Result<Option<(NaiveDateTime, CacheData)>, CacheError> {
        let _guard = self.lock.read().map_err(|_| CacheError::LockPoisoned)?;

        let Some(cursor) = self.read_cursor()? else {
            return Ok(None);
        };

        let data = match fs::read(self.data_path()) {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        Ok(Some((cursor, data)))
    }

    /// Atomically replace the cache with `data` and advance the cursor
    ///
    /// Any failure leaves the committed files untouched and removes the
    /// temporaries. The cursor may stay put but never move backwards.
    pub fn commit(&self, data: &CacheData, cursor: NaiveDateTime) -> Result<(), CacheError> {
        if data.is_empty() {
            return Err(CacheError::EmptyBatch);
        }

        fs::create_dir_all(&self.dir)?;

        let data_tmp = self.write_temp(".chart_data.", &serde_json::to_vec(data)?)?;
        let cursor_file = CursorFile {
            last_data_point: format_cursor(cursor),
        };
        let cursor_tmp = self.write_temp(".last_update.", &serde_json::to_vec(&cursor_file)?)?;

        let _guard = self.lock.write().map_err(|_| CacheError::LockPoisoned)?;

        match self.read_cursor() {
            Ok(Some(current)) if cursor < current => {
                return Err(CacheError::CursorRegression {
                    current,
                    proposed: cursor,
                });
            }
            Ok(_) => {}
            Err(e) => log::warn!("⚠️  Replacing unreadable cache cursor: {}", e),
        }

        let backup = self.dir.join(DATA_BACKUP_FILE);
        let had_data = self.backup_data(&backup)?;

        // Data before cursor: a crash in between leaves the cursor behind the
        // data, and the next refresh re-merges the same rows.
        if let Err(e) = data_tmp.persist(self.data_path()) {
            self.discard_backup(&backup);
            return Err(e.error.into());
        }
        if let Err(e) = cursor_tmp.persist(self.cursor_path()) {
            self.restore_data(&backup, had_data);
            return Err(e.error.into());
        }
        self.discard_backup(&backup);

        log::debug!(
            "💾 Cache committed: {} points, cursor {}",
            data.point_count(),
            cursor
        );
        Ok(())
    }

    fn read_cursor(&self) -> Result<Option<NaiveDateTime>, CacheError> {
        let bytes = match fs::read(self.cursor_path()) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let file: CursorFile = serde_json::from_slice(&bytes)?;
        parse_cursor(&file.last_data_point).map(Some)
    }

    /// Keep the live data file reachable at `backup`; false if there is none
    fn backup_data(&self, backup: &Path) -> Result<bool, CacheError> {
        remove_if_exists(backup)?;
        match fs::hard_link(self.data_path(), backup) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => {
                log::debug!("🔍 Hard link unavailable ({}), copying data file", e);
                fs::copy(self.data_path(), backup)?;
                Ok(true)
            }
        }
    }

    /// Put the previous data file back after the cursor failed to move
    fn restore_data(&self, backup: &Path, had_data: bool) {
        let restored = if had_data {
            fs::rename(backup, self.data_path())
        } else {
            remove_if_exists(&self.data_path())
        };
        if let Err(e) = restored {
            log::error!("❌ Failed to restore previous cache data: {}", e);
        }
    }

    fn discard_backup(&self, backup: &Path) {
        if let Err(e) = remove_if_exists(backup) {
            log::warn!("⚠️  Failed to remove cache backup {}: {}", backup.display(), e);
        }
    }

    fn write_temp(&self, prefix: &str, bytes: &[u8]) -> Result<NamedTempFile, CacheError> {
        let mut tmp = tempfile::Builder::new()
            .prefix(prefix)
            .suffix(".tmp")
            .tempfile_in(&self.dir)?;
        tmp.write_all(bytes)?;
        tmp.as_file().sync_all()?;
        Ok(tmp)
    }
}

fn remove_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::merge::CachePoint;
    use chrono::NaiveDate;
    use tempfile::TempDir;

    fn at(h: u32, m: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2025, 3, 1)
            .unwrap()
            .and_hms_opt(h, m, 0)
            .unwrap()
    }

    fn sample_data(ts: NaiveDateTime, strength: f64) -> CacheData {
        let mut data = CacheData::new();
        data.push(
            "top_5",
            "DeFi",
            CachePoint {
                timestamp: ts,
                strength: Some(strength),
            },
        );
        data
    }

    fn dir_entries(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn test_empty_cache_reads_none() {
        let dir = TempDir::new().unwrap();
        let cache = ResultCache::open(dir.path()).unwrap();
        assert!(cache.read().unwrap().is_none());
        assert!(cache.cursor().unwrap().is_none());
    }

    #[test]
    fn test_commit_then_read() {
        let dir = TempDir::new().unwrap();
        let cache = ResultCache::open(dir.path()).unwrap();
        let data = sample_data(at(12, 0), 1.25);

        cache.commit(&data, at(12, 0)).unwrap();

        let (cursor, read_back) = cache.read().unwrap().unwrap();
        assert_eq!(cursor, at(12, 0));
        assert_eq!(read_back, data);
        assert_eq!(dir_entries(dir.path()), vec![CHART_DATA_FILE, LAST_UPDATE_FILE]);

        let raw: serde_json::Value =
            serde_json::from_slice(&fs::read(cache.cursor_path()).unwrap()).unwrap();
        assert_eq!(raw["last_data_point"], "2025-03-01T12:00:00");
    }

    #[test]
    fn test_failed_commit_leaves_files_byte_identical() {
        let dir = TempDir::new().unwrap();
        let cache = ResultCache::open(dir.path()).unwrap();
        cache.commit(&sample_data(at(12, 10), 1.0), at(12, 10)).unwrap();

        let data_before = fs::read(cache.data_path()).unwrap();
        let cursor_before = fs::read(cache.cursor_path()).unwrap();

        let result = cache.commit(&sample_data(at(12, 0), 2.0), at(12, 0));
        assert!(matches!(result, Err(CacheError::CursorRegression { .. })));

        assert_eq!(fs::read(cache.data_path()).unwrap(), data_before);
        assert_eq!(fs::read(cache.cursor_path()).unwrap(), cursor_before);
        assert_eq!(dir_entries(dir.path()), vec![CHART_DATA_FILE, LAST_UPDATE_FILE]);
    }

    #[test]
    fn test_cursor_rename_failure_restores_data() {
        let dir = TempDir::new().unwrap();
        let cache = ResultCache::open(dir.path()).unwrap();
        cache.commit(&sample_data(at(12, 0), 1.0), at(12, 0)).unwrap();
        let data_before = fs::read(cache.data_path()).unwrap();

        // A non-empty directory cannot be renamed over
        fs::remove_file(cache.cursor_path()).unwrap();
        fs::create_dir(cache.cursor_path()).unwrap();
        fs::write(cache.cursor_path().join("keep"), b"x").unwrap();

        let mut bigger = sample_data(at(12, 0), 1.0);
        bigger.push(
            "top_5",
            "DeFi",
            CachePoint {
                timestamp: at(12, 10),
                strength: Some(1.1),
            },
        );
        let result = cache.commit(&bigger, at(12, 10));

        assert!(matches!(result, Err(CacheError::Io(_))));
        assert_eq!(fs::read(cache.data_path()).unwrap(), data_before);
        assert_eq!(dir_entries(dir.path()), vec![CHART_DATA_FILE, LAST_UPDATE_FILE]);
    }

    #[test]
    fn test_cursor_rename_failure_on_first_commit_leaves_no_data() {
        let dir = TempDir::new().unwrap();
        let cache = ResultCache::open(dir.path()).unwrap();
        fs::create_dir(cache.cursor_path()).unwrap();
        fs::write(cache.cursor_path().join("keep"), b"x").unwrap();

        assert!(cache.commit(&sample_data(at(12, 0), 1.0), at(12, 0)).is_err());
        assert_eq!(dir_entries(dir.path()), vec![LAST_UPDATE_FILE]);
    }

    #[test]
    fn test_empty_commit_rejected() {
        let dir = TempDir::new().unwrap();
        let cache = ResultCache::open(dir.path()).unwrap();
        assert!(matches!(
            cache.commit(&CacheData::new(), at(12, 0)),
            Err(CacheError::EmptyBatch)
        ));
        assert!(dir_entries(dir.path()).is_empty());
    }

    #[test]
    fn test_recommit_same_cursor_allowed() {
        let dir = TempDir::new().unwrap();
        let cache = ResultCache::open(dir.path()).unwrap();
        cache.commit(&sample_data(at(12, 0), 1.0), at(12, 0)).unwrap();
        cache.commit(&sample_data(at(12, 0), 1.5), at(12, 0)).unwrap();

        let (_, data) = cache.read().unwrap().unwrap();
        assert_eq!(data.series("top_5", "DeFi").unwrap()[0].strength, Some(1.5));
    }

    #[test]
    fn test_legacy_cursor_formats() {
        let dir = TempDir::new().unwrap();
        let cache = ResultCache::open(dir.path()).unwrap();

        fs::write(cache.cursor_path(), r#"{"timestamp": "2025-03-01T12:00:00+00:00"}"#).unwrap();
        assert_eq!(cache.cursor().unwrap(), Some(at(12, 0)));

        fs::write(cache.cursor_path(), r#"{"last_data_point": "2025-03-01 12:10:00"}"#).unwrap();
        assert_eq!(cache.cursor().unwrap(), Some(at(12, 10)));

        fs::write(cache.cursor_path(), r#"{"last_data_point": "yesterday"}"#).unwrap();
        assert!(matches!(cache.cursor(), Err(CacheError::InvalidCursor(_))));
    }

    #[test]
    fn test_cursor_without_data_reads_none() {
        let dir = TempDir::new().unwrap();
        let cache = ResultCache::open(dir.path()).unwrap();
        fs::write(cache.cursor_path(), r#"{"last_data_point": "2025-03-01T12:00:00"}"#).unwrap();
        assert!(cache.read().unwrap().is_none());
    }
}
