// 🗄️ Run Store - On-disk layout, run index, atomic JSON
//
// runs/
//   index.json                 [{run_id, demo_type, started_at, finished_at}]
//   <run_id>/
//     audit.json
//     mapping.json
//     recommendations.json
//     artifacts/

use chrono::{DateTime, Duration, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::ser::{Formatter, PrettyFormatter};
use std::collections::HashMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use crate::error::AuditError;
use crate::schema::DocumentType;

pub const INDEX_FILENAME: &str = "index.json";
pub const AUDIT_FILENAME: &str = "audit.json";
pub const MAPPING_FILENAME: &str = "mapping.json";
pub const RECOMMENDATIONS_FILENAME: &str = "recommendations.json";
pub const ARTIFACTS_DIRNAME: &str = "artifacts";

// ============================================================================
// ASCII-ESCAPED PRETTY JSON
// ============================================================================

/// PrettyFormatter that writes every non-ASCII character as a \uXXXX escape.
struct AsciiPrettyFormatter {
    inner: PrettyFormatter<'static>,
}

impl AsciiPrettyFormatter {
    fn new() -> Self {
        AsciiPrettyFormatter {
            inner: PrettyFormatter::new(),
        }
    }
}

impl Formatter for AsciiPrettyFormatter {
    fn write_string_fragment<W: ?Sized + Write>(&mut self, writer: &mut W, fragment: &str) -> io::Result<()> {
        let mut units = [0u16; 2];
        for c in fragment.chars() {
            if c.is_ascii() {
                writer.write_all(&[c as u8])?;
            } else {
                for unit in c.encode_utf16(&mut units) {
                    write!(writer, "\\u{:04x}", unit)?;
                }
            }
        }
        Ok(())
    }

    fn begin_array<W: ?Sized + Write>(&mut self, writer: &mut W) -> io::Result<()> {
        self.inner.begin_array(writer)
    }

    fn end_array<W: ?Sized + Write>(&mut self, writer: &mut W) -> io::Result<()> {
        self.inner.end_array(writer)
    }

    fn begin_array_value<W: ?Sized + Write>(&mut self, writer: &mut W, first: bool) -> io::Result<()> {
        self.inner.begin_array_value(writer, first)
    }

    fn end_array_value<W: ?Sized + Write>(&mut self, writer: &mut W) -> io::Result<()> {
        self.inner.end_array_value(writer)
    }

    fn begin_object<W: ?Sized + Write>(&mut self, writer: &mut W) -> io::Result<()> {
        self.inner.begin_object(writer)
    }

    fn end_object<W: ?Sized + Write>(&mut self, writer: &mut W) -> io::Result<()> {
        self.inner.end_object(writer)
    }

    fn begin_object_key<W: ?Sized + Write>(&mut self, writer: &mut W, first: bool) -> io::Result<()> {
        self.inner.begin_object_key(writer, first)
    }

    fn begin_object_value<W: ?Sized + Write>(&mut self, writer: &mut W) -> io::Result<()> {
        self.inner.begin_object_value(writer)
    }

    fn end_object_value<W: ?Sized + Write>(&mut self, writer: &mut W) -> io::Result<()> {
        self.inner.end_object_value(writer)
    }
}

/// Pretty-printed, two-space indented, ASCII-only JSON.
pub fn to_ascii_json<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, serde_json::Error> {
    let mut buffer = Vec::new();
    let mut serializer = serde_json::Serializer::with_formatter(&mut buffer, AsciiPrettyFormatter::new());
    value.serialize(&mut serializer)?;
    Ok(buffer)
}

// ============================================================================
// FILE HELPERS
// ============================================================================

fn io_error(path: &Path) -> impl FnOnce(io::Error) -> AuditError + '_ {
    move |source| AuditError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Write-temp-then-rename. Readers see the old file or the new one, never half of either.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), AuditError> {
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("data");
    let temp = path.with_file_name(format!(".{}.{}.tmp", file_name, uuid::Uuid::new_v4()));

    let result = (|| -> io::Result<()> {
        let mut file = fs::File::create(&temp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        fs::rename(&temp, path)
    })();

    if result.is_err() {
        let _ = fs::remove_file(&temp);
    }
    result.map_err(io_error(path))
}

pub fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<(), AuditError> {
    let bytes = to_ascii_json(value).map_err(|source| AuditError::Json {
        path: path.to_path_buf(),
        source,
    })?;
    write_atomic(path, &bytes)
}

pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, AuditError> {
    let content = fs::read_to_string(path).map_err(io_error(path))?;
    serde_json::from_str(&content).map_err(|source| AuditError::Json {
        path: path.to_path_buf(),
        source,
    })
}

/// Like [`read_json`] but a missing file yields `None`.
pub fn read_json_opt<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, AuditError> {
    if !path.exists() {
        return Ok(None);
    }
    read_json(path).map(Some)
}

// ============================================================================
// KEYED LOCKS
// ============================================================================

/// One mutex per key. Operations on the same key serialize, different keys don't.
#[derive(Debug, Default)]
pub struct KeyedLocks {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_for(&self, key: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Run `f` while holding the lock for `key`. Not re-entrant.
    pub fn with_lock<R>(&self, key: &str, f: impl FnOnce() -> R) -> R {
        let lock = self.lock_for(key);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
        f()
    }
}

// ============================================================================
// RUN INDEX
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunIndexEntry {
    pub run_id: String,
    pub demo_type: DocumentType,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl RunIndexEntry {
    /// finished_at when present, else started_at.
    pub fn last_activity(&self) -> DateTime<Utc> {
        self.finished_at.unwrap_or(self.started_at)
    }
}

// ============================================================================
// RUN STORE
// ============================================================================

/// Root of all persisted runs.
#[derive(Debug)]
pub struct RunStore {
    root: PathBuf,
    index_lock: Mutex<()>,
}

impl RunStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        RunStore {
            root: root.into(),
            index_lock: Mutex::new(()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Letters, digits, '-' and '_' only. Keeps run ids inside the root.
    pub fn validate_run_id(run_id: &str) -> Result<(), AuditError> {
        let valid = !run_id.is_empty()
            && run_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if valid {
            Ok(())
        } else {
            Err(AuditError::InvalidRunId(run_id.to_string()))
        }
    }

    pub fn run_dir(&self, run_id: &str) -> PathBuf {
        self.root.join(run_id)
    }

    pub fn artifacts_dir(&self, run_id: &str) -> PathBuf {
        self.run_dir(run_id).join(ARTIFACTS_DIRNAME)
    }

    pub fn audit_path(&self, run_id: &str) -> PathBuf {
        self.run_dir(run_id).join(AUDIT_FILENAME)
    }

    pub fn mapping_path(&self, run_id: &str) -> PathBuf {
        self.run_dir(run_id).join(MAPPING_FILENAME)
    }

    pub fn recommendations_path(&self, run_id: &str) -> PathBuf {
        self.run_dir(run_id).join(RECOMMENDATIONS_FILENAME)
    }

    fn index_path(&self) -> PathBuf {
        self.root.join(INDEX_FILENAME)
    }

    /// Create `<run_id>/artifacts/` (and the root) if needed.
    pub fn ensure_run_dir(&self, run_id: &str) -> Result<PathBuf, AuditError> {
        Self::validate_run_id(run_id)?;
        let artifacts = self.artifacts_dir(run_id);
        fs::create_dir_all(&artifacts).map_err(io_error(&artifacts))?;
        Ok(self.run_dir(run_id))
    }

    pub fn run_exists(&self, run_id: &str) -> bool {
        self.audit_path(run_id).exists()
    }

    // ------------------------------------------------------------------------
    // Index
    // ------------------------------------------------------------------------

    fn with_index<R>(&self, f: impl FnOnce() -> R) -> R {
        let _guard = self.index_lock.lock().unwrap_or_else(PoisonError::into_inner);
        f()
    }

    fn read_index(&self) -> Result<Vec<RunIndexEntry>, AuditError> {
        Ok(read_json_opt(&self.index_path())?.unwrap_or_default())
    }

    fn write_index(&self, entries: &[RunIndexEntry]) -> Result<(), AuditError> {
        fs::create_dir_all(&self.root).map_err(io_error(&self.root))?;
        write_json(&self.index_path(), entries)
    }

    /// Insert or update the entry keyed by run_id. Existing order is kept.
    pub fn upsert_index_entry(&self, entry: RunIndexEntry) -> Result<(), AuditError> {
        self.with_index(|| -> Result<(), AuditError> {
            let mut entries = self.read_index()?;
            match entries.iter_mut().find(|e| e.run_id == entry.run_id) {
                Some(existing) => *existing = entry,
                None => entries.push(entry),
            }
            self.write_index(&entries)
        })
    }

    /// All indexed runs, newest start first.
    pub fn list_runs(&self) -> Result<Vec<RunIndexEntry>, AuditError> {
        let mut entries = self.with_index(|| self.read_index())?;
        entries.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        Ok(entries)
    }

    pub fn delete_run(&self, run_id: &str) -> Result<(), AuditError> {
        Self::validate_run_id(run_id)?;
        self.with_index(|| -> Result<(), AuditError> {
            let dir = self.run_dir(run_id);
            if dir.exists() {
                fs::remove_dir_all(&dir).map_err(io_error(&dir))?;
            }
            let mut entries = self.read_index()?;
            entries.retain(|e| e.run_id != run_id);
            self.write_index(&entries)
        })
    }

    /// Remove every run and reset the index.
    pub fn clear_runs(&self) -> Result<(), AuditError> {
        self.with_index(|| -> Result<(), AuditError> {
            if self.root.exists() {
                fs::remove_dir_all(&self.root).map_err(io_error(&self.root))?;
            }
            self.write_index(&[])
        })
    }

    /// Delete runs whose last activity is older than `ttl_days`. 0 does nothing.
    ///
    /// Returns the removed run ids.
    pub fn cleanup_old_runs(&self, ttl_days: u32) -> Result<Vec<String>, AuditError> {
        self.cleanup_old_runs_at(ttl_days, Utc::now())
    }

    pub fn cleanup_old_runs_at(&self, ttl_days: u32, now: DateTime<Utc>) -> Result<Vec<String>, AuditError> {
        if ttl_days == 0 {
            return Ok(Vec::new());
        }
        // Past the representable range nothing can be that old
        let Some(threshold) = Duration::try_days(i64::from(ttl_days)).and_then(|ttl| now.checked_sub_signed(ttl))
        else {
            return Ok(Vec::new());
        };

        let removed = self.with_index(|| -> Result<Vec<String>, AuditError> {
            let entries = self.read_index()?;
            let (expired, remaining): (Vec<_>, Vec<_>) = entries
                .into_iter()
                .partition(|e| e.last_activity() < threshold);

            for entry in &expired {
                let dir = self.run_dir(&entry.run_id);
                if Self::validate_run_id(&entry.run_id).is_ok() && dir.exists() {
                    fs::remove_dir_all(&dir).map_err(io_error(&dir))?;
                }
            }
            if !expired.is_empty() {
                self.write_index(&remaining)?;
            }
            Ok(expired.into_iter().map(|e| e.run_id).collect())
        })?;

        if !removed.is_empty() {
            tracing::warn!("removed {} run(s) older than {} day(s)", removed.len(), ttl_days);
        }
        Ok(removed)
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn entry(run_id: &str, started_day: u32, finished_day: Option<u32>) -> RunIndexEntry {
        RunIndexEntry {
            run_id: run_id.to_string(),
            demo_type: DocumentType::EDocument,
            started_at: Utc.with_ymd_and_hms(2024, 1, started_day, 12, 0, 0).unwrap(),
            finished_at: finished_day.map(|d| Utc.with_ymd_and_hms(2024, 1, d, 12, 0, 0).unwrap()),
        }
    }

    #[test]
    fn test_ascii_json_escapes_non_ascii() {
        let bytes = to_ascii_json(&serde_json::json!({"title": "Kayıtlar yüklendi"})).unwrap();
        let text = String::from_utf8(bytes).unwrap();

        assert!(text.is_ascii());
        assert!(text.contains("Kay\\u0131tlar y\\u00fcklendi"));
        assert!(text.contains("\n  \"title\""));

        let back: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(back["title"], "Kayıtlar yüklendi");
    }

    #[test]
    fn test_index_upsert_and_sorted_listing() {
        let dir = TempDir::new().unwrap();
        let store = RunStore::new(dir.path().join("runs"));

        store.upsert_index_entry(entry("old", 1, None)).unwrap();
        store.upsert_index_entry(entry("new", 5, None)).unwrap();
        store.upsert_index_entry(entry("old", 1, Some(2))).unwrap();

        let runs = store.list_runs().unwrap();
        let ids: Vec<&str> = runs.iter().map(|r| r.run_id.as_str()).collect();
        assert_eq!(ids, vec!["new", "old"]);
        assert!(runs[1].finished_at.is_some());
    }

    #[test]
    fn test_run_id_validation() {
        assert!(RunStore::validate_run_id("run_2024-01").is_ok());
        assert!(RunStore::validate_run_id("../etc").is_err());
        assert!(RunStore::validate_run_id("").is_err());
    }

    #[test]
    fn test_delete_and_clear() {
        let dir = TempDir::new().unwrap();
        let store = RunStore::new(dir.path().join("runs"));
        store.ensure_run_dir("a").unwrap();
        store.ensure_run_dir("b").unwrap();
        store.upsert_index_entry(entry("a", 1, None)).unwrap();
        store.upsert_index_entry(entry("b", 2, None)).unwrap();

        store.delete_run("a").unwrap();
        assert!(!store.run_dir("a").exists());
        assert_eq!(store.list_runs().unwrap().len(), 1);

        store.clear_runs().unwrap();
        assert!(!store.run_dir("b").exists());
        assert!(store.list_runs().unwrap().is_empty());
    }

    #[test]
    fn test_cleanup_old_runs() {
        let dir = TempDir::new().unwrap();
        let store = RunStore::new(dir.path().join("runs"));
        for (id, started, finished) in [("stale", 1, Some(2)), ("fresh", 1, Some(20)), ("recent", 19, None)] {
            store.ensure_run_dir(id).unwrap();
            store.upsert_index_entry(entry(id, started, finished)).unwrap();
        }
        let now = Utc.with_ymd_and_hms(2024, 1, 25, 0, 0, 0).unwrap();

        assert!(store.cleanup_old_runs_at(0, now).unwrap().is_empty());

        let removed = store.cleanup_old_runs_at(10, now).unwrap();
        assert_eq!(removed, vec!["stale"]);
        assert!(!store.run_dir("stale").exists());
        assert!(store.run_dir("fresh").exists());
        assert_eq!(store.list_runs().unwrap().len(), 2);
    }

    #[test]
    fn test_cleanup_with_huge_ttl_removes_nothing() {
        let dir = TempDir::new().unwrap();
        let store = RunStore::new(dir.path().join("runs"));
        store.ensure_run_dir("old").unwrap();
        store.upsert_index_entry(entry("old", 1, Some(2))).unwrap();

        assert!(store.cleanup_old_runs(200_000_000).unwrap().is_empty());
        assert!(store.cleanup_old_runs(u32::MAX).unwrap().is_empty());
        assert!(store.run_dir("old").exists());
        assert_eq!(store.list_runs().unwrap().len(), 1);
    }

    #[test]
    fn test_keyed_locks_serialize_same_key() {
        let locks = KeyedLocks::new();
        let counter = Mutex::new(0);

        std::thread::scope(|scope| {
            for _ in 0..8 {
                scope.spawn(|| {
                    locks.with_lock("run-1", || {
                        let mut value = counter.lock().unwrap();
                        *value += 1;
                    })
                });
            }
        });

        assert_eq!(*counter.lock().unwrap(), 8);
    }
}
