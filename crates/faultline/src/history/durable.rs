//! Durable critical history v0.4.0
//!
//! Append-only records keyed by event id. Records only ever gain fields:
//! unknown fields are ignored and missing ones defaulted on load.
//!
//! Backends:
//! - JSON lines file (default): one record per line, last record per id wins
//! - SQLite: `critical_history(id, recorded_at, payload)`, WAL journal
//! - Memory: nothing survives the process; failure injection for tests

use super::HistoryEntry;
use crate::config::{DurableBackend, HistoryConfig};
use crate::error::PersistenceError;
use crate::event::EventId;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tracing::warn;

/// Key-value store for CRITICAL history entries
pub trait DurableStore: Send + Sync {
    /// Insert or replace the record for `entry.event.id`
    fn append(&self, entry: &HistoryEntry) -> Result<(), PersistenceError>;

    /// Every record, oldest first
    fn load_all(&self) -> Result<Vec<HistoryEntry>, PersistenceError>;

    fn get(&self, id: &EventId) -> Result<Option<HistoryEntry>, PersistenceError>;

    /// Remove one record; false if it was not there
    fn purge(&self, id: &EventId) -> Result<bool, PersistenceError>;

    /// Remove everything; returns how many records were removed
    fn purge_all(&self) -> Result<usize, PersistenceError>;

    /// Short description for logs ("jsonl:/var/lib/...")
    fn describe(&self) -> String;
}

/// Open the store configured in `[history]`
pub fn open_store(config: &HistoryConfig) -> Result<Arc<dyn DurableStore>, PersistenceError> {
    let Some(path) = &config.durable_path else {
        return Ok(Arc::new(MemoryStore::new()));
    };
    Ok(match config.durable_backend {
        DurableBackend::Jsonl => Arc::new(JsonlStore::open(path)?),
        DurableBackend::Sqlite => Arc::new(SqliteStore::open(path)?),
    })
}

fn sort_oldest_first(entries: &mut [HistoryEntry]) {
    entries.sort_by(|a, b| {
        a.recorded_at
            .cmp(&b.recorded_at)
            .then_with(|| a.event.timestamp.cmp(&b.event.timestamp))
    });
}

fn ensure_parent(path: &Path) -> Result<(), PersistenceError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(|e| PersistenceError::io(parent, e))?;
        }
    }
    Ok(())
}

// ============================================================================
// JSON lines
// ============================================================================

#[derive(Debug)]
pub struct JsonlStore {
    path: PathBuf,
    /// Serializes writers within this process
    write_lock: Mutex<()>,
}

impl JsonlStore {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, PersistenceError> {
        let path = path.into();
        ensure_parent(&path)?;
        Ok(Self {
            path,
            write_lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_records(&self) -> Result<Vec<HistoryEntry>, PersistenceError> {
        let content = match fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(PersistenceError::io(&self.path, e)),
        };

        let mut entries: Vec<HistoryEntry> = Vec::new();
        let mut index: HashMap<EventId, usize> = HashMap::new();
        for (line_no, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<HistoryEntry>(line) {
                Ok(entry) => match index.get(&entry.event.id) {
                    Some(&i) => entries[i] = entry,
                    None => {
                        index.insert(entry.event.id, entries.len());
                        entries.push(entry);
                    }
                },
                Err(e) => warn!(
                    path = %self.path.display(),
                    line = line_no + 1,
                    error = %e,
                    "Skipping unreadable critical history record"
                ),
            }
        }
        sort_oldest_first(&mut entries);
        Ok(entries)
    }

    /// Replace the file with `entries` (temp file + rename)
    fn rewrite(&self, entries: &[HistoryEntry]) -> Result<(), PersistenceError> {
        let tmp = self.path.with_extension("jsonl.tmp");
        {
            let mut file = fs::File::create(&tmp).map_err(|e| PersistenceError::io(&tmp, e))?;
            for entry in entries {
                let json = serde_json::to_string(entry)?;
                writeln!(file, "{}", json).map_err(|e| PersistenceError::io(&tmp, e))?;
            }
            file.sync_all().map_err(|e| PersistenceError::io(&tmp, e))?;
        }
        fs::rename(&tmp, &self.path).map_err(|e| PersistenceError::io(&self.path, e))
    }
}

impl DurableStore for JsonlStore {
    fn append(&self, entry: &HistoryEntry) -> Result<(), PersistenceError> {
        let json = serde_json::to_string(entry)?;
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| PersistenceError::io(&self.path, e))?;
        writeln!(file, "{}", json).map_err(|e| PersistenceError::io(&self.path, e))?;
        file.sync_data()
            .map_err(|e| PersistenceError::io(&self.path, e))
    }

    fn load_all(&self) -> Result<Vec<HistoryEntry>, PersistenceError> {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        self.read_records()
    }

    fn get(&self, id: &EventId) -> Result<Option<HistoryEntry>, PersistenceError> {
        Ok(self.load_all()?.into_iter().find(|e| e.event.id == *id))
    }

    fn purge(&self, id: &EventId) -> Result<bool, PersistenceError> {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut entries = self.read_records()?;
        let before = entries.len();
        entries.retain(|e| e.event.id != *id);
        if entries.len() == before {
            return Ok(false);
        }
        self.rewrite(&entries)?;
        Ok(true)
    }

    fn purge_all(&self) -> Result<usize, PersistenceError> {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let count = self.read_records()?.len();
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(count),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
            Err(e) => Err(PersistenceError::io(&self.path, e)),
        }
    }

    fn describe(&self) -> String {
        format!("jsonl:{}", self.path.display())
    }
}

// ============================================================================
// SQLite
// ============================================================================

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS critical_history (
        id TEXT PRIMARY KEY,
        recorded_at TEXT NOT NULL,
        payload TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_critical_recorded ON critical_history(recorded_at);
";

pub struct SqliteStore {
    conn: Mutex<Connection>,
    location: String,
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, PersistenceError> {
        let path = path.as_ref();
        ensure_parent(path)?;
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        Self::init(conn, path.display().to_string())
    }

    pub fn open_in_memory() -> Result<Self, PersistenceError> {
        Self::init(Connection::open_in_memory()?, ":memory:".to_string())
    }

    fn init(conn: Connection, location: String) -> Result<Self, PersistenceError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
            location,
        })
    }

    fn decode(id: &str, payload: &str) -> Option<HistoryEntry> {
        match serde_json::from_str(payload) {
            Ok(entry) => Some(entry),
            Err(e) => {
                warn!(id, error = %e, "Skipping unreadable critical history row");
                None
            }
        }
    }
}

impl DurableStore for SqliteStore {
    fn append(&self, entry: &HistoryEntry) -> Result<(), PersistenceError> {
        let payload = serde_json::to_string(entry)?;
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "INSERT OR REPLACE INTO critical_history (id, recorded_at, payload) VALUES (?1, ?2, ?3)",
            params![
                entry.event.id.to_string(),
                entry.recorded_at.to_rfc3339(),
                payload
            ],
        )?;
        Ok(())
    }

    fn load_all(&self) -> Result<Vec<HistoryEntry>, PersistenceError> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare("SELECT id, payload FROM critical_history")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;

        let mut entries = Vec::new();
        for row in rows {
            let (id, payload) = row?;
            if let Some(entry) = Self::decode(&id, &payload) {
                entries.push(entry);
            }
        }
        sort_oldest_first(&mut entries);
        Ok(entries)
    }

    fn get(&self, id: &EventId) -> Result<Option<HistoryEntry>, PersistenceError> {
        let key = id.to_string();
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let payload: Option<String> = conn
            .query_row(
                "SELECT payload FROM critical_history WHERE id = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(payload.and_then(|p| Self::decode(&key, &p)))
    }

    fn purge(&self, id: &EventId) -> Result<bool, PersistenceError> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let removed = conn.execute(
            "DELETE FROM critical_history WHERE id = ?1",
            params![id.to_string()],
        )?;
        Ok(removed > 0)
    }

    fn purge_all(&self) -> Result<usize, PersistenceError> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        Ok(conn.execute("DELETE FROM critical_history", [])?)
    }

    fn describe(&self) -> String {
        format!("sqlite:{}", self.location)
    }
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore")
            .field("location", &self.location)
            .finish()
    }
}

// ============================================================================
// Memory
// ============================================================================

#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<Vec<HistoryEntry>>,
    /// Every append fails while set
    failing: AtomicBool,
    /// Upcoming appends that fail before succeeding again
    fail_next: AtomicU32,
    attempts: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn fail_next(&self, count: u32) {
        self.fail_next.store(count, Ordering::SeqCst);
    }

    /// Append attempts, including failed ones
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    fn injected_failure(&self) -> bool {
        if self.failing.load(Ordering::SeqCst) {
            return true;
        }
        self.fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl DurableStore for MemoryStore {
    fn append(&self, entry: &HistoryEntry) -> Result<(), PersistenceError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.injected_failure() {
            return Err(PersistenceError::Unavailable(
                "injected memory store failure".to_string(),
            ));
        }
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        match entries.iter_mut().find(|e| e.event.id == entry.event.id) {
            Some(existing) => *existing = entry.clone(),
            None => entries.push(entry.clone()),
        }
        Ok(())
    }

    fn load_all(&self) -> Result<Vec<HistoryEntry>, PersistenceError> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner()).clone();
        sort_oldest_first(&mut entries);
        Ok(entries)
    }

    fn get(&self, id: &EventId) -> Result<Option<HistoryEntry>, PersistenceError> {
        Ok(self
            .entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .find(|e| e.event.id == *id)
            .cloned())
    }

    fn purge(&self, id: &EventId) -> Result<bool, PersistenceError> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let before = entries.len();
        entries.retain(|e| e.event.id != *id);
        Ok(entries.len() != before)
    }

    fn purge_all(&self) -> Result<usize, PersistenceError> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let count = entries.len();
        entries.clear();
        Ok(count)
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{ErrorEvent, EventContext};
    use crate::severity::Severity;
    use chrono::{Duration, Utc};
    use tempfile::tempdir;

    fn critical(message: &str, offset_s: i64) -> HistoryEntry {
        let ts = Utc::now() + Duration::seconds(offset_s);
        HistoryEntry::new(
            ErrorEvent::new(
                "CorruptionError",
                message,
                Severity::Critical,
                "",
                EventContext::new(),
                ts,
            ),
            true,
            1,
            ts,
        )
    }

    fn exercise(store: &dyn DurableStore) {
        let a = critical("a", 0);
        let b = critical("b", 1);
        store.append(&a).unwrap();
        store.append(&b).unwrap();

        // Re-append replaces
        let mut a2 = a.clone();
        a2.aggregated_count = 3;
        store.append(&a2).unwrap();

        let all = store.load_all().unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].event.message, "a");
        assert_eq!(all[0].aggregated_count, 3);

        assert_eq!(store.get(&b.event.id).unwrap().map(|e| e.event.message), Some("b".to_string()));
        assert!(store.get(&EventId::new()).unwrap().is_none());

        assert!(store.purge(&a.event.id).unwrap());
        assert!(!store.purge(&a.event.id).unwrap());
        assert_eq!(store.purge_all().unwrap(), 1);
        assert!(store.load_all().unwrap().is_empty());
    }

    #[test]
    fn test_jsonl_store() {
        let dir = tempdir().unwrap();
        let store = JsonlStore::open(dir.path().join("nested/critical.jsonl")).unwrap();
        exercise(&store);
    }

    #[test]
    fn test_sqlite_store() {
        let dir = tempdir().unwrap();
        let store = SqliteStore::open(dir.path().join("critical.db")).unwrap();
        exercise(&store);
        exercise(&SqliteStore::open_in_memory().unwrap());
    }

    #[test]
    fn test_memory_store() {
        exercise(&MemoryStore::new());
    }

    #[test]
    fn test_jsonl_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("critical.jsonl");
        let entry = critical("persisted", 0);
        JsonlStore::open(&path).unwrap().append(&entry).unwrap();

        let reopened = JsonlStore::open(&path).unwrap();
        let loaded = reopened.load_all().unwrap();
        assert_eq!(loaded, vec![entry]);
    }

    #[test]
    fn test_jsonl_skips_bad_lines_and_tolerates_additive_fields() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("critical.jsonl");
        let entry = critical("good", 0);

        let mut value = serde_json::to_value(&entry).unwrap();
        value["added_later"] = serde_json::json!("ignored");
        let content = format!("not json\n{}\n\n", value);
        fs::write(&path, content).unwrap();

        let store = JsonlStore::open(&path).unwrap();
        let loaded = store.load_all().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].event.id, entry.event.id);
    }

    #[test]
    fn test_memory_store_failure_injection() {
        let store = MemoryStore::new();
        store.fail_next(2);
        let entry = critical("x", 0);
        assert!(store.append(&entry).is_err());
        assert!(store.append(&entry).is_err());
        assert!(store.append(&entry).is_ok());
        assert_eq!(store.attempts(), 3);

        store.set_failing(true);
        assert!(store.append(&entry).is_err());
    }

    #[test]
    fn test_open_store_without_path_is_memory() {
        let store = open_store(&HistoryConfig::default()).unwrap();
        assert_eq!(store.describe(), "memory");
    }
}
