//! Key/value blob stores backing the change log.
//!
//! The change log owns its serialization; a store only moves opaque strings
//! in and out under a key.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Mutex, RwLock};
use rusqlite::{Connection, OptionalExtension, params};

use crate::error::PersistenceError;

/// Local durable storage, treated as a key/value blob store.
pub trait KvStore: Send + Sync {
    fn save(&self, key: &str, value: &str) -> Result<(), PersistenceError>;
    fn load(&self, key: &str) -> Result<Option<String>, PersistenceError>;
    fn remove(&self, key: &str) -> Result<(), PersistenceError>;
}

// ============================================================================
// MemoryStore
// ============================================================================

/// In-process store. Contents are lost when dropped.
///
/// Writes can be made to fail on demand, which is how callers exercise the
/// "persistence is down, keep going in memory" path.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<String, String>>,
    fail_writes: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent `save`/`remove` calls fail (or succeed again).
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Write a raw value, bypassing failure injection.
    pub fn put_raw(&self, key: &str, value: &str) {
        self.entries.write().insert(key.to_string(), value.to_string());
    }

    fn check_writable(&self) -> Result<(), PersistenceError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(PersistenceError::WriteRejected("memory store is read-only".into()));
        }
        Ok(())
    }
}

impl KvStore for MemoryStore {
    fn save(&self, key: &str, value: &str) -> Result<(), PersistenceError> {
        self.check_writable()?;
        self.entries.write().insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn load(&self, key: &str) -> Result<Option<String>, PersistenceError> {
        Ok(self.entries.read().get(key).cloned())
    }

    fn remove(&self, key: &str) -> Result<(), PersistenceError> {
        self.check_writable()?;
        self.entries.write().remove(key);
        Ok(())
    }
}

// ============================================================================
// SqliteStore
// ============================================================================

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS kv (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    updated_at INTEGER DEFAULT (unixepoch())
);
"#;

/// SQLite-backed store: one row per key.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create a database at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, PersistenceError> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    /// Create an in-memory database (for testing).
    pub fn in_memory() -> Result<Self, PersistenceError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    /// Default on-disk location: `<data dir>/scrumsync/sync.db`.
    pub fn default_path() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("scrumsync")
            .join("sync.db")
    }

    /// All stored keys, sorted.
    pub fn keys(&self) -> Result<Vec<String>, PersistenceError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT key FROM kv ORDER BY key")?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        Ok(rows.collect::<Result<Vec<String>, _>>()?)
    }
}

impl KvStore for SqliteStore {
    fn save(&self, key: &str, value: &str) -> Result<(), PersistenceError> {
        self.conn.lock().execute(
            "INSERT INTO kv (key, value, updated_at) VALUES (?1, ?2, unixepoch())
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![key, value],
        )?;
        Ok(())
    }

    fn load(&self, key: &str) -> Result<Option<String>, PersistenceError> {
        let value = self
            .conn
            .lock()
            .query_row("SELECT value FROM kv WHERE key = ?1", params![key], |row| row.get(0))
            .optional()?;
        Ok(value)
    }

    fn remove(&self, key: &str) -> Result<(), PersistenceError> {
        self.conn.lock().execute("DELETE FROM kv WHERE key = ?1", params![key])?;
        Ok(())
    }
}
