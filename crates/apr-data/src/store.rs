//! Key/value backends for the memoizing cache.
//!
//! [`SqliteStore`] is the on-disk backend used by the CLI. It opens the
//! database for every lookup or write and drops the connection before
//! returning, so no handle is held while the wrapped computation runs.
//! [`MemoryStore`] backs unit tests.

use std::cell::RefCell;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use eyre::Result;
use rusqlite::{Connection, OptionalExtension};

use crate::error::FatalError;

/// String key/value storage addressed by cache digests.
pub trait KvStore {
    /// Returns the stored value for `key`, if any.
    fn get(&self, key: &str) -> Result<Option<String>>;

    /// Stores `value` under `key`, replacing any previous value.
    fn put(&self, key: &str, value: &str) -> Result<()>;
}

impl<S: KvStore + ?Sized> KvStore for &S {
    fn get(&self, key: &str) -> Result<Option<String>> {
        (**self).get(key)
    }

    fn put(&self, key: &str, value: &str) -> Result<()> {
        (**self).put(key, value)
    }
}

/// Process-local store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RefCell<HashMap<String, String>>,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entries.
    pub fn len(&self) -> usize {
        self.entries.borrow().len()
    }

    /// True when nothing has been stored.
    pub fn is_empty(&self) -> bool {
        self.entries.borrow().is_empty()
    }
}

impl KvStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.entries.borrow().get(key).cloned())
    }

    fn put(&self, key: &str, value: &str) -> Result<()> {
        self.entries
            .borrow_mut()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }
}

/// SQLite-backed store, opened per operation.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    path: PathBuf,
}

impl SqliteStore {
    /// Creates the database file if needed and applies migrations.
    ///
    /// # Errors
    /// Returns [`FatalError::CacheStore`] if the file cannot be opened or
    /// migrated.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let store = Self {
            path: path.as_ref().to_path_buf(),
        };
        let conn = store.connect()?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS memo (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                stored_at INTEGER NOT NULL
            );
            ",
        )
        .map_err(|source| store.fatal(source))?;
        tracing::debug!(path = %store.path.display(), "cache store ready");
        Ok(store)
    }

    /// Location of the database file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of memoized entries.
    ///
    /// # Errors
    /// Returns [`FatalError::CacheStore`] if the query fails.
    pub fn len(&self) -> Result<u64> {
        let conn = self.connect()?;
        let count: u64 = conn
            .query_row("SELECT COUNT(*) FROM memo", [], |row| row.get(0))
            .map_err(|source| self.fatal(source))?;
        Ok(count)
    }

    fn connect(&self) -> Result<Connection> {
        let conn = Connection::open(&self.path).map_err(|source| self.fatal(source))?;
        conn.busy_timeout(Duration::from_secs(5))
            .map_err(|source| self.fatal(source))?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")
            .map_err(|source| self.fatal(source))?;
        Ok(conn)
    }

    fn fatal(&self, source: rusqlite::Error) -> FatalError {
        FatalError::CacheStore {
            path: self.path.display().to_string(),
            source,
        }
    }
}

impl KvStore for SqliteStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let conn = self.connect()?;
        let value = conn
            .query_row(
                "SELECT value FROM memo WHERE key = ?",
                rusqlite::params![key],
                |row| row.get::<_, String>(0),
            )
            .optional()
            .map_err(|source| self.fatal(source))?;
        Ok(value)
    }

    fn put(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.connect()?;
        let stored_at = chrono::Utc::now().timestamp();
        conn.execute(
            "INSERT OR REPLACE INTO memo (key, value, stored_at) VALUES (?, ?, ?)",
            rusqlite::params![key, value, stored_at],
        )
        .map_err(|source| self.fatal(source))?;
        Ok(())
    }
}
