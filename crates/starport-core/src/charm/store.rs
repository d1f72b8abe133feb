//! SQLite-backed key-value store, one database per store name.

use crate::error::{Error, Result};
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, params};
use std::path::{Path, PathBuf};

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS kv (
    key   BLOB PRIMARY KEY NOT NULL,
    value BLOB NOT NULL
);
";

/// Default store used when a script names none
pub const DEFAULT_DB: &str = "starcli.kv.user.default";

/// Store names are single path components.
pub fn validate_db_name(name: &str) -> Result<()> {
    let bad = name.is_empty()
        || name == "."
        || name == ".."
        || name.contains(['/', '\\'])
        || name.contains('\0');
    if bad {
        return Err(Error::Validation(format!("invalid kv store name: {name:?}")));
    }
    Ok(())
}

/// One named key-value store.
pub struct KvStore {
    name: String,
    path: PathBuf,
    conn: Mutex<Connection>,
}

impl KvStore {
    /// Open or create the store `name` under `kv_root`.
    pub fn open(kv_root: &Path, name: &str) -> Result<Self> {
        validate_db_name(name)?;
        let dir = kv_root.join(name);
        std::fs::create_dir_all(&dir)?;
        let path = dir.join("kv.db");

        let conn = Connection::open(&path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA busy_timeout=5000;")?;
        conn.execute_batch(SCHEMA_SQL)?;
        tracing::debug!(store = name, path = %path.display(), "kv store opened");
        Ok(Self {
            name: name.to_string(),
            path,
            conn: Mutex::new(conn),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.conn
            .lock()
            .query_row("SELECT value FROM kv WHERE key = ?1", params![key], |row| row.get(0))
            .optional()
            .map_err(Error::from)
    }

    pub fn set(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.conn.lock().execute(
            "INSERT INTO kv (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }

    /// Remove `key`; removing a missing key is not an error.
    pub fn delete(&self, key: &[u8]) -> Result<()> {
        self.conn.lock().execute("DELETE FROM kv WHERE key = ?1", params![key])?;
        Ok(())
    }

    /// Every pair in key order
    pub fn list(&self) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT key, value FROM kv ORDER BY key")?;
        let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Error::from)
    }

    /// Flush the write-ahead log into the main database file.
    pub fn sync(&self) -> Result<()> {
        self.conn
            .lock()
            .query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_| Ok(()))?;
        Ok(())
    }

    /// Drop every key.
    pub fn reset(&self) -> Result<()> {
        let removed = self.conn.lock().execute("DELETE FROM kv", [])?;
        tracing::debug!(store = %self.name, removed, "kv store reset");
        Ok(())
    }
}

/// Names of the stores under `kv_root`, sorted. A missing root has none.
pub fn list_stores(kv_root: &Path) -> Result<Vec<String>> {
    let entries = match std::fs::read_dir(kv_root) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let mut names = Vec::new();
    for entry in entries {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    names.sort();
    Ok(names)
}
