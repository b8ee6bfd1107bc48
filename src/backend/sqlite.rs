use super::traits::{BackendError, BackendResult, KvBackend};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};
use tracing::info;

/// SQLite-backed store. Every `(path, key)` pair is one row.
pub struct SqliteBackend {
    db_path: String,
    conn: Mutex<Connection>,
}

impl SqliteBackend {
    pub fn open(db_path: impl Into<String>) -> BackendResult<Self> {
        let db_path = db_path.into();
        let conn = Connection::open(&db_path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        Ok(Self {
            db_path,
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> BackendResult<Self> {
        Ok(Self {
            db_path: ":memory:".to_string(),
            conn: Mutex::new(Connection::open_in_memory()?),
        })
    }

    pub fn initialize(&self) -> BackendResult<()> {
        let conn = self.guard()?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS kv_store (
                path TEXT NOT NULL,
                key TEXT NOT NULL,
                value TEXT NOT NULL,
                PRIMARY KEY (path, key)
            )",
            [],
        )?;

        info!("SQLite store initialized at {}", self.db_path);
        Ok(())
    }

    fn guard(&self) -> BackendResult<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| BackendError::Poisoned)
    }
}

impl KvBackend for SqliteBackend {
    fn write(&self, path: &str, key: &str, value: &str) -> BackendResult<()> {
        let conn = self.guard()?;
        let mut stmt = conn.prepare_cached(
            "INSERT INTO kv_store (path, key, value) VALUES (?1, ?2, ?3)
             ON CONFLICT(path, key) DO UPDATE SET value = excluded.value",
        )?;
        stmt.execute(params![path, key, value])?;
        Ok(())
    }

    fn read(&self, path: &str, key: &str) -> BackendResult<Option<String>> {
        let conn = self.guard()?;
        let mut stmt = conn.prepare_cached("SELECT value FROM kv_store WHERE path = ?1 AND key = ?2")?;
        let value = stmt
            .query_row(params![path, key], |row| row.get::<_, String>(0))
            .optional()?;
        Ok(value)
    }

    fn enumerate(&self, path: &str) -> BackendResult<BTreeMap<String, String>> {
        let conn = self.guard()?;
        let mut stmt = conn.prepare_cached("SELECT key, value FROM kv_store WHERE path = ?1")?;
        let rows = stmt.query_map(params![path], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;

        let mut out = BTreeMap::new();
        for row in rows {
            let (key, value) = row?;
            out.insert(key, value);
        }
        Ok(out)
    }

    fn delete(&self, path: &str, key: &str) -> BackendResult<()> {
        let conn = self.guard()?;
        let mut stmt = conn.prepare_cached("DELETE FROM kv_store WHERE path = ?1 AND key = ?2")?;
        stmt.execute(params![path, key])?;
        Ok(())
    }

    fn delete_all(&self, path: &str) -> BackendResult<usize> {
        let conn = self.guard()?;
        let mut stmt = conn.prepare_cached("DELETE FROM kv_store WHERE path = ?1")?;
        Ok(stmt.execute(params![path])?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> SqliteBackend {
        let backend = SqliteBackend::open_in_memory().unwrap();
        backend.initialize().unwrap();
        backend
    }

    #[test]
    fn test_upsert_overwrites_value() {
        let backend = store();
        backend.write("locked/tls", "example.com", "3").unwrap();
        backend.write("locked/tls", "example.com", "7").unwrap();

        assert_eq!(
            backend.read("locked/tls", "example.com").unwrap().as_deref(),
            Some("7")
        );
        assert_eq!(backend.enumerate("locked/tls").unwrap().len(), 1);
    }

    #[test]
    fn test_paths_are_isolated() {
        let backend = store();
        backend.write("blocked/tls", "a.com", "[2]").unwrap();
        backend.write("blocked/quic", "a.com", "[5]").unwrap();

        assert_eq!(backend.delete_all("blocked/tls").unwrap(), 1);
        assert!(backend.enumerate("blocked/tls").unwrap().is_empty());
        assert_eq!(
            backend.read("blocked/quic", "a.com").unwrap().as_deref(),
            Some("[5]")
        );
    }

    #[test]
    fn test_initialize_is_idempotent() {
        let backend = store();
        backend.write("history", "a.com", "{}").unwrap();
        backend.initialize().unwrap();
        assert!(backend.read("history", "a.com").unwrap().is_some());
    }
}
