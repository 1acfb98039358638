//! SQLite persistence for per-entity status overrides, allowing
//! overrides to survive dashboard restarts.
//!
//! An override is written only by explicit user action and fully
//! supersedes the authoritative status for its entity until cleared.
//! Callers treat read/write failures as soft: a failed read means "no
//! override present", a failed write is logged and surfaced, never
//! propagated as fatal.

use std::path::Path;

use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, Result, params};

/// SQLite-backed override store.
pub struct OverrideStore {
    conn: Connection,
}

impl OverrideStore {
    /// Open (or create) a database at the given filesystem path and run migrations.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        let store = Self { conn };
        store.migrate()?;
        Ok(store)
    }

    /// Open an in-memory database. Useful for testing.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn };
        store.migrate()?;
        Ok(store)
    }

    /// Create the schema if it does not already exist.
    fn migrate(&self) -> Result<()> {
        self.conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS status_overrides (
                entity_id  TEXT PRIMARY KEY,
                status     TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );",
        )?;
        Ok(())
    }

    /// Upsert the override for one entity.
    pub fn set(&self, entity_id: &str, status: &str) -> Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO status_overrides (entity_id, status, updated_at)
             VALUES (?1, ?2, ?3)",
            params![entity_id, status, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    /// Read the override for one entity, if set.
    pub fn get(&self, entity_id: &str) -> Result<Option<String>> {
        self.conn
            .query_row(
                "SELECT status FROM status_overrides WHERE entity_id = ?1",
                params![entity_id],
                |row| row.get(0),
            )
            .optional()
    }

    /// Remove the override for one entity. No-op when absent.
    pub fn clear(&self, entity_id: &str) -> Result<()> {
        self.conn.execute(
            "DELETE FROM status_overrides WHERE entity_id = ?1",
            params![entity_id],
        )?;
        Ok(())
    }

    /// Remove every override. Useful for a full reset.
    pub fn clear_all(&self) -> Result<()> {
        self.conn.execute("DELETE FROM status_overrides", [])?;
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn conn_for_tests(&self) -> &Connection {
        &self.conn
    }

    /// Load all overrides, for startup warm-up and the status command.
    pub fn load_all(&self) -> Result<Vec<(String, String)>> {
        let mut stmt = self
            .conn
            .prepare("SELECT entity_id, status FROM status_overrides")?;
        let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_in_memory_creates_table() {
        let store = OverrideStore::open_in_memory().expect("should open in-memory db");
        let count: i64 = store
            .conn
            .query_row("SELECT COUNT(*) FROM status_overrides", [], |row| row.get(0))
            .expect("status_overrides table should exist");
        assert_eq!(count, 0);
    }

    #[test]
    fn set_and_get_roundtrip() {
        let store = OverrideStore::open_in_memory().unwrap();
        store.set("VT-1", "active").unwrap();
        assert_eq!(store.get("VT-1").unwrap(), Some("active".to_string()));
    }

    #[test]
    fn get_missing_returns_none() {
        let store = OverrideStore::open_in_memory().unwrap();
        assert_eq!(store.get("VT-404").unwrap(), None);
    }

    #[test]
    fn set_overwrites_existing_override() {
        let store = OverrideStore::open_in_memory().unwrap();
        store.set("VT-1", "active").unwrap();
        store.set("VT-1", "paused").unwrap();
        assert_eq!(store.get("VT-1").unwrap(), Some("paused".to_string()));
        assert_eq!(store.load_all().unwrap().len(), 1);
    }

    #[test]
    fn clear_removes_single_override() {
        let store = OverrideStore::open_in_memory().unwrap();
        store.set("VT-1", "active").unwrap();
        store.set("VT-2", "active").unwrap();
        store.clear("VT-1").unwrap();
        assert_eq!(store.get("VT-1").unwrap(), None);
        assert_eq!(store.get("VT-2").unwrap(), Some("active".to_string()));
    }

    #[test]
    fn clear_missing_is_noop() {
        let store = OverrideStore::open_in_memory().unwrap();
        store.clear("VT-404").unwrap();
        assert_eq!(store.load_all().unwrap().len(), 0);
    }

    #[test]
    fn clear_all_removes_everything() {
        let store = OverrideStore::open_in_memory().unwrap();
        store.set("VT-1", "active").unwrap();
        store.set("VT-2", "paused").unwrap();
        store.clear_all().unwrap();
        assert!(store.load_all().unwrap().is_empty());
    }

    #[test]
    fn survives_reopen_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("overrides.db");
        {
            let store = OverrideStore::open(&path).unwrap();
            store.set("VT-1", "active").unwrap();
        }
        let store = OverrideStore::open(&path).unwrap();
        assert_eq!(store.get("VT-1").unwrap(), Some("active".to_string()));
    }
}
