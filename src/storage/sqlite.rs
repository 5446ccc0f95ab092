//! `SQLite` backend for translation-memory entries.
//!
//! The store is the system of record; the index bundle under the data
//! directory is always derivable from it. Schema is intentionally flat:
//! one row per TM entry, grouped by `tm_id`.

use std::fs;
use std::path::Path;
use std::time::Duration;

use rusqlite::{params, Connection};
use tracing::info;

use crate::error::Result;
use crate::model::types::TmEntry;

const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS tm_entries (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    tm_id       TEXT NOT NULL,
    source_text TEXT NOT NULL,
    target_text TEXT,
    string_id   TEXT
);
CREATE INDEX IF NOT EXISTS idx_tm_entries_tm_id ON tm_entries(tm_id);
";

pub struct EntryStore {
    conn: Connection,
}

impl EntryStore {
    /// Open (creating if needed) the store at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let created = !path.exists();
        let conn = Connection::open(path)?;
        apply_pragmas(&conn)?;
        conn.execute_batch(SCHEMA)?;
        if created {
            info!(path = %path.display(), "created entry store");
        }
        Ok(Self { conn })
    }

    /// In-memory store, used by tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn })
    }

    /// All entries for one TM, in insertion order.
    pub fn entries(&self, tm_id: &str) -> Result<Vec<TmEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, source_text, target_text, string_id
             FROM tm_entries WHERE tm_id = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![tm_id], |row| {
            Ok(TmEntry {
                id: row.get(0)?,
                source_text: row.get(1)?,
                target_text: row.get(2)?,
                string_id: row.get(3)?,
            })
        })?;
        let mut entries = Vec::new();
        for row in rows {
            entries.push(row?);
        }
        Ok(entries)
    }

    /// Insert one entry and return its row id.
    pub fn add_entry(
        &self,
        tm_id: &str,
        source_text: &str,
        target_text: Option<&str>,
        string_id: Option<&str>,
    ) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO tm_entries (tm_id, source_text, target_text, string_id)
             VALUES (?1, ?2, ?3, ?4)",
            params![tm_id, source_text, target_text, string_id],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn update_target(&self, entry_id: i64, target_text: &str) -> Result<usize> {
        let changed = self.conn.execute(
            "UPDATE tm_entries SET target_text = ?1 WHERE id = ?2",
            params![target_text, entry_id],
        )?;
        Ok(changed)
    }

    pub fn delete_entry(&self, entry_id: i64) -> Result<usize> {
        let changed = self
            .conn
            .execute("DELETE FROM tm_entries WHERE id = ?1", params![entry_id])?;
        Ok(changed)
    }

    pub fn count(&self, tm_id: &str) -> Result<u64> {
        let n: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM tm_entries WHERE tm_id = ?1",
            params![tm_id],
            |row| row.get(0),
        )?;
        Ok(n as u64)
    }
}

fn apply_pragmas(conn: &Connection) -> Result<()> {
    conn.busy_timeout(Duration::from_secs(5))?;
    conn.execute_batch(
        r"
        PRAGMA journal_mode = WAL;
        PRAGMA synchronous = NORMAL;
        PRAGMA temp_store = MEMORY;
        PRAGMA foreign_keys = ON;
        ",
    )?;
    Ok(())
}
