//! Pluggable storage for captured stdout/stderr blobs.
//!
//! By default output rows live in the main database. When an
//! `[outputstore]` section is configured, the primary store routes blobs
//! to the secondary backend and reassembles them on read; callers never
//! see the difference.

use std::sync::{Arc, Mutex};

use rusqlite::Connection;

use crab_core::config::OutputStoreSection;
use crab_core::JobOutput;

use crate::db::init_rawoutput;
use crate::error::{Result, StoreError};

/// Capability set for an output backend.
pub trait OutputStore: Send + Sync {
    fn write_output(
        &self,
        eventid: i64,
        stdout: Option<&str>,
        stderr: Option<&str>,
    ) -> Result<()>;

    fn get_output(&self, eventid: i64) -> Result<Option<JobOutput>>;

    fn delete_output(&self, eventid: i64) -> Result<()>;
}

/// SQLite-backed output store (a second database file).
pub struct SqliteOutputStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteOutputStore {
    pub fn new(conn: Connection) -> Result<Self> {
        init_rawoutput(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        Self::new(conn)
    }
}

impl OutputStore for SqliteOutputStore {
    fn write_output(
        &self,
        eventid: i64,
        stdout: Option<&str>,
        stderr: Option<&str>,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR REPLACE INTO rawoutput (eventid, stdout, stderr)
             VALUES (?1, ?2, ?3)",
            rusqlite::params![eventid, stdout, stderr],
        )?;
        Ok(())
    }

    fn get_output(&self, eventid: i64) -> Result<Option<JobOutput>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt =
            conn.prepare_cached("SELECT stdout, stderr FROM rawoutput WHERE eventid = ?1")?;
        let mut rows = stmt.query([eventid])?;
        match rows.next()? {
            Some(row) => Ok(Some(JobOutput {
                stdout: row.get(0)?,
                stderr: row.get(1)?,
            })),
            None => Ok(None),
        }
    }

    fn delete_output(&self, eventid: i64) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM rawoutput WHERE eventid = ?1", [eventid])?;
        Ok(())
    }
}

/// Construct the configured output backend by name.
///
/// The registry maps a backend name to a constructor; only `sqlite` ships
/// in-tree.
pub fn open_output_store(section: &OutputStoreSection) -> Result<Box<dyn OutputStore>> {
    match section.backend.as_str() {
        "sqlite" => Ok(Box::new(SqliteOutputStore::open(&section.path)?)),
        other => Err(StoreError::Output(format!(
            "unknown output store backend: {other}"
        ))),
    }
}
