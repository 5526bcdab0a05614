//! Direct SQLite database access for recollect.
//!
//! SQLite is the persistence and query substrate for the memory graph:
//! `memories` rows are nodes, `memory_entities` holds MENTIONS edges and
//! `memory_relationships` holds typed edges such as MERGED_INTO.
//!
//! Database location priority:
//! 1. RECOLLECT_DATABASE_PATH env var
//! 2. Walk up directory tree looking for .recollect/memory.db
//! 3. ~/.recollect/memory.db

pub mod migrations;
mod memory;

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use rusqlite::Connection;

use crate::error::{Error, Result};

/// Path used for in-memory databases.
pub const IN_MEMORY_PATH: &str = ":memory:";

/// True for paths naming an in-memory database.
pub fn is_in_memory(path: &Path) -> bool {
    path.to_str().is_some_and(|p| p.starts_with(IN_MEMORY_PATH))
}

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Database connection wrapper.
///
/// Thread-safe via internal Mutex. All database operations acquire the lock.
pub struct Database {
    conn: Mutex<Connection>,
    path: PathBuf,
}

impl Database {
    /// Open database connection, auto-detecting location
    pub fn open() -> Result<Self> {
        let path = Self::find_database()?;
        Self::open_path(&path)
    }

    /// Open database at specific path, creating parent directories and schema
    pub fn open_path(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path).map_err(Error::Database)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        // journal_mode returns the resulting mode as a row
        let mode: String = conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
        tracing::debug!(path = %path.display(), journal_mode = %mode, "Opened memory database");

        Self::initialize(conn, path.to_path_buf())
    }

    /// Open a private in-memory database (tests, dry runs).
    ///
    /// Each instance gets its own `:memory:<id>` path, so locks and trackers
    /// keyed by path never collide between instances.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(Error::Database)?;
        let path = format!("{IN_MEMORY_PATH}{}", uuid::Uuid::new_v4().simple());
        Self::initialize(conn, PathBuf::from(path))
    }

    fn initialize(conn: Connection, path: PathBuf) -> Result<Self> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        migrations::run_migrations(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            path,
        })
    }

    /// Find database file location
    pub fn find_database() -> Result<PathBuf> {
        // 1. Environment variable
        if let Ok(path) = std::env::var("RECOLLECT_DATABASE_PATH") {
            if !path.trim().is_empty() {
                return Ok(PathBuf::from(path));
            }
        }

        // 2. Walk up directory tree from current dir
        if let Ok(mut current) = std::env::current_dir() {
            loop {
                let db_path = current.join(".recollect").join("memory.db");
                if db_path.exists() {
                    return Ok(db_path);
                }
                if !current.pop() {
                    break;
                }
            }
        }

        // 3. Per-user default
        dirs::home_dir()
            .map(|home| home.join(".recollect").join("memory.db"))
            .ok_or(Error::DatabaseNotFound)
    }

    /// Filesystem path backing this database (`:memory:` for in-memory).
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Check database connectivity
    pub fn ping(&self) -> Result<()> {
        let conn = self.lock()?;
        conn.execute_batch("SELECT 1").map_err(Error::Database)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| Error::LockPoisoned)
    }
}
