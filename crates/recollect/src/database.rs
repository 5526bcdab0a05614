//! Store access for the CLI.
//!
//! The CLI opens the same SQLite file recollect-server uses; no server is
//! needed. The path is resolved in this order:
//! 1. --db / RECOLLECT_DATABASE_PATH
//! 2. Walk up the directory tree looking for .recollect/memory.db
//! 3. ~/.recollect/memory.db

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use recollect_core::Database;

/// Resolve the store path without opening it.
pub fn resolve_path(explicit: Option<&Path>) -> Result<PathBuf> {
    match explicit {
        Some(path) => Ok(path.to_path_buf()),
        None => Database::find_database().context("Failed to locate database"),
    }
}

/// Open (creating if needed) the store.
pub fn open(explicit: Option<&Path>) -> Result<Arc<Database>> {
    let path = resolve_path(explicit)?;
    let db = Database::open_path(&path)
        .with_context(|| format!("Failed to open database {}", path.display()))?;
    Ok(Arc::new(db))
}
