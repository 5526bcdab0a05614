//! Error types for recollect-core.

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias using recollect-core Error
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types for memory engine operations
#[derive(Error, Debug)]
pub enum Error {
    // Caller errors
    #[error("validation error: {message}")]
    Validation { message: String },

    // Lock contention
    #[error("store busy: {} (waited {waited_ms}ms)", .path.display())]
    Busy { path: PathBuf, waited_ms: u64 },

    // Storage errors with operation context
    #[error("storage error during {operation}{}: {source}", id_suffix(.id))]
    Storage {
        operation: &'static str,
        id: Option<String>,
        #[source]
        source: rusqlite::Error,
    },

    // Extraction rule errors (isolated, never abort extraction)
    #[error("extraction rule '{rule}' skipped: {message}")]
    Extraction { rule: String, message: String },

    // Database errors without extra context
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Database not found. Set RECOLLECT_DATABASE_PATH or run from a project directory.")]
    DatabaseNotFound,

    #[error("Database lock poisoned")]
    LockPoisoned,

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    // Generic errors
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Create a validation error
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Create a busy error for a contended store path
    pub fn busy(path: impl Into<PathBuf>, waited_ms: u64) -> Self {
        Self::Busy {
            path: path.into(),
            waited_ms,
        }
    }

    /// Create an extraction rule error
    pub fn extraction(rule: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Extraction {
            rule: rule.into(),
            message: message.into(),
        }
    }

    /// Check if this error is a validation error
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation { .. })
    }

    /// Check if this error is lock contention
    pub fn is_busy(&self) -> bool {
        matches!(self, Self::Busy { .. })
    }

    /// Check if this error came from the storage engine
    pub fn is_storage(&self) -> bool {
        matches!(self, Self::Storage { .. } | Self::Database(_))
    }
}

fn id_suffix(id: &Option<String>) -> String {
    id.as_deref().map(|i| format!(" ({i})")).unwrap_or_default()
}

/// Attach operation/id context to raw SQLite results.
pub trait StorageContext<T> {
    fn storage(self, operation: &'static str, id: Option<&str>) -> Result<T>;
}

impl<T> StorageContext<T> for std::result::Result<T, rusqlite::Error> {
    fn storage(self, operation: &'static str, id: Option<&str>) -> Result<T> {
        self.map_err(|source| Error::Storage {
            operation,
            id: id.map(String::from),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = Error::validation("prompt must not be empty");
        assert!(err.is_validation());
        assert!(err.to_string().contains("prompt must not be empty"));

        let err = Error::busy("/tmp/memory.db", 250);
        assert!(err.is_busy());
        assert!(err.to_string().contains("250ms"));
        assert!(err.to_string().contains("/tmp/memory.db"));

        let err = Error::extraction("custom:broken", "unclosed group");
        assert!(err.to_string().contains("custom:broken"));
    }

    #[test]
    fn test_storage_context() {
        let raw: std::result::Result<(), rusqlite::Error> =
            Err(rusqlite::Error::QueryReturnedNoRows);
        let err = raw.storage("get_by_id", Some("abc")).unwrap_err();

        assert!(err.is_storage());
        let msg = err.to_string();
        assert!(msg.contains("get_by_id"));
        assert!(msg.contains("(abc)"));
    }
}
