//! recollect-core - Core library for recollect
//!
//! This crate provides the memory lifecycle engine shared by the recollect CLI
//! and recollect-server:
//!
//! - **db**: Direct SQLite store for memory records and their edges
//! - **memory**: Extraction, recall, access tracking, retention and consolidation
//! - **lock**: Fail-fast advisory locking per store path
//! - **config**: TOML engine configuration

pub mod config;
pub mod db;
pub mod error;
pub mod hashing;
pub mod lock;
pub mod memory;
pub mod types;

// Re-export commonly used types
pub use config::EngineConfig;
pub use db::Database;
pub use error::{Error, Result};
pub use lock::{ConcurrencyGuard, StoreLock};
