//! Memory system traits defining the interface for storage operations.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::types::{AccessUpdate, MemoryQuery, MemoryRecord, MemoryStats, NewMemory};

/// Edge kind written from an original to its canonical record.
pub const MERGED_INTO: &str = "MERGED_INTO";

/// Sink for merged access counters.
///
/// Split from [`MemoryStore`] so the access tracker only depends on the one
/// write it performs.
pub trait AccessSink: Send + Sync {
    /// Apply merged updates in one batch: `access_count += count`,
    /// `accessed_at = max(accessed_at, update.accessed_at)`.
    ///
    /// Returns the number of records touched. Ids that no longer exist are skipped.
    fn record_access_batch(&self, updates: &[AccessUpdate]) -> Result<usize>;
}

/// Core trait for memory storage operations.
///
/// Implementations handle the actual storage backend. All user-controlled
/// values must reach the engine as bound parameters.
pub trait MemoryStore: AccessSink {
    /// Path identifying the store; the locking unit for [`crate::lock::ConcurrencyGuard`].
    fn store_path(&self) -> &Path;

    /// Insert a record, or merge into the record sharing its content hash
    /// within the same user/agent scope. Returns the (existing) id.
    ///
    /// When that record was archived by a merge, the merge lands on the live
    /// record its MERGED_INTO edges lead to and that id is returned.
    fn upsert(&self, record: NewMemory) -> Result<String>;

    /// Retrieve a record by id, archived or not.
    fn get_by_id(&self, id: &str) -> Result<Option<MemoryRecord>>;

    /// Query records with filters and ordering.
    fn query(&self, criteria: &MemoryQuery) -> Result<Vec<MemoryRecord>>;

    /// Upsert all records atomically. Fails as a whole; nothing is written on error.
    fn batch_upsert(&self, records: Vec<NewMemory>) -> Result<Vec<String>>;

    /// Fetch records in the order requested, skipping unknown ids.
    fn batch_get_by_ids(&self, ids: &[String]) -> Result<Vec<MemoryRecord>>;

    /// Delete a record and its entity edges.
    fn delete(&self, id: &str) -> Result<bool>;

    /// Delete many records atomically. Returns the number deleted.
    fn delete_batch(&self, ids: &[String]) -> Result<usize>;

    /// Rewrite a canonical record and retire its originals in one transaction.
    fn apply_merge(&self, plan: &MergePlan) -> Result<usize>;

    /// Add a typed edge between two records (idempotent).
    fn relate(&self, from_id: &str, to_id: &str, kind: &str) -> Result<()>;

    /// Edges touching a record, optionally filtered by kind.
    fn related(&self, id: &str, kind: Option<&str>) -> Result<Vec<Relationship>>;

    /// Usage statistics, optionally scoped to a user.
    fn stats(&self, user_id: Option<&str>) -> Result<MemoryStats>;
}

/// Typed edge between two records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Relationship {
    pub from_id: String,
    pub to_id: String,
    pub kind: String,
    pub created_at: i64,
}

/// Canonical rewrite produced by consolidation.
#[derive(Debug, Clone, PartialEq)]
pub struct MergePlan {
    pub canonical_id: String,
    /// Replacement content; `None` keeps the canonical content (and hash).
    pub content: Option<String>,
    pub importance: f64,
    pub confidence: f64,
    pub entities: Vec<String>,
    pub metadata: BTreeMap<String, String>,
    pub originals: Vec<String>,
    /// Archive originals when true, delete them otherwise.
    pub archive_originals: bool,
    pub merged_at: i64,
}
