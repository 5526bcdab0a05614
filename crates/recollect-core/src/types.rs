//! Shared types for the memory engine.
//!
//! Timestamps are Unix epoch milliseconds throughout, matching the storage layer.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub const HOUR_MS: i64 = 60 * 60 * 1000;
pub const DAY_MS: i64 = 24 * HOUR_MS;

/// Current time in epoch milliseconds.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

// ─────────────────────────────────────────────────────────────────────────────
// Memory Type
// ─────────────────────────────────────────────────────────────────────────────

/// Classification of a memory; governs default importance and retention window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryType {
    /// Durable facts about the user or world.
    Semantic,
    /// Events tied to a point in time.
    Episodic,
    /// Likes, dislikes and favourites.
    Preference,
    /// How-to knowledge and standing instructions.
    Procedural,
    /// Short-lived task context.
    Working,
}

impl MemoryType {
    pub const ALL: [MemoryType; 5] = [
        MemoryType::Semantic,
        MemoryType::Episodic,
        MemoryType::Preference,
        MemoryType::Procedural,
        MemoryType::Working,
    ];

    /// Convert to string for storage.
    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryType::Semantic => "semantic",
            MemoryType::Episodic => "episodic",
            MemoryType::Preference => "preference",
            MemoryType::Procedural => "procedural",
            MemoryType::Working => "working",
        }
    }

    /// Default importance for new records of this type.
    pub fn default_importance(&self) -> f64 {
        match self {
            MemoryType::Semantic => 0.7,
            MemoryType::Episodic => 0.5,
            MemoryType::Preference => 0.8,
            MemoryType::Procedural => 0.75,
            MemoryType::Working => 0.3,
        }
    }

    /// Default validity window in milliseconds (`None` = never expires).
    pub fn retention_window_ms(&self) -> Option<i64> {
        match self {
            MemoryType::Episodic => Some(30 * DAY_MS),
            MemoryType::Working => Some(DAY_MS),
            MemoryType::Semantic | MemoryType::Preference | MemoryType::Procedural => None,
        }
    }
}

impl std::fmt::Display for MemoryType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for MemoryType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "semantic" => Ok(MemoryType::Semantic),
            "episodic" => Ok(MemoryType::Episodic),
            "preference" => Ok(MemoryType::Preference),
            "procedural" => Ok(MemoryType::Procedural),
            "working" => Ok(MemoryType::Working),
            other => Err(Error::validation(format!("invalid memory type: {other}"))),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Records
// ─────────────────────────────────────────────────────────────────────────────

/// Durable memory record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryRecord {
    pub id: String,
    pub content: String,
    pub content_hash: String,
    pub memory_type: MemoryType,
    pub importance: f64,
    pub confidence: f64,
    pub created_at: i64,
    pub updated_at: i64,
    pub valid_from: i64,
    pub valid_to: Option<i64>,
    pub accessed_at: i64,
    pub access_count: i64,
    pub source_type: String,
    pub agent_id: Option<String>,
    pub user_id: Option<String>,
    pub session_id: Option<String>,
    pub entities: Vec<String>,
    pub metadata: BTreeMap<String, String>,
    pub archived_at: Option<i64>,
}

impl MemoryRecord {
    /// Most recent of last access and creation.
    pub fn last_activity_at(&self) -> i64 {
        self.accessed_at.max(self.created_at)
    }

    pub fn is_archived(&self) -> bool {
        self.archived_at.is_some()
    }

    pub fn is_expired(&self, now: i64) -> bool {
        self.valid_to.is_some_and(|to| to < now)
    }
}

/// Partition keys and origin of a record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Provenance {
    pub user_id: Option<String>,
    pub agent_id: Option<String>,
    pub session_id: Option<String>,
    pub source_type: Option<String>,
}

impl Provenance {
    pub fn new(user_id: Option<String>, agent_id: Option<String>, session_id: Option<String>) -> Self {
        Self {
            user_id,
            agent_id,
            session_id,
            source_type: None,
        }
    }
}

/// Input for creating (or merging into) a memory record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewMemory {
    pub content: String,
    pub memory_type: MemoryType,
    #[serde(default)]
    pub importance: Option<f64>,
    #[serde(default)]
    pub confidence: Option<f64>,
    #[serde(default)]
    pub valid_from: Option<i64>,
    #[serde(default)]
    pub valid_to: Option<i64>,
    #[serde(default = "default_source_type")]
    pub source_type: String,
    #[serde(default)]
    pub agent_id: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub entities: Vec<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

fn default_source_type() -> String {
    "manual".to_string()
}

impl NewMemory {
    /// Minimal record with type defaults and no provenance.
    pub fn new(content: impl Into<String>, memory_type: MemoryType) -> Self {
        Self {
            content: content.into(),
            memory_type,
            importance: None,
            confidence: None,
            valid_from: None,
            valid_to: None,
            source_type: default_source_type(),
            agent_id: None,
            user_id: None,
            session_id: None,
            entities: Vec::new(),
            metadata: BTreeMap::new(),
        }
    }

    /// Apply partition keys from a provenance.
    pub fn with_provenance(mut self, provenance: &Provenance) -> Self {
        self.user_id = provenance.user_id.clone();
        self.agent_id = provenance.agent_id.clone();
        self.session_id = provenance.session_id.clone();
        if let Some(source) = &provenance.source_type {
            self.source_type = source.clone();
        }
        self
    }

    /// Validate and fill defaults. Importance/confidence are clamped to [0, 1].
    pub fn normalized(mut self, now: i64) -> Result<Self> {
        let trimmed = self.content.trim();
        if trimmed.is_empty() {
            return Err(Error::validation("memory content must not be empty"));
        }
        if trimmed.len() != self.content.len() {
            self.content = trimmed.to_string();
        }

        self.importance = Some(clamp_unit(
            self.importance.unwrap_or_else(|| self.memory_type.default_importance()),
        ));
        self.confidence = Some(clamp_unit(self.confidence.unwrap_or(0.5)));

        let valid_from = self.valid_from.unwrap_or(now);
        self.valid_from = Some(valid_from);
        if self.valid_to.is_none() {
            self.valid_to = self
                .memory_type
                .retention_window_ms()
                .map(|window| valid_from + window);
        }
        if let Some(valid_to) = self.valid_to {
            if valid_to < valid_from {
                return Err(Error::validation(format!(
                    "validTo ({valid_to}) precedes validFrom ({valid_from})"
                )));
            }
        }

        self.entities = dedup_entities(self.entities);
        Ok(self)
    }
}

/// Clamp a score into [0, 1]; NaN becomes 0.
pub fn clamp_unit(value: f64) -> f64 {
    if value.is_nan() { 0.0 } else { value.clamp(0.0, 1.0) }
}

/// Case-insensitive dedup preserving first spelling and order.
pub fn dedup_entities(entities: Vec<String>) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    entities
        .into_iter()
        .map(|e| e.trim().to_string())
        .filter(|e| !e.is_empty() && seen.insert(e.to_lowercase()))
        .collect()
}

// ─────────────────────────────────────────────────────────────────────────────
// Queries
// ─────────────────────────────────────────────────────────────────────────────

/// Ordering applied by the store before any in-memory ranking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryOrder {
    #[default]
    RecentlyAccessed,
    Newest,
    Oldest,
    Importance,
    AccessCount,
}

/// Store query criteria.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MemoryQuery {
    pub user_id: Option<String>,
    pub agent_id: Option<String>,
    pub session_id: Option<String>,
    pub memory_types: Vec<MemoryType>,
    /// Matches records mentioning any of these entities.
    pub entities: Vec<String>,
    pub include_archived: bool,
    pub include_expired: bool,
    pub order: QueryOrder,
    pub limit: Option<usize>,
    /// Restricts results to records matching the prompt text, applied before `limit`.
    pub text_match: Option<TextMatch>,
}

/// Relevance prefilter evaluated by the store.
///
/// A record matches when its content contains any of `terms` as a whole
/// token, or when one of its entities appears as a token run in
/// `mentioned_in`. No terms and no text match nothing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TextMatch {
    /// Lowercased tokens, as produced by [`crate::hashing::tokenize`].
    pub terms: Vec<String>,
    pub mentioned_in: Option<String>,
}

/// Merged access update applied in one batch write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessUpdate {
    pub memory_id: String,
    pub count: i64,
    pub accessed_at: i64,
    /// Context of the latest merged event.
    pub context: String,
}

/// Queued read event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessEvent {
    pub memory_id: String,
    pub timestamp: i64,
    pub context: String,
}

/// Memory usage statistics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryStats {
    pub total: i64,
    pub archived: i64,
    pub by_type: BTreeMap<String, i64>,
    pub total_accesses: i64,
    pub content_bytes: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_type_round_trip_and_defaults() {
        for ty in MemoryType::ALL {
            assert_eq!(ty.as_str().parse::<MemoryType>().unwrap(), ty);
        }
        assert!("bogus".parse::<MemoryType>().unwrap_err().is_validation());
        assert!(MemoryType::Semantic.retention_window_ms().is_none());
        assert_eq!(MemoryType::Working.retention_window_ms(), Some(DAY_MS));
    }

    #[test]
    fn test_new_memory_normalization() {
        let mut input = NewMemory::new("  likes green tea  ", MemoryType::Preference);
        input.importance = Some(1.7);
        input.confidence = Some(-0.2);
        input.entities = vec!["Tea".into(), "tea".into(), " ".into(), "Kyoto".into()];

        let normalized = input.normalized(1_000).unwrap();
        assert_eq!(normalized.content, "likes green tea");
        assert_eq!(normalized.importance, Some(1.0));
        assert_eq!(normalized.confidence, Some(0.0));
        assert_eq!(normalized.valid_from, Some(1_000));
        assert_eq!(normalized.valid_to, None);
        assert_eq!(normalized.entities, vec!["Tea".to_string(), "Kyoto".to_string()]);
    }

    #[test]
    fn test_new_memory_rejects_bad_input() {
        assert!(NewMemory::new("   ", MemoryType::Semantic)
            .normalized(0)
            .unwrap_err()
            .is_validation());

        let mut input = NewMemory::new("went hiking", MemoryType::Episodic);
        input.valid_from = Some(5_000);
        input.valid_to = Some(4_000);
        assert!(input.normalized(0).unwrap_err().is_validation());
    }

    #[test]
    fn test_window_sets_valid_to() {
        let normalized = NewMemory::new("fixing the login bug", MemoryType::Working)
            .normalized(10)
            .unwrap();
        assert_eq!(normalized.valid_to, Some(10 + DAY_MS));
    }
}
