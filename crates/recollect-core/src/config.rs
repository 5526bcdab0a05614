//! Engine configuration.
//!
//! Every section has serde defaults, so a partial (or missing) TOML file
//! yields a fully populated config:
//!
//! ```toml
//! [recall]
//! keyword_weight = 0.5
//!
//! [tracker]
//! batch_size = 10
//!
//! [[extraction.custom_rules]]
//! name = "editor"
//! pattern = "(?i)I use (\\w+) as my editor"
//! memory_type = "preference"
//! base_confidence = 0.7
//! template = "uses ${1} as editor"
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::lock::LockConfig;
use crate::memory::{
    ConsolidationConfig, ExtractionConfig, RecallConfig, RetentionConfig, TrackerConfig,
};

/// Top-level engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub recall: RecallConfig,
    pub tracker: TrackerConfig,
    pub retention: RetentionConfig,
    pub consolidation: ConsolidationConfig,
    pub extraction: ExtractionConfig,
    pub lock: LockConfig,
}

impl EngineConfig {
    /// Parse from a TOML string.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        toml::from_str(raw).map_err(|e| Error::Config(e.to_string()))
    }

    /// Load from a TOML file; a missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "No engine config file, using defaults");
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml_str(&raw)
    }

    /// Serialize back to TOML (used by `config init` style tooling and tests).
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MemoryType;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();

        assert_eq!(config.recall.keyword_weight, 0.4);
        assert_eq!(config.recall.entity_weight, 0.4);
        assert_eq!(config.recall.temporal_weight, 0.2);
        assert_eq!(config.tracker.batch_size, 50);
        assert_eq!(config.consolidation.similarity_threshold, 0.8);
        assert_eq!(config.lock.timeout_ms, 2_000);
    }

    #[test]
    fn test_partial_toml() {
        let config = EngineConfig::from_toml_str(
            r#"
            [tracker]
            batch_size = 10

            [[extraction.custom_rules]]
            name = "editor"
            pattern = "(?i)I use (\\w+) as my editor"
            memory_type = "preference"
            base_confidence = 0.7
            "#,
        )
        .unwrap();

        assert_eq!(config.tracker.batch_size, 10);
        assert_eq!(config.tracker.flush_interval_ms, 1_000);
        assert_eq!(config.extraction.custom_rules.len(), 1);
        assert_eq!(config.extraction.custom_rules[0].memory_type, MemoryType::Preference);
        assert_eq!(config.recall.default_max_memories, 5);
    }

    #[test]
    fn test_invalid_toml_is_config_error() {
        let err = EngineConfig::from_toml_str("[tracker]\nbatch_size = \"ten\"").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_load_missing_file_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = EngineConfig::load(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.tracker.queue_capacity, 1_024);
    }

    #[test]
    fn test_toml_round_trip_preserves_weights() {
        let mut config = EngineConfig::default();
        config.retention.prune_below = 0.3;
        let raw = config.to_toml_string().unwrap();
        let parsed = EngineConfig::from_toml_str(&raw).unwrap();
        assert_eq!(parsed.retention.prune_below, 0.3);
    }
}
