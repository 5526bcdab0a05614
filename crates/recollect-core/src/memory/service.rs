//! Memory service.
//!
//! Ties the engine together for one store:
//! - Guarded write path (extract, then batch upsert)
//! - Guarded direct stores
//! - Maintenance cycle (retention, then consolidation)
//!
//! ## Maintenance Cycle
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │                     run_maintenance                       │
//! │  ┌────────────┐  ┌────────────────┐  ┌──────────────────┐ │
//! │  │   Guard    │─▶│   Retention    │─▶│  Consolidation   │ │
//! │  │  acquire   │  │ analyze+apply  │  │  find+execute    │ │
//! │  └────────────┘  └────────────────┘  └──────────────────┘ │
//! └───────────────────────────────────────────────────────────┘
//! ```

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::{
    AccessTracker, ConsolidationEngine, ConsolidationReport, ExtractedMemory, Extractor,
    MemoryStore, RecallEngine, RetentionPolicy, RetentionReport,
};
use crate::config::EngineConfig;
use crate::error::Result;
use crate::lock::{ConcurrencyGuard, StoreLock};
use crate::types::{NewMemory, Provenance};

/// Result of [`MemoryService::learn`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LearnReport {
    /// Candidates produced by the extractor.
    pub candidates: Vec<ExtractedMemory>,
    /// Ids of the stored (or merged) records, one per candidate.
    pub stored_ids: Vec<String>,
}

/// Result of a maintenance cycle.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MaintenanceReport {
    pub retention: RetentionReport,
    pub consolidation: ConsolidationReport,
    pub dry_run: bool,
}

impl MaintenanceReport {
    /// Check if the cycle removed or merged anything.
    pub fn has_changes(&self) -> bool {
        self.retention.pruned > 0 || self.consolidation.memories_consolidated > 0
    }
}

/// Engine entry point for one store.
pub struct MemoryService<S: MemoryStore> {
    store: Arc<S>,
    guard: ConcurrencyGuard,
    extractor: Extractor,
    retention: RetentionPolicy<S>,
    consolidation: ConsolidationEngine<S>,
    config: EngineConfig,
}

impl<S: MemoryStore> MemoryService<S> {
    /// Create a service using the default file lock backend.
    pub fn new(store: Arc<S>, config: &EngineConfig) -> Self {
        Self::with_guard(store, config, ConcurrencyGuard::new(&config.lock))
    }

    pub fn with_guard(store: Arc<S>, config: &EngineConfig, guard: ConcurrencyGuard) -> Self {
        let extractor = Extractor::new(config.extraction.clone());
        for rule in extractor.skipped_rules() {
            tracing::warn!(rule = %rule, "Extraction rule disabled");
        }

        Self {
            retention: RetentionPolicy::new(store.clone(), config.retention.clone()),
            consolidation: ConsolidationEngine::new(store.clone(), config.consolidation.clone()),
            store,
            guard,
            extractor,
            config: config.clone(),
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn extractor(&self) -> &Extractor {
        &self.extractor
    }

    pub fn retention(&self) -> &RetentionPolicy<S> {
        &self.retention
    }

    pub fn consolidation(&self) -> &ConsolidationEngine<S> {
        &self.consolidation
    }

    /// Acquire the store lock for this service's store.
    pub fn lock(&self, timeout: Duration) -> Result<StoreLock> {
        self.guard.acquire(self.store.store_path(), timeout)
    }

    /// Extract candidates without storing them.
    pub fn extract(&self, text: &str) -> Vec<ExtractedMemory> {
        self.extractor.extract(text)
    }

    /// Extract memories from `text` and store them in one batch.
    pub fn learn(
        &self,
        text: &str,
        provenance: &Provenance,
        timeout: Duration,
    ) -> Result<LearnReport> {
        let _lock = self.lock(timeout)?;

        let candidates = self.extractor.extract(text);
        if candidates.is_empty() {
            tracing::debug!("No memories extracted");
            return Ok(LearnReport::default());
        }

        let batch: Vec<NewMemory> = candidates
            .iter()
            .cloned()
            .map(|candidate| candidate.into_new_memory(provenance))
            .collect();
        let stored_ids = self.store.batch_upsert(batch)?;

        tracing::info!(
            candidates = candidates.len(),
            stored = stored_ids.len(),
            "Learned memories"
        );
        Ok(LearnReport {
            candidates,
            stored_ids,
        })
    }

    /// Store one record directly under the lock.
    pub fn remember(&self, memory: NewMemory, timeout: Duration) -> Result<String> {
        let _lock = self.lock(timeout)?;
        self.store.upsert(memory)
    }

    /// Run retention then consolidation.
    ///
    /// A dry run takes no lock and never mutates the store.
    pub fn run_maintenance(&self, dry_run: bool, timeout: Duration) -> Result<MaintenanceReport> {
        let lock = if dry_run {
            None
        } else {
            Some(self.lock(timeout)?)
        };

        let scores = self.retention.analyze(self.config.retention.analyze_limit)?;
        let retention = self.retention.apply(&scores, dry_run, lock.as_ref())?;

        // A dry run leaves pruned records in place; keep them out of the preview
        let pruned: HashSet<String> = retention.pruned_ids.iter().cloned().collect();
        let clusters = self
            .consolidation
            .find_clusters_excluding(self.config.consolidation.max_items, &pruned)?;
        let consolidation = self
            .consolidation
            .execute(&clusters, dry_run, lock.as_ref())?;

        let report = MaintenanceReport {
            retention,
            consolidation,
            dry_run,
        };

        tracing::info!(
            pruned = report.retention.pruned,
            consolidated = report.consolidation.memories_consolidated,
            dry_run = dry_run,
            "Maintenance cycle complete"
        );
        Ok(report)
    }

    /// Build a recall engine over this store, optionally tracking access.
    pub fn recall_engine(&self, tracker: Option<Arc<AccessTracker>>) -> RecallEngine<S> {
        let engine = RecallEngine::new(self.store.clone(), self.config.recall.clone());
        match tracker {
            Some(tracker) => engine.with_tracker(tracker),
            None => engine,
        }
    }
}
