//! Retention scoring and eviction.
//!
//! Every live record gets a composite score in [0, 1]; higher means more worth
//! keeping. Pruning removes the lowest-scoring records that are not protected.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::traits::MemoryStore;
use crate::error::{Error, Result};
use crate::lock::StoreLock;
use crate::types::{now_ms, MemoryQuery, MemoryRecord, MemoryType, QueryOrder, DAY_MS, HOUR_MS};

/// Retention policy tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    pub age_weight: f64,
    pub size_weight: f64,
    pub access_weight: f64,
    pub importance_weight: f64,
    /// Days for the age score to halve.
    pub age_half_life_days: f64,
    /// Content size at which the size penalty saturates.
    pub size_reference_bytes: usize,
    /// Access count at which the access score saturates.
    pub access_saturation: u32,
    /// Types never pruned.
    pub protected_types: Vec<MemoryType>,
    /// Records accessed this recently are never pruned.
    pub recent_access_hours: u32,
    /// Records at or above this importance are never pruned.
    pub protected_importance: f64,
    /// Unprotected records scoring below this are pruned.
    pub prune_below: f64,
    /// Default number of records analyzed per run.
    pub analyze_limit: usize,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            age_weight: 0.3,
            size_weight: 0.1,
            access_weight: 0.3,
            importance_weight: 0.3,
            age_half_life_days: 14.0,
            size_reference_bytes: 2_048,
            access_saturation: 20,
            protected_types: vec![
                MemoryType::Semantic,
                MemoryType::Preference,
                MemoryType::Procedural,
            ],
            recent_access_hours: 24,
            protected_importance: 0.9,
            prune_below: 0.45,
            analyze_limit: 1_000,
        }
    }
}

/// Eviction score for one record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetentionScore {
    pub memory_id: String,
    pub memory_type: MemoryType,
    pub age_score: f64,
    pub size_score: f64,
    pub access_score: f64,
    pub importance_score: f64,
    pub total_score: f64,
    pub is_protected: bool,
    pub size_bytes: usize,
}

/// Outcome of [`RetentionPolicy::apply`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetentionReport {
    pub pruned: usize,
    pub kept: usize,
    pub protected_count: usize,
    pub bytes_reclaimed: usize,
    pub dry_run: bool,
    pub pruned_ids: Vec<String>,
}

/// Scores records and prunes the least valuable.
pub struct RetentionPolicy<S: MemoryStore> {
    store: Arc<S>,
    config: RetentionConfig,
}

impl<S: MemoryStore> RetentionPolicy<S> {
    pub fn new(store: Arc<S>, config: RetentionConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &RetentionConfig {
        &self.config
    }

    /// Score a record at time `now`.
    pub fn score(&self, record: &MemoryRecord, now: i64) -> RetentionScore {
        let c = &self.config;

        let age_days = (now - record.last_activity_at()).max(0) as f64 / DAY_MS as f64;
        // Past its validity window the record has no age value left
        let age_score = if record.is_expired(now) {
            0.0
        } else if c.age_half_life_days > 0.0 {
            0.5f64.powf(age_days / c.age_half_life_days)
        } else {
            0.0
        };

        let size_bytes = record.content.len();
        let size_factor = (size_bytes as f64 / c.size_reference_bytes.max(1) as f64).min(1.0);
        let size_score = if record.access_count == 0 {
            1.0 - size_factor
        } else {
            1.0 - size_factor / 2.0
        };

        let access_score = if c.access_saturation == 0 {
            1.0
        } else {
            ((1.0 + record.access_count.max(0) as f64).ln()
                / (1.0 + c.access_saturation as f64).ln())
            .min(1.0)
        };

        let importance_score = record.importance;

        let total_score = c.age_weight * age_score
            + c.size_weight * size_score
            + c.access_weight * access_score
            + c.importance_weight * importance_score;

        let recently_accessed =
            record.access_count > 0 && now - record.accessed_at < c.recent_access_hours as i64 * HOUR_MS;
        let is_protected = c.protected_types.contains(&record.memory_type)
            || recently_accessed
            || record.importance >= c.protected_importance;

        RetentionScore {
            memory_id: record.id.clone(),
            memory_type: record.memory_type,
            age_score,
            size_score,
            access_score,
            importance_score,
            total_score,
            is_protected,
            size_bytes,
        }
    }

    /// Score live records, most prunable first. Read-only.
    pub fn analyze(&self, limit: usize) -> Result<Vec<RetentionScore>> {
        let records = self.store.query(&MemoryQuery {
            include_expired: true,
            order: QueryOrder::Oldest,
            ..Default::default()
        })?;

        let now = now_ms();
        let mut scores: Vec<RetentionScore> =
            records.iter().map(|record| self.score(record, now)).collect();
        scores.sort_by(|a, b| {
            a.total_score
                .total_cmp(&b.total_score)
                .then_with(|| a.memory_id.cmp(&b.memory_id))
        });
        scores.truncate(limit);

        tracing::debug!(
            analyzed = records.len(),
            returned = scores.len(),
            "Analyzed retention scores"
        );
        Ok(scores)
    }

    /// Prune unprotected entries scoring below the threshold, lowest first.
    ///
    /// Protection and scores are re-evaluated against the current records, so
    /// stale input can never prune something that became protected. A real run
    /// needs the store lock.
    pub fn apply(
        &self,
        scores: &[RetentionScore],
        dry_run: bool,
        lock: Option<&StoreLock>,
    ) -> Result<RetentionReport> {
        if !dry_run {
            let lock = lock.ok_or_else(|| {
                Error::validation("retention apply requires the store lock unless dryRun is set")
            })?;
            lock.ensure_covers(self.store.store_path())?;
        }

        let ids: Vec<String> = scores.iter().map(|s| s.memory_id.clone()).collect();
        let now = now_ms();
        let mut current: Vec<RetentionScore> = self
            .store
            .batch_get_by_ids(&ids)?
            .iter()
            .filter(|record| !record.is_archived())
            .map(|record| self.score(record, now))
            .collect();
        current.sort_by(|a, b| {
            a.total_score
                .total_cmp(&b.total_score)
                .then_with(|| a.memory_id.cmp(&b.memory_id))
        });

        let protected_count = current.iter().filter(|s| s.is_protected).count();
        let doomed: Vec<&RetentionScore> = current
            .iter()
            .filter(|s| !s.is_protected && s.total_score < self.config.prune_below)
            .collect();

        let pruned_ids: Vec<String> = doomed.iter().map(|s| s.memory_id.clone()).collect();
        let bytes_reclaimed = doomed.iter().map(|s| s.size_bytes).sum();

        let pruned = if dry_run || pruned_ids.is_empty() {
            pruned_ids.len()
        } else {
            self.store.delete_batch(&pruned_ids)?
        };

        let report = RetentionReport {
            pruned,
            kept: current.len() - pruned.min(current.len()),
            protected_count,
            bytes_reclaimed,
            dry_run,
            pruned_ids,
        };

        tracing::info!(
            pruned = report.pruned,
            kept = report.kept,
            protected = report.protected_count,
            bytes_reclaimed = report.bytes_reclaimed,
            dry_run = dry_run,
            "Applied retention policy"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::lock::ConcurrencyGuard;
    use crate::memory::AccessSink;
    use crate::types::{AccessUpdate, NewMemory};
    use std::time::Duration;

    fn record(ty: MemoryType, importance: f64, access_count: i64, age_days: i64) -> MemoryRecord {
        let now = now_ms();
        let at = now - age_days * DAY_MS;
        MemoryRecord {
            id: format!("{ty}-{importance}-{access_count}-{age_days}"),
            content: "x".repeat(100),
            content_hash: String::new(),
            memory_type: ty,
            importance,
            confidence: 0.5,
            created_at: at,
            updated_at: at,
            valid_from: at,
            valid_to: None,
            accessed_at: at,
            access_count,
            source_type: "manual".into(),
            agent_id: None,
            user_id: None,
            session_id: None,
            entities: vec![],
            metadata: Default::default(),
            archived_at: None,
        }
    }

    fn policy() -> RetentionPolicy<Database> {
        RetentionPolicy::new(Arc::new(Database::open_in_memory().unwrap()), RetentionConfig::default())
    }

    /// Old, unused episodic record: prunable.
    fn stale_episode(content: &str) -> NewMemory {
        let mut memory = NewMemory::new(content, MemoryType::Episodic);
        memory.importance = Some(0.2);
        memory.valid_from = Some(now_ms() - 90 * DAY_MS);
        memory
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Scoring Tests
    // ─────────────────────────────────────────────────────────────────────────

    #[test]
    fn test_scores_are_bounded_and_ordered() {
        let policy = policy();
        let now = now_ms();

        let fresh = policy.score(&record(MemoryType::Episodic, 0.5, 10, 0), now);
        let stale = policy.score(&record(MemoryType::Episodic, 0.5, 0, 60), now);

        for score in [&fresh, &stale] {
            for component in [
                score.age_score,
                score.size_score,
                score.access_score,
                score.importance_score,
                score.total_score,
            ] {
                assert!((0.0..=1.0).contains(&component));
            }
        }
        assert!(fresh.total_score > stale.total_score);
        assert_eq!(stale.access_score, 0.0);
    }

    #[test]
    fn test_protection_rules() {
        let policy = policy();
        let now = now_ms();

        assert!(policy.score(&record(MemoryType::Semantic, 0.1, 0, 100), now).is_protected);
        assert!(policy.score(&record(MemoryType::Working, 0.95, 0, 100), now).is_protected);
        assert!(policy.score(&record(MemoryType::Episodic, 0.1, 3, 0), now).is_protected);
        assert!(!policy.score(&record(MemoryType::Episodic, 0.1, 0, 100), now).is_protected);
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Apply Tests
    // ─────────────────────────────────────────────────────────────────────────

    #[test]
    fn test_dry_run_never_mutates() {
        let policy = policy();
        policy.store.upsert(stale_episode("went to the old office")).unwrap();
        policy.store.upsert(NewMemory::new("name is Alice", MemoryType::Semantic)).unwrap();

        let scores = policy.analyze(100).unwrap();
        let report = policy.apply(&scores, true, None).unwrap();

        assert!(report.dry_run);
        assert_eq!(report.pruned, 1);
        assert_eq!(report.protected_count, 1);
        assert_eq!(policy.store.stats(None).unwrap().total, 2);
    }

    #[test]
    fn test_apply_prunes_unprotected_under_lock() {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(Database::open_path(&dir.path().join("memory.db")).unwrap());
        let policy = RetentionPolicy::new(db.clone(), RetentionConfig::default());

        let stale = db.upsert(stale_episode("attended the kickoff meeting")).unwrap();
        let kept = db.upsert(NewMemory::new("prefers dark mode", MemoryType::Preference)).unwrap();
        let used = db.upsert(stale_episode("fixed the flaky deploy")).unwrap();
        db.record_access_batch(&[AccessUpdate {
            memory_id: used.clone(),
            count: 1,
            accessed_at: now_ms(),
            context: "test".into(),
        }])
        .unwrap();

        let scores = policy.analyze(100).unwrap();
        assert_eq!(scores[0].memory_id, stale);

        let lock = ConcurrencyGuard::default().acquire(db.path(), Duration::ZERO).unwrap();
        let report = policy.apply(&scores, false, Some(&lock)).unwrap();

        assert_eq!(report.pruned_ids, vec![stale.clone()]);
        assert_eq!(report.kept, 2);
        assert_eq!(report.protected_count, 2);
        assert!(report.bytes_reclaimed > 0);
        assert!(db.get_by_id(&stale).unwrap().is_none());
        assert!(db.get_by_id(&kept).unwrap().is_some());
        assert!(db.get_by_id(&used).unwrap().is_some());
    }

    #[test]
    fn test_apply_requires_matching_lock() {
        let dir = tempfile::tempdir().unwrap();
        let policy = policy();
        let scores = policy.analyze(10).unwrap();

        assert!(policy.apply(&scores, false, None).unwrap_err().is_validation());

        let other = ConcurrencyGuard::default()
            .acquire(&dir.path().join("other.db"), Duration::ZERO)
            .unwrap();
        assert!(policy.apply(&scores, false, Some(&other)).unwrap_err().is_validation());
    }

    #[test]
    fn test_stale_scores_cannot_prune_protected() {
        let policy = policy();
        let id = policy.store.upsert(NewMemory::new("lives in Kyoto", MemoryType::Semantic)).unwrap();

        let forged = RetentionScore {
            memory_id: id.clone(),
            memory_type: MemoryType::Semantic,
            age_score: 0.0,
            size_score: 0.0,
            access_score: 0.0,
            importance_score: 0.0,
            total_score: 0.0,
            is_protected: false,
            size_bytes: 0,
        };
        let report = policy.apply(&[forged], true, None).unwrap();
        assert_eq!(report.pruned, 0);
        assert_eq!(report.protected_count, 1);
    }
}
