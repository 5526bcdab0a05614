//! Memory consolidation.
//!
//! Finds clusters of near-duplicate records and merges each into one canonical
//! record. Originals are archived (or deleted) and linked to the canonical by a
//! MERGED_INTO edge, so nothing is lost without a trace.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::traits::{MemoryStore, MergePlan};
use crate::error::{Error, Result};
use crate::hashing::normalize;
use crate::lock::StoreLock;
use crate::types::{dedup_entities, now_ms, MemoryQuery, MemoryRecord, QueryOrder};

/// Metadata key listing the ids merged into a canonical record.
pub const MERGED_FROM_KEY: &str = "mergedFrom";
/// Metadata key holding the last merge time (epoch ms).
pub const MERGED_AT_KEY: &str = "mergedAt";

/// How canonical content is produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeStrategy {
    /// Keep the canonical record's content unchanged.
    #[default]
    KeepCanonical,
    /// Join the unique contents of the cluster.
    Concatenate,
}

/// Consolidation tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsolidationConfig {
    /// Minimum Jaccard word overlap for near-duplicates.
    pub similarity_threshold: f64,
    /// Whether records from different agents may merge.
    pub cross_agent: bool,
    /// Whether records from different sessions may merge.
    pub cross_session: bool,
    pub strategy: MergeStrategy,
    /// Archive originals (true) or delete them (false).
    pub archive_originals: bool,
    /// Shorter side of a containment match needs at least this many words.
    pub min_containment_words: usize,
    /// Default number of records examined per run.
    pub max_items: usize,
}

impl Default for ConsolidationConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: 0.8,
            cross_agent: true,
            cross_session: true,
            strategy: MergeStrategy::KeepCanonical,
            archive_originals: true,
            min_containment_words: 3,
            max_items: 500,
        }
    }
}

/// A group of near-duplicate records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryCluster {
    pub canonical_id: String,
    /// All members, canonical included.
    pub member_ids: Vec<String>,
}

/// Outcome of [`ConsolidationEngine::execute`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsolidationReport {
    pub clusters_found: usize,
    pub memories_analyzed: usize,
    pub memories_consolidated: usize,
    pub memories_archived: usize,
    pub memories_deleted: usize,
    /// Always 0: canonicals are promoted in place.
    pub new_memories_created: usize,
    pub dry_run: bool,
}

/// Check if two records are similar enough to consolidate.
pub fn are_similar(a: &MemoryRecord, b: &MemoryRecord, config: &ConsolidationConfig) -> bool {
    // Never merge across users
    if a.user_id != b.user_id {
        return false;
    }
    if !config.cross_agent && a.agent_id != b.agent_id {
        return false;
    }
    if !config.cross_session && a.session_id != b.session_id {
        return false;
    }

    // Same content hash means identical content
    if a.content_hash == b.content_hash {
        return true;
    }

    if a.memory_type != b.memory_type {
        return false;
    }

    let a_norm = normalize(&a.content);
    let b_norm = normalize(&b.content);
    let a_words: Vec<&str> = a_norm.split(' ').filter(|w| !w.is_empty()).collect();
    let b_words: Vec<&str> = b_norm.split(' ').filter(|w| !w.is_empty()).collect();
    if a_words.is_empty() || b_words.is_empty() {
        return false;
    }

    // Check if one contains the other on word boundaries
    let (shorter, longer) = if a_words.len() <= b_words.len() {
        (&a_words, &b_words)
    } else {
        (&b_words, &a_words)
    };
    if shorter.len() >= config.min_containment_words
        && longer.windows(shorter.len()).any(|w| w == shorter.as_slice())
    {
        return true;
    }

    // Check word overlap
    let a_set: HashSet<&str> = a_words.into_iter().collect();
    let b_set: HashSet<&str> = b_words.into_iter().collect();
    let intersection = a_set.intersection(&b_set).count();
    let union = a_set.union(&b_set).count();
    let jaccard = intersection as f64 / union as f64;

    jaccard >= config.similarity_threshold
}

/// Ids already merged into a record.
pub fn merged_from(record: &MemoryRecord) -> Vec<String> {
    record
        .metadata
        .get(MERGED_FROM_KEY)
        .and_then(|raw| serde_json::from_str::<Vec<String>>(raw).ok())
        .unwrap_or_default()
}

/// Pick the canonical member: prior merges first, then importance, access
/// count, age and id.
pub fn choose_canonical(members: &[MemoryRecord]) -> Option<&MemoryRecord> {
    members.iter().min_by(|a, b| {
        let a_merged = a.metadata.contains_key(MERGED_FROM_KEY);
        let b_merged = b.metadata.contains_key(MERGED_FROM_KEY);
        b_merged
            .cmp(&a_merged)
            .then_with(|| b.importance.total_cmp(&a.importance))
            .then_with(|| b.access_count.cmp(&a.access_count))
            .then_with(|| a.created_at.cmp(&b.created_at))
            .then_with(|| a.id.cmp(&b.id))
    })
}

/// Merges near-duplicate records into canonical ones.
pub struct ConsolidationEngine<S: MemoryStore> {
    store: Arc<S>,
    config: ConsolidationConfig,
}

impl<S: MemoryStore> ConsolidationEngine<S> {
    pub fn new(store: Arc<S>, config: ConsolidationConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &ConsolidationConfig {
        &self.config
    }

    /// Group up to `max_items` live records (oldest first) into clusters of
    /// two or more near-duplicates. Read-only.
    pub fn find_clusters(&self, max_items: usize) -> Result<Vec<MemoryCluster>> {
        self.find_clusters_excluding(max_items, &HashSet::new())
    }

    /// Like [`Self::find_clusters`], ignoring the `excluded` ids, e.g. records
    /// a preceding retention pass prunes.
    pub fn find_clusters_excluding(
        &self,
        max_items: usize,
        excluded: &HashSet<String>,
    ) -> Result<Vec<MemoryCluster>> {
        let mut records = self.store.query(&MemoryQuery {
            include_expired: true,
            order: QueryOrder::Oldest,
            limit: Some(max_items.saturating_add(excluded.len())),
            ..Default::default()
        })?;
        records.retain(|record| !excluded.contains(&record.id));
        records.truncate(max_items);

        // Only records of the same user are ever compared
        let mut by_user: BTreeMap<Option<String>, Vec<&MemoryRecord>> = BTreeMap::new();
        for record in &records {
            by_user.entry(record.user_id.clone()).or_default().push(record);
        }

        let mut clusters = Vec::new();
        for entries in by_user.values() {
            let mut processed: Vec<bool> = vec![false; entries.len()];

            for i in 0..entries.len() {
                if processed[i] {
                    continue;
                }

                let mut similar_group = vec![entries[i].clone()];
                processed[i] = true;

                for j in (i + 1)..entries.len() {
                    if processed[j] {
                        continue;
                    }

                    if are_similar(entries[i], entries[j], &self.config) {
                        similar_group.push(entries[j].clone());
                        processed[j] = true;
                    }
                }

                if similar_group.len() > 1 {
                    if let Some(canonical) = choose_canonical(&similar_group) {
                        clusters.push(MemoryCluster {
                            canonical_id: canonical.id.clone(),
                            member_ids: similar_group.iter().map(|r| r.id.clone()).collect(),
                        });
                    }
                }
            }
        }

        tracing::debug!(
            analyzed = records.len(),
            clusters = clusters.len(),
            "Found consolidation clusters"
        );
        Ok(clusters)
    }

    /// Merge each cluster into its canonical record.
    ///
    /// Clusters with fewer than two live members are skipped, which makes a
    /// repeated run a no-op. A real run needs the store lock.
    pub fn execute(
        &self,
        clusters: &[MemoryCluster],
        dry_run: bool,
        lock: Option<&StoreLock>,
    ) -> Result<ConsolidationReport> {
        if !dry_run {
            let lock = lock.ok_or_else(|| {
                Error::validation("consolidation requires the store lock unless dryRun is set")
            })?;
            lock.ensure_covers(self.store.store_path())?;
        }

        let mut report = ConsolidationReport {
            clusters_found: clusters.len(),
            dry_run,
            ..Default::default()
        };

        for cluster in clusters {
            let members = self.store.batch_get_by_ids(&cluster.member_ids)?;
            report.memories_analyzed += members.len();

            let live: Vec<MemoryRecord> =
                members.into_iter().filter(|m| !m.is_archived()).collect();
            if live.len() < 2 {
                tracing::debug!(
                    canonical_id = %cluster.canonical_id,
                    "Cluster already consolidated, skipping"
                );
                continue;
            }

            let plan = self.plan_merge(&live)?;
            let originals = plan.originals.len();

            if !dry_run {
                self.store.apply_merge(&plan)?;
            }

            report.memories_consolidated += originals;
            if self.config.archive_originals {
                report.memories_archived += originals;
            } else {
                report.memories_deleted += originals;
            }

            tracing::info!(
                canonical_id = %plan.canonical_id,
                merged = originals,
                dry_run = dry_run,
                "Consolidated memory cluster"
            );
        }

        Ok(report)
    }

    fn plan_merge(&self, live: &[MemoryRecord]) -> Result<MergePlan> {
        let canonical = choose_canonical(live)
            .ok_or_else(|| Error::Other("empty consolidation cluster".to_string()))?;
        let originals: Vec<&MemoryRecord> = live.iter().filter(|m| m.id != canonical.id).collect();

        let mut merged_ids: BTreeSet<String> = merged_from(canonical).into_iter().collect();
        merged_ids.extend(originals.iter().map(|m| m.id.clone()));

        let merged_at = now_ms();
        let mut metadata = canonical.metadata.clone();
        for original in &originals {
            for (key, value) in &original.metadata {
                if key != MERGED_FROM_KEY && key != MERGED_AT_KEY {
                    metadata.entry(key.clone()).or_insert_with(|| value.clone());
                }
            }
        }
        metadata.insert(
            MERGED_FROM_KEY.to_string(),
            serde_json::to_string(&merged_ids.into_iter().collect::<Vec<_>>())?,
        );
        metadata.insert(MERGED_AT_KEY.to_string(), merged_at.to_string());

        let entities = dedup_entities(
            std::iter::once(canonical)
                .chain(originals.iter().copied())
                .flat_map(|m| m.entities.iter().cloned())
                .collect(),
        );

        let content = match self.config.strategy {
            MergeStrategy::KeepCanonical => None,
            MergeStrategy::Concatenate => {
                let mut seen = HashSet::new();
                let parts: Vec<&str> = std::iter::once(canonical)
                    .chain(originals.iter().copied())
                    .filter(|m| seen.insert(m.content_hash.clone()))
                    .map(|m| m.content.as_str())
                    .collect();
                Some(parts.join("; "))
            }
        };

        Ok(MergePlan {
            canonical_id: canonical.id.clone(),
            content,
            importance: live.iter().map(|m| m.importance).fold(0.0, f64::max),
            confidence: live.iter().map(|m| m.confidence).fold(0.0, f64::max),
            entities,
            metadata,
            originals: originals.iter().map(|m| m.id.clone()).collect(),
            archive_originals: self.config.archive_originals,
            merged_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::lock::ConcurrencyGuard;
    use crate::memory::MERGED_INTO;
    use crate::types::{MemoryType, NewMemory};
    use std::path::Path;
    use std::time::Duration;

    fn with_agent(content: &str, agent: &str) -> NewMemory {
        let mut memory = NewMemory::new(content, MemoryType::Preference);
        memory.agent_id = Some(agent.to_string());
        memory
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        db: Arc<Database>,
        guard: ConcurrencyGuard,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let db = Arc::new(Database::open_path(&dir.path().join("memory.db")).unwrap());
            Self {
                _dir: dir,
                db,
                guard: ConcurrencyGuard::default(),
            }
        }

        fn lock(&self) -> StoreLock {
            self.guard.acquire(self.db.path(), Duration::ZERO).unwrap()
        }

        fn engine(&self, config: ConsolidationConfig) -> ConsolidationEngine<Database> {
            ConsolidationEngine::new(self.db.clone(), config)
        }

        fn live_count(&self) -> usize {
            self.db.query(&MemoryQuery::default()).unwrap().len()
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Similarity Tests
    // ─────────────────────────────────────────────────────────────────────────

    #[test]
    fn test_similarity_rules() {
        let db = Database::open_in_memory().unwrap();
        let ids = db
            .batch_upsert(vec![
                with_agent("user prefers dark mode in every editor", "a1"),
                with_agent("User prefers dark mode in every editor", "a2"),
                with_agent("prefers dark mode", "a1"),
                with_agent("user prefers light mode in every editor", "a1"),
                with_agent("enjoys hiking", "a1"),
            ])
            .unwrap();
        let records = db.batch_get_by_ids(&ids).unwrap();
        let config = ConsolidationConfig::default();

        // Identical hash
        assert!(are_similar(&records[0], &records[1], &config));
        // Containment with three or more words
        assert!(are_similar(&records[0], &records[2], &config));
        // One differing word out of seven: Jaccard 6/8 < 0.8
        assert!(!are_similar(&records[0], &records[3], &config));
        assert!(!are_similar(&records[0], &records[4], &config));

        let strict = ConsolidationConfig {
            cross_agent: false,
            ..Default::default()
        };
        assert!(!are_similar(&records[0], &records[1], &strict));
    }

    #[test]
    fn test_canonical_prefers_prior_merge_then_importance() {
        let db = Database::open_in_memory().unwrap();
        let mut low = with_agent("likes tea", "a1");
        low.importance = Some(0.3);
        let mut high = with_agent("likes tea", "a2");
        high.importance = Some(0.9);
        let ids = db.batch_upsert(vec![low, high]).unwrap();
        let mut records = db.batch_get_by_ids(&ids).unwrap();

        assert_eq!(choose_canonical(&records).unwrap().id, ids[1]);

        records[0]
            .metadata
            .insert(MERGED_FROM_KEY.into(), "[\"older\"]".into());
        assert_eq!(choose_canonical(&records).unwrap().id, ids[0]);
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Execute Tests
    // ─────────────────────────────────────────────────────────────────────────

    #[test]
    fn test_duplicate_pair_merges_to_two_live_records() {
        let fx = Fixture::new();
        fx.db.upsert(with_agent("likes green tea", "a1")).unwrap();
        fx.db.upsert(with_agent("likes green tea", "a2")).unwrap();
        fx.db.upsert(with_agent("lives near the river", "a1")).unwrap();
        let engine = fx.engine(ConsolidationConfig::default());

        let clusters = engine.find_clusters(100).unwrap();
        assert_eq!(clusters.len(), 1);
        assert_eq!(clusters[0].member_ids.len(), 2);

        let lock = fx.lock();
        let report = engine.execute(&clusters, false, Some(&lock)).unwrap();
        assert_eq!(report.clusters_found, 1);
        assert_eq!(report.memories_consolidated, 1);
        assert_eq!(report.memories_archived, 1);
        assert_eq!(report.new_memories_created, 0);
        assert_eq!(fx.live_count(), 2);

        let canonical = fx.db.get_by_id(&clusters[0].canonical_id).unwrap().unwrap();
        let merged = merged_from(&canonical);
        assert_eq!(merged.len(), 1);
        assert!(canonical.metadata.contains_key(MERGED_AT_KEY));

        let original = &merged[0];
        assert!(fx.db.get_by_id(original).unwrap().unwrap().is_archived());
        let edges = fx.db.related(original, Some(MERGED_INTO)).unwrap();
        assert_eq!(edges[0].to_id, canonical.id);
    }

    #[test]
    fn test_execute_twice_is_noop() {
        let fx = Fixture::new();
        fx.db.upsert(with_agent("likes green tea", "a1")).unwrap();
        fx.db.upsert(with_agent("likes green tea", "a2")).unwrap();
        let engine = fx.engine(ConsolidationConfig::default());
        let clusters = engine.find_clusters(100).unwrap();
        let lock = fx.lock();

        engine.execute(&clusters, false, Some(&lock)).unwrap();
        let canonical_before = fx.db.get_by_id(&clusters[0].canonical_id).unwrap().unwrap();

        let again = engine.execute(&clusters, false, Some(&lock)).unwrap();
        assert_eq!(again.memories_consolidated, 0);
        assert!(engine.find_clusters(100).unwrap().is_empty());

        let canonical_after = fx.db.get_by_id(&clusters[0].canonical_id).unwrap().unwrap();
        assert_eq!(canonical_before.metadata, canonical_after.metadata);
        assert_eq!(fx.live_count(), 1);
    }

    #[test]
    fn test_dry_run_does_not_mutate() {
        let fx = Fixture::new();
        fx.db.upsert(with_agent("likes green tea", "a1")).unwrap();
        fx.db.upsert(with_agent("likes green tea", "a2")).unwrap();
        let engine = fx.engine(ConsolidationConfig::default());
        let clusters = engine.find_clusters(100).unwrap();

        let report = engine.execute(&clusters, true, None).unwrap();
        assert!(report.dry_run);
        assert_eq!(report.memories_consolidated, 1);
        assert_eq!(fx.live_count(), 2);
    }

    #[test]
    fn test_delete_originals_and_concatenate() {
        let fx = Fixture::new();
        fx.db.upsert(with_agent("prefers dark mode", "a1")).unwrap();
        fx.db.upsert(with_agent("prefers dark mode in every editor", "a1")).unwrap();
        let engine = fx.engine(ConsolidationConfig {
            archive_originals: false,
            strategy: MergeStrategy::Concatenate,
            ..Default::default()
        });

        let clusters = engine.find_clusters(100).unwrap();
        let lock = fx.lock();
        let report = engine.execute(&clusters, false, Some(&lock)).unwrap();

        assert_eq!(report.memories_deleted, 1);
        let live = fx.db.query(&MemoryQuery::default()).unwrap();
        assert_eq!(live.len(), 1);
        assert!(live[0].content.contains("prefers dark mode; prefers dark mode in every editor")
            || live[0].content.contains("prefers dark mode in every editor; prefers dark mode"));
    }

    #[test]
    fn test_execute_requires_lock_for_real_run() {
        let fx = Fixture::new();
        let engine = fx.engine(ConsolidationConfig::default());
        assert!(engine.execute(&[], false, None).unwrap_err().is_validation());

        let other = fx
            .guard
            .acquire(&fx._dir.path().join("elsewhere.db"), Duration::ZERO)
            .unwrap();
        assert!(engine.execute(&[], false, Some(&other)).unwrap_err().is_validation());
        assert_ne!(other.store_path(), Path::new(fx.db.path()));
    }
}
