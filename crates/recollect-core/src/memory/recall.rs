//! Multi-strategy recall and prompt augmentation.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use super::access::AccessTracker;
use super::traits::MemoryStore;
use crate::error::{Error, Result};
pub use crate::hashing::tokenize;
use crate::types::{
    now_ms, MemoryQuery, MemoryRecord, MemoryType, QueryOrder, TextMatch, HOUR_MS,
};

/// Recall strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecallStrategy {
    /// Token overlap between prompt and content.
    Keyword,
    /// Overlap between the prompt and a record's entities.
    Entity,
    /// Recency of last activity.
    Temporal,
    /// Weighted blend of the three.
    #[default]
    Auto,
}

impl RecallStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecallStrategy::Keyword => "keyword",
            RecallStrategy::Entity => "entity",
            RecallStrategy::Temporal => "temporal",
            RecallStrategy::Auto => "auto",
        }
    }
}

impl std::fmt::Display for RecallStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RecallStrategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "keyword" => Ok(RecallStrategy::Keyword),
            "entity" => Ok(RecallStrategy::Entity),
            "temporal" => Ok(RecallStrategy::Temporal),
            "auto" => Ok(RecallStrategy::Auto),
            other => Err(Error::validation(format!("unknown recall strategy: {other}"))),
        }
    }
}

/// Recall tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecallConfig {
    pub keyword_weight: f64,
    pub entity_weight: f64,
    pub temporal_weight: f64,
    /// Hours for the temporal score to halve.
    pub recency_half_life_hours: f64,
    /// Maximum records loaded from the store per recall.
    pub candidate_limit: usize,
    pub default_strategy: RecallStrategy,
    pub default_max_memories: usize,
}

impl Default for RecallConfig {
    fn default() -> Self {
        Self {
            keyword_weight: 0.4,
            entity_weight: 0.4,
            temporal_weight: 0.2,
            recency_half_life_hours: 72.0,
            candidate_limit: 500,
            default_strategy: RecallStrategy::Auto,
            default_max_memories: 5,
        }
    }
}

/// Caller identity and type scope for recall.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RecallFilters {
    pub user_id: Option<String>,
    pub agent_id: Option<String>,
    pub session_id: Option<String>,
    pub memory_types: Vec<MemoryType>,
}

/// Result of a recall.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryContext {
    pub original_prompt: String,
    pub enhanced_prompt: String,
    /// Selected records, best first.
    pub memories: Vec<MemoryRecord>,
    /// Relevance score of each selected record, parallel to `memories`.
    pub scores: Vec<f64>,
    /// Mean confidence of the selected records (0 when none).
    pub confidence: f64,
    pub strategy_used: RecallStrategy,
    pub recall_time_ms: u64,
}

/// Component scores for one candidate.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct RelevanceScores {
    pub keyword: f64,
    pub entity: f64,
    pub temporal: f64,
}

const STOP_WORDS: &[&str] = &[
    "a", "about", "am", "an", "and", "are", "as", "at", "be", "but", "by", "can", "could", "d",
    "did", "do", "does", "for", "from", "had", "has", "have", "how", "i", "in", "is", "it", "ll",
    "m", "me", "my", "of", "on", "or", "re", "s", "should", "so", "t", "that", "the", "this",
    "to", "ve", "was", "we", "were", "what", "when", "where", "which", "who", "why", "will",
    "with", "would", "you", "your",
];

/// Prompt tokens with stop words removed; all tokens when nothing else remains.
pub fn query_terms(prompt: &str) -> HashSet<String> {
    let tokens = tokenize(prompt);
    let terms: HashSet<String> = tokens
        .iter()
        .filter(|t| !STOP_WORDS.contains(&t.as_str()))
        .cloned()
        .collect();
    if terms.is_empty() {
        tokens.into_iter().collect()
    } else {
        terms
    }
}

fn sorted_terms(terms: &HashSet<String>) -> Vec<String> {
    let mut sorted: Vec<String> = terms.iter().cloned().collect();
    sorted.sort();
    sorted
}

/// Fraction of `terms` present in `content`.
pub fn keyword_score(terms: &HashSet<String>, content: &str) -> f64 {
    if terms.is_empty() {
        return 0.0;
    }
    let words: HashSet<String> = tokenize(content).into_iter().collect();
    terms.iter().filter(|t| words.contains(*t)).count() as f64 / terms.len() as f64
}

/// Fraction of the record's entities mentioned in the prompt.
pub fn entity_score(prompt_tokens: &[String], entities: &[String]) -> f64 {
    if entities.is_empty() {
        return 0.0;
    }
    let mentioned = entities
        .iter()
        .filter(|entity| {
            let needle = tokenize(entity);
            !needle.is_empty() && prompt_tokens.windows(needle.len()).any(|w| w == needle.as_slice())
        })
        .count();
    mentioned as f64 / entities.len() as f64
}

/// Exponential recency decay over the record's last activity.
pub fn temporal_score(last_activity_at: i64, now: i64, half_life_hours: f64) -> f64 {
    let age_hours = (now - last_activity_at).max(0) as f64 / HOUR_MS as f64;
    if half_life_hours <= 0.0 {
        return if age_hours == 0.0 { 1.0 } else { 0.0 };
    }
    0.5f64.powf(age_hours / half_life_hours)
}

/// Render the augmented prompt. No memories leaves the prompt untouched.
pub fn render_enhanced_prompt(prompt: &str, memories: &[MemoryRecord]) -> String {
    if memories.is_empty() {
        return prompt.to_string();
    }
    let mut out = String::from("<relevant_memories>\n");
    for memory in memories {
        out.push_str(&format!("- [{}] {}\n", memory.memory_type, memory.content));
    }
    out.push_str("</relevant_memories>\n\n");
    out.push_str(prompt);
    out
}

/// Strategy dispatch, ranking and prompt assembly over a store.
pub struct RecallEngine<S: MemoryStore> {
    store: Arc<S>,
    config: RecallConfig,
    tracker: Option<Arc<AccessTracker>>,
}

impl<S: MemoryStore> RecallEngine<S> {
    pub fn new(store: Arc<S>, config: RecallConfig) -> Self {
        Self {
            store,
            config,
            tracker: None,
        }
    }

    /// Report every returned record to this tracker.
    pub fn with_tracker(mut self, tracker: Arc<AccessTracker>) -> Self {
        self.tracker = Some(tracker);
        self
    }

    pub fn config(&self) -> &RecallConfig {
        &self.config
    }

    /// Parse the strategy name, then recall.
    pub fn recall_named(
        &self,
        prompt: &str,
        strategy: &str,
        max_memories: usize,
        filters: &RecallFilters,
    ) -> Result<MemoryContext> {
        self.recall(prompt, strategy.parse()?, max_memories, filters)
    }

    /// Select and rank memories relevant to `prompt`.
    ///
    /// An empty selection is a valid zero-confidence context.
    pub fn recall(
        &self,
        prompt: &str,
        strategy: RecallStrategy,
        max_memories: usize,
        filters: &RecallFilters,
    ) -> Result<MemoryContext> {
        let started = Instant::now();

        if prompt.trim().is_empty() {
            return Err(Error::validation("prompt must not be empty"));
        }
        if max_memories == 0 {
            return Err(Error::validation("maxMemories must be at least 1"));
        }

        let terms = query_terms(prompt);
        let prompt_tokens = tokenize(prompt);

        // Only records that can score above zero are loaded, so the candidate
        // limit never hides a relevant record behind unrelated important ones.
        let (order, text_match) = match strategy {
            RecallStrategy::Temporal => (QueryOrder::RecentlyAccessed, None),
            RecallStrategy::Keyword => (
                QueryOrder::Importance,
                Some(TextMatch {
                    terms: sorted_terms(&terms),
                    mentioned_in: None,
                }),
            ),
            RecallStrategy::Entity => (
                QueryOrder::Importance,
                Some(TextMatch {
                    terms: Vec::new(),
                    mentioned_in: Some(prompt.to_string()),
                }),
            ),
            RecallStrategy::Auto => (
                QueryOrder::Importance,
                Some(TextMatch {
                    terms: sorted_terms(&terms),
                    mentioned_in: Some(prompt.to_string()),
                }),
            ),
        };
        let candidates = self.store.query(&MemoryQuery {
            user_id: filters.user_id.clone(),
            agent_id: filters.agent_id.clone(),
            session_id: filters.session_id.clone(),
            memory_types: filters.memory_types.clone(),
            order,
            limit: Some(self.config.candidate_limit),
            text_match,
            ..Default::default()
        })?;
        let candidate_count = candidates.len();

        let now = now_ms();

        let mut ranked: Vec<(f64, MemoryRecord)> = candidates
            .into_iter()
            .filter_map(|record| {
                let scores = RelevanceScores {
                    keyword: keyword_score(&terms, &record.content),
                    entity: entity_score(&prompt_tokens, &record.entities),
                    temporal: temporal_score(
                        record.last_activity_at(),
                        now,
                        self.config.recency_half_life_hours,
                    ),
                };
                self.combine(strategy, scores).map(|score| (score, record))
            })
            .collect();

        ranked.sort_by(|(score_a, a), (score_b, b)| {
            score_b
                .total_cmp(score_a)
                .then_with(|| b.importance.total_cmp(&a.importance))
                .then_with(|| b.last_activity_at().cmp(&a.last_activity_at()))
                .then_with(|| a.id.cmp(&b.id))
        });
        ranked.truncate(max_memories);

        let (scores, memories): (Vec<f64>, Vec<MemoryRecord>) = ranked.into_iter().unzip();
        let confidence = if memories.is_empty() {
            0.0
        } else {
            memories.iter().map(|m| m.confidence).sum::<f64>() / memories.len() as f64
        };

        if let Some(tracker) = &self.tracker {
            let ids: Vec<&str> = memories.iter().map(|m| m.id.as_str()).collect();
            tracker.track_batch(&ids, &format!("recall:{strategy}"));
        }

        let context = MemoryContext {
            original_prompt: prompt.to_string(),
            enhanced_prompt: render_enhanced_prompt(prompt, &memories),
            memories,
            scores,
            confidence,
            strategy_used: strategy,
            recall_time_ms: started.elapsed().as_millis() as u64,
        };

        tracing::debug!(
            strategy = %strategy,
            candidates = candidate_count,
            selected = context.memories.len(),
            elapsed_ms = context.recall_time_ms,
            "Recalled memories"
        );

        Ok(context)
    }

    /// Combined score, or `None` when the candidate is irrelevant to the strategy.
    fn combine(&self, strategy: RecallStrategy, scores: RelevanceScores) -> Option<f64> {
        match strategy {
            RecallStrategy::Keyword => (scores.keyword > 0.0).then_some(scores.keyword),
            RecallStrategy::Entity => (scores.entity > 0.0).then_some(scores.entity),
            RecallStrategy::Temporal => Some(scores.temporal),
            RecallStrategy::Auto => {
                if scores.keyword <= 0.0 && scores.entity <= 0.0 {
                    return None;
                }
                Some(
                    self.config.keyword_weight * scores.keyword
                        + self.config.entity_weight * scores.entity
                        + self.config.temporal_weight * scores.temporal,
                )
            }
        }
    }
}
