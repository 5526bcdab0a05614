//! Memory extraction from free text.
//!
//! An ordered rule table (built-ins first, then caller-supplied custom rules)
//! turns sentences like "My name is Alice" into typed candidate memories.
//! Confidence starts from the rule's base value and is nudged by a small
//! sentiment lexicon.

use std::collections::{BTreeMap, HashMap};
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::hashing::{content_hash, normalize};
use crate::types::{MemoryType, NewMemory, Provenance};

/// Configuration for memory extraction.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractionConfig {
    /// Minimum length of a candidate's final content.
    pub min_content_length: usize,
    /// Captured phrases that never make a memory on their own.
    pub stoplist: Vec<String>,
    /// Enable lexicon sentiment boosting.
    pub use_sentiment: bool,
    /// Confidence added when the sentiment signal is strong.
    pub sentiment_boost: f64,
    /// Cap applied after boosting.
    pub max_confidence: f64,
    /// Rules appended after the built-in table.
    pub custom_rules: Vec<ExtractionRule>,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            min_content_length: 8,
            stoplist: ["it", "that", "this", "them", "those", "these", "so", "you", "me", "one"]
                .into_iter()
                .map(String::from)
                .collect(),
            use_sentiment: true,
            sentiment_boost: 0.1,
            max_confidence: 0.95,
            custom_rules: Vec::new(),
        }
    }
}

/// Declarative extraction rule.
///
/// `pattern` must contain at least one capture group. Without a `template`
/// the candidate content is capture group 1; with one, `${N}` (or `$N`)
/// references are expanded from the cleaned capture groups.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionRule {
    pub name: String,
    pub pattern: String,
    pub memory_type: MemoryType,
    pub base_confidence: f64,
    #[serde(default)]
    pub template: Option<String>,
}

/// A candidate memory before it is written to the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractedMemory {
    pub content: String,
    pub confidence: f64,
    pub memory_type: MemoryType,
    /// Name of the rule that produced this candidate.
    pub pattern_used: String,
    pub entities: Vec<String>,
    pub metadata: BTreeMap<String, String>,
}

impl ExtractedMemory {
    /// Convert to a store-ready record.
    pub fn into_new_memory(self, provenance: &Provenance) -> NewMemory {
        let mut record = NewMemory::new(self.content, self.memory_type);
        record.confidence = Some(self.confidence);
        record.source_type = "extraction".to_string();
        record.entities = self.entities;
        record.metadata = self.metadata;
        record.with_provenance(provenance)
    }
}

#[derive(Clone)]
struct CompiledRule {
    name: String,
    regex: Regex,
    memory_type: MemoryType,
    base_confidence: f64,
    template: Option<String>,
}

impl CompiledRule {
    fn compile(rule: &ExtractionRule) -> Result<Self, Error> {
        let regex =
            Regex::new(&rule.pattern).map_err(|e| Error::extraction(&rule.name, e.to_string()))?;
        if regex.captures_len() < 2 {
            return Err(Error::extraction(&rule.name, "pattern has no capture group"));
        }
        Ok(Self {
            name: rule.name.clone(),
            regex,
            memory_type: rule.memory_type,
            base_confidence: rule.base_confidence.clamp(0.0, 1.0),
            template: rule.template.clone(),
        })
    }
}

// ── Built-in rules ─────────────────────────────────────────────────────

const NAME: &str = r"\p{Lu}[\p{L}'-]*(?:\s+\p{Lu}[\p{L}'-]*)*";
// Inner dots only ("Node.js"), so a sentence-ending period closes the name
const ORG: &str = r"\p{Lu}[\w&'-]*(?:\.[\w&-]+)*(?:\s+\p{Lu}[\w&'-]*(?:\.[\w&-]+)*)*";
const CLAUSE: &str = r"[^.!?\n]+";
const PHRASE: &str = r"[^.!?\n,;]+";

fn builtin_rule(
    name: &str,
    pattern: String,
    memory_type: MemoryType,
    base_confidence: f64,
    template: Option<&str>,
) -> ExtractionRule {
    ExtractionRule {
        name: name.to_string(),
        pattern,
        memory_type,
        base_confidence,
        template: template.map(String::from),
    }
}

/// The built-in rule table, in evaluation order.
pub fn builtin_rules() -> Vec<ExtractionRule> {
    use MemoryType::*;

    vec![
        // Semantic facts about the user
        builtin_rule("name", format!(r"(?i:\bmy\s+name\s+is)\s+({NAME})"), Semantic, 0.9, Some("User's name is ${1}")),
        builtin_rule("nickname", format!(r"(?i:\bcall\s+me)\s+({NAME})"), Semantic, 0.8, Some("User goes by ${1}")),
        builtin_rule("employer", format!(r"(?i:\bI\s+(?:work|am\s+working)\s+(?:at|for))\s+({ORG})"), Semantic, 0.85, Some("User works at ${1}")),
        builtin_rule("role", r"(?i)\bI(?:'m|\s+am)\s+an?\s+([\w\s-]{3,40}?)(?:\s+(?:at|for|in|with)\b|[.,;!?]|$)".to_string(), Semantic, 0.75, Some("User is a ${1}")),
        builtin_rule("location", format!(r"(?i:\bI\s+live\s+in)\s+({NAME}(?:,\s*{NAME})?)"), Semantic, 0.8, Some("User lives in ${1}")),
        builtin_rule("remember_that", format!(r"(?i)\bremember\s+that\s+({CLAUSE})"), Semantic, 0.85, None),
        // Preferences
        builtin_rule("likes", format!(r"(?i)\bI\s+(?:really\s+)?(?:like|love|enjoy|prefer)\s+({PHRASE})"), Preference, 0.75, Some("User likes ${1}")),
        builtin_rule("dislikes", format!(r"(?i)\bI\s+(?:really\s+)?(?:dislike|hate|don't\s+like|do\s+not\s+like|can't\s+stand)\s+({PHRASE})"), Preference, 0.75, Some("User dislikes ${1}")),
        builtin_rule("favourite", format!(r"(?i)\bmy\s+favou?rite\s+([\w\s-]+?)\s+is\s+({PHRASE})"), Preference, 0.8, Some("User's favourite ${1} is ${2}")),
        // Procedures and standing instructions
        builtin_rule("always_never", format!(r"(?i)\b(always|never)\s+({CLAUSE})"), Procedural, 0.7, Some("${1} ${2}")),
        builtin_rule("make_sure", format!(r"(?i)\b(?:make\s+sure\s+to|remember\s+to|don't\s+forget\s+to)\s+({CLAUSE})"), Procedural, 0.7, Some("make sure to ${1}")),
        builtin_rule("how_to", format!(r"(?i)\bto\s+({PHRASE}),\s*you\s+(?:need|have)\s+to\s+({CLAUSE})"), Procedural, 0.75, Some("to ${1}, ${2}")),
        // Events
        builtin_rule("event", format!(r"(?i)\b(yesterday|today|last\s+(?:week|month|night))\s*,?\s+I\s+({CLAUSE})"), Episodic, 0.6, Some("${1} I ${2}")),
        // Short-lived task context
        builtin_rule("current_work", format!(r"(?i)\bI(?:'m|\s+am)\s+(?:currently\s+)?working\s+on\s+({CLAUSE})"), Working, 0.65, Some("Currently working on ${1}")),
    ]
}

static BUILTIN_RULES: LazyLock<Vec<CompiledRule>> = LazyLock::new(|| {
    builtin_rules()
        .iter()
        .filter_map(|rule| match CompiledRule::compile(rule) {
            Ok(compiled) => Some(compiled),
            Err(e) => {
                tracing::warn!(error = %e, "Failed to compile built-in extraction rule");
                None
            }
        })
        .collect()
});

// ── Lexicons ───────────────────────────────────────────────────────────

const POSITIVE_WORDS: &[&str] = &[
    "love", "like", "enjoy", "great", "awesome", "amazing", "excellent", "favourite",
    "favorite", "best", "happy", "prefer", "fantastic", "wonderful",
];

const NEGATIVE_WORDS: &[&str] = &[
    "hate", "dislike", "terrible", "awful", "worst", "annoying", "bad", "horrible", "stand",
    "frustrating", "painful",
];

/// Capitalised words that never start an entity on their own.
const STOP_CAPITALS: &[&str] = &[
    "I", "I'm", "I've", "I'd", "I'll", "A", "An", "The", "My", "We", "You", "He", "She", "It",
    "They", "This", "That", "These", "Those", "User", "User's", "Today", "Yesterday",
    "Currently", "Always", "Never",
];

static ENTITY_PATTERN: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"\b\p{Lu}[\p{L}\p{N}&'-]*(?:\s+\p{Lu}[\p{L}\p{N}&'-]*)*").ok()
});

/// Capitalised phrases in `text`, leading stop capitals removed, deduplicated.
pub fn detect_entities(text: &str) -> Vec<String> {
    let Some(pattern) = ENTITY_PATTERN.as_ref() else {
        return Vec::new();
    };

    let mut entities: Vec<String> = Vec::new();
    for found in pattern.find_iter(text) {
        let words: Vec<&str> = found
            .as_str()
            .split_whitespace()
            .skip_while(|w| STOP_CAPITALS.contains(w))
            .collect();
        if words.is_empty() {
            continue;
        }
        let phrase = words.join(" ");
        let phrase = phrase.trim_end_matches(['.', '\'', '-', '&']);
        if !phrase.is_empty() && !entities.iter().any(|e| e.eq_ignore_ascii_case(phrase)) {
            entities.push(phrase.to_string());
        }
    }
    entities
}

/// Lexicon polarity of `text` in [-1, 1]; 0 when no sentiment words occur.
pub fn sentiment_signal(text: &str) -> f64 {
    let mut positive = 0usize;
    let mut negative = 0usize;
    for word in text
        .split(|c: char| !c.is_alphanumeric() && c != '\'')
        .filter(|w| !w.is_empty())
    {
        let word = word.to_lowercase();
        if POSITIVE_WORDS.contains(&word.as_str()) {
            positive += 1;
        } else if NEGATIVE_WORDS.contains(&word.as_str()) {
            negative += 1;
        }
    }
    // Negations flip polarity ("don't like")
    let lowered = text.to_lowercase();
    if lowered.contains("don't") || lowered.contains("do not") || lowered.contains("can't") {
        std::mem::swap(&mut positive, &mut negative);
    }

    let total = positive + negative;
    if total == 0 {
        return 0.0;
    }
    (positive as f64 - negative as f64) / total as f64
}

/// Sentence of `text` containing the byte range `start..end`.
fn enclosing_sentence(text: &str, start: usize, end: usize) -> &str {
    let is_boundary = |c: char| matches!(c, '.' | '!' | '?' | '\n');
    let from = text[..start].rfind(is_boundary).map(|i| i + 1).unwrap_or(0);
    let to = text[end..].find(is_boundary).map(|i| end + i).unwrap_or(text.len());
    &text[from..to]
}

/// Cut a capitalised phrase at the first trailing stop capital
/// ("Google I" becomes "Google"). Other text is returned unchanged.
fn trim_proper_phrase(phrase: &str) -> String {
    let words: Vec<&str> = phrase.split_whitespace().collect();
    let all_capitalised = words
        .iter()
        .all(|w| w.chars().next().is_some_and(char::is_uppercase));
    if words.len() < 2 || !all_capitalised {
        return phrase.to_string();
    }
    let keep = 1 + words[1..]
        .iter()
        .take_while(|w| !STOP_CAPITALS.contains(*w))
        .count();
    words[..keep].join(" ")
}

/// Expand `${N}` and `$N` from `groups` (group 1 at index 0). `$$` is a literal `$`.
fn expand_template(template: &str, groups: &[String]) -> String {
    fn group<'a>(groups: &'a [String], digits: &str) -> &'a str {
        digits
            .parse::<usize>()
            .ok()
            .and_then(|n| n.checked_sub(1))
            .and_then(|i| groups.get(i))
            .map(String::as_str)
            .unwrap_or("")
    }

    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(at) = rest.find('$') {
        out.push_str(&rest[..at]);
        let after = &rest[at + 1..];
        if let Some(tail) = after.strip_prefix('$') {
            out.push('$');
            rest = tail;
        } else if let Some((digits, tail)) = after
            .strip_prefix('{')
            .and_then(|braced| braced.split_once('}'))
            .filter(|(digits, _)| !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()))
        {
            out.push_str(group(groups, digits));
            rest = tail;
        } else {
            let len = after.bytes().take_while(u8::is_ascii_digit).count();
            if len == 0 {
                out.push('$');
            } else {
                out.push_str(group(groups, &after[..len]));
            }
            rest = &after[len..];
        }
    }
    out.push_str(rest);
    out
}

fn clean_candidate(raw: &str) -> String {
    raw.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .trim_end_matches(|c: char| matches!(c, '.' | ',' | ';' | ':' | '!' | '?'))
        .trim()
        .to_string()
}

// ── Extractor ──────────────────────────────────────────────────────────

/// Stateless rule-table extractor.
#[derive(Clone)]
pub struct Extractor {
    rules: Vec<CompiledRule>,
    config: ExtractionConfig,
    skipped: Vec<String>,
}

impl Default for Extractor {
    fn default() -> Self {
        Self::new(ExtractionConfig::default())
    }
}

impl Extractor {
    /// Compile the rule table. Malformed custom rules are skipped and logged.
    pub fn new(config: ExtractionConfig) -> Self {
        let mut rules = BUILTIN_RULES.clone();
        let mut skipped = Vec::new();

        for rule in &config.custom_rules {
            match CompiledRule::compile(rule) {
                Ok(compiled) => rules.push(compiled),
                Err(e) => {
                    tracing::warn!(rule = %rule.name, error = %e, "Skipping custom extraction rule");
                    skipped.push(e.to_string());
                }
            }
        }

        Self {
            rules,
            config,
            skipped,
        }
    }

    /// Rule names in evaluation order.
    pub fn rule_names(&self) -> Vec<&str> {
        self.rules.iter().map(|r| r.name.as_str()).collect()
    }

    /// Messages for custom rules that failed to compile.
    pub fn skipped_rules(&self) -> &[String] {
        &self.skipped
    }

    /// Extract candidate memories from text.
    ///
    /// Output is ordered by first appearance in the text; identical normalized
    /// candidates collapse into one carrying the highest confidence.
    pub fn extract(&self, text: &str) -> Vec<ExtractedMemory> {
        if text.trim().is_empty() {
            return Vec::new();
        }

        let mut found: Vec<(usize, usize, ExtractedMemory)> = Vec::new();
        for (rule_index, rule) in self.rules.iter().enumerate() {
            for caps in rule.regex.captures_iter(text) {
                let Some(whole) = caps.get(0) else {
                    continue;
                };
                let groups: Vec<String> = caps
                    .iter()
                    .skip(1)
                    .map(|m| {
                        m.map(|m| trim_proper_phrase(&clean_candidate(m.as_str())))
                            .unwrap_or_default()
                    })
                    .collect();

                let captured = groups.first().cloned().unwrap_or_default();
                if self.is_stopword(&captured) {
                    continue;
                }

                let content = match &rule.template {
                    Some(template) => clean_candidate(&expand_template(template, &groups)),
                    None => captured,
                };
                if content.chars().count() < self.config.min_content_length {
                    continue;
                }

                let mut metadata = BTreeMap::new();
                metadata.insert("rule".to_string(), rule.name.clone());

                let mut confidence = rule.base_confidence;
                if self.config.use_sentiment {
                    let signal =
                        sentiment_signal(enclosing_sentence(text, whole.start(), whole.end()));
                    if signal.abs() >= 0.5 {
                        confidence = (confidence + self.config.sentiment_boost)
                            .min(self.config.max_confidence)
                            .max(rule.base_confidence);
                        let label = if signal > 0.0 { "positive" } else { "negative" };
                        metadata.insert("sentiment".to_string(), label.to_string());
                    }
                }

                let entities = groups
                    .iter()
                    .flat_map(|group| detect_entities(group))
                    .fold(Vec::<String>::new(), |mut acc, e| {
                        if !acc.iter().any(|x| x.eq_ignore_ascii_case(&e)) {
                            acc.push(e);
                        }
                        acc
                    });

                found.push((
                    whole.start(),
                    rule_index,
                    ExtractedMemory {
                        content,
                        confidence,
                        memory_type: rule.memory_type,
                        pattern_used: rule.name.clone(),
                        entities,
                        metadata,
                    },
                ));
            }
        }

        found.sort_by_key(|(start, rule_index, _)| (*start, *rule_index));

        // Collapse identical normalized candidates, keeping the best confidence
        let mut slots: HashMap<String, usize> = HashMap::new();
        let mut candidates: Vec<ExtractedMemory> = Vec::new();
        for (_, _, candidate) in found {
            let hash = content_hash(&candidate.content);
            match slots.get(&hash) {
                Some(&slot) => {
                    if candidate.confidence > candidates[slot].confidence {
                        candidates[slot] = candidate;
                    }
                }
                None => {
                    slots.insert(hash, candidates.len());
                    candidates.push(candidate);
                }
            }
        }

        tracing::debug!(candidates = candidates.len(), "Extracted memory candidates");
        candidates
    }

    fn is_stopword(&self, captured: &str) -> bool {
        let normalized = normalize(captured);
        normalized.is_empty() || self.config.stoplist.iter().any(|s| normalize(s) == normalized)
    }
}
