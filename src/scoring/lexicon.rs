//! Deterministic lexicon-based scorer used as the local fallback.
//!
//! Sentiment is the sum of word polarities (a negator directly before a
//! polar word flips it), normalized into [-1, 1] with `x / sqrt(x² + 15)`.
//! The category is the keyword family with the most hits, and keywords are
//! the most frequent non-stopword tokens.

use std::collections::HashMap;
use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;

use super::LocalScorer;
use crate::error::ScorerError;
use crate::types::{OperationType, Record, ScoreResult, ScoreSource};

static TOKEN_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[a-z0-9]+(?:'[a-z]+)?").expect("Invalid token regex"));

const NORMALIZATION_ALPHA: f64 = 15.0;
const DEFAULT_MAX_KEYWORDS: usize = 5;

const POSITIVE: &[&str] = &[
    "good", "great", "excellent", "amazing", "awesome", "love", "loved", "like", "liked",
    "helpful", "fast", "easy", "friendly", "perfect", "happy", "satisfied", "recommend",
    "nice", "fantastic", "wonderful", "smooth", "reliable", "quick", "best", "intuitive",
    "pleasant", "clean", "thanks", "thank", "impressed", "affordable", "works",
];

const NEGATIVE: &[&str] = &[
    "bad", "terrible", "awful", "horrible", "hate", "hated", "slow", "broken", "bug", "bugs",
    "crash", "crashes", "crashing", "difficult", "confusing", "rude", "expensive", "worst",
    "poor", "disappointed", "disappointing", "useless", "annoying", "late", "missing",
    "refund", "problem", "problems", "issue", "issues", "error", "errors", "unhappy", "fail",
    "failed", "fails", "overpriced", "frustrating",
];

const NEGATORS: &[&str] = &[
    "not", "no", "never", "don't", "doesn't", "didn't", "isn't", "wasn't", "aren't", "can't",
    "won't", "hardly",
];

const STOPWORDS: &[&str] = &[
    "the", "and", "for", "are", "but", "not", "you", "all", "any", "can", "had", "her", "was",
    "one", "our", "out", "has", "have", "him", "his", "how", "its", "may", "new", "now", "see",
    "two", "who", "did", "get", "got", "she", "too", "use", "that", "this", "with", "they",
    "them", "then", "than", "there", "their", "what", "when", "were", "will", "would", "could",
    "should", "from", "been", "very", "just", "also", "into", "your", "about", "really",
    "it's", "i'm", "don't", "didn't", "doesn't", "isn't", "wasn't",
];

const CATEGORY_FAMILIES: &[(&str, &[&str])] = &[
    (
        "pricing",
        &["price", "prices", "pricing", "cost", "costs", "expensive", "cheap", "affordable",
          "overpriced", "refund", "billing", "charge", "charged", "subscription", "plan"],
    ),
    (
        "support",
        &["support", "help", "helpful", "agent", "staff", "service", "response", "rude",
          "friendly", "ticket", "contact", "answer", "answered"],
    ),
    (
        "delivery",
        &["delivery", "shipping", "shipped", "arrived", "late", "package", "courier", "order",
          "tracking", "delayed"],
    ),
    (
        "usability",
        &["easy", "difficult", "confusing", "intuitive", "interface", "ui", "navigate",
          "navigation", "design", "layout", "setup"],
    ),
    (
        "product",
        &["product", "quality", "feature", "features", "app", "bug", "bugs", "crash",
          "crashes", "crashing", "broken", "works", "update", "version", "performance"],
    ),
];

/// In-process scorer that needs no network access.
#[derive(Debug, Clone)]
pub struct LexiconScorer {
    max_keywords: usize,
}

impl Default for LexiconScorer {
    fn default() -> Self {
        Self {
            max_keywords: DEFAULT_MAX_KEYWORDS,
        }
    }
}

impl LexiconScorer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets how many keywords to extract per record.
    pub fn with_max_keywords(mut self, max_keywords: usize) -> Self {
        self.max_keywords = max_keywords;
        self
    }

    /// Scores a single record.
    pub fn score_record(&self, record: &Record) -> ScoreResult {
        let lowered = record.text.to_lowercase();
        let tokens: Vec<&str> = TOKEN_PATTERN
            .find_iter(&lowered)
            .map(|m| m.as_str())
            .collect();

        let score = sentiment_score(&tokens);
        let category = categorize(&tokens);
        let keywords = extract_keywords(&tokens, self.max_keywords);

        ScoreResult::new(record.id.clone(), score, category)
            .with_keywords(keywords)
            .with_source(ScoreSource::Local)
    }
}

fn sentiment_score(tokens: &[&str]) -> f64 {
    let mut raw = 0.0;
    for (i, token) in tokens.iter().enumerate() {
        let polarity = if POSITIVE.contains(token) {
            1.0
        } else if NEGATIVE.contains(token) {
            -1.0
        } else {
            continue;
        };
        let negated = i > 0 && NEGATORS.contains(&tokens[i - 1]);
        raw += if negated { -polarity } else { polarity };
    }

    if raw == 0.0 {
        0.0
    } else {
        raw / (raw * raw + NORMALIZATION_ALPHA).sqrt()
    }
}

fn categorize(tokens: &[&str]) -> &'static str {
    let mut best = ("general", 0usize);
    for (name, words) in CATEGORY_FAMILIES {
        let hits = tokens.iter().filter(|t| words.contains(t)).count();
        if hits > best.1 {
            best = (name, hits);
        }
    }
    best.0
}

fn extract_keywords(tokens: &[&str], limit: usize) -> Vec<String> {
    // (count, first position) per candidate
    let mut counts: HashMap<&str, (usize, usize)> = HashMap::new();
    for (position, token) in tokens.iter().enumerate() {
        if token.len() < 3 || STOPWORDS.contains(token) || NEGATORS.contains(token) {
            continue;
        }
        if token.chars().all(|c| c.is_ascii_digit()) {
            continue;
        }
        counts.entry(token).or_insert((0, position)).0 += 1;
    }

    let mut ranked: Vec<(&str, (usize, usize))> = counts.into_iter().collect();
    ranked.sort_by(|a, b| b.1 .0.cmp(&a.1 .0).then(a.1 .1.cmp(&b.1 .1)));
    ranked
        .into_iter()
        .take(limit)
        .map(|(token, _)| token.to_string())
        .collect()
}

#[async_trait]
impl LocalScorer for LexiconScorer {
    async fn score(
        &self,
        _operation: OperationType,
        records: &[Record],
    ) -> Result<Vec<ScoreResult>, ScorerError> {
        Ok(records.iter().map(|r| self.score_record(r)).collect())
    }
}
