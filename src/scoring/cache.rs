//! Content-addressed memo of scoring results.
//!
//! Identical feedback text shows up often (form defaults, copy-pasted
//! complaints), so results are keyed by a SHA-256 of the operation and the
//! payload rather than by record id. Only payloads up to `max_payload_chars` are cached, and the
//! cache holds at most `max_entries` results, evicting the oldest insertion
//! first.
//!
//! A miss is never an error: the caller simply scores the record again.

use std::collections::{HashMap, VecDeque};
use std::fmt;

use parking_lot::Mutex;
use sha2::{Digest, Sha256};

use crate::types::{OperationType, Record, ScoreResult, ScoreSource};

/// Hex-encoded SHA-256 of a record payload.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContentHash(String);

impl ContentHash {
    /// Hashes `content`.
    pub fn from_content(content: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(content.as_bytes());
        Self(hex::encode(hasher.finalize()))
    }

    /// Hashes a payload scored under `operation`. The same text scored by
    /// different operations never shares a key.
    pub fn for_record(operation: OperationType, text: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(operation.as_str().as_bytes());
        hasher.update([0u8]);
        hasher.update(text.as_bytes());
        Self(hex::encode(hasher.finalize()))
    }

    /// Get the hash string representation.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Configuration for the score cache.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Maximum number of entries held at once.
    pub max_entries: usize,
    /// Payloads longer than this (in characters) are never cached.
    pub max_payload_chars: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 10_000,
            max_payload_chars: 5000,
        }
    }
}

impl CacheConfig {
    /// Creates a configuration with the given capacity.
    pub fn new(max_entries: usize) -> Self {
        Self {
            max_entries,
            ..Default::default()
        }
    }

    /// Sets the maximum cacheable payload length.
    pub fn with_max_payload_chars(mut self, chars: usize) -> Self {
        self.max_payload_chars = chars;
        self
    }
}

/// Cache statistics for monitoring and debugging.
#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries_added: u64,
    pub entries_evicted: u64,
    /// Puts skipped because the payload was too long.
    pub rejected_oversize: u64,
}

impl CacheStats {
    /// Hit rate in [0, 1], or 0 when nothing has been looked up.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[derive(Default)]
struct CacheInner {
    entries: HashMap<ContentHash, ScoreResult>,
    /// Insertion order, oldest at the front.
    order: VecDeque<ContentHash>,
    stats: CacheStats,
}

/// Bounded, insertion-ordered score cache shared by all workers.
pub struct ScoreCache {
    inner: Mutex<CacheInner>,
    config: CacheConfig,
}

impl ScoreCache {
    /// Creates a cache with default payload limits and the given capacity.
    pub fn new(max_entries: usize) -> Self {
        Self::with_config(CacheConfig::new(max_entries))
    }

    /// Creates a cache with a custom configuration.
    pub fn with_config(config: CacheConfig) -> Self {
        Self {
            inner: Mutex::new(CacheInner::default()),
            config,
        }
    }

    /// Returns the cache configuration.
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Whether a payload of `payload_chars` characters may be cached.
    pub fn is_cacheable(&self, payload_chars: usize) -> bool {
        payload_chars <= self.config.max_payload_chars
    }

    /// Looks up a stored result by hash.
    pub fn get(&self, hash: &ContentHash) -> Option<ScoreResult> {
        let mut inner = self.inner.lock();
        match inner.entries.get(hash).cloned() {
            Some(result) => {
                inner.stats.hits += 1;
                Some(result)
            }
            None => {
                inner.stats.misses += 1;
                None
            }
        }
    }

    /// Stores `result` under `hash`.
    ///
    /// Does nothing when `payload_chars` exceeds the cacheable maximum or the
    /// cache has zero capacity. Returns whether the result was stored.
    pub fn put(&self, hash: ContentHash, payload_chars: usize, result: ScoreResult) -> bool {
        let mut inner = self.inner.lock();

        if !self.is_cacheable(payload_chars) {
            inner.stats.rejected_oversize += 1;
            return false;
        }
        if self.config.max_entries == 0 {
            return false;
        }

        if let Some(existing) = inner.entries.get_mut(&hash) {
            *existing = result;
            return true;
        }

        while inner.order.len() >= self.config.max_entries {
            if let Some(oldest) = inner.order.pop_front() {
                inner.entries.remove(&oldest);
                inner.stats.entries_evicted += 1;
            }
        }

        inner.order.push_back(hash.clone());
        inner.entries.insert(hash, result);
        inner.stats.entries_added += 1;
        true
    }

    /// Looks up the result cached for a record's payload under `operation`,
    /// re-keyed to the record's id and attributed to the cache.
    pub fn lookup(&self, operation: OperationType, record: &Record) -> Option<ScoreResult> {
        if !self.is_cacheable(record.char_len()) {
            return None;
        }
        let hash = ContentHash::for_record(operation, &record.text);
        self.get(&hash).map(|mut result| {
            result.record_id = record.id.clone();
            result.source = ScoreSource::Cache;
            result
        })
    }

    /// Caches a freshly scored result for a record's payload under `operation`.
    pub fn store(&self, operation: OperationType, record: &Record, result: &ScoreResult) -> bool {
        let chars = record.char_len();
        if !self.is_cacheable(chars) {
            // skip hashing a payload that can never be stored
            self.inner.lock().stats.rejected_oversize += 1;
            return false;
        }
        self.put(
            ContentHash::for_record(operation, &record.text),
            chars,
            result.clone(),
        )
    }

    /// Releases spare capacity held by the backing collections.
    pub fn shrink_to_fit(&self) {
        let mut inner = self.inner.lock();
        inner.entries.shrink_to_fit();
        inner.order.shrink_to_fit();
    }

    /// Get current cache statistics.
    pub fn stats(&self) -> CacheStats {
        self.inner.lock().stats.clone()
    }

    /// Number of cached entries.
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// Check if cache is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove all entries. Statistics are preserved.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.order.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(id: &str, score: f64) -> ScoreResult {
        ScoreResult::new(id, score, "general")
    }

    #[test]
    fn test_content_hash_deterministic() {
        let hash1 = ContentHash::from_content("great service");
        let hash2 = ContentHash::from_content("great service");
        let hash3 = ContentHash::from_content("terrible service");

        assert_eq!(hash1, hash2);
        assert_ne!(hash1, hash3);
        assert_eq!(hash1.as_str().len(), 64);
        assert_eq!(format!("{}", hash1), hash1.as_str());
    }

    #[test]
    fn test_put_then_get() {
        let cache = ScoreCache::new(10);
        let hash = ContentHash::from_content("fast delivery");

        assert!(cache.put(hash.clone(), 13, result("r1", 0.8)));
        let stored = cache.get(&hash).expect("should be cached");
        assert_eq!(stored.record_id, "r1");
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_oversize_put_is_noop() {
        let cache = ScoreCache::with_config(CacheConfig::new(10).with_max_payload_chars(5000));
        let hash = ContentHash::from_content("long");

        assert!(!cache.put(hash.clone(), 5001, result("r1", 0.1)));
        assert!(cache.get(&hash).is_none());
        assert!(cache.is_empty());
        assert_eq!(cache.stats().rejected_oversize, 1);

        // exactly at the limit is still cacheable
        assert!(cache.put(hash.clone(), 5000, result("r1", 0.1)));
        assert!(cache.get(&hash).is_some());
    }

    #[test]
    fn test_evicts_oldest_insertion() {
        let cache = ScoreCache::new(2);
        let a = ContentHash::from_content("a");
        let b = ContentHash::from_content("b");
        let c = ContentHash::from_content("c");

        cache.put(a.clone(), 1, result("a", 0.0));
        cache.put(b.clone(), 1, result("b", 0.0));
        // reading does not refresh insertion order
        assert!(cache.get(&a).is_some());
        cache.put(c.clone(), 1, result("c", 0.0));

        assert!(cache.get(&a).is_none());
        assert!(cache.get(&b).is_some());
        assert!(cache.get(&c).is_some());
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.stats().entries_evicted, 1);
    }

    #[test]
    fn test_reput_updates_without_growing() {
        let cache = ScoreCache::new(2);
        let a = ContentHash::from_content("a");

        cache.put(a.clone(), 1, result("a", 0.1));
        cache.put(a.clone(), 1, result("a", -0.9));

        assert_eq!(cache.len(), 1);
        let stored = cache.get(&a).expect("cached");
        assert!((stored.score + 0.9).abs() < f64::EPSILON);
    }

    #[test]
    fn test_lookup_rekeys_record() {
        let cache = ScoreCache::new(10);
        let first = Record::new("first", "the app keeps crashing");
        let second = Record::new("second", "the app keeps crashing");

        assert!(cache.store(OperationType::Sentiment, &first, &result("first", -0.7)));
        let hit = cache
            .lookup(OperationType::Sentiment, &second)
            .expect("same payload should hit");

        assert_eq!(hit.record_id, "second");
        assert_eq!(hit.source, ScoreSource::Cache);
    }

    #[test]
    fn test_lookup_is_scoped_to_operation() {
        let cache = ScoreCache::new(10);
        let record = Record::new("r1", "delivery was late again");

        assert!(cache.store(OperationType::Sentiment, &record, &result("r1", -0.6)));

        assert!(cache.lookup(OperationType::Summarization, &record).is_none());
        assert!(cache.lookup(OperationType::Categorization, &record).is_none());
        assert!(cache.lookup(OperationType::Sentiment, &record).is_some());
        assert_ne!(
            ContentHash::for_record(OperationType::Sentiment, "x"),
            ContentHash::for_record(OperationType::Summarization, "x")
        );
    }

    #[test]
    fn test_store_skips_long_payload() {
        let cache = ScoreCache::with_config(CacheConfig::new(10).with_max_payload_chars(4));
        let record = Record::new("r1", "too long");

        assert!(!cache.store(OperationType::Sentiment, &record, &result("r1", 0.5)));
        assert!(cache.lookup(OperationType::Sentiment, &record).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_zero_capacity_never_stores() {
        let cache = ScoreCache::new(0);
        assert!(!cache.put(ContentHash::from_content("x"), 1, result("x", 0.0)));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_stats_and_clear() {
        let cache = ScoreCache::new(4);
        let a = ContentHash::from_content("a");
        cache.put(a.clone(), 1, result("a", 0.0));
        cache.get(&a);
        cache.get(&ContentHash::from_content("missing"));

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert!((stats.hit_rate() - 0.5).abs() < f64::EPSILON);

        cache.shrink_to_fit();
        cache.clear();
        assert!(cache.is_empty());
        assert_eq!(cache.stats().entries_added, 1);
    }
}
