//! # Validation Cache Module
//!
//! Wraps any [`Validator`] with a bounded memoization layer. Results are
//! keyed by a content fingerprint so repeated validation of equivalent
//! events is a hash lookup instead of a rule walk.
//!
//! ## Fingerprint
//!
//! The fingerprint covers every property the wrapped checks can depend on:
//! event type, payload bytes, id emptiness, and timestamp zeroness, plus
//! the validation lane (undirected, incoming, or outgoing — the
//! per-direction bypass flags can make the same event validate differently
//! per direction, so each lane is its own cache namespace). Two events
//! with equal fingerprints therefore validate identically, which is what
//! makes the cache sound: it can never convert a would-be failure into a
//! success, because any property that could change the outcome changes
//! the key.
//!
//! ## Eviction
//!
//! Bounded LRU: a hit refreshes the entry's recency; inserting into a full
//! cache evicts the least recently used entry. Hit/miss/eviction counters
//! are relaxed atomics readable without the cache lock.

use crate::event::Event;
use crate::validation::{ValidationResult, Validator};
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, VecDeque};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Counters describing cache effectiveness
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheStats {
    /// Lookups answered from the cache
    pub hits: u64,
    /// Lookups that fell through to the wrapped validator
    pub misses: u64,
    /// Entries evicted to make room
    pub evictions: u64,
    /// Current number of cached results
    pub entries: usize,
    /// Configured capacity
    pub capacity: usize,
}

/// Cache namespace for a validation entry point
///
/// Direction-specific outcomes differ from undirected ones whenever a
/// bypass flag is set, so each lane keys its own entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Lane {
    Undirected,
    Incoming,
    Outgoing,
}

struct CacheInner {
    results: HashMap<u64, ValidationResult>,
    // Recency order, least recently used at the front.
    order: VecDeque<u64>,
}

/// Memoizing wrapper around a validator
pub struct CachedValidator {
    inner: Arc<dyn Validator>,
    cache: Mutex<CacheInner>,
    capacity: usize,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl CachedValidator {
    /// Wrap a validator with a cache of the given capacity (minimum 1)
    pub fn new(inner: Arc<dyn Validator>, capacity: usize) -> Self {
        Self {
            inner,
            cache: Mutex::new(CacheInner {
                results: HashMap::new(),
                order: VecDeque::new(),
            }),
            capacity: capacity.max(1),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// Fingerprint the properties validation outcomes can depend on
    fn fingerprint(event: &Event, lane: Lane) -> u64 {
        let mut hasher = DefaultHasher::new();
        lane.hash(&mut hasher);
        event.event_type.hash(&mut hasher);
        event.payload.hash(&mut hasher);
        event.id.is_empty().hash(&mut hasher);
        (event.timestamp.timestamp_nanos_opt().unwrap_or(0) == 0).hash(&mut hasher);
        hasher.finish()
    }

    /// Current cache statistics
    pub fn stats(&self) -> CacheStats {
        let cache = self.cache.lock().expect("validation cache lock poisoned");
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            entries: cache.results.len(),
            capacity: self.capacity,
        }
    }

    /// Drop all cached results, keeping the counters
    pub fn clear(&self) {
        let mut cache = self.cache.lock().expect("validation cache lock poisoned");
        cache.results.clear();
        cache.order.clear();
    }

    fn lookup(&self, key: u64) -> Option<ValidationResult> {
        let mut cache = self.cache.lock().expect("validation cache lock poisoned");
        if let Some(result) = cache.results.get(&key).cloned() {
            // Refresh recency.
            if let Some(pos) = cache.order.iter().position(|k| *k == key) {
                cache.order.remove(pos);
            }
            cache.order.push_back(key);
            self.hits.fetch_add(1, Ordering::Relaxed);
            Some(result)
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            None
        }
    }

    fn store(&self, key: u64, result: ValidationResult) {
        let mut cache = self.cache.lock().expect("validation cache lock poisoned");
        if cache.results.contains_key(&key) {
            cache.results.insert(key, result);
            return;
        }
        if cache.results.len() >= self.capacity {
            if let Some(oldest) = cache.order.pop_front() {
                cache.results.remove(&oldest);
                self.evictions.fetch_add(1, Ordering::Relaxed);
            }
        }
        cache.results.insert(key, result);
        cache.order.push_back(key);
    }

    fn validate_cached<F>(&self, event: &Event, lane: Lane, run: F) -> ValidationResult
    where
        F: FnOnce(&Event) -> ValidationResult,
    {
        let key = Self::fingerprint(event, lane);
        if let Some(result) = self.lookup(key) {
            return result;
        }
        let result = run(event);
        self.store(key, result.clone());
        result
    }
}

impl Validator for CachedValidator {
    fn validate(&self, event: &Event) -> ValidationResult {
        self.validate_cached(event, Lane::Undirected, |e| self.inner.validate(e))
    }

    fn validate_incoming(&self, event: &Event) -> ValidationResult {
        self.validate_cached(event, Lane::Incoming, |e| self.inner.validate_incoming(e))
    }

    fn validate_outgoing(&self, event: &Event) -> ValidationResult {
        self.validate_cached(event, Lane::Outgoing, |e| self.inner.validate_outgoing(e))
    }

    fn name(&self) -> &str {
        "cached"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EVENT_TYPE_DATA;
    use crate::validation::{FastValidator, ValidationConfig};

    fn cached(capacity: usize) -> CachedValidator {
        CachedValidator::new(
            Arc::new(FastValidator::new(ValidationConfig::default())),
            capacity,
        )
    }

    /// Test hits and misses are counted
    #[test]
    fn test_hit_miss_counting() {
        let validator = cached(8);
        let event = Event::with_id("e", EVENT_TYPE_DATA, vec![1, 2, 3]);

        assert!(validator.validate(&event).valid);
        assert!(validator.validate(&event).valid);
        assert!(validator.validate(&event).valid);

        let stats = validator.stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.entries, 1);
    }

    /// Test the cache never converts a failure into a success
    #[test]
    fn test_cache_purity() {
        let validator = cached(8);

        // A valid event with a given type+payload populates the cache.
        let good = Event::with_id("e", EVENT_TYPE_DATA, vec![1, 2, 3]);
        assert!(validator.validate(&good).valid);

        // The same type+payload with an empty id must still fail: the
        // fingerprint covers id emptiness.
        let bad = Event::with_id("", EVENT_TYPE_DATA, vec![1, 2, 3]);
        assert!(!validator.validate(&bad).valid);

        // And repeat validations of the failing event stay failing.
        assert!(!validator.validate(&bad).valid);
    }

    /// Test equal events under equal config yield equal results
    #[test]
    fn test_result_stability() {
        let validator = cached(8);
        let event = Event::with_id("stable", EVENT_TYPE_DATA, vec![7; 16]);

        let first = validator.validate(&event);
        let second = validator.validate(&event);
        assert_eq!(first, second);
    }

    /// Test the directional entry points are memoized too
    #[test]
    fn test_directional_caching() {
        let validator = cached(8);
        let event = Event::with_id("e", EVENT_TYPE_DATA, vec![1, 2, 3]);

        // First pass per direction misses, second hits.
        assert!(validator.validate_incoming(&event).valid);
        assert!(validator.validate_incoming(&event).valid);
        assert!(validator.validate_outgoing(&event).valid);
        assert!(validator.validate_outgoing(&event).valid);

        let stats = validator.stats();
        assert_eq!(stats.misses, 2);
        assert_eq!(stats.hits, 2);
        assert!(stats.hits > 0);
    }

    /// Test direction lanes keep bypassed and checked outcomes apart
    #[test]
    fn test_direction_lanes_respect_bypass() {
        let config = ValidationConfig {
            skip_on_outgoing: true,
            ..Default::default()
        };
        let validator = CachedValidator::new(Arc::new(FastValidator::new(config)), 8);
        let bad = Event::with_id("", EVENT_TYPE_DATA, vec![9]);

        // The outgoing bypass passes the event; the incoming path still
        // rejects it. A shared key would let one outcome shadow the other.
        assert!(validator.validate_outgoing(&bad).valid);
        assert!(!validator.validate_incoming(&bad).valid);
        assert!(validator.validate_outgoing(&bad).valid);
        assert!(!validator.validate_incoming(&bad).valid);

        let stats = validator.stats();
        assert_eq!(stats.misses, 2);
        assert_eq!(stats.hits, 2);
    }

    /// Test LRU eviction under a tiny capacity
    #[test]
    fn test_lru_eviction() {
        let validator = cached(2);

        let a = Event::with_id("a", EVENT_TYPE_DATA, vec![1]);
        let b = Event::with_id("b", EVENT_TYPE_DATA, vec![2]);
        let c = Event::with_id("c", EVENT_TYPE_DATA, vec![3]);

        validator.validate(&a);
        validator.validate(&b);
        // Touch `a` so `b` becomes least recently used.
        validator.validate(&a);
        validator.validate(&c);

        let stats = validator.stats();
        assert_eq!(stats.evictions, 1);
        assert_eq!(stats.entries, 2);

        // `a` stayed cached; `b` was evicted.
        validator.validate(&a);
        assert_eq!(validator.stats().hits, 2);
        validator.validate(&b);
        assert_eq!(validator.stats().misses, 4);
    }
}
