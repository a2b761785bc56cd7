//! Bounded FIFO cache of prepared commands.
//!
//! The execution cache keeps the most recently added commands keyed by
//! their parameterized text so repeat executions can reuse the command
//! object and, once executed often enough, run it prepared.

use crate::constants::PREPARE_THRESHOLD;
use crate::database::backend::SqlCommand;
use crate::database::types::SqlValue;
use std::collections::{HashMap, VecDeque};
use std::hash::Hash;

/// An entry that knows its own cache key.
pub trait CacheItem<K> {
    fn key(&self) -> K;
}

/// Cache statistics.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CacheStats {
    /// Total number of cache hits.
    pub hits: u64,

    /// Total number of cache misses.
    pub misses: u64,

    /// Total number of entries in cache.
    pub entry_count: usize,

    /// Number of evictions.
    pub evictions: u64,
}

impl CacheStats {
    /// Calculate hit rate as a percentage.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            (self.hits as f64 / total as f64) * 100.0
        }
    }
}

/// Fixed-capacity cache that evicts the oldest insertion first.
#[derive(Debug)]
pub struct ExecutionCache<K, V> {
    capacity: usize,
    entries: HashMap<K, V>,
    order: VecDeque<K>,
    stats: CacheStats,
}

impl<K, V> ExecutionCache<K, V>
where
    K: Eq + Hash + Clone,
    V: CacheItem<K>,
{
    /// Create a cache holding at most `capacity` entries.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: HashMap::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
            stats: CacheStats::default(),
        }
    }

    /// Add an item, replacing an existing entry with the same key in place.
    pub fn add(&mut self, item: V) {
        let key = item.key();
        if let Some(existing) = self.entries.get_mut(&key) {
            *existing = item;
            return;
        }

        if self.entries.len() >= self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.entries.remove(&oldest);
                self.stats.evictions += 1;
            }
        }

        self.order.push_back(key.clone());
        self.entries.insert(key, item);
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    /// Look up an entry, recording a hit or a miss.
    pub fn get(&mut self, key: &K) -> Option<&V> {
        self.record(key);
        self.entries.get(key)
    }

    /// Look up an entry for update, recording a hit or a miss.
    pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        self.record(key);
        self.entries.get_mut(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Remove every entry. Statistics are kept.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }

    /// Get cache statistics.
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entry_count: self.entries.len(),
            ..self.stats.clone()
        }
    }

    fn record(&mut self, key: &K) {
        if self.entries.contains_key(key) {
            self.stats.hits += 1;
        } else {
            self.stats.misses += 1;
        }
    }
}

/// A cached command with its execution count and cached scalar result.
#[derive(Debug, Clone)]
pub struct SqlBatch {
    pub command: SqlCommand,
    pub execution_count: u32,
    result: Option<SqlValue>,
    prepared: bool,
}

impl SqlBatch {
    pub fn new(command: SqlCommand) -> Self {
        Self {
            command,
            execution_count: 1,
            result: None,
            prepared: false,
        }
    }

    /// Count another execution; the batch is marked prepared at the threshold.
    pub fn record_execution(&mut self) {
        self.execution_count += 1;
        if self.execution_count == PREPARE_THRESHOLD {
            self.prepared = true;
        }
    }

    pub fn is_prepared(&self) -> bool {
        self.prepared
    }

    pub fn has_result(&self) -> bool {
        self.result.is_some()
    }

    pub fn result(&self) -> Option<&SqlValue> {
        self.result.as_ref()
    }

    pub fn set_result(&mut self, value: SqlValue) {
        self.result = Some(value);
    }
}

impl CacheItem<String> for SqlBatch {
    fn key(&self) -> String {
        self.command.text.clone()
    }
}
