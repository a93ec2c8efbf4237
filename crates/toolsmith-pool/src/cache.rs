// Result cache: size-bounded LRU with TTL, keyed by a canonical
// fingerprint of `(tool, params)`. Only successful results are cached.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::debug;

use toolsmith_core::canonical_json;

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub enabled: bool,
    /// Capacity as the sum of estimated serialized result sizes
    pub max_bytes: usize,
    pub ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_bytes: 4 * 1024 * 1024,
            ttl: Duration::from_secs(600),
        }
    }
}

struct CacheEntry {
    value: Value,
    size_bytes: usize,
    inserted_at: Instant,
    last_accessed: Instant,
}

pub(crate) struct ResultCache {
    config: CacheConfig,
    entries: HashMap<String, CacheEntry>,
    total_bytes: usize,
}

impl ResultCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            entries: HashMap::new(),
            total_bytes: 0,
        }
    }

    /// Cache key: SHA-256 over the tool name and the canonical (key-sorted)
    /// encoding of the params, so key order in the caller's map is
    /// irrelevant.
    pub fn fingerprint(tool: &str, params: &Value) -> String {
        let mut hasher = Sha256::new();
        hasher.update(tool.as_bytes());
        hasher.update([0u8]);
        hasher.update(canonical_json(params).as_bytes());
        hasher
            .finalize()
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect()
    }

    pub fn get(&mut self, key: &str) -> Option<Value> {
        if !self.config.enabled {
            return None;
        }
        let expired = match self.entries.get(key) {
            Some(entry) => entry.inserted_at.elapsed() > self.config.ttl,
            None => return None,
        };
        if expired {
            self.remove(key);
            return None;
        }
        let entry = self.entries.get_mut(key)?;
        entry.last_accessed = Instant::now();
        Some(entry.value.clone())
    }

    pub fn put(&mut self, key: String, value: &Value) {
        if !self.config.enabled {
            return;
        }
        let size_bytes = canonical_json(value).len();
        if size_bytes > self.config.max_bytes {
            debug!(size_bytes, "result larger than the whole cache, skipping");
            return;
        }
        self.remove(&key);
        let now = Instant::now();
        self.entries.insert(
            key,
            CacheEntry {
                value: value.clone(),
                size_bytes,
                inserted_at: now,
                last_accessed: now,
            },
        );
        self.total_bytes += size_bytes;
        while self.total_bytes > self.config.max_bytes {
            self.evict_lru();
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    fn remove(&mut self, key: &str) {
        if let Some(entry) = self.entries.remove(key) {
            self.total_bytes -= entry.size_bytes;
        }
    }

    fn evict_lru(&mut self) {
        let oldest = self
            .entries
            .iter()
            .min_by_key(|(_, entry)| entry.last_accessed)
            .map(|(key, _)| key.clone());
        match oldest {
            Some(key) => {
                debug!(key = %key, "evicting least-recently-used cache entry");
                self.remove(&key);
            }
            None => self.total_bytes = 0,
        }
    }
}
