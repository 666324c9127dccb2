//! TTL cache for provider responses.
//!
//! Keys are string digests of the operation name and its normalised
//! arguments; values are the serialized response. The map is sharded
//! (dashmap) so concurrent requests do not contend on a global lock.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use serde_json::Value;
use tokio::time::Instant;

struct Entry {
    value: Value,
    inserted_at: Instant,
}

/// Sharded TTL cache with a hard entry cap. Eviction removes expired
/// entries first, then the oldest live one.
pub struct TtlCache {
    entries: DashMap<String, Entry>,
    ttl: Duration,
    max_size: usize,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl TtlCache {
    pub fn new(ttl: Duration, max_size: usize) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
            max_size: max_size.max(1),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Build a cache key from the operation name and normalised argument
    /// parts.
    pub fn key(operation: &str, parts: &[&str]) -> String {
        let mut key = String::with_capacity(operation.len() + 16);
        key.push_str(operation);
        for part in parts {
            key.push(':');
            key.push_str(&part.to_uppercase());
        }
        key
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        let hit = self.entries.get(key).and_then(|entry| {
            if entry.inserted_at.elapsed() < self.ttl {
                Some(entry.value.clone())
            } else {
                None
            }
        });
        match hit {
            Some(value) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(value)
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                // Drop the stale entry if that is why we missed
                self.entries
                    .remove_if(key, |_, e| e.inserted_at.elapsed() >= self.ttl);
                None
            }
        }
    }

    pub fn insert(&self, key: String, value: Value) {
        if self.entries.len() >= self.max_size {
            self.evict_one();
        }
        self.entries.insert(
            key,
            Entry {
                value,
                inserted_at: Instant::now(),
            },
        );
    }

    fn evict_one(&self) {
        // Expired entries go first
        let mut victim: Option<(String, Instant)> = None;
        for entry in &self.entries {
            if entry.inserted_at.elapsed() >= self.ttl {
                victim = Some((entry.key().clone(), entry.inserted_at));
                break;
            }
            match &victim {
                Some((_, oldest)) if entry.inserted_at >= *oldest => {}
                _ => victim = Some((entry.key().clone(), entry.inserted_at)),
            }
        }
        if let Some((key, _)) = victim {
            self.entries.remove(&key);
        }
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
