//! Idempotency cache keyed by dispatch fingerprint.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::trace;

use relay_types::DispatchOutput;

use crate::config::SecurityConfig;

#[derive(Debug, Clone)]
struct CacheEntry {
    output: DispatchOutput,
    expires_at: Instant,
}

/// Counters for cache effectiveness.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
}

/// TTL cache of successful dispatch outputs.
///
/// Only successes are stored, so a failed dispatch is always retried on the
/// next request with the same fingerprint. A hit returns the stored value
/// unchanged with `cache_hit` set, zero cost and zero latency.
#[derive(Debug)]
pub struct IdempotencyCache {
    entries: DashMap<String, CacheEntry>,
    ttl: Duration,
    max_entries: usize,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl IdempotencyCache {
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
            max_entries: max_entries.max(1),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn from_config(config: &SecurityConfig) -> Self {
        Self::new(config.idempotency_ttl, config.idempotency_max_entries)
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn get(&self, key: &str) -> Option<DispatchOutput> {
        let now = Instant::now();
        self.entries.remove_if(key, |_, entry| entry.expires_at <= now);

        let found = self.entries.get(key).map(|entry| entry.output.clone());
        match found {
            Some(mut output) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                trace!(key, "Idempotency cache hit");
                output.cache_hit = true;
                output.cost = 0.0;
                output.latency = Duration::ZERO;
                Some(output)
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Store a successful output under `key`, replacing any previous entry.
    pub fn insert(&self, key: impl Into<String>, output: &DispatchOutput) {
        let key = key.into();
        if !self.entries.contains_key(&key) && self.entries.len() >= self.max_entries {
            self.purge_expired();
            if self.entries.len() >= self.max_entries {
                self.evict_oldest();
            }
        }

        let mut output = output.clone();
        output.cache_hit = false;
        self.entries.insert(
            key,
            CacheEntry {
                output,
                expires_at: Instant::now() + self.ttl,
            },
        );
    }

    pub fn invalidate(&self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    /// Drop expired entries, returning how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.expires_at > now);
        before.saturating_sub(self.entries.len())
    }

    fn evict_oldest(&self) {
        let oldest = self
            .entries
            .iter()
            .min_by_key(|entry| entry.value().expires_at)
            .map(|entry| entry.key().clone());
        if let Some(key) = oldest {
            self.entries.remove(&key);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: self.entries.len(),
        }
    }
}

impl Default for IdempotencyCache {
    fn default() -> Self {
        Self::from_config(&SecurityConfig::default())
    }
}
