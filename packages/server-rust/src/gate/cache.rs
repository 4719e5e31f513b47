//! Bounded cache of compatibility verdicts keyed by `(system, version)`.

use std::sync::atomic::{AtomicU64, Ordering};

use quick_cache::sync::Cache;
use serde::Serialize;

/// Default number of `(system, version)` verdicts kept.
pub const DEFAULT_CACHE_CAPACITY: usize = 1_000;

/// Point-in-time cache occupancy and hit statistics.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheStats {
    pub size: usize,
    pub capacity: usize,
    pub hits: u64,
    pub misses: u64,
    /// `hits / (hits + misses)`, 0.0 before the first lookup.
    pub hit_ratio: f64,
    /// `size / capacity`.
    pub fill_ratio: f64,
}

/// Compatibility verdicts per client system and version string.
///
/// Eviction is handled by `quick_cache`; a verdict may disappear at any time
/// and is then recomputed on the next request.
pub struct CompatibilityCache {
    entries: Cache<(String, String), bool>,
    capacity: usize,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl CompatibilityCache {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: Cache::new(capacity),
            capacity,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Cached verdict for `system` at `version`, if present.
    pub fn get(&self, system: &str, version: &str) -> Option<bool> {
        let verdict = self
            .entries
            .get(&(system.to_string(), version.to_string()));
        let counter = if verdict.is_some() {
            &self.hits
        } else {
            &self.misses
        };
        counter.fetch_add(1, Ordering::Relaxed);
        verdict
    }

    pub fn insert(&self, system: &str, version: &str, compatible: bool) {
        self.entries
            .insert((system.to_string(), version.to_string()), compatible);
    }

    /// Drops every verdict and zeroes the hit counters.
    pub fn clear(&self) {
        self.entries.clear();
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
        tracing::info!("compatibility cache cleared");
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let lookups = hits + misses;
        #[allow(clippy::cast_precision_loss)]
        let hit_ratio = if lookups == 0 {
            0.0
        } else {
            hits as f64 / lookups as f64
        };
        let size = self.len();
        #[allow(clippy::cast_precision_loss)]
        let fill_ratio = size as f64 / self.capacity as f64;
        CacheStats {
            size,
            capacity: self.capacity,
            hits,
            misses,
            hit_ratio,
            fill_ratio,
        }
    }
}

impl Default for CompatibilityCache {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_CAPACITY)
    }
}

impl std::fmt::Debug for CompatibilityCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompatibilityCache")
            .field("stats", &self.stats())
            .finish()
    }
}
