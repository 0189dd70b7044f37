use moka::sync::Cache;
use std::sync::Arc;
use std::time::Duration;

use crate::graph::store::NodeId;

const DEFAULT_CACHE_SIZE: usize = 10000;
const DEFAULT_TTL_SECS: u64 = 300; // 5 minutes

/// Compact cache key: the pivot node id plus the requested cutoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RankKey {
    pub pivot: NodeId,
    pub top_n: u32,
}

impl RankKey {
    pub fn new(pivot: NodeId, top_n: usize) -> Self {
        Self {
            pivot,
            top_n: top_n.min(u32::MAX as usize) as u32,
        }
    }
}

pub type ScoredNodes = Arc<Vec<(NodeId, f64)>>;

/// Lock-free concurrent cache for personalized-rank results with
/// automatic TTL eviction. Walk mutations between sweeps leave entries
/// slightly stale, which the Monte-Carlo error already dominates; the
/// arbiter invalidates everything after each completed sweep.
pub struct RankCache {
    entries: Cache<RankKey, ScoredNodes>,
    ttl_secs: u64,
}

impl RankCache {
    pub fn new(max_capacity: usize, ttl_secs: u64) -> Self {
        let entries = Cache::builder()
            .max_capacity(max_capacity as u64)
            .time_to_live(Duration::from_secs(ttl_secs))
            .build();

        Self { entries, ttl_secs }
    }

    #[allow(dead_code)] // Public API for embedding without a config
    pub fn with_defaults() -> Self {
        Self::new(DEFAULT_CACHE_SIZE, DEFAULT_TTL_SECS)
    }

    pub fn get(&self, key: &RankKey) -> Option<ScoredNodes> {
        self.entries.get(key)
    }

    pub fn insert(&self, key: RankKey, scores: ScoredNodes) {
        self.entries.insert(key, scores);
    }

    /// Invalidate all entries. Called after a sweep rewrites the scores.
    pub fn invalidate_all(&self) {
        self.entries.invalidate_all();
    }

    #[allow(dead_code)] // Public API for cache inspection
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            size: self.entries.entry_count() as usize,
            capacity: self.entries.policy().max_capacity().unwrap_or(0) as usize,
            ttl_secs: self.ttl_secs,
        }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct CacheStats {
    pub size: usize,
    pub capacity: usize,
    pub ttl_secs: u64,
}
