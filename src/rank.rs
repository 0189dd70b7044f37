use rustc_hash::FxHashMap;
use std::sync::Arc;

use crate::cache::{RankCache, RankKey, ScoredNodes};
use crate::error::{CrawlerError, Result};
use crate::graph::store::{GraphStore, NodeId};
use crate::walks::store::WalkStore;

/// Monte-Carlo pagerank estimator over the walk store.
///
/// Scores are empirical visit frequencies: the global score of a node is
/// its share of all visits, the personalized score is its share of the
/// walks started at the pivot. Accuracy is O(1/sqrt(walks)).
pub struct RankEstimator {
    graph: Arc<dyn GraphStore>,
    walks: Arc<dyn WalkStore>,
    cache: RankCache,
}

impl RankEstimator {
    pub fn new(graph: Arc<dyn GraphStore>, walks: Arc<dyn WalkStore>, cache: RankCache) -> Self {
        Self {
            graph,
            walks,
            cache,
        }
    }

    /// Global scores for the given ids: `visits[n] / totalVisits`.
    /// Unknown ids score 0. Summed over every node the scores add to 1.
    pub fn global(&self, ids: &[NodeId]) -> Result<FxHashMap<NodeId, f64>> {
        let total = self.walks.total_visits()?;
        if total == 0 {
            return Err(CrawlerError::EmptyStore);
        }
        let counts = self.walks.visit_counts(ids)?;
        Ok(ids
            .iter()
            .zip(counts)
            .map(|(&id, count)| (id, count as f64 / total as f64))
            .collect())
    }

    /// Empirical distribution of the walks starting at `pivot`: at most
    /// `top_n` pairs, scores descending, ties broken by ascending id.
    /// The pivot must exist in the graph store and have starter walks.
    #[allow(dead_code)] // Public API for rank consumers
    pub fn personalized(&self, pivot: NodeId, top_n: usize) -> Result<ScoredNodes> {
        if top_n == 0 {
            return Err(CrawlerError::InvalidTopN(top_n));
        }
        self.graph.node_by_id(pivot)?;

        let key = RankKey::new(pivot, top_n);
        if let Some(hit) = self.cache.get(&key) {
            return Ok(hit);
        }

        let candidate_ids = self.walks.walks_visiting(-1, &[pivot])?;
        let candidates = self.walks.walks(&candidate_ids)?;
        let starters: Vec<_> = candidates
            .iter()
            .filter(|w| w.starter() == pivot)
            .collect();
        if starters.is_empty() {
            return Err(CrawlerError::NodeNotVisited(pivot));
        }

        let mut counts: FxHashMap<NodeId, u64> = FxHashMap::default();
        for walk in &starters {
            for &node in walk.nodes() {
                *counts.entry(node).or_insert(0) += 1;
            }
        }

        let sample = starters.len() as f64;
        let mut scored: Vec<(NodeId, f64)> = counts
            .into_iter()
            .map(|(id, count)| (id, count as f64 / sample))
            .collect();
        scored.sort_unstable_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.0.cmp(&b.0))
        });
        scored.truncate(top_n);

        let scored = Arc::new(scored);
        self.cache.insert(key, scored.clone());
        Ok(scored)
    }

    pub fn invalidate_cache(&self) {
        self.cache.invalidate_all();
    }
}

/// L1 distance over the shared key set of two score maps.
#[allow(dead_code)] // convergence-test utility
pub fn l1_distance(a: &FxHashMap<NodeId, f64>, b: &FxHashMap<NodeId, f64>) -> f64 {
    a.iter()
        .filter_map(|(id, score)| b.get(id).map(|other| (score - other).abs()))
        .sum()
}
