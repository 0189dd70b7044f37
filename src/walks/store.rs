use serde::{Deserialize, Serialize};

use crate::error::{CrawlerError, Result};
use crate::graph::store::NodeId;

pub type WalkId = u32;

pub const DEFAULT_ALPHA: f64 = 0.85;
pub const DEFAULT_WALKS_PER_NODE: usize = 100;

/// Immutable walk-model parameters, validated at construction.
#[derive(Debug, Clone, Copy)]
pub struct WalkParams {
    alpha: f64,
    walks_per_node: usize,
}

impl WalkParams {
    pub fn new(alpha: f64, walks_per_node: usize) -> Result<Self> {
        if !(alpha > 0.0 && alpha < 1.0) {
            return Err(CrawlerError::InvalidAlpha(alpha));
        }
        if walks_per_node < 1 {
            return Err(CrawlerError::InvalidWalksPerNode(walks_per_node));
        }
        Ok(Self {
            alpha,
            walks_per_node,
        })
    }

    pub fn alpha(&self) -> f64 {
        self.alpha
    }

    pub fn walks_per_node(&self) -> usize {
        self.walks_per_node
    }
}

impl Default for WalkParams {
    fn default() -> Self {
        Self {
            alpha: DEFAULT_ALPHA,
            walks_per_node: DEFAULT_WALKS_PER_NODE,
        }
    }
}

/// A simple (no-repeat) path sampled by the random-surfer model.
/// The first element is the starter. Non-emptiness is enforced at
/// construction, so a stored walk is always valid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RandomWalk(Vec<NodeId>);

impl RandomWalk {
    pub fn new(nodes: Vec<NodeId>) -> Result<Self> {
        if nodes.is_empty() {
            return Err(CrawlerError::EmptyWalk);
        }
        debug_assert!(
            {
                let mut sorted = nodes.clone();
                sorted.sort_unstable();
                sorted.windows(2).all(|w| w[0] != w[1])
            },
            "walks never repeat a node"
        );
        Ok(Self(nodes))
    }

    pub fn nodes(&self) -> &[NodeId] {
        &self.0
    }

    pub fn starter(&self) -> NodeId {
        self.0[0]
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn into_nodes(self) -> Vec<NodeId> {
        self.0
    }
}

/// Collection of random walks indexed by walk id and by visit:
/// `visits[n]` is the set of walk ids whose sequence contains `n`.
///
/// `prune_graft` is the only mutation of an existing walk, and every
/// mutation is atomic: between entry and return no reader observes a
/// walk and a visit index that disagree. Walk ids are assigned
/// monotonically and never reused.
pub trait WalkStore: Send + Sync {
    /// Per-step continuation probability of the random surfer.
    fn alpha(&self) -> f64;

    /// Number of walks started per active node.
    fn walks_per_node(&self) -> usize;

    /// Sum over all walks of their length.
    fn total_visits(&self) -> Result<u64>;

    /// Visit counts in input order, zero for unknown nodes.
    fn visit_counts(&self, ids: &[NodeId]) -> Result<Vec<u64>>;

    /// Up to `limit` unique walk ids drawn evenly from the given nodes'
    /// visit sets (approximately `limit / ids.len()` per node).
    /// `limit = -1` returns everything; `limit = 0` returns nothing.
    fn walks_visiting(&self, limit: i64, ids: &[NodeId]) -> Result<Vec<WalkId>>;

    /// Walk ids visiting every one of the given nodes.
    fn walks_visiting_all(&self, ids: &[NodeId]) -> Result<Vec<WalkId>>;

    /// Retrieve walks by id, order preserved. Any unknown id fails the
    /// whole call with `WalkNotFound`.
    fn walks(&self, ids: &[WalkId]) -> Result<Vec<RandomWalk>>;

    /// Atomically insert all walks, assigning fresh ids, returned in
    /// input order.
    fn add_walks(&self, walks: &[RandomWalk]) -> Result<Vec<WalkId>>;

    /// Atomically remove all of the given walks. Validates existence of
    /// every id before removing anything; no partial removals.
    fn remove_walks(&self, ids: &[WalkId]) -> Result<()>;

    /// Atomically replace `walk[id]` with `walk[id][0..cut] ++ segment`,
    /// fixing the visit index. Fails with `WalkNotFound` or, for a cut
    /// index outside `[0, len]`, `InvalidWalkIndex`.
    fn prune_graft(&self, id: WalkId, cut: usize, segment: &[NodeId]) -> Result<()>;
}
