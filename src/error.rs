use thiserror::Error;

use crate::graph::store::NodeId;
use crate::walks::store::WalkId;

pub type Result<T, E = CrawlerError> = std::result::Result<T, E>;

/// Structural errors shared by the stores, the walk engine and the
/// rank estimator. Transport-level failures are wrapped in `Backend`.
#[derive(Debug, Error)]
pub enum CrawlerError {
    #[error("graph store is empty")]
    EmptyStore,

    #[error("node {0} not found in graph store")]
    NodeNotFound(NodeId),

    #[error("pubkey {0} not found in graph store")]
    PubkeyNotFound(String),

    /// The node exists in the graph store but has no walks starting at it.
    #[error("node {0} has no walks in the walk store")]
    NodeNotVisited(NodeId),

    #[error("pubkey {0} already present in graph store")]
    NodeAlreadyPresent(String),

    #[error("walk {0} not found in walk store")]
    WalkNotFound(WalkId),

    #[error("cut index {index} out of range for walk of length {len}")]
    InvalidWalkIndex { index: usize, len: usize },

    #[error("a walk must visit at least one node")]
    EmptyWalk,

    #[error("alpha must be in (0, 1), got {0}")]
    InvalidAlpha(f64),

    #[error("walks-per-node must be at least 1, got {0}")]
    InvalidWalksPerNode(usize),

    #[error("top-n must be positive, got {0}")]
    InvalidTopN(usize),

    #[error("storage backend: {0}")]
    Backend(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl From<rusqlite::Error> for CrawlerError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Backend(Box::new(err))
    }
}

impl From<serde_json::Error> for CrawlerError {
    fn from(err: serde_json::Error) -> Self {
        Self::Backend(Box::new(err))
    }
}
