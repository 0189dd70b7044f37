use rand::rngs::StdRng;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::Result;
use crate::graph::store::{GraphStore, NodeDelta, NodeId, NodeStatus};
use crate::rank::RankEstimator;
use crate::walks::engine::{WalkEngine, WalksChanged};
use crate::walks::store::WalkStore;

const SWEEP_TIMEOUT: Duration = Duration::from_secs(60);
const SCAN_BATCH: usize = 1000;

#[derive(Debug, Default)]
struct SweepOutcome {
    scanned: usize,
    promoted: usize,
    demoted: usize,
    completed: bool,
}

/// Periodic actor that promotes and demotes nodes by observed visit
/// count. A sweep only starts once enough walk churn has accumulated:
/// `walksChanged / (totalVisits * (1 - alpha))`, the denominator
/// approximating the walk count. Completed sweeps write fresh global
/// scores back to the graph store and reset the churn counter; aborted
/// sweeps keep the counter so the next tick retries.
pub struct NodeArbiter {
    graph: Arc<dyn GraphStore>,
    walks: Arc<dyn WalkStore>,
    engine: Arc<WalkEngine>,
    ranks: Arc<RankEstimator>,
    changed: Arc<WalksChanged>,
    pubkeys: mpsc::Sender<String>,
    interval: Duration,
    start_threshold: f64,
    promotion_threshold: u64,
    demotion_threshold: u64,
    cancel: CancellationToken,
    rng: StdRng,
}

#[allow(clippy::too_many_arguments)] // wiring struct, built once in main
impl NodeArbiter {
    pub fn new(
        graph: Arc<dyn GraphStore>,
        walks: Arc<dyn WalkStore>,
        engine: Arc<WalkEngine>,
        ranks: Arc<RankEstimator>,
        changed: Arc<WalksChanged>,
        pubkeys: mpsc::Sender<String>,
        interval: Duration,
        start_threshold: f64,
        promotion_multiplier: f64,
        demotion_multiplier: f64,
        cancel: CancellationToken,
        rng: StdRng,
    ) -> Self {
        let walks_per_node = walks.walks_per_node() as f64;
        Self {
            graph,
            walks,
            engine,
            ranks,
            changed,
            pubkeys,
            interval,
            start_threshold,
            promotion_threshold: (promotion_multiplier * walks_per_node).round() as u64,
            demotion_threshold: (demotion_multiplier * walks_per_node).round() as u64,
            cancel,
            rng,
        }
    }

    pub async fn run(mut self) {
        info!(
            "Node arbiter started: threshold {}, promote at {}, demote below {}",
            self.start_threshold, self.promotion_threshold, self.demotion_threshold
        );

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await; // first tick completes immediately

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.maybe_sweep() {
                        warn!("Arbiter sweep failed: {}", e);
                    }
                }
            }
        }
        info!("Node arbiter stopped");
    }

    fn maybe_sweep(&mut self) -> Result<()> {
        let total_visits = self.walks.total_visits()?;
        if total_visits == 0 {
            return Ok(());
        }
        let walk_estimate = total_visits as f64 * (1.0 - self.walks.alpha());
        let change_ratio = self.changed.load() as f64 / walk_estimate;
        if change_ratio < self.start_threshold {
            return Ok(());
        }

        info!(change_ratio, "Walk churn above threshold, sweeping");
        let outcome = self.sweep()?;
        if outcome.completed {
            // Only a full sweep resets the counter; partial progress
            // leaves it so the next tick finishes the job.
            self.changed.reset();
            self.ranks.invalidate_cache();
            info!(
                "Sweep complete: {} scanned, {} promoted, {} demoted",
                outcome.scanned, outcome.promoted, outcome.demoted
            );
        } else {
            warn!(
                "Sweep aborted after {} nodes ({} promoted, {} demoted)",
                outcome.scanned, outcome.promoted, outcome.demoted
            );
        }
        Ok(())
    }

    fn sweep(&mut self) -> Result<SweepOutcome> {
        let deadline = Instant::now() + SWEEP_TIMEOUT;
        let mut outcome = SweepOutcome::default();
        let mut scanned_ids: Vec<NodeId> = Vec::new();
        let mut cursor = 0;

        loop {
            if self.cancel.is_cancelled() || Instant::now() > deadline {
                return Ok(outcome);
            }

            let (ids, next) = self.graph.scan_nodes(cursor, SCAN_BATCH)?;
            let counts = self.walks.visit_counts(&ids)?;
            for (&id, &visits) in ids.iter().zip(&counts) {
                match self.arbitrate(id, visits) {
                    Ok(Some(NodeStatus::Active)) => outcome.promoted += 1,
                    Ok(Some(NodeStatus::Inactive)) => outcome.demoted += 1,
                    Ok(None) => {}
                    // One stuck node must not wedge the sweep.
                    Err(e) => warn!("Arbitration of node {} failed: {}", id, e),
                }
            }
            outcome.scanned += ids.len();
            scanned_ids.extend(ids);

            cursor = next;
            if cursor == 0 {
                break;
            }
        }

        let scores = self.ranks.global(&scanned_ids)?;
        self.graph.set_pagerank(&scores.into_iter().collect::<Vec<_>>())?;

        outcome.completed = true;
        Ok(outcome)
    }

    /// Returns the new status if the node changed state.
    fn arbitrate(&mut self, id: NodeId, visits: u64) -> Result<Option<NodeStatus>> {
        let node = self.graph.node_by_id(id)?;
        match node.status {
            NodeStatus::Active if visits < self.demotion_threshold => {
                self.engine.remove(id)?;
                self.graph.update(
                    id,
                    &NodeDelta::Demotion {
                        at: chrono::Utc::now().timestamp() as u64,
                    },
                )?;
                Ok(Some(NodeStatus::Inactive))
            }
            NodeStatus::Inactive if visits >= self.promotion_threshold => {
                self.engine.generate(id, &mut self.rng)?;
                self.graph.update(
                    id,
                    &NodeDelta::Promotion {
                        at: chrono::Utc::now().timestamp() as u64,
                    },
                )?;
                if let Err(e) = self.pubkeys.try_send(node.pubkey.to_string()) {
                    warn!("Pubkey queue full, {} will wait for the next sweep: {}", node.pubkey, e);
                }
                Ok(Some(NodeStatus::Active))
            }
            _ => Ok(None),
        }
    }
}
