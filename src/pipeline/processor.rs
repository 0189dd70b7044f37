use rand::rngs::StdRng;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{CrawlerError, Result};
use crate::graph::store::{partition, FollowDelta, GraphStore, NodeDelta, NodeId};
use crate::sync::source::FollowEvent;
use crate::walks::engine::WalkEngine;

/// Drains the event queue and applies follow-list events: resolves the
/// listed pubkeys (creating unseen nodes as inactive), commits the edge
/// delta to the graph store and repairs the walks.
///
/// A single consumer serializes all applications, which makes the
/// per-author timestamp-monotonicity check race-free. Failures are
/// logged and the event is dropped; the querier re-fetches lost lists.
pub struct EventProcessor {
    graph: Arc<dyn GraphStore>,
    engine: Arc<WalkEngine>,
    events: mpsc::Receiver<FollowEvent>,
    cancel: CancellationToken,
    rng: StdRng,
}

impl EventProcessor {
    pub fn new(
        graph: Arc<dyn GraphStore>,
        engine: Arc<WalkEngine>,
        events: mpsc::Receiver<FollowEvent>,
        cancel: CancellationToken,
        rng: StdRng,
    ) -> Self {
        Self {
            graph,
            engine,
            events,
            cancel,
            rng,
        }
    }

    pub async fn run(mut self) {
        info!("Event processor started");
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                maybe = self.events.recv() => match maybe {
                    Some(event) => {
                        if let Err(e) = self.process(&event) {
                            warn!("Failed to process follow list {}: {}", event.id, e);
                        }
                    }
                    None => break,
                },
            }
        }
        info!("Event processor stopped");
    }

    fn process(&mut self, event: &FollowEvent) -> Result<()> {
        let author = match self.graph.node_by_key(&event.author) {
            Ok(node) => node,
            Err(CrawlerError::PubkeyNotFound(_)) => {
                debug!("Ignoring follow list from unknown author");
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        if author
            .latest_follow_at()
            .is_some_and(|ts| event.created_at < ts)
        {
            debug!(node = author.id, "Ignoring stale follow list");
            return Ok(());
        }

        let new_follows = self.resolve_follows(&event.follow_keys())?;
        let old_follows = self
            .graph
            .follows(&[author.id])?
            .pop()
            .unwrap_or_default();
        let (removed, common, added) = partition(&old_follows, &new_follows);

        let delta = NodeDelta::FollowList(FollowDelta {
            event_id: event.id.clone(),
            created_at: event.created_at,
            removed: removed.clone(),
            added: added.clone(),
        });
        if !self.graph.update(author.id, &delta)? {
            debug!(node = author.id, "Follow delta rejected as stale");
            return Ok(());
        }

        let changed = self
            .engine
            .update(author.id, &removed, &common, &added, &mut self.rng)?;
        debug!(
            node = author.id,
            removed = removed.len(),
            added = added.len(),
            changed,
            "follow list applied"
        );
        Ok(())
    }

    /// Resolve pubkeys to node ids, creating missing nodes as inactive.
    fn resolve_follows(&self, keys: &[String]) -> Result<Vec<NodeId>> {
        let resolved = self.graph.node_ids(keys)?;
        let mut ids = Vec::with_capacity(keys.len());
        for (key, maybe_id) in keys.iter().zip(resolved) {
            let id = match maybe_id {
                Some(id) => id,
                None => match self.graph.add_node(key) {
                    Ok(id) => id,
                    // Lost a race with another writer; the node exists now.
                    Err(CrawlerError::NodeAlreadyPresent(_)) => self.graph.node_by_key(key)?.id,
                    Err(e) => return Err(e),
                },
            };
            ids.push(id);
        }
        Ok(ids)
    }
}
