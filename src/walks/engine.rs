use rand::Rng;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tracing::debug;

use crate::error::{CrawlerError, Result};
use crate::graph::store::{GraphStore, NodeId, NodeStatus};

use super::store::{RandomWalk, WalkStore};

/// Count of walk mutations since the last arbiter reset. Advisory:
/// relaxed atomics are enough, and wrap-around is harmless because the
/// arbiter only compares it against a fraction of the walk count.
#[derive(Debug, Default)]
pub struct WalksChanged(AtomicU32);

impl WalksChanged {
    pub fn new() -> Self {
        Self(AtomicU32::new(0))
    }

    pub fn incr(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn load(&self) -> u32 {
        self.0.load(Ordering::Relaxed)
    }

    pub fn reset(&self) {
        self.0.store(0, Ordering::Relaxed);
    }
}

/// Generates, removes and incrementally repairs walks so that the walk
/// distribution tracks what a from-scratch regeneration over the current
/// graph would produce (Bahmani-Chowdhury-Goel).
pub struct WalkEngine {
    graph: Arc<dyn GraphStore>,
    walks: Arc<dyn WalkStore>,
    changed: Arc<WalksChanged>,
}

impl WalkEngine {
    pub fn new(
        graph: Arc<dyn GraphStore>,
        walks: Arc<dyn WalkStore>,
        changed: Arc<WalksChanged>,
    ) -> Self {
        Self {
            graph,
            walks,
            changed,
        }
    }

    /// One walk of the random surfer: start at `start`, continue with
    /// probability alpha, step to a uniformly chosen follow, abort on
    /// repetition or at a node with no follows.
    pub fn generate_walk<R: Rng + ?Sized>(
        &self,
        start: NodeId,
        rng: &mut R,
    ) -> Result<RandomWalk> {
        let mut nodes = vec![start];
        self.extend_walk(&mut nodes, rng)?;
        RandomWalk::new(nodes)
    }

    /// Continues the surfer from the last element of `nodes`, appending
    /// until a stop trial fails, the frontier has no follows, or the
    /// chosen follow collides with anything already in `nodes`.
    fn extend_walk<R: Rng + ?Sized>(&self, nodes: &mut Vec<NodeId>, rng: &mut R) -> Result<()> {
        let mut current = match nodes.last() {
            Some(&n) => n,
            None => return Ok(()),
        };
        let alpha = self.walks.alpha();
        loop {
            if rng.random::<f64>() > alpha {
                break;
            }
            let out = self.graph.follows(&[current])?.pop().unwrap_or_default();
            if out.is_empty() {
                break;
            }
            let next = out[rng.random_range(0..out.len())];
            if nodes.contains(&next) {
                break;
            }
            nodes.push(next);
            current = next;
        }
        Ok(())
    }

    /// Generates `walks_per_node` walks starting at `id` and inserts
    /// them atomically. Called on promotion and at cold start.
    pub fn generate<R: Rng + ?Sized>(&self, id: NodeId, rng: &mut R) -> Result<()> {
        let count = self.walks.walks_per_node();
        let mut batch = Vec::with_capacity(count);
        for _ in 0..count {
            batch.push(self.generate_walk(id, rng)?);
        }
        self.walks.add_walks(&batch)?;
        Ok(())
    }

    /// Bulk path: enumerates all nodes and generates walks for every
    /// active one. Fails with `EmptyStore` on an empty graph.
    pub fn generate_all<R: Rng + ?Sized>(&self, rng: &mut R) -> Result<()> {
        if self.graph.size()? == 0 {
            return Err(CrawlerError::EmptyStore);
        }
        let mut cursor = 0;
        loop {
            let (ids, next) = self.graph.scan_nodes(cursor, 1000)?;
            for id in ids {
                if self.graph.node_by_id(id)?.status == NodeStatus::Active {
                    self.generate(id, rng)?;
                }
            }
            cursor = next;
            if cursor == 0 {
                break;
            }
        }
        Ok(())
    }

    /// Removes every walk whose starter is `id`. Called on demotion.
    pub fn remove(&self, id: NodeId) -> Result<()> {
        let candidates = self.walks.walks_visiting(-1, &[id])?;
        let walks = self.walks.walks(&candidates)?;
        let starters: Vec<_> = candidates
            .into_iter()
            .zip(&walks)
            .filter(|(_, w)| w.starter() == id)
            .map(|(wid, _)| wid)
            .collect();
        if !starters.is_empty() {
            self.walks.remove_walks(&starters)?;
        }
        Ok(())
    }

    /// Repairs the walks after the follows of `id` changed, given the
    /// partition of old and new follows (sorted, as `partition`
    /// produces them). The caller has already committed the edge delta
    /// to the graph store. Returns the number of prune-grafts
    /// performed.
    ///
    /// On tight cycles the removed-hop repair can over- or under-count:
    /// a regenerated tail may revisit the mutated neighborhood with
    /// higher probability than the equilibrium share. The source
    /// literature assumes large sparse graphs; convergence tests keep
    /// expected-value assertions away from short cycles.
    pub fn update<R: Rng + ?Sized>(
        &self,
        id: NodeId,
        removed: &[NodeId],
        common: &[NodeId],
        added: &[NodeId],
        rng: &mut R,
    ) -> Result<usize> {
        if removed.is_empty() && added.is_empty() {
            return Ok(0);
        }
        let mut changed = self.update_removed(id, removed, common, rng)?;
        changed += self.update_added(id, added, common.len() + added.len(), rng)?;
        debug!(node = id, changed, "updated walks");
        Ok(changed)
    }

    /// For every walk traversing a hop `id -> r` with `r` removed, prune
    /// at the hop and regraft a tail sampled from the surviving follows.
    /// Only the earliest broken hop of each walk is repaired; later ones
    /// are left to future updates.
    fn update_removed<R: Rng + ?Sized>(
        &self,
        id: NodeId,
        removed: &[NodeId],
        common: &[NodeId],
        rng: &mut R,
    ) -> Result<usize> {
        if removed.is_empty() {
            return Ok(0);
        }
        let walk_ids = self.walks.walks_visiting(-1, &[id])?;
        let walks = self.walks.walks(&walk_ids)?;
        let alpha = self.walks.alpha();

        let mut changed = 0;
        for (walk_id, walk) in walk_ids.iter().zip(&walks) {
            let nodes = walk.nodes();
            let hop = (0..nodes.len().saturating_sub(1))
                .find(|&j| nodes[j] == id && removed.binary_search(&nodes[j + 1]).is_ok());
            let Some(cut_at) = hop else {
                continue;
            };

            // Resample the successor from the surviving follows, then
            // let the surfer run; anything colliding with the kept
            // prefix truncates the tail.
            let mut buf = nodes[..=cut_at].to_vec();
            if rng.random::<f64>() <= alpha && !common.is_empty() {
                let successor = common[rng.random_range(0..common.len())];
                if !buf.contains(&successor) {
                    buf.push(successor);
                    self.extend_walk(&mut buf, rng)?;
                }
            }
            let segment = buf.split_off(cut_at + 1);

            self.walks.prune_graft(*walk_id, cut_at + 1, &segment)?;
            self.changed.incr();
            changed += 1;
        }
        Ok(changed)
    }

    /// Every walk through `id` is regrafted with probability
    /// `|added| / new_out_degree`, so newly added edges reach their
    /// equilibrium share of the walk distribution without being
    /// over-represented.
    fn update_added<R: Rng + ?Sized>(
        &self,
        id: NodeId,
        added: &[NodeId],
        new_out_degree: usize,
        rng: &mut R,
    ) -> Result<usize> {
        if added.is_empty() || new_out_degree == 0 {
            return Ok(0);
        }
        let p = added.len() as f64 / new_out_degree as f64;
        let walk_ids = self.walks.walks_visiting(-1, &[id])?;
        let walks = self.walks.walks(&walk_ids)?;
        let alpha = self.walks.alpha();

        let mut changed = 0;
        for (walk_id, walk) in walk_ids.iter().zip(&walks) {
            if rng.random::<f64>() > p {
                continue;
            }
            let nodes = walk.nodes();
            let Some(cut_at) = nodes.iter().position(|&n| n == id) else {
                continue;
            };

            let mut buf = nodes[..=cut_at].to_vec();
            if rng.random::<f64>() <= alpha {
                let next = added[rng.random_range(0..added.len())];
                if !buf.contains(&next) {
                    buf.push(next);
                    self.extend_walk(&mut buf, rng)?;
                }
            }
            let segment = buf.split_off(cut_at + 1);

            self.walks.prune_graft(*walk_id, cut_at + 1, &segment)?;
            self.changed.incr();
            changed += 1;
        }
        Ok(changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    use crate::graph::memory::MemoryGraphStore;
    use crate::graph::store::{FollowDelta, NodeDelta};
    use crate::walks::memory::MemoryWalkStore;
    use crate::walks::store::WalkParams;

    struct Fixture {
        graph: Arc<MemoryGraphStore>,
        walks: Arc<MemoryWalkStore>,
        changed: Arc<WalksChanged>,
        engine: WalkEngine,
    }

    /// Builds a graph with `n` active nodes and the given follow edges.
    fn fixture(n: usize, edges: &[(NodeId, NodeId)], params: WalkParams) -> Fixture {
        let graph = Arc::new(MemoryGraphStore::new());
        for i in 0..n {
            graph.add_node(&format!("pk{i}")).unwrap();
            graph
                .update(i as NodeId, &NodeDelta::Promotion { at: 1 })
                .unwrap();
        }
        let mut by_source: std::collections::BTreeMap<NodeId, Vec<NodeId>> = Default::default();
        for &(from, to) in edges {
            by_source.entry(from).or_default().push(to);
        }
        for (from, added) in by_source {
            graph
                .update(
                    from,
                    &NodeDelta::FollowList(FollowDelta {
                        event_id: format!("seed-{from}"),
                        created_at: 10,
                        removed: vec![],
                        added,
                    }),
                )
                .unwrap();
        }

        let walks = Arc::new(MemoryWalkStore::new(params));
        let changed = Arc::new(WalksChanged::new());
        let engine = WalkEngine::new(graph.clone(), walks.clone(), changed.clone());
        Fixture {
            graph,
            walks,
            changed,
            engine,
        }
    }

    fn all_walks(walks: &MemoryWalkStore) -> Vec<RandomWalk> {
        let nodes: Vec<NodeId> = (0..100).collect();
        let ids = walks.walks_visiting(-1, &nodes).unwrap();
        walks.walks(&ids).unwrap()
    }

    #[test]
    fn test_generate_walk_starts_at_start() {
        let f = fixture(3, &[(0, 1), (1, 2), (2, 0)], WalkParams::default());
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..50 {
            let walk = f.engine.generate_walk(0, &mut rng).unwrap();
            assert_eq!(walk.starter(), 0);
            // No-repeat guard: the triangle bounds every walk at 3 hops.
            assert!(walk.len() <= 3);
            let nodes = walk.nodes();
            let mut sorted = nodes.to_vec();
            sorted.sort_unstable();
            sorted.dedup();
            assert_eq!(sorted.len(), nodes.len());
        }
    }

    #[test]
    fn test_generate_walk_stops_without_follows() {
        let f = fixture(1, &[], WalkParams::default());
        let mut rng = StdRng::seed_from_u64(1);
        let walk = f.engine.generate_walk(0, &mut rng).unwrap();
        assert_eq!(walk.nodes(), &[0]);
    }

    #[test]
    fn test_generate_creates_walks_per_node_starters() {
        let f = fixture(3, &[(0, 1), (1, 2)], WalkParams::new(0.85, 25).unwrap());
        let mut rng = StdRng::seed_from_u64(11);
        f.engine.generate(0, &mut rng).unwrap();

        let ids = f.walks.walks_visiting(-1, &[0]).unwrap();
        let walks = f.walks.walks(&ids).unwrap();
        let starters = walks.iter().filter(|w| w.starter() == 0).count();
        assert_eq!(starters, 25);
    }

    #[test]
    fn test_generate_all_covers_active_nodes_only() {
        let f = fixture(3, &[(0, 1), (1, 0)], WalkParams::new(0.85, 10).unwrap());
        // Demote node 2; it must get no starter walks.
        f.graph.update(2, &NodeDelta::Demotion { at: 2 }).unwrap();

        let mut rng = StdRng::seed_from_u64(3);
        f.engine.generate_all(&mut rng).unwrap();

        for id in [0, 1] {
            let ids = f.walks.walks_visiting(-1, &[id]).unwrap();
            let walks = f.walks.walks(&ids).unwrap();
            assert_eq!(walks.iter().filter(|w| w.starter() == id).count(), 10);
        }
        let ids = f.walks.walks_visiting(-1, &[2]).unwrap();
        let walks = f.walks.walks(&ids).unwrap();
        assert_eq!(walks.iter().filter(|w| w.starter() == 2).count(), 0);
    }

    #[test]
    fn test_generate_all_empty_graph_fails() {
        let graph = Arc::new(MemoryGraphStore::new());
        let walks = Arc::new(MemoryWalkStore::new(WalkParams::default()));
        let engine = WalkEngine::new(graph, walks, Arc::new(WalksChanged::new()));
        let mut rng = StdRng::seed_from_u64(0);
        assert!(matches!(
            engine.generate_all(&mut rng),
            Err(CrawlerError::EmptyStore)
        ));
    }

    #[test]
    fn test_remove_deletes_only_starter_walks() {
        let f = fixture(2, &[(0, 1), (1, 0)], WalkParams::new(0.85, 20).unwrap());
        let mut rng = StdRng::seed_from_u64(5);
        f.engine.generate_all(&mut rng).unwrap();

        f.engine.remove(0).unwrap();

        let ids = f.walks.walks_visiting(-1, &[0]).unwrap();
        let walks = f.walks.walks(&ids).unwrap();
        assert_eq!(walks.iter().filter(|w| w.starter() == 0).count(), 0);
        // Walks started at 1 survive, including those passing through 0.
        let ids = f.walks.walks_visiting(-1, &[1]).unwrap();
        let walks = f.walks.walks(&ids).unwrap();
        assert_eq!(walks.iter().filter(|w| w.starter() == 1).count(), 20);
    }

    #[test]
    fn test_update_empty_partition_is_noop() {
        let f = fixture(2, &[(0, 1)], WalkParams::new(0.85, 10).unwrap());
        let mut rng = StdRng::seed_from_u64(9);
        f.engine.generate_all(&mut rng).unwrap();
        let before = f.walks.total_visits().unwrap();

        let changed = f.engine.update(0, &[], &[], &[], &mut rng).unwrap();
        assert_eq!(changed, 0);
        assert_eq!(f.changed.load(), 0);
        assert_eq!(f.walks.total_visits().unwrap(), before);
    }

    #[test]
    fn test_update_removed_erases_broken_hops() {
        // Line graph 0 -> 1 -> 2 plus 0 -> 3, then drop the 0 -> 1 edge.
        let f = fixture(
            4,
            &[(0, 1), (1, 2), (0, 3)],
            WalkParams::new(0.85, 200).unwrap(),
        );
        let mut rng = StdRng::seed_from_u64(21);
        f.engine.generate_all(&mut rng).unwrap();

        f.graph
            .update(
                0,
                &NodeDelta::FollowList(FollowDelta {
                    event_id: "unfollow".into(),
                    created_at: 20,
                    removed: vec![1],
                    added: vec![],
                }),
            )
            .unwrap();
        let changed = f.engine.update(0, &[1], &[3], &[], &mut rng).unwrap();
        assert!(changed > 0);
        assert_eq!(f.changed.load() as usize, changed);

        for walk in all_walks(&f.walks) {
            let nodes = walk.nodes();
            for j in 0..nodes.len().saturating_sub(1) {
                assert!(
                    !(nodes[j] == 0 && nodes[j + 1] == 1),
                    "walk {nodes:?} still hops the removed edge"
                );
            }
        }
    }

    #[test]
    fn test_update_removed_to_empty_follow_set_prunes_to_starter() {
        // Incremental removal on a dangling node: 0 followed only 1.
        let f = fixture(2, &[(0, 1)], WalkParams::new(0.85, 100).unwrap());
        let mut rng = StdRng::seed_from_u64(33);
        f.engine.generate_all(&mut rng).unwrap();

        f.graph
            .update(
                0,
                &NodeDelta::FollowList(FollowDelta {
                    event_id: "clear".into(),
                    created_at: 20,
                    removed: vec![1],
                    added: vec![],
                }),
            )
            .unwrap();
        f.engine.update(0, &[1], &[], &[], &mut rng).unwrap();

        // Every walk starting at 0 now ends at 0.
        let ids = f.walks.walks_visiting(-1, &[0]).unwrap();
        for walk in f.walks.walks(&ids).unwrap() {
            if walk.starter() == 0 {
                assert_eq!(walk.nodes(), &[0]);
            }
        }
    }

    #[test]
    fn test_update_added_reaches_new_edge() {
        let f = fixture(3, &[(0, 1)], WalkParams::new(0.85, 500).unwrap());
        let mut rng = StdRng::seed_from_u64(17);
        f.engine.generate_all(&mut rng).unwrap();
        assert_eq!(f.walks.visit_counts(&[2]).unwrap()[0], 500); // only its own starters

        f.graph
            .update(
                0,
                &NodeDelta::FollowList(FollowDelta {
                    event_id: "follow-2".into(),
                    created_at: 20,
                    removed: vec![],
                    added: vec![2],
                }),
            )
            .unwrap();
        let changed = f.engine.update(0, &[], &[1], &[2], &mut rng).unwrap();
        assert!(changed > 0);

        // Some walks through 0 must now hop 0 -> 2.
        let ids = f.walks.walks_visiting(-1, &[0]).unwrap();
        let hops_to_new: usize = f
            .walks
            .walks(&ids)
            .unwrap()
            .iter()
            .filter(|w| {
                let n = w.nodes();
                (0..n.len().saturating_sub(1)).any(|j| n[j] == 0 && n[j + 1] == 2)
            })
            .count();
        assert!(hops_to_new > 0);
    }

    #[test]
    fn test_update_added_share_is_probabilistic() {
        // With new out-degree 2 and one added edge, roughly half of the
        // walks through the node are regrafted; with alpha 0.85 about
        // alpha/2 of them should now hop to the new target.
        let f = fixture(3, &[(0, 1)], WalkParams::new(0.85, 2000).unwrap());
        let mut rng = StdRng::seed_from_u64(29);
        f.engine.generate(0, &mut rng).unwrap();

        f.graph
            .update(
                0,
                &NodeDelta::FollowList(FollowDelta {
                    event_id: "follow-2".into(),
                    created_at: 20,
                    removed: vec![],
                    added: vec![2],
                }),
            )
            .unwrap();
        f.engine.update(0, &[], &[1], &[2], &mut rng).unwrap();

        let ids = f.walks.walks_visiting(-1, &[0]).unwrap();
        let walks = f.walks.walks(&ids).unwrap();
        let to_new = walks
            .iter()
            .filter(|w| w.nodes().get(1) == Some(&2))
            .count() as f64;
        let share = to_new / walks.len() as f64;
        // Expected share alpha/2 = 0.425; allow generous sampling noise.
        assert!((share - 0.425).abs() < 0.06, "share was {share}");
    }

    #[test]
    fn test_incremental_update_matches_regeneration() {
        // Acyclic graph; apply an edge change incrementally and compare
        // the global distribution against a from-scratch regeneration
        // over the mutated graph. Monte-Carlo noise bounds the gap.
        let params = WalkParams::new(0.85, 1000).unwrap();
        let edges = [(0, 1), (0, 2), (1, 3), (2, 3)];

        let incremental = fixture(4, &edges, params);
        let mut rng = StdRng::seed_from_u64(61);
        incremental.engine.generate_all(&mut rng).unwrap();

        // Drop 0 -> 1 and add 0 -> 3.
        incremental
            .graph
            .update(
                0,
                &NodeDelta::FollowList(FollowDelta {
                    event_id: "rewire".into(),
                    created_at: 20,
                    removed: vec![1],
                    added: vec![3],
                }),
            )
            .unwrap();
        incremental
            .engine
            .update(0, &[1], &[2], &[3], &mut rng)
            .unwrap();

        let fresh = fixture(4, &[(0, 2), (0, 3), (1, 3), (2, 3)], params);
        let mut fresh_rng = StdRng::seed_from_u64(62);
        fresh.engine.generate_all(&mut fresh_rng).unwrap();

        let ids = [0, 1, 2, 3];
        let inc_total = incremental.walks.total_visits().unwrap() as f64;
        let fresh_total = fresh.walks.total_visits().unwrap() as f64;
        let inc_counts = incremental.walks.visit_counts(&ids).unwrap();
        let fresh_counts = fresh.walks.visit_counts(&ids).unwrap();

        let l1: f64 = inc_counts
            .iter()
            .zip(&fresh_counts)
            .map(|(&a, &b)| (a as f64 / inc_total - b as f64 / fresh_total).abs())
            .sum();
        assert!(l1 < 0.05, "L1 distance to regeneration was {l1}");
    }

    #[test]
    fn test_engine_over_sqlite_backend() {
        use crate::db::sqlite::{Database, SqliteGraphStore};
        use crate::db::walks::SqliteWalkStore;
        use tempfile::NamedTempFile;

        let file = NamedTempFile::new().unwrap();
        let db = Arc::new(Database::open(file.path()).unwrap());
        let graph = Arc::new(SqliteGraphStore::new(db.clone()));
        let walks = Arc::new(SqliteWalkStore::new(
            db,
            WalkParams::new(0.85, 20).unwrap(),
        ));

        for i in 0..3 {
            let id = graph.add_node(&format!("pk{i}")).unwrap();
            graph.update(id, &NodeDelta::Promotion { at: 1 }).unwrap();
        }
        graph
            .update(
                0,
                &NodeDelta::FollowList(FollowDelta {
                    event_id: "seed".into(),
                    created_at: 10,
                    removed: vec![],
                    added: vec![1, 2],
                }),
            )
            .unwrap();

        let changed = Arc::new(WalksChanged::new());
        let engine = WalkEngine::new(graph.clone(), walks.clone(), changed.clone());
        let mut rng = StdRng::seed_from_u64(71);
        engine.generate_all(&mut rng).unwrap();

        assert_eq!(walks.visit_counts(&[0]).unwrap()[0], 20);
        assert!(walks.total_visits().unwrap() >= 60);

        // Rewire 0 away from 1 and check the hop disappears here too.
        graph
            .update(
                0,
                &NodeDelta::FollowList(FollowDelta {
                    event_id: "unfollow".into(),
                    created_at: 20,
                    removed: vec![1],
                    added: vec![],
                }),
            )
            .unwrap();
        engine.update(0, &[1], &[2], &[], &mut rng).unwrap();

        let ids = walks.walks_visiting(-1, &[0]).unwrap();
        for walk in walks.walks(&ids).unwrap() {
            let nodes = walk.nodes();
            for j in 0..nodes.len().saturating_sub(1) {
                assert!(!(nodes[j] == 0 && nodes[j + 1] == 1));
            }
        }

        engine.remove(0).unwrap();
        let ids = walks.walks_visiting(-1, &[0]).unwrap();
        for walk in walks.walks(&ids).unwrap() {
            assert_ne!(walk.starter(), 0);
        }
    }

    #[test]
    fn test_walks_changed_counts_prune_grafts() {
        let f = fixture(3, &[(0, 1), (0, 2)], WalkParams::new(0.85, 50).unwrap());
        let mut rng = StdRng::seed_from_u64(41);
        f.engine.generate_all(&mut rng).unwrap();

        f.graph
            .update(
                0,
                &NodeDelta::FollowList(FollowDelta {
                    event_id: "unfollow-1".into(),
                    created_at: 20,
                    removed: vec![1],
                    added: vec![],
                }),
            )
            .unwrap();
        let changed = f.engine.update(0, &[1], &[2], &[], &mut rng).unwrap();
        assert_eq!(f.changed.load() as usize, changed);

        f.changed.reset();
        assert_eq!(f.changed.load(), 0);
    }
}
