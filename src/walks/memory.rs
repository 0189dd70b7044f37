use parking_lot::RwLock;
use rustc_hash::{FxHashMap, FxHashSet};

use crate::error::{CrawlerError, Result};
use crate::graph::store::NodeId;

use super::store::{RandomWalk, WalkId, WalkParams, WalkStore};

/// The combined walk and visit index. Guarded by a single lock so that
/// every mutation, prune-graft included, is observably atomic.
#[derive(Default)]
struct WalkIndex {
    walks: FxHashMap<WalkId, RandomWalk>,
    visits: FxHashMap<NodeId, FxHashSet<WalkId>>,
    total_visits: u64,
    next_id: WalkId,
}

impl WalkIndex {
    fn insert(&mut self, walk: RandomWalk) -> WalkId {
        let id = self.next_id;
        self.next_id += 1;
        self.total_visits += walk.len() as u64;
        for &node in walk.nodes() {
            self.visits.entry(node).or_default().insert(id);
        }
        self.walks.insert(id, walk);
        id
    }

    fn remove(&mut self, id: WalkId) {
        let Some(walk) = self.walks.remove(&id) else {
            return;
        };
        self.total_visits -= walk.len() as u64;
        for node in walk.into_nodes() {
            if let Some(set) = self.visits.get_mut(&node) {
                set.remove(&id);
                if set.is_empty() {
                    self.visits.remove(&node);
                }
            }
        }
    }
}

/// In-memory walk store, the test-side counterpart of the SQLite
/// backend.
pub struct MemoryWalkStore {
    params: WalkParams,
    index: RwLock<WalkIndex>,
}

impl MemoryWalkStore {
    #[allow(dead_code)] // test-side backend; production uses SQLite
    pub fn new(params: WalkParams) -> Self {
        Self {
            params,
            index: RwLock::new(WalkIndex::default()),
        }
    }
}

impl WalkStore for MemoryWalkStore {
    fn alpha(&self) -> f64 {
        self.params.alpha()
    }

    fn walks_per_node(&self) -> usize {
        self.params.walks_per_node()
    }

    fn total_visits(&self) -> Result<u64> {
        Ok(self.index.read().total_visits)
    }

    fn visit_counts(&self, ids: &[NodeId]) -> Result<Vec<u64>> {
        let index = self.index.read();
        Ok(ids
            .iter()
            .map(|id| index.visits.get(id).map_or(0, |s| s.len() as u64))
            .collect())
    }

    fn walks_visiting(&self, limit: i64, ids: &[NodeId]) -> Result<Vec<WalkId>> {
        if limit == 0 || ids.is_empty() {
            return Ok(Vec::new());
        }
        let index = self.index.read();

        let per_node = if limit < 0 {
            usize::MAX
        } else {
            (limit as usize).div_ceil(ids.len())
        };
        let cap = if limit < 0 { usize::MAX } else { limit as usize };

        let mut seen = FxHashSet::default();
        let mut out = Vec::new();
        for id in ids {
            let Some(set) = index.visits.get(id) else {
                continue;
            };
            for &walk_id in set.iter().take(per_node) {
                if seen.insert(walk_id) {
                    out.push(walk_id);
                    if out.len() >= cap {
                        return Ok(out);
                    }
                }
            }
        }
        Ok(out)
    }

    fn walks_visiting_all(&self, ids: &[NodeId]) -> Result<Vec<WalkId>> {
        let index = self.index.read();
        let mut sets = Vec::with_capacity(ids.len());
        for id in ids {
            match index.visits.get(id) {
                Some(set) => sets.push(set),
                None => return Ok(Vec::new()),
            }
        }
        let Some((first, rest)) = sets.split_first() else {
            return Ok(Vec::new());
        };
        let mut out: Vec<WalkId> = first
            .iter()
            .filter(|w| rest.iter().all(|s| s.contains(w)))
            .copied()
            .collect();
        out.sort_unstable();
        Ok(out)
    }

    fn walks(&self, ids: &[WalkId]) -> Result<Vec<RandomWalk>> {
        let index = self.index.read();
        ids.iter()
            .map(|id| {
                index
                    .walks
                    .get(id)
                    .cloned()
                    .ok_or(CrawlerError::WalkNotFound(*id))
            })
            .collect()
    }

    fn add_walks(&self, walks: &[RandomWalk]) -> Result<Vec<WalkId>> {
        let mut index = self.index.write();
        Ok(walks.iter().map(|w| index.insert(w.clone())).collect())
    }

    fn remove_walks(&self, ids: &[WalkId]) -> Result<()> {
        let mut index = self.index.write();
        for id in ids {
            if !index.walks.contains_key(id) {
                return Err(CrawlerError::WalkNotFound(*id));
            }
        }
        for &id in ids {
            index.remove(id);
        }
        Ok(())
    }

    fn prune_graft(&self, id: WalkId, cut: usize, segment: &[NodeId]) -> Result<()> {
        let mut index = self.index.write();
        let old = index
            .walks
            .get(&id)
            .ok_or(CrawlerError::WalkNotFound(id))?;
        if cut > old.len() {
            return Err(CrawlerError::InvalidWalkIndex {
                index: cut,
                len: old.len(),
            });
        }

        let old_nodes = old.nodes().to_vec();
        let mut new_nodes = old_nodes[..cut].to_vec();
        new_nodes.extend_from_slice(segment);
        let new_walk = RandomWalk::new(new_nodes.clone())?;

        let old_set: FxHashSet<NodeId> = old_nodes.iter().copied().collect();
        let new_set: FxHashSet<NodeId> = new_nodes.iter().copied().collect();

        for node in old_set.difference(&new_set) {
            if let Some(set) = index.visits.get_mut(node) {
                set.remove(&id);
                if set.is_empty() {
                    index.visits.remove(node);
                }
            }
        }
        for &node in new_set.difference(&old_set) {
            index.visits.entry(node).or_default().insert(id);
        }

        index.total_visits = index.total_visits - old_nodes.len() as u64 + new_nodes.len() as u64;
        index.walks.insert(id, new_walk);
        Ok(())
    }
}
