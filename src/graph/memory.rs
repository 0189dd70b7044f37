use dashmap::DashMap;
use parking_lot::RwLock;
use std::sync::Arc;

use crate::error::{CrawlerError, Result};

use super::store::{
    FollowDelta, GraphStats, GraphStore, NodeDelta, NodeEvent, NodeId, NodeRecord, NodeStatus,
};

struct NodeMeta {
    status: NodeStatus,
    pagerank: f64,
    records: Vec<NodeEvent>,
}

/// In-memory graph store.
///
/// Pubkeys are interned through the index map's `Arc<str>` keys; node
/// columns are parallel vectors indexed by id. Mutations acquire the
/// write locks of every column they touch before changing any of them,
/// so a reader holding any single column lock observes either the pre-
/// or the post-state of a delta. Lock order is always id_to_pubkey,
/// meta, follows, followers.
pub struct MemoryGraphStore {
    pubkey_to_id: DashMap<Arc<str>, NodeId>,
    id_to_pubkey: RwLock<Vec<Arc<str>>>,
    meta: RwLock<Vec<NodeMeta>>,
    // Sorted Vec<NodeId> per node for cache-friendly iteration and
    // O(log n) membership checks.
    follows: RwLock<Vec<Vec<NodeId>>>,
    followers: RwLock<Vec<Vec<NodeId>>>,
}

impl MemoryGraphStore {
    #[allow(dead_code)] // test-side backend; production uses SQLite
    pub fn new() -> Self {
        Self {
            pubkey_to_id: DashMap::new(),
            id_to_pubkey: RwLock::new(Vec::new()),
            meta: RwLock::new(Vec::new()),
            follows: RwLock::new(Vec::new()),
            followers: RwLock::new(Vec::new()),
        }
    }

    fn edges_for(
        ids: &[NodeId],
        lists: &[Vec<NodeId>],
    ) -> Result<Vec<Vec<NodeId>>> {
        ids.iter()
            .map(|&id| {
                lists
                    .get(id as usize)
                    .cloned()
                    .ok_or(CrawlerError::NodeNotFound(id))
            })
            .collect()
    }
}

impl Default for MemoryGraphStore {
    fn default() -> Self {
        Self::new()
    }
}

impl GraphStore for MemoryGraphStore {
    fn add_node(&self, pubkey: &str) -> Result<NodeId> {
        if self.pubkey_to_id.contains_key(pubkey) {
            return Err(CrawlerError::NodeAlreadyPresent(pubkey.to_string()));
        }

        let mut id_to_pubkey = self.id_to_pubkey.write();
        let mut meta = self.meta.write();
        let mut follows = self.follows.write();
        let mut followers = self.followers.write();

        // Double-check after acquiring the write locks.
        if self.pubkey_to_id.contains_key(pubkey) {
            return Err(CrawlerError::NodeAlreadyPresent(pubkey.to_string()));
        }

        let interned: Arc<str> = Arc::from(pubkey);
        let id = id_to_pubkey.len() as NodeId;
        id_to_pubkey.push(interned.clone());
        meta.push(NodeMeta {
            status: NodeStatus::Inactive,
            pagerank: 0.0,
            records: Vec::new(),
        });
        follows.push(Vec::new());
        followers.push(Vec::new());
        self.pubkey_to_id.insert(interned, id);

        Ok(id)
    }

    fn node_by_id(&self, id: NodeId) -> Result<NodeRecord> {
        let id_to_pubkey = self.id_to_pubkey.read();
        let meta = self.meta.read();
        let pubkey = id_to_pubkey
            .get(id as usize)
            .cloned()
            .ok_or(CrawlerError::NodeNotFound(id))?;
        let m = meta.get(id as usize).ok_or(CrawlerError::NodeNotFound(id))?;
        Ok(NodeRecord {
            id,
            pubkey,
            status: m.status,
            pagerank: m.pagerank,
            records: m.records.clone(),
        })
    }

    fn node_by_key(&self, pubkey: &str) -> Result<NodeRecord> {
        let id = self
            .pubkey_to_id
            .get(pubkey)
            .map(|r| *r)
            .ok_or_else(|| CrawlerError::PubkeyNotFound(pubkey.to_string()))?;
        self.node_by_id(id)
    }

    fn node_ids(&self, pubkeys: &[String]) -> Result<Vec<Option<NodeId>>> {
        Ok(pubkeys
            .iter()
            .map(|pk| self.pubkey_to_id.get(pk.as_str()).map(|r| *r))
            .collect())
    }

    fn pubkeys(&self, ids: &[NodeId]) -> Result<Vec<Option<Arc<str>>>> {
        let id_to_pubkey = self.id_to_pubkey.read();
        Ok(ids
            .iter()
            .map(|&id| id_to_pubkey.get(id as usize).cloned())
            .collect())
    }

    fn follows(&self, ids: &[NodeId]) -> Result<Vec<Vec<NodeId>>> {
        let follows = self.follows.read();
        Self::edges_for(ids, &follows)
    }

    fn followers(&self, ids: &[NodeId]) -> Result<Vec<Vec<NodeId>>> {
        let followers = self.followers.read();
        Self::edges_for(ids, &followers)
    }

    fn update(&self, id: NodeId, delta: &NodeDelta) -> Result<bool> {
        match delta {
            NodeDelta::Promotion { at } => {
                let mut meta = self.meta.write();
                let m = meta
                    .get_mut(id as usize)
                    .ok_or(CrawlerError::NodeNotFound(id))?;
                m.status = NodeStatus::Active;
                m.records.push(NodeEvent::Promotion { created_at: *at });
                Ok(true)
            }
            NodeDelta::Demotion { at } => {
                let mut meta = self.meta.write();
                let m = meta
                    .get_mut(id as usize)
                    .ok_or(CrawlerError::NodeNotFound(id))?;
                m.status = NodeStatus::Inactive;
                m.records.push(NodeEvent::Demotion { created_at: *at });
                Ok(true)
            }
            NodeDelta::FollowList(delta) => self.apply_follow_delta(id, delta),
        }
    }

    fn scan_nodes(&self, cursor: u64, limit: usize) -> Result<(Vec<NodeId>, u64)> {
        let len = self.id_to_pubkey.read().len() as u64;
        let start = cursor.min(len);
        let batch = limit.max(1) as u64;
        let end = (start + batch).min(len);
        let ids: Vec<NodeId> = (start..end).map(|i| i as NodeId).collect();
        let next = if end >= len { 0 } else { end };
        Ok((ids, next))
    }

    fn set_pagerank(&self, ranks: &[(NodeId, f64)]) -> Result<()> {
        let mut meta = self.meta.write();
        if let Some(&(id, _)) = ranks.iter().find(|(id, _)| *id as usize >= meta.len()) {
            return Err(CrawlerError::NodeNotFound(id));
        }
        for &(id, score) in ranks {
            meta[id as usize].pagerank = score;
        }
        Ok(())
    }

    fn size(&self) -> Result<usize> {
        Ok(self.id_to_pubkey.read().len())
    }

    fn stats(&self) -> Result<GraphStats> {
        let meta = self.meta.read();
        let follows = self.follows.read();
        Ok(GraphStats {
            node_count: meta.len(),
            edge_count: follows.iter().map(|l| l.len()).sum(),
            active_count: meta
                .iter()
                .filter(|m| m.status == NodeStatus::Active)
                .count(),
        })
    }
}

impl MemoryGraphStore {
    fn apply_follow_delta(&self, id: NodeId, delta: &FollowDelta) -> Result<bool> {
        let mut meta = self.meta.write();
        let mut follows = self.follows.write();
        let mut followers = self.followers.write();

        let m = meta
            .get_mut(id as usize)
            .ok_or(CrawlerError::NodeNotFound(id))?;

        // Reject stale events before touching any edge.
        let latest = m
            .records
            .iter()
            .filter_map(|r| match r {
                NodeEvent::Follow { created_at, .. } => Some(*created_at),
                _ => None,
            })
            .max();
        if latest.is_some_and(|ts| delta.created_at < ts) {
            return Ok(false);
        }

        let node_count = follows.len() as NodeId;
        for &target in delta.added.iter().chain(delta.removed.iter()) {
            if target >= node_count {
                return Err(CrawlerError::NodeNotFound(target));
            }
        }

        for &removed in &delta.removed {
            let follow_list = &mut follows[id as usize];
            if let Ok(pos) = follow_list.binary_search(&removed) {
                follow_list.remove(pos);
            }
            let follower_list = &mut followers[removed as usize];
            if let Ok(pos) = follower_list.binary_search(&id) {
                follower_list.remove(pos);
            }
        }

        for &added in &delta.added {
            if added == id {
                continue;
            }
            let follow_list = &mut follows[id as usize];
            if let Err(pos) = follow_list.binary_search(&added) {
                follow_list.insert(pos, added);
            }
            let follower_list = &mut followers[added as usize];
            if let Err(pos) = follower_list.binary_search(&id) {
                follower_list.insert(pos, id);
            }
        }

        m.records.push(NodeEvent::Follow {
            event_id: delta.event_id.clone(),
            created_at: delta.created_at,
        });

        Ok(true)
    }
}
