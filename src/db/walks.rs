use rusqlite::{params, Connection, OptionalExtension};
use rustc_hash::FxHashSet;
use std::sync::Arc;

use crate::error::{CrawlerError, Result};
use crate::graph::store::NodeId;
use crate::walks::store::{RandomWalk, WalkId, WalkParams, WalkStore};

use super::sqlite::Database;

/// Persistent walk store over a shared [`Database`]. Walk payloads are
/// JSON arrays of node ids; the visit index is its own table so both
/// directions of the walk/visit mapping are queryable. Prune-graft is
/// one transaction, so readers never see a walk disagree with the
/// index.
pub struct SqliteWalkStore {
    db: Arc<Database>,
    params: WalkParams,
}

impl SqliteWalkStore {
    pub fn new(db: Arc<Database>, params: WalkParams) -> Self {
        Self { db, params }
    }

    fn walk_row(conn: &Connection, id: WalkId) -> Result<RandomWalk> {
        let payload: Option<String> = conn
            .query_row(
                "SELECT nodes FROM walks WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?;
        let payload = payload.ok_or(CrawlerError::WalkNotFound(id))?;
        let nodes: Vec<NodeId> = serde_json::from_str(&payload)?;
        RandomWalk::new(nodes)
    }

    fn insert_visits(conn: &Connection, walk_id: WalkId, nodes: &[NodeId]) -> Result<()> {
        let mut stmt = conn
            .prepare_cached("INSERT OR IGNORE INTO visits (node_id, walk_id) VALUES (?1, ?2)")?;
        for &node in nodes {
            stmt.execute(params![node, walk_id])?;
        }
        Ok(())
    }
}

impl WalkStore for SqliteWalkStore {
    fn alpha(&self) -> f64 {
        self.params.alpha()
    }

    fn walks_per_node(&self) -> usize {
        self.params.walks_per_node()
    }

    fn total_visits(&self) -> Result<u64> {
        self.db.with_conn(|conn| {
            Ok(conn.query_row("SELECT COUNT(*) FROM visits", [], |row| {
                row.get::<_, i64>(0)
            })? as u64)
        })
    }

    fn visit_counts(&self, ids: &[NodeId]) -> Result<Vec<u64>> {
        self.db.with_conn(|conn| {
            let mut stmt =
                conn.prepare_cached("SELECT COUNT(*) FROM visits WHERE node_id = ?1")?;
            ids.iter()
                .map(|&id| Ok(stmt.query_row(params![id], |row| row.get::<_, i64>(0))? as u64))
                .collect()
        })
    }

    fn walks_visiting(&self, limit: i64, ids: &[NodeId]) -> Result<Vec<WalkId>> {
        if limit == 0 || ids.is_empty() {
            return Ok(Vec::new());
        }
        self.db.with_conn(|conn| {
            let per_node = if limit < 0 {
                i64::MAX
            } else {
                limit.div_euclid(ids.len() as i64)
                    + if limit % ids.len() as i64 != 0 { 1 } else { 0 }
            };
            let cap = if limit < 0 { usize::MAX } else { limit as usize };

            let mut stmt = conn
                .prepare_cached("SELECT walk_id FROM visits WHERE node_id = ?1 LIMIT ?2")?;
            let mut seen = FxHashSet::default();
            let mut out = Vec::new();
            for &id in ids {
                let walk_ids = stmt
                    .query_map(params![id, per_node], |row| row.get::<_, u32>(0))?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                for walk_id in walk_ids {
                    if seen.insert(walk_id) {
                        out.push(walk_id);
                        if out.len() >= cap {
                            return Ok(out);
                        }
                    }
                }
            }
            Ok(out)
        })
    }

    fn walks_visiting_all(&self, ids: &[NodeId]) -> Result<Vec<WalkId>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut unique = ids.to_vec();
        unique.sort_unstable();
        unique.dedup();

        self.db.with_conn(|conn| {
            let placeholders = vec!["?"; unique.len()].join(",");
            let sql = format!(
                "SELECT walk_id FROM visits WHERE node_id IN ({placeholders}) \
                 GROUP BY walk_id HAVING COUNT(*) = {} ORDER BY walk_id",
                unique.len()
            );
            let mut stmt = conn.prepare(&sql)?;
            let params_vec: Vec<&dyn rusqlite::ToSql> =
                unique.iter().map(|id| id as &dyn rusqlite::ToSql).collect();
            let out = stmt
                .query_map(params_vec.as_slice(), |row| row.get::<_, u32>(0))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(out)
        })
    }

    fn walks(&self, ids: &[WalkId]) -> Result<Vec<RandomWalk>> {
        self.db
            .with_conn(|conn| ids.iter().map(|&id| Self::walk_row(conn, id)).collect())
    }

    fn add_walks(&self, walks: &[RandomWalk]) -> Result<Vec<WalkId>> {
        if walks.is_empty() {
            return Ok(Vec::new());
        }
        self.db.with_tx(|tx| {
            let first = Database::take_ids(tx, "next_walk_id", walks.len() as u64)?;
            let mut insert_walk =
                tx.prepare_cached("INSERT INTO walks (id, nodes) VALUES (?1, ?2)")?;
            let mut ids = Vec::with_capacity(walks.len());
            for (offset, walk) in walks.iter().enumerate() {
                let id = first + offset as WalkId;
                insert_walk.execute(params![id, serde_json::to_string(walk.nodes())?])?;
                Self::insert_visits(tx, id, walk.nodes())?;
                ids.push(id);
            }
            Ok(ids)
        })
    }

    fn remove_walks(&self, ids: &[WalkId]) -> Result<()> {
        self.db.with_tx(|tx| {
            for &id in ids {
                let exists: Option<u32> = tx
                    .query_row("SELECT 1 FROM walks WHERE id = ?1", params![id], |row| {
                        row.get(0)
                    })
                    .optional()?;
                if exists.is_none() {
                    return Err(CrawlerError::WalkNotFound(id));
                }
            }
            let mut delete_walk = tx.prepare_cached("DELETE FROM walks WHERE id = ?1")?;
            let mut delete_visits = tx.prepare_cached("DELETE FROM visits WHERE walk_id = ?1")?;
            for &id in ids {
                delete_walk.execute(params![id])?;
                delete_visits.execute(params![id])?;
            }
            Ok(())
        })
    }

    fn prune_graft(&self, id: WalkId, cut: usize, segment: &[NodeId]) -> Result<()> {
        self.db.with_tx(|tx| {
            let old = Self::walk_row(tx, id)?;
            if cut > old.len() {
                return Err(CrawlerError::InvalidWalkIndex {
                    index: cut,
                    len: old.len(),
                });
            }

            let old_nodes = old.into_nodes();
            let mut new_nodes = old_nodes[..cut].to_vec();
            new_nodes.extend_from_slice(segment);
            let new_walk = RandomWalk::new(new_nodes)?;

            let old_set: FxHashSet<NodeId> = old_nodes.iter().copied().collect();
            let new_set: FxHashSet<NodeId> = new_walk.nodes().iter().copied().collect();

            {
                let mut delete_visit = tx.prepare_cached(
                    "DELETE FROM visits WHERE node_id = ?1 AND walk_id = ?2",
                )?;
                for node in old_set.difference(&new_set) {
                    delete_visit.execute(params![node, id])?;
                }
            }
            let grafted: Vec<NodeId> = new_set.difference(&old_set).copied().collect();
            Self::insert_visits(tx, id, &grafted)?;

            tx.execute(
                "UPDATE walks SET nodes = ?2 WHERE id = ?1",
                params![id, serde_json::to_string(new_walk.nodes())?],
            )?;
            Ok(())
        })
    }
}
