use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use std::path::Path;
use std::sync::Arc;
use tracing::info;

use crate::error::{CrawlerError, Result};
use crate::graph::store::{
    FollowDelta, GraphStats, GraphStore, NodeDelta, NodeEvent, NodeId, NodeRecord, NodeStatus,
};

/// Shared SQLite handle. Three conceptual tables back the whole system:
/// node records, edge sets, and walks with their visit index. Every
/// multi-key mutation runs in one transaction.
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path)?;

        // WAL for concurrent readers while the writer holds the lock.
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        let db = Self {
            conn: Mutex::new(conn),
        };
        db.init_schema()?;
        Ok(db)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS nodes (
                id INTEGER PRIMARY KEY,
                pubkey TEXT NOT NULL UNIQUE,
                status TEXT NOT NULL DEFAULT 'inactive',
                pagerank REAL NOT NULL DEFAULT 0,
                updated_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_nodes_pubkey ON nodes(pubkey);

            CREATE TABLE IF NOT EXISTS node_records (
                node_id INTEGER NOT NULL,
                kind TEXT NOT NULL,
                event_id TEXT,
                created_at INTEGER NOT NULL,
                FOREIGN KEY (node_id) REFERENCES nodes(id)
            );

            CREATE INDEX IF NOT EXISTS idx_records_node ON node_records(node_id);

            CREATE TABLE IF NOT EXISTS edges (
                follower_id INTEGER NOT NULL,
                followed_id INTEGER NOT NULL,
                PRIMARY KEY (follower_id, followed_id),
                FOREIGN KEY (follower_id) REFERENCES nodes(id),
                FOREIGN KEY (followed_id) REFERENCES nodes(id)
            );

            CREATE INDEX IF NOT EXISTS idx_edges_follower ON edges(follower_id);
            CREATE INDEX IF NOT EXISTS idx_edges_followed ON edges(followed_id);

            CREATE TABLE IF NOT EXISTS walks (
                id INTEGER PRIMARY KEY,
                nodes TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS visits (
                node_id INTEGER NOT NULL,
                walk_id INTEGER NOT NULL,
                PRIMARY KEY (node_id, walk_id)
            ) WITHOUT ROWID;

            CREATE INDEX IF NOT EXISTS idx_visits_walk ON visits(walk_id);

            CREATE TABLE IF NOT EXISTS meta (
                key TEXT PRIMARY KEY,
                value INTEGER NOT NULL
            );
        "#,
        )?;

        info!("Database schema initialized");
        Ok(())
    }

    pub(crate) fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self.conn.lock();
        f(&conn)
    }

    pub(crate) fn with_tx<T>(&self, f: impl FnOnce(&Transaction<'_>) -> Result<T>) -> Result<T> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let out = f(&tx)?;
        tx.commit()?;
        Ok(out)
    }

    /// Monotonic id counters live in the meta table so ids are never
    /// reused, even for walks that have been removed.
    pub(crate) fn take_ids(tx: &Transaction<'_>, key: &str, count: u64) -> Result<u32> {
        tx.execute(
            "INSERT OR IGNORE INTO meta (key, value) VALUES (?1, 0)",
            params![key],
        )?;
        let next: u64 = tx.query_row(
            "SELECT value FROM meta WHERE key = ?1",
            params![key],
            |row| row.get(0),
        )?;
        tx.execute(
            "UPDATE meta SET value = value + ?2 WHERE key = ?1",
            params![key, count],
        )?;
        Ok(next as u32)
    }
}

/// Persistent graph store over a shared [`Database`].
pub struct SqliteGraphStore {
    db: Arc<Database>,
}

impl SqliteGraphStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    fn node_row(conn: &Connection, id: NodeId) -> Result<NodeRecord> {
        let row = conn
            .query_row(
                "SELECT pubkey, status, pagerank FROM nodes WHERE id = ?1",
                params![id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, f64>(2)?,
                    ))
                },
            )
            .optional()?;
        let (pubkey, status, pagerank) = row.ok_or(CrawlerError::NodeNotFound(id))?;
        let status = NodeStatus::parse(&status).ok_or_else(|| {
            CrawlerError::Backend(format!("unknown node status {status:?}").into())
        })?;

        let mut stmt = conn.prepare_cached(
            "SELECT kind, event_id, created_at FROM node_records WHERE node_id = ?1 ORDER BY rowid",
        )?;
        let records = stmt
            .query_map(params![id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, Option<String>>(1)?,
                    row.get::<_, i64>(2)?,
                ))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let records = records
            .into_iter()
            .map(|(kind, event_id, created_at)| {
                let created_at = created_at as u64;
                match kind.as_str() {
                    "follow" => Ok(NodeEvent::Follow {
                        event_id: event_id.unwrap_or_default(),
                        created_at,
                    }),
                    "promotion" => Ok(NodeEvent::Promotion { created_at }),
                    "demotion" => Ok(NodeEvent::Demotion { created_at }),
                    other => Err(CrawlerError::Backend(
                        format!("unknown record kind {other:?}").into(),
                    )),
                }
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(NodeRecord {
            id,
            pubkey: pubkey.into(),
            status,
            pagerank,
            records,
        })
    }

    fn id_by_pubkey(conn: &Connection, pubkey: &str) -> Result<Option<NodeId>> {
        Ok(conn
            .query_row(
                "SELECT id FROM nodes WHERE pubkey = ?1",
                params![pubkey],
                |row| row.get::<_, u32>(0),
            )
            .optional()?)
    }

    fn require_node(conn: &Connection, id: NodeId) -> Result<()> {
        let exists: Option<u32> = conn
            .query_row("SELECT 1 FROM nodes WHERE id = ?1", params![id], |row| {
                row.get(0)
            })
            .optional()?;
        exists.map(|_| ()).ok_or(CrawlerError::NodeNotFound(id))
    }

    fn edge_list(conn: &Connection, ids: &[NodeId], sql: &str) -> Result<Vec<Vec<NodeId>>> {
        let mut stmt = conn.prepare_cached(sql)?;
        let mut out = Vec::with_capacity(ids.len());
        for &id in ids {
            Self::require_node(conn, id)?;
            let list = stmt
                .query_map(params![id], |row| row.get::<_, u32>(0))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            out.push(list);
        }
        Ok(out)
    }

    fn apply_follow_delta(tx: &Transaction<'_>, id: NodeId, delta: &FollowDelta) -> Result<bool> {
        Self::require_node(tx, id)?;

        let latest: Option<i64> = tx.query_row(
            "SELECT MAX(created_at) FROM node_records WHERE node_id = ?1 AND kind = 'follow'",
            params![id],
            |row| row.get(0),
        )?;
        if latest.is_some_and(|ts| (delta.created_at as i64) < ts) {
            return Ok(false);
        }

        for &target in delta.added.iter().chain(delta.removed.iter()) {
            Self::require_node(tx, target)?;
        }

        {
            let mut remove_stmt = tx.prepare_cached(
                "DELETE FROM edges WHERE follower_id = ?1 AND followed_id = ?2",
            )?;
            for &removed in &delta.removed {
                remove_stmt.execute(params![id, removed])?;
            }

            let mut add_stmt = tx.prepare_cached(
                "INSERT OR IGNORE INTO edges (follower_id, followed_id) VALUES (?1, ?2)",
            )?;
            for &added in &delta.added {
                if added == id {
                    continue;
                }
                add_stmt.execute(params![id, added])?;
            }
        }

        tx.execute(
            "INSERT INTO node_records (node_id, kind, event_id, created_at) VALUES (?1, 'follow', ?2, ?3)",
            params![id, delta.event_id, delta.created_at as i64],
        )?;
        tx.execute(
            "UPDATE nodes SET updated_at = ?2 WHERE id = ?1",
            params![id, chrono::Utc::now().timestamp()],
        )?;

        Ok(true)
    }

    fn apply_status(
        tx: &Transaction<'_>,
        id: NodeId,
        status: NodeStatus,
        kind: &str,
        at: u64,
    ) -> Result<bool> {
        Self::require_node(tx, id)?;
        tx.execute(
            "UPDATE nodes SET status = ?2, updated_at = ?3 WHERE id = ?1",
            params![id, status.as_str(), chrono::Utc::now().timestamp()],
        )?;
        tx.execute(
            "INSERT INTO node_records (node_id, kind, event_id, created_at) VALUES (?1, ?2, NULL, ?3)",
            params![id, kind, at as i64],
        )?;
        Ok(true)
    }
}

impl GraphStore for SqliteGraphStore {
    fn add_node(&self, pubkey: &str) -> Result<NodeId> {
        self.db.with_tx(|tx| {
            if Self::id_by_pubkey(tx, pubkey)?.is_some() {
                return Err(CrawlerError::NodeAlreadyPresent(pubkey.to_string()));
            }
            let id = Database::take_ids(tx, "next_node_id", 1)?;
            tx.execute(
                "INSERT INTO nodes (id, pubkey, status, pagerank, updated_at) VALUES (?1, ?2, 'inactive', 0, ?3)",
                params![id, pubkey, chrono::Utc::now().timestamp()],
            )?;
            Ok(id)
        })
    }

    fn node_by_id(&self, id: NodeId) -> Result<NodeRecord> {
        self.db.with_conn(|conn| Self::node_row(conn, id))
    }

    fn node_by_key(&self, pubkey: &str) -> Result<NodeRecord> {
        self.db.with_conn(|conn| {
            let id = Self::id_by_pubkey(conn, pubkey)?
                .ok_or_else(|| CrawlerError::PubkeyNotFound(pubkey.to_string()))?;
            Self::node_row(conn, id)
        })
    }

    fn node_ids(&self, pubkeys: &[String]) -> Result<Vec<Option<NodeId>>> {
        self.db.with_conn(|conn| {
            pubkeys
                .iter()
                .map(|pk| Self::id_by_pubkey(conn, pk))
                .collect()
        })
    }

    fn pubkeys(&self, ids: &[NodeId]) -> Result<Vec<Option<Arc<str>>>> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare_cached("SELECT pubkey FROM nodes WHERE id = ?1")?;
            ids.iter()
                .map(|&id| {
                    Ok(stmt
                        .query_row(params![id], |row| row.get::<_, String>(0))
                        .optional()?
                        .map(Arc::from))
                })
                .collect()
        })
    }

    fn follows(&self, ids: &[NodeId]) -> Result<Vec<Vec<NodeId>>> {
        self.db.with_conn(|conn| {
            Self::edge_list(
                conn,
                ids,
                "SELECT followed_id FROM edges WHERE follower_id = ?1 ORDER BY followed_id",
            )
        })
    }

    fn followers(&self, ids: &[NodeId]) -> Result<Vec<Vec<NodeId>>> {
        self.db.with_conn(|conn| {
            Self::edge_list(
                conn,
                ids,
                "SELECT follower_id FROM edges WHERE followed_id = ?1 ORDER BY follower_id",
            )
        })
    }

    fn update(&self, id: NodeId, delta: &NodeDelta) -> Result<bool> {
        self.db.with_tx(|tx| match delta {
            NodeDelta::Promotion { at } => {
                Self::apply_status(tx, id, NodeStatus::Active, "promotion", *at)
            }
            NodeDelta::Demotion { at } => {
                Self::apply_status(tx, id, NodeStatus::Inactive, "demotion", *at)
            }
            NodeDelta::FollowList(delta) => Self::apply_follow_delta(tx, id, delta),
        })
    }

    fn scan_nodes(&self, cursor: u64, limit: usize) -> Result<(Vec<NodeId>, u64)> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT id FROM nodes WHERE id >= ?1 ORDER BY id LIMIT ?2",
            )?;
            let batch = limit.max(1);
            let ids = stmt
                .query_map(params![cursor, batch as i64], |row| row.get::<_, u32>(0))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            let next = match ids.last() {
                Some(&last) if ids.len() == batch => last as u64 + 1,
                _ => 0,
            };
            Ok((ids, next))
        })
    }

    fn set_pagerank(&self, ranks: &[(NodeId, f64)]) -> Result<()> {
        self.db.with_tx(|tx| {
            for &(id, _) in ranks {
                Self::require_node(tx, id)?;
            }
            let mut stmt = tx.prepare_cached("UPDATE nodes SET pagerank = ?2 WHERE id = ?1")?;
            for &(id, score) in ranks {
                stmt.execute(params![id, score])?;
            }
            Ok(())
        })
    }

    fn size(&self) -> Result<usize> {
        self.db.with_conn(|conn| {
            Ok(conn.query_row("SELECT COUNT(*) FROM nodes", [], |row| row.get::<_, i64>(0))? as usize)
        })
    }

    fn stats(&self) -> Result<GraphStats> {
        self.db.with_conn(|conn| {
            let node_count =
                conn.query_row("SELECT COUNT(*) FROM nodes", [], |row| row.get::<_, i64>(0))?;
            let edge_count =
                conn.query_row("SELECT COUNT(*) FROM edges", [], |row| row.get::<_, i64>(0))?;
            let active_count = conn.query_row(
                "SELECT COUNT(*) FROM nodes WHERE status = 'active'",
                [],
                |row| row.get::<_, i64>(0),
            )?;
            Ok(GraphStats {
                node_count: node_count as usize,
                edge_count: edge_count as usize,
                active_count: active_count as usize,
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn open_store() -> (NamedTempFile, SqliteGraphStore) {
        let file = NamedTempFile::new().unwrap();
        let db = Arc::new(Database::open(file.path()).unwrap());
        (file, SqliteGraphStore::new(db))
    }

    fn follow_delta(created_at: u64, removed: Vec<NodeId>, added: Vec<NodeId>) -> NodeDelta {
        NodeDelta::FollowList(FollowDelta {
            event_id: format!("ev-{created_at}"),
            created_at,
            removed,
            added,
        })
    }

    #[test]
    fn test_add_node_and_lookup() {
        let (_file, store) = open_store();
        let alice = store.add_node("alice").unwrap();
        let bob = store.add_node("bob").unwrap();
        assert_eq!(alice, 0);
        assert_eq!(bob, 1);

        let node = store.node_by_key("alice").unwrap();
        assert_eq!(node.id, alice);
        assert_eq!(node.status, NodeStatus::Inactive);
        assert_eq!(node.pagerank, 0.0);

        assert!(matches!(
            store.add_node("alice"),
            Err(CrawlerError::NodeAlreadyPresent(_))
        ));
        assert!(matches!(
            store.node_by_id(9),
            Err(CrawlerError::NodeNotFound(9))
        ));
    }

    #[test]
    fn test_follow_delta_symmetric_and_stale_rejected() {
        let (_file, store) = open_store();
        let alice = store.add_node("alice").unwrap();
        let bob = store.add_node("bob").unwrap();
        let carol = store.add_node("carol").unwrap();

        assert!(store
            .update(alice, &follow_delta(2000, vec![], vec![bob, carol]))
            .unwrap());
        assert_eq!(store.follows(&[alice]).unwrap()[0], vec![bob, carol]);
        assert_eq!(store.followers(&[bob]).unwrap()[0], vec![alice]);

        // Older event is rejected without touching edges or records.
        assert!(!store
            .update(alice, &follow_delta(1000, vec![bob], vec![]))
            .unwrap());
        assert_eq!(store.follows(&[alice]).unwrap()[0], vec![bob, carol]);
        assert_eq!(store.node_by_id(alice).unwrap().records.len(), 1);

        // Newer event applies.
        assert!(store
            .update(alice, &follow_delta(3000, vec![bob], vec![]))
            .unwrap());
        assert_eq!(store.follows(&[alice]).unwrap()[0], vec![carol]);
        assert!(store.followers(&[bob]).unwrap()[0].is_empty());
    }

    #[test]
    fn test_follow_delta_unknown_target_rolls_back() {
        let (_file, store) = open_store();
        let alice = store.add_node("alice").unwrap();
        let bob = store.add_node("bob").unwrap();

        let result = store.update(alice, &follow_delta(1000, vec![], vec![bob, 42]));
        assert!(matches!(result, Err(CrawlerError::NodeNotFound(42))));
        assert!(store.follows(&[alice]).unwrap()[0].is_empty());
        assert!(store.node_by_id(alice).unwrap().records.is_empty());
    }

    #[test]
    fn test_promotion_demotion_records() {
        let (_file, store) = open_store();
        let alice = store.add_node("alice").unwrap();

        store
            .update(alice, &NodeDelta::Promotion { at: 100 })
            .unwrap();
        assert_eq!(store.node_by_id(alice).unwrap().status, NodeStatus::Active);

        store.update(alice, &NodeDelta::Demotion { at: 200 }).unwrap();
        let node = store.node_by_id(alice).unwrap();
        assert_eq!(node.status, NodeStatus::Inactive);
        assert_eq!(
            node.records,
            vec![
                NodeEvent::Promotion { created_at: 100 },
                NodeEvent::Demotion { created_at: 200 },
            ]
        );
    }

    #[test]
    fn test_scan_nodes_cycle() {
        let (_file, store) = open_store();
        for i in 0..7 {
            store.add_node(&format!("pk{i}")).unwrap();
        }
        let mut seen = Vec::new();
        let mut cursor = 0;
        loop {
            let (ids, next) = store.scan_nodes(cursor, 3).unwrap();
            seen.extend(ids);
            cursor = next;
            if cursor == 0 {
                break;
            }
        }
        assert_eq!(seen, (0..7).collect::<Vec<NodeId>>());
    }

    #[test]
    fn test_set_pagerank_all_or_nothing() {
        let (_file, store) = open_store();
        let a = store.add_node("a").unwrap();

        store.set_pagerank(&[(a, 0.4)]).unwrap();
        assert_eq!(store.node_by_id(a).unwrap().pagerank, 0.4);

        assert!(matches!(
            store.set_pagerank(&[(a, 0.9), (5, 0.1)]),
            Err(CrawlerError::NodeNotFound(5))
        ));
        assert_eq!(store.node_by_id(a).unwrap().pagerank, 0.4);
    }

    #[test]
    fn test_state_survives_reopen() {
        let file = NamedTempFile::new().unwrap();
        {
            let db = Arc::new(Database::open(file.path()).unwrap());
            let store = SqliteGraphStore::new(db);
            let alice = store.add_node("alice").unwrap();
            let bob = store.add_node("bob").unwrap();
            store
                .update(alice, &follow_delta(1000, vec![], vec![bob]))
                .unwrap();
            store
                .update(alice, &NodeDelta::Promotion { at: 1100 })
                .unwrap();
        }

        let db = Arc::new(Database::open(file.path()).unwrap());
        let store = SqliteGraphStore::new(db);
        let alice = store.node_by_key("alice").unwrap();
        assert_eq!(alice.status, NodeStatus::Active);
        assert_eq!(alice.latest_follow_at(), Some(1000));
        assert_eq!(store.follows(&[alice.id]).unwrap()[0], vec![1]);
        // The id counter continues where it left off.
        assert_eq!(store.add_node("carol").unwrap(), 2);
    }

    #[test]
    fn test_stats() {
        let (_file, store) = open_store();
        let a = store.add_node("a").unwrap();
        let b = store.add_node("b").unwrap();
        store
            .update(a, &follow_delta(1000, vec![], vec![b]))
            .unwrap();
        store.update(a, &NodeDelta::Promotion { at: 1 }).unwrap();

        let stats = store.stats().unwrap();
        assert_eq!(stats.node_count, 2);
        assert_eq!(stats.edge_count, 1);
        assert_eq!(stats.active_count, 1);
    }
}
