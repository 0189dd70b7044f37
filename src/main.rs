mod cache;
mod config;
mod db;
mod error;
mod graph;
mod pipeline;
mod rank;
mod sync;
mod walks;

use anyhow::{bail, Context, Result};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use cache::RankCache;
use config::Config;
use db::{Database, SqliteGraphStore, SqliteWalkStore};
use error::CrawlerError;
use graph::store::{GraphStore, NodeDelta};
use pipeline::{EventProcessor, Firehose, NodeArbiter, PubkeyQuerier};
use rank::RankEstimator;
use sync::RelaySource;
use walks::engine::{WalkEngine, WalksChanged};
use walks::store::WalkStore;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("WoT Crawler v{} starting...", env!("CARGO_PKG_VERSION"));
    info!(
        "Tokio runtime: {} worker threads",
        std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
    );

    // Load and validate configuration
    let config = Config::from_env();
    let params = config.validate().context("invalid configuration")?;
    info!(
        "Configuration loaded: {} relays, database at {}, alpha {}, {} walks per node",
        config.relays.len(),
        config.db_path,
        params.alpha(),
        params.walks_per_node()
    );

    // Open the backend; graph and walk stores share one database.
    let database = Arc::new(Database::open(&config.db_path)?);
    let graph: Arc<dyn GraphStore> = Arc::new(SqliteGraphStore::new(database.clone()));
    let walk_store: Arc<dyn WalkStore> = Arc::new(SqliteWalkStore::new(database, params));

    let walks_changed = Arc::new(WalksChanged::new());
    let engine = Arc::new(WalkEngine::new(
        graph.clone(),
        walk_store.clone(),
        walks_changed.clone(),
    ));
    let ranks = Arc::new(RankEstimator::new(
        graph.clone(),
        walk_store.clone(),
        RankCache::new(config.cache_size, config.cache_ttl_secs),
    ));

    // Init mode: an empty backend is seeded and walked from scratch.
    let cold_start = graph.size()? == 0;
    if cold_start {
        if config.init_pubkeys.is_empty() {
            bail!("backend is empty and INIT_PUBKEYS is unset: {}", CrawlerError::EmptyStore);
        }
        info!(
            "Empty backend, seeding {} initial pubkeys",
            config.init_pubkeys.len()
        );
        let now = chrono::Utc::now().timestamp() as u64;
        for pubkey in &config.init_pubkeys {
            let id = graph
                .add_node(pubkey)
                .with_context(|| format!("seeding {pubkey}"))?;
            graph.update(id, &NodeDelta::Promotion { at: now })?;
        }
        let mut rng = StdRng::from_os_rng();
        engine
            .generate_all(&mut rng)
            .context("initial walk generation")?;
    }

    let stats = graph.stats()?;
    info!(
        "Graph loaded: {} nodes, {} edges, {} active, {} walk visits",
        stats.node_count,
        stats.edge_count,
        stats.active_count,
        walk_store.total_visits()?
    );

    // Queues and cancellation
    let (event_tx, event_rx) = mpsc::channel(config.event_queue_capacity);
    let (pubkey_tx, pubkey_rx) = mpsc::channel(config.pubkey_queue_capacity);
    let cancel = CancellationToken::new();

    // Connect to relays; firehose and querier share the pool.
    let source = RelaySource::connect(&config.relays)
        .await
        .context("connecting to relays")?;

    let firehose = Firehose::new(
        source.clone(),
        graph.clone(),
        event_tx.clone(),
        cancel.clone(),
    );
    let firehose_handle = tokio::spawn(firehose.run());

    let querier = PubkeyQuerier::new(
        source,
        pubkey_rx,
        event_tx,
        config.query_batch_size,
        config.query_interval,
        cancel.clone(),
    );
    let querier_handle = tokio::spawn(querier.run());

    let processor = EventProcessor::new(
        graph.clone(),
        engine.clone(),
        event_rx,
        cancel.clone(),
        StdRng::from_os_rng(),
    );
    let processor_handle = tokio::spawn(processor.run());

    let arbiter = NodeArbiter::new(
        graph.clone(),
        walk_store.clone(),
        engine,
        ranks,
        walks_changed,
        pubkey_tx.clone(),
        config.arbiter_interval,
        config.arbiter_start_threshold,
        config.promotion_multiplier,
        config.demotion_multiplier,
        cancel.clone(),
        StdRng::from_os_rng(),
    );
    let arbiter_handle = tokio::spawn(arbiter.run());

    // Freshly seeded nodes get crawled right away.
    if cold_start {
        for pubkey in &config.init_pubkeys {
            if let Err(e) = pubkey_tx.try_send(pubkey.clone()) {
                warn!("Pubkey queue full while seeding: {}", e);
            }
        }
    }

    // Wait for shutdown
    let actors = async {
        let _ = firehose_handle.await;
        let _ = querier_handle.await;
        let _ = processor_handle.await;
        let _ = arbiter_handle.await;
    };
    tokio::pin!(actors);

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal, shutting down...");
            cancel.cancel();
            drop(pubkey_tx);
            if tokio::time::timeout(SHUTDOWN_GRACE, &mut actors).await.is_err() {
                warn!("Actors did not drain within {:?}", SHUTDOWN_GRACE);
            }
        }
        _ = &mut actors => {
            error!("Pipeline terminated unexpectedly");
        }
    }

    info!("Shutdown complete");
    Ok(())
}
