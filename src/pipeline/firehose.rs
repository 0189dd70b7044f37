use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::error::CrawlerError;
use crate::graph::store::{GraphStore, NodeStatus};
use crate::sync::source::{FollowEvent, FollowSource};

const SEEN_CACHE_CAPACITY: usize = 100_000;
const PROGRESS_LOG_INTERVAL: Duration = Duration::from_secs(10);

/// Live-event actor: filters the relay stream down to fresh follow
/// lists of known active authors and pushes them onto the event queue.
/// The queue is never blocked on; overflow drops the event, and the
/// pubkey querier re-fetches missed lists later.
pub struct Firehose<S> {
    source: S,
    graph: Arc<dyn GraphStore>,
    events: mpsc::Sender<FollowEvent>,
    cancel: CancellationToken,
}

#[derive(Default)]
struct FirehoseCounters {
    accepted: u64,
    skipped: u64,
    dropped: u64,
}

impl<S: FollowSource> Firehose<S> {
    pub fn new(
        source: S,
        graph: Arc<dyn GraphStore>,
        events: mpsc::Sender<FollowEvent>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            source,
            graph,
            events,
            cancel,
        }
    }

    pub async fn run(mut self) {
        info!("Firehose started");

        // LRU cache: author pubkey -> newest seen timestamp. Evicts
        // oldest entries when full, never clears entirely.
        let mut seen: LruCache<String, u64> = LruCache::new(
            NonZeroUsize::new(SEEN_CACHE_CAPACITY).unwrap(),
        );
        let mut counters = FirehoseCounters::default();
        let mut last_log = Instant::now();

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                next = self.source.next_event() => match next {
                    Ok(Some(event)) => {
                        self.handle(event, &mut seen, &mut counters);
                    }
                    Ok(None) => {
                        info!("Event source closed");
                        break;
                    }
                    Err(e) => {
                        error!("Event source error: {}", e);
                    }
                },
            }

            if last_log.elapsed() > PROGRESS_LOG_INTERVAL {
                info!(
                    "Firehose progress: {} accepted, {} skipped, {} dropped, seen_cache={}",
                    counters.accepted,
                    counters.skipped,
                    counters.dropped,
                    seen.len()
                );
                last_log = Instant::now();
            }
        }

        info!("Firehose stopped");
    }

    fn handle(
        &self,
        event: FollowEvent,
        seen: &mut LruCache<String, u64>,
        counters: &mut FirehoseCounters,
    ) {
        // Early dedup check before any store lookup: skip events
        // dominated by something we already accepted for this author.
        if seen
            .peek(&event.author)
            .is_some_and(|&ts| event.created_at <= ts)
        {
            counters.skipped += 1;
            return;
        }

        let author = match self.graph.node_by_key(&event.author) {
            Ok(node) => node,
            Err(CrawlerError::PubkeyNotFound(_)) => {
                counters.skipped += 1;
                return;
            }
            Err(e) => {
                warn!("Author lookup failed: {}", e);
                counters.dropped += 1;
                return;
            }
        };
        if author.status == NodeStatus::Inactive {
            counters.skipped += 1;
            return;
        }
        if author
            .latest_follow_at()
            .is_some_and(|ts| event.created_at <= ts)
        {
            counters.skipped += 1;
            return;
        }

        let author_key = event.author.clone();
        let created_at = event.created_at;
        match self.events.try_send(event) {
            Ok(()) => {
                // Mark seen only once the event is actually queued, so
                // a relay replay can retry after an overflow drop.
                seen.put(author_key, created_at);
                counters.accepted += 1;
            }
            Err(e) => {
                warn!("Event queue full, dropping event: {}", e);
                counters.dropped += 1;
            }
        }
    }
}
