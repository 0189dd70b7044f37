use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::sync::source::{FollowEvent, FollowSource};

/// Batch actor: accumulates pubkeys scheduled for crawling and fetches
/// their most recent follow lists, either when the batch fills or when
/// the flush timer fires. The timer is pushed on every flush attempt,
/// whether or not the fetched events fit in the queue.
pub struct PubkeyQuerier<S> {
    source: S,
    pubkeys: mpsc::Receiver<String>,
    events: mpsc::Sender<FollowEvent>,
    batch_size: usize,
    interval: Duration,
    cancel: CancellationToken,
}

impl<S: FollowSource> PubkeyQuerier<S> {
    pub fn new(
        source: S,
        pubkeys: mpsc::Receiver<String>,
        events: mpsc::Sender<FollowEvent>,
        batch_size: usize,
        interval: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            source,
            pubkeys,
            events,
            batch_size,
            interval,
            cancel,
        }
    }

    pub async fn run(mut self) {
        info!(
            "Pubkey querier started: batch size {}, interval {:?}",
            self.batch_size, self.interval
        );

        let mut batch: Vec<String> = Vec::with_capacity(self.batch_size);
        let timer = tokio::time::sleep(self.interval);
        tokio::pin!(timer);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                maybe = self.pubkeys.recv() => match maybe {
                    Some(pubkey) => {
                        if !batch.contains(&pubkey) {
                            batch.push(pubkey);
                        }
                        if batch.len() >= self.batch_size {
                            self.flush(&mut batch).await;
                            timer.as_mut().reset(tokio::time::Instant::now() + self.interval);
                        }
                    }
                    None => break,
                },
                () = &mut timer => {
                    self.flush(&mut batch).await;
                    timer.as_mut().reset(tokio::time::Instant::now() + self.interval);
                }
            }
        }

        // Final flush so enqueued pubkeys are not lost on shutdown.
        self.flush(&mut batch).await;
        info!("Pubkey querier stopped");
    }

    async fn flush(&self, batch: &mut Vec<String>) {
        if batch.is_empty() {
            return;
        }
        debug!("Fetching latest follow lists for {} pubkeys", batch.len());

        match self.source.latest(batch).await {
            Ok(events) => {
                for event in events {
                    if let Err(e) = self.events.try_send(event) {
                        warn!("Event queue full, dropping fetched follow list: {}", e);
                    }
                }
            }
            Err(e) => warn!("Follow-list fetch failed: {}", e),
        }
        batch.clear();
    }
}
