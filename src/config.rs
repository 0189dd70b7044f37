use anyhow::{bail, Result};
use std::env;
use std::time::Duration;

use crate::walks::store::{WalkParams, DEFAULT_ALPHA, DEFAULT_WALKS_PER_NODE};

#[derive(Debug, Clone)]
pub struct Config {
    pub relays: Vec<String>,
    pub db_path: String,
    pub event_queue_capacity: usize,
    pub pubkey_queue_capacity: usize,
    pub query_batch_size: usize,
    pub query_interval: Duration,
    pub arbiter_interval: Duration,
    pub arbiter_start_threshold: f64,
    pub promotion_multiplier: f64,
    pub demotion_multiplier: f64,
    pub alpha: f64,
    pub walks_per_node: usize,
    pub init_pubkeys: Vec<String>,
    pub cache_size: usize,
    pub cache_ttl_secs: u64,
}

fn parse_var<T: std::str::FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn parse_list(name: &str, default: &str) -> Vec<String> {
    env::var(name)
        .unwrap_or_else(|_| default.into())
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            relays: parse_list(
                "RELAYS",
                "wss://relay.damus.io,wss://nos.lol,wss://relay.nostr.band",
            ),
            db_path: env::var("DB_PATH").unwrap_or_else(|_| "crawler.db".into()),
            event_queue_capacity: parse_var("EVENT_QUEUE_CAPACITY", 1000),
            pubkey_queue_capacity: parse_var("PUBKEY_QUEUE_CAPACITY", 1000),
            query_batch_size: parse_var("QUERY_BATCH_SIZE", 50),
            query_interval: Duration::from_secs(parse_var("QUERY_INTERVAL_SECS", 10)),
            arbiter_interval: Duration::from_secs(parse_var("ARBITER_INTERVAL_SECS", 10)),
            arbiter_start_threshold: parse_var("ARBITER_START_THRESHOLD", 0.05),
            promotion_multiplier: parse_var("PROMOTION_MULTIPLIER", 1.0),
            demotion_multiplier: parse_var("DEMOTION_MULTIPLIER", 0.1),
            alpha: parse_var("ALPHA", DEFAULT_ALPHA),
            walks_per_node: parse_var("WALKS_PER_NODE", DEFAULT_WALKS_PER_NODE),
            init_pubkeys: parse_list("INIT_PUBKEYS", ""),
            cache_size: parse_var("CACHE_SIZE", 10000),
            cache_ttl_secs: parse_var("CACHE_TTL_SECS", 300),
        }
    }

    /// Checks every recognized option and returns the validated walk
    /// parameters. Called once at startup; failures are fatal.
    pub fn validate(&self) -> Result<WalkParams> {
        let params = WalkParams::new(self.alpha, self.walks_per_node)?;
        if self.event_queue_capacity == 0 || self.pubkey_queue_capacity == 0 {
            bail!("queue capacities must be positive");
        }
        if self.query_batch_size == 0 {
            bail!("query-batch-size must be positive");
        }
        if !(self.arbiter_start_threshold > 0.0 && self.arbiter_start_threshold <= 1.0) {
            bail!(
                "arbiter-start-threshold must be in (0, 1], got {}",
                self.arbiter_start_threshold
            );
        }
        if self.promotion_multiplier < 0.0 || self.demotion_multiplier < 0.0 {
            bail!("promotion and demotion multipliers must be non-negative");
        }
        Ok(params)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            relays: Vec::new(),
            db_path: "crawler.db".into(),
            event_queue_capacity: 1000,
            pubkey_queue_capacity: 1000,
            query_batch_size: 50,
            query_interval: Duration::from_secs(10),
            arbiter_interval: Duration::from_secs(10),
            arbiter_start_threshold: 0.05,
            promotion_multiplier: 1.0,
            demotion_multiplier: 0.1,
            alpha: DEFAULT_ALPHA,
            walks_per_node: DEFAULT_WALKS_PER_NODE,
            init_pubkeys: Vec::new(),
            cache_size: 10000,
            cache_ttl_secs: 300,
        }
    }
}
