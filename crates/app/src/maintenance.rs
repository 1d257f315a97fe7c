use std::{sync::Arc, time::Duration};

use metrics::counter;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info};
use workfinder_storage::MemoryCache;

/// Background worker that purges expired entries from the in-process cache.
///
/// Expired entries already read as absent; sweeping only bounds memory.
#[derive(Clone)]
pub struct CacheSweeper {
    cache: Arc<MemoryCache>,
    interval: Duration,
}

impl CacheSweeper {
    pub fn new(cache: Arc<MemoryCache>, interval: Duration) -> Self {
        Self { cache, interval }
    }

    /// Runs the sweeper loop in the background.
    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            self.run_loop().await;
        })
    }

    async fn run_loop(self) {
        info!(stage = "cache", interval_secs = self.interval.as_secs(), "cache sweeper started");
        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            self.run_once().await;
        }
    }

    /// Executes one sweep and returns the number of purged entries.
    pub async fn run_once(&self) -> usize {
        let purged = self.cache.purge_expired().await;
        if purged > 0 {
            counter!("cache_swept_total").increment(purged as u64);
        }
        debug!(stage = "cache", purged, "cache sweep completed");
        purged
    }
}
