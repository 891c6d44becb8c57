use std::{sync::Arc, time::Duration};

use super::ipam::Ipam;

/// Periodically drops tombstones older than the grace period from every network.
pub struct GarbageCollector {
    interval: Duration,
    grace: Duration,
    ipam: Arc<Ipam>,
}

impl GarbageCollector {
    pub fn new(interval: Duration, grace: Duration, ipam: Arc<Ipam>) -> GarbageCollector {
        GarbageCollector {
            interval,
            grace,
            ipam,
        }
    }

    #[tracing::instrument(skip_all)]
    pub async fn run(&mut self) {
        let mut ticker = tokio::time::interval(self.interval);

        loop {
            ticker.tick().await;
            self.collect();
        }
    }

    /// One collection pass. Returns the number of purged tombstones.
    pub fn collect(&self) -> usize {
        let _measure = self.ipam.metrics().measure_gc();
        let mut total = 0;
        for ctx in self.ipam.networks() {
            match ctx.purge_tombstones(self.grace) {
                Ok(0) => {}
                Ok(purged) => {
                    tracing::info!(network = ctx.name(), purged, "Purge tombstones");
                    self.ipam.metrics().gc_purged(ctx.name(), purged);
                    total += purged;
                }
                Err(e) => {
                    tracing::warn!(network = ctx.name(), error = %e, "Failed to purge tombstones")
                }
            }
        }
        total
    }
}
