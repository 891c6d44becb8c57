use prometheus::{histogram_opts, opts, HistogramVec, IntCounterVec, IntGaugeVec, Registry};
use tokio::time::Instant;

use super::config::PoolConfig;

const POOL_LABELS: &[&str] = &["pool", "capacity", "max_idle", "min_idle"];

#[derive(Debug, Clone)]
pub struct PoolMetrics {
    pub idle: IntGaugeVec,
    pub total: IntGaugeVec,
    pub in_flight: IntGaugeVec,
    pub disposed: IntCounterVec,
    pub cloud_errors: IntCounterVec,
    pub reconcile_duration: HistogramVec,
}

impl PoolMetrics {
    pub fn new() -> Result<PoolMetrics, prometheus::Error> {
        let idle = IntGaugeVec::new(
            opts!("podipam_pool_idle", "Number of idle resources in the pool"),
            POOL_LABELS,
        )?;
        let total = IntGaugeVec::new(
            opts!(
                "podipam_pool_total",
                "Number of resources held by the pool in any state"
            ),
            POOL_LABELS,
        )?;
        let in_flight = IntGaugeVec::new(
            opts!(
                "podipam_pool_in_flight",
                "Number of resources requested from the cloud and not yet delivered"
            ),
            POOL_LABELS,
        )?;
        let disposed = IntCounterVec::new(
            opts!(
                "podipam_pool_disposed_total",
                "Total count of resources released back to the cloud"
            ),
            &["pool"],
        )?;
        let cloud_errors = IntCounterVec::new(
            opts!(
                "podipam_pool_cloud_errors_total",
                "Total count of failed cloud calls"
            ),
            &["pool", "op", "reason"],
        )?;
        let reconcile_duration = HistogramVec::new(
            histogram_opts!(
                "podipam_pool_reconcile_duration_seconds",
                "The duration of one reconcile tick in seconds"
            )
            .buckets(vec![0.01, 0.1, 0.25, 0.5, 1., 5., 15., 60.]),
            &["pool"],
        )?;
        Ok(PoolMetrics {
            idle,
            total,
            in_flight,
            disposed,
            cloud_errors,
            reconcile_duration,
        })
    }

    pub fn register(self, registry: &Registry) -> Result<Self, prometheus::Error> {
        registry.register(Box::new(self.idle.clone()))?;
        registry.register(Box::new(self.total.clone()))?;
        registry.register(Box::new(self.in_flight.clone()))?;
        registry.register(Box::new(self.disposed.clone()))?;
        registry.register(Box::new(self.cloud_errors.clone()))?;
        registry.register(Box::new(self.reconcile_duration.clone()))?;
        Ok(self)
    }
}

/// Metric handles bound to one pool's labels.
#[derive(Debug, Clone)]
pub(crate) struct PoolRecorder {
    metrics: PoolMetrics,
    name: String,
    labels: [String; 4],
}

impl PoolRecorder {
    pub(crate) fn new(metrics: PoolMetrics, name: &str, config: &PoolConfig) -> PoolRecorder {
        PoolRecorder {
            metrics,
            name: name.to_string(),
            labels: [
                name.to_string(),
                config.capacity.to_string(),
                config.max_idle.to_string(),
                config.min_idle.to_string(),
            ],
        }
    }

    fn pool_labels(&self) -> [&str; 4] {
        [
            &self.labels[0],
            &self.labels[1],
            &self.labels[2],
            &self.labels[3],
        ]
    }

    pub(crate) fn set_sizes(&self, idle: usize, total: usize, in_flight: usize) {
        let labels = self.pool_labels();
        self.metrics.idle.with_label_values(&labels).set(idle as i64);
        self.metrics.total.with_label_values(&labels).set(total as i64);
        self.metrics
            .in_flight
            .with_label_values(&labels)
            .set(in_flight as i64);
    }

    pub(crate) fn disposed(&self, count: usize) {
        self.metrics
            .disposed
            .with_label_values(&[&self.name])
            .inc_by(count as u64);
    }

    pub(crate) fn cloud_error(&self, op: &str, reason: &str) {
        self.metrics
            .cloud_errors
            .with_label_values(&[&self.name, op, reason])
            .inc();
    }

    pub(crate) fn measure_reconcile(&self) -> ReconcileMeasurer {
        ReconcileMeasurer {
            start: Instant::now(),
            metric: self.metrics.reconcile_duration.clone(),
            name: self.name.clone(),
        }
    }
}

/// Observes the elapsed time into the reconcile histogram when dropped.
pub(crate) struct ReconcileMeasurer {
    start: Instant,
    metric: HistogramVec,
    name: String,
}

impl Drop for ReconcileMeasurer {
    fn drop(&mut self) {
        #[allow(clippy::cast_precision_loss)]
        let duration = self.start.elapsed().as_millis() as f64 / 1000.0;
        self.metric.with_label_values(&[&self.name]).observe(duration);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn works_register() {
        let registry = Registry::new();
        let metrics = PoolMetrics::new().unwrap().register(&registry).unwrap();
        let recorder = PoolRecorder::new(metrics, "eni", &PoolConfig::default());
        recorder.set_sizes(1, 3, 2);
        recorder.cloud_error("assign", "timeout");

        let families = registry.gather();
        let idle = families
            .iter()
            .find(|f| f.get_name() == "podipam_pool_idle")
            .unwrap();
        assert_eq!(idle.get_metric()[0].get_gauge().get_value(), 1.0);
        assert!(families
            .iter()
            .any(|f| f.get_name() == "podipam_pool_cloud_errors_total"));
    }

    #[test]
    fn fails_double_register() {
        let registry = Registry::new();
        let metrics = PoolMetrics::new().unwrap();
        let metrics = metrics.register(&registry).unwrap();
        assert!(metrics.register(&registry).is_err());
    }
}
