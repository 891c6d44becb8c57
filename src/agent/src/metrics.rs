use prometheus::{histogram_opts, opts, HistogramVec, IntCounterVec, Registry};
use tokio::time::Instant;

#[derive(Debug, Clone)]
pub struct AgentMetrics {
    pub ipam_call: IntCounterVec,
    pub ipam_errors: IntCounterVec,
    pub gc_purged: IntCounterVec,
    pub gc_duration: HistogramVec,
}

impl AgentMetrics {
    pub fn new() -> Result<AgentMetrics, prometheus::Error> {
        let ipam_call = IntCounterVec::new(
            opts!("podipam_agent_ipam_call_total", "Total count of IPAM call"),
            &["method", "network"],
        )?;
        let ipam_errors = IntCounterVec::new(
            opts!(
                "podipam_agent_ipam_call_errors_total",
                "Total count of IPAM call error"
            ),
            &["method", "network", "code"],
        )?;
        let gc_purged = IntCounterVec::new(
            opts!(
                "podipam_agent_gc_purged_total",
                "Total count of tombstones purged by the garbage collector"
            ),
            &["network"],
        )?;
        let gc_duration = HistogramVec::new(
            histogram_opts!(
                "podipam_agent_gc_duration_seconds",
                "The duration of one garbage collection in seconds"
            )
            .buckets(vec![0.001, 0.01, 0.1, 0.5, 1., 5.]),
            &[],
        )?;
        Ok(AgentMetrics {
            ipam_call,
            ipam_errors,
            gc_purged,
            gc_duration,
        })
    }

    pub fn register(self, registry: &Registry) -> Result<Self, prometheus::Error> {
        registry.register(Box::new(self.ipam_call.clone()))?;
        registry.register(Box::new(self.ipam_errors.clone()))?;
        registry.register(Box::new(self.gc_purged.clone()))?;
        registry.register(Box::new(self.gc_duration.clone()))?;
        Ok(self)
    }

    pub fn ipam_call(&self, method: &str, network: &str) {
        self.ipam_call.with_label_values(&[method, network]).inc()
    }

    pub fn ipam_error(&self, method: &str, network: &str, code: &str) {
        self.ipam_errors
            .with_label_values(&[method, network, code])
            .inc()
    }

    pub fn gc_purged(&self, network: &str, count: usize) {
        self.gc_purged
            .with_label_values(&[network])
            .inc_by(count as u64)
    }

    pub fn measure_gc(&self) -> GcMeasurer {
        GcMeasurer {
            start: Instant::now(),
            metric: self.gc_duration.clone(),
        }
    }
}

pub struct GcMeasurer {
    start: Instant,
    metric: HistogramVec,
}

impl Drop for GcMeasurer {
    fn drop(&mut self) {
        let duration = self.start.elapsed().as_millis() as f64 / 1000.0;
        self.metric.with_label_values(&[]).observe(duration);
    }
}
