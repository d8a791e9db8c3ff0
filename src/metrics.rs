use std::sync::Arc;

use prometheus::{Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};

/// Hooks the saver calls as requests complete.
///
/// Implementations must be cheap; they run on the save path.
pub trait SaveMetrics: Send + Sync {
    fn save_committed(&self, bytes: u64);
    fn dedup_hit(&self);
    fn names_probed(&self, probes: u32);
    fn save_failed(&self, kind: &'static str);
}

/// No-op metrics collector (default)
#[derive(Debug, Clone, Default)]
pub struct NoOpMetrics;

impl SaveMetrics for NoOpMetrics {
    fn save_committed(&self, _bytes: u64) {}
    fn dedup_hit(&self) {}
    fn names_probed(&self, _probes: u32) {}
    fn save_failed(&self, _kind: &'static str) {}
}

/// Shared reference to a metrics collector
#[derive(Clone)]
pub struct SharedMetrics(Arc<dyn SaveMetrics>);

impl SharedMetrics {
    pub fn new(collector: Arc<dyn SaveMetrics>) -> Self {
        Self(collector)
    }

    pub fn save_committed(&self, bytes: u64) {
        self.0.save_committed(bytes);
    }

    pub fn dedup_hit(&self) {
        self.0.dedup_hit();
    }

    pub fn names_probed(&self, probes: u32) {
        self.0.names_probed(probes);
    }

    pub fn save_failed(&self, kind: &'static str) {
        self.0.save_failed(kind);
    }
}

impl Default for SharedMetrics {
    fn default() -> Self {
        Self(Arc::new(NoOpMetrics))
    }
}

impl std::fmt::Debug for SharedMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SharedMetrics")
    }
}

/// Prometheus-backed collector with its own registry.
#[derive(Clone)]
pub struct PrometheusMetrics {
    registry: Registry,
    saves_total: IntCounter,
    bytes_written_total: IntCounter,
    dedup_hits_total: IntCounter,
    failures_total: IntCounterVec,
    probes: Histogram,
}

impl PrometheusMetrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let saves_total = IntCounter::new("smart_save_saves_total", "Images saved")?;
        let bytes_written_total = IntCounter::new(
            "smart_save_bytes_written_total",
            "Bytes written to new files",
        )?;
        let dedup_hits_total = IntCounter::new(
            "smart_save_dedup_hits_total",
            "Saves answered from already stored content",
        )?;
        let failures_total = IntCounterVec::new(
            Opts::new("smart_save_failures_total", "Failed saves by error kind"),
            &["kind"],
        )?;
        let probes = Histogram::with_opts(
            HistogramOpts::new(
                "smart_save_name_probes",
                "Candidate names probed per allocation",
            )
            .buckets(vec![1.0, 2.0, 5.0, 10.0, 100.0, 1000.0, 10000.0]),
        )?;

        registry.register(Box::new(saves_total.clone()))?;
        registry.register(Box::new(bytes_written_total.clone()))?;
        registry.register(Box::new(dedup_hits_total.clone()))?;
        registry.register(Box::new(failures_total.clone()))?;
        registry.register(Box::new(probes.clone()))?;

        Ok(Self {
            registry,
            saves_total,
            bytes_written_total,
            dedup_hits_total,
            failures_total,
            probes,
        })
    }

    /// Current values in the Prometheus text exposition format.
    pub fn gather_text(&self) -> anyhow::Result<String> {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }

    pub fn saves(&self) -> u64 {
        self.saves_total.get()
    }

    pub fn dedup_hits(&self) -> u64 {
        self.dedup_hits_total.get()
    }
}

impl SaveMetrics for PrometheusMetrics {
    fn save_committed(&self, bytes: u64) {
        self.saves_total.inc();
        self.bytes_written_total.inc_by(bytes);
    }

    fn dedup_hit(&self) {
        self.dedup_hits_total.inc();
    }

    fn names_probed(&self, probes: u32) {
        self.probes.observe(f64::from(probes));
    }

    fn save_failed(&self, kind: &'static str) {
        self.failures_total.with_label_values(&[kind]).inc();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prometheus_counters() {
        let metrics = PrometheusMetrics::new().unwrap();
        let shared = SharedMetrics::new(Arc::new(metrics.clone()));
        shared.save_committed(10);
        shared.save_committed(5);
        shared.dedup_hit();
        shared.names_probed(3);
        shared.save_failed("write_failure");

        assert_eq!(metrics.saves(), 2);
        assert_eq!(metrics.dedup_hits(), 1);
        let text = metrics.gather_text().unwrap();
        assert!(text.contains("smart_save_bytes_written_total 15"));
        assert!(text.contains("smart_save_failures_total{kind=\"write_failure\"} 1"));
    }
}
