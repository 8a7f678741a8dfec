//! Exporter-internal metrics
//!
//! Prometheus metrics about the exporter itself, registered once in the
//! default registry and appended to every scrape response.

use prometheus::{
    register_histogram, register_int_counter, register_int_gauge, Histogram, IntCounter, IntGauge,
};
use std::sync::OnceLock;

/// Buckets sized for collection cycles, which include blocking driver
/// calls and an optional orchestrator round trip.
const CYCLE_LATENCY_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

static GLOBAL_METRICS: OnceLock<ExporterMetricsInner> = OnceLock::new();

struct ExporterMetricsInner {
    collection_cycles_total: IntCounter,
    collection_errors_total: IntCounter,
    collection_latency_seconds: Histogram,
    processes_tracked: IntGauge,
    exited_processes_retained: IntGauge,
}

impl ExporterMetricsInner {
    fn new() -> Self {
        Self {
            collection_cycles_total: register_int_counter!(
                "gpu_exporter_collection_cycles_total",
                "Total number of completed collection cycles"
            )
            .expect("Failed to register collection_cycles_total"),

            collection_errors_total: register_int_counter!(
                "gpu_exporter_collection_errors_total",
                "Total number of failed collection cycles"
            )
            .expect("Failed to register collection_errors_total"),

            collection_latency_seconds: register_histogram!(
                "gpu_exporter_collection_latency_seconds",
                "Time spent running one collection cycle",
                CYCLE_LATENCY_BUCKETS.to_vec()
            )
            .expect("Failed to register collection_latency_seconds"),

            processes_tracked: register_int_gauge!(
                "gpu_exporter_processes_tracked",
                "Number of process records currently in the store"
            )
            .expect("Failed to register processes_tracked"),

            exited_processes_retained: register_int_gauge!(
                "gpu_exporter_exited_processes_retained",
                "Number of exited processes inside the retention window"
            )
            .expect("Failed to register exited_processes_retained"),
        }
    }
}

/// Lightweight handle to the global metrics instance. Clones share the
/// same underlying metrics.
#[derive(Clone)]
pub struct ExporterMetrics {
    _private: (),
}

impl Default for ExporterMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl ExporterMetrics {
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(ExporterMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &ExporterMetricsInner {
        GLOBAL_METRICS.get().expect("Metrics not initialized")
    }

    pub fn observe_cycle(&self, duration_secs: f64) {
        self.inner().collection_cycles_total.inc();
        self.inner().collection_latency_seconds.observe(duration_secs);
    }

    pub fn inc_cycle_errors(&self) {
        self.inner().collection_errors_total.inc();
    }

    pub fn set_tracked(&self, processes: i64, exited_retained: i64) {
        self.inner().processes_tracked.set(processes);
        self.inner().exited_processes_retained.set(exited_retained);
    }
}
