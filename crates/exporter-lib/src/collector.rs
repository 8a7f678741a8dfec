//! Collection engine
//!
//! Drives one collection cycle: discover compute processes, resolve
//! container and pod identity, join telemetry, update the store, mark
//! exits, evict expired records, attribute energy. Exactly one cycle
//! runs at a time; concurrent scrape triggers coalesce onto the cycle
//! already in flight.

use crate::attribution::AttributionEngine;
use crate::gpu::GpuDriver;
use crate::health::{components, HealthRegistry};
use crate::kube::PodResolver;
use crate::models::{EnergySource, PodIdentity, ProcessRecord};
use crate::observability::ExporterMetrics;
use crate::procfs::ProcFs;
use crate::retention::RetentionTracker;
use crate::store::MetricStore;
use crate::telemetry::TelemetrySource;
use anyhow::{Context, Result};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

pub struct CollectionEngine {
    driver: Arc<dyn GpuDriver>,
    telemetry: Arc<dyn TelemetrySource>,
    procfs: ProcFs,
    pods: Option<Arc<PodResolver>>,
    retention: Arc<RetentionTracker>,
    store: Arc<MetricStore>,
    attribution: AttributionEngine,
}

impl CollectionEngine {
    pub fn new(
        driver: Arc<dyn GpuDriver>,
        telemetry: Arc<dyn TelemetrySource>,
        procfs: ProcFs,
        pods: Option<Arc<PodResolver>>,
        retention: Arc<RetentionTracker>,
        store: Arc<MetricStore>,
        attribution: AttributionEngine,
    ) -> Self {
        Self {
            driver,
            telemetry,
            procfs,
            pods,
            retention,
            store,
            attribution,
        }
    }

    /// Run one collection cycle. Exit marking must precede eviction
    /// (freeze before discard) and attribution must follow exit marking
    /// so exited processes never receive estimated energy.
    pub async fn run_cycle(&mut self) -> Result<()> {
        debug!("Starting collection cycle");

        let processes = self
            .driver
            .list_compute_processes()
            .context("failed to list compute processes")?;
        debug!(count = processes.len(), "Discovered GPU processes");

        let mut seen: HashSet<u32> = HashSet::new();

        for process in processes {
            if !seen.insert(process.pid) {
                // A process occupying several GPUs is reported for the
                // first one only.
                debug!(
                    pid = process.pid,
                    gpu = process.gpu_index,
                    "PID already seen on another GPU, skipping"
                );
                continue;
            }

            let container_id = match self.procfs.container_id_of(process.pid).await {
                Ok(Some(container_id)) => container_id,
                Ok(None) => {
                    debug!(pid = process.pid, "Skipping non-containerized process");
                    continue;
                }
                Err(e) => {
                    // The process likely vanished between enumeration
                    // and resolution.
                    debug!(pid = process.pid, error = %e, "Failed to read cgroup");
                    continue;
                }
            };

            let identity = self
                .resolve_identity(process.pid, &container_id)
                .await
                .unwrap_or_default();

            let telemetry = match self.telemetry.process_telemetry(process.pid) {
                Ok(Some(telemetry)) => telemetry,
                Ok(None) => {
                    debug!(pid = process.pid, "No telemetry yet, deferring to next cycle");
                    continue;
                }
                Err(e) => {
                    warn!(pid = process.pid, error = %e, "Failed to fetch telemetry");
                    continue;
                }
            };

            // Per-process memory is not exposed through the sampler on
            // every GPU model; fall back to the driver's reading.
            let memory_used_bytes =
                if telemetry.memory_used_bytes == 0 && process.memory_used_bytes > 0 {
                    debug!(
                        pid = process.pid,
                        driver_memory_bytes = process.memory_used_bytes,
                        "Using driver memory fallback"
                    );
                    process.memory_used_bytes
                } else {
                    telemetry.memory_used_bytes
                };

            self.store.upsert(ProcessRecord {
                pid: process.pid,
                gpu_index: telemetry.gpu_index,
                process_name: telemetry.process_name.clone(),
                is_running: true,
                start_time: telemetry.start_time,
                end_time: None,
                sm_util: telemetry.sm_util,
                mem_util: telemetry.mem_util,
                memory_used_bytes,
                cumulative_energy_joules: 0.0,
                telemetry_energy_joules: telemetry.energy_consumed_joules,
                energy_source: EnergySource::Measured,
                container_id,
                pod_name: identity.pod_name,
                pod_namespace: identity.pod_namespace,
                container_name: identity.container_name,
            });

            debug!(pid = process.pid, "Collected metrics for process");
        }

        let now = chrono::Utc::now().timestamp();
        self.store.with_write(|records| {
            for (pid, record) in records.iter_mut() {
                if !seen.contains(pid) && !self.retention.is_exited(*pid) {
                    record.is_running = false;
                    record.end_time = Some(now);
                    self.retention.mark_exited(*pid);
                    info!(pid = *pid, pod = %record.pod_name, "Process exited");
                }
            }

            for pid in self.retention.exited_pids() {
                if self.retention.should_retain(pid) {
                    continue;
                }
                // Never evict a running record: the PID may have come
                // back inside the retention window.
                if records.get(&pid).map(|r| !r.is_running).unwrap_or(false) {
                    records.remove(&pid);
                    debug!(pid, "Removed metrics for expired process");
                }
            }
        });
        self.retention.cleanup_expired();

        let cycle_now = Instant::now();
        self.store.with_write(|records| {
            self.attribution
                .attribute(records, self.telemetry.as_ref(), cycle_now)
        });

        Ok(())
    }

    /// Resolve pod identity by container ID first, then by pod UID. A
    /// successful UID lookup is fed back into the container-id cache.
    async fn resolve_identity(&self, pid: u32, container_id: &str) -> Option<PodIdentity> {
        let pods = self.pods.as_ref()?;

        if let Some(identity) = pods.resolve(container_id).await {
            return Some(identity);
        }

        match self.procfs.pod_uid_of(pid).await {
            Ok(Some(pod_uid)) => {
                if let Some(identity) = pods.resolve_by_uid(&pod_uid).await {
                    pods.supply_mapping(container_id, identity.clone());
                    return Some(identity);
                }
                None
            }
            Ok(None) => None,
            Err(e) => {
                debug!(pid, error = %e, "Failed to read pod UID");
                None
            }
        }
    }
}

/// Serializes collection cycles and coalesces concurrent triggers: a
/// caller that finds a cycle in flight waits for it and serves that
/// cycle's result instead of starting another.
pub struct Collector {
    engine: tokio::sync::Mutex<CollectionEngine>,
    generation: AtomicU64,
    store: Arc<MetricStore>,
    retention: Arc<RetentionTracker>,
    health: HealthRegistry,
    metrics: ExporterMetrics,
}

impl Collector {
    pub fn new(
        engine: CollectionEngine,
        store: Arc<MetricStore>,
        retention: Arc<RetentionTracker>,
        health: HealthRegistry,
        metrics: ExporterMetrics,
    ) -> Self {
        Self {
            engine: tokio::sync::Mutex::new(engine),
            generation: AtomicU64::new(0),
            store,
            retention,
            health,
            metrics,
        }
    }

    pub fn store(&self) -> &Arc<MetricStore> {
        &self.store
    }

    /// Trigger a collection cycle, coalescing with any cycle already in
    /// flight.
    pub async fn collect(&self) -> Result<()> {
        let observed = self.generation.load(Ordering::SeqCst);
        let mut engine = self.engine.lock().await;
        if self.generation.load(Ordering::SeqCst) != observed {
            debug!("Coalesced with a collection cycle that finished while waiting");
            return Ok(());
        }

        let start = Instant::now();
        let result = engine.run_cycle().await;
        self.generation.fetch_add(1, Ordering::SeqCst);
        drop(engine);

        match &result {
            Ok(()) => {
                self.metrics.observe_cycle(start.elapsed().as_secs_f64());
                self.metrics
                    .set_tracked(self.store.len() as i64, self.retention.len() as i64);
                self.health.set_healthy(components::COLLECTOR).await;
            }
            Err(e) => {
                self.metrics.inc_cycle_errors();
                self.health
                    .set_degraded(components::COLLECTOR, e.to_string())
                    .await;
            }
        }

        result
    }

    /// Background loop providing a soft upper bound between cycles when
    /// no scrape arrives.
    pub async fn run_scan_loop(
        self: Arc<Self>,
        interval: Duration,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        info!(
            interval_secs = interval.as_secs(),
            "Starting background scan loop"
        );

        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.collect().await {
                        warn!(error = %e, "Background collection cycle failed");
                    }
                }
                _ = shutdown.recv() => {
                    info!("Shutting down collection loop");
                    break;
                }
            }
        }
    }
}
