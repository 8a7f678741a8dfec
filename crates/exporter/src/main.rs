//! GPU process energy exporter
//!
//! Attributes GPU energy consumption to containerized workloads and
//! publishes per-process counters in the Prometheus text format.

mod api;
mod config;

use anyhow::{Context, Result};
use clap::Parser;
use exporter_lib::attribution::AttributionEngine;
use exporter_lib::collector::{CollectionEngine, Collector};
use exporter_lib::gpu::{self, GpuDriver, NvmlDriver};
use exporter_lib::health::{components, HealthRegistry};
use exporter_lib::kube::PodResolver;
use exporter_lib::observability::ExporterMetrics;
use exporter_lib::procfs::ProcFs;
use exporter_lib::retention::RetentionTracker;
use exporter_lib::store::MetricStore;
use exporter_lib::telemetry::{NvmlTelemetry, TelemetrySource};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const SHUTDOWN_WINDOW: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<()> {
    let config = config::Config::parse();

    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.log_level.as_filter())),
        )
        .with(fmt::layer().json())
        .init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        listen_address = %config.listen_address,
        metrics_path = %config.metrics_path,
        "Starting gpu-energy-exporter"
    );
    info!(
        scan_interval = ?config.process_scan_interval,
        retention = ?config.metric_retention,
        orchestrator_enabled = config.orchestrator_enabled,
        energy_estimation = config.enable_energy_estimation,
        "Configuration loaded"
    );

    let health = HealthRegistry::new();
    health.register(components::GPU_DRIVER).await;
    health.register(components::TELEMETRY).await;
    health.register(components::POD_RESOLVER).await;
    health.register(components::COLLECTOR).await;
    let metrics = ExporterMetrics::new();

    // Startup runs in stages: driver first, then telemetry watching. A
    // failure tears down what came before, in reverse order.
    let nvml = gpu::init().context("failed to initialize the GPU driver")?;
    let driver: Arc<dyn GpuDriver> = Arc::new(NvmlDriver::new(nvml.clone()));

    let telemetry = Arc::new(NvmlTelemetry::new(nvml, config.telemetry_update_frequency));
    if let Err(e) = telemetry.start_watching().await {
        driver.shutdown();
        return Err(e).context("failed to start telemetry watching");
    }

    let pods = if config.orchestrator_enabled {
        if config.orchestrator_socket_path.exists() {
            info!("Orchestrator integration enabled");
            Some(Arc::new(PodResolver::new(&config.orchestrator_socket_path)))
        } else {
            warn!(
                socket = %config.orchestrator_socket_path.display(),
                "Pod-resources socket not found, disabling orchestrator integration"
            );
            health
                .set_degraded(components::POD_RESOLVER, "pod-resources socket not found")
                .await;
            None
        }
    } else {
        None
    };

    let store = Arc::new(MetricStore::new());
    let retention = Arc::new(RetentionTracker::new(config.metric_retention));
    let attribution = AttributionEngine::new(
        config.enable_energy_estimation,
        config.gpu_idle_power_watts,
        config.process_scan_interval,
    );
    let engine = CollectionEngine::new(
        driver.clone(),
        telemetry.clone() as Arc<dyn TelemetrySource>,
        ProcFs::new(),
        pods,
        retention.clone(),
        store.clone(),
        attribution,
    );
    let collector = Arc::new(Collector::new(
        engine,
        store,
        retention,
        health.clone(),
        metrics,
    ));
    health.set_ready(true).await;

    let (shutdown_tx, _) = broadcast::channel(1);
    let scan_task = tokio::spawn(
        collector
            .clone()
            .run_scan_loop(config.process_scan_interval, shutdown_tx.subscribe()),
    );

    let state = Arc::new(api::AppState {
        collector,
        health,
        metric_prefix: config.metric_prefix.clone(),
        metrics_path: config.metrics_route(),
    });

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .context("failed to install SIGTERM handler")?;
    let shutdown = async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
        info!("Received shutdown signal");
    };

    api::serve(&config.bind_address(), state, shutdown).await?;

    // Reverse order of startup: the server is down, stop collection,
    // then telemetry, then the driver.
    let _ = shutdown_tx.send(());
    if tokio::time::timeout(SHUTDOWN_WINDOW, scan_task).await.is_err() {
        warn!("Collection loop did not stop inside the shutdown window");
    }
    telemetry.shutdown();
    driver.shutdown();
    info!("Exporter stopped");

    Ok(())
}
