//! Snapshot rendering into the Prometheus text format
//!
//! Every scrape builds a fresh registry from the store snapshot, so
//! series for evicted records disappear on their own. The
//! exporter-internal metrics from the default registry are appended to
//! the same response.

use crate::models::ProcessRecord;
use anyhow::Result;
use prometheus::{CounterVec, Encoder, GaugeVec, IntGaugeVec, Opts, Registry, TextEncoder};
use std::collections::HashMap;

const PROCESS_LABELS: [&str; 7] = [
    "pid",
    "gpu",
    "process_name",
    "pod",
    "namespace",
    "container",
    "container_id",
];

const ENERGY_LABELS: [&str; 8] = [
    "pid",
    "gpu",
    "process_name",
    "pod",
    "namespace",
    "container",
    "container_id",
    "energy_estimated",
];

pub fn render(prefix: &str, snapshot: &HashMap<u32, ProcessRecord>) -> Result<String> {
    let registry = Registry::new();

    let energy = CounterVec::new(
        Opts::new(
            format!("{prefix}_energy_joules_total"),
            "Cumulative energy consumed by the process in joules",
        ),
        &ENERGY_LABELS,
    )?;
    let sm_util = GaugeVec::new(
        Opts::new(
            format!("{prefix}_sm_utilization_ratio"),
            "SM (compute) utilization ratio (0.0-1.0)",
        ),
        &PROCESS_LABELS,
    )?;
    let mem_util = GaugeVec::new(
        Opts::new(
            format!("{prefix}_memory_utilization_ratio"),
            "Memory bandwidth utilization ratio (0.0-1.0)",
        ),
        &PROCESS_LABELS,
    )?;
    let memory_used = GaugeVec::new(
        Opts::new(
            format!("{prefix}_memory_used_bytes"),
            "GPU memory used by the process in bytes",
        ),
        &PROCESS_LABELS,
    )?;
    let start_time = GaugeVec::new(
        Opts::new(
            format!("{prefix}_start_time_seconds"),
            "Process start time in seconds since the Unix epoch",
        ),
        &PROCESS_LABELS,
    )?;
    let active = GaugeVec::new(
        Opts::new(
            format!("{prefix}_active"),
            "Process state (1 running, 0 exited but retained)",
        ),
        &PROCESS_LABELS,
    )?;
    let gpu_energy = CounterVec::new(
        Opts::new(
            format!("{prefix}_gpu_energy_joules_total"),
            "Sum of per-process energy counters on this GPU in joules",
        ),
        &["gpu"],
    )?;
    let gpu_process_count = IntGaugeVec::new(
        Opts::new(
            format!("{prefix}_gpu_process_count"),
            "Number of running processes on this GPU",
        ),
        &["gpu"],
    )?;

    registry.register(Box::new(energy.clone()))?;
    registry.register(Box::new(sm_util.clone()))?;
    registry.register(Box::new(mem_util.clone()))?;
    registry.register(Box::new(memory_used.clone()))?;
    registry.register(Box::new(start_time.clone()))?;
    registry.register(Box::new(active.clone()))?;
    registry.register(Box::new(gpu_energy.clone()))?;
    registry.register(Box::new(gpu_process_count.clone()))?;

    for record in snapshot.values() {
        let pid = record.pid.to_string();
        let gpu = record.gpu_index.to_string();
        let labels = [
            pid.as_str(),
            gpu.as_str(),
            record.process_name.as_str(),
            record.pod_name.as_str(),
            record.pod_namespace.as_str(),
            record.container_name.as_str(),
            record.container_id.as_str(),
        ];
        let energy_labels = [
            pid.as_str(),
            gpu.as_str(),
            record.process_name.as_str(),
            record.pod_name.as_str(),
            record.pod_namespace.as_str(),
            record.container_name.as_str(),
            record.container_id.as_str(),
            record.energy_source.as_label(),
        ];

        energy
            .with_label_values(&energy_labels)
            .inc_by(record.cumulative_energy_joules);
        sm_util.with_label_values(&labels).set(record.sm_util);
        mem_util.with_label_values(&labels).set(record.mem_util);
        memory_used
            .with_label_values(&labels)
            .set(record.memory_used_bytes as f64);
        start_time
            .with_label_values(&labels)
            .set(record.start_time as f64);
        active
            .with_label_values(&labels)
            .set(if record.is_running { 1.0 } else { 0.0 });

        gpu_energy
            .with_label_values(&[gpu.as_str()])
            .inc_by(record.cumulative_energy_joules);
        gpu_process_count
            .with_label_values(&[gpu.as_str()])
            .add(i64::from(record.is_running));
    }

    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder.encode(&registry.gather(), &mut buffer)?;
    encoder.encode(&prometheus::gather(), &mut buffer)?;

    Ok(String::from_utf8(buffer)?)
}
