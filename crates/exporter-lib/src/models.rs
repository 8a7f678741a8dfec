//! Core data models for the exporter

use serde::{Deserialize, Serialize};

/// Where a record's cumulative energy counter comes from.
///
/// `Measured` means the value was adopted from the telemetry library
/// verbatim. `Estimated` means the attribution engine redistributed
/// interval energy because the GPU was shared. The transition
/// Measured -> Estimated latches for the lifetime of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnergySource {
    Measured,
    Estimated,
}

impl EnergySource {
    /// Value for the `energy_estimated` metric label.
    pub fn as_label(&self) -> &'static str {
        match self {
            EnergySource::Measured => "false",
            EnergySource::Estimated => "true",
        }
    }
}

/// One compute context as reported by the GPU driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GpuProcess {
    pub pid: u32,
    pub gpu_index: u32,
    pub memory_used_bytes: u64,
}

/// Per-process counters from the telemetry sampler.
///
/// `energy_consumed_joules` is the device-level energy integrated over
/// the process's lifetime window. On a shared GPU every co-resident
/// process reports the same aggregate value; the attribution engine is
/// responsible for correcting that.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessTelemetry {
    pub pid: u32,
    pub gpu_index: u32,
    pub process_name: String,
    /// SM utilization ratio, 0.0 to 1.0.
    pub sm_util: f64,
    /// Memory bandwidth utilization ratio, 0.0 to 1.0.
    pub mem_util: f64,
    pub memory_used_bytes: u64,
    pub energy_consumed_joules: f64,
    /// Unix seconds of the first sample for this process.
    pub start_time: i64,
    /// Unix seconds of the last sample, set once the process is gone.
    pub end_time: Option<i64>,
    pub is_running: bool,
}

/// Workload identity resolved from the orchestrator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodIdentity {
    pub pod_name: String,
    pub pod_namespace: String,
    pub container_name: String,
}

/// One tracked process. The single source of truth for everything the
/// scrape handler emits about a PID.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessRecord {
    pub pid: u32,
    pub gpu_index: u32,
    pub process_name: String,
    pub is_running: bool,
    /// Unix seconds.
    pub start_time: i64,
    /// Unix seconds, set when the process is marked exited.
    pub end_time: Option<i64>,
    pub sm_util: f64,
    pub mem_util: f64,
    pub memory_used_bytes: u64,
    /// Non-decreasing for the life of the record, frozen at exit.
    pub cumulative_energy_joules: f64,
    /// Latest raw energy reading from the telemetry adapter. Kept apart
    /// from the cumulative counter so the attribution engine can decide
    /// whether to adopt it.
    pub telemetry_energy_joules: f64,
    pub energy_source: EnergySource,
    /// Never empty: processes outside a container are not tracked.
    pub container_id: String,
    pub pod_name: String,
    pub pod_namespace: String,
    pub container_name: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_energy_source_label() {
        assert_eq!(EnergySource::Measured.as_label(), "false");
        assert_eq!(EnergySource::Estimated.as_label(), "true");
    }
}
