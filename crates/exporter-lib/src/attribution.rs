//! Per-GPU energy attribution
//!
//! The telemetry stack integrates device-level energy over each PID's
//! lifetime window, so every co-resident process on a shared GPU reports
//! the same aggregate value. When a GPU runs more than one process this
//! engine redistributes the interval's active energy by SM utilization
//! share instead of adopting the degenerate readings. A record that has
//! been estimated once stays estimated for its lifetime.

use crate::models::{EnergySource, ProcessRecord};
use crate::telemetry::TelemetrySource;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Minimum gap between degenerate-energy warnings for one GPU.
const WARN_INTERVAL: Duration = Duration::from_secs(60);

/// Relative tolerance under which two energy readings count as
/// identical.
const IDENTICAL_TOLERANCE: f64 = 0.01;

pub struct AttributionEngine {
    estimation_enabled: bool,
    idle_power_watts: f64,
    /// Interval seed for a GPU's very first cycle.
    default_interval: Duration,
    last_estimation: HashMap<u32, Instant>,
    last_warned: HashMap<u32, Instant>,
}

impl AttributionEngine {
    pub fn new(
        estimation_enabled: bool,
        idle_power_watts: f64,
        default_interval: Duration,
    ) -> Self {
        Self {
            estimation_enabled,
            idle_power_watts,
            default_interval,
            last_estimation: HashMap::new(),
            last_warned: HashMap::new(),
        }
    }

    /// Run one attribution pass. Only running records accrue energy;
    /// exited records stay frozen even while their GPU is still shared.
    pub fn attribute(
        &mut self,
        records: &mut HashMap<u32, ProcessRecord>,
        telemetry: &dyn TelemetrySource,
        now: Instant,
    ) {
        let mut by_gpu: HashMap<u32, Vec<u32>> = HashMap::new();
        for record in records.values() {
            if record.is_running {
                by_gpu.entry(record.gpu_index).or_default().push(record.pid);
            }
        }

        // A GPU that went idle gets re-seeded when processes return;
        // otherwise the first shared interval would span the whole gap.
        self.last_estimation.retain(|gpu, _| by_gpu.contains_key(gpu));

        for (gpu, pids) in by_gpu {
            let shared = pids.len() > 1;
            let latched_solo = !shared
                && records
                    .get(&pids[0])
                    .map(|r| r.energy_source == EnergySource::Estimated)
                    .unwrap_or(false);

            if shared {
                debug!(gpu, process_count = pids.len(), "Multiple processes on one GPU");
            }

            if (shared && self.estimation_enabled) || latched_solo {
                self.estimate(records, telemetry, gpu, &pids, now);
            } else {
                Self::adopt_measured(records, &pids);
                if shared {
                    self.warn_if_degenerate(records, gpu, &pids, now);
                }
            }

            self.last_estimation.insert(gpu, now);
        }
    }

    /// Adopt the telemetry energy reading for each record, holding the
    /// previous value when the source regresses.
    fn adopt_measured(records: &mut HashMap<u32, ProcessRecord>, pids: &[u32]) {
        for pid in pids {
            if let Some(record) = records.get_mut(pid) {
                if record.energy_source == EnergySource::Measured
                    && record.telemetry_energy_joules > record.cumulative_energy_joules
                {
                    record.cumulative_energy_joules = record.telemetry_energy_joules;
                }
            }
        }
    }

    /// Redistribute the interval's active energy across the co-resident
    /// records by SM utilization share.
    fn estimate(
        &self,
        records: &mut HashMap<u32, ProcessRecord>,
        telemetry: &dyn TelemetrySource,
        gpu: u32,
        pids: &[u32],
        now: Instant,
    ) {
        // The latch applies as soon as the mode is entered, even when no
        // energy can be attributed this cycle.
        for pid in pids {
            if let Some(record) = records.get_mut(pid) {
                record.energy_source = EnergySource::Estimated;
            }
        }

        let power_watts = match telemetry.gpu_power_watts(gpu) {
            Ok(power) => power,
            Err(e) => {
                warn!(gpu, error = %e, "GPU power unavailable, skipping energy attribution this cycle");
                return;
            }
        };

        let interval = match self.last_estimation.get(&gpu) {
            Some(last) => now.duration_since(*last),
            None => self.default_interval,
        };

        let active_power = (power_watts - self.idle_power_watts).max(0.0);
        let gpu_interval_joules = active_power * interval.as_secs_f64();

        let total_sm: f64 = pids
            .iter()
            .filter_map(|pid| records.get(pid))
            .map(|r| r.sm_util)
            .sum();

        if total_sm <= 0.0 {
            // No compute happened; attribution is undefined this cycle.
            debug!(gpu, "No SM activity on shared GPU, skipping energy attribution");
            return;
        }

        for pid in pids {
            if let Some(record) = records.get_mut(pid) {
                let share = record.sm_util / total_sm;
                record.cumulative_energy_joules += gpu_interval_joules * share;
            }
        }

        debug!(
            gpu,
            interval_secs = interval.as_secs_f64(),
            active_power_watts = active_power,
            interval_joules = gpu_interval_joules,
            "Attributed interval energy by SM share"
        );
    }

    /// With estimation disabled, check whether the co-resident readings
    /// are suspiciously identical and warn at most once per minute per
    /// GPU. Returns whether a warning was emitted.
    fn warn_if_degenerate(
        &mut self,
        records: &HashMap<u32, ProcessRecord>,
        gpu: u32,
        pids: &[u32],
        now: Instant,
    ) -> bool {
        let energies: Vec<f64> = pids
            .iter()
            .filter_map(|pid| records.get(pid))
            .map(|r| r.telemetry_energy_joules)
            .filter(|&e| e > 0.0)
            .collect();

        if energies.len() < 2 {
            return false;
        }

        let first = energies[0];
        let all_same = energies[1..]
            .iter()
            .all(|&e| ((e - first) / first).abs() <= IDENTICAL_TOLERANCE);

        if !all_same {
            return false;
        }

        if let Some(last) = self.last_warned.get(&gpu) {
            if now.duration_since(*last) < WARN_INTERVAL {
                return false;
            }
        }
        self.last_warned.insert(gpu, now);

        warn!(
            gpu,
            process_count = energies.len(),
            energy_joules = first,
            "All time-sliced processes report identical energy; per-process accounting \
             is likely unavailable and estimation is disabled"
        );
        true
    }
}
