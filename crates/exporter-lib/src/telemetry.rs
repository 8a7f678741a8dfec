//! Per-process telemetry sampling
//!
//! A background sampler maintains one window per PID: utilization from
//! the driver's per-process sampling API, memory from the compute
//! process list, and energy as the device-level energy counter
//! integrated over the PID's lifetime window.
//!
//! The energy integration mirrors how the data-center telemetry stack
//! accounts per-process energy: on a shared GPU every co-resident PID
//! reports the same aggregate value. The attribution engine corrects
//! that; this adapter only reports what the counters say.

use crate::models::ProcessTelemetry;
use crate::procfs::ProcFs;
use nvml_wrapper::enums::device::UsedGpuMemory;
use nvml_wrapper::error::NvmlError;
use nvml_wrapper::Nvml;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// How long `start_watching` blocks so the first sample window is
/// populated before any caller can observe spurious zeroes.
const FIRST_WINDOW_WAIT: Duration = Duration::from_secs(3);

/// Windows for processes that are gone are dropped after this many
/// seconds; consumers stop asking for them long before.
const STALE_WINDOW_AGE_SECS: i64 = 600;

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("telemetry sampler not started")]
    NotStarted,
    #[error("failed to spawn telemetry sampler: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("power reading for GPU {gpu} unavailable: {source}")]
    Power {
        gpu: u32,
        #[source]
        source: NvmlError,
    },
}

/// Per-process counters and instantaneous GPU power.
pub trait TelemetrySource: Send + Sync {
    /// Latest counters for a PID. `None` means no sample window exists
    /// yet, which is distinct from an error.
    fn process_telemetry(&self, pid: u32) -> Result<Option<ProcessTelemetry>, TelemetryError>;

    /// Instantaneous power draw of a GPU, in watts.
    fn gpu_power_watts(&self, gpu_index: u32) -> Result<f64, TelemetryError>;
}

#[derive(Debug, Clone)]
struct PidWindow {
    gpu_index: u32,
    process_name: String,
    sm_util: f64,
    mem_util: f64,
    memory_used_bytes: u64,
    first_seen: i64,
    last_seen: i64,
    /// Device energy counter (millijoules) when the window opened.
    energy_base_mj: u64,
    energy_last_mj: u64,
    running: bool,
}

/// NVML-backed telemetry sampler.
pub struct NvmlTelemetry {
    nvml: Arc<Nvml>,
    windows: Arc<RwLock<HashMap<u32, PidWindow>>>,
    started: AtomicBool,
    stop: Arc<AtomicBool>,
    update_frequency: Duration,
    procfs: ProcFs,
}

impl NvmlTelemetry {
    pub fn new(nvml: Arc<Nvml>, update_frequency: Duration) -> Self {
        Self {
            nvml,
            windows: Arc::new(RwLock::new(HashMap::new())),
            started: AtomicBool::new(false),
            stop: Arc::new(AtomicBool::new(false)),
            update_frequency,
            procfs: ProcFs::new(),
        }
    }

    /// Start the background sampler and block until the first sample
    /// window is populated. Must be called once before
    /// `process_telemetry` returns data; repeated calls are no-ops.
    pub async fn start_watching(&self) -> Result<(), TelemetryError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let nvml = self.nvml.clone();
        let windows = self.windows.clone();
        let stop = self.stop.clone();
        let frequency = self.update_frequency;
        let procfs = self.procfs.clone();

        std::thread::Builder::new()
            .name("telemetry-sampler".into())
            .spawn(move || sample_loop(nvml, windows, stop, frequency, procfs))
            .map_err(TelemetryError::Spawn)?;

        info!(
            wait_secs = FIRST_WINDOW_WAIT.as_secs(),
            "Waiting for the first telemetry sample window"
        );
        tokio::time::sleep(FIRST_WINDOW_WAIT).await;

        Ok(())
    }

    /// Stop the sampler. Idempotent; in-flight passes finish on their
    /// own.
    pub fn shutdown(&self) {
        self.stop.store(true, Ordering::SeqCst);
        debug!("Telemetry sampler stopped");
    }
}

impl TelemetrySource for NvmlTelemetry {
    fn process_telemetry(&self, pid: u32) -> Result<Option<ProcessTelemetry>, TelemetryError> {
        if !self.started.load(Ordering::SeqCst) {
            return Err(TelemetryError::NotStarted);
        }

        let windows = self.windows.read().unwrap();
        Ok(windows.get(&pid).map(|w| ProcessTelemetry {
            pid,
            gpu_index: w.gpu_index,
            process_name: w.process_name.clone(),
            sm_util: w.sm_util,
            mem_util: w.mem_util,
            memory_used_bytes: w.memory_used_bytes,
            energy_consumed_joules: w.energy_last_mj.saturating_sub(w.energy_base_mj) as f64
                / 1000.0,
            start_time: w.first_seen,
            end_time: if w.running { None } else { Some(w.last_seen) },
            is_running: w.running,
        }))
    }

    fn gpu_power_watts(&self, gpu_index: u32) -> Result<f64, TelemetryError> {
        let device = self
            .nvml
            .device_by_index(gpu_index)
            .map_err(|source| TelemetryError::Power { gpu: gpu_index, source })?;
        let milliwatts = device
            .power_usage()
            .map_err(|source| TelemetryError::Power { gpu: gpu_index, source })?;
        Ok(milliwatts as f64 / 1000.0)
    }
}

struct DevicePass {
    gpu_index: u32,
    energy_mj: Option<u64>,
    /// (pid, memory_used_bytes) from the compute process list.
    compute: Vec<(u32, u64)>,
    /// (pid, sm_util, mem_util) ratios from utilization samples.
    utilization: Vec<(u32, f64, f64)>,
}

fn sample_loop(
    nvml: Arc<Nvml>,
    windows: Arc<RwLock<HashMap<u32, PidWindow>>>,
    stop: Arc<AtomicBool>,
    frequency: Duration,
    procfs: ProcFs,
) {
    let mut last_sample_ts: HashMap<u32, u64> = HashMap::new();

    while !stop.load(Ordering::SeqCst) {
        match collect_devices(&nvml, &mut last_sample_ts) {
            Ok(passes) => apply_passes(&windows, &passes, &procfs),
            Err(e) => warn!(error = %e, "Telemetry sampling pass failed"),
        }
        std::thread::sleep(frequency);
    }
}

fn collect_devices(
    nvml: &Nvml,
    last_sample_ts: &mut HashMap<u32, u64>,
) -> Result<Vec<DevicePass>, NvmlError> {
    let count = nvml.device_count()?;
    let mut passes = Vec::with_capacity(count as usize);

    for index in 0..count {
        let device = match nvml.device_by_index(index) {
            Ok(device) => device,
            Err(e) => {
                warn!(gpu = index, error = %e, "Failed to get device handle");
                continue;
            }
        };

        // Not exposed on every model; the window keeps a zero delta then.
        let energy_mj = device.total_energy_consumption().ok();

        let compute = match device.running_compute_processes() {
            Ok(processes) => processes
                .into_iter()
                .map(|p| {
                    let bytes = match p.used_gpu_memory {
                        UsedGpuMemory::Used(bytes) => bytes,
                        UsedGpuMemory::Unavailable => 0,
                    };
                    (p.pid, bytes)
                })
                .collect(),
            Err(e) => {
                warn!(gpu = index, error = %e, "Failed to list compute processes");
                Vec::new()
            }
        };

        let since = last_sample_ts.get(&index).copied();
        let utilization = match device.process_utilization_stats(since) {
            Ok(samples) => {
                if let Some(max_ts) = samples.iter().map(|s| s.timestamp).max() {
                    last_sample_ts.insert(index, max_ts);
                }
                samples
                    .into_iter()
                    .map(|s| {
                        (
                            s.pid,
                            f64::from(s.sm_util.min(100)) / 100.0,
                            f64::from(s.mem_util.min(100)) / 100.0,
                        )
                    })
                    .collect()
            }
            // No new samples since the last pass.
            Err(NvmlError::NotFound) => Vec::new(),
            Err(e) => {
                debug!(gpu = index, error = %e, "No utilization samples");
                Vec::new()
            }
        };

        passes.push(DevicePass {
            gpu_index: index,
            energy_mj,
            compute,
            utilization,
        });
    }

    Ok(passes)
}

fn apply_passes(
    windows: &RwLock<HashMap<u32, PidWindow>>,
    passes: &[DevicePass],
    procfs: &ProcFs,
) {
    let now = chrono::Utc::now().timestamp();
    let mut alive: HashSet<u32> = HashSet::new();
    let mut guard = windows.write().unwrap();

    for pass in passes {
        for &(pid, memory_used_bytes) in &pass.compute {
            alive.insert(pid);
            let window = guard.entry(pid).or_insert_with(|| PidWindow {
                gpu_index: pass.gpu_index,
                process_name: procfs.process_name(pid).unwrap_or_default(),
                sm_util: 0.0,
                mem_util: 0.0,
                memory_used_bytes,
                first_seen: now,
                last_seen: now,
                energy_base_mj: pass.energy_mj.unwrap_or(0),
                energy_last_mj: pass.energy_mj.unwrap_or(0),
                running: true,
            });

            // A process on several GPUs keeps the window of the first
            // one it was seen on.
            if window.gpu_index != pass.gpu_index {
                continue;
            }

            window.last_seen = now;
            window.memory_used_bytes = memory_used_bytes;
            window.running = true;
            if let Some(energy) = pass.energy_mj {
                window.energy_last_mj = energy;
            }
        }

        for &(pid, sm_util, mem_util) in &pass.utilization {
            if let Some(window) = guard.get_mut(&pid) {
                if window.gpu_index == pass.gpu_index {
                    window.sm_util = sm_util;
                    window.mem_util = mem_util;
                }
            }
        }
    }

    for (pid, window) in guard.iter_mut() {
        if window.running && !alive.contains(pid) {
            debug!(pid = *pid, "Telemetry window closed");
            window.running = false;
        }
    }

    guard.retain(|_, w| w.running || now - w.last_seen < STALE_WINDOW_AGE_SECS);
}
