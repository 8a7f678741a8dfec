//! GPU driver adapter
//!
//! Wraps the management library's device enumeration and per-device
//! compute process lists. Graphics contexts are excluded. A failure on a
//! single GPU degrades that GPU to an empty list; the call as a whole
//! still succeeds with partial data.

use crate::models::GpuProcess;
use nvml_wrapper::enums::device::UsedGpuMemory;
use nvml_wrapper::error::NvmlError;
use nvml_wrapper::Nvml;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum GpuError {
    #[error("failed to initialize NVML: {0}")]
    Init(#[source] NvmlError),
    #[error("failed to enumerate GPUs: {0}")]
    DeviceCount(#[source] NvmlError),
}

/// Initialize the management library once for the whole process. The
/// returned handle is shared by the driver and telemetry adapters and
/// released when the last clone is dropped.
pub fn init() -> Result<Arc<Nvml>, GpuError> {
    info!("Initializing NVML");
    let nvml = Nvml::init().map_err(GpuError::Init)?;
    Ok(Arc::new(nvml))
}

/// Enumerates compute processes across all GPUs.
pub trait GpuDriver: Send + Sync {
    /// List every compute context currently resident on any GPU as
    /// `(pid, gpu_index, memory_used_bytes)`. A PID may appear once per
    /// GPU it occupies; callers treat the first occurrence as
    /// authoritative.
    fn list_compute_processes(&self) -> Result<Vec<GpuProcess>, GpuError>;

    /// Release driver state. Idempotent.
    fn shutdown(&self);
}

pub struct NvmlDriver {
    nvml: Arc<Nvml>,
}

impl NvmlDriver {
    pub fn new(nvml: Arc<Nvml>) -> Self {
        Self { nvml }
    }
}

impl GpuDriver for NvmlDriver {
    fn list_compute_processes(&self) -> Result<Vec<GpuProcess>, GpuError> {
        let count = self.nvml.device_count().map_err(GpuError::DeviceCount)?;
        let mut all = Vec::new();

        for index in 0..count {
            let device = match self.nvml.device_by_index(index) {
                Ok(device) => device,
                Err(e) => {
                    warn!(gpu = index, error = %e, "Failed to get device handle");
                    continue;
                }
            };

            let processes = match device.running_compute_processes() {
                Ok(processes) => processes,
                Err(e) => {
                    warn!(gpu = index, error = %e, "Failed to list compute processes");
                    continue;
                }
            };

            debug!(gpu = index, process_count = processes.len(), "Found GPU compute processes");

            for process in processes {
                let memory_used_bytes = match process.used_gpu_memory {
                    UsedGpuMemory::Used(bytes) => bytes,
                    UsedGpuMemory::Unavailable => 0,
                };
                all.push(GpuProcess {
                    pid: process.pid,
                    gpu_index: index,
                    memory_used_bytes,
                });
            }
        }

        Ok(all)
    }

    fn shutdown(&self) {
        // NVML state is refcounted process-wide and released when the
        // shared handle drops.
        debug!("GPU driver shut down");
    }
}
