//! Exporter configuration
//!
//! All options are available both as flags and as environment
//! variables. Parse failures exit before anything external is touched.

use clap::{ArgAction, Parser, ValueEnum};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Parser)]
#[command(
    name = "gpu-energy-exporter",
    about = "Per-process GPU energy metrics for containerized workloads",
    version
)]
pub struct Config {
    /// Sampling period hint for the telemetry library
    #[arg(long, env = "TELEMETRY_UPDATE_FREQUENCY", default_value = "1s", value_parser = parse_duration)]
    pub telemetry_update_frequency: Duration,

    /// Soft upper bound between collection cycles when no scrape arrives
    #[arg(long, env = "PROCESS_SCAN_INTERVAL", default_value = "10s", value_parser = parse_duration)]
    pub process_scan_interval: Duration,

    /// Resolve pod identity via the orchestrator
    #[arg(
        long,
        env = "ORCHESTRATOR_ENABLED",
        default_value_t = true,
        action = ArgAction::Set,
        num_args = 1
    )]
    pub orchestrator_enabled: bool,

    /// Unix socket of the kubelet pod-resources endpoint
    #[arg(
        long,
        env = "ORCHESTRATOR_SOCKET_PATH",
        default_value = "/var/lib/kubelet/pod-resources/kubelet.sock"
    )]
    pub orchestrator_socket_path: PathBuf,

    /// Grace period during which exited processes stay visible
    #[arg(long, env = "METRIC_RETENTION", default_value = "5m", value_parser = parse_duration)]
    pub metric_retention: Duration,

    /// Prefix substituted into all metric names
    #[arg(long, env = "METRIC_PREFIX", default_value = "my_gpu_process")]
    pub metric_prefix: String,

    /// Redistribute interval energy by SM share when a GPU is time-sliced
    #[arg(
        long,
        env = "ENABLE_ENERGY_ESTIMATION",
        default_value_t = true,
        action = ArgAction::Set,
        num_args = 1
    )]
    pub enable_energy_estimation: bool,

    /// Idle power subtracted from GPU power before redistribution
    #[arg(long, env = "GPU_IDLE_POWER_WATTS", default_value_t = 0.0)]
    pub gpu_idle_power_watts: f64,

    /// HTTP listen address; a bare `:port` binds all interfaces
    #[arg(long, env = "LISTEN_ADDRESS", default_value = ":9400")]
    pub listen_address: String,

    /// Path under which to expose metrics
    #[arg(long, env = "METRICS_PATH", default_value = "/metrics")]
    pub metrics_path: String,

    /// Log level
    #[arg(long, env = "LOG_LEVEL", value_enum, default_value_t = LogLevel::Info)]
    pub log_level: LogLevel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_filter(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

impl Config {
    /// Normalize the Go-style `:9400` form to something bindable.
    pub fn bind_address(&self) -> String {
        if self.listen_address.starts_with(':') {
            format!("0.0.0.0{}", self.listen_address)
        } else {
            self.listen_address.clone()
        }
    }

    /// Metrics path with a guaranteed leading slash, as the router
    /// requires.
    pub fn metrics_route(&self) -> String {
        if self.metrics_path.starts_with('/') {
            self.metrics_path.clone()
        } else {
            format!("/{}", self.metrics_path)
        }
    }
}

fn parse_duration(value: &str) -> Result<Duration, humantime::DurationError> {
    humantime::parse_duration(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::parse_from(["gpu-energy-exporter"]);
        assert_eq!(config.telemetry_update_frequency, Duration::from_secs(1));
        assert_eq!(config.process_scan_interval, Duration::from_secs(10));
        assert!(config.orchestrator_enabled);
        assert_eq!(config.metric_retention, Duration::from_secs(300));
        assert_eq!(config.metric_prefix, "my_gpu_process");
        assert!(config.enable_energy_estimation);
        assert_eq!(config.gpu_idle_power_watts, 0.0);
        assert_eq!(config.listen_address, ":9400");
        assert_eq!(config.metrics_path, "/metrics");
        assert_eq!(config.log_level, LogLevel::Info);
    }

    #[test]
    fn test_duration_flags_accept_humantime() {
        let config = Config::parse_from([
            "gpu-energy-exporter",
            "--metric-retention",
            "90s",
            "--process-scan-interval",
            "2m",
        ]);
        assert_eq!(config.metric_retention, Duration::from_secs(90));
        assert_eq!(config.process_scan_interval, Duration::from_secs(120));
    }

    #[test]
    fn test_bool_flags_take_explicit_values() {
        let config = Config::parse_from([
            "gpu-energy-exporter",
            "--orchestrator-enabled",
            "false",
            "--enable-energy-estimation",
            "false",
        ]);
        assert!(!config.orchestrator_enabled);
        assert!(!config.enable_energy_estimation);
    }

    #[test]
    fn test_invalid_duration_is_rejected() {
        let result = Config::try_parse_from(["gpu-energy-exporter", "--metric-retention", "soon"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_bind_address_normalization() {
        let mut config = Config::parse_from(["gpu-energy-exporter"]);
        assert_eq!(config.bind_address(), "0.0.0.0:9400");

        config.listen_address = "127.0.0.1:9000".to_string();
        assert_eq!(config.bind_address(), "127.0.0.1:9000");
    }
}
