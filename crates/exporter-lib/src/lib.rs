//! Core library for the GPU process energy exporter
//!
//! This crate provides the pieces behind the scrape endpoint:
//! - GPU driver and per-process telemetry adapters
//! - Container and pod identity resolution
//! - Exit retention for processes that are gone but still visible
//! - Per-GPU energy attribution for time-sliced workloads
//! - The collection engine and the record store it feeds

pub mod attribution;
pub mod collector;
pub mod exposition;
pub mod gpu;
pub mod health;
pub mod kube;
pub mod models;
pub mod observability;
pub mod procfs;
pub mod retention;
pub mod store;
pub mod telemetry;

pub use collector::{CollectionEngine, Collector};
pub use health::{ComponentHealth, ComponentStatus, HealthRegistry, ReadinessResponse};
pub use models::*;
pub use observability::ExporterMetrics;
