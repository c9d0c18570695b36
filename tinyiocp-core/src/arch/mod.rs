//! Architecture detection and thread management
//!
//! This module is responsible for:
//! - Detecting the number of CPU cores
//! - Sizing the completion worker pool
//! - Building and optionally pinning worker threads

pub mod cpu_info;
pub mod thread_builder;

pub use cpu_info::CpuInfo;
pub use thread_builder::{PinningResult, ThreadBuilder, WorkerThread};

/// Get information about the current system's CPU cores
pub fn detect_cpu_topology() -> CpuInfo {
    CpuInfo::detect()
}

/// Default number of completion workers: `2 × logical cores + 2`
pub fn default_worker_count() -> usize {
    detect_cpu_topology().completion_workers()
}
