//! Thread builder for completion workers
//!
//! Spawns named worker threads and optionally pins each one to a CPU core.

use std::io;
use std::thread::{self, JoinHandle};

use crate::arch::CpuInfo;

/// Result of attempting to pin a thread to a specific core
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinningResult {
    /// Successfully pinned to the requested core
    Success,
    /// Successfully pinned, but to a different core than requested
    SuccessDifferentCore(usize),
    /// Pinning was not requested or is not supported on this platform
    Unsupported,
    /// Pinning failed for some other reason
    Failed,
}

/// A spawned worker thread
pub struct WorkerThread {
    /// The thread's join handle
    handle: JoinHandle<()>,
    /// Thread name
    name: String,
    /// The CPU core this thread was asked to run on, if any
    core_id: Option<usize>,
}

impl WorkerThread {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the CPU core this thread is pinned to, if any
    pub fn core_id(&self) -> Option<usize> {
        self.core_id
    }

    /// Whether the thread has returned.
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Take ownership of the thread's join handle
    pub fn into_handle(self) -> JoinHandle<()> {
        self.handle
    }
}

/// Builder for worker threads
pub struct ThreadBuilder {
    /// CPU information to use for core assignment
    cpu_info: CpuInfo,
    /// Whether workers get pinned
    pin: bool,
    /// Thread name prefix
    prefix: String,
    /// Current worker index (incremented for each thread created)
    worker_idx: usize,
}

impl ThreadBuilder {
    /// Create a new thread builder
    pub fn new(cpu_info: &CpuInfo, prefix: &str, pin: bool) -> Self {
        Self {
            cpu_info: cpu_info.clone(),
            pin,
            prefix: prefix.to_string(),
            worker_idx: 0,
        }
    }

    /// Spawn the next worker thread running `f`
    pub fn spawn<F>(&mut self, f: F) -> io::Result<WorkerThread>
    where
        F: FnOnce() + Send + 'static,
    {
        let core_id = self
            .pin
            .then(|| self.cpu_info.get_core_for_worker(self.worker_idx));
        let name = format!("{}-{}", self.prefix, self.worker_idx);
        self.worker_idx += 1;

        let handle = thread::Builder::new().name(name.clone()).spawn(move || {
            if let Some(core) = core_id {
                let result = pin_thread_to_core(core);
                if result != PinningResult::Success {
                    tracing::debug!("thread pinning to core {}: {:?}", core, result);
                }
            }
            f();
        })?;

        Ok(WorkerThread {
            handle,
            name,
            core_id,
        })
    }

    /// Number of threads spawned so far
    pub fn spawned(&self) -> usize {
        self.worker_idx
    }
}

/// Attempt to pin the current thread to a specific CPU core
fn pin_thread_to_core(core_id: usize) -> PinningResult {
    let Some(core_ids) = core_affinity::get_core_ids() else {
        return PinningResult::Unsupported;
    };
    if core_ids.is_empty() {
        return PinningResult::Failed;
    }

    let index = core_id % core_ids.len();
    if !core_affinity::set_for_current(core_ids[index]) {
        return PinningResult::Failed;
    }

    if index == core_id {
        PinningResult::Success
    } else {
        PinningResult::SuccessDifferentCore(index)
    }
}
