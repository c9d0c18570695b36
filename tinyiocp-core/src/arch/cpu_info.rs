//! CPU information used to size and place the worker pool.

use std::fmt;

/// Logical/physical core counts of the current machine.
#[derive(Clone)]
pub struct CpuInfo {
    /// Total number of logical CPU cores
    logical_cores: usize,
    /// Total number of physical CPU cores (if available)
    physical_cores: Option<usize>,
}

impl fmt::Debug for CpuInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CpuInfo")
            .field("logical_cores", &self.logical_cores)
            .field("physical_cores", &self.physical_cores)
            .finish()
    }
}

impl CpuInfo {
    /// Detect CPU topology on the current system
    pub fn detect() -> Self {
        let logical_cores = num_cpus::get().max(1);

        let physical_cores = match num_cpus::get_physical() {
            count if count > 0 => Some(count),
            _ => None,
        };

        Self {
            logical_cores,
            physical_cores,
        }
    }

    /// Get the total number of logical CPU cores
    pub fn logical_cores(&self) -> usize {
        self.logical_cores
    }

    /// Get the total number of physical CPU cores (if available)
    pub fn physical_cores(&self) -> Option<usize> {
        self.physical_cores
    }

    /// Worker threads for one completion queue: two per logical core plus two.
    pub fn completion_workers(&self) -> usize {
        2 * self.logical_cores + 2
    }

    /// Core a worker with index `worker_idx` should be pinned to.
    pub fn get_core_for_worker(&self, worker_idx: usize) -> usize {
        worker_idx % self.logical_cores
    }

    /// Create a mock CpuInfo for testing
    #[cfg(test)]
    pub fn mock(logical_cores: usize) -> Self {
        Self {
            logical_cores,
            physical_cores: Some((logical_cores / 2).max(1)),
        }
    }
}
