//! Completion worker pool.

use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use super::engine::{worker_loop, EngineCore};
use crate::arch::{self, ThreadBuilder, WorkerThread};
use crate::error::{EngineError, Result};

/// Thread name prefix of completion workers.
const WORKER_PREFIX: &str = "tinyiocp-worker";

/// Counts workers still running.
#[derive(Debug, Default)]
struct ExitLatch {
    running: Mutex<usize>,
    exited: Condvar,
}

impl ExitLatch {
    fn enter(&self) {
        *self.lock() += 1;
    }

    fn leave(&self) {
        let mut running = self.lock();
        *running = running.saturating_sub(1);
        if *running == 0 {
            self.exited.notify_all();
        }
    }

    /// Waits until every worker left. Returns `false` on timeout.
    fn wait(&self, timeout: Option<Duration>) -> bool {
        let mut running = self.lock();
        let Some(timeout) = timeout else {
            while *running > 0 {
                running = self
                    .exited
                    .wait(running)
                    .unwrap_or_else(PoisonError::into_inner);
            }
            return true;
        };

        let deadline = Instant::now() + timeout;
        while *running > 0 {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            running = self
                .exited
                .wait_timeout(running, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        true
    }

    fn lock(&self) -> MutexGuard<'_, usize> {
        self.running.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Leaves the latch when a worker returns or unwinds.
struct ExitGuard(Arc<ExitLatch>);

impl Drop for ExitGuard {
    fn drop(&mut self) {
        self.0.leave();
    }
}

/// Threads draining one engine's completion port.
pub(crate) struct WorkerPool {
    workers: Vec<WorkerThread>,
    latch: Arc<ExitLatch>,
}

impl WorkerPool {
    /// Spawns `count` workers. Already spawned workers are stopped if one
    /// fails to start.
    pub(crate) fn spawn(core: &Arc<EngineCore>, count: usize, pin: bool) -> Result<Self> {
        let cpu_info = arch::detect_cpu_topology();
        let mut builder = ThreadBuilder::new(&cpu_info, WORKER_PREFIX, pin);
        let mut pool = Self {
            workers: Vec::with_capacity(count),
            latch: Arc::new(ExitLatch::default()),
        };

        for _ in 0..count {
            let worker_core = core.clone();
            let guard = ExitGuard(pool.latch.clone());
            pool.latch.enter();

            let spawned = builder.spawn(move || {
                let _guard = guard;
                worker_loop(&worker_core);
            });
            match spawned {
                Ok(worker) => {
                    tracing::trace!("spawned {} (core {:?})", worker.name(), worker.core_id());
                    pool.workers.push(worker);
                }
                Err(err) => {
                    // The closure and its guard were dropped, the latch is balanced
                    tracing::error!("failed to spawn completion worker: {}", err);
                    pool.stop(core, core.config().shutdown_timeout);
                    return Err(EngineError::Spawn(err));
                }
            }
        }

        Ok(pool)
    }

    pub(crate) fn len(&self) -> usize {
        self.workers.len()
    }

    /// Signals every worker to exit and waits up to `timeout` for them.
    ///
    /// Workers that exited are joined; the rest are detached. Returns the
    /// number of detached workers.
    pub(crate) fn stop(self, core: &EngineCore, timeout: Option<Duration>) -> usize {
        core.signal_stop(self.workers.len());
        let all_exited = self.latch.wait(timeout);

        let mut abandoned = 0;
        for worker in self.workers {
            if all_exited || worker.is_finished() {
                let name = worker.name().to_string();
                if worker.into_handle().join().is_err() {
                    tracing::error!("{} panicked", name);
                }
            } else {
                tracing::warn!("{} did not exit within {:?}, detaching", worker.name(), timeout);
                abandoned += 1;
            }
        }
        abandoned
    }
}
