//! Completion port.
//!
//! Associates sockets with a token, accepts asynchronous accept/send/receive
//! operations and reports each finished operation on a single
//! [`CompletionQueue`] that any number of worker threads may drain.

mod queue;
mod reactor;

pub use queue::CompletionQueue;

use std::fmt;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::context::OperationContext;
use reactor::Reactor;

/// Token reserved for the exit sentinel; never issued to a socket.
pub const EXIT_TOKEN: u64 = u64::MAX;

/// A finished operation as returned by [`CompletionPort::get`].
#[derive(Debug)]
pub struct Completion {
    /// Token of the socket the operation ran on.
    pub token: u64,

    /// The operation context, `None` for synthetic completions.
    pub op: Option<Box<OperationContext>>,

    /// Bytes transferred, or the error the operation failed with.
    pub result: io::Result<usize>,
}

impl Completion {
    pub(crate) fn new(token: u64, op: Box<OperationContext>, result: io::Result<usize>) -> Self {
        Self {
            token,
            op: Some(op),
            result,
        }
    }

    /// A completion carrying no operation.
    pub fn signal(token: u64) -> Self {
        Self {
            token,
            op: None,
            result: Ok(0),
        }
    }

    /// Whether this is the exit sentinel.
    pub fn is_exit(&self) -> bool {
        self.token == EXIT_TOKEN
    }
}

/// Why an operation could not be issued. The context is handed back.
pub struct SubmitError {
    pub op: Box<OperationContext>,
    pub cause: SubmitCause,
}

/// Cause of a [`SubmitError`].
#[derive(Debug)]
pub enum SubmitCause {
    /// The connection is closing.
    Closed,

    /// The port rejected the operation.
    Io(io::Error),
}

impl SubmitError {
    pub(crate) fn io(op: Box<OperationContext>, error: io::Error) -> Self {
        Self {
            op,
            cause: SubmitCause::Io(error),
        }
    }

    pub(crate) fn closed(op: Box<OperationContext>) -> Self {
        Self {
            op,
            cause: SubmitCause::Closed,
        }
    }
}

impl fmt::Debug for SubmitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubmitError")
            .field("kind", &self.op.kind())
            .field("cause", &self.cause)
            .finish()
    }
}

/// Completion queue plus the driver that feeds it.
pub struct CompletionPort {
    queue: Arc<CompletionQueue>,
    reactor: Arc<Reactor>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl CompletionPort {
    /// Opens a port and starts its driver thread.
    pub fn new() -> io::Result<Self> {
        let queue = Arc::new(CompletionQueue::new());
        let reactor = Arc::new(Reactor::new(queue.clone())?);

        let driver = {
            let reactor = reactor.clone();
            thread::Builder::new()
                .name("tinyiocp-driver".to_string())
                .spawn(move || reactor.run())?
        };

        Ok(Self {
            queue,
            reactor,
            driver: Mutex::new(Some(driver)),
        })
    }

    /// Associates a non-blocking socket with the port under `token`.
    pub fn associate(&self, fd: RawFd, token: u64) -> io::Result<()> {
        if token == EXIT_TOKEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "token is reserved for the exit sentinel",
            ));
        }
        self.reactor.register(fd, token)
    }

    /// Issues `op` on `fd`. Its completion is posted to the queue.
    pub fn submit(&self, fd: RawFd, op: Box<OperationContext>) -> Result<(), SubmitError> {
        self.reactor.submit(fd, op)
    }

    /// Removes `fd` from the port; its pending operations complete with `ECANCELED`.
    pub fn deregister(&self, fd: RawFd) -> usize {
        self.reactor.deregister(fd)
    }

    /// Posts a completion directly onto the queue.
    pub fn post(&self, completion: Completion) {
        self.queue.push(completion);
    }

    /// Waits for the next completion; `None` timeout blocks indefinitely.
    pub fn get(&self, timeout: Option<Duration>) -> Option<Completion> {
        self.queue.pop(timeout)
    }

    /// Number of completions waiting to be picked up.
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Number of associated sockets.
    pub fn associated(&self) -> usize {
        self.reactor.registered()
    }

    /// Whether the driver thread is still running.
    pub fn is_open(&self) -> bool {
        self.driver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Stops the driver and returns every completion nobody picked up.
    ///
    /// Sockets still associated stay untouched; callers deregister them first.
    pub fn close(&self) -> Vec<Completion> {
        let driver = self
            .driver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if let Some(driver) = driver {
            self.reactor.shutdown();
            if driver.join().is_err() {
                tracing::error!("completion driver thread panicked");
            }
        }

        self.queue.drain()
    }
}

impl Drop for CompletionPort {
    fn drop(&mut self) {
        self.close();
    }
}
