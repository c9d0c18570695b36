//! Completion engine shared by the server and the client.
//!
//! The [`EngineCore`] owns the completion port and the connection registry and
//! turns every completion a worker picks up into handler callbacks and the
//! next operation on the connection.

use std::io;
use std::net::SocketAddr;
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use crossbeam_utils::CachePadded;
use dashmap::DashMap;
use socket2::Socket;

use super::acceptor::{is_resource_exhaustion, Acceptor};
use super::handler::Handler;
use super::worker::WorkerPool;
use crate::config::EngineConfig;
use crate::context::{Connection, ConnectionRole, OperationContext, OperationKind, OperationPool};
use crate::error::{EngineError, Result};
use crate::port::{Completion, CompletionPort, SubmitCause, SubmitError, EXIT_TOKEN};

/// How a connection ends.
pub(crate) enum Terminal {
    /// Report `on_closed`.
    Closed,

    /// Report `on_error`.
    Error(io::Error),

    /// No callback; used for the listening socket.
    Silent,
}

/// State shared by the workers of one running engine.
pub(crate) struct EngineCore {
    config: EngineConfig,
    port: CompletionPort,
    pool: Arc<OperationPool>,
    handler: Arc<dyn Handler>,
    connections: DashMap<u64, Arc<Connection>>,
    next_token: AtomicU64,
    connection_count: CachePadded<AtomicUsize>,
    stopping: CachePadded<AtomicBool>,
    acceptor: OnceLock<Acceptor>,
}

impl EngineCore {
    pub(crate) fn new(
        config: EngineConfig,
        port: CompletionPort,
        pool: Arc<OperationPool>,
        handler: Arc<dyn Handler>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            port,
            pool,
            handler,
            connections: DashMap::new(),
            next_token: AtomicU64::new(1),
            connection_count: CachePadded::new(AtomicUsize::new(0)),
            stopping: CachePadded::new(AtomicBool::new(false)),
            acceptor: OnceLock::new(),
        })
    }

    pub(crate) fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub(crate) fn port(&self) -> &CompletionPort {
        &self.port
    }

    pub(crate) fn pool(&self) -> &Arc<OperationPool> {
        &self.pool
    }

    /// Live connections, the listening socket excluded.
    pub(crate) fn connection_count(&self) -> usize {
        self.connection_count.load(Ordering::Acquire)
    }

    pub(crate) fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::Acquire)
    }

    pub(crate) fn install_acceptor(&self, acceptor: Acceptor) -> &Acceptor {
        self.acceptor.get_or_init(|| acceptor)
    }

    /// Wraps `socket` in a connection and associates it with the port.
    pub(crate) fn register(
        self: &Arc<Self>,
        socket: Socket,
        role: ConnectionRole,
    ) -> io::Result<Arc<Connection>> {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        if token == EXIT_TOKEN {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                "connection tokens exhausted",
            ));
        }

        let conn = Arc::new(Connection::new(token, role, socket, Arc::downgrade(self)));
        self.connections.insert(token, conn.clone());

        if let Err(err) = self.port.associate(conn.as_raw_fd(), token) {
            self.connections.remove(&token);
            return Err(err);
        }
        Ok(conn)
    }

    /// Counts `conn` as live and reports it to the handler.
    pub(crate) fn established(&self, conn: &Connection) {
        let live = self.connection_count.fetch_add(1, Ordering::AcqRel) + 1;
        tracing::debug!(
            "connection {} established with {:?} ({} live)",
            conn.id(),
            conn.peer_addr(),
            live
        );
        self.handler.on_established(conn);
    }

    /// Sends `payload` on `conn` with one pooled operation.
    ///
    /// Caller errors (empty or oversized payload, closed connection) leave the
    /// connection alone; a rejected submission tears it down.
    pub(crate) fn send(&self, conn: &Connection, payload: &[u8]) -> Result<()> {
        if conn.is_closed() {
            return Err(EngineError::ConnectionClosed(conn.id()));
        }

        let mut op = self.pool.acquire();
        if let Err(err) = op.prepare_send(payload) {
            self.pool.release(op);
            return Err(err);
        }
        self.issue(conn, op)
    }

    /// Issues the next receive on `conn`, reusing `op`.
    pub(crate) fn post_recv(&self, conn: &Connection, mut op: Box<OperationContext>) -> Result<()> {
        op.prepare(OperationKind::Recv);
        self.issue(conn, op)
    }

    fn issue(&self, conn: &Connection, op: Box<OperationContext>) -> Result<()> {
        let kind = op.kind();
        let SubmitError { op, cause } = match conn.issue(&self.port, op) {
            Ok(()) => return Ok(()),
            Err(err) => err,
        };
        self.pool.release(op);

        match cause {
            SubmitCause::Closed => Err(EngineError::ConnectionClosed(conn.id())),
            SubmitCause::Io(source) => {
                tracing::debug!(
                    "{:?} submission on connection {} failed: {}",
                    kind,
                    conn.id(),
                    source
                );
                self.close(conn, Terminal::Error(duplicate(&source)));
                Err(EngineError::Submit { kind, source })
            }
        }
    }

    /// Tears `conn` down if no other thread got there first.
    ///
    /// The winner unregisters the connection, updates the count, drains the
    /// outstanding operations, shuts the socket down and then reports the
    /// terminal event. Returns whether this call won.
    pub(crate) fn close(&self, conn: &Connection, terminal: Terminal) -> bool {
        if !conn.begin_close() {
            return false;
        }

        self.connections.remove(&conn.id());
        if conn.role() != ConnectionRole::Listener {
            self.connection_count.fetch_sub(1, Ordering::AcqRel);
        }

        // Outstanding operations are drained before the terminal event
        let drained = conn.shutdown(&self.port);
        tracing::debug!(
            "connection {} torn down ({} operations aborted)",
            conn.id(),
            drained
        );

        match terminal {
            Terminal::Closed => self.handler.on_closed(conn),
            Terminal::Error(err) => self.handler.on_error(conn, &err),
            Terminal::Silent => {}
        }
        true
    }

    /// Handles one completion picked up by a worker.
    pub(crate) fn dispatch(self: &Arc<Self>, completion: Completion) {
        let Completion { token, op, result } = completion;
        let Some(op) = op else {
            match self.acceptor.get() {
                Some(acceptor) if acceptor.token() == token => acceptor.resume(self),
                _ => tracing::trace!("ignoring signal completion for token {}", token),
            }
            return;
        };

        let conn = match self.connections.get(&token) {
            Some(entry) => Arc::clone(entry.value()),
            None => {
                self.pool.release(op);
                return;
            }
        };
        self.deliver(&conn, op, result);
    }

    /// Handles a completion whose connection has been looked up.
    fn deliver(self: &Arc<Self>, conn: &Connection, op: Box<OperationContext>, result: io::Result<usize>) {
        if !conn.complete(op.id()) {
            // Teardown claimed this operation already
            self.pool.release(op);
            return;
        }
        if conn.is_closed() {
            // Completed while teardown was draining
            self.pool.release(op);
            return;
        }

        match result {
            Err(err) => self.on_failure(conn, op, err),
            Ok(0) if matches!(op.kind(), OperationKind::Send | OperationKind::Recv) => {
                self.pool.release(op);
                self.close(conn, Terminal::Closed);
            }
            Ok(transferred) => match op.kind() {
                OperationKind::Accept => match self.acceptor.get() {
                    Some(acceptor) => acceptor.on_accept(self, op),
                    None => self.pool.release(op),
                },
                OperationKind::Recv => self.on_recv(conn, op),
                OperationKind::Send => {
                    self.pool.release(op);
                    self.handler.on_send(conn, transferred);
                }
                OperationKind::None => self.pool.release(op),
            },
        }
    }

    fn on_recv(&self, conn: &Connection, op: Box<OperationContext>) {
        self.handler.on_recv(conn, op.data());
        // A failed re-issue has already torn the connection down
        let _ = self.post_recv(conn, op);
    }

    fn on_failure(self: &Arc<Self>, conn: &Connection, op: Box<OperationContext>, err: io::Error) {
        if err.raw_os_error() == Some(libc::ECANCELED) {
            self.pool.release(op);
            return;
        }

        if conn.role() == ConnectionRole::Listener {
            let Some(acceptor) = self.acceptor.get() else {
                self.pool.release(op);
                return;
            };
            if is_resource_exhaustion(&err) {
                acceptor.park(self, op);
            } else {
                tracing::warn!("accept on {:?} failed: {}", conn.local_addr(), err);
                acceptor.repost(self, op);
            }
            return;
        }

        if err.kind() == io::ErrorKind::TimedOut {
            if !conn.is_alive() {
                self.pool.release(op);
                self.close(conn, Terminal::Closed);
            } else if op.kind() == OperationKind::Recv {
                let _ = self.post_recv(conn, op);
            } else {
                self.pool.release(op);
            }
            return;
        }

        self.pool.release(op);
        self.close(conn, Terminal::Error(err));
    }

    /// Sets the stop flag and posts one exit sentinel per worker.
    pub(crate) fn signal_stop(&self, workers: usize) {
        self.stopping.store(true, Ordering::Release);
        for _ in 0..workers {
            self.port.post(Completion::signal(EXIT_TOKEN));
        }
    }

    /// Closes every remaining connection, closes the port and recycles
    /// every operation that was still queued. Workers must be stopped.
    pub(crate) fn shutdown(&self) {
        let live: Vec<Arc<Connection>> = self
            .connections
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        // Listener first so no new connection shows up while closing the rest
        let (listeners, others): (Vec<_>, Vec<_>) = live
            .into_iter()
            .partition(|conn| conn.role() == ConnectionRole::Listener);
        for conn in listeners {
            self.close(&conn, Terminal::Silent);
        }
        if let Some(acceptor) = self.acceptor.get() {
            acceptor.release_parked(&self.pool);
        }
        for conn in others {
            self.close(&conn, Terminal::Closed);
        }

        let mut recycled = 0;
        for op in self.port.close().into_iter().filter_map(|c| c.op) {
            self.pool.release(op);
            recycled += 1;
        }
        tracing::debug!("engine shut down, {} queued operations recycled", recycled);
    }
}

/// Worker loop: drain the port until the stop flag or an exit sentinel.
pub(crate) fn worker_loop(core: &Arc<EngineCore>) {
    while !core.is_stopping() {
        let Some(completion) = core.port().get(None) else {
            continue;
        };
        if completion.is_exit() {
            break;
        }
        core.dispatch(completion);
    }
}

/// A running engine: core plus its workers.
pub(crate) struct Engine {
    core: Arc<EngineCore>,
    workers: WorkerPool,
}

impl Engine {
    /// Opens a completion port and spawns the workers.
    pub(crate) fn launch(
        config: &EngineConfig,
        pool: Arc<OperationPool>,
        handler: Arc<dyn Handler>,
    ) -> Result<Self> {
        let port = CompletionPort::new().map_err(EngineError::Port)?;
        let core = EngineCore::new(config.clone(), port, pool, handler);

        let workers = match WorkerPool::spawn(&core, config.worker_count(), config.pin_threads) {
            Ok(workers) => workers,
            Err(err) => {
                core.shutdown();
                return Err(err);
            }
        };

        tracing::info!("completion engine started with {} workers", workers.len());
        Ok(Self { core, workers })
    }

    pub(crate) fn core(&self) -> &Arc<EngineCore> {
        &self.core
    }

    /// Stop flag, sentinels, bounded wait for the workers, then release
    /// every connection and the port.
    pub(crate) fn shutdown(self) {
        let Self { core, workers } = self;

        let abandoned = workers.stop(&core, core.config().shutdown_timeout);
        if abandoned > 0 {
            tracing::warn!("{} workers did not exit and were abandoned", abandoned);
        }

        core.shutdown();
        tracing::info!("completion engine stopped");
    }
}

/// Bound address of the listening socket, if any.
pub(crate) fn listener_addr(core: &EngineCore) -> Option<SocketAddr> {
    core.acceptor.get().and_then(Acceptor::local_addr)
}

fn duplicate(err: &io::Error) -> io::Error {
    match err.raw_os_error() {
        Some(code) => io::Error::from_raw_os_error(code),
        None => io::Error::new(err.kind(), err.to_string()),
    }
}
