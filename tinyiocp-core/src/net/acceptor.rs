//! Listening side: keeps a fixed number of accepts outstanding.

use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, TcpKeepalive, Type};

use super::engine::EngineCore;
use crate::config::KeepaliveConfig;
use crate::context::{Connection, ConnectionRole, OperationContext, OperationKind, OperationPool};
use crate::error::{EngineError, Result};
use crate::port::{Completion, SubmitCause, SubmitError};

/// Pause before accepts withdrawn for lack of descriptors or memory are
/// issued again.
pub(crate) const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

pub(crate) struct Acceptor {
    listener: Arc<Connection>,
    max_accepts: usize,
    parked: Mutex<Vec<Box<OperationContext>>>,
}

impl Acceptor {
    /// Binds and listens on `addr` and associates the socket with the port.
    ///
    /// No accept is issued until [`Acceptor::arm`].
    pub(crate) fn open(
        core: &Arc<EngineCore>,
        addr: SocketAddr,
        backlog: i32,
        max_accepts: usize,
    ) -> Result<Self> {
        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
            .map_err(|e| EngineError::socket("socket", e))?;
        socket
            .set_reuse_address(true)
            .map_err(|e| EngineError::socket("setsockopt", e))?;
        socket
            .set_nonblocking(true)
            .map_err(|e| EngineError::socket("setsockopt", e))?;
        socket
            .bind(&addr.into())
            .map_err(|e| EngineError::socket("bind", e))?;
        socket
            .listen(backlog)
            .map_err(|e| EngineError::socket("listen", e))?;

        let listener = core
            .register(socket, ConnectionRole::Listener)
            .map_err(|e| EngineError::socket("associate", e))?;

        Ok(Self {
            listener,
            max_accepts: max_accepts.max(1),
            parked: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.local_addr()
    }

    /// Port token of the listening socket.
    pub(crate) fn token(&self) -> u64 {
        self.listener.id()
    }

    /// Accepts currently withdrawn.
    pub(crate) fn parked(&self) -> usize {
        self.lock_parked().len()
    }

    /// Issues the initial batch of accepts.
    pub(crate) fn arm(&self, core: &EngineCore) -> Result<()> {
        for _ in 0..self.max_accepts {
            self.submit(core, core.pool().acquire())
                .map_err(|e| EngineError::socket("accept", e))?;
        }
        tracing::debug!(
            "{} accepts outstanding on {:?}",
            self.max_accepts,
            self.local_addr()
        );
        Ok(())
    }

    /// Re-issues `op` as an accept, keeping the outstanding count constant.
    pub(crate) fn repost(&self, core: &EngineCore, op: Box<OperationContext>) {
        if let Err(err) = self.submit(core, op) {
            if !self.listener.is_closed() {
                tracing::warn!("failed to re-issue accept: {}", err);
            }
        }
    }

    /// Withdraws an accept that failed for lack of resources.
    ///
    /// The pending connection keeps the listener readable, so the accept is
    /// not re-issued at once. The first withdrawn accept schedules a retry after
    /// [`ACCEPT_RETRY_DELAY`]; the retry arrives as a signal completion on the
    /// listener's token and ends up in [`Acceptor::resume`].
    pub(crate) fn park(&self, core: &Arc<EngineCore>, op: Box<OperationContext>) {
        let first = {
            let mut parked = self.lock_parked();
            parked.push(op);
            parked.len() == 1
        };
        if !first {
            return;
        }

        tracing::warn!(
            "accepts on {:?} paused for {:?}: out of descriptors or memory",
            self.local_addr(),
            ACCEPT_RETRY_DELAY
        );

        let engine = Arc::downgrade(core);
        let token = self.token();
        let spawned = thread::Builder::new()
            .name("tinyiocp-accept-retry".to_string())
            .spawn(move || {
                thread::sleep(ACCEPT_RETRY_DELAY);
                if let Some(core) = engine.upgrade() {
                    core.port().post(Completion::signal(token));
                }
            });

        if let Err(err) = spawned {
            let dropped = self.release_parked(core.pool());
            tracing::error!(
                "failed to schedule accept retry, {} accepts dropped: {}",
                dropped,
                err
            );
        }
    }

    /// Re-issues every withdrawn accept.
    pub(crate) fn resume(&self, core: &EngineCore) {
        let parked = std::mem::take(&mut *self.lock_parked());
        if parked.is_empty() {
            return;
        }
        if self.listener.is_closed() || core.is_stopping() {
            for op in parked {
                core.pool().release(op);
            }
            return;
        }

        tracing::debug!("re-issuing {} paused accepts", parked.len());
        for op in parked {
            self.repost(core, op);
        }
    }

    /// Returns every withdrawn accept to `pool`.
    pub(crate) fn release_parked(&self, pool: &OperationPool) -> usize {
        let parked = std::mem::take(&mut *self.lock_parked());
        let count = parked.len();
        for op in parked {
            pool.release(op);
        }
        count
    }

    /// Turns a completed accept into a live connection.
    pub(crate) fn on_accept(&self, core: &Arc<EngineCore>, mut op: Box<OperationContext>) {
        let accepted = op.take_accepted();
        self.repost(core, op);

        let Some(socket) = accepted else {
            return;
        };

        let conn = match core.register(socket, ConnectionRole::Accepted) {
            Ok(conn) => conn,
            Err(err) => {
                tracing::warn!("failed to associate accepted socket: {}", err);
                return;
            }
        };

        if let Some(keepalive) = core.config().keepalive {
            if let Err(err) = apply_keepalive(conn.socket(), &keepalive) {
                tracing::warn!("keep-alive on connection {} failed: {}", conn.id(), err);
            }
        }

        core.established(&conn);
        // A rejected receive has already torn the connection down
        let _ = core.post_recv(&conn, core.pool().acquire());
    }

    fn lock_parked(&self) -> MutexGuard<'_, Vec<Box<OperationContext>>> {
        self.parked.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn submit(&self, core: &EngineCore, mut op: Box<OperationContext>) -> io::Result<()> {
        op.prepare(OperationKind::Accept);
        match self.listener.issue(core.port(), op) {
            Ok(()) => Ok(()),
            Err(SubmitError { op, cause }) => {
                core.pool().release(op);
                Err(match cause {
                    SubmitCause::Closed => io::Error::from(io::ErrorKind::NotConnected),
                    SubmitCause::Io(err) => err,
                })
            }
        }
    }
}

/// Accept failures that persist until descriptors or memory are freed.
pub(crate) fn is_resource_exhaustion(err: &io::Error) -> bool {
    matches!(
        err.raw_os_error(),
        Some(libc::EMFILE | libc::ENFILE | libc::ENOBUFS | libc::ENOMEM)
    )
}

fn apply_keepalive(socket: &Socket, config: &KeepaliveConfig) -> io::Result<()> {
    let keepalive = TcpKeepalive::new()
        .with_time(config.idle)
        .with_interval(config.interval);
    socket.set_tcp_keepalive(&keepalive)
}
