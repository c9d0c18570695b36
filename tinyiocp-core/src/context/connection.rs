//! Per-socket connection state.

use std::collections::HashMap;
use std::fmt;
use std::net::{Shutdown, SocketAddr};
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError, Weak};

use socket2::Socket;

use super::operation::{OperationContext, OperationId, OperationKind};
use crate::error::{EngineError, Result};
use crate::net::engine::EngineCore;
use crate::port::{CompletionPort, SubmitError};

/// What a connection's socket is used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionRole {
    /// The acceptor's listening socket. Never carries user data.
    Listener,

    /// A connection accepted by the listener.
    Accepted,

    /// The client's outbound connection.
    Outbound,
}

/// A live socket registered with the engine.
///
/// Handlers receive `&Connection` in every callback. It stays valid for the
/// duration of the call even if another worker tears the connection down at
/// the same time; after teardown every operation on it fails with
/// [`EngineError::ConnectionClosed`].
pub struct Connection {
    token: u64,
    role: ConnectionRole,
    socket: Socket,
    local: Option<SocketAddr>,
    peer: Option<SocketAddr>,
    closing: AtomicBool,
    next_op: AtomicU64,
    outstanding: Mutex<HashMap<OperationId, OperationKind>>,
    engine: Weak<EngineCore>,
}

impl Connection {
    pub(crate) fn new(
        token: u64,
        role: ConnectionRole,
        socket: Socket,
        engine: Weak<EngineCore>,
    ) -> Self {
        let local = socket.local_addr().ok().and_then(|addr| addr.as_socket());
        let peer = match role {
            ConnectionRole::Listener => None,
            _ => socket.peer_addr().ok().and_then(|addr| addr.as_socket()),
        };

        Self {
            token,
            role,
            socket,
            local,
            peer,
            closing: AtomicBool::new(false),
            next_op: AtomicU64::new(1),
            outstanding: Mutex::new(HashMap::new()),
            engine,
        }
    }

    /// Token the completion port reports for this connection.
    pub fn id(&self) -> u64 {
        self.token
    }

    pub fn role(&self) -> ConnectionRole {
        self.role
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local
    }

    /// Remote address; `None` for the listening socket.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// Whether teardown has started.
    pub fn is_closed(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    /// Number of operations issued on this connection and not yet completed.
    pub fn outstanding(&self) -> usize {
        self.lock_outstanding().len()
    }

    /// Sends `payload` through the engine that owns this connection.
    ///
    /// Equivalent to `Server::send(conn, payload)`; usable from handler callbacks.
    pub fn send(&self, payload: &[u8]) -> Result<()> {
        let engine = self.engine.upgrade().ok_or(EngineError::NotRunning)?;
        engine.send(self, payload)
    }

    pub(crate) fn socket(&self) -> &Socket {
        &self.socket
    }

    /// Records `op` as outstanding and submits it, both under the set's lock.
    ///
    /// Fails with [`SubmitCause::Closed`](crate::port::SubmitCause::Closed)
    /// once teardown has started.
    pub(crate) fn issue(
        &self,
        port: &CompletionPort,
        mut op: Box<OperationContext>,
    ) -> std::result::Result<(), SubmitError> {
        let mut outstanding = self.lock_outstanding();
        if self.is_closed() {
            return Err(SubmitError::closed(op));
        }

        let id = OperationId(self.next_op.fetch_add(1, Ordering::Relaxed));
        let kind = op.kind();
        op.bind(id, self.socket.as_raw_fd());

        outstanding.insert(id, kind);
        match port.submit(self.socket.as_raw_fd(), op) {
            Ok(()) => Ok(()),
            Err(err) => {
                outstanding.remove(&id);
                Err(err)
            }
        }
    }

    /// Marks `id` as completed. Returns `false` if it was not outstanding,
    /// which means teardown already claimed it.
    pub(crate) fn complete(&self, id: OperationId) -> bool {
        self.lock_outstanding().remove(&id).is_some()
    }

    /// Claims teardown. Only the first caller gets `true`.
    pub(crate) fn begin_close(&self) -> bool {
        self.closing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Drops every outstanding operation, removes the socket from the port
    /// and shuts it down. Pending operations come back as aborted completions.
    ///
    /// Returns the number of operations that were outstanding.
    pub(crate) fn shutdown(&self, port: &CompletionPort) -> usize {
        let mut outstanding = self.lock_outstanding();
        let drained = outstanding.len();
        outstanding.clear();

        port.deregister(self.socket.as_raw_fd());
        drop(outstanding);

        if self.role != ConnectionRole::Listener {
            if let Err(err) = self.socket.shutdown(Shutdown::Both) {
                tracing::trace!("shutdown of connection {} failed: {}", self.token, err);
            }
        }
        drained
    }

    /// Zero-length send plus a pending socket error check.
    pub(crate) fn is_alive(&self) -> bool {
        let rc = unsafe {
            libc::send(
                self.socket.as_raw_fd(),
                std::ptr::null(),
                0,
                libc::MSG_NOSIGNAL,
            )
        };
        rc >= 0 && matches!(self.socket.take_error(), Ok(None))
    }

    fn lock_outstanding(&self) -> MutexGuard<'_, HashMap<OperationId, OperationKind>> {
        self.outstanding
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl AsRawFd for Connection {
    fn as_raw_fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.token)
            .field("role", &self.role)
            .field("local", &self.local)
            .field("peer", &self.peer)
            .field("closed", &self.is_closed())
            .finish()
    }
}
