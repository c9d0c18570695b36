//! Per-request operation state.
//!
//! An [`OperationContext`] travels with one asynchronous request: it is handed
//! to the completion port on submission and handed back inside the completion.
//! Between requests it sits in the [`OperationPool`](super::OperationPool).

use std::fmt;
use std::os::unix::io::RawFd;

use socket2::Socket;

use crate::error::{EngineError, Result};

/// Capacity of every operation buffer in bytes.
pub const BUFFER_SIZE: usize = 4 * 1024; // 4 KiB

/// Identifier issued to an operation when it is submitted on a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OperationId(pub(crate) u64);

impl OperationId {
    /// Id carried by contexts that are not in flight.
    pub const NONE: OperationId = OperationId(0);

    /// Raw id value.
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

/// Kind of asynchronous operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    /// Idle context.
    None,

    /// Accept a connection on a listening socket.
    Accept,

    /// Send the buffered payload.
    Send,

    /// Receive into the buffer.
    Recv,
}

impl OperationKind {
    /// Whether the operation waits for read readiness.
    pub fn is_read_side(self) -> bool {
        matches!(self, Self::Accept | Self::Recv)
    }
}

/// Reusable state for one in-flight operation.
pub struct OperationContext {
    id: OperationId,
    kind: OperationKind,
    socket: RawFd,
    buffer: Box<[u8]>,
    len: usize,
    sent: usize,
    accepted: Option<Socket>,
}

impl OperationContext {
    /// Creates an idle context with a zeroed buffer.
    pub fn new() -> Self {
        Self {
            id: OperationId::NONE,
            kind: OperationKind::None,
            socket: -1,
            buffer: vec![0u8; BUFFER_SIZE].into_boxed_slice(),
            len: 0,
            sent: 0,
            accepted: None,
        }
    }

    /// Buffer capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.buffer.len()
    }

    pub fn id(&self) -> OperationId {
        self.id
    }

    pub fn kind(&self) -> OperationKind {
        self.kind
    }

    /// Socket the operation runs on, `-1` when idle.
    pub fn socket(&self) -> RawFd {
        self.socket
    }

    /// Valid bytes: the received data for a receive, the payload for a send.
    pub fn data(&self) -> &[u8] {
        &self.buffer[..self.len]
    }

    /// Clears the context so it can be used for another request.
    ///
    /// An accepted socket that was never claimed is closed here.
    pub fn reset(&mut self) {
        self.id = OperationId::NONE;
        self.kind = OperationKind::None;
        self.socket = -1;
        self.len = 0;
        self.sent = 0;
        self.accepted = None;
    }

    /// Resets the context and tags it with `kind`.
    pub(crate) fn prepare(&mut self, kind: OperationKind) {
        self.reset();
        self.kind = kind;
    }

    /// Copies `payload` into the buffer and tags the context as a send.
    ///
    /// Fails without touching the buffer if the payload is empty or larger
    /// than the buffer.
    pub fn prepare_send(&mut self, payload: &[u8]) -> Result<()> {
        if payload.is_empty() {
            return Err(EngineError::EmptyPayload);
        }
        if payload.len() > self.capacity() {
            return Err(EngineError::PayloadTooLarge {
                len: payload.len(),
                capacity: self.capacity(),
            });
        }

        self.prepare(OperationKind::Send);
        self.buffer[..payload.len()].copy_from_slice(payload);
        self.len = payload.len();
        Ok(())
    }

    pub(crate) fn bind(&mut self, id: OperationId, socket: RawFd) {
        self.id = id;
        self.socket = socket;
    }

    /// Whole buffer, for the port to receive into.
    pub(crate) fn buffer_mut(&mut self) -> &mut [u8] {
        &mut self.buffer
    }

    pub(crate) fn set_len(&mut self, len: usize) {
        self.len = len.min(self.buffer.len());
    }

    /// Payload bytes not yet written to the socket.
    pub(crate) fn unsent(&self) -> &[u8] {
        &self.buffer[self.sent..self.len]
    }

    pub(crate) fn advance(&mut self, written: usize) {
        self.sent = (self.sent + written).min(self.len);
    }

    pub(crate) fn set_accepted(&mut self, socket: Socket) {
        self.accepted = Some(socket);
    }

    pub(crate) fn take_accepted(&mut self) -> Option<Socket> {
        self.accepted.take()
    }
}

impl Default for OperationContext {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for OperationContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationContext")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("socket", &self.socket)
            .field("len", &self.len)
            .field("sent", &self.sent)
            .field("accepted", &self.accepted.is_some())
            .finish()
    }
}
