//! Error types for the completion engine.

use std::io;

use thiserror::Error;

use crate::context::OperationKind;

/// Errors reported by the engine's control surface.
#[derive(Debug, Error)]
pub enum EngineError {
    /// `start`/`connect` was called on an engine that is already running.
    #[error("engine is already running")]
    AlreadyRunning,

    /// The operation needs a running engine.
    #[error("engine is not running")]
    NotRunning,

    /// The completion port could not be created.
    #[error("failed to create completion port: {0}")]
    Port(#[source] io::Error),

    /// A worker thread could not be spawned.
    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[source] io::Error),

    /// Socket setup failed while starting or connecting.
    #[error("socket setup failed during {stage}: {source}")]
    Socket {
        /// Setup step that failed (`bind`, `listen`, `connect`, ...).
        stage: &'static str,
        #[source]
        source: io::Error,
    },

    /// The remote address could not be parsed.
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    /// The payload does not fit into one operation buffer.
    #[error("payload of {len} bytes exceeds operation buffer capacity of {capacity} bytes")]
    PayloadTooLarge {
        /// Requested payload length.
        len: usize,
        /// Operation buffer capacity.
        capacity: usize,
    },

    /// Empty payloads are refused; a zero-byte completion means the peer closed.
    #[error("refusing to send an empty payload")]
    EmptyPayload,

    /// The connection has been torn down.
    #[error("connection {0} is closed")]
    ConnectionClosed(u64),

    /// Issuing an operation failed; the connection has been torn down.
    #[error("failed to submit {kind:?} operation: {source}")]
    Submit {
        /// Kind of the rejected operation.
        kind: OperationKind,
        #[source]
        source: io::Error,
    },
}

impl EngineError {
    pub(crate) fn socket(stage: &'static str, source: io::Error) -> Self {
        Self::Socket { stage, source }
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, EngineError>;
