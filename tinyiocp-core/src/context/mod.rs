//! Operation and connection contexts.
//!
//! This module is responsible for:
//! - The per-request [`OperationContext`] and its fixed-size buffer
//! - The shared [`OperationPool`] that recycles contexts across connections
//! - The per-socket [`Connection`] that tracks its outstanding operations

pub mod connection;
pub mod operation;
pub mod pool;

pub use connection::{Connection, ConnectionRole};
pub use operation::{OperationContext, OperationId, OperationKind, BUFFER_SIZE};
pub use pool::OperationPool;
