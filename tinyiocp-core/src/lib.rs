//! tinyiocp core - completion-based TCP engine
//!
//! Sockets are associated with a [`CompletionPort`](port::CompletionPort);
//! accept, receive and send operations are issued with pooled
//! [`OperationContext`]s and a pool of worker threads turns every completion
//! into a [`Handler`] callback.
//!
//! ```no_run
//! use std::sync::Arc;
//! use tinyiocp_core::{Connection, Handler, Server, ServerConfig};
//!
//! struct Echo;
//!
//! impl Handler for Echo {
//!     fn on_closed(&self, _conn: &Connection) {}
//!     fn on_error(&self, _conn: &Connection, _error: &std::io::Error) {}
//!     fn on_recv(&self, conn: &Connection, data: &[u8]) {
//!         let _ = conn.send(data);
//!     }
//! }
//!
//! let server = Server::new(ServerConfig::default(), Arc::new(Echo));
//! server.start(9988, 10)?;
//! # Ok::<(), tinyiocp_core::EngineError>(())
//! ```

/// Architecture detection and thread management
pub mod arch;

/// Engine configuration
pub mod config;

/// Operation and connection contexts
pub mod context;

/// Error types
pub mod error;

/// Client, server and worker dispatch
pub mod net;

/// Completion port
pub mod port;

pub use config::{ClientConfig, EngineConfig, KeepaliveConfig, ServerConfig};
pub use context::{Connection, ConnectionRole, OperationContext, OperationKind, OperationPool};
pub use error::{EngineError, Result};
pub use net::{Client, Handler, Server};
