//! Application callbacks.

use std::io;
use std::sync::Arc;

use crate::context::Connection;

/// Event interface implemented by the embedding application.
///
/// Callbacks run synchronously on a worker thread. Receives on one connection
/// never overlap. Completions that arrive once teardown has begun are dropped
/// without a callback, but an `on_recv` or `on_send` already under way on
/// another worker can overlap `on_closed`/`on_error`, so every callback must
/// cope with a connection that is already closed. Exactly one of `on_closed`
/// and `on_error` is delivered per established connection.
pub trait Handler: Send + Sync + 'static {
    /// A connection was accepted or established.
    fn on_established(&self, conn: &Connection) {
        let _ = conn;
    }

    /// The peer closed the connection, or the engine closed it on shutdown.
    fn on_closed(&self, conn: &Connection);

    /// The connection failed with `error` and has been torn down.
    fn on_error(&self, conn: &Connection, error: &io::Error);

    /// `data` holds exactly the bytes of one completed receive.
    fn on_recv(&self, conn: &Connection, data: &[u8]);

    /// A send finished; `bytes_sent` is the full payload length.
    fn on_send(&self, conn: &Connection, bytes_sent: usize) {
        let _ = (conn, bytes_sent);
    }
}

impl<H: Handler> Handler for Arc<H> {
    fn on_established(&self, conn: &Connection) {
        (**self).on_established(conn)
    }

    fn on_closed(&self, conn: &Connection) {
        (**self).on_closed(conn)
    }

    fn on_error(&self, conn: &Connection, error: &io::Error) {
        (**self).on_error(conn, error)
    }

    fn on_recv(&self, conn: &Connection, data: &[u8]) {
        (**self).on_recv(conn, data)
    }

    fn on_send(&self, conn: &Connection, bytes_sent: usize) {
        (**self).on_send(conn, bytes_sent)
    }
}
