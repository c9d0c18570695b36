//! Connecting side: one outbound connection per client.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};

use super::engine::EngineCore;
use crate::context::{Connection, ConnectionRole};
use crate::error::{EngineError, Result};

/// Connects synchronously, then hands the socket to the engine and issues
/// the first receive.
pub(crate) fn connect(
    core: &Arc<EngineCore>,
    addr: SocketAddr,
    timeout: Option<Duration>,
) -> Result<Arc<Connection>> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
        .map_err(|e| EngineError::socket("socket", e))?;

    let target = addr.into();
    match timeout {
        Some(timeout) => socket.connect_timeout(&target, timeout),
        None => socket.connect(&target),
    }
    .map_err(|e| EngineError::socket("connect", e))?;

    socket
        .set_nonblocking(true)
        .map_err(|e| EngineError::socket("setsockopt", e))?;

    let conn = core
        .register(socket, ConnectionRole::Outbound)
        .map_err(|e| EngineError::socket("associate", e))?;
    tracing::debug!("connected to {} as connection {}", addr, conn.id());

    core.established(&conn);
    core.post_recv(&conn, core.pool().acquire())?;
    Ok(conn)
}
