//! Connecting engine.

use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::connector;
use super::engine::Engine;
use super::handler::Handler;
use crate::config::ClientConfig;
use crate::context::{Connection, OperationPool};
use crate::error::{EngineError, Result};

struct Session {
    engine: Engine,
    conn: Arc<Connection>,
}

/// One outbound TCP connection driven through a [`Handler`].
pub struct Client {
    config: ClientConfig,
    handler: Arc<dyn Handler>,
    pool: Arc<OperationPool>,
    session: Mutex<Option<Session>>,
}

impl Client {
    pub fn new(config: ClientConfig, handler: Arc<dyn Handler>) -> Self {
        let pool = Arc::new(OperationPool::with_capacity(config.engine.pool_capacity));
        Self::with_pool(config, handler, pool)
    }

    pub fn with_pool(
        config: ClientConfig,
        handler: Arc<dyn Handler>,
        pool: Arc<OperationPool>,
    ) -> Self {
        Self {
            config,
            handler,
            pool,
            session: Mutex::new(None),
        }
    }

    /// Connects to `address:port`; `address` is an IP literal or a host name.
    pub fn connect(&self, address: &str, port: u16) -> Result<()> {
        let addr = (address, port)
            .to_socket_addrs()
            .ok()
            .and_then(|mut addrs| addrs.next())
            .ok_or_else(|| EngineError::InvalidAddress(address.to_string()))?;
        self.connect_to(addr)
    }

    /// Starts the workers and connects to `addr`.
    ///
    /// Fails with [`EngineError::AlreadyRunning`] while a session is open.
    pub fn connect_to(&self, addr: SocketAddr) -> Result<()> {
        let mut session = self.lock();
        if session.is_some() {
            return Err(EngineError::AlreadyRunning);
        }

        let engine = Engine::launch(&self.config.engine, self.pool.clone(), self.handler.clone())?;
        let conn = match connector::connect(engine.core(), addr, self.config.connect_timeout) {
            Ok(conn) => conn,
            Err(err) => {
                tracing::error!("failed to connect to {}: {}", addr, err);
                engine.shutdown();
                return Err(err);
            }
        };

        *session = Some(Session { engine, conn });
        Ok(())
    }

    /// Closes the connection and stops the workers. No-op when not connected.
    pub fn disconnect(&self) -> Result<()> {
        let session = self.lock().take();
        if let Some(Session { engine, conn }) = session {
            engine.shutdown();
            tracing::info!("disconnected connection {}", conn.id());
        }
        Ok(())
    }

    pub fn send(&self, payload: &[u8]) -> Result<()> {
        let conn = self.connection().ok_or(EngineError::NotRunning)?;
        conn.send(payload)
    }

    /// The outbound connection of the current session.
    pub fn connection(&self) -> Option<Arc<Connection>> {
        self.lock().as_ref().map(|session| session.conn.clone())
    }

    /// Whether a session is open and its connection is still up.
    pub fn is_connected(&self) -> bool {
        self.lock()
            .as_ref()
            .map_or(false, |session| !session.conn.is_closed())
    }

    pub fn pool(&self) -> &Arc<OperationPool> {
        &self.pool
    }

    fn lock(&self) -> MutexGuard<'_, Option<Session>> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        let _ = self.disconnect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::net::testing::Recorder;
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::thread;

    fn client(handler: Arc<Recorder>) -> Client {
        let config = ClientConfig {
            engine: EngineConfig {
                worker_threads: Some(2),
                ..EngineConfig::default()
            },
            ..ClientConfig::default()
        };
        Client::new(config, handler)
    }

    /// Blocking echo peer for a single connection.
    fn echo_peer() -> (SocketAddr, thread::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut buf = [0u8; 1024];
            loop {
                match stream.read(&mut buf) {
                    Ok(0) | Err(_) => return,
                    Ok(n) => stream.write_all(&buf[..n]).unwrap(),
                }
            }
        });
        (addr, handle)
    }

    #[test]
    fn test_round_trip() {
        let (addr, peer) = echo_peer();
        let events = Recorder::new();
        let client = client(events.clone());

        client.connect_to(addr).unwrap();
        assert!(client.is_connected());
        assert_eq!(events.events().established, 1);

        client.send(b"Hello Server1!").unwrap();
        client.send(b"Hello Server2!").unwrap();
        let events_seen = events.wait_for(|e| e.received.len() >= 28);
        assert_eq!(events_seen.received, b"Hello Server1!Hello Server2!");

        client.disconnect().unwrap();
        assert!(!client.is_connected());
        assert_eq!(events.events().closed, 1);
        peer.join().unwrap();
    }

    #[test]
    fn test_peer_close_is_reported() {
        let (addr, peer) = echo_peer();
        let events = Recorder::new();
        let client = client(events.clone());
        client.connect_to(addr).unwrap();

        let conn = client.connection().unwrap();
        // Half-close our side; the echo peer returns and drops its stream
        conn.socket().shutdown(std::net::Shutdown::Write).unwrap();
        peer.join().unwrap();

        events.wait_for(|e| e.terminal() == 1);
        assert!(!client.is_connected());
        assert!(matches!(
            client.send(b"late"),
            Err(EngineError::ConnectionClosed(id)) if id == conn.id()
        ));

        client.disconnect().unwrap();
        assert_eq!(events.events().terminal(), 1);
    }

    #[test]
    fn test_invalid_address() {
        let client = client(Recorder::new());
        assert!(matches!(
            client.connect("not an address", 80),
            Err(EngineError::InvalidAddress(_))
        ));
        assert!(!client.is_connected());
    }

    #[test]
    fn test_connect_refused_rolls_back() {
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap()
        };

        let events = Recorder::new();
        let client = client(events.clone());
        let err = client.connect_to(addr).unwrap_err();
        assert!(matches!(err, EngineError::Socket { stage: "connect", .. }));
        assert!(client.connection().is_none());
        assert_eq!(events.events().established, 0);

        // A later attempt works normally
        let (addr, peer) = echo_peer();
        client.connect_to(addr).unwrap();
        assert!(matches!(client.connect_to(addr), Err(EngineError::AlreadyRunning)));
        client.disconnect().unwrap();
        peer.join().unwrap();
    }

    #[test]
    fn test_send_before_connect() {
        let client = client(Recorder::new());
        assert!(matches!(client.send(b"x"), Err(EngineError::NotRunning)));
    }
}
