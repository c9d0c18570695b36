//! Listening engine.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::acceptor::Acceptor;
use super::engine::{listener_addr, Engine, EngineCore};
use super::handler::Handler;
use crate::config::ServerConfig;
use crate::context::{Connection, OperationPool};
use crate::error::{EngineError, Result};

/// Accepts TCP connections and drives them through a [`Handler`].
///
/// The server can be stopped and started again; the operation pool survives
/// restarts.
pub struct Server {
    config: ServerConfig,
    handler: Arc<dyn Handler>,
    pool: Arc<OperationPool>,
    running: Mutex<Option<Engine>>,
}

impl Server {
    pub fn new(config: ServerConfig, handler: Arc<dyn Handler>) -> Self {
        let pool = Arc::new(OperationPool::with_capacity(config.engine.pool_capacity));
        Self::with_pool(config, handler, pool)
    }

    /// Builds a server that draws operation contexts from `pool`.
    pub fn with_pool(
        config: ServerConfig,
        handler: Arc<dyn Handler>,
        pool: Arc<OperationPool>,
    ) -> Self {
        Self {
            config,
            handler,
            pool,
            running: Mutex::new(None),
        }
    }

    /// Listens on `port` of the configured bind address with `max_accepts`
    /// accepts kept outstanding. Port `0` picks an ephemeral port.
    pub fn start(&self, port: u16, max_accepts: usize) -> Result<()> {
        self.start_on(SocketAddr::new(self.config.bind_ip, port), max_accepts)
    }

    /// Listens on `addr`.
    ///
    /// Anything already set up is torn down again if a step fails.
    pub fn start_on(&self, addr: SocketAddr, max_accepts: usize) -> Result<()> {
        let mut running = self.lock();
        if running.is_some() {
            return Err(EngineError::AlreadyRunning);
        }

        let engine = Engine::launch(&self.config.engine, self.pool.clone(), self.handler.clone())?;
        if let Err(err) = Self::listen(engine.core(), addr, self.config.backlog, max_accepts) {
            tracing::error!("failed to start server on {}: {}", addr, err);
            engine.shutdown();
            return Err(err);
        }

        tracing::info!(
            "server listening on {:?}",
            listener_addr(engine.core()).unwrap_or(addr)
        );
        *running = Some(engine);
        Ok(())
    }

    fn listen(
        core: &Arc<EngineCore>,
        addr: SocketAddr,
        backlog: i32,
        max_accepts: usize,
    ) -> Result<()> {
        let acceptor = Acceptor::open(core, addr, backlog, max_accepts)?;
        core.install_acceptor(acceptor).arm(core)
    }

    /// Stops the workers, closes every connection and the listener.
    ///
    /// Live connections get `on_closed`. Stopping a stopped server is a no-op.
    pub fn stop(&self) -> Result<()> {
        let engine = self.lock().take();
        if let Some(engine) = engine {
            engine.shutdown();
            tracing::info!("server stopped");
        }
        Ok(())
    }

    /// Sends `payload` on `conn`; see [`Connection::send`].
    pub fn send(&self, conn: &Connection, payload: &[u8]) -> Result<()> {
        self.core().ok_or(EngineError::NotRunning)?.send(conn, payload)
    }

    /// Established connections not yet closed.
    pub fn connection_count(&self) -> usize {
        self.core().map_or(0, |core| core.connection_count())
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.core().and_then(|core| listener_addr(&core))
    }

    pub fn is_running(&self) -> bool {
        self.lock().is_some()
    }

    pub fn pool(&self) -> &Arc<OperationPool> {
        &self.pool
    }

    fn core(&self) -> Option<Arc<EngineCore>> {
        self.lock().as_ref().map(|engine| engine.core().clone())
    }

    fn lock(&self) -> MutexGuard<'_, Option<Engine>> {
        self.running.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ClientConfig, EngineConfig, DEFAULT_MAX_ACCEPTS};
    use crate::context::BUFFER_SIZE;
    use crate::net::testing::Recorder;
    use crate::net::Client;
    use rand::Rng;
    use std::io::Write;
    use std::net::{IpAddr, Ipv4Addr, TcpStream};
    use std::thread;
    use std::time::Duration;

    fn engine_config() -> EngineConfig {
        EngineConfig {
            worker_threads: Some(4),
            ..EngineConfig::default()
        }
    }

    fn server(handler: Arc<Recorder>) -> Server {
        let config = ServerConfig {
            engine: engine_config(),
            bind_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            ..ServerConfig::default()
        };
        Server::new(config, handler)
    }

    fn client(handler: Arc<Recorder>) -> Client {
        let config = ClientConfig {
            engine: engine_config(),
            ..ClientConfig::default()
        };
        Client::new(config, handler)
    }

    fn port_of(server: &Server) -> u16 {
        server.local_addr().expect("listening").port()
    }

    #[test]
    fn test_ping_echo() {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
        let server_events = Recorder::echoing();
        let server = server(server_events.clone());
        server.start(0, DEFAULT_MAX_ACCEPTS).unwrap();

        let client_events = Recorder::new();
        let client = client(client_events.clone());
        client.connect("127.0.0.1", port_of(&server)).unwrap();
        client.send(b"ping").unwrap();

        let received = client_events.wait_for(|e| e.received.len() >= 4);
        assert_eq!(received.received, b"ping");

        let events = server_events.wait_for(|e| e.sent == 4);
        assert_eq!(events.established, 1);
        assert_eq!(events.received, b"ping");
        assert_eq!(server.connection_count(), 1);

        client.disconnect().unwrap();
        server.stop().unwrap();
    }

    #[test]
    fn test_full_buffer_payload_arrives_intact() {
        let events = Recorder::new();
        let server = server(events.clone());
        server.start(0, DEFAULT_MAX_ACCEPTS).unwrap();

        let mut payload = vec![0u8; BUFFER_SIZE];
        rand::thread_rng().fill(&mut payload[..]);
        let client = client(Recorder::new());
        client.connect("127.0.0.1", port_of(&server)).unwrap();
        client.send(&payload).unwrap();

        // The bytes may arrive over several receives
        let events = events.wait_for(|e| e.received.len() >= BUFFER_SIZE);
        assert_eq!(events.received, payload);
        assert!(events.recv_calls >= 1);

        server.stop().unwrap();
    }

    #[test]
    fn test_abrupt_close_reports_once() {
        let events = Recorder::new();
        let server = server(events.clone());
        server.start(0, DEFAULT_MAX_ACCEPTS).unwrap();

        let mut peer = TcpStream::connect(("127.0.0.1", port_of(&server))).unwrap();
        peer.write_all(b"hello").unwrap();
        events.wait_for(|e| e.established == 1 && e.received.len() == 5);
        assert_eq!(server.connection_count(), 1);

        drop(peer);
        events.wait_for(|e| e.terminal() == 1);
        assert_eq!(server.connection_count(), 0);

        thread::sleep(Duration::from_millis(100));
        assert_eq!(events.events().terminal(), 1);
        assert_eq!(events.events().closed, 1);

        // Already torn down, so stopping reports nothing more
        server.stop().unwrap();
        assert_eq!(events.events().terminal(), 1);
    }

    #[test]
    fn test_reset_peer_reports_error_once() {
        let events = Recorder::new();
        let server = server(events.clone());
        server.start(0, DEFAULT_MAX_ACCEPTS).unwrap();

        let peer = TcpStream::connect(("127.0.0.1", port_of(&server))).unwrap();
        events.wait_for(|e| e.established == 1);

        // Zero linger turns the close into an RST
        let peer = socket2::Socket::from(peer);
        peer.set_linger(Some(Duration::ZERO)).unwrap();
        drop(peer);

        events.wait_for(|e| e.terminal() == 1);
        thread::sleep(Duration::from_millis(100));
        let seen = events.events();
        assert_eq!(seen.errors, 1);
        assert_eq!(seen.closed, 0);
        assert_eq!(server.connection_count(), 0);

        server.stop().unwrap();
        assert_eq!(events.events().terminal(), 1);
    }

    #[test]
    fn test_burst_beyond_outstanding_accepts() {
        let events = Recorder::new();
        let server = server(events.clone());
        server.start(0, 10).unwrap();

        let port = port_of(&server);
        let peers: Vec<TcpStream> = (0..50)
            .map(|_| TcpStream::connect(("127.0.0.1", port)).unwrap())
            .collect();

        events.wait_for(|e| e.established == 50);
        assert_eq!(server.connection_count(), 50);

        drop(peers);
        events.wait_for(|e| e.terminal() == 50);
        assert_eq!(server.connection_count(), 0);

        server.stop().unwrap();
    }

    #[test]
    fn test_count_tracks_churn() {
        let events = Recorder::echoing();
        let server = server(events.clone());
        server.start(0, 8).unwrap();
        let port = port_of(&server);

        let kept: Vec<TcpStream> = thread::scope(|scope| {
            let churners: Vec<_> = (0..4)
                .map(|worker| {
                    scope.spawn(move || {
                        let mut kept = Vec::new();
                        for round in 0..25 {
                            let mut peer = TcpStream::connect(("127.0.0.1", port)).unwrap();
                            peer.write_all(b"churn").unwrap();
                            match (worker + round) % 5 {
                                0 => kept.push(peer),
                                1 => {
                                    let peer = socket2::Socket::from(peer);
                                    peer.set_linger(Some(Duration::ZERO)).unwrap();
                                }
                                _ => {}
                            }
                        }
                        kept
                    })
                })
                .collect();
            churners
                .into_iter()
                .flat_map(|churner| churner.join().unwrap())
                .collect()
        });

        let opened = 100;
        let live = kept.len();
        let seen = events.wait_for(|e| e.established == opened && e.terminal() == opened - live);
        assert_eq!(server.connection_count(), seen.established - seen.terminal());
        assert_eq!(server.connection_count(), live);

        drop(kept);
        let seen = events.wait_for(|e| e.terminal() == opened);
        assert_eq!(seen.established, opened);
        assert_eq!(server.connection_count(), 0);

        server.stop().unwrap();
        assert_eq!(events.events().terminal(), opened);
        assert_eq!(server.pool().idle(), server.pool().allocated());
    }

    #[test]
    fn test_oversized_send_keeps_connection() {
        let events = Recorder::new();
        let server = server(events.clone());
        server.start(0, DEFAULT_MAX_ACCEPTS).unwrap();

        let client = client(Recorder::new());
        client.connect("127.0.0.1", port_of(&server)).unwrap();
        events.wait_for(|e| e.established == 1);

        let oversized = vec![7u8; BUFFER_SIZE + 1];
        assert!(matches!(
            client.send(&oversized),
            Err(EngineError::PayloadTooLarge { len, .. }) if len == BUFFER_SIZE + 1
        ));
        assert!(matches!(client.send(b""), Err(EngineError::EmptyPayload)));
        assert!(client.is_connected());

        client.send(b"still here").unwrap();
        let events = events.wait_for(|e| e.received.len() >= 10);
        assert_eq!(events.received, b"still here");
        assert_eq!(events.terminal(), 0);

        server.stop().unwrap();
    }

    #[test]
    fn test_stop_closes_live_connections() {
        let events = Recorder::new();
        let server = server(events.clone());
        server.start(0, DEFAULT_MAX_ACCEPTS).unwrap();

        let port = port_of(&server);
        let _peers: Vec<TcpStream> = (0..3)
            .map(|_| TcpStream::connect(("127.0.0.1", port)).unwrap())
            .collect();
        events.wait_for(|e| e.established == 3);

        server.stop().unwrap();
        let events = events.events();
        assert_eq!(events.closed, 3);
        assert_eq!(server.connection_count(), 0);
        assert!(!server.is_running());
    }

    #[test]
    fn test_restart() {
        let events = Recorder::echoing();
        let server = server(events.clone());

        server.start(0, DEFAULT_MAX_ACCEPTS).unwrap();
        assert!(matches!(
            server.start(0, DEFAULT_MAX_ACCEPTS),
            Err(EngineError::AlreadyRunning)
        ));
        server.stop().unwrap();
        server.stop().unwrap();
        assert!(server.local_addr().is_none());

        server.start(0, DEFAULT_MAX_ACCEPTS).unwrap();
        let client = client(Recorder::new());
        client.connect("127.0.0.1", port_of(&server)).unwrap();
        client.send(b"again").unwrap();
        events.wait_for(|e| e.received == b"again");

        client.disconnect().unwrap();
        server.stop().unwrap();
    }

    #[test]
    fn test_operations_return_to_pool() {
        let events = Recorder::echoing();
        let server = server(events.clone());
        server.start(0, 4).unwrap();

        let client = client(Recorder::new());
        client.connect("127.0.0.1", port_of(&server)).unwrap();
        for _ in 0..5 {
            client.send(b"tick").unwrap();
        }
        events.wait_for(|e| e.sent == 20);
        client.disconnect().unwrap();
        server.stop().unwrap();

        let pool = server.pool();
        assert!(pool.allocated() > 0);
        assert_eq!(pool.idle(), pool.allocated());
    }

    #[test]
    fn test_bind_conflict_rolls_back() {
        let first = server(Recorder::new());
        first.start(0, 1).unwrap();
        let taken = first.local_addr().unwrap();

        let second = server(Recorder::new());
        let err = second.start_on(taken, 1).unwrap_err();
        assert!(matches!(err, EngineError::Socket { stage: "bind", .. }));
        assert!(!second.is_running());

        // Nothing leaked from the failed start
        assert_eq!(second.pool().idle(), second.pool().allocated());
        first.stop().unwrap();
    }

    #[test]
    fn test_idle_server_reports_nothing() {
        let server = server(Recorder::new());
        assert_eq!(server.connection_count(), 0);
        assert!(server.local_addr().is_none());
        assert!(!server.is_running());
    }
}
