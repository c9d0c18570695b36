//! Engine configuration.

use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use crate::arch;

/// Default number of accept operations kept outstanding by a server.
pub const DEFAULT_MAX_ACCEPTS: usize = 10;

/// Default port of the demo server.
pub const DEFAULT_PORT: u16 = 9988;

/// TCP keep-alive applied to accepted connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeepaliveConfig {
    /// Idle time before the first keep-alive packet.
    pub idle: Duration,

    /// Interval between keep-alive packets.
    pub interval: Duration,
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self {
            idle: Duration::from_secs(60),
            interval: Duration::from_secs(10),
        }
    }
}

/// Settings shared by the server and the client engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Number of completion workers; `None` uses `2 × logical cores + 2`.
    pub worker_threads: Option<usize>,

    /// Whether to pin worker threads to CPUs.
    pub pin_threads: bool,

    /// How long `stop`/`disconnect` waits for workers; `None` waits forever.
    pub shutdown_timeout: Option<Duration>,

    /// Keep-alive policy for accepted connections; `None` leaves the OS default.
    pub keepalive: Option<KeepaliveConfig>,

    /// Operation contexts allocated up front when the engine builds its own pool.
    pub pool_capacity: usize,
}

impl EngineConfig {
    /// Resolved worker count.
    pub fn worker_count(&self) -> usize {
        self.worker_threads
            .filter(|&n| n > 0)
            .unwrap_or_else(arch::default_worker_count)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker_threads: None,
            pin_threads: false,
            shutdown_timeout: Some(Duration::from_secs(10)),
            keepalive: Some(KeepaliveConfig::default()),
            pool_capacity: 0,
        }
    }
}

/// Listening engine settings.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub engine: EngineConfig,

    /// Address the listening socket binds to.
    pub bind_ip: IpAddr,

    /// `listen` backlog.
    pub backlog: i32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            engine: EngineConfig::default(),
            bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            backlog: libc::SOMAXCONN,
        }
    }
}

/// Connecting engine settings.
#[derive(Debug, Clone, Default)]
pub struct ClientConfig {
    pub engine: EngineConfig,

    /// Limit for the synchronous connect; `None` uses the OS timeout.
    pub connect_timeout: Option<Duration>,
}
