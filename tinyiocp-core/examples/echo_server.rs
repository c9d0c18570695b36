//! Echo server example for tinyiocp.
//!
//! Listens on port 9988 and echoes every received chunk back to its sender.
//! Press Enter to stop.

use std::io::{self, BufRead};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Result;
use tinyiocp_core::config::{DEFAULT_MAX_ACCEPTS, DEFAULT_PORT};
use tinyiocp_core::{Connection, Handler, Server, ServerConfig};

#[derive(Default)]
struct Echo {
    bytes: AtomicU64,
}

impl Handler for Echo {
    fn on_established(&self, conn: &Connection) {
        println!("[{}] connected from {:?}", conn.id(), conn.peer_addr());
    }

    fn on_closed(&self, conn: &Connection) {
        println!("[{}] closed", conn.id());
    }

    fn on_error(&self, conn: &Connection, error: &io::Error) {
        println!("[{}] error: {}", conn.id(), error);
    }

    fn on_recv(&self, conn: &Connection, data: &[u8]) {
        println!("[{}] received: {}", conn.id(), String::from_utf8_lossy(data));
        if let Err(e) = conn.send(data) {
            eprintln!("[{}] echo failed: {}", conn.id(), e);
        }
    }

    fn on_send(&self, _conn: &Connection, bytes_sent: usize) {
        self.bytes.fetch_add(bytes_sent as u64, Ordering::Relaxed);
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let handler = Arc::new(Echo::default());
    let server = Server::new(ServerConfig::default(), handler.clone());
    server.start(DEFAULT_PORT, DEFAULT_MAX_ACCEPTS)?;
    println!("Echo server listening on {:?}, press Enter to stop", server.local_addr());

    let mut line = String::new();
    io::stdin().lock().read_line(&mut line)?;

    println!("{} live connections at shutdown", server.connection_count());
    server.stop()?;
    println!("Echoed {} bytes in total", handler.bytes.load(Ordering::Relaxed));
    Ok(())
}
