//! Echo client example for tinyiocp.
//!
//! Connects to the echo server on localhost, sends two greetings one second
//! apart and prints whatever comes back.

use std::io;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use tinyiocp_core::config::DEFAULT_PORT;
use tinyiocp_core::{Client, ClientConfig, Connection, Handler};

struct Printer;

impl Handler for Printer {
    fn on_established(&self, conn: &Connection) {
        println!("connected to {:?}", conn.peer_addr());
    }

    fn on_closed(&self, _conn: &Connection) {
        println!("connection closed");
    }

    fn on_error(&self, _conn: &Connection, error: &io::Error) {
        println!("connection failed: {}", error);
    }

    fn on_recv(&self, _conn: &Connection, data: &[u8]) {
        println!("echo: {}", String::from_utf8_lossy(data));
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let config = ClientConfig {
        connect_timeout: Some(Duration::from_secs(5)),
        ..ClientConfig::default()
    };
    let client = Client::new(config, Arc::new(Printer));
    client
        .connect("127.0.0.1", DEFAULT_PORT)
        .context("is the echo server running?")?;

    for message in ["Hello Server1!", "Hello Server2!"] {
        client.send(message.as_bytes())?;
        thread::sleep(Duration::from_secs(1));
    }

    client.disconnect()?;
    Ok(())
}
