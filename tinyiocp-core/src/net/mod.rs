//! Network engine.
//!
//! This module is responsible for:
//! - The [`Handler`] callbacks applications implement
//! - The [`Server`] role that keeps accepts outstanding on a listening socket
//! - The [`Client`] role that drives one outbound connection
//! - The worker pool and dispatch shared by both roles

mod acceptor;
mod client;
mod connector;
pub(crate) mod engine;
mod handler;
mod server;
mod worker;

#[cfg(test)]
pub(crate) mod testing;

pub use client::Client;
pub use handler::Handler;
pub use server::Server;
