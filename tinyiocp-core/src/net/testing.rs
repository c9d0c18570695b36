//! Recording handler shared by the server and client tests.

use std::io;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use super::handler::Handler;
use crate::context::Connection;

const WAIT: Duration = Duration::from_secs(10);

#[derive(Debug, Default, Clone)]
pub(crate) struct Events {
    pub established: usize,
    pub closed: usize,
    pub errors: usize,
    pub recv_calls: usize,
    pub received: Vec<u8>,
    pub sent: usize,
}

impl Events {
    pub fn terminal(&self) -> usize {
        self.closed + self.errors
    }
}

/// Records every callback; echoes received bytes when asked to.
#[derive(Default)]
pub(crate) struct Recorder {
    events: Mutex<Events>,
    changed: Condvar,
    echo: bool,
}

impl Recorder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn echoing() -> Arc<Self> {
        Arc::new(Self {
            echo: true,
            ..Self::default()
        })
    }

    pub fn events(&self) -> Events {
        self.lock().clone()
    }

    /// Waits until `done` holds; returns the final state.
    pub fn wait_for(&self, done: impl Fn(&Events) -> bool) -> Events {
        let deadline = Instant::now() + WAIT;
        let mut events = self.lock();
        while !done(&events) {
            let now = Instant::now();
            assert!(now < deadline, "timed out waiting, last state {:?}", *events);
            events = self.changed.wait_timeout(events, deadline - now).unwrap().0;
        }
        events.clone()
    }

    fn record(&self, update: impl FnOnce(&mut Events)) {
        update(&mut self.lock());
        self.changed.notify_all();
    }

    fn lock(&self) -> MutexGuard<'_, Events> {
        self.events.lock().unwrap()
    }
}

impl Handler for Recorder {
    fn on_established(&self, _conn: &Connection) {
        self.record(|e| e.established += 1);
    }

    fn on_closed(&self, _conn: &Connection) {
        self.record(|e| e.closed += 1);
    }

    fn on_error(&self, _conn: &Connection, _error: &io::Error) {
        self.record(|e| e.errors += 1);
    }

    fn on_recv(&self, conn: &Connection, data: &[u8]) {
        self.record(|e| {
            e.recv_calls += 1;
            e.received.extend_from_slice(data);
        });
        if self.echo {
            let _ = conn.send(data);
        }
    }

    fn on_send(&self, _conn: &Connection, bytes_sent: usize) {
        self.record(|e| e.sent += bytes_sent);
    }
}
