//! Accepting while the process is out of descriptors.
//!
//! The descriptor limit is process-wide, so this runs in its own test binary.

use std::fs::{self, File};
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::os::unix::io::AsRawFd;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use socket2::{Domain, Socket, Type};
use tinyiocp_core::{Connection, EngineConfig, Handler, Server, ServerConfig};

const CLIENTS: usize = 6;
const HEADROOM: u64 = 2;

#[derive(Default)]
struct Established {
    count: Mutex<usize>,
    changed: Condvar,
}

impl Established {
    fn wait_until(&self, target: usize) -> usize {
        let deadline = Instant::now() + Duration::from_secs(10);
        let mut count = self.count.lock().unwrap();
        while *count < target {
            let now = Instant::now();
            assert!(now < deadline, "only {} of {} connections established", *count, target);
            count = self.changed.wait_timeout(count, deadline - now).unwrap().0;
        }
        *count
    }

    fn get(&self) -> usize {
        *self.count.lock().unwrap()
    }
}

impl Handler for Established {
    fn on_established(&self, _conn: &Connection) {
        *self.count.lock().unwrap() += 1;
        self.changed.notify_all();
    }

    fn on_closed(&self, _conn: &Connection) {}

    fn on_error(&self, _conn: &Connection, _err: &io::Error) {}

    fn on_recv(&self, _conn: &Connection, _data: &[u8]) {}
}

fn nofile() -> libc::rlimit {
    let mut limit = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    assert_eq!(unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut limit) }, 0);
    limit
}

fn set_nofile(limit: &libc::rlimit) {
    assert_eq!(unsafe { libc::setrlimit(libc::RLIMIT_NOFILE, limit) }, 0);
}

/// Occupies every free descriptor number below the highest one in use, so
/// the next descriptor handed out is `highest + 1`.
fn fill_gaps() -> (Vec<File>, u64) {
    let highest = fs::read_dir("/proc/self/fd")
        .unwrap()
        .filter_map(|entry| entry.ok()?.file_name().to_str()?.parse::<u64>().ok())
        .max()
        .unwrap();

    let mut fillers = Vec::new();
    loop {
        let file = File::open("/dev/null").unwrap();
        if file.as_raw_fd() as u64 > highest {
            return (fillers, highest);
        }
        fillers.push(file);
    }
}

/// User plus system CPU time of the whole process.
fn cpu_time() -> Duration {
    let mut usage: libc::rusage = unsafe { std::mem::zeroed() };
    assert_eq!(unsafe { libc::getrusage(libc::RUSAGE_SELF, &mut usage) }, 0);
    let micros = |tv: libc::timeval| tv.tv_sec as u64 * 1_000_000 + tv.tv_usec as u64;
    Duration::from_micros(micros(usage.ru_utime) + micros(usage.ru_stime))
}

#[test]
fn test_accepts_back_off_until_descriptors_return() {
    let events = Arc::new(Established::default());
    let config = ServerConfig {
        engine: EngineConfig {
            worker_threads: Some(2),
            ..EngineConfig::default()
        },
        bind_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
        ..ServerConfig::default()
    };
    let server = Server::new(config, events.clone());
    server.start(0, 4).unwrap();
    let addr: SocketAddr = server.local_addr().unwrap();

    // Client descriptors exist before the limit drops
    let clients: Vec<Socket> = (0..CLIENTS)
        .map(|_| Socket::new(Domain::IPV4, Type::STREAM, None).unwrap())
        .collect();
    let (fillers, highest) = fill_gaps();

    let original = nofile();
    set_nofile(&libc::rlimit {
        rlim_cur: highest + 1 + HEADROOM,
        rlim_max: original.rlim_max,
    });

    for client in &clients {
        client.connect(&addr.into()).unwrap();
    }
    events.wait_until(1);
    thread::sleep(Duration::from_millis(300));
    let accepted = events.get();
    assert!(accepted <= HEADROOM as usize);

    // Pending connections keep the listener readable; accepts must not spin on it
    let before = cpu_time();
    thread::sleep(Duration::from_secs(1));
    let spent = cpu_time() - before;
    assert!(spent < Duration::from_millis(300), "burned {:?} while out of descriptors", spent);
    assert_eq!(events.get(), accepted);

    set_nofile(&original);
    events.wait_until(CLIENTS);
    assert_eq!(server.connection_count(), CLIENTS);

    server.stop().unwrap();
    assert_eq!(server.pool().idle(), server.pool().allocated());
    drop(fillers);
}
