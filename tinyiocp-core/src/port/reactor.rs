//! Readiness driver behind the completion port.
//!
//! Sockets are associated with an epoll instance in one-shot mode. Submitted
//! operations wait in per-socket FIFO lists; when the socket becomes ready the
//! driver thread performs them and posts each finished operation to the
//! completion queue. From the outside this looks like a kernel completion
//! port: every submitted operation comes back exactly once.

use std::collections::VecDeque;
use std::io;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use dashmap::DashMap;
use socket2::Socket;

use super::queue::CompletionQueue;
use super::{Completion, SubmitError};
use crate::context::{OperationContext, OperationKind};

/// epoll key reserved for the waker eventfd.
const WAKER_KEY: u64 = u64::MAX;

/// Events fetched per `epoll_wait` call.
const EVENTS_CAPACITY: usize = 256;

/// Operations waiting for readiness on one socket.
#[derive(Default)]
struct Pending {
    reads: VecDeque<Box<OperationContext>>,
    writes: VecDeque<Box<OperationContext>>,
    closed: bool,
}

struct Registration {
    fd: RawFd,
    token: u64,
    pending: Mutex<Pending>,
}

impl Registration {
    fn lock(&self) -> MutexGuard<'_, Pending> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Outcome of trying an operation once.
enum Attempt {
    WouldBlock,
    Complete(io::Result<usize>),
}

pub(crate) struct Reactor {
    epoll: OwnedFd,
    waker: OwnedFd,
    registrations: DashMap<RawFd, Arc<Registration>>,
    queue: Arc<CompletionQueue>,
    shutdown: AtomicBool,
}

impl Reactor {
    pub(crate) fn new(queue: Arc<CompletionQueue>) -> io::Result<Self> {
        let epoll = cvt(unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) })?;
        // SAFETY: epoll_create1 returned a fresh descriptor we now own.
        let epoll = unsafe { OwnedFd::from_raw_fd(epoll) };

        let waker = cvt(unsafe { libc::eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK) })?;
        // SAFETY: eventfd returned a fresh descriptor we now own.
        let waker = unsafe { OwnedFd::from_raw_fd(waker) };

        let reactor = Self {
            epoll,
            waker,
            registrations: DashMap::new(),
            queue,
            shutdown: AtomicBool::new(false),
        };
        reactor.ctl(
            libc::EPOLL_CTL_ADD,
            reactor.waker.as_raw_fd(),
            libc::EPOLLIN as u32,
            WAKER_KEY,
        )?;

        Ok(reactor)
    }

    /// Starts tracking `fd`; completions for it carry `token`.
    ///
    /// The socket must be in non-blocking mode.
    pub(crate) fn register(&self, fd: RawFd, token: u64) -> io::Result<()> {
        if self.registrations.contains_key(&fd) {
            return Err(io::Error::from_raw_os_error(libc::EEXIST));
        }

        let registration = Arc::new(Registration {
            fd,
            token,
            pending: Mutex::new(Pending::default()),
        });
        self.registrations.insert(fd, registration);

        // Registered disarmed; submissions arm the interest they need.
        if let Err(err) = self.ctl(
            libc::EPOLL_CTL_ADD,
            fd,
            libc::EPOLLONESHOT as u32,
            fd as u64,
        ) {
            self.registrations.remove(&fd);
            return Err(err);
        }

        Ok(())
    }

    /// Queues `op` on `fd` and arms the matching readiness interest.
    pub(crate) fn submit(
        &self,
        fd: RawFd,
        op: Box<OperationContext>,
    ) -> Result<(), SubmitError> {
        let registration = match self.registrations.get(&fd) {
            Some(entry) => Arc::clone(entry.value()),
            None => return Err(SubmitError::io(op, io::Error::from_raw_os_error(libc::EBADF))),
        };

        let kind = op.kind();
        if kind == OperationKind::None {
            return Err(SubmitError::io(
                op,
                io::Error::new(io::ErrorKind::InvalidInput, "operation kind not set"),
            ));
        }

        let mut pending = registration.lock();
        if pending.closed {
            return Err(SubmitError::io(op, io::Error::from_raw_os_error(libc::EBADF)));
        }

        let wants_read = kind.is_read_side() || !pending.reads.is_empty();
        let wants_write = !kind.is_read_side() || !pending.writes.is_empty();
        if let Err(err) = self.arm(fd, wants_read, wants_write) {
            return Err(SubmitError::io(op, err));
        }

        if kind.is_read_side() {
            pending.reads.push_back(op);
        } else {
            pending.writes.push_back(op);
        }
        Ok(())
    }

    /// Stops tracking `fd` and posts every pending operation back as aborted.
    ///
    /// Returns the number of aborted operations.
    pub(crate) fn deregister(&self, fd: RawFd) -> usize {
        let Some((_, registration)) = self.registrations.remove(&fd) else {
            return 0;
        };

        let mut pending = registration.lock();
        pending.closed = true;

        if let Err(err) = self.ctl(libc::EPOLL_CTL_DEL, fd, 0, 0) {
            tracing::debug!("epoll deregistration of fd {} failed: {}", fd, err);
        }

        let mut aborted = std::mem::take(&mut pending.reads);
        aborted.append(&mut pending.writes);
        drop(pending);

        let count = aborted.len();
        for op in aborted {
            self.queue.push(Completion::new(
                registration.token,
                op,
                Err(io::Error::from_raw_os_error(libc::ECANCELED)),
            ));
        }
        count
    }

    /// Number of registered sockets.
    pub(crate) fn registered(&self) -> usize {
        self.registrations.len()
    }

    /// Asks the driver loop to return.
    pub(crate) fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        let one: u64 = 1;
        let rc = unsafe {
            libc::write(
                self.waker.as_raw_fd(),
                &one as *const u64 as *const libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        if rc < 0 {
            tracing::error!(
                "failed to wake completion driver: {}",
                io::Error::last_os_error()
            );
        }
    }

    /// Driver loop; runs on the port's dedicated thread until [`shutdown`](Self::shutdown).
    pub(crate) fn run(&self) {
        let mut events = vec![libc::epoll_event { events: 0, u64: 0 }; EVENTS_CAPACITY];

        loop {
            let rc = unsafe {
                libc::epoll_wait(
                    self.epoll.as_raw_fd(),
                    events.as_mut_ptr(),
                    events.len() as libc::c_int,
                    -1,
                )
            };
            if rc < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                tracing::error!("completion driver stopped: epoll_wait failed: {}", err);
                return;
            }

            for event in events.iter().take(rc as usize) {
                let key = event.u64;
                if key == WAKER_KEY {
                    self.drain_waker();
                    continue;
                }

                let registration = self
                    .registrations
                    .get(&(key as RawFd))
                    .map(|entry| Arc::clone(entry.value()));
                if let Some(registration) = registration {
                    self.process(&registration);
                }
            }

            if self.shutdown.load(Ordering::Acquire) {
                return;
            }
        }
    }

    /// Performs every ready operation on one socket and re-arms the rest.
    fn process(&self, registration: &Registration) {
        let mut pending = registration.lock();
        if pending.closed {
            return;
        }

        let fd = registration.fd;
        while let Some(mut op) = pending.reads.pop_front() {
            match attempt(fd, &mut op) {
                Attempt::WouldBlock => {
                    pending.reads.push_front(op);
                    break;
                }
                Attempt::Complete(result) => {
                    self.queue
                        .push(Completion::new(registration.token, op, result));
                }
            }
        }

        while let Some(mut op) = pending.writes.pop_front() {
            match attempt(fd, &mut op) {
                Attempt::WouldBlock => {
                    pending.writes.push_front(op);
                    break;
                }
                Attempt::Complete(result) => {
                    self.queue
                        .push(Completion::new(registration.token, op, result));
                }
            }
        }

        let wants_read = !pending.reads.is_empty();
        let wants_write = !pending.writes.is_empty();
        if !(wants_read || wants_write) {
            return;
        }

        if let Err(err) = self.arm(fd, wants_read, wants_write) {
            tracing::error!("failed to re-arm fd {}: {}", fd, err);
            let mut failed = std::mem::take(&mut pending.reads);
            failed.append(&mut pending.writes);
            for op in failed {
                let error = io::Error::new(err.kind(), err.to_string());
                self.queue
                    .push(Completion::new(registration.token, op, Err(error)));
            }
        }
    }

    fn arm(&self, fd: RawFd, read: bool, write: bool) -> io::Result<()> {
        let mut interest = libc::EPOLLONESHOT as u32;
        if read {
            interest |= libc::EPOLLIN as u32;
        }
        if write {
            interest |= libc::EPOLLOUT as u32;
        }
        self.ctl(libc::EPOLL_CTL_MOD, fd, interest, fd as u64)
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, events: u32, key: u64) -> io::Result<()> {
        let mut event = libc::epoll_event { events, u64: key };
        cvt(unsafe { libc::epoll_ctl(self.epoll.as_raw_fd(), op, fd, &mut event) })?;
        Ok(())
    }

    fn drain_waker(&self) {
        let mut counter: u64 = 0;
        unsafe {
            libc::read(
                self.waker.as_raw_fd(),
                &mut counter as *mut u64 as *mut libc::c_void,
                std::mem::size_of::<u64>(),
            );
        }
    }
}

/// Tries `op` once on `fd`.
fn attempt(fd: RawFd, op: &mut OperationContext) -> Attempt {
    loop {
        let step = match op.kind() {
            OperationKind::Accept => try_accept(fd, op),
            OperationKind::Recv => try_recv(fd, op),
            OperationKind::Send => try_send(fd, op),
            OperationKind::None => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "operation kind not set",
            )),
        };

        match step {
            Ok(Some(transferred)) => return Attempt::Complete(Ok(transferred)),
            // Partial send; keep writing until the socket pushes back
            Ok(None) => continue,
            Err(err) => match err.kind() {
                io::ErrorKind::WouldBlock => return Attempt::WouldBlock,
                io::ErrorKind::Interrupted => continue,
                _ => return Attempt::Complete(Err(err)),
            },
        }
    }
}

fn try_accept(fd: RawFd, op: &mut OperationContext) -> io::Result<Option<usize>> {
    let accepted = cvt(unsafe {
        libc::accept4(
            fd,
            std::ptr::null_mut(),
            std::ptr::null_mut(),
            libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
        )
    })?;
    // SAFETY: accept4 returned a fresh descriptor we now own.
    op.set_accepted(unsafe { Socket::from_raw_fd(accepted) });
    Ok(Some(0))
}

fn try_recv(fd: RawFd, op: &mut OperationContext) -> io::Result<Option<usize>> {
    let buffer = op.buffer_mut();
    let received = unsafe {
        libc::recv(
            fd,
            buffer.as_mut_ptr() as *mut libc::c_void,
            buffer.len(),
            0,
        )
    };
    if received < 0 {
        return Err(io::Error::last_os_error());
    }

    op.set_len(received as usize);
    Ok(Some(received as usize))
}

fn try_send(fd: RawFd, op: &mut OperationContext) -> io::Result<Option<usize>> {
    let unsent = op.unsent();
    let written = unsafe {
        libc::send(
            fd,
            unsent.as_ptr() as *const libc::c_void,
            unsent.len(),
            libc::MSG_NOSIGNAL,
        )
    };
    if written < 0 {
        return Err(io::Error::last_os_error());
    }
    if written == 0 {
        return Ok(Some(0));
    }

    op.advance(written as usize);
    if op.unsent().is_empty() {
        Ok(Some(op.data().len()))
    } else {
        Ok(None)
    }
}

fn cvt(rc: libc::c_int) -> io::Result<libc::c_int> {
    if rc < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(rc)
    }
}
