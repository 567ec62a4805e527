//! Readiness poller over epoll/kqueue
//!
//! Interest is registered edge-triggered: a readable or writable event is
//! reported once per transition, so handlers must read or write until the
//! socket would block.

use crate::error::{DnetError, Result};
use bitflags::bitflags;
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Registry, Token, Waker};
use parking_lot::Mutex;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{trace, warn};

/// Reserved fd value reported when [`Poller::trigger`] woke the wait.
pub const WAKE_FD: RawFd = -1;

const WAKE_TOKEN: Token = Token(usize::MAX);

bitflags! {
    /// Readiness classes delivered to the poll callback
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Ready: u8 {
        const READ = 0b001;
        const WRITE = 0b010;
        const ERR = 0b100;
    }
}

impl Ready {
    fn from_event(event: &mio::event::Event) -> Self {
        let mut ready = Ready::empty();
        if event.is_error() {
            ready |= Ready::ERR;
        }
        if event.is_readable() || event.is_read_closed() {
            ready |= Ready::READ;
        }
        if event.is_writable() || event.is_write_closed() {
            ready |= Ready::WRITE;
        }
        ready
    }
}

/// OS readiness notification with a cross-thread wake.
pub struct Poller {
    poll: Mutex<Poll>,
    registry: Registry,
    waker: Waker,
    closed: AtomicBool,
    events_capacity: usize,
}

impl Poller {
    /// Open a poller whose event buffer starts at `events_capacity` entries.
    pub fn open(events_capacity: usize) -> Result<Self> {
        let poll = Poll::new()?;
        let registry = poll.registry().try_clone()?;
        let waker = Waker::new(poll.registry(), WAKE_TOKEN)?;
        Ok(Self {
            poll: Mutex::new(poll),
            registry,
            waker,
            closed: AtomicBool::new(false),
            events_capacity: events_capacity.max(1),
        })
    }

    fn token(fd: RawFd) -> Token {
        Token(fd as usize)
    }

    fn register(&self, fd: RawFd, interest: Interest) -> io::Result<()> {
        self.registry
            .register(&mut SourceFd(&fd), Self::token(fd), interest)
    }

    fn reregister(&self, fd: RawFd, interest: Interest) -> io::Result<()> {
        self.registry
            .reregister(&mut SourceFd(&fd), Self::token(fd), interest)
    }

    pub fn add_read(&self, fd: RawFd) -> io::Result<()> {
        self.register(fd, Interest::READABLE)
    }

    pub fn add_write(&self, fd: RawFd) -> io::Result<()> {
        self.register(fd, Interest::WRITABLE)
    }

    pub fn add_read_write(&self, fd: RawFd) -> io::Result<()> {
        self.register(fd, Interest::READABLE | Interest::WRITABLE)
    }

    /// Drop write interest, keeping read interest.
    pub fn mod_read(&self, fd: RawFd) -> io::Result<()> {
        self.reregister(fd, Interest::READABLE)
    }

    pub fn mod_read_write(&self, fd: RawFd) -> io::Result<()> {
        self.reregister(fd, Interest::READABLE | Interest::WRITABLE)
    }

    pub fn delete(&self, fd: RawFd) -> io::Result<()> {
        self.registry.deregister(&mut SourceFd(&fd))
    }

    /// Wake a thread blocked in [`Poller::poll`]. Wakes issued before the
    /// waiter drains them are reported once.
    pub fn trigger(&self) -> io::Result<()> {
        self.waker.wake()
    }

    /// Make [`Poller::poll`] return after its current batch.
    pub fn close(&self) -> io::Result<()> {
        self.closed.store(true, Ordering::Release);
        self.waker.wake()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Wait for readiness and dispatch it until the poller is closed.
    ///
    /// `callback` receives `(fd, readiness)` for each ready descriptor and
    /// `(WAKE_FD, Ready::READ)` once per batch that contained a wake. Callback
    /// errors are logged and do not stop polling.
    pub fn poll<F>(&self, mut callback: F) -> Result<()>
    where
        F: FnMut(RawFd, Ready) -> Result<()>,
    {
        let mut poll = self
            .poll
            .try_lock()
            .ok_or_else(|| DnetError::config("poller is already being polled"))?;
        let mut capacity = self.events_capacity;
        let mut events = Events::with_capacity(capacity);

        while !self.is_closed() {
            match poll.poll(&mut events, None) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }

            let mut received = 0;
            let mut woken = false;
            for event in events.iter() {
                received += 1;
                if event.token() == WAKE_TOKEN {
                    woken = true;
                    continue;
                }
                let fd = event.token().0 as RawFd;
                if let Err(e) = callback(fd, Ready::from_event(event)) {
                    warn!(fd, error = %e, "Poll callback failed");
                }
            }
            if woken {
                if let Err(e) = callback(WAKE_FD, Ready::READ) {
                    warn!(error = %e, "Wake callback failed");
                }
            }

            if received == capacity {
                capacity *= 2;
                events = Events::with_capacity(capacity);
                trace!(capacity, "Grew poller event buffer");
            }
        }
        Ok(())
    }
}
