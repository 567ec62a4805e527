//! Reactor-driven session bound to one event loop

use super::event_loop::{EventLoop, Flow, Watched};
use super::poller::{Poller, Ready};
use crate::error::{DnetError, Result};
use crate::metrics::global_metrics;
use crate::session::{Context, Item, MessageCallback, Session, SessionShared, SessionState};
use crate::transport::Transport;
use bytes::{Buf, Bytes};
use dnet_core::Codec;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::io::{self, Write};
use std::net::{SocketAddr, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

/// Non-blocking session whose I/O runs on an [`EventLoop`].
///
/// `send` and `close` may be called from any thread; they are forwarded to the
/// owning loop, which is the only place the socket, write queue and decoder
/// are touched.
pub struct Connection<C: Codec, S: Transport + AsRawFd = TcpStream> {
    fd: RawFd,
    event_loop: Arc<EventLoop>,
    shared: Arc<SessionShared<C>>,
    socket: Mutex<Option<S>>,
    local_addr: Option<SocketAddr>,
    peer_addr: Option<SocketAddr>,
}

impl<C: Codec, S: Transport + AsRawFd> Connection<C, S> {
    pub fn new(event_loop: Arc<EventLoop>, socket: S) -> Self {
        Self {
            fd: socket.as_raw_fd(),
            local_addr: socket.local_addr(),
            peer_addr: socket.peer_addr(),
            socket: Mutex::new(Some(socket)),
            shared: Arc::new(SessionShared::new()),
            event_loop,
        }
    }

    /// Create a connection and install its codec in one step.
    pub fn with_codec(event_loop: Arc<EventLoop>, socket: S, codec: C) -> Result<Self> {
        let conn = Self::new(event_loop, socket);
        conn.shared.set_codec(codec)?;
        Ok(conn)
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn event_loop(&self) -> &Arc<EventLoop> {
        &self.event_loop
    }

    /// Reason given to the first `close`
    pub fn close_reason(&self) -> Option<String> {
        self.shared.close_reason()
    }

    fn enqueue(&self, data: Bytes) -> Result<()> {
        let fd = self.fd;
        self.event_loop.submit(move |state| {
            let len = data.len();
            if !state.with(fd, |watched, poller| watched.enqueue(poller, data)) {
                warn!(fd, len, "Write dropped; descriptor no longer registered");
            }
        })
    }
}

impl<C: Codec, S: Transport + AsRawFd> Session for Connection<C, S> {
    type Codec = C;

    fn set_codec(&self, codec: C) -> Result<()> {
        self.shared.set_codec(codec)
    }

    fn start<F>(&self, on_message: F) -> Result<()>
    where
        F: Fn(Result<C::Item>) + Send + Sync + 'static,
    {
        let decoder = self.shared.start()?;
        let socket = self
            .socket
            .lock()
            .take()
            .ok_or_else(|| DnetError::config("connection has no socket"))?;

        let conduit = Conduit {
            fd: self.fd,
            socket,
            decoder,
            on_message: Arc::new(on_message),
            shared: Arc::clone(&self.shared),
            write_queue: VecDeque::new(),
            write_armed: false,
            reading: true,
            draining: false,
        };
        if let Err(e) = self.event_loop.watch(Box::new(conduit)) {
            self.shared.finish_close("watch failed");
            return Err(e);
        }
        info!(fd = self.fd, loop_id = self.event_loop.id(), peer = ?self.peer_addr, "Connection started");
        Ok(())
    }

    fn send(&self, item: Item<Self>) -> Result<()> {
        let data = self.shared.encode(&item)?;
        self.enqueue(data)
    }

    fn send_bytes(&self, data: Bytes) -> Result<()> {
        if data.is_empty() {
            return Err(DnetError::EmptyPayload);
        }
        self.shared.ensure_started()?;
        self.enqueue(data)
    }

    fn set_context(&self, ctx: Context) {
        self.shared.set_context(ctx);
    }

    fn context(&self) -> Option<Context> {
        self.shared.context()
    }

    fn set_close_callback<F>(&self, callback: F)
    where
        F: FnOnce(&str) + Send + 'static,
    {
        self.shared.set_close_callback(Box::new(callback));
    }

    fn close(&self, reason: &str) {
        match self.shared.begin_close(reason) {
            None => {}
            Some(SessionState::Idle) => {
                drop(self.socket.lock().take());
                self.shared.finish_close(reason);
                info!(fd = self.fd, reason, "Connection closed before start");
            }
            Some(_) => {
                let fd = self.fd;
                let submitted = self.event_loop.submit(move |state| {
                    state.with(fd, |watched, poller| watched.shutdown(poller));
                });
                if submitted.is_err() {
                    debug!(fd, "Event loop stopped; connection closed by loop shutdown");
                }
            }
        }
    }

    fn state(&self) -> SessionState {
        self.shared.state()
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }
}

/// Loop-owned half of a [`Connection`]: socket, decoder and write queue.
struct Conduit<C: Codec, S> {
    fd: RawFd,
    socket: S,
    decoder: C,
    on_message: MessageCallback<C::Item>,
    shared: Arc<SessionShared<C>>,
    write_queue: VecDeque<Bytes>,
    write_armed: bool,
    /// Cleared on peer EOF and after an unrecoverable decode error
    reading: bool,
    draining: bool,
}

impl<C: Codec, S: Transport> Conduit<C, S> {
    fn close_reason(&self) -> String {
        self.shared
            .close_reason()
            .unwrap_or_else(|| "closed".to_string())
    }

    /// Write queued chunks until the queue is empty or the socket is full.
    fn flush(&mut self, poller: &Poller) -> Flow {
        while let Some(front) = self.write_queue.front_mut() {
            match self.socket.write(front) {
                Ok(0) => return Flow::Close("write returned zero".to_string()),
                Ok(n) => {
                    global_metrics().bytes_written(n);
                    if n < front.len() {
                        front.advance(n);
                    } else {
                        self.write_queue.pop_front();
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Flow::Continue,
                Err(e) => return Flow::Close(format!("write failed: {e}")),
            }
        }

        if self.write_armed {
            if let Err(e) = poller.mod_read(self.fd) {
                return Flow::Close(format!("interest update failed: {e}"));
            }
            self.write_armed = false;
            trace!(fd = self.fd, "Write queue drained");
        }
        if self.draining {
            return Flow::Close(self.close_reason());
        }
        Flow::Continue
    }

    /// Decode every complete frame currently readable.
    ///
    /// Peer EOF stops reading and schedules a draining shutdown behind any
    /// writes the callback has already submitted. Other unrecoverable errors
    /// only stop reading; closing is left to the owner.
    fn read(&mut self) -> Flow {
        loop {
            if !self.reading || self.draining || self.shared.is_closed() {
                return Flow::Continue;
            }
            match self.decoder.decode(&mut self.socket) {
                Ok(Some(msg)) => {
                    global_metrics().message_received();
                    (self.on_message)(Ok(msg));
                }
                Ok(None) => return Flow::Continue,
                Err(e) if e.is_eof() => {
                    // Not `draining` yet: writes still on the task queue go first.
                    self.reading = false;
                    self.shared.begin_close("connection closed by peer");
                    (self.on_message)(Err(e.into()));
                    debug!(fd = self.fd, queued = self.write_queue.len(), "Peer closed; draining");
                    return Flow::Shutdown;
                }
                Err(e) if e.is_recoverable() => (self.on_message)(Err(e.into())),
                Err(e) => {
                    self.reading = false;
                    warn!(fd = self.fd, error = %e, "Reading stopped after stream error");
                    (self.on_message)(Err(e.into()));
                    return Flow::Continue;
                }
            }
        }
    }
}

impl<C: Codec, S: Transport + AsRawFd> Watched for Conduit<C, S> {
    fn fd(&self) -> RawFd {
        self.fd
    }

    fn set_nonblocking(&self) -> io::Result<()> {
        self.socket.set_nonblocking(true)
    }

    fn on_ready(&mut self, poller: &Poller, ready: Ready) -> Flow {
        if ready.contains(Ready::ERR) {
            return Flow::Close("socket error".to_string());
        }
        if ready.contains(Ready::WRITE) {
            if let Flow::Close(reason) = self.flush(poller) {
                return Flow::Close(reason);
            }
        }
        if ready.contains(Ready::READ) {
            return self.read();
        }
        Flow::Continue
    }

    fn enqueue(&mut self, poller: &Poller, data: Bytes) -> Flow {
        self.write_queue.push_back(data);
        if !self.write_armed {
            if let Err(e) = poller.mod_read_write(self.fd) {
                return Flow::Close(format!("interest update failed: {e}"));
            }
            self.write_armed = true;
        }
        Flow::Continue
    }

    fn shutdown(&mut self, poller: &Poller) -> Flow {
        self.draining = true;
        if self.write_queue.is_empty() {
            return Flow::Close(self.close_reason());
        }
        if !self.write_armed {
            if let Err(e) = poller.mod_read_write(self.fd) {
                return Flow::Close(format!("interest update failed: {e}"));
            }
            self.write_armed = true;
        }
        debug!(fd = self.fd, queued = self.write_queue.len(), "Draining before close");
        Flow::Continue
    }

    fn finish(self: Box<Self>, reason: &str) {
        let Conduit {
            fd, socket, shared, ..
        } = *self;
        if let Err(e) = socket.shutdown(std::net::Shutdown::Both) {
            if e.kind() != io::ErrorKind::NotConnected {
                warn!(fd, error = %e, "Socket shutdown failed");
            }
        }
        drop(socket);
        shared.finish_close(reason);
        info!(fd, reason = ?shared.close_reason(), "Connection closed");
    }
}
