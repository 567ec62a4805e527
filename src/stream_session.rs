//! Blocking session: one reader thread and one writer thread per stream

use crate::config::{SendPolicy, SessionConfig};
use crate::error::{DnetError, Result, StateError};
use crate::metrics::global_metrics;
use crate::session::{Context, Item, MessageCallback, Session, SessionShared, SessionState};
use crate::transport::Transport;
use bytes::Bytes;
use crossbeam_channel::{bounded, Receiver, Sender};
use crossbeam_queue::ArrayQueue;
use dnet_core::Codec;
use parking_lot::Mutex;
use std::io::{self, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

const SPACE_POLL: Duration = Duration::from_millis(50);

/// Session over a blocking [`Transport`].
///
/// Sends are encoded on the caller's thread and pushed to a bounded queue; the
/// writer thread drains it. The reader thread decodes and invokes the message
/// callback in stream order.
pub struct StreamSession<C: Codec, T: Transport = TcpStream> {
    shared: Arc<SessionShared<C>>,
    config: SessionConfig,
    transport: Mutex<Option<T>>,
    control: Mutex<Option<T>>,
    queue: Arc<ArrayQueue<Bytes>>,
    wake_tx: Sender<()>,
    wake_rx: Receiver<()>,
    space_tx: Sender<()>,
    space_rx: Receiver<()>,
    local_addr: Option<SocketAddr>,
    peer_addr: Option<SocketAddr>,
}

impl<C: Codec, T: Transport> StreamSession<C, T> {
    /// Wrap a connected transport. Nothing runs until [`Session::start`].
    pub fn new(transport: T, config: SessionConfig) -> Result<Self> {
        config.validate()?;
        let (wake_tx, wake_rx) = bounded(1);
        let (space_tx, space_rx) = bounded(1);
        Ok(Self {
            shared: Arc::new(SessionShared::new()),
            queue: Arc::new(ArrayQueue::new(config.send_queue_capacity)),
            local_addr: transport.local_addr(),
            peer_addr: transport.peer_addr(),
            transport: Mutex::new(Some(transport)),
            control: Mutex::new(None),
            config,
            wake_tx,
            wake_rx,
            space_tx,
            space_rx,
        })
    }

    /// Wrap a transport and install its codec in one step.
    pub fn with_codec(transport: T, codec: C, config: SessionConfig) -> Result<Self> {
        let session = Self::new(transport, config)?;
        session.shared.set_codec(codec)?;
        Ok(session)
    }

    /// Messages waiting for the writer
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Reason given to the first `close`
    pub fn close_reason(&self) -> Option<String> {
        self.shared.close_reason()
    }

    fn spawn_threads(
        &self,
        decoder: C,
        transport: T,
        on_message: MessageCallback<C::Item>,
    ) -> io::Result<()> {
        transport.set_read_timeout(self.config.read_timeout)?;
        transport.set_write_timeout(self.config.write_timeout)?;
        let reader_stream = transport.try_clone()?;
        *self.control.lock() = Some(transport.try_clone()?);

        let reader = Reader {
            shared: Arc::clone(&self.shared),
            decoder,
            stream: reader_stream,
            on_message: Arc::clone(&on_message),
            timeout_ms: timeout_ms(self.config.read_timeout),
        };
        let writer = Writer {
            shared: Arc::clone(&self.shared),
            stream: transport,
            queue: Arc::clone(&self.queue),
            wake_rx: self.wake_rx.clone(),
            space_tx: self.space_tx.clone(),
            on_message,
            timeout_ms: timeout_ms(self.config.write_timeout),
        };

        thread::Builder::new()
            .name("dnet-reader".into())
            .spawn(move || reader.run())?;
        thread::Builder::new()
            .name("dnet-writer".into())
            .spawn(move || writer.run())?;
        Ok(())
    }

    fn push(&self, mut data: Bytes) -> Result<()> {
        loop {
            match self.queue.push(data) {
                Ok(()) => {
                    let _ = self.wake_tx.try_send(());
                    return Ok(());
                }
                Err(rejected) => {
                    if self.config.send_policy == SendPolicy::FailFast {
                        return Err(DnetError::capacity(self.config.send_queue_capacity));
                    }
                    self.shared.ensure_started()?;
                    data = rejected;
                    let _ = self.space_rx.recv_timeout(SPACE_POLL);
                }
            }
        }
    }
}

impl<C: Codec, T: Transport> Session for StreamSession<C, T> {
    type Codec = C;

    fn set_codec(&self, codec: C) -> Result<()> {
        self.shared.set_codec(codec)
    }

    fn start<F>(&self, on_message: F) -> Result<()>
    where
        F: Fn(Result<C::Item>) + Send + Sync + 'static,
    {
        let decoder = self.shared.start()?;
        let transport = self
            .transport
            .lock()
            .take()
            .ok_or_else(|| DnetError::state(StateError::Closed))?;

        if let Err(e) = self.spawn_threads(decoder, transport, Arc::new(on_message)) {
            warn!(error = %e, "Failed to start session threads");
            self.shared.finish_close("start failed");
            return Err(e.into());
        }
        info!(peer = ?self.peer_addr, "Session started");
        Ok(())
    }

    fn send(&self, item: Item<Self>) -> Result<()> {
        let data = self.shared.encode(&item)?;
        self.push(data)
    }

    fn send_bytes(&self, data: Bytes) -> Result<()> {
        if data.is_empty() {
            return Err(DnetError::EmptyPayload);
        }
        self.shared.ensure_started()?;
        self.push(data)
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
                drop(self.transport.lock().take());
                self.shared.finish_close(reason);
                info!(peer = ?self.peer_addr, reason, "Session closed before start");
            }
            Some(_) => {
                debug!(peer = ?self.peer_addr, reason, "Session closing");
                if let Some(control) = self.control.lock().as_ref() {
                    let _ = control.shutdown(Shutdown::Read);
                }
                let _ = self.wake_tx.try_send(());
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

impl<C: Codec, T: Transport> Drop for StreamSession<C, T> {
    fn drop(&mut self) {
        self.close("session dropped");
    }
}

fn timeout_ms(timeout: Option<Duration>) -> u64 {
    timeout.map(|t| t.as_millis() as u64).unwrap_or(0)
}

struct Reader<C: Codec, T> {
    shared: Arc<SessionShared<C>>,
    decoder: C,
    stream: T,
    on_message: MessageCallback<C::Item>,
    timeout_ms: u64,
}

impl<C: Codec, T: Transport> Reader<C, T> {
    fn run(mut self) {
        loop {
            if self.shared.is_closed() {
                break;
            }
            let result = self.decoder.decode(&mut self.stream);
            if self.shared.is_closed() {
                break;
            }
            match result {
                Ok(Some(msg)) => {
                    global_metrics().message_received();
                    (self.on_message)(Ok(msg));
                }
                Ok(None) => (self.on_message)(Err(DnetError::timeout(self.timeout_ms))),
                Err(e) => {
                    let fatal = !e.is_recoverable();
                    (self.on_message)(Err(e.into()));
                    if fatal {
                        debug!("Reader stopped after stream error");
                        break;
                    }
                }
            }
        }
        trace!("Reader exited");
    }
}

struct Writer<C: Codec, T> {
    shared: Arc<SessionShared<C>>,
    stream: T,
    queue: Arc<ArrayQueue<Bytes>>,
    wake_rx: Receiver<()>,
    space_tx: Sender<()>,
    on_message: MessageCallback<C::Item>,
    timeout_ms: u64,
}

impl<C: Codec, T: Transport> Writer<C, T> {
    fn run(mut self) {
        loop {
            match self.queue.pop() {
                Some(data) => {
                    let _ = self.space_tx.try_send(());
                    self.write(&data);
                }
                None => {
                    if self.shared.is_closed() || self.wake_rx.recv().is_err() {
                        break;
                    }
                }
            }
        }

        let _ = self.stream.flush();
        let _ = self.stream.shutdown(Shutdown::Both);
        let Writer { shared, stream, .. } = self;
        drop(stream);
        shared.finish_close("closed");
        info!(reason = ?shared.close_reason(), "Session closed");
    }

    fn write(&mut self, data: &[u8]) {
        match self.stream.write_all(data) {
            Ok(()) => global_metrics().bytes_written(data.len()),
            Err(e) => {
                let err = match e.kind() {
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => {
                        DnetError::timeout(self.timeout_ms)
                    }
                    _ => DnetError::Io(e),
                };
                (self.on_message)(Err(err));
            }
        }
    }
}
