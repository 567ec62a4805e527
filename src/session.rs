//! The session contract and the state every implementation shares
//!
//! A session is one framed, bidirectional stream. [`StreamSession`] drives it
//! with a blocking reader thread and writer thread; the reactor's
//! [`Connection`] drives it from an event loop. Both embed [`SessionShared`]
//! for the lifecycle, codec, context and close bookkeeping.
//!
//! [`StreamSession`]: crate::stream_session::StreamSession
//! [`Connection`]: crate::reactor::Connection

use crate::error::{DnetError, Result, StateError};
use crate::metrics::global_metrics;
use bytes::Bytes;
use dnet_core::Codec;
use parking_lot::{Mutex, RwLock};
use std::any::Any;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;

/// Opaque per-session user data
pub type Context = Arc<dyn Any + Send + Sync>;

/// Receives every decoded message, or the error that interrupted decoding.
pub type MessageCallback<T> = Arc<dyn Fn(Result<T>) + Send + Sync>;

/// Runs once when the session is finally closed, with the close reason.
pub type CloseCallback = Box<dyn FnOnce(&str) + Send>;

/// Message type produced by a session's codec
pub type Item<S> = <<S as Session>::Codec as Codec>::Item;

/// Lifecycle of a session. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    Idle = 0,
    Started = 1,
    Closed = 2,
}

impl SessionState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => SessionState::Idle,
            1 => SessionState::Started,
            _ => SessionState::Closed,
        }
    }
}

/// A framed, bidirectional message stream.
pub trait Session: Send + Sync + 'static {
    type Codec: Codec;

    /// Install the codec. Only valid before `start`.
    fn set_codec(&self, codec: Self::Codec) -> Result<()>;

    /// Begin reading and writing. Fails without a codec or when called twice.
    fn start<F>(&self, on_message: F) -> Result<()>
    where
        F: Fn(Result<Item<Self>>) + Send + Sync + 'static;

    /// Encode `item` and queue it for writing.
    fn send(&self, item: Item<Self>) -> Result<()>;

    /// Queue already-framed bytes for writing.
    fn send_bytes(&self, data: Bytes) -> Result<()>;

    fn set_context(&self, ctx: Context);

    fn context(&self) -> Option<Context>;

    /// Typed view of the context.
    fn context_as<T: Any + Send + Sync>(&self) -> Option<Arc<T>>
    where
        Self: Sized,
    {
        self.context().and_then(|ctx| ctx.downcast::<T>().ok())
    }

    fn set_close_callback<F>(&self, callback: F)
    where
        F: FnOnce(&str) + Send + 'static;

    /// Stop reading, flush queued writes, then release the stream.
    ///
    /// Idempotent: only the first reason is kept.
    fn close(&self, reason: &str);

    fn state(&self) -> SessionState;

    fn local_addr(&self) -> Option<SocketAddr>;

    fn peer_addr(&self) -> Option<SocketAddr>;
}

/// Bookkeeping common to every session implementation.
pub(crate) struct SessionShared<C> {
    state: AtomicU8,
    codec: RwLock<Option<C>>,
    context: Mutex<Option<Context>>,
    close_callback: Mutex<Option<CloseCallback>>,
    close_reason: Mutex<Option<String>>,
    counted: AtomicBool,
    finished: AtomicBool,
}

impl<C: Codec> SessionShared<C> {
    pub(crate) fn new() -> Self {
        Self {
            state: AtomicU8::new(SessionState::Idle as u8),
            codec: RwLock::new(None),
            context: Mutex::new(None),
            close_callback: Mutex::new(None),
            close_reason: Mutex::new(None),
            counted: AtomicBool::new(false),
            finished: AtomicBool::new(false),
        }
    }

    pub(crate) fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.state() == SessionState::Closed
    }

    pub(crate) fn set_codec(&self, codec: C) -> Result<()> {
        match self.state() {
            SessionState::Idle => {
                *self.codec.write() = Some(codec);
                Ok(())
            }
            SessionState::Started => Err(DnetError::state(StateError::AlreadyStarted)),
            SessionState::Closed => Err(DnetError::state(StateError::Closed)),
        }
    }

    /// Move Idle → Started and hand out the decoding copy of the codec.
    pub(crate) fn start(&self) -> Result<C> {
        let decoder = self
            .codec
            .read()
            .clone()
            .ok_or_else(|| DnetError::config("no codec set before start"))?;
        match self.state.compare_exchange(
            SessionState::Idle as u8,
            SessionState::Started as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {
                self.counted.store(true, Ordering::Release);
                global_metrics().connection_created();
                Ok(decoder)
            }
            Err(current) => Err(DnetError::state(match SessionState::from_u8(current) {
                SessionState::Closed => StateError::Closed,
                _ => StateError::AlreadyStarted,
            })),
        }
    }

    pub(crate) fn ensure_started(&self) -> Result<()> {
        match self.state() {
            SessionState::Started => Ok(()),
            SessionState::Idle => Err(DnetError::state(StateError::NotStarted)),
            SessionState::Closed => Err(DnetError::state(StateError::Closed)),
        }
    }

    /// Encode with the session codec. Requires a started session.
    pub(crate) fn encode(&self, item: &C::Item) -> Result<Bytes> {
        self.ensure_started()?;
        let guard = self.codec.read();
        let codec = guard
            .as_ref()
            .ok_or_else(|| DnetError::config("no codec set"))?;
        Ok(codec.encode(item)?)
    }

    /// Move to Closed and record `reason` if this call made the transition.
    ///
    /// Returns the state the session was in before, or `None` if it was
    /// already closed.
    pub(crate) fn begin_close(&self, reason: &str) -> Option<SessionState> {
        // Held across the swap so no reader sees Closed without its reason.
        let mut slot = self.close_reason.lock();
        let prev = SessionState::from_u8(
            self.state
                .swap(SessionState::Closed as u8, Ordering::AcqRel),
        );
        if prev == SessionState::Closed {
            return None;
        }
        *slot = Some(reason.to_string());
        Some(prev)
    }

    /// Run the close callback, once, with the first recorded reason.
    pub(crate) fn finish_close(&self, fallback: &str) {
        self.begin_close(fallback);
        if self.finished.swap(true, Ordering::AcqRel) {
            return;
        }
        if self.counted.load(Ordering::Acquire) {
            global_metrics().connection_closed();
        }
        let reason = self
            .close_reason
            .lock()
            .clone()
            .unwrap_or_else(|| fallback.to_string());
        let callback = self.close_callback.lock().take();
        if let Some(callback) = callback {
            callback(&reason);
        }
    }

    pub(crate) fn close_reason(&self) -> Option<String> {
        self.close_reason.lock().clone()
    }

    pub(crate) fn set_context(&self, ctx: Context) {
        *self.context.lock() = Some(ctx);
    }

    pub(crate) fn context(&self) -> Option<Context> {
        self.context.lock().clone()
    }

    pub(crate) fn set_close_callback(&self, callback: CloseCallback) {
        *self.close_callback.lock() = Some(callback);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dnet_core::LengthCodec;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_start_requires_codec() {
        let shared: SessionShared<LengthCodec> = SessionShared::new();
        assert!(matches!(shared.start(), Err(DnetError::Config { .. })));
        assert_eq!(shared.state(), SessionState::Idle);

        shared.set_codec(LengthCodec::new()).unwrap();
        assert!(shared.start().is_ok());
        assert!(matches!(
            shared.start(),
            Err(DnetError::State {
                kind: StateError::AlreadyStarted
            })
        ));
        assert!(shared.set_codec(LengthCodec::new()).is_err());
    }

    #[test]
    fn test_close_keeps_first_reason_and_fires_once() {
        let shared: SessionShared<LengthCodec> = SessionShared::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::new(Mutex::new(String::new()));
        {
            let calls = calls.clone();
            let seen = seen.clone();
            shared.set_close_callback(Box::new(move |reason| {
                calls.fetch_add(1, Ordering::SeqCst);
                *seen.lock() = reason.to_string();
            }));
        }

        assert_eq!(shared.begin_close("first"), Some(SessionState::Idle));
        assert_eq!(shared.begin_close("second"), None);
        shared.finish_close("fallback");
        shared.finish_close("again");

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(&*seen.lock(), "first");
        assert!(shared.ensure_started().is_err());
    }

    #[test]
    fn test_encode_needs_started() {
        let shared: SessionShared<LengthCodec> = SessionShared::new();
        shared.set_codec(LengthCodec::new()).unwrap();
        assert!(matches!(
            shared.encode(&Bytes::from_static(b"x")),
            Err(DnetError::State {
                kind: StateError::NotStarted
            })
        ));
        shared.start().unwrap();
        assert_eq!(shared.encode(&Bytes::from_static(b"x")).unwrap().len(), 3);
    }

    #[test]
    fn test_racing_close_reports_recorded_reason() {
        for _ in 0..200 {
            let shared: Arc<SessionShared<LengthCodec>> = Arc::new(SessionShared::new());
            let seen = Arc::new(Mutex::new(None));
            {
                let seen = seen.clone();
                shared.set_close_callback(Box::new(move |reason| {
                    *seen.lock() = Some(reason.to_string());
                }));
            }

            let closer = {
                let shared = shared.clone();
                std::thread::spawn(move || {
                    shared.begin_close("user");
                })
            };
            shared.finish_close("fallback");
            closer.join().unwrap();

            assert_eq!(*seen.lock(), shared.close_reason());
        }
    }
}
