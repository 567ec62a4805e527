//! # dnet - Session Networking Core
//!
//! Framed, bidirectional sessions over byte streams, driven either by a pair
//! of blocking threads or by a readiness-based reactor, with an RPC layer that
//! correlates requests and responses on top.
//!
//! ## Features
//!
//! - **Pluggable framing**: any [`Codec`] from `dnet-core`, length-prefixed by default
//! - **Two drivers**: [`StreamSession`] (thread per direction) and
//!   [`reactor::Connection`] (epoll/kqueue event loops)
//! - **Exactly-once RPC**: each call resolves by response or timeout, never both
//! - **Observability**: `tracing` spans and process-wide counters
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use dnet::{LengthCodec, Session, SessionConfig, StreamSession};
//! use bytes::Bytes;
//! use std::net::TcpStream;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let stream = TcpStream::connect("127.0.0.1:9000")?;
//!     let session = StreamSession::with_codec(stream, LengthCodec::new(), SessionConfig::new())?;
//!
//!     session.start(|msg| match msg {
//!         Ok(body) => println!("received {} bytes", body.len()),
//!         Err(e) => eprintln!("read error: {e}"),
//!     })?;
//!     session.send(Bytes::from_static(b"hello"))?;
//!     session.close("done");
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────┐
//! │   RPC                   │  Client, Server, Replier, Dispatcher
//! ├─────────────────────────┤
//! │   Session facade        │  Session trait, SessionConfig
//! ├────────────┬────────────┤
//! │  Stream    │  Reactor   │  StreamSession │ Service, EventLoop, Connection
//! ├────────────┴────────────┤
//! │   Framing (dnet-core)   │  Codec, LengthCodec, RpcCodec, Registry
//! ├─────────────────────────┤
//! │   Transport             │  TcpStream, UnixStream
//! └─────────────────────────┘
//! ```

// Drivers
#[cfg(unix)]
pub mod reactor;
pub mod stream_session;

// Session contract and RPC
pub mod rpc;
pub mod session;

// Common types and utilities
pub mod config;
pub mod error;
pub mod metrics;
pub mod transport;

// Re-exports
pub use config::{SendPolicy, ServiceConfig, SessionConfig};
pub use dnet_core::{
    Codec, CoreError, LengthCodec, Message, MessageCodec, Registry, Request, Response, RpcCodec,
    RpcMessage,
};
pub use error::{DnetError, Result, StateError};
pub use session::{Context, Session, SessionState};
pub use stream_session::StreamSession;
pub use transport::Transport;

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
