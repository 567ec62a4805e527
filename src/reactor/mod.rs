//! Readiness-driven reactor: poller, event loops, connections, service pool
//!
//! ```text
//!   any thread ── submit(task) ──► EventLoop ◄── readiness ── Poller
//!                                     │
//!                                     ▼
//!                          Conduit (socket, codec, queue)
//!                                     │
//!                                     ▼
//!                               message callback
//! ```

pub mod connection;
pub mod event_loop;
pub mod poller;
pub mod service;

pub use connection::Connection;
pub use event_loop::{EventLoop, Flow, LoopState, Task, Watched};
pub use poller::{Poller, Ready, WAKE_FD};
pub use service::Service;
