//! Error types for dnet sessions, reactor and RPC

use dnet_core::CoreError;
use std::fmt;
use std::io;
use thiserror::Error;

/// Result type for dnet operations
pub type Result<T> = std::result::Result<T, DnetError>;

/// Error taxonomy shared by every layer of the crate
#[derive(Error, Debug)]
pub enum DnetError {
    /// Invalid configuration or missing prerequisite (no codec, bad registration)
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Malformed frame or unknown message type
    #[error("Protocol error: {message}")]
    Protocol { message: String },

    /// Payload exceeds what the framing can carry
    #[error("Frame too large: {len} bytes exceeds limit of {max}")]
    FrameTooLarge { len: usize, max: usize },

    /// I/O errors, including end of stream
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A read or write deadline, or an RPC timer, expired
    #[error("Operation timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// Operation not valid in the current lifecycle state
    #[error("State error: {kind}")]
    State { kind: StateError },

    /// Bounded send queue is full
    #[error("Send queue full (capacity {capacity})")]
    Capacity { capacity: usize },

    /// Attempt to send an empty payload
    #[error("Empty payload")]
    EmptyPayload,

    /// Failure reported by the remote side of an RPC
    #[error("RPC error: {message}")]
    Rpc { message: String },
}

/// Lifecycle violations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateError {
    /// Session has not been started
    NotStarted,
    /// Session or loop was already started
    AlreadyStarted,
    /// Session or loop has been closed
    Closed,
    /// File descriptor already registered with an event loop
    AlreadyWatched,
    /// A replier was used twice
    RepeatedReply,
}

impl fmt::Display for StateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StateError::NotStarted => write!(f, "not started"),
            StateError::AlreadyStarted => write!(f, "already started"),
            StateError::Closed => write!(f, "closed"),
            StateError::AlreadyWatched => write!(f, "fd already watched"),
            StateError::RepeatedReply => write!(f, "repeated reply"),
        }
    }
}

impl DnetError {
    /// Create a config error
    pub fn config(message: impl Into<String>) -> Self {
        DnetError::Config {
            message: message.into(),
        }
    }

    /// Create a protocol error
    pub fn protocol(message: impl Into<String>) -> Self {
        DnetError::Protocol {
            message: message.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout(timeout_ms: u64) -> Self {
        DnetError::Timeout { timeout_ms }
    }

    /// Create a state error
    pub fn state(kind: StateError) -> Self {
        DnetError::State { kind }
    }

    /// Create a capacity error
    pub fn capacity(capacity: usize) -> Self {
        DnetError::Capacity { capacity }
    }

    /// Create an RPC error
    pub fn rpc(message: impl Into<String>) -> Self {
        DnetError::Rpc {
            message: message.into(),
        }
    }

    /// Check if this is a timeout
    pub fn is_timeout(&self) -> bool {
        match self {
            DnetError::Timeout { .. } => true,
            DnetError::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock
            ),
            _ => false,
        }
    }

    /// Check if this error means the session or its peer is gone
    pub fn is_closed(&self) -> bool {
        match self {
            DnetError::State { kind } => *kind == StateError::Closed,
            DnetError::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::BrokenPipe
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }

    /// Check if the operation may succeed when retried
    pub fn is_recoverable(&self) -> bool {
        match self {
            DnetError::Capacity { .. } | DnetError::Timeout { .. } => true,
            DnetError::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
            ),
            _ => false,
        }
    }
}

impl From<CoreError> for DnetError {
    fn from(e: CoreError) -> Self {
        match e {
            CoreError::Io(e) => DnetError::Io(e),
            CoreError::Protocol { message } => DnetError::Protocol { message },
            CoreError::FrameTooLarge { len, max } => DnetError::FrameTooLarge { len, max },
            CoreError::UnknownMessage { key } => {
                DnetError::protocol(format!("unknown message type: {key}"))
            }
            CoreError::Registration { message } => DnetError::Config { message },
        }
    }
}
