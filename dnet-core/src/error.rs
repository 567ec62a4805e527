//! Error types for the framing core

use std::fmt;
use std::io;

/// Result type for framing operations
pub type CoreResult<T> = std::result::Result<T, CoreError>;

/// Errors produced while encoding or decoding frames.
#[derive(Debug)]
pub enum CoreError {
    /// Reading from the source failed, including end of stream
    Io(io::Error),
    /// Malformed frame on the wire (bad header, unknown flag)
    Protocol { message: String },
    /// A body does not fit the length field of the framing
    FrameTooLarge { len: usize, max: usize },
    /// A frame named a message type the registry does not know
    UnknownMessage { key: String },
    /// A registry was built with conflicting entries
    Registration { message: String },
}

impl CoreError {
    /// Create a protocol error
    pub fn protocol(message: impl Into<String>) -> Self {
        CoreError::Protocol {
            message: message.into(),
        }
    }

    /// Create a size-exceeded error
    pub fn too_large(len: usize, max: usize) -> Self {
        CoreError::FrameTooLarge { len, max }
    }

    /// Create an unknown-message error
    pub fn unknown(key: impl Into<String>) -> Self {
        CoreError::UnknownMessage { key: key.into() }
    }

    /// Create a registration error
    pub fn registration(message: impl Into<String>) -> Self {
        CoreError::Registration {
            message: message.into(),
        }
    }

    /// End of stream: the peer closed its write half.
    pub fn eof() -> Self {
        CoreError::Io(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "connection closed by peer",
        ))
    }

    /// Whether the decoder is still aligned on a frame boundary after this error.
    ///
    /// An unknown message type consumes its whole frame, so decoding can go on.
    /// Header and I/O failures leave the stream position undefined.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, CoreError::UnknownMessage { .. })
    }

    /// Check if this error is the end of the stream
    pub fn is_eof(&self) -> bool {
        matches!(self, CoreError::Io(e) if e.kind() == io::ErrorKind::UnexpectedEof)
    }
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoreError::Io(e) => write!(f, "I/O error: {e}"),
            CoreError::Protocol { message } => write!(f, "Protocol error: {message}"),
            CoreError::FrameTooLarge { len, max } => {
                write!(f, "Frame too large: {len} bytes exceeds limit of {max}")
            }
            CoreError::UnknownMessage { key } => write!(f, "Unknown message type: {key}"),
            CoreError::Registration { message } => write!(f, "Registration error: {message}"),
        }
    }
}

impl std::error::Error for CoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CoreError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for CoreError {
    fn from(e: io::Error) -> Self {
        CoreError::Io(e)
    }
}
