//! Byte-stream transports that sessions run over
//!
//! The [`Transport`] trait covers what both session flavours need from a
//! socket: blocking reads and writes, deadlines, half-close and handle
//! duplication for the reader/writer threads. The reactor additionally needs
//! the raw fd and non-blocking mode.

use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::time::Duration;

/// Connected byte stream with deadline and shutdown control.
pub trait Transport: Read + Write + Send + Sized + 'static {
    /// Duplicate the handle; both refer to the same socket.
    fn try_clone(&self) -> io::Result<Self>;

    /// Set the read deadline; `None` blocks forever.
    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()>;

    /// Set the write deadline; `None` blocks forever.
    fn set_write_timeout(&self, timeout: Option<Duration>) -> io::Result<()>;

    fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()>;

    /// Shut down one or both halves of the stream.
    fn shutdown(&self, how: Shutdown) -> io::Result<()>;

    /// Local address, if the transport has one
    fn local_addr(&self) -> Option<SocketAddr>;

    /// Peer address, if the transport has one
    fn peer_addr(&self) -> Option<SocketAddr>;
}

// ---------------------------------------------------------------------------
// TcpStream
// ---------------------------------------------------------------------------

impl Transport for TcpStream {
    fn try_clone(&self) -> io::Result<Self> {
        TcpStream::try_clone(self)
    }

    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        TcpStream::set_read_timeout(self, timeout)
    }

    fn set_write_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        TcpStream::set_write_timeout(self, timeout)
    }

    fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        TcpStream::set_nonblocking(self, nonblocking)
    }

    fn shutdown(&self, how: Shutdown) -> io::Result<()> {
        TcpStream::shutdown(self, how)
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        TcpStream::local_addr(self).ok()
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        TcpStream::peer_addr(self).ok()
    }
}

// ---------------------------------------------------------------------------
// UnixStream
// ---------------------------------------------------------------------------

#[cfg(unix)]
mod unix {
    use super::*;
    use std::os::unix::net::UnixStream;

    impl Transport for UnixStream {
        fn try_clone(&self) -> io::Result<Self> {
            UnixStream::try_clone(self)
        }

        fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
            UnixStream::set_read_timeout(self, timeout)
        }

        fn set_write_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
            UnixStream::set_write_timeout(self, timeout)
        }

        fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
            UnixStream::set_nonblocking(self, nonblocking)
        }

        fn shutdown(&self, how: Shutdown) -> io::Result<()> {
            UnixStream::shutdown(self, how)
        }

        fn local_addr(&self) -> Option<SocketAddr> {
            None
        }

        fn peer_addr(&self) -> Option<SocketAddr> {
            None
        }
    }
}
