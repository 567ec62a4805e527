//! The codec contract and the read buffer shared by the built-in codecs

use crate::error::{CoreError, CoreResult};
use bytes::{Bytes, BytesMut};
use std::io::{self, Read};

/// Default number of bytes requested from the source per read.
pub const DEFAULT_READ_CHUNK: usize = 4096;

/// Encoder/decoder pair bound to one byte stream.
///
/// A session clones its configured codec once when it starts; the clone owns
/// the decode state for that stream. Encoding only needs `&self`, so a single
/// instance can encode from any thread while the clone decodes.
pub trait Codec: Clone + Send + Sync + 'static {
    /// The message type carried by the frames.
    type Item: Send + 'static;

    /// Serialize one message into a complete frame.
    ///
    /// Fails without producing output when the message does not fit the framing.
    fn encode(&self, item: &Self::Item) -> CoreResult<Bytes>;

    /// Pull bytes from `src` until one frame is complete.
    ///
    /// Returns `Ok(None)` when `src` has nothing more right now (it would
    /// block, or its read deadline passed). Partial headers and bodies are kept
    /// for the next call. At most one message is returned per call; call again
    /// to drain frames that arrived in the same read.
    fn decode(&mut self, src: &mut dyn Read) -> CoreResult<Option<Self::Item>>;
}

/// Growable accumulator for bytes read from a stream.
///
/// Cloning yields an empty buffer with the same read size, so a cloned codec
/// never inherits the partial frame of another stream.
#[derive(Debug)]
pub struct ReadBuffer {
    buf: BytesMut,
    chunk: usize,
}

impl ReadBuffer {
    /// Create a buffer that reads `chunk` bytes at a time
    pub fn new(chunk: usize) -> Self {
        let chunk = chunk.max(1);
        Self {
            buf: BytesMut::with_capacity(chunk),
            chunk,
        }
    }

    /// Buffered byte count
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Whether nothing is buffered
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Buffered bytes
    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    /// Remove and return the first `n` bytes.
    pub fn take(&mut self, n: usize) -> Bytes {
        self.buf.split_to(n).freeze()
    }

    /// Drop the first `n` bytes.
    pub fn skip(&mut self, n: usize) {
        let _ = self.buf.split_to(n);
    }

    /// Perform one read from `src` into the buffer.
    ///
    /// `Ok(true)` means bytes were appended, `Ok(false)` means the source would
    /// block or timed out. A zero-length read is reported as end of stream.
    pub fn fill(&mut self, src: &mut dyn Read) -> CoreResult<bool> {
        let start = self.buf.len();
        self.buf.resize(start + self.chunk, 0);
        loop {
            match src.read(&mut self.buf[start..]) {
                Ok(0) => {
                    self.buf.truncate(start);
                    return Err(CoreError::eof());
                }
                Ok(n) => {
                    self.buf.truncate(start + n);
                    return Ok(true);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
                    ) =>
                {
                    self.buf.truncate(start);
                    return Ok(false);
                }
                Err(e) => {
                    self.buf.truncate(start);
                    return Err(CoreError::Io(e));
                }
            }
        }
    }
}

impl Default for ReadBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_READ_CHUNK)
    }
}

impl Clone for ReadBuffer {
    fn clone(&self) -> Self {
        Self::new(self.chunk)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct WouldBlockAfter<'a> {
        data: &'a [u8],
    }

    impl Read for WouldBlockAfter<'_> {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.data.is_empty() {
                return Err(io::ErrorKind::WouldBlock.into());
            }
            let n = buf.len().min(self.data.len());
            buf[..n].copy_from_slice(&self.data[..n]);
            self.data = &self.data[n..];
            Ok(n)
        }
    }

    #[test]
    fn test_fill_reports_would_block() {
        let mut src = WouldBlockAfter { data: b"abc" };
        let mut buf = ReadBuffer::new(2);

        assert!(buf.fill(&mut src).unwrap());
        assert!(buf.fill(&mut src).unwrap());
        assert!(!buf.fill(&mut src).unwrap());
        assert_eq!(buf.as_slice(), b"abc");
    }

    #[test]
    fn test_fill_reports_eof() {
        let mut src: &[u8] = &[];
        let mut buf = ReadBuffer::default();

        let err = buf.fill(&mut src).unwrap_err();
        assert!(err.is_eof());
        assert!(buf.is_empty());
    }

    #[test]
    fn test_clone_starts_empty() {
        let mut src: &[u8] = b"partial";
        let mut buf = ReadBuffer::new(16);
        buf.fill(&mut src).unwrap();

        let copy = buf.clone();
        assert!(copy.is_empty());
        assert_eq!(buf.len(), 7);
    }
}
