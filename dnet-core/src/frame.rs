//! Default length-prefixed framing
//!
//! ```text
//! +-----------+------------------+
//! | len (u16) | body (len bytes) |
//! +-----------+------------------+
//! ```
//!
//! The length is big-endian and counts only the body.

use crate::codec::{Codec, ReadBuffer};
use crate::error::{CoreError, CoreResult};
use bytes::{BufMut, Bytes, BytesMut};
use std::io::Read;

/// Size of the length header
pub const HEADER_LEN: usize = 2;

/// Largest body the framing accepts
pub const MAX_BODY_LEN: usize = u16::MAX as usize - HEADER_LEN;

/// Codec for `[len:u16][body]` frames carrying raw bytes.
#[derive(Debug, Default)]
pub struct LengthCodec {
    buf: ReadBuffer,
    body_len: Option<usize>,
}

impl LengthCodec {
    /// Create a codec with the default read size
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a codec that reads `chunk` bytes per call to the source
    pub fn with_read_chunk(chunk: usize) -> Self {
        Self {
            buf: ReadBuffer::new(chunk),
            body_len: None,
        }
    }

    fn parse_header(&mut self) -> CoreResult<()> {
        if self.body_len.is_some() || self.buf.len() < HEADER_LEN {
            return Ok(());
        }
        let head = self.buf.as_slice();
        let len = u16::from_be_bytes([head[0], head[1]]) as usize;
        if len > MAX_BODY_LEN {
            return Err(CoreError::protocol(format!(
                "length header {len} exceeds limit of {MAX_BODY_LEN}"
            )));
        }
        self.buf.skip(HEADER_LEN);
        self.body_len = Some(len);
        Ok(())
    }
}

impl Clone for LengthCodec {
    fn clone(&self) -> Self {
        Self {
            buf: self.buf.clone(),
            body_len: None,
        }
    }
}

impl Codec for LengthCodec {
    type Item = Bytes;

    fn encode(&self, item: &Bytes) -> CoreResult<Bytes> {
        if item.len() > MAX_BODY_LEN {
            return Err(CoreError::too_large(item.len(), MAX_BODY_LEN));
        }
        let mut out = BytesMut::with_capacity(HEADER_LEN + item.len());
        out.put_u16(item.len() as u16);
        out.extend_from_slice(item);
        Ok(out.freeze())
    }

    fn decode(&mut self, src: &mut dyn Read) -> CoreResult<Option<Bytes>> {
        loop {
            self.parse_header()?;
            if let Some(len) = self.body_len {
                if self.buf.len() >= len {
                    self.body_len = None;
                    return Ok(Some(self.buf.take(len)));
                }
            }
            if !self.buf.fill(src)? {
                return Ok(None);
            }
        }
    }
}
