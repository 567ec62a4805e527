//! Id-keyed message framing
//!
//! ```text
//! +-----------+----------+------------------+
//! | len (u16) | id (u16) | body (len bytes) |
//! +-----------+----------+------------------+
//! ```
//!
//! Both header fields are big-endian. The id selects the payload type through
//! a [`Registry`], so only types registered with an id can travel here.

use crate::codec::{Codec, ReadBuffer};
use crate::error::{CoreError, CoreResult};
use crate::registry::{Message, Registry};
use bytes::{BufMut, Bytes, BytesMut};
use std::io::Read;
use std::sync::Arc;

/// Size of the `len` + `id` header
pub const HEADER_LEN: usize = 4;

/// Largest body the framing accepts
pub const MAX_BODY_LEN: usize = u16::MAX as usize - HEADER_LEN;

#[derive(Debug, Clone, Copy)]
struct Header {
    id: u16,
    body_len: usize,
}

/// Codec carrying registered messages tagged by numeric id.
pub struct MessageCodec<M> {
    registry: Arc<Registry<M>>,
    buf: ReadBuffer,
    header: Option<Header>,
}

impl<M: Message> MessageCodec<M> {
    pub fn new(registry: Arc<Registry<M>>) -> Self {
        Self {
            registry,
            buf: ReadBuffer::default(),
            header: None,
        }
    }

    pub fn registry(&self) -> &Arc<Registry<M>> {
        &self.registry
    }

    fn parse_header(&mut self) {
        if self.header.is_some() || self.buf.len() < HEADER_LEN {
            return;
        }
        let head = self.buf.as_slice();
        let header = Header {
            body_len: u16::from_be_bytes([head[0], head[1]]) as usize,
            id: u16::from_be_bytes([head[2], head[3]]),
        };
        self.buf.skip(HEADER_LEN);
        self.header = Some(header);
    }
}

impl<M> Clone for MessageCodec<M> {
    fn clone(&self) -> Self {
        Self {
            registry: Arc::clone(&self.registry),
            buf: self.buf.clone(),
            header: None,
        }
    }
}

impl<M: Message> Codec for MessageCodec<M> {
    type Item = M;

    fn encode(&self, item: &M) -> CoreResult<Bytes> {
        let id = self
            .registry
            .id_of(item.name())
            .ok_or_else(|| CoreError::unknown(item.name()))?;
        let body = item.marshal()?;
        if body.len() > MAX_BODY_LEN {
            return Err(CoreError::too_large(body.len(), MAX_BODY_LEN));
        }
        let mut out = BytesMut::with_capacity(HEADER_LEN + body.len());
        out.put_u16(body.len() as u16);
        out.put_u16(id);
        out.extend_from_slice(&body);
        Ok(out.freeze())
    }

    fn decode(&mut self, src: &mut dyn Read) -> CoreResult<Option<M>> {
        loop {
            self.parse_header();
            if let Some(header) = self.header {
                if self.buf.len() >= header.body_len {
                    self.header = None;
                    let body = self.buf.take(header.body_len);
                    return self.registry.unmarshal_id(header.id, &body).map(Some);
                }
            }
            if !self.buf.fill(src)? {
                return Ok(None);
            }
        }
    }
}
