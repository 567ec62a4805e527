//! RPC wire messages and their framing
//!
//! ```text
//! +-------------+-----------+--------------+---------------+------+------+
//! | seq (u64)   | flag (u8) | name_len(u8) | body_len(u16) | name | body |
//! +-------------+-----------+--------------+---------------+------+------+
//! ```
//!
//! Multi-byte fields are big-endian. A request carries its method name, which
//! is also the registry key of its payload. A response carries the payload's
//! type name. An error response has an empty name and a UTF-8 message as body.

use crate::codec::{Codec, ReadBuffer};
use crate::error::{CoreError, CoreResult};
use crate::registry::{Message, Registry};
use bytes::{BufMut, Bytes, BytesMut};
use std::io::Read;
use std::sync::Arc;

/// Size of the fixed header
pub const HEADER_LEN: usize = 12;

/// Largest `name + body` the framing accepts
pub const MAX_PAYLOAD_LEN: usize = u16::MAX as usize - HEADER_LEN;

/// Wire values of the flag byte
pub mod flag {
    /// Request that expects no answer
    pub const REQUEST: u8 = 0x01;
    /// Request that expects a response
    pub const REQUEST_NEED_RESP: u8 = 0x03;
    /// Successful response
    pub const RESPONSE: u8 = 0x10;
    /// Response carrying an error message
    pub const RESPONSE_ERROR: u8 = 0x30;
}

/// An outgoing or received call.
#[derive(Debug, Clone, PartialEq)]
pub struct Request<M> {
    pub seq_no: u64,
    pub method: String,
    pub payload: M,
    pub need_resp: bool,
}

/// The answer to a [`Request`], matched by `seq_no`.
#[derive(Debug, Clone, PartialEq)]
pub struct Response<M> {
    pub seq_no: u64,
    /// Payload on success, the remote error message otherwise
    pub result: Result<M, String>,
}

impl<M> Response<M> {
    pub fn ok(seq_no: u64, payload: M) -> Self {
        Self {
            seq_no,
            result: Ok(payload),
        }
    }

    pub fn error(seq_no: u64, message: impl Into<String>) -> Self {
        Self {
            seq_no,
            result: Err(message.into()),
        }
    }
}

/// Either direction of RPC traffic on one stream.
#[derive(Debug, Clone, PartialEq)]
pub enum RpcMessage<M> {
    Request(Request<M>),
    Response(Response<M>),
}

impl<M> From<Request<M>> for RpcMessage<M> {
    fn from(req: Request<M>) -> Self {
        RpcMessage::Request(req)
    }
}

impl<M> From<Response<M>> for RpcMessage<M> {
    fn from(resp: Response<M>) -> Self {
        RpcMessage::Response(resp)
    }
}

#[derive(Debug, Clone, Copy)]
struct Header {
    seq_no: u64,
    flag: u8,
    name_len: usize,
    body_len: usize,
}

impl Header {
    fn frame_len(&self) -> usize {
        self.name_len + self.body_len
    }
}

/// Codec for [`RpcMessage`] frames.
pub struct RpcCodec<M> {
    registry: Arc<Registry<M>>,
    buf: ReadBuffer,
    header: Option<Header>,
}

impl<M: Message> RpcCodec<M> {
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
        let h = self.buf.as_slice();
        let mut seq = [0u8; 8];
        seq.copy_from_slice(&h[..8]);
        let header = Header {
            seq_no: u64::from_be_bytes(seq),
            flag: h[8],
            name_len: h[9] as usize,
            body_len: u16::from_be_bytes([h[10], h[11]]) as usize,
        };
        self.buf.skip(HEADER_LEN);
        self.header = Some(header);
    }

    fn unpack(&self, header: Header, name: &[u8], body: &[u8]) -> CoreResult<RpcMessage<M>> {
        let name = std::str::from_utf8(name)
            .map_err(|_| CoreError::protocol("message name is not UTF-8"))?;
        match header.flag {
            flag::REQUEST | flag::REQUEST_NEED_RESP => Ok(RpcMessage::Request(Request {
                seq_no: header.seq_no,
                method: name.to_owned(),
                payload: self.registry.unmarshal(name, body)?,
                need_resp: header.flag == flag::REQUEST_NEED_RESP,
            })),
            flag::RESPONSE => Ok(RpcMessage::Response(Response::ok(
                header.seq_no,
                self.registry.unmarshal(name, body)?,
            ))),
            flag::RESPONSE_ERROR => Ok(RpcMessage::Response(Response::error(
                header.seq_no,
                String::from_utf8_lossy(body),
            ))),
            other => Err(CoreError::protocol(format!("unknown rpc flag {other:#04x}"))),
        }
    }
}

impl<M> Clone for RpcCodec<M> {
    fn clone(&self) -> Self {
        Self {
            registry: Arc::clone(&self.registry),
            buf: self.buf.clone(),
            header: None,
        }
    }
}

fn pack(seq_no: u64, flag: u8, name: &str, body: &[u8]) -> CoreResult<Bytes> {
    if name.len() > u8::MAX as usize {
        return Err(CoreError::protocol(format!(
            "name {name} longer than 255 bytes"
        )));
    }
    let payload_len = name.len() + body.len();
    if payload_len > MAX_PAYLOAD_LEN {
        return Err(CoreError::too_large(payload_len, MAX_PAYLOAD_LEN));
    }
    let mut out = BytesMut::with_capacity(HEADER_LEN + payload_len);
    out.put_u64(seq_no);
    out.put_u8(flag);
    out.put_u8(name.len() as u8);
    out.put_u16(body.len() as u16);
    out.extend_from_slice(name.as_bytes());
    out.extend_from_slice(body);
    Ok(out.freeze())
}

impl<M: Message> Codec for RpcCodec<M> {
    type Item = RpcMessage<M>;

    fn encode(&self, item: &RpcMessage<M>) -> CoreResult<Bytes> {
        match item {
            RpcMessage::Request(req) => {
                let flag = if req.need_resp {
                    flag::REQUEST_NEED_RESP
                } else {
                    flag::REQUEST
                };
                pack(req.seq_no, flag, &req.method, &req.payload.marshal()?)
            }
            RpcMessage::Response(Response {
                seq_no,
                result: Ok(payload),
            }) => pack(*seq_no, flag::RESPONSE, payload.name(), &payload.marshal()?),
            RpcMessage::Response(Response {
                seq_no,
                result: Err(message),
            }) => pack(*seq_no, flag::RESPONSE_ERROR, "", message.as_bytes()),
        }
    }

    fn decode(&mut self, src: &mut dyn Read) -> CoreResult<Option<RpcMessage<M>>> {
        loop {
            self.parse_header();
            if let Some(header) = self.header {
                if self.buf.len() >= header.frame_len() {
                    self.header = None;
                    let name = self.buf.take(header.name_len);
                    let body = self.buf.take(header.body_len);
                    return self.unpack(header, &name, &body).map(Some);
                }
            }
            if !self.buf.fill(src)? {
                return Ok(None);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct Num(u32);

    impl Message for Num {
        fn name(&self) -> &str {
            "num"
        }

        fn marshal(&self) -> CoreResult<Bytes> {
            Ok(Bytes::copy_from_slice(&self.0.to_be_bytes()))
        }
    }

    fn num(body: &[u8]) -> CoreResult<Num> {
        let raw: [u8; 4] = body
            .try_into()
            .map_err(|_| CoreError::protocol("num needs 4 bytes"))?;
        Ok(Num(u32::from_be_bytes(raw)))
    }

    fn codec() -> RpcCodec<Num> {
        let mut reg = Registry::new();
        reg.register("num", num).unwrap();
        reg.register("double", num).unwrap();
        RpcCodec::new(Arc::new(reg))
    }

    #[test]
    fn test_request_layout() {
        let req = RpcMessage::Request(Request {
            seq_no: 1,
            method: "double".into(),
            payload: Num(2),
            need_resp: true,
        });
        let frame = codec().encode(&req).unwrap();

        assert_eq!(&frame[..8], &1u64.to_be_bytes());
        assert_eq!(frame[8], flag::REQUEST_NEED_RESP);
        assert_eq!(frame[9], 6);
        assert_eq!(&frame[10..12], &[0, 4]);
        assert_eq!(&frame[12..18], b"double");
        assert_eq!(&frame[18..], &[0, 0, 0, 2]);
    }

    #[test]
    fn test_error_response_layout() {
        let resp: RpcMessage<Num> = Response::error(9, "boom").into();
        let frame = codec().encode(&resp).unwrap();

        assert_eq!(frame[8], flag::RESPONSE_ERROR);
        assert_eq!(frame[9], 0);
        assert_eq!(&frame[12..], b"boom");
    }

    #[test]
    fn test_decode_mixed_stream() {
        let codec_out = codec();
        let mut wire = Vec::new();
        let sent: Vec<RpcMessage<Num>> = vec![
            Request {
                seq_no: 3,
                method: "double".into(),
                payload: Num(21),
                need_resp: false,
            }
            .into(),
            Response::ok(3, Num(42)).into(),
            Response::error(4, "no such thing").into(),
        ];
        for msg in &sent {
            wire.extend_from_slice(&codec_out.encode(msg).unwrap());
        }

        let mut codec_in = codec_out.clone();
        let mut src: &[u8] = &wire;
        for expected in &sent {
            assert_eq!(codec_in.decode(&mut src).unwrap().as_ref(), Some(expected));
        }
    }

    #[test]
    fn test_unknown_flag_rejected() {
        let mut frame = vec![0u8; HEADER_LEN];
        frame[8] = 0x07;
        let mut src: &[u8] = &frame;
        assert!(matches!(
            codec().decode(&mut src),
            Err(CoreError::Protocol { .. })
        ));
    }

    #[test]
    fn test_oversize_rejected() {
        let body = "x".repeat(MAX_PAYLOAD_LEN);
        let resp: RpcMessage<Num> = Response::error(1, body).into();
        assert!(codec().encode(&resp).is_ok());

        let body = "x".repeat(MAX_PAYLOAD_LEN + 1);
        let resp: RpcMessage<Num> = Response::error(1, body).into();
        assert!(matches!(
            codec().encode(&resp),
            Err(CoreError::FrameTooLarge { .. })
        ));
    }
}
