//! Shared test helpers for dnet integration tests

#![allow(dead_code)]

use bytes::Bytes;
use dnet::{CoreError, Message, Registry};
use dnet_core::CoreResult;
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::time::Duration;

/// Generous bound for anything a test waits on.
pub const WAIT: Duration = Duration::from_secs(5);

/// Install a fmt subscriber once; honours RUST_LOG.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A connected loopback TCP pair: (client, server).
pub fn tcp_pair() -> (TcpStream, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
    let (server, _) = listener.accept().unwrap();
    (client, server)
}

/// Payloads used by the RPC tests.
#[derive(Debug, Clone, PartialEq)]
pub enum Msg {
    Text(String),
    Num(u64),
}

impl Message for Msg {
    fn name(&self) -> &str {
        match self {
            Msg::Text(_) => "text",
            Msg::Num(_) => "num",
        }
    }

    fn marshal(&self) -> CoreResult<Bytes> {
        Ok(match self {
            Msg::Text(s) => Bytes::copy_from_slice(s.as_bytes()),
            Msg::Num(n) => Bytes::copy_from_slice(&n.to_be_bytes()),
        })
    }
}

fn text(body: &[u8]) -> CoreResult<Msg> {
    String::from_utf8(body.to_vec())
        .map(Msg::Text)
        .map_err(|_| CoreError::protocol("text is not UTF-8"))
}

fn num(body: &[u8]) -> CoreResult<Msg> {
    let raw: [u8; 8] = body
        .try_into()
        .map_err(|_| CoreError::protocol("num needs 8 bytes"))?;
    Ok(Msg::Num(u64::from_be_bytes(raw)))
}

/// Payload types plus the method names the tests call.
pub fn registry() -> Arc<Registry<Msg>> {
    let mut reg = Registry::new();
    reg.register_with_id(1, "text", text).unwrap();
    reg.register_with_id(2, "num", num).unwrap();
    for method in ["echo", "boom", "silent", "missing"] {
        reg.register(method, text).unwrap();
    }
    for method in ["double", "twice"] {
        reg.register(method, num).unwrap();
    }
    Arc::new(reg)
}
