//! Request/response correlation over sessions
//!
//! ```text
//!  Client::call ──► RpcChannel ──► wire ──► Dispatcher ──► Server::on_request
//!        ▲                                                      │
//!        └── Client::on_response ◄── Dispatcher ◄── wire ◄── Replier::reply
//! ```
//!
//! The wire format lives in [`dnet_core::rpc`]; this module only deals with
//! sequence numbers, timers, handlers and replies.

pub mod channel;
pub mod client;
pub mod server;

pub use channel::{RpcChannel, SessionChannel};
pub use client::{CallCallback, Client, DEFAULT_RPC_TIMEOUT};
pub use server::{MethodHandler, Replier, Server};

use dnet_core::RpcMessage;
use std::sync::Arc;
use tracing::debug;

/// Routes decoded [`RpcMessage`]s to the local server or client.
///
/// One dispatcher per stream: it answers requests on the channel it was built
/// with.
pub struct Dispatcher<M> {
    client: Arc<Client<M>>,
    server: Arc<Server<M>>,
    channel: Arc<dyn RpcChannel<M>>,
}

impl<M: Send + 'static> Dispatcher<M> {
    pub fn new(
        client: Arc<Client<M>>,
        server: Arc<Server<M>>,
        channel: Arc<dyn RpcChannel<M>>,
    ) -> Self {
        Self {
            client,
            server,
            channel,
        }
    }

    pub fn client(&self) -> &Arc<Client<M>> {
        &self.client
    }

    pub fn channel(&self) -> &Arc<dyn RpcChannel<M>> {
        &self.channel
    }

    /// Hand one message to the side it belongs to.
    pub fn dispatch(&self, msg: RpcMessage<M>) {
        match msg {
            RpcMessage::Request(req) => {
                if let Err(e) = self.server.on_request(Arc::clone(&self.channel), req) {
                    debug!(error = %e, "Request not handled");
                }
            }
            RpcMessage::Response(resp) => {
                self.client.on_response(resp);
            }
        }
    }
}
