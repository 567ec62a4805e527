//! Outbound path for RPC traffic

use crate::error::{DnetError, Result, StateError};
use crate::session::Session;
use dnet_core::{Codec, Request, Response, RpcMessage};
use std::sync::{Arc, Weak};

/// Where the RPC layer sends requests and responses.
pub trait RpcChannel<M>: Send + Sync {
    fn send_request(&self, req: Request<M>) -> Result<()>;

    fn send_response(&self, resp: Response<M>) -> Result<()>;
}

/// [`RpcChannel`] over any session whose codec carries [`RpcMessage`]s.
///
/// Holds the session weakly, so storing the channel inside the session's own
/// message callback does not keep the session alive.
pub struct SessionChannel<S> {
    session: Weak<S>,
}

impl<S> SessionChannel<S> {
    pub fn new(session: &Arc<S>) -> Self {
        Self {
            session: Arc::downgrade(session),
        }
    }

    /// The session, if it is still alive
    pub fn session(&self) -> Option<Arc<S>> {
        self.session.upgrade()
    }
}

impl<S> Clone for SessionChannel<S> {
    fn clone(&self) -> Self {
        Self {
            session: Weak::clone(&self.session),
        }
    }
}

impl<M, S> SessionChannel<S>
where
    M: Send + 'static,
    S: Session,
    S::Codec: Codec<Item = RpcMessage<M>>,
{
    fn send(&self, msg: RpcMessage<M>) -> Result<()> {
        let session = self
            .session
            .upgrade()
            .ok_or_else(|| DnetError::state(StateError::Closed))?;
        session.send(msg)
    }
}

impl<M, S> RpcChannel<M> for SessionChannel<S>
where
    M: Send + 'static,
    S: Session,
    S::Codec: Codec<Item = RpcMessage<M>>,
{
    fn send_request(&self, req: Request<M>) -> Result<()> {
        self.send(RpcMessage::Request(req))
    }

    fn send_response(&self, resp: Response<M>) -> Result<()> {
        self.send(RpcMessage::Response(resp))
    }
}
