//! Callee side: method table, handler dispatch and one-shot replies

use super::channel::RpcChannel;
use crate::error::{DnetError, Result, StateError};
use dnet_core::{Request, Response};
use parking_lot::RwLock;
use std::any::Any;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, trace, warn};

/// Handles one method. Reply through the [`Replier`], now or later.
pub type MethodHandler<M> = Arc<dyn Fn(Replier<M>, M) + Send + Sync>;

/// Sends the single response to one request.
///
/// Clones share the same guard: across all of them only the first reply goes
/// out.
pub struct Replier<M> {
    channel: Arc<dyn RpcChannel<M>>,
    seq_no: u64,
    need_resp: bool,
    fired: Arc<AtomicBool>,
}

impl<M> Clone for Replier<M> {
    fn clone(&self) -> Self {
        Self {
            channel: Arc::clone(&self.channel),
            seq_no: self.seq_no,
            need_resp: self.need_resp,
            fired: Arc::clone(&self.fired),
        }
    }
}

impl<M> Replier<M> {
    pub fn new(channel: Arc<dyn RpcChannel<M>>, seq_no: u64, need_resp: bool) -> Self {
        Self {
            channel,
            seq_no,
            need_resp,
            fired: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn seq_no(&self) -> u64 {
        self.seq_no
    }

    /// Whether the caller waits for an answer
    pub fn need_resp(&self) -> bool {
        self.need_resp
    }

    /// Whether a reply has been made through this replier or a clone
    pub fn is_replied(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }

    fn claim(&self) -> Result<()> {
        self.fired
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|_| DnetError::state(StateError::RepeatedReply))
    }

    /// Answer with a payload. Nothing is sent if the caller expects no answer.
    pub fn reply(&self, payload: M) -> Result<()> {
        self.claim()?;
        if !self.need_resp {
            return Ok(());
        }
        self.channel.send_response(Response::ok(self.seq_no, payload))
    }

    /// Answer with an error message.
    pub fn reply_error(&self, message: impl Into<String>) -> Result<()> {
        self.claim()?;
        if !self.need_resp {
            return Ok(());
        }
        self.channel
            .send_response(Response::error(self.seq_no, message))
    }
}

/// Method registry and request dispatcher.
pub struct Server<M> {
    methods: RwLock<HashMap<String, MethodHandler<M>>>,
}

impl<M: Send + 'static> Server<M> {
    pub fn new() -> Self {
        Self {
            methods: RwLock::new(HashMap::new()),
        }
    }

    /// Register `handler` under `name`.
    ///
    /// Empty and duplicate names are configuration errors.
    pub fn try_register<F>(&self, name: &str, handler: F) -> Result<()>
    where
        F: Fn(Replier<M>, M) + Send + Sync + 'static,
    {
        if name.is_empty() {
            return Err(DnetError::config("rpc method name is empty"));
        }
        let mut methods = self.methods.write();
        if methods.contains_key(name) {
            return Err(DnetError::config(format!(
                "rpc method {name} registered twice"
            )));
        }
        methods.insert(name.to_string(), Arc::new(handler));
        Ok(())
    }

    /// Register `handler` under `name`, panicking on an empty or duplicate name.
    ///
    /// Meant for startup wiring, where a bad method table is a programming error.
    pub fn register<F>(&self, name: &str, handler: F)
    where
        F: Fn(Replier<M>, M) + Send + Sync + 'static,
    {
        if let Err(e) = self.try_register(name, handler) {
            panic!("{e}");
        }
    }

    pub fn has_method(&self, name: &str) -> bool {
        self.methods.read().contains_key(name)
    }

    /// Run the handler for `req`.
    ///
    /// Unknown methods and panicking handlers are answered with an error
    /// response when the caller expects one; both are also returned as errors.
    pub fn on_request(&self, channel: Arc<dyn RpcChannel<M>>, req: Request<M>) -> Result<()> {
        let Request {
            seq_no,
            method,
            payload,
            need_resp,
        } = req;
        let handler = self.methods.read().get(&method).cloned();
        let replier = Replier::new(channel, seq_no, need_resp);

        let Some(handler) = handler else {
            let message = format!("unknown rpc method: {method}");
            warn!(seq_no, method = %method, "Request for unknown method");
            if let Err(e) = replier.reply_error(message.as_str()) {
                error!(seq_no, error = %e, "Failed to send error response");
            }
            return Err(DnetError::rpc(message));
        };

        trace!(seq_no, method = %method, "Dispatching request");
        let guard = replier.clone();
        match panic::catch_unwind(AssertUnwindSafe(|| handler(replier, payload))) {
            Ok(()) => Ok(()),
            Err(panic) => {
                let message = format!(
                    "rpc method {method} panicked: {}",
                    panic_message(panic.as_ref())
                );
                error!(seq_no, method = %method, "{message}");
                if let Err(e) = guard.reply_error(message.as_str()) {
                    if !matches!(e, DnetError::State { kind: StateError::RepeatedReply }) {
                        error!(seq_no, error = %e, "Failed to send error response");
                    }
                }
                Err(DnetError::rpc(message))
            }
        }
    }
}

impl<M: Send + 'static> Default for Server<M> {
    fn default() -> Self {
        Self::new()
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
