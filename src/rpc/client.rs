//! Caller side: sequence numbers, pending calls and their timers

use super::channel::RpcChannel;
use crate::error::{DnetError, Result, StateError};
use crate::metrics::global_metrics;
use dashmap::DashMap;
use dnet_core::{Request, Response};
use parking_lot::Mutex;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

/// Timeout used when a call passes `Duration::ZERO`
pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(8);

/// Receives the outcome of one call, exactly once.
pub type CallCallback<M> = Box<dyn FnOnce(Result<M>) + Send>;

struct PendingCall<M> {
    callback: Mutex<CallCallback<M>>,
    timer: Option<JoinHandle<()>>,
    deadline: Instant,
}

/// Correlates responses with outstanding calls.
///
/// Every call is resolved by exactly one of: its response, or its timer. The
/// pending table's atomic `remove` decides which.
pub struct Client<M> {
    seq: AtomicU64,
    pending: Arc<DashMap<u64, PendingCall<M>>>,
    runtime: Handle,
}

impl<M: Send + 'static> Client<M> {
    /// Create a client whose timers run on `runtime`.
    pub fn new(runtime: Handle) -> Self {
        Self {
            seq: AtomicU64::new(0),
            pending: Arc::new(DashMap::new()),
            runtime,
        }
    }

    /// Create a client on the runtime of the calling context.
    pub fn from_current() -> Result<Self> {
        let runtime = Handle::try_current()
            .map_err(|e| DnetError::config(format!("no tokio runtime: {e}")))?;
        Ok(Self::new(runtime))
    }

    fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Calls awaiting a response or timeout
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Time left before the call `seq_no` times out
    pub fn remaining(&self, seq_no: u64) -> Option<Duration> {
        self.pending
            .get(&seq_no)
            .map(|call| call.deadline.saturating_duration_since(Instant::now()))
    }

    /// Send a request and arrange for `callback` to receive its outcome.
    ///
    /// Returns the call's sequence number. If sending fails the callback is
    /// dropped without being invoked and the error is returned.
    pub fn call<Ch, F>(
        &self,
        channel: &Ch,
        method: &str,
        payload: M,
        timeout: Duration,
        callback: F,
    ) -> Result<u64>
    where
        Ch: RpcChannel<M> + ?Sized,
        F: FnOnce(Result<M>) + Send + 'static,
    {
        let timeout = if timeout.is_zero() {
            DEFAULT_RPC_TIMEOUT
        } else {
            timeout
        };
        let seq_no = self.next_seq();

        // Registered before sending: the response may arrive before send returns.
        self.pending.insert(
            seq_no,
            PendingCall {
                callback: Mutex::new(Box::new(callback)),
                timer: None,
                deadline: Instant::now() + timeout,
            },
        );
        let timer = self.arm_timer(seq_no, timeout);
        match self.pending.get_mut(&seq_no) {
            Some(mut call) => call.timer = Some(timer),
            None => timer.abort(),
        }

        let req = Request {
            seq_no,
            method: method.to_string(),
            payload,
            need_resp: true,
        };
        if let Err(e) = channel.send_request(req) {
            if let Some((_, call)) = self.pending.remove(&seq_no) {
                if let Some(timer) = call.timer {
                    timer.abort();
                }
            }
            return Err(e);
        }

        global_metrics().rpc_call();
        trace!(seq_no, method, "RPC call sent");
        Ok(seq_no)
    }

    fn arm_timer(&self, seq_no: u64, timeout: Duration) -> JoinHandle<()> {
        let pending = Arc::clone(&self.pending);
        let timeout_ms = timeout.as_millis() as u64;
        self.runtime.spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some((_, call)) = pending.remove(&seq_no) {
                global_metrics().rpc_timeout();
                debug!(seq_no, timeout_ms, "RPC call timed out");
                (call.callback.into_inner())(Err(DnetError::timeout(timeout_ms)));
            }
        })
    }

    /// Like [`call`](Self::call), resolving a future instead of a callback.
    pub fn call_future<Ch>(
        &self,
        channel: &Ch,
        method: &str,
        payload: M,
        timeout: Duration,
    ) -> Result<impl Future<Output = Result<M>>>
    where
        Ch: RpcChannel<M> + ?Sized,
    {
        let (tx, rx) = oneshot::channel();
        self.call(channel, method, payload, timeout, move |result| {
            let _ = tx.send(result);
        })?;
        Ok(async move {
            rx.await
                .unwrap_or_else(|_| Err(DnetError::state(StateError::Closed)))
        })
    }

    /// Send a request that expects no response.
    pub fn post<Ch>(&self, channel: &Ch, method: &str, payload: M) -> Result<u64>
    where
        Ch: RpcChannel<M> + ?Sized,
    {
        let seq_no = self.next_seq();
        channel.send_request(Request {
            seq_no,
            method: method.to_string(),
            payload,
            need_resp: false,
        })?;
        trace!(seq_no, method, "RPC post sent");
        Ok(seq_no)
    }

    /// Resolve the call matching `resp`.
    ///
    /// Returns `false` when no call is pending under that sequence number,
    /// e.g. because its timer already fired.
    pub fn on_response(&self, resp: Response<M>) -> bool {
        let Some((_, call)) = self.pending.remove(&resp.seq_no) else {
            debug!(seq_no = resp.seq_no, "Response for unknown or expired call");
            return false;
        };
        if let Some(timer) = call.timer {
            timer.abort();
        }
        (call.callback.into_inner())(resp.result.map_err(DnetError::rpc));
        true
    }
}

impl<M> Drop for Client<M> {
    fn drop(&mut self) {
        for call in self.pending.iter() {
            if let Some(timer) = &call.timer {
                timer.abort();
            }
        }
    }
}
