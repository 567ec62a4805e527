//! Fixed pool of event loops, one thread each

use super::connection::Connection;
use super::event_loop::EventLoop;
use crate::config::ServiceConfig;
use crate::error::{DnetError, Result, StateError};
use crate::transport::Transport;
use dnet_core::Codec;
use parking_lot::Mutex;
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{error, info};

/// Round-robin pool of [`EventLoop`]s.
pub struct Service {
    config: ServiceConfig,
    loops: Vec<Arc<EventLoop>>,
    cursor: AtomicUsize,
    started: AtomicBool,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl Service {
    pub fn new(config: ServiceConfig) -> Result<Self> {
        config.validate()?;
        let loops = (0..config.effective_loop_count())
            .map(|id| EventLoop::new(id, config.events_capacity).map(Arc::new))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            config,
            loops,
            cursor: AtomicUsize::new(0),
            started: AtomicBool::new(false),
            threads: Mutex::new(Vec::new()),
        })
    }

    /// Service with `loop_count` loops and default settings otherwise.
    pub fn with_loops(loop_count: usize) -> Result<Self> {
        Self::new(ServiceConfig::new().loop_count(loop_count))
    }

    pub fn loops(&self) -> &[Arc<EventLoop>] {
        &self.loops
    }

    /// Next loop in round-robin order.
    pub fn next_event_loop(&self) -> Arc<EventLoop> {
        let i = self.cursor.fetch_add(1, Ordering::Relaxed) % self.loops.len();
        Arc::clone(&self.loops[i])
    }

    /// Bind `socket` to the next loop. The connection still needs a codec and
    /// a call to `start`.
    pub fn connection<C, S>(&self, socket: S) -> Connection<C, S>
    where
        C: Codec,
        S: Transport + AsRawFd,
    {
        Connection::new(self.next_event_loop(), socket)
    }

    /// Spawn one named thread per loop.
    pub fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(DnetError::state(StateError::AlreadyStarted));
        }
        let mut threads = self.threads.lock();
        for event_loop in &self.loops {
            let event_loop = Arc::clone(event_loop);
            let handle = thread::Builder::new()
                .name(format!("{}-{}", self.config.thread_name, event_loop.id()))
                .spawn(move || {
                    if let Err(e) = event_loop.run() {
                        error!(loop_id = event_loop.id(), error = %e, "Event loop failed");
                    }
                })?;
            threads.push(handle);
        }
        info!(loops = self.loops.len(), "Service started");
        Ok(())
    }

    /// Signal every loop to stop. Does not wait; see [`join`](Self::join).
    pub fn stop(&self) {
        for event_loop in &self.loops {
            if let Err(e) = event_loop.stop() {
                error!(loop_id = event_loop.id(), error = %e, "Failed to stop event loop");
            }
        }
    }

    /// Wait for loop threads to exit. Must not be called from a loop thread.
    pub fn join(&self) {
        let current = thread::current().id();
        let handles: Vec<JoinHandle<()>> = self.threads.lock().drain(..).collect();
        for handle in handles {
            if handle.thread().id() == current {
                continue;
            }
            let _ = handle.join();
        }
    }
}

impl Drop for Service {
    fn drop(&mut self) {
        self.stop();
        self.join();
        info!("Service stopped");
    }
}
