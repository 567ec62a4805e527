//! Single-threaded event loop owning one poller and its connections

use super::poller::{Poller, Ready, WAKE_FD};
use crate::error::{DnetError, Result, StateError};
use crate::metrics::{LoopMetrics, LoopStats};
use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// Work marshalled onto the loop thread.
pub type Task = Box<dyn FnOnce(&mut LoopState) + Send>;

/// What a watched descriptor wants after handling an event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Flow {
    Continue,
    /// Run [`Watched::shutdown`] after every task already queued on the loop
    Shutdown,
    /// Deregister, release and report the given reason
    Close(String),
}

/// Loop-side half of a connection. Only ever touched on the loop thread.
pub trait Watched: Send {
    fn fd(&self) -> RawFd;

    /// Put the descriptor in non-blocking mode before registration.
    fn set_nonblocking(&self) -> io::Result<()>;

    /// React to readiness.
    fn on_ready(&mut self, poller: &Poller, ready: Ready) -> Flow;

    /// Queue bytes for writing.
    fn enqueue(&mut self, poller: &Poller, data: Bytes) -> Flow;

    /// Stop reading and close once queued writes are flushed.
    fn shutdown(&mut self, poller: &Poller) -> Flow;

    /// Release the descriptor. Called after it has been deregistered.
    fn finish(self: Box<Self>, reason: &str);
}

#[derive(Default)]
struct Pending {
    tasks: Vec<Task>,
    stopped: bool,
}

/// Cross-thread task queue. Once the loop has taken its final batch every
/// further push is refused.
struct TaskQueue {
    pending: Mutex<Pending>,
    poller: Arc<Poller>,
    metrics: Arc<LoopMetrics>,
}

impl TaskQueue {
    fn push(&self, task: Task) -> Result<()> {
        let was_empty = {
            let mut pending = self.pending.lock();
            if pending.stopped || self.poller.is_closed() {
                return Err(DnetError::state(StateError::Closed));
            }
            let was_empty = pending.tasks.is_empty();
            pending.tasks.push(task);
            was_empty
        };
        if was_empty {
            self.metrics.triggers.fetch_add(1, Ordering::Relaxed);
            self.poller.trigger()?;
        }
        Ok(())
    }

    fn take(&self) -> Vec<Task> {
        std::mem::take(&mut self.pending.lock().tasks)
    }

    fn take_final(&self) -> Vec<Task> {
        let mut pending = self.pending.lock();
        pending.stopped = true;
        std::mem::take(&mut pending.tasks)
    }
}

/// State owned by the loop thread and handed to every [`Task`].
pub struct LoopState {
    poller: Arc<Poller>,
    claims: Arc<DashMap<RawFd, ()>>,
    queue: Arc<TaskQueue>,
    conns: HashMap<RawFd, Box<dyn Watched>>,
}

impl LoopState {
    fn new(claims: Arc<DashMap<RawFd, ()>>, queue: Arc<TaskQueue>) -> Self {
        Self {
            poller: Arc::clone(&queue.poller),
            claims,
            queue,
            conns: HashMap::new(),
        }
    }

    pub fn poller(&self) -> &Poller {
        &self.poller
    }

    /// Number of registered descriptors
    pub fn len(&self) -> usize {
        self.conns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conns.is_empty()
    }

    pub fn contains(&self, fd: RawFd) -> bool {
        self.conns.contains_key(&fd)
    }

    fn insert(&mut self, watched: Box<dyn Watched>) {
        let fd = watched.fd();
        if let Err(e) = self.poller.add_read(fd) {
            self.claims.remove(&fd);
            watched.finish(&format!("register failed: {e}"));
            return;
        }
        self.conns.insert(fd, watched);
        debug!(fd, "Watching descriptor");
    }

    /// Deregister `fd`, returning its handler. Unknown descriptors are ignored.
    pub fn remove(&mut self, fd: RawFd) -> Option<Box<dyn Watched>> {
        let watched = self.conns.remove(&fd)?;
        if let Err(e) = self.poller.delete(fd) {
            debug!(fd, error = %e, "Deregistration failed");
        }
        self.claims.remove(&fd);
        Some(watched)
    }

    /// Deregister and release `fd` with `reason`.
    pub fn close(&mut self, fd: RawFd, reason: &str) {
        if let Some(watched) = self.remove(fd) {
            watched.finish(reason);
        }
    }

    /// Run `f` against the handler of `fd` and act on the returned [`Flow`].
    ///
    /// Returns `false` when `fd` is not registered.
    pub fn with<F>(&mut self, fd: RawFd, f: F) -> bool
    where
        F: FnOnce(&mut dyn Watched, &Poller) -> Flow,
    {
        let flow = match self.conns.get_mut(&fd) {
            Some(watched) => f(watched.as_mut(), &self.poller),
            None => return false,
        };
        match flow {
            Flow::Continue => {}
            Flow::Shutdown => self.defer_shutdown(fd),
            Flow::Close(reason) => self.close(fd, &reason),
        }
        true
    }

    /// Queue `fd`'s shutdown behind the tasks already submitted, so writes
    /// handed to the loop earlier are flushed first.
    fn defer_shutdown(&mut self, fd: RawFd) {
        let deferred = self.queue.push(Box::new(move |state: &mut LoopState| {
            state.with(fd, |watched, poller| watched.shutdown(poller));
        }));
        if deferred.is_err() {
            debug!(fd, "Shutdown not deferred; event loop stopping");
        }
    }

    fn close_all(&mut self, reason: &str) {
        let fds: Vec<RawFd> = self.conns.keys().copied().collect();
        for fd in fds {
            self.close(fd, reason);
        }
    }
}

/// One poller, one thread, many connections.
///
/// Any thread may [`submit`](EventLoop::submit) work; it runs on the loop
/// thread in submission order.
pub struct EventLoop {
    id: usize,
    poller: Arc<Poller>,
    claims: Arc<DashMap<RawFd, ()>>,
    queue: Arc<TaskQueue>,
    running: AtomicBool,
    metrics: Arc<LoopMetrics>,
}

impl EventLoop {
    pub fn new(id: usize, events_capacity: usize) -> Result<Self> {
        let poller = Arc::new(Poller::open(events_capacity)?);
        let metrics = Arc::new(LoopMetrics::default());
        Ok(Self {
            id,
            queue: Arc::new(TaskQueue {
                pending: Mutex::new(Pending::default()),
                poller: Arc::clone(&poller),
                metrics: Arc::clone(&metrics),
            }),
            poller,
            claims: Arc::new(DashMap::new()),
            running: AtomicBool::new(false),
            metrics,
        })
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn poller(&self) -> &Arc<Poller> {
        &self.poller
    }

    pub fn is_stopped(&self) -> bool {
        self.poller.is_closed()
    }

    pub fn stats(&self) -> LoopStats {
        self.metrics.snapshot()
    }

    /// Queue `task` for the loop thread.
    ///
    /// Only the submission that finds the queue empty wakes the poller. A task
    /// accepted here is guaranteed to run; once the loop has stopped,
    /// submission fails instead.
    pub fn submit<F>(&self, task: F) -> Result<()>
    where
        F: FnOnce(&mut LoopState) + Send + 'static,
    {
        self.queue.push(Box::new(task))
    }

    /// Register a connection with this loop.
    ///
    /// The descriptor is claimed immediately; registration with the poller
    /// happens on the loop thread.
    pub fn watch(&self, watched: Box<dyn Watched>) -> Result<()> {
        let fd = watched.fd();
        match self.claims.entry(fd) {
            Entry::Occupied(_) => return Err(DnetError::state(StateError::AlreadyWatched)),
            Entry::Vacant(slot) => {
                slot.insert(());
            }
        }
        let registered = watched
            .set_nonblocking()
            .map_err(DnetError::from)
            .and_then(|()| self.submit(move |state| state.insert(watched)));
        if registered.is_err() {
            self.claims.remove(&fd);
        }
        registered
    }

    /// Whether `fd` is registered or about to be
    pub fn is_watched(&self, fd: RawFd) -> bool {
        self.claims.contains_key(&fd)
    }

    /// Deregister and release `fd`. Idempotent.
    pub fn remove(&self, fd: RawFd) -> Result<()> {
        self.submit(move |state| state.close(fd, "removed from event loop"))
    }

    /// Poll and run tasks on the calling thread until [`stop`](Self::stop).
    pub fn run(&self) -> Result<()> {
        if self.running.swap(true, Ordering::AcqRel) {
            return Err(DnetError::state(StateError::AlreadyStarted));
        }
        info!(loop_id = self.id, "Event loop started");

        let mut state = LoopState::new(Arc::clone(&self.claims), Arc::clone(&self.queue));
        let result = self.poller.poll(|fd, ready| {
            if fd == WAKE_FD {
                self.metrics.wakeups.fetch_add(1, Ordering::Relaxed);
                self.run_tasks(&mut state, self.queue.take());
            } else {
                self.metrics.events.fetch_add(1, Ordering::Relaxed);
                state.with(fd, |watched, poller| watched.on_ready(poller, ready));
            }
            Ok(())
        });

        self.run_tasks(&mut state, self.queue.take_final());
        state.close_all("event loop stopped");
        info!(loop_id = self.id, "Event loop stopped");
        result
    }

    fn run_tasks(&self, state: &mut LoopState, tasks: Vec<Task>) {
        for task in tasks {
            self.metrics.tasks_run.fetch_add(1, Ordering::Relaxed);
            task(state);
        }
    }

    /// Make [`run`](Self::run) return. Registered connections are closed on
    /// the way out.
    pub fn stop(&self) -> Result<()> {
        self.poller.close()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_tasks_run_in_order_with_one_wake() {
        let event_loop = Arc::new(EventLoop::new(0, 64).unwrap());
        let order = Arc::new(Mutex::new(Vec::new()));
        let (done_tx, done_rx) = crossbeam_channel::bounded(1);

        for i in 0..100 {
            let order = order.clone();
            event_loop
                .submit(move |_| order.lock().push(i))
                .unwrap();
        }
        event_loop
            .submit(move |_| {
                let _ = done_tx.send(());
            })
            .unwrap();

        let runner = event_loop.clone();
        let handle = thread::spawn(move || runner.run());
        done_rx.recv().unwrap();
        event_loop.stop().unwrap();
        handle.join().unwrap().unwrap();

        assert_eq!(*order.lock(), (0..100).collect::<Vec<_>>());
        let stats = event_loop.stats();
        assert_eq!(stats.triggers, 1);
        assert_eq!(stats.tasks_run, 101);
    }

    #[test]
    fn test_submit_after_stop_fails() {
        let event_loop = EventLoop::new(1, 8).unwrap();
        event_loop.stop().unwrap();
        assert!(event_loop.submit(|_| {}).is_err());
        assert!(event_loop.is_stopped());
    }

    #[test]
    fn test_run_twice_rejected() {
        let event_loop = Arc::new(EventLoop::new(2, 8).unwrap());
        let runner = event_loop.clone();
        let handle = thread::spawn(move || runner.run());

        let (tx, rx) = crossbeam_channel::bounded(1);
        event_loop
            .submit(move |_| {
                let _ = tx.send(());
            })
            .unwrap();
        rx.recv().unwrap();

        assert!(matches!(
            event_loop.run(),
            Err(DnetError::State {
                kind: StateError::AlreadyStarted
            })
        ));
        event_loop.stop().unwrap();
        handle.join().unwrap().unwrap();
    }
}
