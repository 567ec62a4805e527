//! Configuration types for sessions and the reactor service

use crate::error::{DnetError, Result};
use std::time::Duration;

/// What `send` does when the bounded send queue is full
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SendPolicy {
    /// Return a capacity error immediately
    #[default]
    FailFast,
    /// Wait until the writer frees a slot or the session closes
    Block,
}

/// Session configuration builder
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Capacity of the bounded send queue
    pub send_queue_capacity: usize,
    /// Behaviour of `send` on a full queue
    pub send_policy: SendPolicy,
    /// Read deadline; expiry is reported as a timeout error
    pub read_timeout: Option<Duration>,
    /// Write deadline; expiry is reported as a timeout error
    pub write_timeout: Option<Duration>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            send_queue_capacity: 1024,
            send_policy: SendPolicy::FailFast,
            read_timeout: None,
            write_timeout: None,
        }
    }
}

impl SessionConfig {
    /// Create a new configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set send queue capacity
    pub fn send_queue_capacity(mut self, capacity: usize) -> Self {
        self.send_queue_capacity = capacity;
        self
    }

    /// Set full-queue behaviour
    pub fn send_policy(mut self, policy: SendPolicy) -> Self {
        self.send_policy = policy;
        self
    }

    /// Block senders instead of failing when the queue is full
    pub fn blocking_send(self) -> Self {
        self.send_policy(SendPolicy::Block)
    }

    /// Set read deadline
    pub fn read_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.read_timeout = timeout;
        self
    }

    /// Set write deadline
    pub fn write_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.write_timeout = timeout;
        self
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.send_queue_capacity == 0 {
            return Err(DnetError::config("Send queue capacity must be greater than 0"));
        }

        if self.read_timeout == Some(Duration::ZERO) {
            return Err(DnetError::config("Read timeout must be greater than 0"));
        }

        if self.write_timeout == Some(Duration::ZERO) {
            return Err(DnetError::config("Write timeout must be greater than 0"));
        }

        Ok(())
    }
}

/// Preset configurations for common use cases
impl SessionConfig {
    /// Small queue, blocking producers, generous deadlines
    pub fn bulk() -> Self {
        Self::default()
            .send_queue_capacity(256)
            .blocking_send()
            .write_timeout(Some(Duration::from_secs(30)))
    }

    /// Fail fast and detect silent peers quickly
    pub fn interactive() -> Self {
        Self::default()
            .read_timeout(Some(Duration::from_secs(10)))
            .write_timeout(Some(Duration::from_secs(5)))
    }
}

/// Reactor service configuration
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Number of event loops; 0 picks twice the available parallelism
    pub loop_count: usize,
    /// Initial size of each poller's readiness buffer
    pub events_capacity: usize,
    /// Prefix of loop thread names
    pub thread_name: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            loop_count: 0,
            events_capacity: 64,
            thread_name: "dnet-loop".to_string(),
        }
    }
}

impl ServiceConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set number of event loops
    pub fn loop_count(mut self, count: usize) -> Self {
        self.loop_count = count;
        self
    }

    /// Set initial readiness buffer size
    pub fn events_capacity(mut self, capacity: usize) -> Self {
        self.events_capacity = capacity;
        self
    }

    /// Set loop thread name prefix
    pub fn thread_name(mut self, name: impl Into<String>) -> Self {
        self.thread_name = name.into();
        self
    }

    /// Loop count with the automatic default applied
    pub fn effective_loop_count(&self) -> usize {
        if self.loop_count > 0 {
            return self.loop_count;
        }
        std::thread::available_parallelism()
            .map(|n| n.get() * 2)
            .unwrap_or(2)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.events_capacity == 0 {
            return Err(DnetError::config("Events capacity must be greater than 0"));
        }

        if self.thread_name.is_empty() {
            return Err(DnetError::config("Thread name must not be empty"));
        }

        Ok(())
    }
}
