//! Runtime configuration for the job source and dispatcher tiers.

use std::net::IpAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::protocol::MAX_MESSAGE_LEN;
use crate::scheduler::worker_pool::default_pool_size;

/// Default maximum number of simultaneously connected dispatchers.
pub const DEFAULT_MAX_CLIENTS: usize = 4096;

/// Default bounded wait of every polling loop.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Configuration for [`JobSource`](crate::source::JobSource).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address to listen on. `None` discovers a non-loopback address.
    pub bind_addr: Option<IpAddr>,
    /// Port to listen on; 0 picks an ephemeral port.
    pub port: u16,
    /// Connections beyond this count are accepted and closed immediately.
    pub max_clients: usize,
    /// Bounded wait used when polling dispatchers.
    pub poll_interval: Duration,
    /// Maximum frame length.
    pub max_message_len: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: None,
            port: 0,
            max_clients: DEFAULT_MAX_CLIENTS,
            poll_interval: DEFAULT_POLL_INTERVAL,
            max_message_len: MAX_MESSAGE_LEN,
        }
    }
}

impl ServerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the listening address.
    pub fn with_bind_addr(mut self, addr: IpAddr) -> Self {
        self.bind_addr = Some(addr);
        self
    }

    /// Sets the listening port.
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Sets the connection limit.
    pub fn with_max_clients(mut self, max_clients: usize) -> Self {
        self.max_clients = max_clients;
        self
    }

    /// Sets the polling wait.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Sets the maximum frame length.
    pub fn with_max_message_len(mut self, max_len: usize) -> Self {
        self.max_message_len = max_len;
        self
    }
}

/// Configuration for [`Dispatcher`](crate::dispatcher::Dispatcher).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Worker pool size. `None` uses one worker per spare core.
    pub workers: Option<usize>,
    /// Bounded wait used when polling the job source and workers.
    pub poll_interval: Duration,
    /// Maximum frame length.
    pub max_message_len: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            workers: None,
            poll_interval: DEFAULT_POLL_INTERVAL,
            max_message_len: MAX_MESSAGE_LEN,
        }
    }
}

impl ClientConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the worker pool size.
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = Some(workers);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_max_message_len(mut self, max_len: usize) -> Self {
        self.max_message_len = max_len;
        self
    }

    /// Pool size to launch.
    pub fn pool_size(&self) -> usize {
        self.workers.unwrap_or_else(default_pool_size)
    }
}
