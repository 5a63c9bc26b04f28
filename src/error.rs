//! Error types for lyrebird operations.
//!
//! Defines the error types shared across tiers:
//! - Wire protocol framing
//! - Job source startup and job-stream access
//! - Dispatcher startup and argument validation
//!
//! Worker-pool and per-record errors live next to the code that raises them
//! (`scheduler::worker_pool::PoolError`, `worker::RecordError`,
//! `decrypt::DecryptError`).

use std::net::SocketAddr;
use std::path::PathBuf;

use thiserror::Error;

use crate::protocol::Status;

/// Errors raised while framing or reading protocol messages.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Payload of {len} bytes exceeds the maximum of {max} bytes")]
    PayloadTooLong { len: usize, max: usize },

    #[error("Payload contains a NUL byte")]
    InteriorNul,

    #[error("Unknown status byte 0x{0:02x}")]
    UnknownStatus(u8),

    #[error("Peer closed the stream in the middle of a {status} frame")]
    Truncated { status: Status },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors that stop the job source from starting or reading its job stream.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("Unable to open configuration file {path}: {source}")]
    ConfigOpen {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Unable to read configuration {name}: {source}")]
    ConfigRead {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Unable to bind socket to {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors that stop a dispatcher from starting.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("'{0}' is not a valid IP address")]
    InvalidAddress(String),

    #[error("'{0}' is not a valid port number")]
    InvalidPort(String),

    #[error("Unable to connect to server {addr}: {source}")]
    Connect {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("No workers could be started ({requested} requested)")]
    NoWorkers { requested: usize },
}
