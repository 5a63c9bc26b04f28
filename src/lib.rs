//! lyrebird: distributed tweet decryption.
//!
//! A job source streams decryption jobs to connected dispatchers using
//! credit-based flow control. Each dispatcher schedules the jobs it receives
//! on a private worker pool, first-come-first-served, and forwards every
//! worker result back to the job source.

// Core modules
pub mod cli;
pub mod config;
pub mod decrypt;
pub mod dispatcher;
pub mod error;
pub mod logging;
pub mod net;
pub mod protocol;
pub mod scheduler;
pub mod source;
pub mod worker;

// Re-export commonly used types
pub use config::{ClientConfig, ServerConfig};
pub use dispatcher::{DispatchReport, Dispatcher};
pub use error::{DispatchError, ProtocolError, SourceError};
pub use source::{JobSource, ServeReport};
