//! Job records, the job stream and the dispatcher-side worker pool.
//!
//! - **Job**: one input/output path pair, and how a worker reports on it
//! - **JobStream**: pulls records one at a time from the job-stream source
//! - **WorkerPool**: fixed-order pool of workers with FCFS selection
//!
//! # Architecture
//!
//! ```text
//!   ┌────────────┐  LINE   ┌────────────┐ record ┌──────────┐
//!   │ Job source │ ──────► │ Dispatcher │ ─────► │ Worker 1 │
//!   │ (JobStream)│ ◄────── │(WorkerPool)│ ◄───── │ Worker N │
//!   └────────────┘ results └────────────┘ frames └──────────┘
//! ```

pub mod job;
pub mod queue;
pub mod worker_pool;

// Re-export main types for convenience
pub use job::{Job, RecordOutcome};
pub use queue::JobStream;
pub use worker_pool::{
    default_pool_size, LaunchedWorker, PoolError, ProcessLauncher, TaskLauncher,
    WorkerHandle, WorkerLauncher, WorkerPool, WorkerProcess,
};
