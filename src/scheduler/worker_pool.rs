//! Dispatcher-side worker pool.
//!
//! The pool owns one [`WorkerHandle`] per launched worker. Pool order is
//! fixed at launch time and is the FCFS scan order: a job always goes to the
//! first worker that is ready, never to the "most idle" one.
//!
//! # Launchers
//!
//! - [`ProcessLauncher`]: re-executes a binary (normally the current one with
//!   the hidden `worker` subcommand) with piped stdin/stdout, so every worker
//!   is its own fault domain.
//! - [`TaskLauncher`]: runs the worker as a tokio task over in-memory pipes.
//!
//! # Channels
//!
//! Job records go down as newline-terminated text. Results come back as
//! frames and are decoded by one reader task per worker, all feeding a
//! single inbound channel drained with [`WorkerPool::poll_batch`].

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::job::Job;
use crate::decrypt::Decryptor;
use crate::protocol::{self, spawn_frame_reader, Inbound, INBOUND_CAPACITY, MAX_MESSAGE_LEN};
use crate::worker::{Worker, WorkerExit};

/// Buffer size of each in-memory pipe used by [`TaskLauncher`].
const TASK_PIPE_CAPACITY: usize = 64 * 1024;

/// Errors that can occur in the worker pool.
#[derive(Debug, Error)]
pub enum PoolError {
    /// A worker could not be started.
    #[error("Unable to launch worker {index}: {source}")]
    Launch {
        index: usize,
        #[source]
        source: std::io::Error,
    },

    /// A launched worker is missing one of its pipes.
    #[error("Worker {identity} has no {pipe} pipe")]
    MissingPipe {
        identity: String,
        pipe: &'static str,
    },

    /// Writing a job record to a worker failed.
    #[error("Unable to send job to worker {identity}: {source}")]
    Channel {
        identity: String,
        #[source]
        source: std::io::Error,
    },

    /// The worker is not ready, terminated, or does not exist.
    #[error("Worker {0} cannot take a job")]
    NotReady(usize),

    /// The path of the running executable could not be determined.
    #[error("Unable to locate current executable: {0}")]
    CurrentExe(#[source] std::io::Error),
}

/// Default pool size: one worker per spare core, at least one.
pub fn default_pool_size() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        .saturating_sub(1)
        .max(1)
}

/// Handle used to observe a worker's termination.
#[derive(Debug)]
pub enum WorkerProcess {
    /// A child process.
    Child(Child),
    /// An in-process task.
    Task(JoinHandle<WorkerExit>),
}

impl WorkerProcess {
    /// Waits for the worker to reach a terminal state.
    pub async fn wait(self) -> WorkerExit {
        match self {
            WorkerProcess::Child(mut child) => match child.wait().await {
                Ok(status) if status.success() => WorkerExit::Success,
                Ok(status) => WorkerExit::Failure(status.code()),
                Err(e) => {
                    warn!(error = %e, "Unable to wait for worker process");
                    WorkerExit::Failure(None)
                }
            },
            WorkerProcess::Task(handle) => match handle.await {
                Ok(exit) => exit,
                Err(e) => {
                    warn!(error = %e, "Worker task panicked or was cancelled");
                    WorkerExit::Failure(None)
                }
            },
        }
    }
}

/// A freshly started worker and its channel ends.
pub struct LaunchedWorker {
    /// Name used in logs (process id for child processes).
    pub identity: String,
    /// Inbound channel of the worker: job records are written here.
    pub writer: Box<dyn AsyncWrite + Unpin + Send>,
    /// Outbound channel of the worker: result frames are read here.
    pub reader: Box<dyn AsyncRead + Unpin + Send>,
    pub process: WorkerProcess,
}

/// Starts workers for a pool.
pub trait WorkerLauncher: Send + Sync {
    /// Starts the worker at position `index` of the pool.
    fn launch(&self, index: usize) -> Result<LaunchedWorker, PoolError>;
}

/// Launches workers as child processes.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    program: PathBuf,
    args: Vec<String>,
}

impl ProcessLauncher {
    /// Launches `program` with `args` for every worker.
    pub fn new<I, S>(program: impl Into<PathBuf>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// Launches the running executable's hidden `worker` subcommand.
    pub fn current_exe(log_level: &str, max_message_len: usize) -> Result<Self, PoolError> {
        let program = std::env::current_exe().map_err(PoolError::CurrentExe)?;
        Ok(Self::new(
            program,
            [
                "--log-level".to_string(),
                log_level.to_string(),
                "worker".to_string(),
                "--max-message-len".to_string(),
                max_message_len.to_string(),
            ],
        ))
    }
}

impl WorkerLauncher for ProcessLauncher {
    fn launch(&self, index: usize) -> Result<LaunchedWorker, PoolError> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| PoolError::Launch { index, source })?;

        let identity = child
            .id()
            .map(|pid| pid.to_string())
            .unwrap_or_else(|| format!("child-{}", index));

        let stdin = child.stdin.take().ok_or_else(|| PoolError::MissingPipe {
            identity: identity.clone(),
            pipe: "stdin",
        })?;
        let stdout = child.stdout.take().ok_or_else(|| PoolError::MissingPipe {
            identity: identity.clone(),
            pipe: "stdout",
        })?;

        Ok(LaunchedWorker {
            identity,
            writer: Box::new(stdin),
            reader: Box::new(stdout),
            process: WorkerProcess::Child(child),
        })
    }
}

/// Launches workers as tokio tasks sharing one [`Decryptor`].
#[derive(Clone)]
pub struct TaskLauncher {
    decryptor: Arc<dyn Decryptor>,
    max_message_len: usize,
}

impl TaskLauncher {
    pub fn new(decryptor: Arc<dyn Decryptor>) -> Self {
        Self {
            decryptor,
            max_message_len: MAX_MESSAGE_LEN,
        }
    }

    pub fn with_max_message_len(mut self, max_len: usize) -> Self {
        self.max_message_len = max_len;
        self
    }
}

impl WorkerLauncher for TaskLauncher {
    fn launch(&self, index: usize) -> Result<LaunchedWorker, PoolError> {
        let identity = format!("task-{}", index);

        // Two one-way pipes, so dropping either end closes exactly one direction.
        let (to_worker, worker_records) = tokio::io::duplex(TASK_PIPE_CAPACITY);
        let (worker_results, from_worker) = tokio::io::duplex(TASK_PIPE_CAPACITY);

        let worker = Worker::new(identity.clone(), Arc::clone(&self.decryptor))
            .with_max_message_len(self.max_message_len);
        let handle = tokio::spawn(async move {
            worker
                .run(BufReader::new(worker_records), worker_results)
                .await
        });

        Ok(LaunchedWorker {
            identity,
            writer: Box::new(to_worker),
            reader: Box::new(from_worker),
            process: WorkerProcess::Task(handle),
        })
    }
}

/// Dispatcher-side record of one worker.
pub struct WorkerHandle {
    identity: String,
    writer: Option<Box<dyn AsyncWrite + Unpin + Send>>,
    process: Option<WorkerProcess>,
    reader_task: JoinHandle<()>,
    ready: bool,
    terminated: bool,
}

impl WorkerHandle {
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Whether the worker reported since its last assignment.
    pub fn is_ready(&self) -> bool {
        self.ready
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    fn can_take_job(&self) -> bool {
        self.ready && !self.terminated && self.writer.is_some()
    }
}

/// Fixed-order pool of workers with FCFS selection.
pub struct WorkerPool {
    handles: Vec<WorkerHandle>,
    inbound: mpsc::Receiver<Inbound>,
    requested: usize,
}

impl WorkerPool {
    /// Launches up to `size` workers.
    ///
    /// A worker that fails to launch is logged and left out; the pool
    /// continues with the subset that started, which may be empty.
    pub fn spawn(launcher: &dyn WorkerLauncher, size: usize, max_message_len: usize) -> Self {
        let (tx, inbound) = mpsc::channel(INBOUND_CAPACITY);
        let mut handles = Vec::with_capacity(size);

        for index in 0..size {
            let launched = match launcher.launch(index) {
                Ok(launched) => launched,
                Err(e) => {
                    warn!(index, error = %e, "Unable to launch worker");
                    continue;
                }
            };

            let peer = handles.len();
            let reader_task = spawn_frame_reader(
                BufReader::new(launched.reader),
                peer,
                max_message_len,
                tx.clone(),
            );

            debug!(worker = %launched.identity, position = peer, "Worker launched");
            handles.push(WorkerHandle {
                identity: launched.identity,
                writer: Some(launched.writer),
                process: Some(launched.process),
                reader_task,
                ready: false,
                terminated: false,
            });
        }

        if handles.len() < size {
            warn!(
                requested = size,
                spawned = handles.len(),
                "Only {} of {} workers started",
                handles.len(),
                size
            );
        } else {
            info!(workers = size, "Worker pool started");
        }

        Self {
            handles,
            inbound,
            requested: size,
        }
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Number of workers requested at startup.
    pub fn requested(&self) -> usize {
        self.requested
    }

    pub fn get(&self, index: usize) -> Option<&WorkerHandle> {
        self.handles.get(index)
    }

    /// Workers whose channel has not closed.
    pub fn live_count(&self) -> usize {
        self.handles.iter().filter(|h| !h.terminated).count()
    }

    /// First ready, live worker in pool order.
    pub fn first_ready(&self) -> Option<usize> {
        self.handles.iter().position(WorkerHandle::can_take_job)
    }

    /// Hands `job` to the worker at `index`, which must be ready.
    ///
    /// The worker stops being ready before the record is written. A failed
    /// write marks the worker terminated.
    pub async fn assign(&mut self, index: usize, job: &Job) -> Result<(), PoolError> {
        let handle = self
            .handles
            .get_mut(index)
            .filter(|h| h.can_take_job())
            .ok_or(PoolError::NotReady(index))?;
        handle.ready = false;

        let writer = handle.writer.as_mut().ok_or(PoolError::NotReady(index))?;
        let record = job.to_record();
        let sent = async {
            writer.write_all(record.as_bytes()).await?;
            writer.flush().await
        }
        .await;

        if let Err(source) = sent {
            handle.terminated = true;
            handle.writer = None;
            return Err(PoolError::Channel {
                identity: handle.identity.clone(),
                source,
            });
        }

        debug!(worker = %handle.identity, job = %job, "Job assigned");
        Ok(())
    }

    /// Waits up to `wait` for worker frames and returns everything pending.
    pub async fn poll_batch(&mut self, wait: Duration) -> Vec<Inbound> {
        protocol::poll_batch(&mut self.inbound, wait).await
    }

    /// Waits for the next worker frame with no time limit.
    ///
    /// Returns `None` once every reader task has finished.
    pub async fn recv(&mut self) -> Option<Inbound> {
        self.inbound.recv().await
    }

    /// Records that the worker at `index` reported and can take a job.
    pub fn mark_ready(&mut self, index: usize) {
        if let Some(handle) = self.handles.get_mut(index) {
            if !handle.terminated {
                handle.ready = true;
            }
        }
    }

    /// Records that the worker at `index` closed its channel.
    pub fn mark_terminated(&mut self, index: usize) {
        if let Some(handle) = self.handles.get_mut(index) {
            handle.terminated = true;
            handle.ready = false;
        }
    }

    /// Closes every worker's inbound channel, asking them to exit.
    pub fn close_inputs(&mut self) {
        for handle in &mut self.handles {
            handle.writer = None;
        }
    }

    /// Waits for every worker to terminate and returns their exits in pool
    /// order. Inbound channels are closed first.
    pub async fn wait_all(&mut self) -> Vec<(String, WorkerExit)> {
        self.close_inputs();

        let mut exits = Vec::with_capacity(self.handles.len());
        for handle in &mut self.handles {
            if let Some(process) = handle.process.take() {
                exits.push((handle.identity.clone(), process.wait().await));
            }
        }
        exits
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        for handle in &self.handles {
            handle.reader_task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decrypt::{DecryptError, TweetCipher};
    use crate::protocol::{Decoded, Status};
    use tempfile::TempDir;

    struct Echo;

    impl Decryptor for Echo {
        fn decrypt(&self, ciphertext: &str) -> Result<String, DecryptError> {
            Ok(ciphertext.to_string())
        }
    }

    /// Fails every launch at the given positions.
    struct Flaky {
        inner: TaskLauncher,
        failing: Vec<usize>,
    }

    impl WorkerLauncher for Flaky {
        fn launch(&self, index: usize) -> Result<LaunchedWorker, PoolError> {
            if self.failing.contains(&index) {
                return Err(PoolError::Launch {
                    index,
                    source: std::io::Error::new(std::io::ErrorKind::Other, "no pipes left"),
                });
            }
            self.inner.launch(index)
        }
    }

    async fn wait_until_ready(pool: &mut WorkerPool, count: usize) {
        let mut seen = 0;
        while seen < count {
            for inbound in pool.poll_batch(Duration::from_millis(10)).await {
                match inbound.frame {
                    Decoded::Message(msg) => {
                        assert_eq!(msg.status(), Status::Ready);
                        pool.mark_ready(inbound.peer);
                        seen += 1;
                    }
                    other => panic!("unexpected frame {:?}", other),
                }
            }
        }
    }

    #[test]
    fn test_default_pool_size_is_positive() {
        assert!(default_pool_size() >= 1);
    }

    #[tokio::test]
    async fn test_workers_start_not_ready() {
        let launcher = TaskLauncher::new(Arc::new(Echo));
        let mut pool = WorkerPool::spawn(&launcher, 2, MAX_MESSAGE_LEN);

        assert_eq!(pool.len(), 2);
        assert_eq!(pool.first_ready(), None);
        assert_eq!(pool.get(1).unwrap().identity(), "task-1");

        wait_until_ready(&mut pool, 2).await;
        assert_eq!(pool.first_ready(), Some(0));
        assert!(pool.get(1).unwrap().is_ready());

        let exits = pool.wait_all().await;
        assert_eq!(exits.len(), 2);
        assert!(exits.iter().all(|(_, exit)| exit.is_success()));
    }

    #[tokio::test]
    async fn test_assign_is_first_come_first_served() {
        let dir = TempDir::new().unwrap();
        let input = dir.path().join("in.txt");
        std::fs::write(&input, "txdgaclx?xkbq\n").unwrap();
        let output = dir.path().join("out.txt");
        let job = Job::new(input.display().to_string(), output.display().to_string());

        let launcher = TaskLauncher::new(Arc::new(TweetCipher::new()));
        let mut pool = WorkerPool::spawn(&launcher, 2, MAX_MESSAGE_LEN);
        wait_until_ready(&mut pool, 2).await;

        pool.assign(0, &job).await.unwrap();
        assert!(!pool.get(0).unwrap().is_ready());
        assert_eq!(pool.first_ready(), Some(1));
        assert!(matches!(pool.assign(0, &job).await, Err(PoolError::NotReady(0))));

        let reply = loop {
            let batch = pool.poll_batch(Duration::from_millis(10)).await;
            if let Some(inbound) = batch.into_iter().next() {
                break inbound;
            }
        };
        assert_eq!(reply.peer, 0);
        match reply.frame {
            Decoded::Message(msg) => assert_eq!(msg.status(), Status::Success),
            other => panic!("unexpected frame {:?}", other),
        }
        pool.mark_ready(0);
        assert_eq!(pool.first_ready(), Some(0));
        assert_eq!(std::fs::read_to_string(&output).unwrap(), "hello world!\n");

        pool.wait_all().await;
    }

    #[tokio::test]
    async fn test_partial_launch_continues() {
        let launcher = Flaky {
            inner: TaskLauncher::new(Arc::new(Echo)),
            failing: vec![1],
        };
        let mut pool = WorkerPool::spawn(&launcher, 3, MAX_MESSAGE_LEN);

        assert_eq!(pool.requested(), 3);
        assert_eq!(pool.len(), 2);
        assert_eq!(pool.get(1).unwrap().identity(), "task-2");
        pool.wait_all().await;
    }

    #[tokio::test]
    async fn test_close_inputs_ends_workers() {
        let launcher = TaskLauncher::new(Arc::new(Echo));
        let mut pool = WorkerPool::spawn(&launcher, 1, MAX_MESSAGE_LEN);
        wait_until_ready(&mut pool, 1).await;

        pool.close_inputs();
        let inbound = pool.recv().await.unwrap();
        assert!(matches!(inbound.frame, Decoded::Closed));
        pool.mark_terminated(inbound.peer);
        assert_eq!(pool.live_count(), 0);
        assert_eq!(pool.first_ready(), None);

        let exits = pool.wait_all().await;
        assert_eq!(exits[0].1, WorkerExit::Success);
    }

    #[tokio::test]
    async fn test_child_process_exit_status() {
        let ok = ProcessLauncher::new("sh", ["-c", "exit 0"]).launch(0).unwrap();
        assert_eq!(ok.process.wait().await, WorkerExit::Success);

        let failed = ProcessLauncher::new("sh", ["-c", "exit 3"]).launch(0).unwrap();
        assert_eq!(failed.process.wait().await, WorkerExit::Failure(Some(3)));
    }

    #[tokio::test]
    async fn test_missing_program_fails_launch() {
        let result = ProcessLauncher::new("/no/such/lyrebird-worker", Vec::<String>::new()).launch(4);
        assert!(matches!(result, Err(PoolError::Launch { index: 4, .. })));
    }
}
