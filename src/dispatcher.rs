//! Dispatcher tier.
//!
//! A dispatcher is one participant of the job source. It owns a private
//! worker pool and schedules jobs on it first-come-first-served: a LINE from
//! the job source is not acknowledged until some worker has taken it, and
//! every worker message is forwarded upstream unchanged, which is what grants
//! the job source its next credit.
//!
//! A worker closing its channel, an EXIT from the job source or a lost
//! upstream connection all end the main loop. Shutdown closes every worker's
//! inbound channel, drains their results, waits for them to terminate and
//! reports any that did not exit successfully.

use std::fmt;
use std::net::{IpAddr, SocketAddr};

use serde::{Deserialize, Serialize};
use tokio::io::BufReader;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::ClientConfig;
use crate::error::DispatchError;
use crate::protocol::{
    spawn_frame_reader, write_message, Decoded, Inbound, Message, Status, INBOUND_CAPACITY,
};
use crate::scheduler::job::Job;
use crate::scheduler::worker_pool::{WorkerLauncher, WorkerPool};

/// Validates a job-source endpoint given as textual address and port.
pub fn parse_endpoint(address: &str, port: &str) -> Result<SocketAddr, DispatchError> {
    let ip: IpAddr = address
        .trim()
        .parse()
        .map_err(|_| DispatchError::InvalidAddress(address.to_string()))?;
    let port = port
        .trim()
        .parse::<u16>()
        .ok()
        .filter(|p| *p != 0)
        .ok_or_else(|| DispatchError::InvalidPort(port.to_string()))?;

    Ok(SocketAddr::new(ip, port))
}

/// Why the main loop ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Halt {
    /// The job source asked for an orderly exit.
    Exit,
    /// The connection to the job source closed, broke, or refused a write.
    UpstreamLost,
    /// A worker closed its channel.
    WorkerLost(String),
}

impl fmt::Display for Halt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Halt::Exit => write!(f, "exit requested"),
            Halt::UpstreamLost => write!(f, "server connection lost"),
            Halt::WorkerLost(worker) => write!(f, "worker {} lost", worker),
        }
    }
}

/// Summary of one dispatcher run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchReport {
    pub server: SocketAddr,
    pub workers_requested: usize,
    pub workers_spawned: usize,
    pub jobs_assigned: usize,
    pub messages_forwarded: usize,
    pub upstream_failed: bool,
    pub halt: Halt,
    /// Workers that did not terminate with a success status.
    pub failed_workers: Vec<String>,
}

impl DispatchReport {
    /// False after an upstream failure or a worker failure in the pool.
    pub fn is_success(&self) -> bool {
        !self.upstream_failed && self.failed_workers.is_empty()
    }
}

/// A connected dispatcher and its worker pool.
pub struct Dispatcher {
    config: ClientConfig,
    upstream: Option<OwnedWriteHalf>,
    inbound: mpsc::Receiver<Inbound>,
    reader_task: JoinHandle<()>,
    pool: WorkerPool,
    report: DispatchReport,
}

impl Dispatcher {
    /// Connects to the job source and launches the worker pool.
    ///
    /// Workers that fail to launch are left out; only an empty pool is an
    /// error.
    pub async fn connect(
        server: SocketAddr,
        config: ClientConfig,
        launcher: &dyn WorkerLauncher,
    ) -> Result<Self, DispatchError> {
        let stream = TcpStream::connect(server)
            .await
            .map_err(|source| DispatchError::Connect {
                addr: server,
                source,
            })?;
        info!(
            pid = std::process::id(),
            server = %server.ip(),
            port = server.port(),
            "Lyrebird client {} connected to server {} on port {}",
            std::process::id(),
            server.ip(),
            server.port()
        );

        let requested = config.pool_size();
        let pool = WorkerPool::spawn(launcher, requested, config.max_message_len);
        if pool.is_empty() {
            return Err(DispatchError::NoWorkers { requested });
        }

        let (read_half, write_half) = stream.into_split();
        let (tx, inbound) = mpsc::channel(INBOUND_CAPACITY);
        let reader_task = spawn_frame_reader(
            BufReader::new(read_half),
            0,
            config.max_message_len,
            tx,
        );

        let report = DispatchReport {
            server,
            workers_requested: requested,
            workers_spawned: pool.len(),
            jobs_assigned: 0,
            messages_forwarded: 0,
            upstream_failed: false,
            halt: Halt::Exit,
            failed_workers: Vec::new(),
        };

        Ok(Self {
            config,
            upstream: Some(write_half),
            inbound,
            reader_task,
            pool,
            report,
        })
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    /// Schedules jobs until told to exit or a peer is lost, then shuts the
    /// pool down.
    pub async fn run(mut self) -> DispatchReport {
        let halt = loop {
            match tokio::time::timeout(self.config.poll_interval, self.inbound.recv()).await {
                Ok(Some(Inbound {
                    frame: Decoded::Message(message),
                    ..
                })) => {
                    if let Err(halt) = self.handle_server_message(message).await {
                        break halt;
                    }
                }
                Ok(Some(Inbound { frame, .. })) => {
                    if let Decoded::Broken(e) = &frame {
                        error!(error = %e, "Server disconnected unexpectedly");
                    } else {
                        error!("Server disconnected unexpectedly");
                    }
                    break Halt::UpstreamLost;
                }
                Ok(None) => {
                    error!("Server disconnected unexpectedly");
                    break Halt::UpstreamLost;
                }
                Err(_) => {}
            }

            if let Err(halt) = self.check_workers().await {
                break halt;
            }
        };

        self.shutdown(halt).await;
        info!(
            jobs = self.report.jobs_assigned,
            reason = %self.report.halt,
            "Lyrebird client {} finished",
            std::process::id()
        );
        self.report
    }

    async fn handle_server_message(&mut self, message: Message) -> Result<(), Halt> {
        match message.status() {
            Status::Exit => {
                info!("Server requested exit");
                Err(Halt::Exit)
            }
            Status::Line => match Job::parse(message.payload()) {
                Some(job) => self.schedule(job).await,
                None => {
                    warn!(record = %message.payload(), "Malformed job record from server");
                    let reply = Message::truncated(
                        Status::Error,
                        &format!("Malformed job record '{}'.", message.payload()),
                        self.config.max_message_len,
                    );
                    self.forward(&reply).await
                }
            },
            status => {
                debug!(status = %status, "Ignoring message from server");
                Ok(())
            }
        }
    }

    /// Hands `job` to the first ready worker, servicing worker messages
    /// until one is ready.
    async fn schedule(&mut self, job: Job) -> Result<(), Halt> {
        loop {
            self.check_workers().await?;

            let Some(index) = self.pool.first_ready() else {
                continue;
            };
            let identity = self
                .pool
                .get(index)
                .map(|w| w.identity().to_string())
                .unwrap_or_default();

            if let Err(e) = self.pool.assign(index, &job).await {
                error!(worker = %identity, error = %e, "Worker {} disconnected unexpectedly", identity);
                return Err(Halt::WorkerLost(identity));
            }

            self.report.jobs_assigned += 1;
            info!(
                worker = %identity,
                input = %job.input,
                "Worker {} has been given the task of decrypting {}",
                identity,
                job.input
            );
            return Ok(());
        }
    }

    /// Drains every pending worker message, forwarding each one upstream.
    ///
    /// The whole batch is handled before a lost worker is reported.
    async fn check_workers(&mut self) -> Result<(), Halt> {
        loop {
            let batch = self.pool.poll_batch(self.config.poll_interval).await;
            if batch.is_empty() {
                return Ok(());
            }

            let mut lost = None;
            for Inbound { peer, frame } in batch {
                match frame {
                    Decoded::Message(message) => {
                        self.pool.mark_ready(peer);
                        self.forward(&message).await?;
                    }
                    Decoded::Closed | Decoded::Broken(_) => {
                        let identity = self.lose_worker(peer, &frame);
                        lost.get_or_insert(identity);
                    }
                }
            }

            if let Some(identity) = lost {
                return Err(Halt::WorkerLost(identity));
            }
        }
    }

    fn lose_worker(&mut self, peer: usize, frame: &Decoded) -> String {
        self.pool.mark_terminated(peer);
        let identity = self
            .pool
            .get(peer)
            .map(|w| w.identity().to_string())
            .unwrap_or_default();

        match frame {
            Decoded::Broken(e) => {
                error!(worker = %identity, error = %e, "Worker {} disconnected unexpectedly", identity)
            }
            _ => error!(worker = %identity, "Worker {} disconnected unexpectedly", identity),
        }
        identity
    }

    async fn forward(&mut self, message: &Message) -> Result<(), Halt> {
        let Some(upstream) = self.upstream.as_mut() else {
            return Err(Halt::UpstreamLost);
        };

        if let Err(e) = write_message(upstream, message).await {
            error!(error = %e, "Unable to forward message to server");
            self.upstream = None;
            return Err(Halt::UpstreamLost);
        }

        self.report.messages_forwarded += 1;
        debug!(status = %message.status(), payload = %message.payload(), "Forwarded");
        Ok(())
    }

    async fn shutdown(&mut self, halt: Halt) {
        if halt == Halt::UpstreamLost {
            self.report.upstream_failed = true;
            self.upstream = None;
        }
        self.report.halt = halt;

        self.pool.close_inputs();
        while self.pool.live_count() > 0 {
            let Some(Inbound { peer, frame }) = self.pool.recv().await else {
                break;
            };
            match frame {
                Decoded::Message(message) => {
                    if self.upstream.is_some() && self.forward(&message).await.is_err() {
                        self.report.upstream_failed = true;
                    }
                }
                Decoded::Closed => self.pool.mark_terminated(peer),
                Decoded::Broken(_) => {
                    self.lose_worker(peer, &frame);
                }
            }
        }

        for (identity, exit) in self.pool.wait_all().await {
            if !exit.is_success() {
                error!(
                    worker = %identity,
                    exit = %exit,
                    "Worker {} did not terminate successfully",
                    identity
                );
                self.report.failed_workers.push(identity);
            }
        }

        if self.upstream.is_some() {
            let exit = Message::bare(Status::Exit);
            if self.forward(&exit).await.is_err() {
                self.report.upstream_failed = true;
            }
        }
        self.upstream = None;
        self.reader_task.abort();
    }
}
