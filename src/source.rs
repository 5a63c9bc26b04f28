//! Job source tier.
//!
//! The job source owns the job stream and every dispatcher connection. Each
//! iteration of its loop it:
//!
//! 1. admits at most one pending connection (refusing it beyond the limit),
//! 2. buffers the next well-formed job if none is buffered,
//! 3. stops once the stream is exhausted and nothing is buffered,
//! 4. drains every pending dispatcher message, granting one credit each,
//! 5. hands the buffered job to the first connection with credit.
//!
//! Any dispatcher disconnect during the loop stops job production: the source
//! goes straight to shutdown instead of carrying on with the remaining
//! connections. Shutdown sends EXIT to every live dispatcher and waits for
//! each to acknowledge or close.

use std::fmt;
use std::net::SocketAddr;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncWrite, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::ServerConfig;
use crate::error::SourceError;
use crate::net::discover_bind_address;
use crate::protocol::{
    poll_batch, spawn_frame_reader, write_message, Decoded, Inbound, Message, Status,
    INBOUND_CAPACITY,
};
use crate::scheduler::job::Job;
use crate::scheduler::queue::JobStream;

/// Pending connections handed over by the accept task.
const ACCEPT_BACKLOG: usize = 16;

/// Job-source side record of one dispatcher.
pub struct ClientConnection {
    id: usize,
    addr: SocketAddr,
    writer: Option<Box<dyn AsyncWrite + Unpin + Send>>,
    reader_task: Option<JoinHandle<()>>,
    ready_credit: usize,
    terminated: bool,
    last_status: Option<Status>,
}

impl ClientConnection {
    pub fn new(id: usize, addr: SocketAddr, writer: Box<dyn AsyncWrite + Unpin + Send>) -> Self {
        Self {
            id,
            addr,
            writer: Some(writer),
            reader_task: None,
            ready_credit: 0,
            terminated: false,
            last_status: None,
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Jobs this dispatcher may currently accept.
    pub fn ready_credit(&self) -> usize {
        self.ready_credit
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    /// Status of the last message received from this dispatcher.
    pub fn last_status(&self) -> Option<Status> {
        self.last_status
    }

    /// Whether the last message received was an EXIT.
    fn has_exited(&self) -> bool {
        self.last_status == Some(Status::Exit)
    }

    async fn send(&mut self, message: &Message) -> std::io::Result<()> {
        match self.writer.as_mut() {
            Some(writer) => write_message(writer, message).await,
            None => Err(std::io::ErrorKind::NotConnected.into()),
        }
    }

    fn terminate(&mut self) {
        self.terminated = true;
        self.ready_credit = 0;
        self.writer = None;
    }
}

impl fmt::Debug for ClientConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConnection")
            .field("id", &self.id)
            .field("addr", &self.addr)
            .field("ready_credit", &self.ready_credit)
            .field("terminated", &self.terminated)
            .field("last_status", &self.last_status)
            .finish()
    }
}

impl Drop for ClientConnection {
    fn drop(&mut self) {
        if let Some(task) = self.reader_task.take() {
            task.abort();
        }
    }
}

/// Connections of one job source, in registration order.
///
/// Ids are registry positions and are never reused, so a terminated
/// connection is never resurrected.
#[derive(Debug)]
pub struct ClientRegistry {
    clients: Vec<ClientConnection>,
    max_clients: usize,
}

impl ClientRegistry {
    pub fn new(max_clients: usize) -> Self {
        Self {
            clients: Vec::new(),
            max_clients,
        }
    }

    /// Adds a connection and returns its id.
    pub fn register(
        &mut self,
        addr: SocketAddr,
        writer: Box<dyn AsyncWrite + Unpin + Send>,
    ) -> usize {
        let id = self.clients.len();
        self.clients.push(ClientConnection::new(id, addr, writer));
        id
    }

    /// Whether another live connection would exceed the limit.
    pub fn is_full(&self) -> bool {
        self.live_count() >= self.max_clients
    }

    pub fn live_count(&self) -> usize {
        self.clients.iter().filter(|c| !c.terminated).count()
    }

    pub fn get(&self, id: usize) -> Option<&ClientConnection> {
        self.clients.get(id)
    }

    fn get_mut(&mut self, id: usize) -> Option<&mut ClientConnection> {
        self.clients.get_mut(id)
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// Grants one unit of credit to a live connection.
    pub fn grant_credit(&mut self, id: usize) {
        if let Some(client) = self.get_mut(id).filter(|c| !c.terminated) {
            client.ready_credit += 1;
        }
    }

    /// Spends one unit of credit. Returns false if the connection had none.
    pub fn take_credit(&mut self, id: usize) -> bool {
        match self.get_mut(id) {
            Some(client) if !client.terminated && client.ready_credit > 0 => {
                client.ready_credit -= 1;
                true
            }
            _ => false,
        }
    }

    /// First live connection, in registration order, with credit.
    pub fn first_with_credit(&self) -> Option<usize> {
        self.clients
            .iter()
            .position(|c| !c.terminated && c.ready_credit > 0)
    }

    /// Marks a connection terminated and closes our side of it.
    pub fn terminate(&mut self, id: usize) {
        if let Some(client) = self.get_mut(id) {
            client.terminate();
        }
    }

    fn live_ids(&self) -> Vec<usize> {
        self.clients
            .iter()
            .filter(|c| !c.terminated)
            .map(|c| c.id)
            .collect()
    }
}

/// Why the main loop ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// Every record was read and dispatched.
    Exhausted,
    /// A dispatcher closed or broke its connection.
    ClientDisconnected,
    /// The listening endpoint failed.
    AcceptFailed(String),
    /// The job stream could not be read.
    JobStreamFailed(String),
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::Exhausted => write!(f, "job stream exhausted"),
            StopReason::ClientDisconnected => write!(f, "client disconnected"),
            StopReason::AcceptFailed(e) => write!(f, "accept failed: {}", e),
            StopReason::JobStreamFailed(e) => write!(f, "job stream failed: {}", e),
        }
    }
}

/// Summary of one job-source run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServeReport {
    pub connections: usize,
    pub refused: usize,
    pub dispatched: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped_records: usize,
    pub orderly_disconnects: usize,
    pub unexpected_disconnects: usize,
    pub stop_reason: StopReason,
}

impl ServeReport {
    fn new() -> Self {
        Self {
            connections: 0,
            refused: 0,
            dispatched: 0,
            succeeded: 0,
            failed: 0,
            skipped_records: 0,
            orderly_disconnects: 0,
            unexpected_disconnects: 0,
            stop_reason: StopReason::Exhausted,
        }
    }

    /// Whether the whole job stream was handed out.
    pub fn is_complete(&self) -> bool {
        self.stop_reason == StopReason::Exhausted
    }

    /// False only after a transport or job-stream failure.
    pub fn is_success(&self) -> bool {
        matches!(
            self.stop_reason,
            StopReason::Exhausted | StopReason::ClientDisconnected
        )
    }
}

/// The job source: a listening endpoint plus the job stream it serves.
pub struct JobSource {
    listener: TcpListener,
    config: ServerConfig,
    jobs: JobStream,
}

impl JobSource {
    /// Binds the listening endpoint.
    ///
    /// Without an explicit bind address a non-loopback address of this host
    /// is used.
    pub async fn bind(config: ServerConfig, jobs: JobStream) -> Result<Self, SourceError> {
        let ip = config.bind_addr.unwrap_or_else(discover_bind_address);
        let addr = SocketAddr::new(ip, config.port);
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| SourceError::Bind { addr, source })?;
        let jobs = jobs.with_max_message_len(config.max_message_len);

        Ok(Self {
            listener,
            config,
            jobs,
        })
    }

    /// Address the endpoint is listening on.
    pub fn local_addr(&self) -> Result<SocketAddr, SourceError> {
        Ok(self.listener.local_addr()?)
    }

    /// Serves the job stream until it is exhausted or a dispatcher is lost,
    /// then shuts every connection down.
    pub async fn run(self) -> ServeReport {
        let JobSource {
            listener,
            config,
            mut jobs,
        } = self;

        let (conn_tx, mut pending) = mpsc::channel(ACCEPT_BACKLOG);
        let accept_task = tokio::spawn(async move {
            loop {
                let accepted = listener.accept().await;
                let failed = accepted.is_err();
                if conn_tx.send(accepted).await.is_err() || failed {
                    break;
                }
            }
        });

        let (inbound_tx, inbound) = mpsc::channel(INBOUND_CAPACITY);
        let registry = ClientRegistry::new(config.max_clients);
        let mut state = ServeState {
            config,
            registry,
            inbound_tx: Some(inbound_tx),
            inbound,
            report: ServeReport::new(),
        };

        let mut buffered: Option<Job> = None;

        let stop = loop {
            match pending.try_recv() {
                Ok(Ok((stream, addr))) => state.admit(stream, addr),
                Ok(Err(e)) => {
                    error!(error = %e, "Unable to accept connection");
                    break StopReason::AcceptFailed(e.to_string());
                }
                Err(TryRecvError::Empty) => {}
                Err(TryRecvError::Disconnected) => {
                    error!("Listening endpoint closed");
                    break StopReason::AcceptFailed("listener closed".to_string());
                }
            }

            if buffered.is_none() {
                match jobs.next_job().await {
                    Ok(job) => buffered = job,
                    Err(e) => {
                        error!(error = %e, "Unable to read job stream");
                        break StopReason::JobStreamFailed(e.to_string());
                    }
                }
            }

            if buffered.is_none() && jobs.is_exhausted() {
                info!(source = %jobs.name(), "All jobs dispatched");
                break StopReason::Exhausted;
            }

            if state.update_clients().await.is_err() {
                break StopReason::ClientDisconnected;
            }

            if let Some(job) = buffered.take() {
                match state.dispatch(job).await {
                    Ok(None) => {}
                    Ok(Some(job)) => buffered = Some(job),
                    Err(ClientLost) => break StopReason::ClientDisconnected,
                }
            }
        };

        state.report.skipped_records += jobs.skipped();
        state.report.stop_reason = stop;
        state.shutdown().await;

        // Connections still pending are dropped with the listener.
        accept_task.abort();
        drop(pending);

        info!(
            dispatched = state.report.dispatched,
            succeeded = state.report.succeeded,
            failed = state.report.failed,
            reason = %state.report.stop_reason,
            "Job source finished"
        );
        state.report
    }
}

/// A dispatcher that was lost during the main loop.
struct ClientLost;

/// Mutable state of a running job source.
struct ServeState {
    config: ServerConfig,
    registry: ClientRegistry,
    inbound_tx: Option<mpsc::Sender<Inbound>>,
    inbound: mpsc::Receiver<Inbound>,
    report: ServeReport,
}

impl ServeState {
    fn admit(&mut self, stream: TcpStream, addr: SocketAddr) {
        let tx = match (&self.inbound_tx, self.registry.is_full()) {
            (Some(tx), false) => tx.clone(),
            _ => {
                warn!(
                    client = %addr.ip(),
                    max_clients = self.config.max_clients,
                    "Refused connection from {}: client limit reached",
                    addr.ip()
                );
                self.report.refused += 1;
                return;
            }
        };

        let (read_half, write_half) = stream.into_split();
        let id = self.registry.register(addr, Box::new(write_half));
        let task = spawn_frame_reader(
            BufReader::new(read_half),
            id,
            self.config.max_message_len,
            tx,
        );
        if let Some(client) = self.registry.get_mut(id) {
            client.reader_task = Some(task);
        }

        self.report.connections += 1;
        info!(client = %addr.ip(), "Successfully connected to lyrebird client {}", addr.ip());
    }

    /// Drains every pending dispatcher message.
    ///
    /// The whole batch is handled before a disconnect is reported.
    async fn update_clients(&mut self) -> Result<(), ClientLost> {
        loop {
            let batch = poll_batch(&mut self.inbound, self.config.poll_interval).await;
            if batch.is_empty() {
                return Ok(());
            }

            let mut lost = false;
            for Inbound { peer, frame } in batch {
                match frame {
                    Decoded::Message(message) => {
                        self.record_message(peer, &message);
                        self.registry.grant_credit(peer);
                    }
                    Decoded::Closed | Decoded::Broken(_) => {
                        if self.lose_client(peer, &frame) {
                            lost = true;
                        }
                    }
                }
            }

            if lost {
                return Err(ClientLost);
            }
        }
    }

    /// Hands `job` to the first connection with credit. Returns the job if
    /// no connection has credit.
    async fn dispatch(&mut self, job: Job) -> Result<Option<Job>, ClientLost> {
        let Some(id) = self.registry.first_with_credit() else {
            return Ok(Some(job));
        };

        let message = match job.to_message(self.config.max_message_len) {
            Ok(message) => message,
            Err(e) => {
                warn!(job = %job, error = %e, "Job does not fit in one message, skipping");
                self.report.skipped_records += 1;
                return Ok(None);
            }
        };

        if !self.registry.take_credit(id) {
            return Ok(Some(job));
        }
        let Some(client) = self.registry.get_mut(id) else {
            return Ok(Some(job));
        };
        let ip = client.addr.ip();

        if let Err(e) = client.send(&message).await {
            error!(client = %ip, error = %e, "Client {} disconnected unexpectedly", ip);
            client.terminate();
            self.report.unexpected_disconnects += 1;
            return Err(ClientLost);
        }

        self.report.dispatched += 1;
        info!(
            client = %ip,
            input = %job.input,
            "Client {} has been given the task of decrypting {}",
            ip,
            job.input
        );
        Ok(None)
    }

    fn record_message(&mut self, peer: usize, message: &Message) {
        let Some(client) = self.registry.get_mut(peer) else {
            return;
        };
        client.last_status = Some(message.status());
        let ip = client.addr.ip();

        match message.status() {
            Status::Success => {
                self.report.succeeded += 1;
                info!(client = %ip, "Client {} has successfully decrypted {}", ip, message.payload());
            }
            Status::Error => {
                self.report.failed += 1;
                warn!(client = %ip, "Client {} has encountered an error: {}", ip, message.payload());
            }
            Status::Exit => info!(client = %ip, "Client {} has exited", ip),
            status => debug!(client = %ip, status = %status, "Client message"),
        }
    }

    /// Records that a dispatcher's stream ended. Returns whether it was live.
    ///
    /// A clean close after the dispatcher's own EXIT counts as orderly.
    fn lose_client(&mut self, peer: usize, frame: &Decoded) -> bool {
        let Some(client) = self.registry.get_mut(peer) else {
            return false;
        };
        if client.terminated {
            return false;
        }
        if matches!(frame, Decoded::Closed) && client.has_exited() {
            self.finish_client(peer);
            return true;
        }
        client.terminate();
        let ip = client.addr.ip();

        if let Decoded::Broken(e) = frame {
            error!(client = %ip, error = %e, "Client {} disconnected unexpectedly", ip);
        } else {
            error!(client = %ip, "Client {} disconnected unexpectedly", ip);
        }
        self.report.unexpected_disconnects += 1;
        true
    }

    /// Sends EXIT to every live dispatcher and waits for each one to
    /// acknowledge or close.
    async fn shutdown(&mut self) {
        // Only reader tasks keep the channel open from here on.
        self.inbound_tx = None;

        let exit = Message::bare(Status::Exit);
        for id in self.registry.live_ids() {
            let Some(client) = self.registry.get_mut(id) else {
                continue;
            };
            if let Err(e) = client.send(&exit).await {
                let ip = client.addr.ip();
                error!(client = %ip, error = %e, "Client {} disconnected unexpectedly", ip);
                client.terminate();
                self.report.unexpected_disconnects += 1;
            }
        }

        while self.registry.live_count() > 0 {
            let Some(Inbound { peer, frame }) = self.inbound.recv().await else {
                break;
            };

            match frame {
                Decoded::Message(message) => {
                    self.record_message(peer, &message);
                    if message.status() == Status::Exit {
                        self.finish_client(peer);
                    }
                }
                Decoded::Closed | Decoded::Broken(_) => {
                    self.lose_client(peer, &frame);
                }
            }
        }
    }

    fn finish_client(&mut self, peer: usize) {
        let Some(client) = self.registry.get_mut(peer).filter(|c| !c.terminated) else {
            return;
        };
        client.terminate();
        info!(client = %client.addr.ip(), "Client {} disconnected", client.addr.ip());
        self.report.orderly_disconnects += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn addr(last: u8) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, last)), 4000)
    }

    fn registry_with(count: u8, max_clients: usize) -> ClientRegistry {
        let mut registry = ClientRegistry::new(max_clients);
        for i in 0..count {
            registry.register(addr(i), Box::new(tokio::io::sink()));
        }
        registry
    }

    #[test]
    fn test_credit_starts_at_zero() {
        let registry = registry_with(2, 8);
        assert_eq!(registry.get(0).unwrap().ready_credit(), 0);
        assert_eq!(registry.first_with_credit(), None);
    }

    #[test]
    fn test_first_with_credit_uses_registration_order() {
        let mut registry = registry_with(3, 8);
        registry.grant_credit(2);
        registry.grant_credit(1);
        assert_eq!(registry.first_with_credit(), Some(1));

        assert!(registry.take_credit(1));
        assert_eq!(registry.first_with_credit(), Some(2));
        assert!(!registry.take_credit(1));
    }

    #[test]
    fn test_credit_accumulates_per_message() {
        let mut registry = registry_with(1, 8);
        registry.grant_credit(0);
        registry.grant_credit(0);
        assert_eq!(registry.get(0).unwrap().ready_credit(), 2);
        assert!(registry.take_credit(0));
        assert!(registry.take_credit(0));
        assert!(!registry.take_credit(0));
    }

    #[test]
    fn test_terminated_never_resurrected() {
        let mut registry = registry_with(2, 8);
        registry.grant_credit(0);
        registry.terminate(0);

        registry.grant_credit(0);
        assert_eq!(registry.get(0).unwrap().ready_credit(), 0);
        assert!(registry.get(0).unwrap().is_terminated());
        assert_eq!(registry.first_with_credit(), None);
        assert_eq!(registry.live_count(), 1);

        let id = registry.register(addr(9), Box::new(tokio::io::sink()));
        assert_eq!(id, 2);
    }

    #[test]
    fn test_is_full_counts_live_connections() {
        let mut registry = registry_with(2, 2);
        assert!(registry.is_full());
        registry.terminate(1);
        assert!(!registry.is_full());
    }

    fn serve_state(clients: u8) -> ServeState {
        let (inbound_tx, inbound) = mpsc::channel(INBOUND_CAPACITY);
        ServeState {
            config: ServerConfig::new(),
            registry: registry_with(clients, 8),
            inbound_tx: Some(inbound_tx),
            inbound,
            report: ServeReport::new(),
        }
    }

    #[test]
    fn test_close_after_exit_is_orderly() {
        let mut state = serve_state(2);
        state.record_message(0, &Message::bare(Status::Exit));
        state.record_message(1, &Message::bare(Status::Ready));
        assert_eq!(state.registry.get(0).unwrap().last_status(), Some(Status::Exit));

        assert!(state.lose_client(0, &Decoded::Closed));
        assert!(state.lose_client(1, &Decoded::Closed));
        assert!(!state.lose_client(0, &Decoded::Closed));

        assert_eq!(state.report.orderly_disconnects, 1);
        assert_eq!(state.report.unexpected_disconnects, 1);
        assert_eq!(state.registry.live_count(), 0);
    }

    #[test]
    fn test_broken_after_exit_is_unexpected() {
        let mut state = serve_state(1);
        state.record_message(0, &Message::bare(Status::Exit));

        let broken = Decoded::Broken(crate::error::ProtocolError::Truncated {
            status: Status::Success,
        });
        assert!(state.lose_client(0, &broken));
        assert_eq!(state.report.orderly_disconnects, 0);
        assert_eq!(state.report.unexpected_disconnects, 1);
    }

    #[test]
    fn test_report_status() {
        let mut report = ServeReport::new();
        assert!(report.is_complete());
        assert!(report.is_success());

        report.stop_reason = StopReason::ClientDisconnected;
        assert!(!report.is_complete());
        assert!(report.is_success());

        report.stop_reason = StopReason::AcceptFailed("boom".to_string());
        assert!(!report.is_success());
    }

    #[test]
    fn test_report_serialization() {
        let json = serde_json::to_value(ServeReport::new()).unwrap();
        assert_eq!(json["stop_reason"], "exhausted");
        assert_eq!(json["dispatched"], 0);
    }
}
