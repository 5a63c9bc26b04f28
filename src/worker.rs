//! Worker tier: executes job records one at a time.
//!
//! A worker announces itself with READY, then reads newline-terminated job
//! records from its inbound channel and answers each one with exactly one
//! SUCCESS or ERROR frame on its outbound channel. It exits cleanly when the
//! inbound channel closes, and with a failure status after reporting a
//! resource-exhaustion error.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs::File;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tracing::{debug, error, warn};

use crate::decrypt::{DecryptError, Decryptor};
use crate::protocol::{write_message, Message, Status, MAX_MESSAGE_LEN};
use crate::scheduler::job::{Job, RecordOutcome};

/// Terminal state of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkerExit {
    /// Inbound channel closed and every record was answered.
    Success,
    /// The worker stopped abnormally. Carries the process exit code when
    /// there is one.
    Failure(Option<i32>),
}

impl WorkerExit {
    pub fn is_success(&self) -> bool {
        matches!(self, WorkerExit::Success)
    }
}

impl fmt::Display for WorkerExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerExit::Success => write!(f, "success"),
            WorkerExit::Failure(Some(code)) => write!(f, "failure (exit code {})", code),
            WorkerExit::Failure(None) => write!(f, "failure"),
        }
    }
}

/// Errors raised while processing one record.
#[derive(Debug, Error)]
pub enum RecordError {
    #[error("Unable to open input {path}: {source}")]
    InputOpen {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Unable to open output {path}: {source}")]
    OutputOpen {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid ciphertext in {path} line {line}: {source}")]
    InvalidCiphertext {
        path: PathBuf,
        line: usize,
        #[source]
        source: DecryptError,
    },

    #[error("Line {line} of {path} is not valid text")]
    NotText { path: PathBuf, line: usize },

    #[error("Unable to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Unable to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Memory allocation failed")]
    ResourceExhausted,
}

impl RecordError {
    /// Maps the error to the outcome reported upstream.
    pub fn outcome(&self) -> RecordOutcome {
        match self {
            RecordError::InputOpen { .. } => RecordOutcome::InputOpenFailed,
            RecordError::OutputOpen { .. } => RecordOutcome::OutputOpenFailed,
            RecordError::InvalidCiphertext { .. } | RecordError::NotText { .. } => {
                RecordOutcome::InvalidCiphertext
            }
            RecordError::Read { .. } | RecordError::Write { .. } => RecordOutcome::IoFailed,
            RecordError::ResourceExhausted => RecordOutcome::ResourceExhausted,
        }
    }
}

/// Executes job records with a [`Decryptor`].
pub struct Worker {
    identity: String,
    decryptor: Arc<dyn Decryptor>,
    max_message_len: usize,
}

impl Worker {
    /// Creates a worker. `identity` names it in result messages.
    pub fn new(identity: impl Into<String>, decryptor: Arc<dyn Decryptor>) -> Self {
        Self {
            identity: identity.into(),
            decryptor,
            max_message_len: MAX_MESSAGE_LEN,
        }
    }

    /// Sets the frame limit for result messages.
    pub fn with_max_message_len(mut self, max_len: usize) -> Self {
        self.max_message_len = max_len;
        self
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Serves records until the inbound channel closes or a fatal error.
    pub async fn run<R, W>(&self, mut records: R, mut results: W) -> WorkerExit
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        if let Err(e) = write_message(&mut results, &Message::bare(Status::Ready)).await {
            error!(worker = %self.identity, error = %e, "Unable to report readiness");
            return WorkerExit::Failure(None);
        }

        let mut record = Vec::new();
        loop {
            record.clear();
            match records.read_until(b'\n', &mut record).await {
                Ok(0) => break,
                Ok(_) => {}
                Err(e) => {
                    error!(worker = %self.identity, error = %e, "Unable to read job record");
                    return WorkerExit::Failure(None);
                }
            }

            let text = String::from_utf8_lossy(&record);
            let (reply, fatal) = match Job::parse(&text) {
                Some(job) => {
                    let outcome = self.handle(&job).await;
                    (
                        outcome.message(&job, &self.identity, self.max_message_len),
                        outcome.is_fatal(),
                    )
                }
                None => {
                    warn!(worker = %self.identity, record = %text.trim_end(), "Malformed job record");
                    let text = format!(
                        "Malformed job record '{}' in process {}.",
                        text.trim_end(),
                        self.identity
                    );
                    (
                        Message::truncated(Status::Error, &text, self.max_message_len),
                        false,
                    )
                }
            };

            if let Err(e) = write_message(&mut results, &reply).await {
                error!(worker = %self.identity, error = %e, "Unable to report result");
                return WorkerExit::Failure(None);
            }

            if fatal {
                return WorkerExit::Failure(None);
            }
        }

        debug!(worker = %self.identity, "Inbound channel closed, exiting");
        WorkerExit::Success
    }

    async fn handle(&self, job: &Job) -> RecordOutcome {
        match self.process(job).await {
            Ok(()) => {
                debug!(worker = %self.identity, input = %job.input, output = %job.output, "Decrypted");
                RecordOutcome::Decrypted
            }
            Err(RecordError::ResourceExhausted) => {
                error!(worker = %self.identity, input = %job.input, "Memory allocation failed, exiting");
                RecordOutcome::ResourceExhausted
            }
            Err(e) => {
                warn!(worker = %self.identity, error = %e, "Record failed");
                e.outcome()
            }
        }
    }

    /// Decrypts `job.input` line by line into `job.output`.
    pub async fn process(&self, job: &Job) -> Result<(), RecordError> {
        let input_path = PathBuf::from(&job.input);
        let output_path = PathBuf::from(&job.output);

        let input = File::open(&input_path)
            .await
            .map_err(|source| RecordError::InputOpen {
                path: input_path.clone(),
                source,
            })?;
        let output = File::create(&output_path)
            .await
            .map_err(|source| RecordError::OutputOpen {
                path: output_path.clone(),
                source,
            })?;

        let mut reader = BufReader::new(input);
        let mut writer = BufWriter::new(output);
        let mut line = Vec::new();
        let mut line_number = 0;

        loop {
            line.clear();
            let read = reader
                .read_until(b'\n', &mut line)
                .await
                .map_err(|source| RecordError::Read {
                    path: input_path.clone(),
                    source,
                })?;
            if read == 0 {
                break;
            }
            line_number += 1;

            let body_len = line_body_len(&line);
            let (body, terminator) = line.split_at(body_len);
            let ciphertext = std::str::from_utf8(body).map_err(|_| RecordError::NotText {
                path: input_path.clone(),
                line: line_number,
            })?;

            let plaintext = self.decryptor.decrypt(ciphertext).map_err(|e| match e {
                DecryptError::ResourceExhausted => RecordError::ResourceExhausted,
                source => RecordError::InvalidCiphertext {
                    path: input_path.clone(),
                    line: line_number,
                    source,
                },
            })?;

            let write = |source: std::io::Error| RecordError::Write {
                path: output_path.clone(),
                source,
            };
            writer.write_all(plaintext.as_bytes()).await.map_err(write)?;
            writer.write_all(terminator).await.map_err(write)?;
        }

        writer.flush().await.map_err(|source| RecordError::Write {
            path: output_path.clone(),
            source,
        })
    }
}

/// Length of `line` without its trailing `\n` or `\r\n`.
fn line_body_len(line: &[u8]) -> usize {
    match line {
        [rest @ .., b'\r', b'\n'] => rest.len(),
        [rest @ .., b'\n'] => rest.len(),
        _ => line.len(),
    }
}
