//! Job records and per-record outcomes.
//!
//! - `Job`: one input/output path pair parsed from a job-stream record
//! - `RecordOutcome`: how a worker finished a record, and the message it
//!   reports upstream

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::protocol::{Message, Status};

/// A single decryption job: read `input`, write `output`.
///
/// Paths are opaque tokens; whitespace inside a path is not supported.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    /// Path of the ciphertext file.
    pub input: String,
    /// Path the plaintext is written to.
    pub output: String,
}

impl Job {
    /// Creates a job from its two paths.
    pub fn new(input: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            input: input.into(),
            output: output.into(),
        }
    }

    /// Parses a record of exactly two whitespace-separated tokens.
    ///
    /// Returns `None` for blank records and for records with any other
    /// number of tokens.
    pub fn parse(record: &str) -> Option<Self> {
        let mut tokens = record.split_whitespace();
        let input = tokens.next()?;
        let output = tokens.next()?;

        if tokens.next().is_some() {
            return None;
        }

        Some(Self::new(input, output))
    }

    /// Returns the record as carried on a worker's inbound channel.
    pub fn to_record(&self) -> String {
        format!("{}\n", self)
    }

    /// Builds the LINE message that hands this job to a dispatcher.
    pub fn to_message(&self, max_len: usize) -> Result<Message, crate::error::ProtocolError> {
        Message::with_limit(Status::Line, self.to_string(), max_len)
    }
}

impl fmt::Display for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.input, self.output)
    }
}

/// How a worker finished one record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordOutcome {
    /// Every line was decrypted and written.
    Decrypted,
    /// The input file could not be opened.
    InputOpenFailed,
    /// The output file could not be created.
    OutputOpenFailed,
    /// The ciphertext contained a character outside the alphabet.
    InvalidCiphertext,
    /// Reading the input or writing the output failed partway.
    IoFailed,
    /// The worker ran out of memory; it stops after reporting this.
    ResourceExhausted,
}

impl RecordOutcome {
    /// Returns whether the worker must terminate after reporting.
    pub fn is_fatal(&self) -> bool {
        matches!(self, RecordOutcome::ResourceExhausted)
    }

    /// Status byte of the message reporting this outcome.
    pub fn status(&self) -> Status {
        match self {
            RecordOutcome::Decrypted => Status::Success,
            _ => Status::Error,
        }
    }

    /// Builds the report for `job`, processed by the worker named `worker`.
    ///
    /// Long paths are truncated so the report always fits in one frame.
    pub fn message(&self, job: &Job, worker: &str, max_len: usize) -> Message {
        let text = match self {
            RecordOutcome::Decrypted => format!("{} in process {}", job.input, worker),
            RecordOutcome::InputOpenFailed => {
                format!("Unable to open file {} in process {}.", job.input, worker)
            }
            RecordOutcome::OutputOpenFailed => {
                format!("Unable to open file {} in process {}.", job.output, worker)
            }
            RecordOutcome::InvalidCiphertext => {
                format!("Invalid characters in {}. Process {}.", job.input, worker)
            }
            RecordOutcome::IoFailed => {
                format!("Unable to decrypt {} in process {}.", job.input, worker)
            }
            RecordOutcome::ResourceExhausted => {
                format!("Memory allocation failed in process {}, process exiting", worker)
            }
        };

        Message::truncated(self.status(), &text, max_len)
    }
}

impl fmt::Display for RecordOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordOutcome::Decrypted => write!(f, "decrypted"),
            RecordOutcome::InputOpenFailed => write!(f, "input_open_failed"),
            RecordOutcome::OutputOpenFailed => write!(f, "output_open_failed"),
            RecordOutcome::InvalidCiphertext => write!(f, "invalid_ciphertext"),
            RecordOutcome::IoFailed => write!(f, "io_failed"),
            RecordOutcome::ResourceExhausted => write!(f, "resource_exhausted"),
        }
    }
}
