//! Streaming reader over the job-stream source.
//!
//! The job stream is a text source with one record per line. Records are
//! pulled one at a time, so the job source never holds more than the single
//! job it is about to dispatch. Blank, malformed and oversize records are
//! skipped with a warning; the line counter still advances past them.

use std::path::Path;

use tokio::fs::File;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tracing::warn;

use super::job::Job;
use crate::error::SourceError;
use crate::protocol::{max_payload_len, MAX_MESSAGE_LEN};

/// Lazily parsed stream of [`Job`]s.
pub struct JobStream {
    reader: Box<dyn AsyncBufRead + Unpin + Send>,
    name: String,
    line_number: usize,
    skipped: usize,
    max_record_len: usize,
    exhausted: bool,
}

impl JobStream {
    /// Opens the job-stream file at `path`.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, SourceError> {
        let path = path.as_ref();
        let file = File::open(path).await.map_err(|source| SourceError::ConfigOpen {
            path: path.to_path_buf(),
            source,
        })?;

        Ok(Self::from_reader(
            BufReader::new(file),
            path.display().to_string(),
        ))
    }

    /// Wraps an already open reader. `name` is used in log lines.
    pub fn from_reader<R>(reader: R, name: impl Into<String>) -> Self
    where
        R: AsyncBufRead + Unpin + Send + 'static,
    {
        Self {
            reader: Box::new(reader),
            name: name.into(),
            line_number: 0,
            skipped: 0,
            max_record_len: max_payload_len(MAX_MESSAGE_LEN),
            exhausted: false,
        }
    }

    /// Sets the frame limit records must fit in.
    pub fn with_max_message_len(mut self, max_len: usize) -> Self {
        self.max_record_len = max_payload_len(max_len);
        self
    }

    /// Returns the next well-formed job, or `None` once the source is
    /// exhausted.
    pub async fn next_job(&mut self) -> Result<Option<Job>, SourceError> {
        let mut line = Vec::new();

        while !self.exhausted {
            line.clear();
            let read = self
                .reader
                .read_until(b'\n', &mut line)
                .await
                .map_err(|source| SourceError::ConfigRead {
                    name: self.name.clone(),
                    source,
                })?;

            if read == 0 {
                self.exhausted = true;
                break;
            }
            self.line_number += 1;

            let text = String::from_utf8_lossy(&line);
            match Job::parse(&text) {
                Some(job) if job.to_string().len() <= self.max_record_len => {
                    return Ok(Some(job));
                }
                Some(_) => {
                    warn!(
                        line = self.line_number,
                        source = %self.name,
                        "Line {} in {} does not fit in one message, skipping",
                        self.line_number,
                        self.name
                    );
                    self.skipped += 1;
                }
                None => {
                    warn!(
                        line = self.line_number,
                        source = %self.name,
                        "Failed to read line {} in {}, skipping",
                        self.line_number,
                        self.name
                    );
                    self.skipped += 1;
                }
            }
        }

        Ok(None)
    }

    /// Returns whether the source has no more records.
    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    /// Number of physical lines read so far.
    pub fn line_number(&self) -> usize {
        self.line_number
    }

    /// Number of records skipped so far.
    pub fn skipped(&self) -> usize {
        self.skipped
    }

    /// Name of the underlying source.
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl std::fmt::Debug for JobStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobStream")
            .field("name", &self.name)
            .field("line_number", &self.line_number)
            .field("skipped", &self.skipped)
            .field("exhausted", &self.exhausted)
            .finish()
    }
}
