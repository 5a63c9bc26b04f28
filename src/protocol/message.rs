//! Status codes and the bounded `Message` value.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;

/// Maximum length of a whole frame (status byte, payload and terminator).
pub const MAX_MESSAGE_LEN: usize = 3000;

/// Largest payload that fits in a frame of `max_len` bytes.
pub fn max_payload_len(max_len: usize) -> usize {
    max_len.saturating_sub(2)
}

/// Status byte carried at the front of every frame.
///
/// The numeric values are part of the wire format and must never change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Status {
    /// Job record for a dispatcher to schedule.
    Line = 0x01,
    /// A worker is idle and can take a job.
    Ready = 0x03,
    /// A job failed; the payload describes why.
    Error = 0x05,
    /// Orderly termination request or acknowledgement.
    Exit = 0x10,
    /// A job completed; the payload names it.
    Success = 0x15,
}

impl Status {
    /// Returns the wire byte for this status.
    pub fn as_byte(self) -> u8 {
        self as u8
    }

    /// Parses a wire byte.
    pub fn from_byte(byte: u8) -> Result<Self, ProtocolError> {
        match byte {
            0x01 => Ok(Status::Line),
            0x03 => Ok(Status::Ready),
            0x05 => Ok(Status::Error),
            0x10 => Ok(Status::Exit),
            0x15 => Ok(Status::Success),
            other => Err(ProtocolError::UnknownStatus(other)),
        }
    }

    /// Returns whether this status reports the outcome of a job.
    pub fn is_result(self) -> bool {
        matches!(self, Status::Success | Status::Error)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::Line => write!(f, "LINE"),
            Status::Ready => write!(f, "READY"),
            Status::Error => write!(f, "ERROR"),
            Status::Exit => write!(f, "EXIT"),
            Status::Success => write!(f, "SUCCESS"),
        }
    }
}

/// A single protocol message.
///
/// Messages are immutable once built. The payload never contains a NUL byte
/// and never exceeds [`max_payload_len`] of the frame limit it was validated
/// against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    status: Status,
    payload: String,
}

impl Message {
    /// Builds a message, rejecting payloads that cannot be framed within
    /// [`MAX_MESSAGE_LEN`].
    pub fn new(status: Status, payload: impl Into<String>) -> Result<Self, ProtocolError> {
        Self::with_limit(status, payload, MAX_MESSAGE_LEN)
    }

    /// Builds a message validated against a custom frame limit.
    pub fn with_limit(
        status: Status,
        payload: impl Into<String>,
        max_len: usize,
    ) -> Result<Self, ProtocolError> {
        let payload = payload.into();
        let max = max_payload_len(max_len);

        if payload.len() > max {
            return Err(ProtocolError::PayloadTooLong {
                len: payload.len(),
                max,
            });
        }
        if payload.contains('\0') {
            return Err(ProtocolError::InteriorNul);
        }

        Ok(Self { status, payload })
    }

    /// Builds a message with an empty payload.
    pub fn bare(status: Status) -> Self {
        Self {
            status,
            payload: String::new(),
        }
    }

    /// Builds a message, truncating the payload to fit `max_len`.
    ///
    /// Used for human-readable reports whose text embeds arbitrary paths.
    /// NUL bytes are dropped and the cut happens on a character boundary.
    pub fn truncated(status: Status, payload: &str, max_len: usize) -> Self {
        let max = max_payload_len(max_len);
        let mut text: String = payload.chars().filter(|c| *c != '\0').collect();

        if text.len() > max {
            let mut cut = max;
            while !text.is_char_boundary(cut) {
                cut -= 1;
            }
            text.truncate(cut);
        }

        Self {
            status,
            payload: text,
        }
    }

    /// Returns the status code.
    pub fn status(&self) -> Status {
        self.status
    }

    /// Returns the payload text.
    pub fn payload(&self) -> &str {
        &self.payload
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_bytes_are_distinct() {
        let all = [
            Status::Line,
            Status::Ready,
            Status::Error,
            Status::Exit,
            Status::Success,
        ];
        for (i, a) in all.iter().enumerate() {
            assert_eq!(Status::from_byte(a.as_byte()).unwrap(), *a);
            for b in &all[i + 1..] {
                assert_ne!(a.as_byte(), b.as_byte());
            }
        }
    }

    #[test]
    fn test_unknown_status_rejected() {
        let err = Status::from_byte(0x7f).unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownStatus(0x7f)));
    }

    #[test]
    fn test_payload_limit() {
        let max = max_payload_len(MAX_MESSAGE_LEN);
        assert_eq!(max, 2998);

        assert!(Message::new(Status::Line, "a".repeat(max)).is_ok());

        let err = Message::new(Status::Line, "a".repeat(max + 1)).unwrap_err();
        assert!(matches!(err, ProtocolError::PayloadTooLong { len: 2999, max: 2998 }));
    }

    #[test]
    fn test_interior_nul_rejected() {
        let err = Message::new(Status::Error, "bad\0payload").unwrap_err();
        assert!(matches!(err, ProtocolError::InteriorNul));
    }

    #[test]
    fn test_truncated_respects_char_boundary() {
        // Each 'é' is two bytes; a 9-byte payload budget must not split one.
        let msg = Message::truncated(Status::Error, &"é".repeat(10), 11);
        assert_eq!(msg.payload().len(), 8);
        assert_eq!(msg.payload(), "éééé");
    }

    #[test]
    fn test_truncated_drops_nul() {
        let msg = Message::truncated(Status::Success, "a\0b", MAX_MESSAGE_LEN);
        assert_eq!(msg.payload(), "ab");
    }

    #[test]
    fn test_status_display() {
        assert_eq!(Status::Ready.to_string(), "READY");
        assert_eq!(Status::Success.to_string(), "SUCCESS");
        assert!(Status::Error.is_result());
        assert!(!Status::Exit.is_result());
    }
}
