//! Frame encoding and decoding.

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::message::{Message, Status};
use crate::error::ProtocolError;

/// Outcome of reading one frame from a byte stream.
///
/// `Closed` and `Broken` are kept apart so a caller can tell a peer that
/// never started another frame from one that died halfway through it.
#[derive(Debug)]
pub enum Decoded {
    /// A complete frame.
    Message(Message),
    /// End of stream before any byte of a new frame was read.
    Closed,
    /// Read failure, or end of stream after the status byte was consumed.
    Broken(ProtocolError),
}

impl Decoded {
    /// Returns whether this outcome ends the stream.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Decoded::Message(_))
    }
}

/// Encodes a message as `status ++ payload ++ NUL`.
pub fn encode(message: &Message) -> Vec<u8> {
    let payload = message.payload().as_bytes();
    let mut frame = Vec::with_capacity(payload.len() + 2);
    frame.push(message.status().as_byte());
    frame.extend_from_slice(payload);
    frame.push(0);
    frame
}

/// Writes one encoded frame and flushes the writer.
pub async fn write_message<W>(writer: &mut W, message: &Message) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    writer.write_all(&encode(message)).await?;
    writer.flush().await
}

/// Reads exactly one frame.
///
/// Reads the status byte, then payload bytes until a NUL terminator or until
/// `max_len - 1` bytes (terminator included) have been consumed, whichever
/// comes first. A frame that hits the limit without a terminator ends there
/// and its payload is whatever was read.
///
/// Invalid UTF-8 is replaced with U+FFFD, and the decoded payload is cut back
/// to [`max_payload_len`](super::max_payload_len) so the message can always be re-encoded within
/// `max_len`.
pub async fn decode<R>(reader: &mut R, max_len: usize) -> Decoded
where
    R: AsyncBufRead + Unpin + ?Sized,
{
    let mut status_byte = [0u8; 1];
    match reader.read(&mut status_byte).await {
        Ok(0) => return Decoded::Closed,
        Ok(_) => {}
        Err(e) => return Decoded::Broken(ProtocolError::Io(e)),
    }

    let status = match Status::from_byte(status_byte[0]) {
        Ok(status) => status,
        Err(e) => return Decoded::Broken(e),
    };

    let limit = max_len.saturating_sub(1) as u64;
    let mut payload = Vec::new();
    let read = match (&mut *reader).take(limit).read_until(0, &mut payload).await {
        Ok(read) => read,
        Err(e) => return Decoded::Broken(ProtocolError::Io(e)),
    };

    if payload.last() == Some(&0) {
        payload.pop();
    } else if (read as u64) < limit {
        return Decoded::Broken(ProtocolError::Truncated { status });
    }

    let text = String::from_utf8_lossy(&payload);
    Decoded::Message(Message::truncated(status, &text, max_len))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::message::{max_payload_len, MAX_MESSAGE_LEN};
    use std::io::Cursor;

    async fn decode_bytes(bytes: Vec<u8>, max_len: usize) -> Decoded {
        let mut cursor = Cursor::new(bytes);
        decode(&mut cursor, max_len).await
    }

    fn expect_message(decoded: Decoded) -> Message {
        match decoded {
            Decoded::Message(msg) => msg,
            other => panic!("expected a message, got {:?}", other),
        }
    }

    #[test]
    fn test_encode_layout() {
        let msg = Message::new(Status::Success, "in.txt in process 42").unwrap();
        let frame = encode(&msg);

        assert_eq!(frame[0], 0x15);
        assert_eq!(&frame[1..frame.len() - 1], b"in.txt in process 42");
        assert_eq!(*frame.last().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_round_trip_each_status() {
        for status in [
            Status::Ready,
            Status::Line,
            Status::Success,
            Status::Error,
            Status::Exit,
        ] {
            let msg = Message::new(status, "a.txt b.txt").unwrap();
            let decoded = expect_message(decode_bytes(encode(&msg), MAX_MESSAGE_LEN).await);
            assert_eq!(decoded, msg);
        }
    }

    #[tokio::test]
    async fn test_round_trip_empty_and_longest_payload() {
        let empty = Message::bare(Status::Ready);
        assert_eq!(
            expect_message(decode_bytes(encode(&empty), MAX_MESSAGE_LEN).await),
            empty
        );

        let longest = Message::new(Status::Line, "x".repeat(max_payload_len(MAX_MESSAGE_LEN)))
            .unwrap();
        assert_eq!(
            expect_message(decode_bytes(encode(&longest), MAX_MESSAGE_LEN).await),
            longest
        );
    }

    #[tokio::test]
    async fn test_back_to_back_frames() {
        let first = Message::bare(Status::Ready);
        let second = Message::new(Status::Success, "done").unwrap();
        let mut bytes = encode(&first);
        bytes.extend(encode(&second));

        let mut cursor = Cursor::new(bytes);
        assert_eq!(expect_message(decode(&mut cursor, MAX_MESSAGE_LEN).await), first);
        assert_eq!(expect_message(decode(&mut cursor, MAX_MESSAGE_LEN).await), second);
        assert!(matches!(
            decode(&mut cursor, MAX_MESSAGE_LEN).await,
            Decoded::Closed
        ));
    }

    #[tokio::test]
    async fn test_closed_before_status() {
        assert!(matches!(
            decode_bytes(Vec::new(), MAX_MESSAGE_LEN).await,
            Decoded::Closed
        ));
    }

    #[tokio::test]
    async fn test_broken_mid_frame() {
        // Status byte and part of a payload, but the peer vanished before NUL.
        let decoded = decode_bytes(vec![0x15, b'a', b'b'], MAX_MESSAGE_LEN).await;
        match decoded {
            Decoded::Broken(ProtocolError::Truncated { status }) => {
                assert_eq!(status, Status::Success)
            }
            other => panic!("expected a broken frame, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unknown_status_is_broken() {
        let decoded = decode_bytes(vec![0x42, 0], MAX_MESSAGE_LEN).await;
        assert!(matches!(
            decoded,
            Decoded::Broken(ProtocolError::UnknownStatus(0x42))
        ));
    }

    #[tokio::test]
    async fn test_limit_ends_unterminated_frame() {
        // Limit of 6 reads 5 bytes after the status; 4 fit in a payload.
        let mut bytes = vec![Status::Line.as_byte()];
        bytes.extend_from_slice(b"abcdefgh");
        bytes.push(0);

        let mut cursor = Cursor::new(bytes);
        let msg = expect_message(decode(&mut cursor, 6).await);
        assert_eq!(msg.status(), Status::Line);
        assert_eq!(msg.payload(), "abcd");
        assert!(encode(&msg).len() <= 6);
    }

    #[tokio::test]
    async fn test_invalid_utf8_stays_within_limit() {
        let mut bytes = vec![Status::Error.as_byte()];
        bytes.extend(std::iter::repeat(0xFF).take(max_payload_len(MAX_MESSAGE_LEN)));
        bytes.push(0);

        let msg = expect_message(decode_bytes(bytes, MAX_MESSAGE_LEN).await);
        assert_eq!(msg.status(), Status::Error);
        assert!(msg.payload().len() <= max_payload_len(MAX_MESSAGE_LEN));
        assert!(msg.payload().chars().all(|c| c == '\u{FFFD}'));

        let reencoded = encode(&msg);
        assert!(reencoded.len() <= MAX_MESSAGE_LEN);
        let again = expect_message(decode_bytes(reencoded, MAX_MESSAGE_LEN).await);
        assert_eq!(again, msg);
    }
}
