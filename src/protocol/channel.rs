//! Per-peer frame readers and the bounded-wait drain.
//!
//! Every tier owns several inbound byte streams (dispatcher connections, or
//! worker result pipes). Each stream gets a reader task that decodes frames
//! and forwards them, tagged with the peer's index, into a single channel
//! owned by the tier's control loop. The loop never blocks on one peer: it
//! calls [`poll_batch`] with a short wait, handles everything that arrived,
//! and repeats until a poll comes back empty.

use std::time::Duration;

use tokio::io::AsyncBufRead;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::codec::{decode, Decoded};

/// Capacity of a tier's inbound channel.
pub const INBOUND_CAPACITY: usize = 256;

/// A decoded frame (or end-of-stream outcome) tagged with its peer.
#[derive(Debug)]
pub struct Inbound {
    /// Index of the peer in the owning tier's registry.
    pub peer: usize,
    /// What was read.
    pub frame: Decoded,
}

/// Spawns a task that decodes frames from `reader` until the stream ends.
///
/// The terminal `Closed`/`Broken` outcome is forwarded too, so the owner
/// always learns when a peer goes away. The task also stops if the owner
/// drops its receiver.
pub fn spawn_frame_reader<R>(
    mut reader: R,
    peer: usize,
    max_len: usize,
    tx: mpsc::Sender<Inbound>,
) -> JoinHandle<()>
where
    R: AsyncBufRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            let frame = decode(&mut reader, max_len).await;
            let terminal = frame.is_terminal();

            if tx.send(Inbound { peer, frame }).await.is_err() || terminal {
                break;
            }
        }
    })
}

/// Waits up to `wait` for the first pending item, then takes everything else
/// already queued without waiting.
///
/// An empty result means nothing arrived within the wait.
pub async fn poll_batch<T>(rx: &mut mpsc::Receiver<T>, wait: Duration) -> Vec<T> {
    let mut batch = Vec::new();

    match tokio::time::timeout(wait, rx.recv()).await {
        Ok(Some(first)) => batch.push(first),
        Ok(None) | Err(_) => return batch,
    }

    while let Ok(next) = rx.try_recv() {
        batch.push(next);
    }

    batch
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::codec::encode;
    use crate::protocol::message::{Message, Status, MAX_MESSAGE_LEN};
    use std::io::Cursor;

    #[tokio::test]
    async fn test_poll_batch_empty_after_wait() {
        let (_tx, mut rx) = mpsc::channel::<u32>(4);
        let batch = poll_batch(&mut rx, Duration::from_millis(1)).await;
        assert!(batch.is_empty());
    }

    #[tokio::test]
    async fn test_poll_batch_takes_all_queued() {
        let (tx, mut rx) = mpsc::channel(8);
        for i in 0..5u32 {
            tx.send(i).await.unwrap();
        }

        let batch = poll_batch(&mut rx, Duration::from_millis(1)).await;
        assert_eq!(batch, vec![0, 1, 2, 3, 4]);
        assert!(poll_batch(&mut rx, Duration::from_millis(1)).await.is_empty());
    }

    #[tokio::test]
    async fn test_frame_reader_forwards_then_reports_close() {
        let mut bytes = encode(&Message::bare(Status::Ready));
        bytes.extend(encode(&Message::new(Status::Success, "a.txt").unwrap()));

        let (tx, mut rx) = mpsc::channel(INBOUND_CAPACITY);
        let handle = spawn_frame_reader(Cursor::new(bytes), 7, MAX_MESSAGE_LEN, tx);
        handle.await.unwrap();

        let mut seen = Vec::new();
        while let Some(inbound) = rx.recv().await {
            assert_eq!(inbound.peer, 7);
            seen.push(inbound.frame);
        }

        assert_eq!(seen.len(), 3);
        assert!(matches!(&seen[0], Decoded::Message(m) if m.status() == Status::Ready));
        assert!(matches!(&seen[1], Decoded::Message(m) if m.payload() == "a.txt"));
        assert!(matches!(seen[2], Decoded::Closed));
    }
}
