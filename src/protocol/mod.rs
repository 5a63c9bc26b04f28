//! Wire protocol shared by every tier.
//!
//! A frame is one status byte followed by a NUL-terminated payload:
//!
//! ```text
//! +--------+------------------------+------+
//! | status |  payload (UTF-8 text)  | 0x00 |
//! +--------+------------------------+------+
//!   1 byte     <= max_len - 2 bytes   1 byte
//! ```
//!
//! The same framing is used on the network link between the job source and
//! its dispatchers and on the result channel from every worker back to its
//! dispatcher.
//!
//! - **message**: `Status` codes and the validated `Message` value
//! - **codec**: frame encoding and the `decode` state machine
//! - **channel**: per-peer frame readers and the bounded-wait drain used by
//!   each tier's main loop

pub mod channel;
pub mod codec;
pub mod message;

pub use channel::{poll_batch, spawn_frame_reader, Inbound, INBOUND_CAPACITY};
pub use codec::{decode, encode, write_message, Decoded};
pub use message::{max_payload_len, Message, Status, MAX_MESSAGE_LEN};
