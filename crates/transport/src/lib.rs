//! # Transport
//!
//! Framed byte-stream channels between the broker and its clients.
//!
//! Every frame is a fixed 8-byte `PackHead { msg_id, size }` followed by
//! `size` payload bytes. Channels are `AF_UNIX` stream socket pairs; the
//! server end is non-blocking and owned by a `StreamSession`.
//!
//! - `packet`: frame header and `NetPacket`
//! - `circle_buffer` / `stream_socket`: receive buffering and frame extraction
//! - `session`: one channel, its state machine and pending-write queue
//! - `server`: socket channel table keyed by fd and pid
//! - `reactor`: readiness-driven receive loop
//! - `client`: client end, used by local subscribers and tests

mod circle_buffer;
mod client;
mod error;
mod metrics;
mod packet;
mod reactor;
mod server;
mod session;
mod stream_socket;

pub use circle_buffer::CircleStreamBuffer;
pub use client::StreamClient;
pub use error::{Result, TransportError};
pub use metrics::{ChannelMetrics, MetricsSnapshot};
pub use packet::{NetPacket, PackHead, HEADER_SIZE};
pub use reactor::{DisconnectHandler, PacketHandler, Reactor};
pub use server::{MulticastReport, StreamServer};
pub use session::{ChannelState, StreamSession};
pub use stream_socket::{on_read_packets, ReadOutcome};
