//! StreamSession - server end of one client channel
//!
//! Owns the non-blocking server socket, the channel state machine and the
//! pending-write queue. Writers are serialised by the queue lock, so frames
//! from concurrent senders never interleave on the wire.

use std::fmt;
use std::io::{self, Write};
use std::net::Shutdown;
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::sync::Arc;

use contracts::{Pid, TransportConfig, Uid};
use parking_lot::Mutex;
use ringbuf::{traits::*, HeapRb};
use tracing::{debug, instrument, trace, warn};

use crate::error::{Result, TransportError};
use crate::metrics::ChannelMetrics;
use crate::packet::NetPacket;

/// Channel lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Socket pair exists, not yet associated with a subscriber
    Created,
    /// Associated with a pid
    Bound,
    /// At least one frame has been sent
    Streaming,
    /// Closed; every send fails
    Closed,
}

/// Server end of a client channel
pub struct StreamSession {
    fd: RawFd,
    pid: Pid,
    uid: Uid,
    token_type: i32,
    socket: UnixStream,
    state: Mutex<ChannelState>,
    pending: Mutex<HeapRb<u8>>,
    max_packet_size: u32,
    send_retry_limit: usize,
    metrics: ChannelMetrics,
}

impl fmt::Debug for StreamSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamSession")
            .field("fd", &self.fd)
            .field("pid", &self.pid)
            .field("uid", &self.uid)
            .field("state", &*self.state.lock())
            .finish()
    }
}

impl StreamSession {
    /// Create a connected socket pair
    ///
    /// Returns the session wrapping the server end and the client end,
    /// which the IPC layer hands to the client process.
    #[instrument(name = "stream_session_pair", skip(config))]
    pub fn pair(
        pid: Pid,
        uid: Uid,
        token_type: i32,
        config: &TransportConfig,
    ) -> Result<(Arc<Self>, UnixStream)> {
        let (server, client) = UnixStream::pair()?;
        server.set_nonblocking(true)?;

        let session = Arc::new(Self {
            fd: server.as_raw_fd(),
            pid,
            uid,
            token_type,
            socket: server,
            state: Mutex::new(ChannelState::Created),
            pending: Mutex::new(HeapRb::new(config.pending_queue_capacity)),
            max_packet_size: config.max_packet_size,
            send_retry_limit: config.send_retry_limit,
            metrics: ChannelMetrics::new(),
        });
        debug!(fd = session.fd, pid, "socket pair created");
        Ok((session, client))
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn uid(&self) -> Uid {
        self.uid
    }

    pub fn token_type(&self) -> i32 {
        self.token_type
    }

    pub fn state(&self) -> ChannelState {
        *self.state.lock()
    }

    pub fn is_closed(&self) -> bool {
        self.state() == ChannelState::Closed
    }

    pub fn metrics(&self) -> &ChannelMetrics {
        &self.metrics
    }

    /// Mark the channel as associated with its pid
    pub fn bind(&self) -> Result<()> {
        let mut state = self.state.lock();
        match *state {
            ChannelState::Closed => Err(TransportError::ChannelClosed { fd: self.fd }),
            ChannelState::Created => {
                *state = ChannelState::Bound;
                Ok(())
            }
            ChannelState::Bound | ChannelState::Streaming => Ok(()),
        }
    }

    /// Frame and send one packet
    pub fn send_msg(&self, packet: &NetPacket) -> Result<()> {
        let frame = packet.to_frame(self.max_packet_size)?;
        self.send_frame(&frame)
    }

    /// Send one already framed buffer
    ///
    /// Bytes queued from earlier short writes go out first. Whatever the
    /// socket does not accept after `send_retry_limit` attempts is queued;
    /// when the queue cannot hold it the send fails with `QueueFull`.
    pub fn send_frame(&self, frame: &[u8]) -> Result<()> {
        if self.is_closed() {
            return Err(TransportError::ChannelClosed { fd: self.fd });
        }

        let mut pending = self.pending.lock();
        let result = self.send_locked(&mut pending, frame);
        self.metrics.set_pending_bytes(pending.occupied_len());
        drop(pending);

        match &result {
            Ok(()) => {
                self.metrics.inc_frames_sent();
                let mut state = self.state.lock();
                if matches!(*state, ChannelState::Created | ChannelState::Bound) {
                    *state = ChannelState::Streaming;
                }
            }
            Err(e) => {
                self.metrics.inc_send_failures();
                observability::record_channel_error(error_kind(e));
                warn!(fd = self.fd, pid = self.pid, error = %e, "send failed");
            }
        }
        result
    }

    /// Try to drain the pending-write queue
    ///
    /// Returns true once the queue is empty.
    pub fn flush_pending(&self) -> Result<bool> {
        if self.is_closed() {
            return Err(TransportError::ChannelClosed { fd: self.fd });
        }
        let mut pending = self.pending.lock();
        self.drain_pending(&mut pending)?;
        self.metrics.set_pending_bytes(pending.occupied_len());
        Ok(pending.is_empty())
    }

    /// Close the channel
    ///
    /// Idempotent. The peer sees end-of-stream.
    pub fn close(&self) {
        let mut state = self.state.lock();
        if *state == ChannelState::Closed {
            return;
        }
        *state = ChannelState::Closed;
        drop(state);

        if let Err(e) = self.socket.shutdown(Shutdown::Both) {
            trace!(fd = self.fd, error = %e, "shutdown on close");
        }
        debug!(fd = self.fd, pid = self.pid, "channel closed");
    }

    pub(crate) fn socket(&self) -> &UnixStream {
        &self.socket
    }
}

impl StreamSession {
    fn send_locked(&self, pending: &mut HeapRb<u8>, frame: &[u8]) -> Result<()> {
        self.drain_pending(pending)?;

        if !pending.is_empty() {
            // 仍有积压，整帧排队以保持顺序
            return self.enqueue(pending, frame);
        }

        let written = self.write_with_retry(frame)?;
        if written < frame.len() {
            self.enqueue(pending, &frame[written..])?;
        }
        Ok(())
    }

    fn drain_pending(&self, pending: &mut HeapRb<u8>) -> Result<()> {
        while !pending.is_empty() {
            let (chunk_len, written) = {
                let (head, _) = pending.as_slices();
                (head.len(), self.write_with_retry(head)?)
            };
            pending.skip(written);
            if written < chunk_len {
                break;
            }
        }
        Ok(())
    }

    fn enqueue(&self, pending: &mut HeapRb<u8>, data: &[u8]) -> Result<()> {
        if pending.vacant_len() < data.len() {
            return Err(TransportError::QueueFull {
                fd: self.fd,
                pending: pending.occupied_len(),
                capacity: pending.capacity().get(),
            });
        }
        pending.push_slice(data);
        trace!(fd = self.fd, queued = data.len(), "remainder queued");
        Ok(())
    }

    /// Write as much of `data` as the socket accepts
    ///
    /// Returns the number of bytes written; stops early after
    /// `send_retry_limit` consecutive `WouldBlock` results.
    fn write_with_retry(&self, mut data: &[u8]) -> Result<usize> {
        let mut written = 0;
        let mut attempts = 0;

        while !data.is_empty() {
            match (&self.socket).write(data) {
                Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero).into()),
                Ok(n) => {
                    written += n;
                    data = &data[n..];
                    if !data.is_empty() {
                        self.metrics.inc_partial_writes();
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    attempts += 1;
                    self.metrics.inc_partial_writes();
                    if attempts >= self.send_retry_limit {
                        break;
                    }
                    std::thread::yield_now();
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(written)
    }
}

fn error_kind(e: &TransportError) -> &'static str {
    match e {
        TransportError::ChannelClosed { .. } => "closed",
        TransportError::QueueFull { .. } => "queue_full",
        TransportError::PayloadTooLarge { .. } => "payload_too_large",
        TransportError::Io(_) => "io",
        _ => "other",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::HEADER_SIZE;
    use contracts::MessageId;
    use bytes::Bytes;
    use std::io::Read;

    fn config() -> TransportConfig {
        TransportConfig {
            pending_queue_capacity: 1024,
            send_retry_limit: 2,
            ..Default::default()
        }
    }

    #[test]
    fn test_state_machine() {
        let (session, _client) = StreamSession::pair(100, 1000, 0, &config()).unwrap();
        assert_eq!(session.state(), ChannelState::Created);

        session.bind().unwrap();
        assert_eq!(session.state(), ChannelState::Bound);

        session
            .send_msg(&NetPacket::new(MessageId::FlushComplete, Bytes::new()))
            .unwrap();
        assert_eq!(session.state(), ChannelState::Streaming);

        session.close();
        session.close();
        assert!(session.is_closed());
        assert!(matches!(
            session.send_msg(&NetPacket::new(MessageId::FlushComplete, Bytes::new())),
            Err(TransportError::ChannelClosed { .. })
        ));
        assert!(session.bind().is_err());
    }

    #[test]
    fn test_frame_reaches_client() {
        let (session, mut client) = StreamSession::pair(1, 1, 0, &config()).unwrap();
        session
            .send_msg(&NetPacket::new(MessageId::SensorEvent, vec![9u8; 5]))
            .unwrap();

        let mut buf = [0u8; HEADER_SIZE + 5];
        client.read_exact(&mut buf).unwrap();
        assert_eq!(&buf[HEADER_SIZE..], &[9; 5]);
        assert_eq!(session.metrics().frames_sent(), 1);
    }

    #[test]
    fn test_remainder_is_queued_then_flushed_in_order() {
        let (session, mut client) = StreamSession::pair(1, 1, 0, &config()).unwrap();
        let frame = NetPacket::new(MessageId::SensorEvent, vec![1u8; 200])
            .to_frame(256)
            .unwrap();

        // 填满内核缓冲区，直到出现排队
        let mut sent = 0usize;
        while session.metrics().pending_bytes() == 0 {
            session.send_frame(&frame).unwrap();
            sent += 1;
            assert!(sent < 100_000, "socket never filled");
        }
        let queued_before = session.metrics().pending_bytes();
        assert!(queued_before > 0);

        // 读出全部数据后，排队内容随下一次 flush 发出
        client.set_nonblocking(true).unwrap();
        let mut drained = Vec::new();
        let mut chunk = [0u8; 8192];
        loop {
            match client.read(&mut chunk) {
                Ok(n) if n > 0 => drained.extend_from_slice(&chunk[..n]),
                _ => {
                    if session.flush_pending().unwrap() {
                        if let Ok(n) = client.read(&mut chunk) {
                            drained.extend_from_slice(&chunk[..n]);
                        }
                        break;
                    }
                }
            }
        }
        while let Ok(n) = client.read(&mut chunk) {
            if n == 0 {
                break;
            }
            drained.extend_from_slice(&chunk[..n]);
        }

        assert_eq!(drained.len(), sent * frame.len());
        assert!(drained.chunks(frame.len()).all(|c| c == &frame[..]));
    }

    #[test]
    fn test_queue_full_is_reported() {
        let cfg = TransportConfig {
            pending_queue_capacity: 64,
            send_retry_limit: 1,
            ..Default::default()
        };
        let (session, _client) = StreamSession::pair(1, 1, 0, &cfg).unwrap();
        let frame = NetPacket::new(MessageId::SensorEvent, vec![0u8; 200])
            .to_frame(256)
            .unwrap();

        let mut result = Ok(());
        for _ in 0..100_000 {
            result = session.send_frame(&frame);
            if result.is_err() {
                break;
            }
        }
        assert!(matches!(result, Err(TransportError::QueueFull { .. })));
        assert!(session.metrics().send_failures() > 0);
    }
}
