//! StreamClient - client end of a channel
//!
//! Used by local subscribers and tests to read frames the broker writes.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::os::fd::AsRawFd;
use std::os::unix::net::UnixStream;
use std::time::{Duration, Instant};

use contracts::TransportConfig;

use crate::circle_buffer::CircleStreamBuffer;
use crate::error::{Result, TransportError};
use crate::packet::{NetPacket, HEADER_SIZE};
use crate::stream_socket::on_read_packets;

/// Blocking reader/writer over the client socket
pub struct StreamClient {
    stream: UnixStream,
    buf: CircleStreamBuffer,
    ready: VecDeque<NetPacket>,
    chunk: Vec<u8>,
    max_packet_size: u32,
    once_process_limit: usize,
}

impl StreamClient {
    pub fn new(stream: UnixStream, config: &TransportConfig) -> Self {
        let limit = HEADER_SIZE + config.max_packet_size as usize + config.read_chunk;
        Self {
            stream,
            buf: CircleStreamBuffer::new(limit),
            ready: VecDeque::new(),
            chunk: vec![0u8; config.read_chunk],
            max_packet_size: config.max_packet_size,
            once_process_limit: config.once_process_limit,
        }
    }

    /// Next frame, waiting at most `timeout`
    ///
    /// `Ok(None)` on timeout; `ChannelClosed` once the broker hangs up and
    /// nothing is left buffered.
    pub fn recv_timeout(&mut self, timeout: Duration) -> Result<Option<NetPacket>> {
        let deadline = Instant::now() + timeout;

        loop {
            if let Some(packet) = self.ready.pop_front() {
                return Ok(Some(packet));
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            self.stream.set_read_timeout(Some(remaining))?;

            match self.stream.read(&mut self.chunk) {
                Ok(0) => {
                    return Err(TransportError::ChannelClosed {
                        fd: self.stream.as_raw_fd(),
                    })
                }
                Ok(n) => {
                    if !self.buf.write(&self.chunk[..n]) {
                        self.buf.reset();
                        continue;
                    }
                    let ready = &mut self.ready;
                    loop {
                        let outcome = on_read_packets(
                            &mut self.buf,
                            self.once_process_limit,
                            self.max_packet_size,
                            |packet| ready.push_back(packet),
                        );
                        if !outcome.more {
                            break;
                        }
                    }
                }
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
                    ) =>
                {
                    return Ok(None)
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Drain every frame that arrives within `timeout`
    pub fn recv_all(&mut self, timeout: Duration) -> Result<Vec<NetPacket>> {
        let mut packets = Vec::new();
        while let Some(packet) = self.recv_timeout(timeout)? {
            packets.push(packet);
        }
        Ok(packets)
    }

    /// Write one frame to the broker
    pub fn send(&mut self, packet: &NetPacket) -> Result<()> {
        let frame = packet.to_frame(self.max_packet_size)?;
        self.stream.write_all(&frame)?;
        Ok(())
    }

    pub fn stream(&self) -> &UnixStream {
        &self.stream
    }
}
