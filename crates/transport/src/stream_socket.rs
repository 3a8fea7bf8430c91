//! Frame extraction from the receive buffer

use bytes::Bytes;
use tracing::{error, warn};

use crate::circle_buffer::CircleStreamBuffer;
use crate::packet::{NetPacket, PackHead, HEADER_SIZE};

/// Result of one `on_read_packets` pass
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReadOutcome {
    /// Frames handed to the callback
    pub dispatched: usize,
    /// The buffer was dropped because a header was corrupt
    pub reset: bool,
    /// A complete frame is still buffered (the per-pass limit was hit)
    pub more: bool,
}

/// Parse and dispatch up to `limit` complete frames from `buf`
///
/// Stops without consuming when fewer than `HEADER_SIZE` bytes are unread
/// or the payload is incomplete. A header declaring more than
/// `max_packet_size` bytes cannot be resynchronised, so the whole buffer
/// is reset.
pub fn on_read_packets<F>(
    buf: &mut CircleStreamBuffer,
    limit: usize,
    max_packet_size: u32,
    mut callback: F,
) -> ReadOutcome
where
    F: FnMut(NetPacket),
{
    let mut outcome = ReadOutcome::default();

    for _ in 0..limit {
        let unread = buf.unread_size();
        let Some(head) = PackHead::peek(buf.read_buf()) else {
            break;
        };

        if head.size > max_packet_size {
            error!(
                declared = head.size,
                max = max_packet_size,
                unread,
                "packet header corrupt, resetting receive buffer"
            );
            buf.reset();
            observability::record_protocol_reset();
            outcome.reset = true;
            break;
        }

        let packet_len = HEADER_SIZE + head.size as usize;
        if packet_len > unread {
            break;
        }

        let payload = Bytes::copy_from_slice(&buf.read_buf()[HEADER_SIZE..packet_len]);
        if !buf.seek_read_pos(packet_len) {
            warn!(packet_len, unread, "seek past unread region, resetting receive buffer");
            buf.reset();
            outcome.reset = true;
            break;
        }

        callback(NetPacket::from_raw(head.msg_id, payload));
        outcome.dispatched += 1;

        if buf.is_empty() {
            buf.reset();
            break;
        }
    }

    if !outcome.reset {
        outcome.more = PackHead::peek(buf.read_buf())
            .map(|head| HEADER_SIZE + head.size as usize <= buf.unread_size())
            .unwrap_or(false);
    }
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use contracts::MessageId;

    fn frame(msg: MessageId, payload_len: usize) -> Bytes {
        NetPacket::new(msg, vec![7u8; payload_len])
            .to_frame(1024)
            .unwrap()
    }

    #[test]
    fn test_split_frame_waits_for_remainder() {
        let bytes = frame(MessageId::SensorEvent, 42);
        assert_eq!(bytes.len(), 50);

        let mut buf = CircleStreamBuffer::new(1024);
        let mut received = Vec::new();

        assert!(buf.write(&bytes[..30]));
        let outcome = on_read_packets(&mut buf, 100, 256, |p| received.push(p));
        assert_eq!(outcome.dispatched, 0);
        assert_eq!(buf.unread_size(), 30);

        assert!(buf.write(&bytes[30..]));
        let outcome = on_read_packets(&mut buf, 100, 256, |p| received.push(p));
        assert_eq!(outcome.dispatched, 1);
        assert_eq!(received[0].payload().len(), 42);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_short_header_waits() {
        let mut buf = CircleStreamBuffer::new(64);
        assert!(buf.write(&[1, 0, 0]));
        let outcome = on_read_packets(&mut buf, 100, 256, |_| panic!("no frame expected"));
        assert_eq!(outcome, ReadOutcome::default());
        assert_eq!(buf.unread_size(), 3);
    }

    #[test]
    fn test_oversized_header_resets_buffer() {
        let head = PackHead {
            msg_id: 1,
            size: 10_000,
        };
        let mut buf = CircleStreamBuffer::new(1024);
        assert!(buf.write(bytemuck::bytes_of(&head)));
        assert!(buf.write(&[0u8; 16]));

        let outcome = on_read_packets(&mut buf, 100, 256, |_| panic!("no frame expected"));
        assert!(outcome.reset);
        assert!(buf.is_empty());

        // 重置后可继续接收新帧
        assert!(buf.write(&frame(MessageId::FlushComplete, 4)));
        let outcome = on_read_packets(&mut buf, 100, 256, |_| {});
        assert_eq!(outcome.dispatched, 1);
    }

    #[test]
    fn test_limit_caps_frames_per_pass() {
        let mut buf = CircleStreamBuffer::new(4096);
        for _ in 0..5 {
            assert!(buf.write(&frame(MessageId::SensorEvent, 4)));
        }

        let outcome = on_read_packets(&mut buf, 3, 256, |_| {});
        assert_eq!(outcome.dispatched, 3);
        assert!(outcome.more);

        let outcome = on_read_packets(&mut buf, 3, 256, |_| {});
        assert_eq!(outcome.dispatched, 2);
        assert!(!outcome.more);
    }

    #[test]
    fn test_zero_length_payload() {
        let mut buf = CircleStreamBuffer::new(64);
        assert!(buf.write(&frame(MessageId::FlushComplete, 0)));
        let mut ids = Vec::new();
        on_read_packets(&mut buf, 100, 256, |p| ids.push(p.msg_id()));
        assert_eq!(ids, vec![2]);
    }
}
