//! Per-channel counters

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Counters for a single channel
#[derive(Debug, Default)]
pub struct ChannelMetrics {
    /// Bytes waiting in the pending-write queue
    pending_bytes: AtomicUsize,
    /// Frames fully handed to the socket or queued
    frames_sent: AtomicU64,
    /// Frames parsed on the receive path
    frames_received: AtomicU64,
    /// Writes that hit `WouldBlock` or a short write
    partial_writes: AtomicU64,
    /// Failed sends
    send_failures: AtomicU64,
    /// Receive buffer resets
    protocol_resets: AtomicU64,
}

impl ChannelMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pending_bytes(&self) -> usize {
        self.pending_bytes.load(Ordering::Relaxed)
    }

    pub fn set_pending_bytes(&self, len: usize) {
        self.pending_bytes.store(len, Ordering::Relaxed);
    }

    pub fn frames_sent(&self) -> u64 {
        self.frames_sent.load(Ordering::Relaxed)
    }

    pub fn inc_frames_sent(&self) {
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn frames_received(&self) -> u64 {
        self.frames_received.load(Ordering::Relaxed)
    }

    pub fn add_frames_received(&self, n: usize) {
        self.frames_received.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn partial_writes(&self) -> u64 {
        self.partial_writes.load(Ordering::Relaxed)
    }

    pub fn inc_partial_writes(&self) {
        self.partial_writes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn send_failures(&self) -> u64 {
        self.send_failures.load(Ordering::Relaxed)
    }

    pub fn inc_send_failures(&self) {
        self.send_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn protocol_resets(&self) -> u64 {
        self.protocol_resets.load(Ordering::Relaxed)
    }

    pub fn inc_protocol_resets(&self) {
        self.protocol_resets.fetch_add(1, Ordering::Relaxed);
    }

    /// Get snapshot of all counters
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            pending_bytes: self.pending_bytes(),
            frames_sent: self.frames_sent(),
            frames_received: self.frames_received(),
            partial_writes: self.partial_writes(),
            send_failures: self.send_failures(),
            protocol_resets: self.protocol_resets(),
        }
    }
}

/// Snapshot of channel counters (for reporting)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub pending_bytes: usize,
    pub frames_sent: u64,
    pub frames_received: u64,
    pub partial_writes: u64,
    pub send_failures: u64,
    pub protocol_resets: u64,
}
