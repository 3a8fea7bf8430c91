//! Transport error types

use std::os::fd::RawFd;

use contracts::Pid;
use thiserror::Error;

/// Transport-specific errors
#[derive(Debug, Error)]
pub enum TransportError {
    /// Frame header declared a payload larger than allowed
    #[error("protocol corruption: declared size {declared} exceeds max {max}")]
    ProtocolCorruption { declared: u32, max: u32 },

    /// Payload exceeds what one frame may carry
    #[error("payload of {size} bytes exceeds max packet size {max}")]
    PayloadTooLarge { size: usize, max: u32 },

    /// Channel is closed
    #[error("channel fd={fd} is closed")]
    ChannelClosed { fd: RawFd },

    /// Pending-write queue cannot hold the unsent remainder
    #[error("pending queue full on fd={fd}: {pending} bytes pending, {capacity} capacity")]
    QueueFull {
        fd: RawFd,
        pending: usize,
        capacity: usize,
    },

    /// No session for this fd
    #[error("no session for fd={0}")]
    SessionNotFound(RawFd),

    /// No session for this pid
    #[error("no session for pid={0}")]
    PidNotFound(Pid),

    /// Payload encode/decode failure
    #[error("codec error for message {msg_id}: {message}")]
    Codec { msg_id: u32, message: String },

    /// Wrapped ContractError
    #[error(transparent)]
    Contract(#[from] contracts::ContractError),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransportError {
    /// Create a codec error
    pub fn codec(msg_id: u32, message: impl Into<String>) -> Self {
        Self::Codec {
            msg_id,
            message: message.into(),
        }
    }

    /// Whether the channel should be torn down after this error
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::ChannelClosed { .. } | Self::QueueFull { .. } | Self::Io(_)
        )
    }
}

/// Result alias
pub type Result<T> = std::result::Result<T, TransportError>;
