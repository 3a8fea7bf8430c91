//! Service error types

use contracts::{Pid, SensorId};
use hdi_connection::HdiError;
use thiserror::Error;
use transport::TransportError;

/// Errors surfaced on the control surface
#[derive(Debug, Error)]
pub enum ServiceError {
    /// Bad sensor id or out-of-range period/delay; nothing was changed
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Caller pid is not a valid process id
    #[error("invalid pid {0}")]
    InvalidPid(Pid),

    /// No subscription for this (pid, sensor) pair
    #[error("pid {pid} is not subscribed to sensor {sensor_id}")]
    NotSubscribed { pid: Pid, sensor_id: SensorId },

    /// Subscription already recorded for this (pid, sensor) pair
    #[error("pid {pid} is already subscribed to sensor {sensor_id}")]
    AlreadySubscribed { pid: Pid, sensor_id: SensorId },

    /// Resume requested for a pid without a suspend snapshot
    #[error("pid {0} is not suspended")]
    NotSuspended(Pid),

    /// Backend enable/disable/batch failed; the bookkeeping was rolled back
    #[error("hardware error on sensor {sensor_id}: {source}")]
    HardwareError {
        sensor_id: SensorId,
        #[source]
        source: HdiError,
    },

    /// Channel missing or unusable for this pid
    #[error("channel error for pid {pid}: {message}")]
    ChannelError { pid: Pid, message: String },

    /// Frame header declared an impossible size
    #[error("protocol corruption: declared size {declared} exceeds max {max}")]
    ProtocolCorruption { declared: u32, max: u32 },

    /// Mock injection and other connection-level failures
    #[error(transparent)]
    Hdi(HdiError),

    /// Wrapped TransportError
    #[error(transparent)]
    Transport(TransportError),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ServiceError {
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument(message.into())
    }

    pub fn hardware(sensor_id: SensorId, source: HdiError) -> Self {
        Self::HardwareError { sensor_id, source }
    }

    pub fn channel(pid: Pid, message: impl Into<String>) -> Self {
        Self::ChannelError {
            pid,
            message: message.into(),
        }
    }
}

impl From<HdiError> for ServiceError {
    fn from(e: HdiError) -> Self {
        match e {
            HdiError::SensorNotFound(id) => Self::InvalidArgument(format!("unknown sensor {id}")),
            other => Self::Hdi(other),
        }
    }
}

impl From<TransportError> for ServiceError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::ProtocolCorruption { declared, max } => {
                Self::ProtocolCorruption { declared, max }
            }
            other => Self::Transport(other),
        }
    }
}

/// Result alias
pub type Result<T> = std::result::Result<T, ServiceError>;

/// Per-item result of a bulk operation
///
/// The call as a whole succeeds for every item in `succeeded`; `failed`
/// keeps each remaining item with its error.
#[derive(Debug)]
pub struct BulkOutcome<T> {
    pub succeeded: Vec<T>,
    pub failed: Vec<(T, ServiceError)>,
}

impl<T> Default for BulkOutcome<T> {
    fn default() -> Self {
        Self {
            succeeded: Vec::new(),
            failed: Vec::new(),
        }
    }
}

impl<T> BulkOutcome<T> {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn push_ok(&mut self, item: T) {
        self.succeeded.push(item);
    }

    pub fn push_err(&mut self, item: T, error: ServiceError) {
        self.failed.push((item, error));
    }

    /// Items that failed, without their errors
    pub fn failed_items(&self) -> Vec<&T> {
        self.failed.iter().map(|(item, _)| item).collect()
    }

    pub fn merge(&mut self, other: BulkOutcome<T>) {
        self.succeeded.extend(other.succeeded);
        self.failed.extend(other.failed);
    }
}
