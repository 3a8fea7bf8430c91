//! Wire message kinds carried in the frame header

use serde::{Deserialize, Serialize};

use crate::ContractError;

/// Message kind of one frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum MessageId {
    /// A `SensorEvent` payload
    SensorEvent = 1,
    /// A flush has drained for the carried sensor id
    FlushComplete = 2,
    /// An `ActiveInfo` record for client-info listeners
    ActiveInfo = 3,
}

impl MessageId {
    /// Raw header value
    #[inline]
    pub const fn as_u32(self) -> u32 {
        self as u32
    }
}

impl TryFrom<u32> for MessageId {
    type Error = ContractError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::SensorEvent),
            2 => Ok(Self::FlushComplete),
            3 => Ok(Self::ActiveInfo),
            other => Err(ContractError::UnknownMessage(other)),
        }
    }
}
