//! Hardware connection error types

use contracts::{ContractError, SensorId};
use thiserror::Error;

/// Hardware connection specific error
#[derive(Debug, Error)]
pub enum HdiError {
    /// Backend refused the connection
    #[error("failed to connect backend '{backend}': {message}")]
    ConnectFailed { backend: String, message: String },

    /// No backend is connected for this sensor
    #[error("no backend connected for sensor {0}")]
    NotConnected(SensorId),

    /// Backend rejected a per-sensor operation
    #[error("backend '{backend}' failed {op} on sensor {sensor_id}: {message}")]
    DeviceOp {
        backend: String,
        sensor_id: SensorId,
        op: &'static str,
        message: String,
    },

    /// Sensor is not served by any backend
    #[error("sensor {0} not found")]
    SensorNotFound(SensorId),

    /// Mock injection for an id already present as real hardware or mock
    #[error("sensor {0} already present")]
    AlreadyPresent(SensorId),

    /// Mock injection for an id outside the supported mock set
    #[error("sensor {0} cannot be mocked")]
    Unsupported(SensorId),

    /// Uninjection for an id that is not mocked
    #[error("sensor {0} is not mocked")]
    MockNotFound(SensorId),

    /// Wrapped ContractError
    #[error(transparent)]
    Contract(#[from] ContractError),
}

impl HdiError {
    /// Create connect error
    pub fn connect_failed(backend: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ConnectFailed {
            backend: backend.into(),
            message: message.into(),
        }
    }

    /// Create per-sensor operation error
    pub fn device_op(
        backend: impl Into<String>,
        sensor_id: SensorId,
        op: &'static str,
        message: impl Into<String>,
    ) -> Self {
        Self::DeviceOp {
            backend: backend.into(),
            sensor_id,
            op,
            message: message.into(),
        }
    }
}

/// Result alias
pub type Result<T> = std::result::Result<T, HdiError>;
