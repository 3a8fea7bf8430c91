//! Sensor metadata and hardware events
//!
//! `SensorDescriptor` is produced once per backend at connection time,
//! `SensorEvent` is produced by the backend's data callback.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::SensorId;

/// Reporting mode flag: the sensor only reports on value change.
pub const SENSOR_ON_CHANGE: u32 = 1 << 0;

/// Event option bit set by a backend on the event that completes a flush.
pub const FLUSH_COMPLETE_OPTION: i32 = 1 << 0;

/// Immutable hardware sensor metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorDescriptor {
    /// Sensor ID (equals the type id)
    pub sensor_id: SensorId,

    /// Sensor type ID
    pub sensor_type_id: SensorId,

    /// Human readable name
    pub sensor_name: String,

    /// Vendor name
    pub vendor_name: String,

    /// Firmware version
    pub firmware_version: String,

    /// Hardware version
    pub hardware_version: String,

    /// Maximum measurable value
    pub max_range: f32,

    /// Smallest distinguishable step
    pub resolution: f32,

    /// Power draw (mA)
    pub power: f32,

    /// Fastest supported sampling period (ns)
    pub min_sample_period_ns: i64,

    /// Slowest supported sampling period (ns)
    pub max_sample_period_ns: i64,

    /// Reporting mode flags (`SENSOR_ON_CHANGE`, ...)
    #[serde(default)]
    pub flags: u32,
}

impl SensorDescriptor {
    /// Whether this sensor only reports on change.
    ///
    /// On-change sensors get their last stored event replayed to a client
    /// that subscribes while the sensor is already running.
    pub fn is_on_change(&self) -> bool {
        self.flags & SENSOR_ON_CHANGE == SENSOR_ON_CHANGE
    }
}

/// One event produced by a backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorEvent {
    /// Originating sensor
    pub sensor_id: SensorId,

    /// Event layout version
    pub version: i32,

    /// Hardware timestamp (ns)
    pub timestamp: i64,

    /// Option bits (`FLUSH_COMPLETE_OPTION`, ...)
    pub option: i32,

    /// Reporting mode at the time of the event
    pub mode: i32,

    /// Raw sample bytes
    #[serde(with = "serde_bytes")]
    pub data: Vec<u8>,
}

impl SensorEvent {
    /// Create a data event
    pub fn new(sensor_id: SensorId, timestamp: i64, data: impl Into<Bytes>) -> Self {
        Self {
            sensor_id,
            version: 0,
            timestamp,
            option: 0,
            mode: 0,
            data: data.into().to_vec(),
        }
    }

    /// Create the marker event a backend emits once a flush has drained
    pub fn flush_complete(sensor_id: SensorId, timestamp: i64) -> Self {
        Self {
            sensor_id,
            version: 0,
            timestamp,
            option: FLUSH_COMPLETE_OPTION,
            mode: 0,
            data: Vec::new(),
        }
    }

    /// Whether this event marks a completed flush rather than sample data
    pub fn is_flush_complete(&self) -> bool {
        self.option & FLUSH_COMPLETE_OPTION == FLUSH_COMPLETE_OPTION
    }
}
