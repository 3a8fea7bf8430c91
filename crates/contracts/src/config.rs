//! Broker configuration contracts
//!
//! Loaded by `config_loader`, consumed by the service, transport and
//! connection layers. Every field has a default so an empty file is valid.

use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::{sensor_type, SensorId};

/// Top-level broker configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, Validate)]
pub struct BrokerConfig {
    /// Subscription arbitration settings
    #[serde(default)]
    #[validate(nested)]
    pub service: ServiceConfig,

    /// Streaming transport settings
    #[serde(default)]
    #[validate(nested)]
    pub transport: TransportConfig,

    /// Hardware connection settings
    #[serde(default)]
    #[validate(nested)]
    pub hdi: HdiConfig,
}

/// Subscription arbitration settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct ServiceConfig {
    /// Period used when a client asks for 0 (hardware default)
    #[serde(default = "default_sampling_period_ns")]
    #[validate(range(min = 1))]
    pub default_sampling_period_ns: i64,

    /// Upper bound on `max_report_delay / sampling_period`
    #[serde(default = "default_max_event_count")]
    #[validate(range(min = 1))]
    pub max_event_count: i64,

    /// Capacity of the hardware event queue feeding the dispatcher
    #[serde(default = "default_event_queue_capacity")]
    #[validate(range(min = 1))]
    pub event_queue_capacity: usize,

    /// Sensors never suspended with their owning process
    #[serde(default = "default_freezing_exempt")]
    pub freezing_exempt: Vec<SensorId>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            default_sampling_period_ns: default_sampling_period_ns(),
            max_event_count: default_max_event_count(),
            event_queue_capacity: default_event_queue_capacity(),
            freezing_exempt: default_freezing_exempt(),
        }
    }
}

/// Streaming transport settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct TransportConfig {
    /// Largest payload a frame header may declare before the receive
    /// buffer is treated as corrupt
    #[serde(default = "default_max_packet_size")]
    #[validate(range(min = 1))]
    pub max_packet_size: u32,

    /// Frames parsed per readiness notification
    #[serde(default = "default_once_process_limit")]
    #[validate(range(min = 1))]
    pub once_process_limit: usize,

    /// Readiness wait timeout
    #[serde(default = "default_poll_timeout_ms")]
    #[validate(range(min = 1))]
    pub poll_timeout_ms: u64,

    /// Send attempts on `WouldBlock` before the remainder is queued
    #[serde(default = "default_send_retry_limit")]
    #[validate(range(min = 1))]
    pub send_retry_limit: usize,

    /// Pending-write queue capacity per channel (bytes)
    #[serde(default = "default_pending_queue_capacity")]
    #[validate(range(min = 64))]
    pub pending_queue_capacity: usize,

    /// Bytes pulled from the socket per read call
    #[serde(default = "default_read_chunk")]
    #[validate(range(min = 16))]
    pub read_chunk: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_packet_size: default_max_packet_size(),
            once_process_limit: default_once_process_limit(),
            poll_timeout_ms: default_poll_timeout_ms(),
            send_retry_limit: default_send_retry_limit(),
            pending_queue_capacity: default_pending_queue_capacity(),
            read_chunk: default_read_chunk(),
        }
    }
}

/// Which backend the connection layer tries first
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Vendor hardware; falls back to compatible on connect failure
    #[default]
    Real,
    /// Software backend only
    Compatible,
}

/// Hardware connection settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct HdiConfig {
    /// Preferred primary backend
    #[serde(default)]
    pub backend: BackendKind,

    /// Sensor ids that may be injected as mocks
    #[serde(default = "default_supported_mock_sensors")]
    pub supported_mock_sensors: Vec<SensorId>,

    /// Mocks injected at startup
    #[serde(default)]
    pub inject_on_start: Vec<SensorId>,
}

impl Default for HdiConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            supported_mock_sensors: default_supported_mock_sensors(),
            inject_on_start: Vec::new(),
        }
    }
}

fn default_sampling_period_ns() -> i64 {
    200_000_000
}

fn default_max_event_count() -> i64 {
    1000
}

fn default_event_queue_capacity() -> usize {
    1024
}

fn default_freezing_exempt() -> Vec<SensorId> {
    sensor_type::FREEZING_EXEMPT.to_vec()
}

fn default_max_packet_size() -> u32 {
    256
}

fn default_once_process_limit() -> usize {
    100
}

fn default_poll_timeout_ms() -> u64 {
    100
}

fn default_send_retry_limit() -> usize {
    5
}

fn default_pending_queue_capacity() -> usize {
    64 * 1024
}

fn default_read_chunk() -> usize {
    4096
}

fn default_supported_mock_sensors() -> Vec<SensorId> {
    sensor_type::SUPPORTED_MOCK_SENSORS.to_vec()
}
