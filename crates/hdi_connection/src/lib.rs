//! # HDI Connection
//!
//! Hardware connection abstraction for the sensor broker.
//!
//! Responsibilities:
//! - Define the `SensorDevice` backend trait
//! - Select the primary backend, falling back to the software backend
//! - Maintain the mock sensor set and route calls by sensor id
//! - Provide a scripted backend for tests

pub mod compatible;
pub mod connection;
pub mod device;
pub mod error;
pub mod scripted;

pub use compatible::{mock_descriptor, CompatibleConnection};
pub use connection::{DeviceFactory, HdiConnection};
pub use device::SensorDevice;
pub use error::{HdiError, Result};
pub use scripted::{DeviceCall, ScriptedConfig, ScriptedDevice};
