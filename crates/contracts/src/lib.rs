//! # Contracts
//!
//! Frozen interface contracts shared by every broker crate.
//! Business crates depend on this crate only, never on each other's internals.
//!
//! ## Identity Model
//! - Sensors are identified by a stable integer `SensorId`
//! - Clients are identified by the calling `Pid` / `Uid` supplied by the IPC layer

mod active_info;
mod config;
mod device;
mod error;
mod message;
mod sensor;
mod sensor_id;

pub use active_info::*;
pub use config::*;
pub use device::*;
pub use error::*;
pub use message::*;
pub use sensor::*;
pub use sensor_id::{sensor_type, SensorId};

/// Process id of a client, as reported by the IPC layer
pub type Pid = i32;

/// User id of a client, as reported by the IPC layer
pub type Uid = i32;
