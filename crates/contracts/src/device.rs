//! Shared device-side types
//!
//! The backend trait itself lives in `hdi_connection`; the callback and
//! command types are here so the service can name them without pulling
//! in a backend.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::SensorEvent;

/// Hardware data callback type
///
/// A backend calls this from its own thread for every produced event,
/// including flush-complete markers.
pub type SensorDataCallback = Arc<dyn Fn(SensorEvent) + Send + Sync>;

/// Commands passed through `run_command`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceCommand {
    /// Drain the batch FIFO; the backend answers with a flush-complete event
    Flush,
    /// Reset the sensor to its power-on parameters
    Reset,
}
