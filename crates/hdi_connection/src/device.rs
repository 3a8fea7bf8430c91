//! Sensor backend abstraction
//!
//! Defines the trait every hardware backend implements, so that vendor
//! hardware, the software compatible backend and scripted test doubles
//! are interchangeable behind `HdiConnection`.

use contracts::{DeviceCommand, SensorDataCallback, SensorDescriptor, SensorId};

use crate::error::Result;

/// Sensor backend trait
///
/// All methods take `&self`; backends keep their own interior state so a
/// single instance can be shared between request threads.
pub trait SensorDevice: Send + Sync {
    /// Backend name, used in logs and errors
    fn name(&self) -> &str;

    /// Open the backend
    fn connect(&self) -> Result<()>;

    /// Sensors exposed by this backend
    fn sensor_list(&self) -> Result<Vec<SensorDescriptor>>;

    /// Start reporting for a sensor
    fn enable(&self, sensor_id: SensorId) -> Result<()>;

    /// Stop reporting for a sensor
    fn disable(&self, sensor_id: SensorId) -> Result<()>;

    /// Program sampling period and maximum report delay (ns)
    fn set_batch(&self, sensor_id: SensorId, sampling_period_ns: i64, max_report_delay_ns: i64)
        -> Result<()>;

    /// Program reporting mode
    fn set_mode(&self, sensor_id: SensorId, mode: i32) -> Result<()>;

    /// Run a device command
    ///
    /// `DeviceCommand::Flush` must eventually produce a flush-complete
    /// event through the registered data callback.
    fn run_command(&self, sensor_id: SensorId, cmd: DeviceCommand, param: i32) -> Result<()>;

    /// Register the data callback
    ///
    /// Called once after `connect`. Events may arrive on any thread.
    fn register_data_callback(&self, callback: SensorDataCallback) -> Result<()>;

    /// Close the backend and stop all reporting
    fn disconnect(&self) -> Result<()>;
}
