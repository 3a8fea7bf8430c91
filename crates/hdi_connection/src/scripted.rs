//! Scripted backend
//!
//! Test double that records every call and fails on demand.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};

use contracts::{DeviceCommand, SensorDataCallback, SensorDescriptor, SensorEvent, SensorId};
use parking_lot::{Mutex, RwLock};
use tracing::instrument;

use crate::device::SensorDevice;
use crate::error::{HdiError, Result};

/// Scripted backend configuration
#[derive(Debug, Default, Clone)]
pub struct ScriptedConfig {
    /// Backend name
    pub name: String,
    /// Sensors reported by `sensor_list`
    pub sensors: Vec<SensorDescriptor>,
    /// `connect` fails
    pub fail_connect: bool,
    /// Sensor ids whose `enable` fails
    pub fail_enable: Vec<SensorId>,
    /// Sensor ids whose `disable` fails
    pub fail_disable: Vec<SensorId>,
    /// Sensor ids whose `set_batch` fails
    pub fail_set_batch: Vec<SensorId>,
    /// Sensor ids whose `run_command` fails
    pub fail_command: Vec<SensorId>,
    /// Answer `DeviceCommand::Flush` with an immediate completion event
    pub auto_flush_complete: bool,
}

impl ScriptedConfig {
    /// Config exposing the given sensors with default descriptors
    pub fn with_sensors(name: impl Into<String>, ids: &[SensorId]) -> Self {
        Self {
            name: name.into(),
            sensors: ids.iter().map(|id| descriptor(*id)).collect(),
            auto_flush_complete: true,
            ..Default::default()
        }
    }
}

/// Plain descriptor for a scripted sensor
pub fn descriptor(sensor_id: SensorId) -> SensorDescriptor {
    SensorDescriptor {
        sensor_id,
        sensor_type_id: sensor_id,
        sensor_name: format!("scripted_{sensor_id}"),
        vendor_name: "scripted".into(),
        firmware_version: "1.0.0".into(),
        hardware_version: "1.0.0".into(),
        max_range: 100.0,
        resolution: 0.01,
        power: 1.0,
        min_sample_period_ns: 1_000_000,
        max_sample_period_ns: 1_000_000_000,
        flags: 0,
    }
}

/// One recorded backend call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceCall {
    Enable(SensorId),
    Disable(SensorId),
    SetBatch(SensorId, i64, i64),
    SetMode(SensorId, i32),
    Command(SensorId, DeviceCommand),
}

/// Scripted backend
pub struct ScriptedDevice {
    config: Mutex<ScriptedConfig>,
    connected: AtomicBool,
    enabled: Mutex<HashSet<SensorId>>,
    calls: Mutex<Vec<DeviceCall>>,
    callback: RwLock<Option<SensorDataCallback>>,
}

impl ScriptedDevice {
    pub fn new(config: ScriptedConfig) -> Self {
        Self {
            config: Mutex::new(config),
            connected: AtomicBool::new(false),
            enabled: Mutex::new(HashSet::new()),
            calls: Mutex::new(Vec::new()),
            callback: RwLock::new(None),
        }
    }

    /// Every call recorded so far, in order
    pub fn calls(&self) -> Vec<DeviceCall> {
        self.calls.lock().clone()
    }

    /// Recorded calls touching one sensor
    pub fn calls_for(&self, sensor_id: SensorId) -> Vec<DeviceCall> {
        self.calls
            .lock()
            .iter()
            .copied()
            .filter(|call| match call {
                DeviceCall::Enable(id)
                | DeviceCall::Disable(id)
                | DeviceCall::SetBatch(id, _, _)
                | DeviceCall::SetMode(id, _)
                | DeviceCall::Command(id, _) => *id == sensor_id,
            })
            .collect()
    }

    /// Last batch programmed for a sensor
    pub fn last_batch(&self, sensor_id: SensorId) -> Option<(i64, i64)> {
        self.calls.lock().iter().rev().find_map(|call| match call {
            DeviceCall::SetBatch(id, period, delay) if *id == sensor_id => Some((*period, *delay)),
            _ => None,
        })
    }

    pub fn clear_calls(&self) {
        self.calls.lock().clear();
    }

    pub fn is_enabled(&self, sensor_id: SensorId) -> bool {
        self.enabled.lock().contains(&sensor_id)
    }

    pub fn enabled_count(&self) -> usize {
        self.enabled.lock().len()
    }

    /// Change failure injection at runtime
    pub fn set_fail_enable(&self, ids: Vec<SensorId>) {
        self.config.lock().fail_enable = ids;
    }

    pub fn set_fail_disable(&self, ids: Vec<SensorId>) {
        self.config.lock().fail_disable = ids;
    }

    pub fn set_fail_set_batch(&self, ids: Vec<SensorId>) {
        self.config.lock().fail_set_batch = ids;
    }

    pub fn set_fail_command(&self, ids: Vec<SensorId>) {
        self.config.lock().fail_command = ids;
    }

    /// Push an event through the registered callback, as hardware would
    pub fn emit(&self, event: SensorEvent) {
        let callback = self.callback.read().clone();
        if let Some(callback) = callback {
            callback(event);
        }
    }

    fn record(&self, call: DeviceCall) {
        self.calls.lock().push(call);
    }

    fn fail_if(&self, listed: bool, sensor_id: SensorId, op: &'static str) -> Result<()> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(HdiError::NotConnected(sensor_id));
        }
        if listed {
            return Err(HdiError::device_op(
                self.config.lock().name.clone(),
                sensor_id,
                op,
                "scripted failure",
            ));
        }
        Ok(())
    }
}

impl SensorDevice for ScriptedDevice {
    fn name(&self) -> &str {
        "scripted"
    }

    #[instrument(name = "scripted_connect", skip(self))]
    fn connect(&self) -> Result<()> {
        let config = self.config.lock();
        if config.fail_connect {
            return Err(HdiError::connect_failed(&config.name, "scripted failure"));
        }
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn sensor_list(&self) -> Result<Vec<SensorDescriptor>> {
        Ok(self.config.lock().sensors.clone())
    }

    fn enable(&self, sensor_id: SensorId) -> Result<()> {
        self.record(DeviceCall::Enable(sensor_id));
        let listed = self.config.lock().fail_enable.contains(&sensor_id);
        self.fail_if(listed, sensor_id, "enable")?;
        self.enabled.lock().insert(sensor_id);
        Ok(())
    }

    fn disable(&self, sensor_id: SensorId) -> Result<()> {
        self.record(DeviceCall::Disable(sensor_id));
        let listed = self.config.lock().fail_disable.contains(&sensor_id);
        self.fail_if(listed, sensor_id, "disable")?;
        self.enabled.lock().remove(&sensor_id);
        Ok(())
    }

    fn set_batch(
        &self,
        sensor_id: SensorId,
        sampling_period_ns: i64,
        max_report_delay_ns: i64,
    ) -> Result<()> {
        self.record(DeviceCall::SetBatch(
            sensor_id,
            sampling_period_ns,
            max_report_delay_ns,
        ));
        let listed = self.config.lock().fail_set_batch.contains(&sensor_id);
        self.fail_if(listed, sensor_id, "set_batch")
    }

    fn set_mode(&self, sensor_id: SensorId, mode: i32) -> Result<()> {
        self.record(DeviceCall::SetMode(sensor_id, mode));
        self.fail_if(false, sensor_id, "set_mode")
    }

    fn run_command(&self, sensor_id: SensorId, cmd: DeviceCommand, _param: i32) -> Result<()> {
        self.record(DeviceCall::Command(sensor_id, cmd));
        let (listed, auto_flush) = {
            let config = self.config.lock();
            (config.fail_command.contains(&sensor_id), config.auto_flush_complete)
        };
        self.fail_if(listed, sensor_id, "run_command")?;
        if cmd == DeviceCommand::Flush && auto_flush {
            self.emit(SensorEvent::flush_complete(sensor_id, 0));
        }
        Ok(())
    }

    fn register_data_callback(&self, callback: SensorDataCallback) -> Result<()> {
        *self.callback.write() = Some(callback);
        Ok(())
    }

    fn disconnect(&self) -> Result<()> {
        self.connected.store(false, Ordering::SeqCst);
        self.enabled.lock().clear();
        Ok(())
    }
}
