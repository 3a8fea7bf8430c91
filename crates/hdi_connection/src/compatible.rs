//! Software compatible backend
//!
//! Stands in for vendor hardware when it is unavailable, and serves every
//! injected mock sensor. Each enabled sensor gets a background thread that
//! emits a fixed sample at the programmed sampling period, in the same way
//! a real HAL callback would.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use contracts::{
    sensor_type, DeviceCommand, SensorDataCallback, SensorDescriptor, SensorEvent, SensorId,
};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, instrument, trace};

use crate::device::SensorDevice;
use crate::error::{HdiError, Result};

const BACKEND_NAME: &str = "compatible";
const DEFAULT_SAMPLING_PERIOD_NS: i64 = 200_000_000;
const MIN_SLEEP: Duration = Duration::from_millis(1);

const MOCK_MAX_RANGE: f32 = 9999.0;
const MOCK_POWER: f32 = 20.0;
const MOCK_RESOLUTION: f32 = 0.000001;
const MOCK_MIN_SAMPLE_PERIOD_NS: i64 = 100_000_000;
const MOCK_MAX_SAMPLE_PERIOD_NS: i64 = 1_000_000_000;
const MOCK_VERSION: &str = "1.0.1";

/// Sensors the compatible backend can produce data for
const SUPPORTED_SENSORS: [SensorId; 4] = [
    sensor_type::ACCELEROMETER,
    sensor_type::COLOR,
    sensor_type::SAR,
    sensor_type::POSTURE,
];

/// Descriptor advertised for an injected mock sensor
///
/// Returns `None` for ids the compatible backend cannot stand in for.
pub fn mock_descriptor(sensor_id: SensorId) -> Option<SensorDescriptor> {
    let (name, vendor) = match sensor_id {
        sensor_type::COLOR => ("sensor_color", "default_color"),
        sensor_type::SAR => ("sensor_sar", "default_sar"),
        sensor_type::POSTURE => ("sensor_posture", "default_posture"),
        _ => return None,
    };
    Some(SensorDescriptor {
        sensor_id,
        sensor_type_id: sensor_id,
        sensor_name: name.into(),
        vendor_name: vendor.into(),
        firmware_version: MOCK_VERSION.into(),
        hardware_version: MOCK_VERSION.into(),
        max_range: MOCK_MAX_RANGE,
        resolution: MOCK_RESOLUTION,
        power: MOCK_POWER,
        min_sample_period_ns: MOCK_MIN_SAMPLE_PERIOD_NS,
        max_sample_period_ns: MOCK_MAX_SAMPLE_PERIOD_NS,
        flags: 0,
    })
}

/// Fixed sample emitted for each supported sensor
fn sample_for(sensor_id: SensorId) -> Vec<u8> {
    let values: &[f32] = match sensor_id {
        sensor_type::COLOR => &[2.2, 3.3],
        sensor_type::SAR => &[8.8],
        sensor_type::POSTURE => &[9.8, 0.0, 0.0, 9.8, 0.0, 0.0, 180.0],
        _ => &[9.8, 0.0, 0.0],
    };
    bytemuck::cast_slice(values).to_vec()
}

/// Per-sensor reporting state
#[derive(Default)]
struct Reporter {
    period_ns: Arc<AtomicI64>,
    running: Option<Arc<AtomicBool>>,
}

/// Software backend
pub struct CompatibleConnection {
    connected: AtomicBool,
    callback: RwLock<Option<SensorDataCallback>>,
    reporters: Mutex<HashMap<SensorId, Reporter>>,
    start_time: Instant,
}

impl CompatibleConnection {
    pub fn new() -> Self {
        Self {
            connected: AtomicBool::new(false),
            callback: RwLock::new(None),
            reporters: Mutex::new(HashMap::new()),
            start_time: Instant::now(),
        }
    }

    /// Ids with a running reporter thread
    pub fn enabled_sensors(&self) -> Vec<SensorId> {
        let reporters = self.reporters.lock();
        let mut ids: Vec<_> = reporters
            .iter()
            .filter(|(_, r)| r.running.is_some())
            .map(|(id, _)| *id)
            .collect();
        ids.sort();
        ids
    }

    fn timestamp_ns(&self) -> i64 {
        self.start_time.elapsed().as_nanos() as i64
    }

    fn check_supported(&self, sensor_id: SensorId, op: &'static str) -> Result<()> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(HdiError::NotConnected(sensor_id));
        }
        if !SUPPORTED_SENSORS.contains(&sensor_id) {
            return Err(HdiError::device_op(
                BACKEND_NAME,
                sensor_id,
                op,
                "sensor not supported",
            ));
        }
        Ok(())
    }

    fn spawn_reporter(
        &self,
        sensor_id: SensorId,
        period_ns: Arc<AtomicI64>,
        running: Arc<AtomicBool>,
        callback: SensorDataCallback,
    ) {
        let start_time = self.start_time;
        let sample = sample_for(sensor_id);

        thread::spawn(move || {
            debug!(sensor_id = %sensor_id, "compatible reporter started");

            while running.load(Ordering::Relaxed) {
                let period = period_ns.load(Ordering::Relaxed).max(0) as u64;
                thread::sleep(Duration::from_nanos(period).max(MIN_SLEEP));
                if !running.load(Ordering::Relaxed) {
                    break;
                }

                let timestamp = start_time.elapsed().as_nanos() as i64;
                callback(SensorEvent::new(sensor_id, timestamp, sample.clone()));
                trace!(sensor_id = %sensor_id, timestamp, "compatible event sent");
            }

            debug!(sensor_id = %sensor_id, "compatible reporter stopped");
        });
    }
}

impl Default for CompatibleConnection {
    fn default() -> Self {
        Self::new()
    }
}

impl SensorDevice for CompatibleConnection {
    fn name(&self) -> &str {
        BACKEND_NAME
    }

    #[instrument(name = "compatible_connect", skip(self))]
    fn connect(&self) -> Result<()> {
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn sensor_list(&self) -> Result<Vec<SensorDescriptor>> {
        Ok(vec![SensorDescriptor {
            sensor_id: sensor_type::ACCELEROMETER,
            sensor_type_id: sensor_type::ACCELEROMETER,
            sensor_name: "sensor_test".into(),
            vendor_name: "default".into(),
            firmware_version: "1.0.0".into(),
            hardware_version: "1.0.0".into(),
            max_range: MOCK_MAX_RANGE,
            resolution: MOCK_RESOLUTION,
            power: 23.0,
            min_sample_period_ns: MOCK_MIN_SAMPLE_PERIOD_NS,
            max_sample_period_ns: MOCK_MAX_SAMPLE_PERIOD_NS,
            flags: 0,
        }])
    }

    #[instrument(name = "compatible_enable", skip(self), fields(sensor_id = %sensor_id))]
    fn enable(&self, sensor_id: SensorId) -> Result<()> {
        self.check_supported(sensor_id, "enable")?;

        let callback = self.callback.read().clone().ok_or_else(|| {
            HdiError::device_op(BACKEND_NAME, sensor_id, "enable", "no data callback")
        })?;

        let mut reporters = self.reporters.lock();
        let reporter = reporters.entry(sensor_id).or_insert_with(|| Reporter {
            period_ns: Arc::new(AtomicI64::new(DEFAULT_SAMPLING_PERIOD_NS)),
            running: None,
        });

        // 幂等：已启用则直接返回
        if reporter.running.is_some() {
            return Ok(());
        }

        let running = Arc::new(AtomicBool::new(true));
        reporter.running = Some(running.clone());
        let period_ns = reporter.period_ns.clone();
        drop(reporters);

        self.spawn_reporter(sensor_id, period_ns, running, callback);
        Ok(())
    }

    #[instrument(name = "compatible_disable", skip(self), fields(sensor_id = %sensor_id))]
    fn disable(&self, sensor_id: SensorId) -> Result<()> {
        self.check_supported(sensor_id, "disable")?;

        let mut reporters = self.reporters.lock();
        match reporters.get_mut(&sensor_id).and_then(|r| r.running.take()) {
            Some(running) => {
                running.store(false, Ordering::SeqCst);
                Ok(())
            }
            None => Err(HdiError::device_op(
                BACKEND_NAME,
                sensor_id,
                "disable",
                "sensor not enabled",
            )),
        }
    }

    fn set_batch(
        &self,
        sensor_id: SensorId,
        sampling_period_ns: i64,
        _max_report_delay_ns: i64,
    ) -> Result<()> {
        self.check_supported(sensor_id, "set_batch")?;

        let period = if sampling_period_ns <= 0 {
            DEFAULT_SAMPLING_PERIOD_NS
        } else {
            sampling_period_ns
        };

        let mut reporters = self.reporters.lock();
        reporters
            .entry(sensor_id)
            .or_default()
            .period_ns
            .store(period, Ordering::Relaxed);
        Ok(())
    }

    fn set_mode(&self, sensor_id: SensorId, _mode: i32) -> Result<()> {
        self.check_supported(sensor_id, "set_mode")
    }

    #[instrument(name = "compatible_run_command", skip(self), fields(sensor_id = %sensor_id, cmd = ?cmd))]
    fn run_command(&self, sensor_id: SensorId, cmd: DeviceCommand, _param: i32) -> Result<()> {
        self.check_supported(sensor_id, "run_command")?;

        match cmd {
            DeviceCommand::Flush => {
                // 无批处理缓冲，立即回报 flush 完成
                let callback = self.callback.read().clone();
                if let Some(callback) = callback {
                    callback(SensorEvent::flush_complete(sensor_id, self.timestamp_ns()));
                }
            }
            DeviceCommand::Reset => {
                let reporters = self.reporters.lock();
                if let Some(reporter) = reporters.get(&sensor_id) {
                    reporter
                        .period_ns
                        .store(DEFAULT_SAMPLING_PERIOD_NS, Ordering::Relaxed);
                }
            }
        }
        Ok(())
    }

    fn register_data_callback(&self, callback: SensorDataCallback) -> Result<()> {
        *self.callback.write() = Some(callback);
        Ok(())
    }

    #[instrument(name = "compatible_disconnect", skip(self))]
    fn disconnect(&self) -> Result<()> {
        self.connected.store(false, Ordering::SeqCst);
        let mut reporters = self.reporters.lock();
        for reporter in reporters.values_mut() {
            if let Some(running) = reporter.running.take() {
                running.store(false, Ordering::SeqCst);
            }
        }
        Ok(())
    }
}
