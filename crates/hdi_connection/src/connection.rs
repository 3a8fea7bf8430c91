//! Routing connection over the primary and compatible backends
//!
//! Owns the backend selection at startup and the mock set afterwards.
//! Every per-sensor call is dispatched by id: mocked ids go to the
//! compatible backend, everything else to the primary.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use contracts::{
    BackendKind, DeviceCommand, HdiConfig, SensorDataCallback, SensorDescriptor, SensorId,
};
use parking_lot::RwLock;
use tracing::{debug, info, instrument, warn};

use crate::compatible::{mock_descriptor, CompatibleConnection};
use crate::device::SensorDevice;
use crate::error::{HdiError, Result};

/// Builds a fresh compatible backend on demand
pub type DeviceFactory = Box<dyn Fn() -> Arc<dyn SensorDevice> + Send + Sync>;

/// Real sensors reported by the primary backend
#[derive(Default)]
struct SensorTable {
    list: Vec<SensorDescriptor>,
    ids: HashSet<SensorId>,
}

/// Hardware connection
pub struct HdiConnection {
    real: Arc<dyn SensorDevice>,
    compatible_factory: DeviceFactory,
    backend: BackendKind,
    supported_mocks: Vec<SensorId>,
    primary: RwLock<Option<Arc<dyn SensorDevice>>>,
    compatible: RwLock<Option<Arc<dyn SensorDevice>>>,
    sensors: RwLock<SensorTable>,
    mocks: RwLock<BTreeSet<SensorId>>,
}

impl HdiConnection {
    /// Create a connection over a vendor backend
    ///
    /// The compatible backend is built lazily with `CompatibleConnection::new`.
    pub fn new(real: Arc<dyn SensorDevice>, config: &HdiConfig) -> Self {
        Self::with_factory(
            real,
            Box::new(|| Arc::new(CompatibleConnection::new()) as Arc<dyn SensorDevice>),
            config,
        )
    }

    /// Create a connection with a custom compatible backend factory
    pub fn with_factory(
        real: Arc<dyn SensorDevice>,
        compatible_factory: DeviceFactory,
        config: &HdiConfig,
    ) -> Self {
        Self {
            real,
            compatible_factory,
            backend: config.backend,
            supported_mocks: config.supported_mock_sensors.clone(),
            primary: RwLock::new(None),
            compatible: RwLock::new(None),
            sensors: RwLock::new(SensorTable::default()),
            mocks: RwLock::new(BTreeSet::new()),
        }
    }

    /// Select and open backends, then register the data callback on each
    ///
    /// Falls back to the compatible backend when the real one cannot be
    /// opened. When the primary lacks any supported mock sensor, a separate
    /// compatible backend is opened for mock routing.
    #[instrument(name = "hdi_connect", skip(self, callback), fields(backend = ?self.backend))]
    pub fn connect(&self, callback: SensorDataCallback) -> Result<()> {
        let primary = match self.backend {
            BackendKind::Real => match self.open(self.real.clone()) {
                Ok(()) => self.real.clone(),
                Err(e) => {
                    warn!(error = %e, "real backend unavailable, falling back to compatible");
                    let fallback = (self.compatible_factory)();
                    self.open(fallback.clone())?;
                    fallback
                }
            },
            BackendKind::Compatible => {
                let compatible = (self.compatible_factory)();
                self.open(compatible.clone())?;
                compatible
            }
        };

        let list = primary.sensor_list()?;
        {
            let mut sensors = self.sensors.write();
            sensors.ids = list.iter().map(|s| s.sensor_id).collect();
            sensors.list = list;
        }
        primary.register_data_callback(callback.clone())?;
        info!(
            backend = primary.name(),
            sensor_count = self.sensors.read().list.len(),
            "primary backend connected"
        );
        *self.primary.write() = Some(primary);

        if !self.all_in_sensor_set(&self.supported_mocks) {
            debug!("primary lacks some mockable sensors, connecting compatible backend");
            let compatible = (self.compatible_factory)();
            self.open(compatible.clone())?;
            compatible.register_data_callback(callback)?;
            *self.compatible.write() = Some(compatible);
        }
        Ok(())
    }

    /// Close every backend
    pub fn disconnect(&self) -> Result<()> {
        if let Some(compatible) = self.compatible.write().take() {
            compatible.disconnect()?;
        }
        if let Some(primary) = self.primary.write().take() {
            primary.disconnect()?;
        }
        Ok(())
    }

    /// Real sensors plus generated descriptors for every mocked id
    pub fn list_sensors(&self) -> Vec<SensorDescriptor> {
        let mut list = self.sensors.read().list.clone();
        let mocks = self.mocks.read();
        list.extend(mocks.iter().filter_map(|id| mock_descriptor(*id)));
        list
    }

    /// Whether a sensor is served by either backend
    pub fn has_sensor(&self, sensor_id: SensorId) -> bool {
        self.sensors.read().ids.contains(&sensor_id) || self.is_mocked(sensor_id)
    }

    pub fn is_mocked(&self, sensor_id: SensorId) -> bool {
        self.mocks.read().contains(&sensor_id)
    }

    /// Currently injected mock ids
    pub fn mocked_sensors(&self) -> Vec<SensorId> {
        self.mocks.read().iter().copied().collect()
    }

    #[instrument(name = "hdi_inject_mock", skip(self), fields(sensor_id = %sensor_id))]
    pub fn inject_mock(&self, sensor_id: SensorId) -> Result<()> {
        if self.sensors.read().ids.contains(&sensor_id) {
            return Err(HdiError::AlreadyPresent(sensor_id));
        }
        if !self.supported_mocks.contains(&sensor_id) || mock_descriptor(sensor_id).is_none() {
            return Err(HdiError::Unsupported(sensor_id));
        }
        if self.compatible.read().is_none() {
            return Err(HdiError::NotConnected(sensor_id));
        }
        if !self.mocks.write().insert(sensor_id) {
            return Err(HdiError::AlreadyPresent(sensor_id));
        }
        info!(sensor_id = %sensor_id, "mock sensor injected");
        Ok(())
    }

    #[instrument(name = "hdi_uninject_mock", skip(self), fields(sensor_id = %sensor_id))]
    pub fn uninject_mock(&self, sensor_id: SensorId) -> Result<()> {
        if !self.mocks.write().remove(&sensor_id) {
            return Err(HdiError::MockNotFound(sensor_id));
        }
        info!(sensor_id = %sensor_id, "mock sensor removed");
        Ok(())
    }

    pub fn enable(&self, sensor_id: SensorId) -> Result<()> {
        self.route(sensor_id)?.enable(sensor_id)
    }

    pub fn disable(&self, sensor_id: SensorId) -> Result<()> {
        self.route(sensor_id)?.disable(sensor_id)
    }

    pub fn set_batch(
        &self,
        sensor_id: SensorId,
        sampling_period_ns: i64,
        max_report_delay_ns: i64,
    ) -> Result<()> {
        self.route(sensor_id)?
            .set_batch(sensor_id, sampling_period_ns, max_report_delay_ns)
    }

    pub fn set_mode(&self, sensor_id: SensorId, mode: i32) -> Result<()> {
        self.route(sensor_id)?.set_mode(sensor_id, mode)
    }

    pub fn run_command(&self, sensor_id: SensorId, cmd: DeviceCommand, param: i32) -> Result<()> {
        self.route(sensor_id)?.run_command(sensor_id, cmd, param)
    }
}

impl HdiConnection {
    fn open(&self, device: Arc<dyn SensorDevice>) -> Result<()> {
        device.connect()
    }

    fn all_in_sensor_set(&self, ids: &[SensorId]) -> bool {
        let sensors = self.sensors.read();
        ids.iter().all(|id| sensors.ids.contains(id))
    }

    /// Backend serving a sensor id
    fn route(&self, sensor_id: SensorId) -> Result<Arc<dyn SensorDevice>> {
        if self.is_mocked(sensor_id) {
            return self
                .compatible
                .read()
                .clone()
                .ok_or(HdiError::NotConnected(sensor_id));
        }
        if !self.sensors.read().ids.contains(&sensor_id) {
            return Err(HdiError::SensorNotFound(sensor_id));
        }
        self.primary
            .read()
            .clone()
            .ok_or(HdiError::NotConnected(sensor_id))
    }
}
