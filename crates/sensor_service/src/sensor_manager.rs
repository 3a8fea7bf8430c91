//! RateArbitrator - one hardware configuration per sensor
//!
//! Derives the merged sampling period and report delay from every
//! subscriber of a sensor and drives hardware enable/disable transitions.
//! A per-sensor operation lock serialises the bookkeeping + hardware
//! sequence of one sensor; the registry lock is only held for the
//! bookkeeping itself, never across a backend call.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use contracts::{DeviceCommand, Pid, SensorId, ServiceConfig};
use hdi_connection::HdiConnection;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, instrument, warn};

use crate::client_info::{ClientRegistry, SensorBasicInfo};
use crate::error::{Result, ServiceError};

/// Per-sensor aggregate of all subscribers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveSensorState {
    pub sensor_id: SensorId,
    pub merged_period_ns: i64,
    pub merged_delay_ns: i64,
    pub subscribers: BTreeSet<Pid>,
    pub hardware_enabled: bool,
    /// Registry generation this state was computed from
    pub generation: u64,
}

/// What `enable` changed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnableOutcome {
    /// The sensor was already running for other subscribers
    pub was_running: bool,
    /// The pid had no subscription to this sensor before
    pub newly_subscribed: bool,
    /// Batch parameters were reprogrammed
    pub reprogrammed: bool,
}

/// What `disable` changed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisableOutcome {
    pub info: SensorBasicInfo,
    /// The pid was the last subscriber and the sensor was switched off
    pub hardware_disabled: bool,
    pub reprogrammed: bool,
}

/// Rate arbitrator
pub struct RateArbitrator {
    hdi: Arc<HdiConnection>,
    registry: Arc<ClientRegistry>,
    config: ServiceConfig,
    op_locks: Mutex<HashMap<SensorId, Arc<Mutex<()>>>>,
    active: RwLock<HashMap<SensorId, ActiveSensorState>>,
}

impl RateArbitrator {
    pub fn new(hdi: Arc<HdiConnection>, registry: Arc<ClientRegistry>, config: ServiceConfig) -> Self {
        Self {
            hdi,
            registry,
            config,
            op_locks: Mutex::new(HashMap::new()),
            active: RwLock::new(HashMap::new()),
        }
    }

    /// Validate and normalise a request
    ///
    /// Zero period means hardware default. Returns the effective period.
    pub fn check_params(
        &self,
        sensor_id: SensorId,
        sampling_period_ns: i64,
        max_report_delay_ns: i64,
    ) -> Result<i64> {
        if !sensor_id.is_valid() || !self.hdi.has_sensor(sensor_id) {
            return Err(ServiceError::invalid_argument(format!(
                "unknown sensor {sensor_id}"
            )));
        }
        if sampling_period_ns < 0 || max_report_delay_ns < 0 {
            return Err(ServiceError::invalid_argument(format!(
                "negative period {sampling_period_ns} or delay {max_report_delay_ns}"
            )));
        }
        let period = if sampling_period_ns == 0 {
            self.config.default_sampling_period_ns
        } else {
            sampling_period_ns
        };
        if max_report_delay_ns / period > self.config.max_event_count {
            return Err(ServiceError::invalid_argument(format!(
                "delay {max_report_delay_ns} / period {period} exceeds {} buffered events",
                self.config.max_event_count
            )));
        }
        Ok(period)
    }

    /// Add or update a pid's subscription and reprogram the hardware
    ///
    /// The registry change is rolled back when the backend call fails.
    #[instrument(name = "arbitrator_enable", skip(self), fields(sensor_id = %sensor_id))]
    pub fn enable(
        &self,
        pid: Pid,
        sensor_id: SensorId,
        sampling_period_ns: i64,
        max_report_delay_ns: i64,
    ) -> Result<EnableOutcome> {
        let period = self.check_params(sensor_id, sampling_period_ns, max_report_delay_ns)?;
        let lock = self.op_lock(sensor_id);
        let _guard = lock.lock();

        let previous = self.registry.subscription(pid, sensor_id);
        let was_running = self.hardware_enabled(sensor_id);
        match previous {
            Some(_) => {
                self.registry
                    .update_subscription(pid, sensor_id, period, max_report_delay_ns)?;
            }
            None => {
                self.registry
                    .add_subscription(pid, sensor_id, period, max_report_delay_ns)?;
            }
        }

        let (merged_period, merged_delay) = self.merge(sensor_id);
        let programmed = self.programmed(sensor_id);

        let reprogrammed = if programmed == Some((merged_period, merged_delay)) {
            false
        } else {
            if let Err(e) = self.hdi.set_batch(sensor_id, merged_period, merged_delay) {
                self.rollback(pid, sensor_id, previous);
                return Err(ServiceError::hardware(sensor_id, e));
            }
            true
        };

        if !was_running {
            if let Err(e) = self.hdi.enable(sensor_id) {
                self.rollback(pid, sensor_id, previous);
                return Err(ServiceError::hardware(sensor_id, e));
            }
            info!(pid, sensor_id = %sensor_id, merged_period, merged_delay, "sensor enabled");
            observability::record_sensor_enabled(sensor_id.get(), true);
        }

        self.store_state(sensor_id, merged_period, merged_delay);
        debug!(
            pid,
            period,
            delay = max_report_delay_ns,
            merged_period,
            merged_delay,
            reprogrammed,
            "subscription applied"
        );
        Ok(EnableOutcome {
            was_running,
            newly_subscribed: previous.is_none(),
            reprogrammed,
        })
    }

    /// Remove a pid's subscription
    ///
    /// The last subscriber switches the sensor off; otherwise the merged
    /// parameters are recomputed from the remaining subscribers.
    #[instrument(name = "arbitrator_disable", skip(self), fields(sensor_id = %sensor_id))]
    pub fn disable(&self, pid: Pid, sensor_id: SensorId) -> Result<DisableOutcome> {
        let lock = self.op_lock(sensor_id);
        let _guard = lock.lock();

        let removed = self.registry.remove_subscription(pid, sensor_id, false)?;
        let info = removed.info;

        if !self.registry.sensor_state(sensor_id) {
            if let Err(e) = self.hdi.disable(sensor_id) {
                self.rollback(pid, sensor_id, Some(info));
                return Err(ServiceError::hardware(sensor_id, e));
            }
            self.active.write().remove(&sensor_id);
            self.registry.clear_data_queue(sensor_id);
            observability::record_sensor_enabled(sensor_id.get(), false);
            observability::record_active_sensors(self.active.read().len());
            info!(pid, sensor_id = %sensor_id, "sensor disabled");
            return Ok(DisableOutcome {
                info,
                hardware_disabled: true,
                reprogrammed: false,
            });
        }

        let (merged_period, merged_delay) = self.merge(sensor_id);
        let reprogrammed = if self.programmed(sensor_id) == Some((merged_period, merged_delay)) {
            false
        } else {
            if let Err(e) = self.hdi.set_batch(sensor_id, merged_period, merged_delay) {
                self.rollback(pid, sensor_id, Some(info));
                return Err(ServiceError::hardware(sensor_id, e));
            }
            true
        };
        self.store_state(sensor_id, merged_period, merged_delay);
        debug!(pid, merged_period, merged_delay, reprogrammed, "subscriber left");

        Ok(DisableOutcome {
            info,
            hardware_disabled: false,
            reprogrammed,
        })
    }

    /// Pass a reporting mode through to the backend
    pub fn set_mode(&self, sensor_id: SensorId, mode: i32) -> Result<()> {
        let lock = self.op_lock(sensor_id);
        let _guard = lock.lock();
        self.hdi
            .set_mode(sensor_id, mode)
            .map_err(|e| ServiceError::hardware(sensor_id, e))
    }

    /// Pass a device command through to the backend
    ///
    /// Issued without the operation lock: a flush answers through the data
    /// callback, possibly on this thread.
    pub fn run_command(&self, sensor_id: SensorId, cmd: DeviceCommand, param: i32) -> Result<()> {
        self.hdi
            .run_command(sensor_id, cmd, param)
            .map_err(|e| ServiceError::hardware(sensor_id, e))
    }

    /// Current aggregate for a sensor
    ///
    /// Recomputed from the registry when its generation moved on.
    pub fn active_state(&self, sensor_id: SensorId) -> Option<ActiveSensorState> {
        let generation = self.registry.generation(sensor_id);
        let mut state = self.active.read().get(&sensor_id).cloned()?;
        if state.generation != generation {
            let (period, delay) = self.merge(sensor_id);
            state.merged_period_ns = period;
            state.merged_delay_ns = delay;
            state.subscribers = self.registry.subscribers_of(sensor_id).into_iter().collect();
            state.generation = generation;
        }
        Some(state)
    }

    pub fn hardware_enabled(&self, sensor_id: SensorId) -> bool {
        self.active
            .read()
            .get(&sensor_id)
            .is_some_and(|state| state.hardware_enabled)
    }

    /// Sensors currently switched on
    pub fn enabled_sensors(&self) -> Vec<SensorId> {
        let mut ids: Vec<_> = self.active.read().keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }
}

impl RateArbitrator {
    fn op_lock(&self, sensor_id: SensorId) -> Arc<Mutex<()>> {
        self.op_locks.lock().entry(sensor_id).or_default().clone()
    }

    /// Fastest period and delay among the registered subscribers
    fn merge(&self, sensor_id: SensorId) -> (i64, i64) {
        let subscriptions = self.registry.subscriptions_of(sensor_id);
        let period = subscriptions
            .iter()
            .map(|(_, info)| info.sampling_period_ns)
            .min()
            .unwrap_or(self.config.default_sampling_period_ns);
        let delay = subscriptions
            .iter()
            .map(|(_, info)| info.max_report_delay_ns)
            .min()
            .unwrap_or(0);
        (period, delay)
    }

    fn programmed(&self, sensor_id: SensorId) -> Option<(i64, i64)> {
        self.active
            .read()
            .get(&sensor_id)
            .map(|state| (state.merged_period_ns, state.merged_delay_ns))
    }

    fn store_state(&self, sensor_id: SensorId, merged_period_ns: i64, merged_delay_ns: i64) {
        let state = ActiveSensorState {
            sensor_id,
            merged_period_ns,
            merged_delay_ns,
            subscribers: self.registry.subscribers_of(sensor_id).into_iter().collect(),
            hardware_enabled: true,
            generation: self.registry.generation(sensor_id),
        };
        let count = {
            let mut active = self.active.write();
            active.insert(sensor_id, state);
            active.len()
        };
        observability::record_active_sensors(count);
    }

    /// Restore the registry to what it was before a failed operation
    fn rollback(&self, pid: Pid, sensor_id: SensorId, previous: Option<SensorBasicInfo>) {
        let result = match previous {
            Some(info) => {
                if self.registry.subscription(pid, sensor_id).is_some() {
                    self.registry
                        .update_subscription(
                            pid,
                            sensor_id,
                            info.sampling_period_ns,
                            info.max_report_delay_ns,
                        )
                        .map(|_| ())
                } else {
                    self.registry.add_subscription(
                        pid,
                        sensor_id,
                        info.sampling_period_ns,
                        info.max_report_delay_ns,
                    )
                }
            }
            None => self
                .registry
                .remove_subscription(pid, sensor_id, false)
                .map(|_| ()),
        };
        if let Err(e) = result {
            warn!(pid, sensor_id = %sensor_id, error = %e, "rollback failed");
        } else {
            debug!(pid, sensor_id = %sensor_id, "subscription rolled back");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use contracts::{sensor_type, HdiConfig, SensorEvent};
    use hdi_connection::{DeviceCall, ScriptedConfig, ScriptedDevice, SensorDevice};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    const ACC: SensorId = sensor_type::ACCELEROMETER;
    const MS: i64 = 1_000_000;

    fn setup() -> (RateArbitrator, Arc<ScriptedDevice>, Arc<ClientRegistry>) {
        let device = Arc::new(ScriptedDevice::new(ScriptedConfig::with_sensors(
            "real",
            &[ACC, sensor_type::GYROSCOPE],
        )));
        let compatible = Arc::new(ScriptedDevice::new(ScriptedConfig::with_sensors(
            "compatible",
            &[],
        )));
        let hdi = Arc::new(HdiConnection::with_factory(
            device.clone(),
            Box::new(move || compatible.clone() as Arc<dyn SensorDevice>),
            &HdiConfig::default(),
        ));
        hdi.connect(Arc::new(|_: SensorEvent| {})).unwrap();
        let registry = Arc::new(ClientRegistry::new());
        let arbitrator = RateArbitrator::new(hdi, registry.clone(), ServiceConfig::default());
        (arbitrator, device, registry)
    }

    fn merged(arbitrator: &RateArbitrator) -> Option<(i64, i64)> {
        arbitrator
            .active_state(ACC)
            .map(|s| (s.merged_period_ns, s.merged_delay_ns))
    }

    #[test]
    fn test_fastest_subscriber_wins_and_reverts() {
        let (arbitrator, device, _) = setup();

        arbitrator.enable(100, ACC, 100 * MS, 100 * MS).unwrap();
        assert!(device.is_enabled(ACC));
        assert_eq!(merged(&arbitrator), Some((100 * MS, 100 * MS)));

        let outcome = arbitrator.enable(200, ACC, 50 * MS, 0).unwrap();
        assert!(outcome.was_running);
        assert!(outcome.reprogrammed);
        assert_eq!(merged(&arbitrator), Some((50 * MS, 0)));

        arbitrator.disable(200, ACC).unwrap();
        assert_eq!(merged(&arbitrator), Some((100 * MS, 100 * MS)));
        assert_eq!(device.last_batch(ACC), Some((100 * MS, 100 * MS)));
        assert!(device.is_enabled(ACC));
    }

    #[test]
    fn test_slower_subscriber_does_not_reprogram() {
        let (arbitrator, device, _) = setup();
        arbitrator.enable(1, ACC, 10 * MS, 0).unwrap();
        device.clear_calls();

        let outcome = arbitrator.enable(2, ACC, 100 * MS, 0).unwrap();
        assert!(!outcome.reprogrammed);
        assert!(device.calls().is_empty());
    }

    #[test]
    fn test_zero_period_uses_default() {
        let (arbitrator, device, registry) = setup();
        arbitrator.enable(1, ACC, 0, 0).unwrap();
        assert_eq!(device.last_batch(ACC), Some((200 * MS, 0)));
        assert_eq!(
            registry.subscription(1, ACC),
            Some(SensorBasicInfo::new(200 * MS, 0))
        );
    }

    #[test]
    fn test_invalid_requests_never_reach_hardware() {
        let (arbitrator, device, registry) = setup();

        for (period, delay) in [(-1, 0), (10, -1), (MS, 1001 * MS)] {
            assert!(matches!(
                arbitrator.enable(1, ACC, period, delay),
                Err(ServiceError::InvalidArgument(_))
            ));
        }
        assert!(matches!(
            arbitrator.enable(1, sensor_type::HEART_RATE, MS, 0),
            Err(ServiceError::InvalidArgument(_))
        ));
        assert!(device.calls().is_empty());
        assert!(registry.sensors_of(1).is_empty());
    }

    #[test]
    fn test_enable_failure_rolls_back() {
        let (arbitrator, device, registry) = setup();
        device.set_fail_enable(vec![ACC]);

        assert!(matches!(
            arbitrator.enable(1, ACC, 10 * MS, 0),
            Err(ServiceError::HardwareError { .. })
        ));
        assert!(registry.subscription(1, ACC).is_none());
        assert!(!arbitrator.hardware_enabled(ACC));
    }

    #[test]
    fn test_batch_failure_restores_previous_parameters() {
        let (arbitrator, device, registry) = setup();
        arbitrator.enable(1, ACC, 100 * MS, 0).unwrap();
        device.set_fail_set_batch(vec![ACC]);

        assert!(arbitrator.enable(1, ACC, 10 * MS, 0).is_err());
        assert_eq!(
            registry.subscription(1, ACC),
            Some(SensorBasicInfo::new(100 * MS, 0))
        );
        assert_eq!(merged(&arbitrator), Some((100 * MS, 0)));
    }

    #[test]
    fn test_disable_failure_keeps_subscription() {
        let (arbitrator, device, registry) = setup();
        arbitrator.enable(1, ACC, 100 * MS, 0).unwrap();
        device.set_fail_disable(vec![ACC]);

        assert!(arbitrator.disable(1, ACC).is_err());
        assert!(registry.subscription(1, ACC).is_some());
        assert!(device.is_enabled(ACC));
    }

    #[test]
    fn test_disable_unknown_pid_is_not_subscribed() {
        let (arbitrator, _, _) = setup();
        assert!(matches!(
            arbitrator.disable(9, ACC),
            Err(ServiceError::NotSubscribed { .. })
        ));
    }

    #[test]
    fn test_random_sequences_keep_minimum() {
        let (arbitrator, device, registry) = setup();
        let mut rng = StdRng::seed_from_u64(0x5eed);
        let periods = [5 * MS, 10 * MS, 20 * MS, 50 * MS, 100 * MS];

        for _ in 0..500 {
            let pid = rng.random_range(1..=6);
            if rng.random_bool(0.6) {
                let period = periods[rng.random_range(0..periods.len())];
                let delay = rng.random_range(0..4) * MS;
                arbitrator.enable(pid, ACC, period, delay).unwrap();
            } else {
                let _ = arbitrator.disable(pid, ACC);
            }

            let subscriptions = registry.subscriptions_of(ACC);
            let expected = subscriptions
                .iter()
                .map(|(_, info)| info.sampling_period_ns)
                .min();
            match expected {
                Some(period) => {
                    assert!(device.is_enabled(ACC));
                    assert_eq!(merged(&arbitrator).map(|m| m.0), Some(period));
                    assert_eq!(device.last_batch(ACC).map(|b| b.0), Some(period));
                }
                None => {
                    assert!(!device.is_enabled(ACC));
                    assert!(arbitrator.active_state(ACC).is_none());
                }
            }
        }

        let enables = device
            .calls_for(ACC)
            .iter()
            .filter(|c| matches!(c, DeviceCall::Enable(_)))
            .count();
        let disables = device
            .calls_for(ACC)
            .iter()
            .filter(|c| matches!(c, DeviceCall::Disable(_)))
            .count();
        assert!(enables - disables <= 1);
    }
}
