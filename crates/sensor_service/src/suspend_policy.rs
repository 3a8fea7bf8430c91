//! SuspendPolicy - freeze and restore one process's subscriptions
//!
//! Suspending records each subscription into the pid's snapshot and removes
//! the pid's contribution through the arbitrator, so shared sensors keep
//! running for other pids. Resuming re-subscribes with the saved parameters
//! and drops an entry only once it is active again.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use contracts::{ActiveInfo, Pid, SensorId};
use parking_lot::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::client_info::{ClientRegistry, SensorBasicInfo};
use crate::error::{BulkOutcome, Result, ServiceError};
use crate::sensor_manager::RateArbitrator;

/// Saved parameters of one suspended pid
pub type SuspendSnapshot = BTreeMap<SensorId, SensorBasicInfo>;

/// Suspend/resume policy
pub struct SuspendPolicy {
    arbitrator: Arc<RateArbitrator>,
    registry: Arc<ClientRegistry>,
    freezing_exempt: HashSet<SensorId>,
    snapshots: Mutex<HashMap<Pid, SuspendSnapshot>>,
}

impl SuspendPolicy {
    pub fn new(
        arbitrator: Arc<RateArbitrator>,
        registry: Arc<ClientRegistry>,
        freezing_exempt: impl IntoIterator<Item = SensorId>,
    ) -> Self {
        Self {
            arbitrator,
            registry,
            freezing_exempt: freezing_exempt.into_iter().collect(),
            snapshots: Mutex::new(HashMap::new()),
        }
    }

    /// Sensors that are never suspended
    pub fn is_freezing_exempt(&self, sensor_id: SensorId) -> bool {
        self.freezing_exempt.contains(&sensor_id)
    }

    /// Suspend every non-exempt sensor of `pid`
    ///
    /// A pid that is already suspended only retries the sensors still
    /// active and merges them into its existing snapshot.
    #[instrument(name = "suspend_sensors", skip(self))]
    pub fn suspend(&self, pid: Pid) -> BulkOutcome<SensorId> {
        let mut snapshots = self.snapshots.lock();
        let sensors: Vec<_> = self
            .registry
            .sensors_of(pid)
            .into_iter()
            .filter(|id| !self.is_freezing_exempt(*id))
            .collect();

        let mut outcome = BulkOutcome::default();
        if sensors.is_empty() {
            if snapshots.contains_key(&pid) {
                debug!("already suspended, nothing left to suspend");
            } else {
                debug!("no suspendable sensors");
            }
            return outcome;
        }

        let snapshot = snapshots.entry(pid).or_default();
        for sensor_id in sensors {
            match self.arbitrator.disable(pid, sensor_id) {
                Ok(disabled) => {
                    snapshot.insert(sensor_id, disabled.info);
                    debug!(
                        sensor_id = %sensor_id,
                        hardware_disabled = disabled.hardware_disabled,
                        "sensor suspended"
                    );
                    outcome.push_ok(sensor_id);
                }
                Err(e) => {
                    warn!(sensor_id = %sensor_id, error = %e, "suspend failed");
                    outcome.push_err(sensor_id, e);
                }
            }
        }

        info!(
            suspended = outcome.succeeded.len(),
            failed = outcome.failed.len(),
            "pid suspended"
        );
        outcome
    }

    /// Restore every sensor in the pid's snapshot
    ///
    /// Entries that fail stay in the snapshot for a later attempt.
    #[instrument(name = "resume_sensors", skip(self))]
    pub fn resume(&self, pid: Pid) -> Result<BulkOutcome<SensorId>> {
        let mut snapshots = self.snapshots.lock();
        let snapshot = snapshots
            .get_mut(&pid)
            .ok_or(ServiceError::NotSuspended(pid))?;

        let mut outcome = BulkOutcome::default();
        let entries: Vec<_> = snapshot.iter().map(|(id, info)| (*id, *info)).collect();
        for (sensor_id, saved) in entries {
            match self.arbitrator.enable(
                pid,
                sensor_id,
                saved.sampling_period_ns,
                saved.max_report_delay_ns,
            ) {
                Ok(_) => {
                    snapshot.remove(&sensor_id);
                    outcome.push_ok(sensor_id);
                }
                Err(e) => {
                    warn!(sensor_id = %sensor_id, error = %e, "resume failed");
                    outcome.push_err(sensor_id, e);
                }
            }
        }

        if snapshot.is_empty() {
            snapshots.remove(&pid);
        }
        info!(
            resumed = outcome.succeeded.len(),
            failed = outcome.failed.len(),
            "pid resumed"
        );
        Ok(outcome)
    }

    /// Resume every suspended pid
    pub fn reset_sensors(&self) -> BulkOutcome<(Pid, SensorId)> {
        let pids = self.suspended_pids();
        let mut outcome = BulkOutcome::default();
        for pid in pids {
            match self.resume(pid) {
                Ok(resumed) => {
                    outcome
                        .succeeded
                        .extend(resumed.succeeded.into_iter().map(|id| (pid, id)));
                    outcome
                        .failed
                        .extend(resumed.failed.into_iter().map(|(id, e)| ((pid, id), e)));
                }
                Err(e) => debug!(pid, error = %e, "pid resumed concurrently"),
            }
        }
        outcome
    }

    /// Active subscriptions of a pid
    pub fn get_active_info_list(&self, pid: Pid) -> Vec<ActiveInfo> {
        self.registry.active_info_list(pid)
    }

    pub fn snapshot(&self, pid: Pid) -> Option<SuspendSnapshot> {
        self.snapshots.lock().get(&pid).cloned()
    }

    pub fn is_suspended(&self, pid: Pid) -> bool {
        self.snapshots.lock().contains_key(&pid)
    }

    pub fn suspended_pids(&self) -> Vec<Pid> {
        let mut pids: Vec<_> = self.snapshots.lock().keys().copied().collect();
        pids.sort_unstable();
        pids
    }

    /// Remove one sensor from a pid's snapshot so resume leaves it off
    ///
    /// Drops the whole snapshot once it is empty.
    pub fn discard(&self, pid: Pid, sensor_id: SensorId) -> Option<SensorBasicInfo> {
        let mut snapshots = self.snapshots.lock();
        let snapshot = snapshots.get_mut(&pid)?;
        let saved = snapshot.remove(&sensor_id);
        if snapshot.is_empty() {
            snapshots.remove(&pid);
        }
        if saved.is_some() {
            debug!(pid, sensor_id = %sensor_id, "suspended subscription discarded");
        }
        saved
    }

    /// Drop a dead pid's snapshot without resuming it
    pub fn forget(&self, pid: Pid) -> Option<SuspendSnapshot> {
        self.snapshots.lock().remove(&pid)
    }
}
