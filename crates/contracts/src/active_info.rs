//! Active subscription records reported to clients

use serde::{Deserialize, Serialize};

use crate::{Pid, SensorId};

/// One (pid, sensor) subscription with its requested parameters
///
/// Returned by `get_active_info_list` and multicast as `MessageId::ActiveInfo`
/// frames to pids that enabled the client-info callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveInfo {
    pub pid: Pid,
    pub sensor_id: SensorId,
    pub sampling_period_ns: i64,
    pub max_report_delay_ns: i64,
}

impl ActiveInfo {
    pub fn new(pid: Pid, sensor_id: SensorId, sampling_period_ns: i64, max_report_delay_ns: i64) -> Self {
        Self {
            pid,
            sensor_id,
            sampling_period_ns,
            max_report_delay_ns,
        }
    }
}

/// Subscription change pushed to client-info listeners
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientInfoReport {
    pub pid: Pid,
    pub sensor_id: SensorId,
    pub is_active: bool,
    pub sampling_period_ns: i64,
    pub max_report_delay_ns: i64,
}

impl From<ClientInfoReport> for ActiveInfo {
    fn from(report: ClientInfoReport) -> Self {
        Self::new(
            report.pid,
            report.sensor_id,
            report.sampling_period_ns,
            report.max_report_delay_ns,
        )
    }
}
