//! FlushCoordinator - attributes flush completions in request order
//!
//! The hardware flush command is shared per sensor, so completions carry
//! no requester. Each request appends an entry to the sensor's FIFO; each
//! completion pops exactly one entry from the front.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use contracts::{DeviceCommand, Pid, SensorId};
use parking_lot::Mutex;
use tracing::{debug, instrument, warn};
use transport::StreamSession;

use crate::error::Result;
use crate::sensor_manager::RateArbitrator;

/// One outstanding flush
#[derive(Debug, Clone)]
pub struct FlushQueueEntry {
    pub sensor_id: SensorId,
    pub pid: Pid,
    pub channel: Arc<StreamSession>,
    /// Issued by the service when the pid joined a running sensor
    pub is_first: bool,
    seq: u64,
}

/// Flush coordinator
#[derive(Default)]
pub struct FlushCoordinator {
    queues: Mutex<HashMap<SensorId, VecDeque<FlushQueueEntry>>>,
    next_seq: AtomicU64,
}

impl FlushCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a flush for `pid` and issue the hardware command
    ///
    /// The entry is queued before the command so a completion raised
    /// synchronously by the backend finds it. On command failure the entry
    /// is withdrawn.
    #[instrument(name = "flush_request", skip(self, arbitrator, channel), fields(sensor_id = %sensor_id))]
    pub fn request_flush(
        &self,
        arbitrator: &RateArbitrator,
        sensor_id: SensorId,
        pid: Pid,
        channel: Arc<StreamSession>,
        is_first: bool,
    ) -> Result<()> {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        self.queues
            .lock()
            .entry(sensor_id)
            .or_default()
            .push_back(FlushQueueEntry {
                sensor_id,
                pid,
                channel,
                is_first,
                seq,
            });

        if let Err(e) = arbitrator.run_command(sensor_id, DeviceCommand::Flush, 0) {
            self.withdraw(sensor_id, seq);
            warn!(pid, error = %e, "flush command failed");
            return Err(e);
        }
        debug!(pid, is_first, "flush queued");
        Ok(())
    }

    /// Pop the entry a completion belongs to
    ///
    /// `None` when nothing is outstanding; the completion is dropped.
    pub fn on_flush_completed(&self, sensor_id: SensorId) -> Option<FlushQueueEntry> {
        let mut queues = self.queues.lock();
        let entry = queues.get_mut(&sensor_id).and_then(VecDeque::pop_front);
        if queues.get(&sensor_id).is_some_and(VecDeque::is_empty) {
            queues.remove(&sensor_id);
        }
        drop(queues);

        observability::record_flush_completed(sensor_id.get(), entry.is_some());
        if entry.is_none() {
            debug!(sensor_id = %sensor_id, "flush completion with no outstanding request");
        }
        entry
    }

    /// Outstanding requests for a sensor, front first
    pub fn pending(&self, sensor_id: SensorId) -> Vec<Pid> {
        self.queues
            .lock()
            .get(&sensor_id)
            .map(|queue| queue.iter().map(|entry| entry.pid).collect())
            .unwrap_or_default()
    }

    pub fn pending_count(&self) -> usize {
        self.queues.lock().values().map(VecDeque::len).sum()
    }

    fn withdraw(&self, sensor_id: SensorId, seq: u64) {
        let mut queues = self.queues.lock();
        if let Some(queue) = queues.get_mut(&sensor_id) {
            queue.retain(|entry| entry.seq != seq);
            if queue.is_empty() {
                queues.remove(&sensor_id);
            }
        }
    }
}
