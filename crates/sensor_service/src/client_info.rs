//! ClientRegistry - which process subscribes to which sensor
//!
//! Authoritative subscription map plus the per-pid bookkeeping hanging off
//! it: data channels, caller identity, death tokens, client-info listeners
//! and the last event of each sensor. Every subscription mutation bumps the
//! sensor's generation so cached merged state is recomputed.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use contracts::{ActiveInfo, Pid, SensorEvent, SensorId, Uid};
use parking_lot::RwLock;
use tracing::{debug, trace};
use transport::StreamSession;

use crate::error::{Result, ServiceError};

/// Parameters one pid requested for one sensor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SensorBasicInfo {
    pub sampling_period_ns: i64,
    pub max_report_delay_ns: i64,
}

impl SensorBasicInfo {
    pub fn new(sampling_period_ns: i64, max_report_delay_ns: i64) -> Self {
        Self {
            sampling_period_ns,
            max_report_delay_ns,
        }
    }
}

/// Caller identity recorded when a data channel is transferred
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppThreadInfo {
    pub pid: Pid,
    pub uid: Uid,
    pub token: u64,
}

/// Result of removing a subscription
#[derive(Debug)]
pub struct Removed {
    pub info: SensorBasicInfo,
    /// Channel released because the pid has no sensors left and teardown
    /// was requested
    pub released_channel: Option<Arc<StreamSession>>,
}

/// Everything dropped for a pid by `destroy_client`
#[derive(Debug, Default)]
pub struct ClientCleanup {
    pub channel: Option<Arc<StreamSession>>,
    pub app_info: Option<AppThreadInfo>,
    pub had_info_callback: bool,
}

#[derive(Default)]
struct RegistryState {
    subscriptions: HashMap<SensorId, BTreeMap<Pid, SensorBasicInfo>>,
    generations: HashMap<SensorId, u64>,
    channels: HashMap<Pid, Arc<StreamSession>>,
    app_threads: HashMap<Pid, AppThreadInfo>,
    tokens: HashMap<u64, Pid>,
    info_callback_pids: BTreeSet<Pid>,
    store_events: HashMap<SensorId, SensorEvent>,
}

impl RegistryState {
    fn bump(&mut self, sensor_id: SensorId) {
        *self.generations.entry(sensor_id).or_insert(0) += 1;
    }
}

/// Client registry
#[derive(Default)]
pub struct ClientRegistry {
    state: RwLock<RegistryState>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    // ---- subscriptions ----

    /// Record a new subscription
    pub fn add_subscription(
        &self,
        pid: Pid,
        sensor_id: SensorId,
        sampling_period_ns: i64,
        max_report_delay_ns: i64,
    ) -> Result<()> {
        let mut state = self.state.write();
        let subscribers = state.subscriptions.entry(sensor_id).or_default();
        if subscribers.contains_key(&pid) {
            return Err(ServiceError::AlreadySubscribed { pid, sensor_id });
        }
        subscribers.insert(
            pid,
            SensorBasicInfo::new(sampling_period_ns, max_report_delay_ns),
        );
        state.bump(sensor_id);
        trace!(pid, sensor_id = %sensor_id, "subscription added");
        Ok(())
    }

    /// Replace the parameters of an existing subscription
    ///
    /// Returns the previous parameters.
    pub fn update_subscription(
        &self,
        pid: Pid,
        sensor_id: SensorId,
        sampling_period_ns: i64,
        max_report_delay_ns: i64,
    ) -> Result<SensorBasicInfo> {
        let mut state = self.state.write();
        let info = state
            .subscriptions
            .get_mut(&sensor_id)
            .and_then(|subscribers| subscribers.get_mut(&pid))
            .ok_or(ServiceError::NotSubscribed { pid, sensor_id })?;
        let previous = *info;
        *info = SensorBasicInfo::new(sampling_period_ns, max_report_delay_ns);
        state.bump(sensor_id);
        Ok(previous)
    }

    /// Drop a subscription
    ///
    /// With `teardown`, the pid's data channel is released and closed once
    /// it has no sensors left.
    pub fn remove_subscription(
        &self,
        pid: Pid,
        sensor_id: SensorId,
        teardown: bool,
    ) -> Result<Removed> {
        let (info, channel) = {
            let mut state = self.state.write();
            let subscribers = state
                .subscriptions
                .get_mut(&sensor_id)
                .ok_or(ServiceError::NotSubscribed { pid, sensor_id })?;
            let info = subscribers
                .remove(&pid)
                .ok_or(ServiceError::NotSubscribed { pid, sensor_id })?;
            if subscribers.is_empty() {
                state.subscriptions.remove(&sensor_id);
            }
            state.bump(sensor_id);

            let has_sensors = state.subscriptions.values().any(|s| s.contains_key(&pid));
            let channel = if teardown && !has_sensors {
                state.channels.remove(&pid)
            } else {
                None
            };
            (info, channel)
        };

        if let Some(channel) = &channel {
            channel.close();
            debug!(pid, fd = channel.fd(), "channel released with last subscription");
        }
        trace!(pid, sensor_id = %sensor_id, "subscription removed");
        Ok(Removed {
            info,
            released_channel: channel,
        })
    }

    pub fn subscription(&self, pid: Pid, sensor_id: SensorId) -> Option<SensorBasicInfo> {
        self.state
            .read()
            .subscriptions
            .get(&sensor_id)
            .and_then(|subscribers| subscribers.get(&pid))
            .copied()
    }

    /// Sensors a pid subscribes to, in id order
    pub fn sensors_of(&self, pid: Pid) -> Vec<SensorId> {
        let state = self.state.read();
        let mut sensors: Vec<_> = state
            .subscriptions
            .iter()
            .filter(|(_, subscribers)| subscribers.contains_key(&pid))
            .map(|(id, _)| *id)
            .collect();
        sensors.sort();
        sensors
    }

    /// Pids subscribed to a sensor, in pid order
    pub fn subscribers_of(&self, sensor_id: SensorId) -> Vec<Pid> {
        self.state
            .read()
            .subscriptions
            .get(&sensor_id)
            .map(|subscribers| subscribers.keys().copied().collect())
            .unwrap_or_default()
    }

    /// Subscribers of a sensor with their parameters
    pub fn subscriptions_of(&self, sensor_id: SensorId) -> Vec<(Pid, SensorBasicInfo)> {
        self.state
            .read()
            .subscriptions
            .get(&sensor_id)
            .map(|subscribers| subscribers.iter().map(|(pid, info)| (*pid, *info)).collect())
            .unwrap_or_default()
    }

    /// Whether any pid subscribes to a sensor
    pub fn sensor_state(&self, sensor_id: SensorId) -> bool {
        self.state
            .read()
            .subscriptions
            .get(&sensor_id)
            .is_some_and(|subscribers| !subscribers.is_empty())
    }

    /// Mutation counter for a sensor's subscriber set
    pub fn generation(&self, sensor_id: SensorId) -> u64 {
        self.state
            .read()
            .generations
            .get(&sensor_id)
            .copied()
            .unwrap_or(0)
    }

    /// Active info records for every sensor a pid subscribes to
    pub fn active_info_list(&self, pid: Pid) -> Vec<ActiveInfo> {
        let state = self.state.read();
        let mut list: Vec<_> = state
            .subscriptions
            .iter()
            .filter_map(|(sensor_id, subscribers)| {
                subscribers.get(&pid).map(|info| {
                    ActiveInfo::new(
                        pid,
                        *sensor_id,
                        info.sampling_period_ns,
                        info.max_report_delay_ns,
                    )
                })
            })
            .collect();
        list.sort_by_key(|info| info.sensor_id);
        list
    }

    // ---- channels ----

    /// Install a pid's data channel, returning the one it replaces
    pub fn update_sensor_channel(
        &self,
        pid: Pid,
        channel: Arc<StreamSession>,
    ) -> Option<Arc<StreamSession>> {
        self.state.write().channels.insert(pid, channel)
    }

    pub fn channel_for(&self, pid: Pid) -> Option<Arc<StreamSession>> {
        self.state.read().channels.get(&pid).cloned()
    }

    /// Remove and close a pid's data channel
    pub fn destroy_sensor_channel(&self, pid: Pid) -> Option<Arc<StreamSession>> {
        let channel = self.state.write().channels.remove(&pid);
        if let Some(channel) = &channel {
            channel.close();
        }
        channel
    }

    /// Drop a channel only if it is still the one registered for its pid
    pub fn release_channel_if_current(&self, channel: &Arc<StreamSession>) -> bool {
        let mut state = self.state.write();
        let current = state
            .channels
            .get(&channel.pid())
            .is_some_and(|c| Arc::ptr_eq(c, channel));
        if current {
            state.channels.remove(&channel.pid());
        }
        drop(state);
        channel.close();
        current
    }

    /// Data channels of every subscriber of a sensor
    pub fn active_channels(&self, sensor_id: SensorId) -> Vec<Arc<StreamSession>> {
        let state = self.state.read();
        state
            .subscriptions
            .get(&sensor_id)
            .map(|subscribers| {
                subscribers
                    .keys()
                    .filter_map(|pid| state.channels.get(pid).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    // ---- caller identity ----

    pub fn update_app_thread_info(&self, info: AppThreadInfo) {
        let mut state = self.state.write();
        state.tokens.insert(info.token, info.pid);
        state.app_threads.insert(info.pid, info);
    }

    pub fn app_thread_info(&self, pid: Pid) -> Option<AppThreadInfo> {
        self.state.read().app_threads.get(&pid).copied()
    }

    /// Remember which pid owns a death token
    pub fn save_client_pid(&self, token: u64, pid: Pid) {
        self.state.write().tokens.insert(token, pid);
    }

    pub fn find_client_pid(&self, token: u64) -> Option<Pid> {
        self.state.read().tokens.get(&token).copied()
    }

    pub fn destroy_client_pid(&self, token: u64) -> Option<Pid> {
        self.state.write().tokens.remove(&token)
    }

    // ---- client-info listeners ----

    pub fn add_client_info_callback_pid(&self, pid: Pid) -> bool {
        self.state.write().info_callback_pids.insert(pid)
    }

    pub fn del_client_info_callback_pid(&self, pid: Pid) -> bool {
        self.state.write().info_callback_pids.remove(&pid)
    }

    pub fn client_info_callback_pids(&self) -> Vec<Pid> {
        self.state.read().info_callback_pids.iter().copied().collect()
    }

    // ---- last events ----

    /// Keep the most recent event of a sensor for replay
    pub fn store_event(&self, event: &SensorEvent) {
        self.state
            .write()
            .store_events
            .insert(event.sensor_id, event.clone());
    }

    pub fn stored_event(&self, sensor_id: SensorId) -> Option<SensorEvent> {
        self.state.read().store_events.get(&sensor_id).cloned()
    }

    pub fn clear_data_queue(&self, sensor_id: SensorId) {
        self.state.write().store_events.remove(&sensor_id);
    }

    /// Drop every per-pid record except subscriptions
    ///
    /// Safe to call repeatedly; later calls find nothing to drop.
    pub fn destroy_client(&self, pid: Pid) -> ClientCleanup {
        let cleanup = {
            let mut state = self.state.write();
            state.tokens.retain(|_, owner| *owner != pid);
            ClientCleanup {
                channel: state.channels.remove(&pid),
                app_info: state.app_threads.remove(&pid),
                had_info_callback: state.info_callback_pids.remove(&pid),
            }
        };
        if let Some(channel) = &cleanup.channel {
            channel.close();
        }
        cleanup
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use contracts::{sensor_type, TransportConfig};

    const ACC: SensorId = sensor_type::ACCELEROMETER;
    const GYRO: SensorId = sensor_type::GYROSCOPE;

    #[test]
    fn test_add_and_remove_subscription() {
        let registry = ClientRegistry::new();
        registry.add_subscription(100, ACC, 100, 100).unwrap();
        assert!(matches!(
            registry.add_subscription(100, ACC, 50, 0),
            Err(ServiceError::AlreadySubscribed { .. })
        ));

        registry.add_subscription(200, ACC, 50, 0).unwrap();
        registry.add_subscription(100, GYRO, 10, 0).unwrap();

        assert_eq!(registry.subscribers_of(ACC), vec![100, 200]);
        assert_eq!(registry.sensors_of(100), vec![ACC, GYRO]);

        let removed = registry.remove_subscription(200, ACC, false).unwrap();
        assert_eq!(removed.info, SensorBasicInfo::new(50, 0));
        assert!(matches!(
            registry.remove_subscription(200, ACC, false),
            Err(ServiceError::NotSubscribed { .. })
        ));
    }

    #[test]
    fn test_every_mutation_bumps_generation() {
        let registry = ClientRegistry::new();
        assert_eq!(registry.generation(ACC), 0);

        registry.add_subscription(1, ACC, 100, 0).unwrap();
        registry.update_subscription(1, ACC, 50, 0).unwrap();
        registry.remove_subscription(1, ACC, false).unwrap();
        assert_eq!(registry.generation(ACC), 3);
        assert_eq!(registry.generation(GYRO), 0);
    }

    #[test]
    fn test_teardown_releases_channel_with_last_sensor() {
        let registry = ClientRegistry::new();
        let (session, _client) = StreamSession::pair(7, 1, 0, &TransportConfig::default()).unwrap();
        registry.update_sensor_channel(7, session.clone());
        registry.add_subscription(7, ACC, 100, 0).unwrap();
        registry.add_subscription(7, GYRO, 100, 0).unwrap();

        let removed = registry.remove_subscription(7, ACC, true).unwrap();
        assert!(removed.released_channel.is_none());
        assert!(registry.channel_for(7).is_some());

        let removed = registry.remove_subscription(7, GYRO, true).unwrap();
        assert!(removed.released_channel.is_some());
        assert!(registry.channel_for(7).is_none());
        assert!(session.is_closed());
    }

    #[test]
    fn test_active_channels_only_for_subscribers() {
        let registry = ClientRegistry::new();
        let config = TransportConfig::default();
        let (a, _ca) = StreamSession::pair(1, 1, 0, &config).unwrap();
        let (b, _cb) = StreamSession::pair(2, 1, 0, &config).unwrap();
        registry.update_sensor_channel(1, a.clone());
        registry.update_sensor_channel(2, b);
        registry.add_subscription(1, ACC, 100, 0).unwrap();

        let channels = registry.active_channels(ACC);
        assert_eq!(channels.len(), 1);
        assert_eq!(channels[0].fd(), a.fd());
        assert!(registry.active_channels(GYRO).is_empty());
    }

    #[test]
    fn test_destroy_client_is_idempotent() {
        let registry = ClientRegistry::new();
        registry.update_app_thread_info(AppThreadInfo {
            pid: 5,
            uid: 1000,
            token: 42,
        });
        registry.add_client_info_callback_pid(5);

        let first = registry.destroy_client(5);
        assert!(first.app_info.is_some());
        assert!(first.had_info_callback);
        assert_eq!(registry.find_client_pid(42), None);

        let second = registry.destroy_client(5);
        assert!(second.app_info.is_none());
        assert!(!second.had_info_callback);
    }

    #[test]
    fn test_active_info_list_sorted_by_sensor() {
        let registry = ClientRegistry::new();
        registry.add_subscription(3, GYRO, 20, 0).unwrap();
        registry.add_subscription(3, ACC, 10, 5).unwrap();

        let list = registry.active_info_list(3);
        assert_eq!(
            list,
            vec![ActiveInfo::new(3, ACC, 10, 5), ActiveInfo::new(3, GYRO, 20, 0)]
        );
    }
}
