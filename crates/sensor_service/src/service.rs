//! SensorService - the control surface
//!
//! Owns every piece of broker state for one service instance. Caller
//! identity always comes from `CallerInfo`, filled in by the IPC layer.

use std::os::fd::RawFd;
use std::os::unix::net::UnixStream;
use std::sync::{Arc, Weak};

use contracts::{
    ActiveInfo, BrokerConfig, ClientInfoReport, MessageId, Pid, SensorDescriptor, SensorId, Uid,
};
use hdi_connection::HdiConnection;
use observability::MetricsSummary;
use parking_lot::RwLock;
use tokio::runtime::Handle;
use tracing::{debug, info, instrument, warn};
use transport::{NetPacket, Reactor, StreamServer, StreamSession};

use crate::client_info::{AppThreadInfo, ClientRegistry, SensorBasicInfo};
use crate::dispatcher::EventDispatcher;
use crate::error::{BulkOutcome, Result, ServiceError};
use crate::flush_info::FlushCoordinator;
use crate::sensor_manager::{ActiveSensorState, RateArbitrator};
use crate::suspend_policy::SuspendPolicy;

/// Identity of the calling process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallerInfo {
    pub pid: Pid,
    pub uid: Uid,
    /// Opaque client token used for death notification
    pub token: u64,
}

impl CallerInfo {
    pub fn new(pid: Pid, uid: Uid, token: u64) -> Self {
        Self { pid, uid, token }
    }
}

/// Sensor broker service
pub struct SensorService {
    config: BrokerConfig,
    hdi: Arc<HdiConnection>,
    registry: Arc<ClientRegistry>,
    arbitrator: Arc<RateArbitrator>,
    flush: Arc<FlushCoordinator>,
    suspend: SuspendPolicy,
    server: StreamServer,
    dispatcher: EventDispatcher,
    reactor: RwLock<Option<Arc<Reactor>>>,
}

impl SensorService {
    /// Build the service and connect the hardware
    #[instrument(name = "sensor_service_start", skip_all)]
    pub fn start(config: BrokerConfig, hdi: Arc<HdiConnection>) -> Result<Arc<Self>> {
        let registry = Arc::new(ClientRegistry::new());
        let arbitrator = Arc::new(RateArbitrator::new(
            hdi.clone(),
            registry.clone(),
            config.service.clone(),
        ));
        let flush = Arc::new(FlushCoordinator::new());
        let suspend = SuspendPolicy::new(
            arbitrator.clone(),
            registry.clone(),
            config.service.freezing_exempt.iter().copied(),
        );
        let dispatcher = EventDispatcher::spawn(
            config.service.event_queue_capacity,
            registry.clone(),
            flush.clone(),
            config.transport.max_packet_size,
        )?;

        hdi.connect(dispatcher.callback())?;
        for sensor_id in &config.hdi.inject_on_start {
            if let Err(e) = hdi.inject_mock(*sensor_id) {
                warn!(sensor_id = %sensor_id, error = %e, "startup mock injection failed");
            }
        }

        info!(sensors = hdi.list_sensors().len(), "sensor service started");
        Ok(Arc::new(Self {
            server: StreamServer::new(config.transport.clone()),
            config,
            hdi,
            registry,
            arbitrator,
            flush,
            suspend,
            dispatcher,
            reactor: RwLock::new(None),
        }))
    }

    /// Watch every channel for peer hang-up on the given runtime
    ///
    /// A data channel hang-up is treated as process death; a socket
    /// channel hang-up drops that session only.
    pub fn attach_reactor(self: &Arc<Self>, handle: Handle) {
        let weak: Weak<Self> = Arc::downgrade(self);
        let on_disconnect = Arc::new(move |session: &Arc<StreamSession>| {
            if let Some(service) = weak.upgrade() {
                service.on_channel_hangup(session);
            }
        });
        let on_packet = Arc::new(|session: &Arc<StreamSession>, packet: NetPacket| {
            debug!(
                pid = session.pid(),
                msg_id = packet.msg_id(),
                len = packet.payload().len(),
                "client frame ignored"
            );
        });

        let reactor = Arc::new(Reactor::new(
            handle,
            self.config.transport.clone(),
            on_packet,
            on_disconnect,
        ));
        *self.reactor.write() = Some(reactor);
    }

    // ---- subscriptions ----

    /// Subscribe the caller to a sensor
    #[instrument(name = "service_enable_sensor", skip(self, caller), fields(pid = caller.pid, sensor_id = %sensor_id))]
    pub fn enable_sensor(
        &self,
        caller: &CallerInfo,
        sensor_id: SensorId,
        sampling_period_ns: i64,
        max_report_delay_ns: i64,
    ) -> Result<()> {
        let pid = check_pid(caller.pid)?;
        let outcome =
            self.arbitrator
                .enable(pid, sensor_id, sampling_period_ns, max_report_delay_ns)?;

        if outcome.was_running && outcome.newly_subscribed {
            if let Some(channel) = self.registry.channel_for(pid) {
                if let Err(e) =
                    self.flush
                        .request_flush(&self.arbitrator, sensor_id, pid, channel, true)
                {
                    warn!(error = %e, "initial flush failed");
                }
            }
            self.report_on_change_data(pid, sensor_id);
        }

        if let Some(info) = self.registry.subscription(pid, sensor_id) {
            self.report_client_info(pid, sensor_id, true, info);
        }
        Ok(())
    }

    /// Unsubscribe the caller from a sensor
    #[instrument(name = "service_disable_sensor", skip(self, caller), fields(pid = caller.pid, sensor_id = %sensor_id))]
    pub fn disable_sensor(&self, caller: &CallerInfo, sensor_id: SensorId) -> Result<()> {
        self.disable_for_pid(check_pid(caller.pid)?, sensor_id)
    }

    /// Unsubscribe an arbitrary pid
    pub fn disable_for_pid(&self, pid: Pid, sensor_id: SensorId) -> Result<()> {
        let pid = check_pid(pid)?;
        if !sensor_id.is_valid() {
            return Err(ServiceError::invalid_argument(format!(
                "invalid sensor {sensor_id}"
            )));
        }
        // 挂起中的订阅只存在于快照里，直接丢弃，恢复时不再启用
        if let Some(saved) = self.suspend.discard(pid, sensor_id) {
            self.report_client_info(pid, sensor_id, false, saved);
            return Ok(());
        }
        match self.arbitrator.disable(pid, sensor_id) {
            Ok(disabled) => {
                self.report_client_info(pid, sensor_id, false, disabled.info);
                Ok(())
            }
            // 与并发的挂起交错：订阅可能刚移入快照
            Err(ServiceError::NotSubscribed { .. }) => match self.suspend.discard(pid, sensor_id) {
                Some(saved) => {
                    self.report_client_info(pid, sensor_id, false, saved);
                    Ok(())
                }
                None => Err(ServiceError::NotSubscribed { pid, sensor_id }),
            },
            Err(e) => Err(e),
        }
    }

    pub fn set_mode(&self, caller: &CallerInfo, sensor_id: SensorId, mode: i32) -> Result<()> {
        check_pid(caller.pid)?;
        if !self.hdi.has_sensor(sensor_id) {
            return Err(ServiceError::invalid_argument(format!(
                "unknown sensor {sensor_id}"
            )));
        }
        self.arbitrator.set_mode(sensor_id, mode)
    }

    /// Flush a subscribed sensor on behalf of the caller
    ///
    /// The completion arrives on the caller's data channel.
    #[instrument(name = "service_flush", skip(self, caller), fields(pid = caller.pid, sensor_id = %sensor_id))]
    pub fn flush(&self, caller: &CallerInfo, sensor_id: SensorId) -> Result<()> {
        let pid = check_pid(caller.pid)?;
        if self.registry.subscription(pid, sensor_id).is_none() {
            return Err(ServiceError::NotSubscribed { pid, sensor_id });
        }
        let channel = self
            .registry
            .channel_for(pid)
            .ok_or_else(|| ServiceError::channel(pid, "no data channel"))?;
        self.flush
            .request_flush(&self.arbitrator, sensor_id, pid, channel, false)
    }

    pub fn get_sensor_list(&self) -> Vec<SensorDescriptor> {
        self.hdi.list_sensors()
    }

    // ---- data channel ----

    /// Create the caller's data channel and return the client end
    ///
    /// Replaces any previous data channel of the pid.
    #[instrument(name = "service_transfer_data_channel", skip(self, caller), fields(pid = caller.pid))]
    pub fn transfer_data_channel(&self, caller: &CallerInfo) -> Result<UnixStream> {
        let pid = check_pid(caller.pid)?;
        let (session, client) =
            StreamSession::pair(pid, caller.uid, 0, &self.config.transport)?;
        session.bind()?;

        self.registry.update_app_thread_info(AppThreadInfo {
            pid,
            uid: caller.uid,
            token: caller.token,
        });
        if let Some(old) = self.registry.update_sensor_channel(pid, session.clone()) {
            self.deregister(old.fd());
            old.close();
            debug!(old_fd = old.fd(), "previous data channel replaced");
        }
        self.register(&session);
        info!(fd = session.fd(), "data channel transferred");
        Ok(client)
    }

    /// Close the caller's data channel
    #[instrument(name = "service_destroy_sensor_channel", skip(self, caller), fields(pid = caller.pid))]
    pub fn destroy_sensor_channel(&self, caller: &CallerInfo) -> Result<()> {
        let pid = check_pid(caller.pid)?;
        let channel = self
            .registry
            .destroy_sensor_channel(pid)
            .ok_or_else(|| ServiceError::channel(pid, "no data channel"))?;
        self.deregister(channel.fd());
        self.registry.destroy_client_pid(caller.token);
        info!(fd = channel.fd(), "data channel destroyed");
        Ok(())
    }

    // ---- socket channel ----

    /// Create the caller's socket channel and return the client end
    #[instrument(name = "service_create_socket_channel", skip(self, caller), fields(pid = caller.pid))]
    pub fn create_socket_channel(&self, caller: &CallerInfo) -> Result<UnixStream> {
        let pid = check_pid(caller.pid)?;
        if let Some(old_fd) = self.server.get_client_fd(pid) {
            self.deregister(old_fd);
        }
        let (session, client) = self.server.add_socket_pair_info(caller.uid, pid, 0)?;
        self.registry.save_client_pid(caller.token, pid);
        self.register(&session);
        Ok(client)
    }

    /// Close the caller's socket channel; a missing channel is not an error
    #[instrument(name = "service_destroy_socket_channel", skip(self, caller), fields(pid = caller.pid))]
    pub fn destroy_socket_channel(&self, caller: &CallerInfo) -> Result<()> {
        let pid = check_pid(caller.pid)?;
        if let Some(session) = self.server.del_session(pid) {
            self.deregister(session.fd());
        }
        Ok(())
    }

    // ---- suspend / resume ----

    pub fn suspend_sensors(&self, pid: Pid) -> Result<BulkOutcome<SensorId>> {
        let pid = check_pid(pid)?;
        let outcome = self.suspend.suspend(pid);
        if let Some(snapshot) = self.suspend.snapshot(pid) {
            for sensor_id in &outcome.succeeded {
                if let Some(info) = snapshot.get(sensor_id) {
                    self.report_client_info(pid, *sensor_id, false, *info);
                }
            }
        }
        Ok(outcome)
    }

    pub fn resume_sensors(&self, pid: Pid) -> Result<BulkOutcome<SensorId>> {
        let pid = check_pid(pid)?;
        let outcome = self.suspend.resume(pid)?;
        for sensor_id in &outcome.succeeded {
            if let Some(info) = self.registry.subscription(pid, *sensor_id) {
                self.report_client_info(pid, *sensor_id, true, info);
            }
        }
        Ok(outcome)
    }

    pub fn get_active_info_list(&self, pid: Pid) -> Result<Vec<ActiveInfo>> {
        Ok(self.suspend.get_active_info_list(check_pid(pid)?))
    }

    /// Resume every suspended pid
    pub fn reset_sensors(&self) -> BulkOutcome<(Pid, SensorId)> {
        self.suspend.reset_sensors()
    }

    // ---- mocks ----

    pub fn inject_mock_sensor(&self, sensor_id: SensorId) -> Result<()> {
        self.hdi.inject_mock(sensor_id).map_err(ServiceError::Hdi)
    }

    /// Remove a mock; its remaining subscribers are unsubscribed first
    pub fn uninject_mock_sensor(&self, sensor_id: SensorId) -> Result<()> {
        if !self.hdi.is_mocked(sensor_id) {
            return Err(ServiceError::Hdi(hdi_connection::HdiError::MockNotFound(
                sensor_id,
            )));
        }
        for pid in self.registry.subscribers_of(sensor_id) {
            if let Err(e) = self.disable_for_pid(pid, sensor_id) {
                warn!(pid, sensor_id = %sensor_id, error = %e, "mock subscriber not removed");
            }
        }
        self.hdi.uninject_mock(sensor_id).map_err(ServiceError::Hdi)
    }

    // ---- client info ----

    pub fn enable_client_info_callback(&self, caller: &CallerInfo) -> Result<()> {
        let pid = check_pid(caller.pid)?;
        self.registry.add_client_info_callback_pid(pid);
        Ok(())
    }

    pub fn disable_client_info_callback(&self, caller: &CallerInfo) -> Result<()> {
        let pid = check_pid(caller.pid)?;
        self.registry.del_client_info_callback_pid(pid);
        Ok(())
    }

    // ---- process lifecycle ----

    /// Unwind everything a dead process owned
    ///
    /// Disables each of its sensors, drops its suspend snapshot and closes
    /// both channels. Racing explicit disables and repeated calls are fine.
    #[instrument(name = "service_process_death", skip(self))]
    pub fn process_death(&self, pid: Pid) -> BulkOutcome<SensorId> {
        // 先丢弃快照：进行中的恢复会先完成，之后的恢复找不到快照
        self.suspend.forget(pid);

        let mut outcome = BulkOutcome::default();
        for sensor_id in self.registry.sensors_of(pid) {
            match self.arbitrator.disable(pid, sensor_id) {
                Ok(disabled) => {
                    self.report_client_info(pid, sensor_id, false, disabled.info);
                    outcome.push_ok(sensor_id);
                }
                Err(ServiceError::NotSubscribed { .. }) => outcome.push_ok(sensor_id),
                Err(e) => {
                    warn!(sensor_id = %sensor_id, error = %e, "disable on death failed");
                    outcome.push_err(sensor_id, e);
                }
            }
        }

        if let Some(session) = self.server.del_session(pid) {
            self.deregister(session.fd());
        }
        let cleanup = self.registry.destroy_client(pid);
        if let Some(channel) = &cleanup.channel {
            self.deregister(channel.fd());
        }

        info!(
            disabled = outcome.succeeded.len(),
            failed = outcome.failed.len(),
            "process cleaned up"
        );
        outcome
    }

    /// Death notification keyed by client token
    pub fn on_client_died(&self, token: u64) -> Option<BulkOutcome<SensorId>> {
        let pid = self.registry.destroy_client_pid(token)?;
        Some(self.process_death(pid))
    }

    /// Stop reporting and release every resource
    #[instrument(name = "sensor_service_stop", skip(self))]
    pub fn stop(&self) {
        if let Some(reactor) = self.reactor.write().take() {
            reactor.shutdown();
        }
        self.server.close_all();
        for sensor_id in self.arbitrator.enabled_sensors() {
            for pid in self.registry.subscribers_of(sensor_id) {
                if let Err(e) = self.arbitrator.disable(pid, sensor_id) {
                    debug!(pid, sensor_id = %sensor_id, error = %e, "disable on stop failed");
                }
            }
        }
        if let Err(e) = self.hdi.disconnect() {
            warn!(error = %e, "backend disconnect failed");
        }
        self.dispatcher.shutdown();
        info!("sensor service stopped");
    }

    // ---- introspection ----

    pub fn registry(&self) -> &ClientRegistry {
        &self.registry
    }

    pub fn flush_coordinator(&self) -> &FlushCoordinator {
        &self.flush
    }

    pub fn server(&self) -> &StreamServer {
        &self.server
    }

    pub fn hdi(&self) -> &HdiConnection {
        &self.hdi
    }

    pub fn active_state(&self, sensor_id: SensorId) -> Option<ActiveSensorState> {
        self.arbitrator.active_state(sensor_id)
    }

    pub fn is_suspended(&self, pid: Pid) -> bool {
        self.suspend.is_suspended(pid)
    }

    pub fn dispatch_summary(&self) -> MetricsSummary {
        self.dispatcher.summary()
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }
}

impl SensorService {
    fn register(&self, session: &Arc<StreamSession>) {
        if let Some(reactor) = self.reactor.read().as_ref() {
            if let Err(e) = reactor.register(session.clone()) {
                warn!(pid = session.pid(), error = %e, "channel not watched");
            }
        }
    }

    fn deregister(&self, fd: RawFd) {
        if let Some(reactor) = self.reactor.read().as_ref() {
            reactor.deregister(fd);
        }
    }

    fn on_channel_hangup(&self, session: &Arc<StreamSession>) {
        let pid = session.pid();
        let is_data_channel = self
            .registry
            .channel_for(pid)
            .is_some_and(|c| Arc::ptr_eq(&c, session));
        if is_data_channel {
            info!(pid, "data channel hung up, treating as process death");
            self.process_death(pid);
            return;
        }
        if self.server.get_session(session.fd()).is_some() {
            info!(pid, "socket channel hung up");
            self.server.del_session(pid);
        }
    }

    /// Replay the last event of an on-change sensor to a new subscriber
    fn report_on_change_data(&self, pid: Pid, sensor_id: SensorId) {
        let on_change = self
            .hdi
            .list_sensors()
            .iter()
            .any(|d| d.sensor_id == sensor_id && d.is_on_change());
        if !on_change {
            return;
        }
        let (Some(event), Some(channel)) = (
            self.registry.stored_event(sensor_id),
            self.registry.channel_for(pid),
        ) else {
            return;
        };
        let sent = NetPacket::encode(MessageId::SensorEvent, &event)
            .and_then(|packet| channel.send_msg(&packet));
        if let Err(e) = sent {
            warn!(pid, sensor_id = %sensor_id, error = %e, "on-change replay failed");
        }
    }

    /// Multicast a subscription change to every client-info listener
    fn report_client_info(&self, pid: Pid, sensor_id: SensorId, is_active: bool, info: SensorBasicInfo) {
        let fds: Vec<RawFd> = self
            .registry
            .client_info_callback_pids()
            .into_iter()
            .filter_map(|listener| self.server.get_client_fd(listener))
            .collect();
        if fds.is_empty() {
            return;
        }

        let report = ClientInfoReport {
            pid,
            sensor_id,
            is_active,
            sampling_period_ns: info.sampling_period_ns,
            max_report_delay_ns: info.max_report_delay_ns,
        };
        let result = NetPacket::encode(MessageId::ActiveInfo, &report)
            .and_then(|packet| self.server.multicast(&fds, &packet));
        match result {
            Ok(report) => {
                for (fd, e) in &report.failed {
                    debug!(fd, error = %e, "client info not delivered");
                }
            }
            Err(e) => warn!(error = %e, "client info not encoded"),
        }
    }
}

fn check_pid(pid: Pid) -> Result<Pid> {
    if pid < 0 {
        return Err(ServiceError::InvalidPid(pid));
    }
    Ok(pid)
}
