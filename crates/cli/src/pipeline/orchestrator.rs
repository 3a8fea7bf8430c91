//! Broker orchestrator - starts the service and its in-process subscribers.
//!
//! The vendor HAL is not linked into this binary, so the software backend
//! stands in for the real one; `BackendKind::Real` still exercises the
//! fallback path at connect time.

use std::future::Future;
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use contracts::{BrokerConfig, MessageId, SensorId, TransportConfig};
use hdi_connection::{CompatibleConnection, HdiConnection};
use sensor_service::{CallerInfo, SensorService};
use tokio::runtime::Handle;
use tracing::{debug, info, warn};
use transport::{StreamClient, TransportError};

use super::{ClientStats, RunStats};
use crate::cli::SubscriptionSpec;

/// Pids handed to in-process subscribers start here
const DEMO_PID_BASE: i32 = 10_000;
const DEMO_UID: i32 = 1000;
const CLIENT_POLL: Duration = Duration::from_millis(100);

/// Broker run configuration
#[derive(Debug, Clone)]
pub struct BrokerRunConfig {
    pub config: BrokerConfig,

    /// In-process subscribers to create after startup
    pub subscriptions: Vec<SubscriptionSpec>,

    /// Run duration (None = until shutdown signal)
    pub timeout: Option<Duration>,

    /// Metrics server port (None = disabled)
    pub metrics_port: Option<u16>,
}

/// Main broker orchestrator
pub struct Broker {
    run_config: BrokerRunConfig,
}

impl Broker {
    pub fn new(run_config: BrokerRunConfig) -> Self {
        Self { run_config }
    }

    /// Run until `shutdown` resolves or the timeout elapses
    pub async fn run(self, shutdown: impl Future<Output = ()>) -> Result<RunStats> {
        let start_time = Instant::now();

        if let Some(port) = self.run_config.metrics_port {
            observability::init_metrics_only(port)?;
            info!("Metrics endpoint available on port {}", port);
        }

        let config = self.run_config.config.clone();
        let transport_config = config.transport.clone();
        let hdi = Arc::new(HdiConnection::new(
            Arc::new(CompatibleConnection::new()),
            &config.hdi,
        ));
        let service = SensorService::start(config, hdi).context("Failed to start sensor service")?;
        service.attach_reactor(Handle::current());

        let sensors_available = service.get_sensor_list().len();
        info!(sensors = sensors_available, "Sensor service running");

        let stop = Arc::new(AtomicBool::new(false));
        let mut clients = Vec::new();
        for (idx, spec) in self.run_config.subscriptions.iter().enumerate() {
            let caller = CallerInfo::new(DEMO_PID_BASE + idx as i32, DEMO_UID, idx as u64 + 1);
            match subscribe(&service, &caller, spec) {
                Ok(stream) => clients.push(DemoClient::spawn(
                    caller.pid,
                    spec.sensor_id,
                    stream,
                    &transport_config,
                    stop.clone(),
                )?),
                Err(e) => warn!(pid = caller.pid, sensor_id = spec.sensor_id, error = %e, "Subscription failed"),
            }
        }
        info!(subscribers = clients.len(), "Subscribers attached");

        match self.run_config.timeout {
            Some(timeout) => {
                tokio::select! {
                    _ = tokio::time::sleep(timeout) => info!(timeout_secs = timeout.as_secs(), "Run duration reached"),
                    _ = shutdown => warn!("Received shutdown signal, stopping broker..."),
                }
            }
            None => {
                shutdown.await;
                warn!("Received shutdown signal, stopping broker...");
            }
        }

        // Shutdown
        info!("Shutting down broker...");
        let mocked_sensors = service.hdi().mocked_sensors().len();
        stop.store(true, Ordering::Relaxed);
        let stopping = service.clone();
        tokio::task::spawn_blocking(move || stopping.stop())
            .await
            .context("Service shutdown task failed")?;

        let client_stats = tokio::task::spawn_blocking(move || {
            clients
                .into_iter()
                .filter_map(DemoClient::join)
                .collect::<Vec<_>>()
        })
        .await
        .context("Subscriber join task failed")?;

        Ok(RunStats {
            duration: start_time.elapsed(),
            sensors_available,
            mocked_sensors,
            clients: client_stats,
            dispatch: service.dispatch_summary(),
        })
    }
}

/// Open a data channel for `caller` and subscribe it
fn subscribe(
    service: &SensorService,
    caller: &CallerInfo,
    spec: &SubscriptionSpec,
) -> Result<UnixStream> {
    let stream = service
        .transfer_data_channel(caller)
        .context("Failed to open data channel")?;
    service
        .enable_sensor(
            caller,
            SensorId::new(spec.sensor_id),
            spec.period_ns(),
            spec.delay_ns(),
        )
        .context("Failed to enable sensor")?;
    info!(
        pid = caller.pid,
        sensor_id = spec.sensor_id,
        period_ms = spec.period_ms,
        "Subscriber enabled"
    );
    Ok(stream)
}

/// Blocking receive thread standing in for a client process
struct DemoClient {
    pid: i32,
    handle: JoinHandle<ClientStats>,
}

impl DemoClient {
    fn spawn(
        pid: i32,
        sensor_id: i32,
        stream: UnixStream,
        config: &TransportConfig,
        stop: Arc<AtomicBool>,
    ) -> Result<Self> {
        let mut client = StreamClient::new(stream, config);
        let handle = std::thread::Builder::new()
            .name(format!("client-{pid}"))
            .spawn(move || {
                let mut stats = ClientStats {
                    pid,
                    sensor_id,
                    ..Default::default()
                };
                while !stop.load(Ordering::Relaxed) {
                    match client.recv_timeout(CLIENT_POLL) {
                        Ok(Some(packet)) => {
                            stats.bytes += packet.packet_len() as u64;
                            match packet.message_id() {
                                Ok(MessageId::FlushComplete) => stats.flush_completions += 1,
                                Ok(_) => stats.events += 1,
                                Err(e) => debug!(pid, error = %e, "Unknown frame"),
                            }
                        }
                        Ok(None) => {}
                        Err(TransportError::ChannelClosed { .. }) => {
                            stats.hung_up = !stop.load(Ordering::Relaxed);
                            break;
                        }
                        Err(e) => {
                            warn!(pid, error = %e, "Subscriber receive failed");
                            break;
                        }
                    }
                }
                stats
            })
            .context("Failed to spawn subscriber thread")?;
        Ok(Self { pid, handle })
    }

    fn join(self) -> Option<ClientStats> {
        match self.handle.join() {
            Ok(stats) => Some(stats),
            Err(_) => {
                warn!(pid = self.pid, "Subscriber thread panicked");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_broker_delivers_to_subscribers() {
        let mut config = BrokerConfig::default();
        config.hdi.backend = contracts::BackendKind::Compatible;
        config.hdi.inject_on_start = vec![contracts::sensor_type::COLOR];

        let broker = Broker::new(BrokerRunConfig {
            config,
            subscriptions: vec![
                SubscriptionSpec {
                    sensor_id: 1,
                    period_ms: 10,
                    delay_ms: 0,
                },
                SubscriptionSpec {
                    sensor_id: 14,
                    period_ms: 100,
                    delay_ms: 0,
                },
            ],
            timeout: Some(Duration::from_millis(400)),
            metrics_port: None,
        });

        let stats = broker.run(std::future::pending()).await.unwrap();
        assert_eq!(stats.clients.len(), 2);
        assert!(stats.clients[0].events > 0);
        assert_eq!(stats.mocked_sensors, 1);
        assert!(stats.dispatch.total_events > 0);
    }
}
