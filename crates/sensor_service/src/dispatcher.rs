//! EventDispatcher - hardware events to subscriber channels
//!
//! The backend data callback only pushes into a bounded queue. A dedicated
//! thread drains it, looks up the channels of the event's subscribers and
//! writes one encoded frame to each. A channel that fails fatally is torn
//! down without affecting the others.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use async_channel::{bounded, Receiver, Sender, TrySendError};
use bytes::Bytes;
use contracts::{MessageId, SensorDataCallback, SensorEvent};
use observability::{DispatchAggregator, MetricsSummary};
use parking_lot::Mutex;
use tracing::{debug, info, trace, warn};
use transport::NetPacket;

use crate::client_info::ClientRegistry;
use crate::flush_info::FlushCoordinator;

/// Routes one event at a time
pub(crate) struct EventRouter {
    registry: Arc<ClientRegistry>,
    flush: Arc<FlushCoordinator>,
    max_packet_size: u32,
    aggregator: Arc<Mutex<DispatchAggregator>>,
}

impl EventRouter {
    pub(crate) fn new(
        registry: Arc<ClientRegistry>,
        flush: Arc<FlushCoordinator>,
        max_packet_size: u32,
    ) -> Self {
        Self {
            registry,
            flush,
            max_packet_size,
            aggregator: Arc::new(Mutex::new(DispatchAggregator::new())),
        }
    }

    pub(crate) fn route(&self, event: SensorEvent) {
        if event.is_flush_complete() {
            self.deliver_flush(event);
        } else {
            self.deliver_data(event);
        }
    }

    fn deliver_data(&self, event: SensorEvent) {
        let sensor_id = event.sensor_id;
        self.registry.store_event(&event);

        let Some(frame) = self.encode(MessageId::SensorEvent, &event) else {
            return;
        };

        let mut fan_out = 0;
        let mut errors = 0;
        for channel in self.registry.active_channels(sensor_id) {
            match channel.send_frame(&frame) {
                Ok(()) => fan_out += 1,
                Err(e) => {
                    errors += 1;
                    if e.is_fatal() {
                        warn!(pid = channel.pid(), fd = channel.fd(), error = %e, "tearing down channel");
                        self.registry.release_channel_if_current(&channel);
                    } else {
                        debug!(pid = channel.pid(), error = %e, "event not delivered");
                    }
                }
            }
        }

        trace!(sensor_id = %sensor_id, fan_out, errors, "event dispatched");
        observability::record_event_dispatched(sensor_id.get(), fan_out);
        self.aggregator.lock().on_event(sensor_id.get(), fan_out, errors);
    }

    fn deliver_flush(&self, event: SensorEvent) {
        let Some(entry) = self.flush.on_flush_completed(event.sensor_id) else {
            self.aggregator.lock().on_flush(false);
            return;
        };

        if entry.is_first {
            debug!(pid = entry.pid, sensor_id = %entry.sensor_id, "initial flush drained");
        }

        let delivered = match self.encode(MessageId::FlushComplete, &event) {
            Some(frame) => match entry.channel.send_frame(&frame) {
                Ok(()) => true,
                Err(e) => {
                    warn!(pid = entry.pid, error = %e, "flush completion not delivered");
                    if e.is_fatal() {
                        self.registry.release_channel_if_current(&entry.channel);
                    }
                    false
                }
            },
            None => false,
        };
        self.aggregator.lock().on_flush(delivered);
    }

    fn encode(&self, msg_id: MessageId, event: &SensorEvent) -> Option<Bytes> {
        match NetPacket::encode(msg_id, event).and_then(|p| p.to_frame(self.max_packet_size)) {
            Ok(frame) => Some(frame),
            Err(e) => {
                warn!(sensor_id = %event.sensor_id, error = %e, "event cannot be framed");
                None
            }
        }
    }

    pub(crate) fn summary(&self, dropped_events: u64) -> MetricsSummary {
        let mut summary = self.aggregator.lock().summary();
        summary.dropped_events = dropped_events;
        summary
    }
}

/// Dispatch thread plus the queue feeding it
pub struct EventDispatcher {
    tx: Sender<SensorEvent>,
    router: Arc<EventRouter>,
    handle: Mutex<Option<JoinHandle<()>>>,
    dropped: Arc<AtomicU64>,
}

impl EventDispatcher {
    /// Start the dispatch thread
    pub fn spawn(
        capacity: usize,
        registry: Arc<ClientRegistry>,
        flush: Arc<FlushCoordinator>,
        max_packet_size: u32,
    ) -> std::io::Result<Self> {
        let (tx, rx) = bounded(capacity);
        let router = Arc::new(EventRouter::new(registry, flush, max_packet_size));

        let loop_router = router.clone();
        let handle = std::thread::Builder::new()
            .name("sensor-dispatch".into())
            .spawn(move || run(rx, loop_router))?;

        Ok(Self {
            tx,
            router,
            handle: Mutex::new(Some(handle)),
            dropped: Arc::new(AtomicU64::new(0)),
        })
    }

    /// Data callback to register with the hardware connection
    ///
    /// Data events are dropped when the queue is full; flush completions
    /// wait for room, since losing one would shift every later attribution.
    pub fn callback(&self) -> SensorDataCallback {
        let tx = self.tx.clone();
        let dropped = self.dropped.clone();
        Arc::new(move |event: SensorEvent| {
            if event.is_flush_complete() {
                if tx.send_blocking(event).is_err() {
                    trace!("dispatcher stopped, flush completion dropped");
                }
                return;
            }
            match tx.try_send(event) {
                Ok(()) => {}
                Err(TrySendError::Full(event)) => {
                    dropped.fetch_add(1, Ordering::Relaxed);
                    observability::record_event_dropped(event.sensor_id.get());
                    trace!(sensor_id = %event.sensor_id, "event queue full, dropped");
                }
                Err(TrySendError::Closed(_)) => {}
            }
        })
    }

    /// Routing totals, including data events dropped on a full queue
    pub fn summary(&self) -> MetricsSummary {
        self.router.summary(self.dropped.load(Ordering::Relaxed))
    }

    /// Close the queue, drain what is left and join the thread
    pub fn shutdown(&self) {
        self.tx.close();
        if let Some(handle) = self.handle.lock().take() {
            if handle.join().is_err() {
                warn!("dispatch thread panicked");
            }
        }
    }
}

impl Drop for EventDispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run(rx: Receiver<SensorEvent>, router: Arc<EventRouter>) {
    info!("dispatcher started");
    let mut count: u64 = 0;
    while let Ok(event) = rx.recv_blocking() {
        router.route(event);
        count += 1;
        if count.is_multiple_of(1000) {
            debug!(events = count, "dispatcher progress");
        }
    }
    info!(events = count, "dispatcher stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use contracts::{sensor_type, SensorId, TransportConfig};
    use std::time::Duration;
    use transport::{StreamClient, StreamSession};

    const ACC: SensorId = sensor_type::ACCELEROMETER;

    fn subscribed_client(
        registry: &ClientRegistry,
        pid: i32,
    ) -> (Arc<StreamSession>, StreamClient) {
        let config = TransportConfig::default();
        let (session, client) = StreamSession::pair(pid, 1, 0, &config).unwrap();
        registry.update_sensor_channel(pid, session.clone());
        registry.add_subscription(pid, ACC, 1_000_000, 0).unwrap();
        (session, StreamClient::new(client, &config))
    }

    #[test]
    fn test_event_reaches_every_subscriber() {
        let registry = Arc::new(ClientRegistry::new());
        let router = EventRouter::new(registry.clone(), Arc::new(FlushCoordinator::new()), 256);
        let (_a, mut client_a) = subscribed_client(&registry, 1);
        let (_b, mut client_b) = subscribed_client(&registry, 2);

        router.route(SensorEvent::new(ACC, 5, vec![1u8; 12]));

        for client in [&mut client_a, &mut client_b] {
            let packet = client
                .recv_timeout(Duration::from_millis(100))
                .unwrap()
                .unwrap();
            assert_eq!(packet.message_id().unwrap(), MessageId::SensorEvent);
            assert_eq!(packet.decode::<SensorEvent>().unwrap().timestamp, 5);
        }
        assert_eq!(router.summary(0).total_events, 1);
        assert!(registry.stored_event(ACC).is_some());
    }

    #[test]
    fn test_dead_channel_torn_down_others_still_served() {
        let registry = Arc::new(ClientRegistry::new());
        let router = EventRouter::new(registry.clone(), Arc::new(FlushCoordinator::new()), 256);
        let (dead, _dead_client) = subscribed_client(&registry, 1);
        let (_live, mut live_client) = subscribed_client(&registry, 2);
        dead.close();

        router.route(SensorEvent::new(ACC, 1, vec![0u8; 4]));

        assert!(registry.channel_for(1).is_none());
        assert!(live_client
            .recv_timeout(Duration::from_millis(100))
            .unwrap()
            .is_some());
        assert_eq!(router.summary(0).channel_errors, 1);
    }

    #[test]
    fn test_unrequested_flush_completion_is_dropped() {
        let registry = Arc::new(ClientRegistry::new());
        let router = EventRouter::new(registry, Arc::new(FlushCoordinator::new()), 256);
        router.route(SensorEvent::flush_complete(ACC, 0));
        assert_eq!(router.summary(0).flushes_dropped, 1);
    }

    #[test]
    fn test_thread_drains_queue_on_shutdown() {
        let registry = Arc::new(ClientRegistry::new());
        let (_session, mut client) = subscribed_client(&registry, 1);
        let dispatcher =
            EventDispatcher::spawn(16, registry, Arc::new(FlushCoordinator::new()), 256).unwrap();

        let callback = dispatcher.callback();
        for ts in 0..4 {
            callback(SensorEvent::new(ACC, ts, vec![0u8; 4]));
        }
        dispatcher.shutdown();

        let packets = client.recv_all(Duration::from_millis(50)).unwrap();
        assert_eq!(packets.len(), 4);
        assert_eq!(dispatcher.summary().total_events, 4);
    }

    #[test]
    fn test_full_queue_drops_are_counted() {
        let registry = Arc::new(ClientRegistry::new());
        let dispatcher =
            EventDispatcher::spawn(1, registry, Arc::new(FlushCoordinator::new()), 256).unwrap();

        let callback = dispatcher.callback();
        for ts in 0..2000 {
            callback(SensorEvent::new(ACC, ts, vec![0u8; 4]));
        }
        dispatcher.shutdown();

        let summary = dispatcher.summary();
        assert_eq!(summary.total_events + summary.dropped_events, 2000);
    }
}
