//! Reactor - readiness-driven receive loop per channel
//!
//! One tokio task per registered session waits for readability with a
//! bounded timeout, pulls bytes into a `CircleStreamBuffer` and dispatches
//! whole frames. Peer hang-up is reported once through the disconnect
//! handler; locally closed sessions exit silently.

use std::collections::HashMap;
use std::io;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::time::Duration;

use contracts::TransportConfig;
use parking_lot::Mutex;
use tokio::net::UnixStream;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, instrument, trace, warn};

use crate::circle_buffer::CircleStreamBuffer;
use crate::error::Result;
use crate::packet::{NetPacket, HEADER_SIZE};
use crate::session::StreamSession;
use crate::stream_socket::on_read_packets;

/// Called for every frame received from a client
pub type PacketHandler = Arc<dyn Fn(&Arc<StreamSession>, NetPacket) + Send + Sync>;

/// Called once when a client hangs up
pub type DisconnectHandler = Arc<dyn Fn(&Arc<StreamSession>) + Send + Sync>;

/// Receive-side event loop
pub struct Reactor {
    handle: Handle,
    config: TransportConfig,
    on_packet: PacketHandler,
    on_disconnect: DisconnectHandler,
    tasks: Mutex<HashMap<RawFd, JoinHandle<()>>>,
}

impl Reactor {
    pub fn new(
        handle: Handle,
        config: TransportConfig,
        on_packet: PacketHandler,
        on_disconnect: DisconnectHandler,
    ) -> Self {
        Self {
            handle,
            config,
            on_packet,
            on_disconnect,
            tasks: Mutex::new(HashMap::new()),
        }
    }

    /// Start watching a session
    ///
    /// Registering the same fd again replaces the previous watcher.
    #[instrument(name = "reactor_register", skip(self, session), fields(fd = session.fd(), pid = session.pid()))]
    pub fn register(&self, session: Arc<StreamSession>) -> Result<()> {
        let std_stream = session.socket().try_clone()?;
        std_stream.set_nonblocking(true)?;

        let stream = {
            let _guard = self.handle.enter();
            UnixStream::from_std(std_stream)?
        };

        let fd = session.fd();
        let task = self.handle.spawn(channel_loop(
            session,
            stream,
            self.config.clone(),
            self.on_packet.clone(),
            self.on_disconnect.clone(),
        ));

        if let Some(old) = self.tasks.lock().insert(fd, task) {
            old.abort();
        }
        Ok(())
    }

    /// Stop watching an fd
    pub fn deregister(&self, fd: RawFd) {
        if let Some(task) = self.tasks.lock().remove(&fd) {
            task.abort();
            debug!(fd, "reactor watcher removed");
        }
    }

    pub fn watched_count(&self) -> usize {
        self.tasks.lock().retain(|_, task| !task.is_finished());
        self.tasks.lock().len()
    }

    /// Stop every watcher
    pub fn shutdown(&self) {
        for (_, task) in self.tasks.lock().drain() {
            task.abort();
        }
    }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[instrument(
    name = "reactor_channel_loop",
    skip(session, stream, config, on_packet, on_disconnect),
    fields(fd = session.fd(), pid = session.pid())
)]
async fn channel_loop(
    session: Arc<StreamSession>,
    stream: UnixStream,
    config: TransportConfig,
    on_packet: PacketHandler,
    on_disconnect: DisconnectHandler,
) {
    let limit = HEADER_SIZE + config.max_packet_size as usize + config.read_chunk;
    let mut buf = CircleStreamBuffer::new(limit);
    let mut chunk = vec![0u8; config.read_chunk];
    let poll_timeout = Duration::from_millis(config.poll_timeout_ms);

    debug!("reactor watcher started");

    loop {
        if session.is_closed() {
            break;
        }

        match tokio::time::timeout(poll_timeout, stream.readable()).await {
            Err(_) => {
                // 空闲时顺带发送积压数据
                if session.metrics().pending_bytes() > 0 {
                    if let Err(e) = session.flush_pending() {
                        trace!(error = %e, "pending flush on idle failed");
                    }
                }
                continue;
            }
            Ok(Err(e)) => {
                warn!(error = %e, "readiness wait failed");
                report_disconnect(&session, &on_disconnect);
                break;
            }
            Ok(Ok(())) => {}
        }

        match stream.try_read(&mut chunk) {
            Ok(0) => {
                report_disconnect(&session, &on_disconnect);
                break;
            }
            Ok(n) => {
                if !buf.write(&chunk[..n]) {
                    warn!(unread = buf.unread_size(), "receive buffer overflow, resetting");
                    buf.reset();
                    session.metrics().inc_protocol_resets();
                    continue;
                }

                loop {
                    let outcome = on_read_packets(
                        &mut buf,
                        config.once_process_limit,
                        config.max_packet_size,
                        |packet| on_packet(&session, packet),
                    );
                    session.metrics().add_frames_received(outcome.dispatched);
                    if outcome.reset {
                        session.metrics().inc_protocol_resets();
                    }
                    if !outcome.more {
                        break;
                    }
                    tokio::task::yield_now().await;
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
            Err(e) => {
                warn!(error = %e, "read failed");
                report_disconnect(&session, &on_disconnect);
                break;
            }
        }
    }

    debug!("reactor watcher stopped");
}

fn report_disconnect(session: &Arc<StreamSession>, on_disconnect: &DisconnectHandler) {
    if session.is_closed() {
        return;
    }
    debug!(fd = session.fd(), pid = session.pid(), "peer hung up");
    on_disconnect(session);
}

#[cfg(test)]
mod tests {
    use super::*;
    use contracts::MessageId;
    use std::io::Write;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::{sleep, Duration};

    fn config() -> TransportConfig {
        TransportConfig {
            poll_timeout_ms: 10,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_frames_split_across_reads_are_dispatched() {
        let received = Arc::new(Mutex::new(Vec::new()));
        let received_clone = received.clone();
        let reactor = Reactor::new(
            Handle::current(),
            config(),
            Arc::new(move |_, packet| received_clone.lock().push(packet)),
            Arc::new(|_| {}),
        );

        let (session, mut client) = StreamSession::pair(1, 1, 0, &config()).unwrap();
        reactor.register(session.clone()).unwrap();

        let frame = NetPacket::new(MessageId::SensorEvent, vec![5u8; 42])
            .to_frame(256)
            .unwrap();
        client.write_all(&frame[..30]).unwrap();
        sleep(Duration::from_millis(30)).await;
        assert!(received.lock().is_empty());

        client.write_all(&frame[30..]).unwrap();
        sleep(Duration::from_millis(30)).await;

        let packets = received.lock();
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].payload().len(), 42);
        assert_eq!(session.metrics().frames_received(), 1);
    }

    #[tokio::test]
    async fn test_hang_up_reported_once() {
        let hangups = Arc::new(AtomicUsize::new(0));
        let hangups_clone = hangups.clone();
        let reactor = Reactor::new(
            Handle::current(),
            config(),
            Arc::new(|_, _| {}),
            Arc::new(move |_| {
                hangups_clone.fetch_add(1, Ordering::SeqCst);
            }),
        );

        let (session, client) = StreamSession::pair(1, 1, 0, &config()).unwrap();
        reactor.register(session).unwrap();
        drop(client);

        sleep(Duration::from_millis(50)).await;
        assert_eq!(hangups.load(Ordering::SeqCst), 1);
        assert_eq!(reactor.watched_count(), 0);
    }

    #[tokio::test]
    async fn test_local_close_is_silent() {
        let hangups = Arc::new(AtomicUsize::new(0));
        let hangups_clone = hangups.clone();
        let reactor = Reactor::new(
            Handle::current(),
            config(),
            Arc::new(|_, _| {}),
            Arc::new(move |_| {
                hangups_clone.fetch_add(1, Ordering::SeqCst);
            }),
        );

        let (session, _client) = StreamSession::pair(1, 1, 0, &config()).unwrap();
        reactor.register(session.clone()).unwrap();
        session.close();

        sleep(Duration::from_millis(50)).await;
        assert_eq!(hangups.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_corrupt_header_resets_and_recovers() {
        let received = Arc::new(AtomicUsize::new(0));
        let received_clone = received.clone();
        let reactor = Reactor::new(
            Handle::current(),
            config(),
            Arc::new(move |_, _| {
                received_clone.fetch_add(1, Ordering::SeqCst);
            }),
            Arc::new(|_| {}),
        );

        let (session, mut client) = StreamSession::pair(1, 1, 0, &config()).unwrap();
        reactor.register(session.clone()).unwrap();

        let bad = crate::packet::PackHead {
            msg_id: 1,
            size: 100_000,
        };
        client.write_all(bytemuck::bytes_of(&bad)).unwrap();
        sleep(Duration::from_millis(30)).await;
        assert_eq!(session.metrics().protocol_resets(), 1);

        let frame = NetPacket::new(MessageId::FlushComplete, vec![1u8; 4])
            .to_frame(256)
            .unwrap();
        client.write_all(&frame).unwrap();
        sleep(Duration::from_millis(30)).await;
        assert_eq!(received.load(Ordering::SeqCst), 1);
    }
}
