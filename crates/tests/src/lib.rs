//! # Integration Tests
//!
//! 集成测试与端到端测试。
//!
//! 负责：
//! - 订阅仲裁、挂起恢复、flush 归属的跨模块场景
//! - 通过真实 socket 通道的端到端收发
//! - 配置加载到服务启动的完整链路

#[cfg(test)]
mod harness {
    use std::sync::Arc;
    use std::time::Duration;

    use contracts::{BrokerConfig, SensorEvent, SensorId};
    use hdi_connection::{HdiConnection, ScriptedConfig, ScriptedDevice, SensorDevice};
    use sensor_service::{CallerInfo, SensorService};
    use transport::{NetPacket, StreamClient};

    pub const MS: i64 = 1_000_000;
    pub const WAIT: Duration = Duration::from_millis(300);

    pub struct Broker {
        pub service: Arc<SensorService>,
        pub real: Arc<ScriptedDevice>,
        pub compatible: Arc<ScriptedDevice>,
    }

    /// Service over a scripted primary exposing `sensors` and a scripted
    /// compatible backend for mocks
    pub fn broker(config: BrokerConfig, sensors: &[SensorId], auto_flush: bool) -> Broker {
        let mut real_config = ScriptedConfig::with_sensors("real", sensors);
        real_config.auto_flush_complete = auto_flush;
        let real = Arc::new(ScriptedDevice::new(real_config));
        let compatible = Arc::new(ScriptedDevice::new(ScriptedConfig::with_sensors(
            "compatible",
            &[],
        )));

        let factory_device = compatible.clone();
        let hdi = Arc::new(HdiConnection::with_factory(
            real.clone(),
            Box::new(move || factory_device.clone() as Arc<dyn SensorDevice>),
            &config.hdi,
        ));
        let service = SensorService::start(config, hdi).unwrap();
        Broker {
            service,
            real,
            compatible,
        }
    }

    pub fn caller(pid: i32) -> CallerInfo {
        CallerInfo::new(pid, 2000 + pid, pid as u64)
    }

    pub fn data_client(broker: &Broker, caller: &CallerInfo) -> StreamClient {
        let stream = broker.service.transfer_data_channel(caller).unwrap();
        StreamClient::new(stream, &broker.service.config().transport)
    }

    pub fn decode_events(packets: &[NetPacket]) -> Vec<SensorEvent> {
        packets.iter().map(|p| p.decode().unwrap()).collect()
    }
}

#[cfg(test)]
mod arbitration_tests {
    use super::harness::*;
    use contracts::{sensor_type, BrokerConfig, SensorId};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    const ACC: SensorId = sensor_type::ACCELEROMETER;

    /// 两个客户端 100ms / 200ms，硬件取最快；快的离开后回落
    #[test]
    fn test_fastest_subscriber_wins_and_reverts() {
        let b = broker(BrokerConfig::default(), &[ACC], true);
        let (p1, p2) = (caller(100), caller(200));

        b.service.enable_sensor(&p1, ACC, 100 * MS, 0).unwrap();
        b.service.enable_sensor(&p2, ACC, 200 * MS, 0).unwrap();
        assert_eq!(b.real.last_batch(ACC), Some((100 * MS, 0)));

        b.service.disable_sensor(&p1, ACC).unwrap();
        assert_eq!(b.real.last_batch(ACC), Some((200 * MS, 0)));
        assert!(b.real.is_enabled(ACC));

        b.service.disable_sensor(&p2, ACC).unwrap();
        assert!(!b.real.is_enabled(ACC));
        assert!(b.service.active_state(ACC).is_none());
    }

    #[test]
    fn test_failed_enable_leaves_no_trace() {
        let b = broker(BrokerConfig::default(), &[ACC], true);
        b.real.set_fail_enable(vec![ACC]);

        assert!(b.service.enable_sensor(&caller(1), ACC, 50 * MS, 0).is_err());
        assert!(b.service.registry().sensors_of(1).is_empty());
        assert!(b.service.active_state(ACC).is_none());
        assert!(b.service.get_active_info_list(1).unwrap().is_empty());
    }

    /// 随机的挂起/恢复/启停序列后，硬件周期始终等于活跃订阅的最小值
    #[test]
    fn test_random_suspend_resume_keeps_minimum() {
        let b = broker(BrokerConfig::default(), &[ACC], true);
        let mut rng = StdRng::seed_from_u64(0x5e50);
        let periods = [20 * MS, 50 * MS, 100 * MS, 200 * MS];

        for _ in 0..300 {
            let pid = rng.random_range(1..=4);
            match rng.random_range(0..4) {
                0 => {
                    let period = periods[rng.random_range(0..periods.len())];
                    let _ = b.service.enable_sensor(&caller(pid), ACC, period, 0);
                }
                1 => {
                    let _ = b.service.disable_sensor(&caller(pid), ACC);
                }
                2 => {
                    b.service.suspend_sensors(pid).unwrap();
                }
                _ => {
                    let _ = b.service.resume_sensors(pid);
                }
            }

            let subscribers = b.service.registry().subscriptions_of(ACC);
            match subscribers.iter().map(|(_, info)| info.sampling_period_ns).min() {
                Some(min) => {
                    assert!(b.real.is_enabled(ACC));
                    assert_eq!(b.real.last_batch(ACC).map(|(p, _)| p), Some(min));
                }
                None => assert!(!b.real.is_enabled(ACC)),
            }
        }
    }
}

#[cfg(test)]
mod suspend_tests {
    use super::harness::*;
    use contracts::{sensor_type, BrokerConfig, SensorId};

    const ACC: SensorId = sensor_type::ACCELEROMETER;
    const PEDOMETER: SensorId = sensor_type::PEDOMETER;

    #[test]
    fn test_sole_subscriber_suspend_and_resume() {
        let b = broker(BrokerConfig::default(), &[ACC], true);
        let p = caller(300);
        b.service.enable_sensor(&p, ACC, 100 * MS, 0).unwrap();

        let outcome = b.service.suspend_sensors(300).unwrap();
        assert_eq!(outcome.succeeded, vec![ACC]);
        assert!(!b.real.is_enabled(ACC));
        assert!(b.service.is_suspended(300));

        let outcome = b.service.resume_sensors(300).unwrap();
        assert!(outcome.is_complete());
        assert!(b.real.is_enabled(ACC));
        assert_eq!(b.real.last_batch(ACC), Some((100 * MS, 0)));
        assert!(!b.service.is_suspended(300));
    }

    #[test]
    fn test_exempt_sensor_keeps_running_while_frozen() {
        let b = broker(BrokerConfig::default(), &[ACC, PEDOMETER], true);
        let p = caller(10);
        b.service.enable_sensor(&p, ACC, 100 * MS, 0).unwrap();
        b.service.enable_sensor(&p, PEDOMETER, 100 * MS, 0).unwrap();

        let outcome = b.service.suspend_sensors(10).unwrap();
        assert_eq!(outcome.succeeded, vec![ACC]);
        assert!(b.real.is_enabled(PEDOMETER));
        assert_eq!(b.service.registry().sensors_of(10), vec![PEDOMETER]);
    }

    #[test]
    fn test_resume_without_suspend_fails() {
        let b = broker(BrokerConfig::default(), &[ACC], true);
        assert!(matches!(
            b.service.resume_sensors(42),
            Err(sensor_service::ServiceError::NotSuspended(42))
        ));
    }

    #[test]
    fn test_reset_restores_every_frozen_pid() {
        let b = broker(BrokerConfig::default(), &[ACC], true);
        for pid in [1, 2] {
            b.service
                .enable_sensor(&caller(pid), ACC, pid as i64 * 100 * MS, 0)
                .unwrap();
            b.service.suspend_sensors(pid).unwrap();
        }
        assert!(!b.real.is_enabled(ACC));

        let outcome = b.service.reset_sensors();
        assert_eq!(outcome.succeeded.len(), 2);
        assert_eq!(b.real.last_batch(ACC), Some((100 * MS, 0)));
    }
}

#[cfg(test)]
mod flush_tests {
    use super::harness::*;
    use contracts::{sensor_type, BrokerConfig, MessageId, SensorEvent, SensorId};
    use std::time::Duration;

    const ACC: SensorId = sensor_type::ACCELEROMETER;

    /// 共享的硬件 flush：完成事件按请求顺序归属
    #[test]
    fn test_completions_attributed_in_request_order() {
        let b = broker(BrokerConfig::default(), &[ACC], false);
        let (first, second) = (caller(1), caller(2));
        let mut c1 = data_client(&b, &first);
        let mut c2 = data_client(&b, &second);
        b.service.enable_sensor(&first, ACC, 10 * MS, 0).unwrap();
        b.service.enable_sensor(&second, ACC, 10 * MS, 0).unwrap();
        // 加入运行中的传感器，服务代为 flush，完成通知属于第二个客户端
        b.real.emit(SensorEvent::flush_complete(ACC, 0));
        let packet = c2.recv_timeout(WAIT).unwrap().unwrap();
        assert_eq!(packet.message_id().unwrap(), MessageId::FlushComplete);
        assert!(c1.recv_timeout(Duration::from_millis(50)).unwrap().is_none());
        assert_eq!(b.service.flush_coordinator().pending_count(), 0);

        b.service.flush(&first, ACC).unwrap();
        b.service.flush(&second, ACC).unwrap();
        assert_eq!(b.service.flush_coordinator().pending(ACC), vec![1, 2]);

        b.real.emit(SensorEvent::flush_complete(ACC, 1));
        let packet = c1.recv_timeout(WAIT).unwrap().unwrap();
        assert_eq!(packet.message_id().unwrap(), MessageId::FlushComplete);
        assert!(c2.recv_timeout(Duration::from_millis(50)).unwrap().is_none());

        b.real.emit(SensorEvent::flush_complete(ACC, 2));
        let packet = c2.recv_timeout(WAIT).unwrap().unwrap();
        assert_eq!(packet.message_id().unwrap(), MessageId::FlushComplete);
        assert_eq!(b.service.flush_coordinator().pending_count(), 0);
    }

    #[test]
    fn test_flush_without_channel_is_channel_error() {
        let b = broker(BrokerConfig::default(), &[ACC], true);
        let p = caller(7);
        b.service.enable_sensor(&p, ACC, 10 * MS, 0).unwrap();
        assert!(matches!(
            b.service.flush(&p, ACC),
            Err(sensor_service::ServiceError::ChannelError { .. })
        ));
    }
}

#[cfg(test)]
mod e2e_tests {
    use super::harness::*;
    use contracts::{sensor_type, BrokerConfig, SensorEvent, SensorId};
    use std::time::Duration;
    use tokio::runtime::Handle;

    const ACC: SensorId = sensor_type::ACCELEROMETER;
    const GYRO: SensorId = sensor_type::GYROSCOPE;

    /// 硬件事件 -> 分发线程 -> 每个订阅者的 socket
    #[test]
    fn test_events_reach_only_subscribers() {
        let b = broker(BrokerConfig::default(), &[ACC, GYRO], true);
        let (acc_user, gyro_user) = (caller(1), caller(2));
        let mut acc_client = data_client(&b, &acc_user);
        let mut gyro_client = data_client(&b, &gyro_user);
        b.service.enable_sensor(&acc_user, ACC, 10 * MS, 0).unwrap();
        b.service.enable_sensor(&gyro_user, GYRO, 10 * MS, 0).unwrap();

        for ts in 0..5 {
            b.real.emit(SensorEvent::new(ACC, ts, vec![1u8; 12]));
        }
        b.real.emit(SensorEvent::new(GYRO, 99, vec![2u8; 12]));

        std::thread::sleep(Duration::from_millis(100));
        let acc_events = decode_events(&acc_client.recv_all(Duration::from_millis(50)).unwrap());
        let gyro_events = decode_events(&gyro_client.recv_all(Duration::from_millis(50)).unwrap());

        assert_eq!(
            acc_events.iter().map(|e| e.timestamp).collect::<Vec<_>>(),
            vec![0, 1, 2, 3, 4]
        );
        assert_eq!(gyro_events.len(), 1);
        assert_eq!(gyro_events[0].sensor_id, GYRO);
        assert_eq!(b.service.dispatch_summary().total_events, 6);
    }

    /// 注入的 mock 与真实传感器并存，调用路由到兼容后端
    #[test]
    fn test_mock_injection_extends_sensor_list() {
        let b = broker(BrokerConfig::default(), &[ACC], true);
        b.service.inject_mock_sensor(sensor_type::SAR).unwrap();

        let ids: Vec<_> = b
            .service
            .get_sensor_list()
            .iter()
            .map(|d| d.sensor_id)
            .collect();
        assert_eq!(ids, vec![ACC, sensor_type::SAR]);

        b.service
            .enable_sensor(&caller(5), sensor_type::SAR, 100 * MS, 0)
            .unwrap();
        assert!(b.compatible.is_enabled(sensor_type::SAR));
        assert!(!b.real.is_enabled(sensor_type::SAR));

        // 真实存在的传感器不能再注入
        assert!(b.service.inject_mock_sensor(ACC).is_err());
    }

    #[test]
    fn test_startup_injection_from_config() {
        let config = config_loader::ConfigLoader::load_from_str(
            "[hdi]\ninject_on_start = [20]\n",
            config_loader::ConfigFormat::Toml,
        )
        .unwrap();
        let b = broker(config, &[ACC], true);
        assert!(b.service.hdi().is_mocked(sensor_type::POSTURE));
    }

    #[test]
    fn test_explicit_death_notification_unwinds_everything() {
        let b = broker(BrokerConfig::default(), &[ACC, GYRO], true);
        let p = caller(77);
        let _client = data_client(&b, &p);
        let _socket = b.service.create_socket_channel(&p).unwrap();
        b.service.enable_sensor(&p, ACC, 10 * MS, 0).unwrap();
        b.service.enable_sensor(&p, GYRO, 10 * MS, 0).unwrap();

        let outcome = b.service.on_client_died(p.token).unwrap();
        assert_eq!(outcome.succeeded.len(), 2);
        assert_eq!(b.real.enabled_count(), 0);
        assert!(b.service.registry().channel_for(77).is_none());
        assert!(b.service.server().get_session_by_pid(77).is_none());
    }

    /// 客户端 socket 挂断等同进程死亡
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_hangup_unwinds_subscriptions() {
        let b = broker(BrokerConfig::default(), &[ACC], true);
        b.service.attach_reactor(Handle::current());

        let (stays, leaves) = (caller(1), caller(2));
        let _kept = data_client(&b, &stays);
        let dropped = b.service.transfer_data_channel(&leaves).unwrap();
        b.service.enable_sensor(&stays, ACC, 200 * MS, 0).unwrap();
        b.service.enable_sensor(&leaves, ACC, 20 * MS, 0).unwrap();
        assert_eq!(b.real.last_batch(ACC), Some((20 * MS, 0)));

        drop(dropped);
        tokio::time::sleep(Duration::from_millis(400)).await;

        assert!(b.service.registry().sensors_of(2).is_empty());
        assert_eq!(b.real.last_batch(ACC), Some((200 * MS, 0)));
        assert!(b.real.is_enabled(ACC));
        b.service.stop();
    }
}

#[cfg(test)]
mod transport_tests {
    use std::io::Write;
    use std::sync::Arc;
    use std::time::Duration;

    use contracts::{ActiveInfo, MessageId, SensorId, TransportConfig};
    use parking_lot::Mutex;
    use tokio::runtime::Handle;
    use transport::{NetPacket, Reactor, StreamSession};

    /// 一帧被拆成两次写入，接收端仍然只交付一次完整帧
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_frame_split_across_writes() {
        let config = TransportConfig::default();
        let (session, mut client) = StreamSession::pair(1, 1, 0, &config).unwrap();
        session.bind().unwrap();

        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = received.clone();
        let reactor = Reactor::new(
            Handle::current(),
            config.clone(),
            Arc::new(move |_: &Arc<StreamSession>, packet: NetPacket| sink.lock().push(packet)),
            Arc::new(|_: &Arc<StreamSession>| {}),
        );
        reactor.register(session.clone()).unwrap();

        let info = ActiveInfo::new(1, SensorId::new(1), 100, 0);
        let frame = NetPacket::encode(MessageId::ActiveInfo, &info)
            .unwrap()
            .to_frame(config.max_packet_size)
            .unwrap();

        client.write_all(&frame[..5]).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(received.lock().is_empty());

        client.write_all(&frame[5..]).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let packets = received.lock();
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].decode::<ActiveInfo>().unwrap(), info);
        reactor.shutdown();
    }

    #[test]
    fn test_multicast_reports_dead_receivers() {
        let server = transport::StreamServer::new(TransportConfig::default());
        let (live, _live_client) = server.add_socket_pair_info(1, 10, 0).unwrap();
        let (dead, dead_client) = server.add_socket_pair_info(1, 11, 0).unwrap();
        drop(dead_client);

        let packet = NetPacket::new(MessageId::ActiveInfo, vec![0u8; 8]);
        let report = server.multicast(&[live.fd(), dead.fd(), -1], &packet).unwrap();
        assert_eq!(report.delivered, vec![live.fd()]);
        assert_eq!(report.failed.len(), 2);
    }
}
