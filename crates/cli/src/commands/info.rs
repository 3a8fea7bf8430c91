//! `info` command implementation.

use anyhow::{Context, Result};
use contracts::{BrokerConfig, SensorDescriptor};
use hdi_connection::{mock_descriptor, CompatibleConnection, SensorDevice};
use serde::Serialize;
use tracing::info;

use crate::cli::InfoArgs;

/// Configuration info for JSON output
#[derive(Serialize)]
struct ConfigInfo {
    backend: String,
    default_sampling_period_ms: i64,
    max_event_count: i64,
    event_queue_capacity: usize,
    freezing_exempt: Vec<i32>,
    transport: TransportInfo,
    supported_mock_sensors: Vec<i32>,
    inject_on_start: Vec<i32>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    sensors: Vec<SensorInfo>,
}

#[derive(Serialize)]
struct TransportInfo {
    max_packet_size: u32,
    once_process_limit: usize,
    poll_timeout_ms: u64,
    pending_queue_capacity: usize,
}

#[derive(Serialize)]
struct SensorInfo {
    sensor_id: i32,
    name: String,
    vendor: String,
    min_period_ms: i64,
    max_period_ms: i64,
    on_change: bool,
    mock: bool,
}

impl SensorInfo {
    fn from_descriptor(d: &SensorDescriptor, mock: bool) -> Self {
        Self {
            sensor_id: d.sensor_id.get(),
            name: d.sensor_name.clone(),
            vendor: d.vendor_name.clone(),
            min_period_ms: d.min_sample_period_ns / 1_000_000,
            max_period_ms: d.max_sample_period_ns / 1_000_000,
            on_change: d.is_on_change(),
            mock,
        }
    }
}

/// Execute the `info` command
pub fn run_info(args: &InfoArgs) -> Result<()> {
    let config = super::load_config(args.config.as_deref())?;
    let sensors = if args.sensors {
        software_sensors(&config)?
    } else {
        Vec::new()
    };
    info!(sensors = sensors.len(), "Collected configuration info");

    let info = build_config_info(&config, sensors);
    if args.json {
        let json =
            serde_json::to_string_pretty(&info).context("Failed to serialize config info")?;
        println!("{}", json);
    } else {
        print_config_info(&info);
    }
    Ok(())
}

/// Sensors of the software backend plus every mock it can stand in for
fn software_sensors(config: &BrokerConfig) -> Result<Vec<SensorInfo>> {
    let backend = CompatibleConnection::new();
    backend.connect().context("Failed to open software backend")?;
    let list = backend
        .sensor_list()
        .context("Failed to list software sensors")?;
    backend.disconnect().ok();

    let mut sensors: Vec<SensorInfo> = list
        .iter()
        .map(|d| SensorInfo::from_descriptor(d, false))
        .collect();
    sensors.extend(
        config
            .hdi
            .supported_mock_sensors
            .iter()
            .filter_map(|id| mock_descriptor(*id))
            .map(|d| SensorInfo::from_descriptor(&d, true)),
    );
    Ok(sensors)
}

fn build_config_info(config: &BrokerConfig, sensors: Vec<SensorInfo>) -> ConfigInfo {
    let ids = |list: &[contracts::SensorId]| list.iter().map(|id| id.get()).collect();
    ConfigInfo {
        backend: format!("{:?}", config.hdi.backend),
        default_sampling_period_ms: config.service.default_sampling_period_ns / 1_000_000,
        max_event_count: config.service.max_event_count,
        event_queue_capacity: config.service.event_queue_capacity,
        freezing_exempt: ids(&config.service.freezing_exempt),
        transport: TransportInfo {
            max_packet_size: config.transport.max_packet_size,
            once_process_limit: config.transport.once_process_limit,
            poll_timeout_ms: config.transport.poll_timeout_ms,
            pending_queue_capacity: config.transport.pending_queue_capacity,
        },
        supported_mock_sensors: ids(&config.hdi.supported_mock_sensors),
        inject_on_start: ids(&config.hdi.inject_on_start),
        sensors,
    }
}

fn print_config_info(info: &ConfigInfo) {
    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║                  Sensor Broker Configuration                 ║");
    println!("╚══════════════════════════════════════════════════════════════╝\n");

    println!("⚙️  Service");
    println!(
        "   ├─ Default sampling period: {} ms",
        info.default_sampling_period_ms
    );
    println!("   ├─ Max event count: {}", info.max_event_count);
    println!("   ├─ Event queue: {}", info.event_queue_capacity);
    println!("   └─ Freezing exempt: {:?}", info.freezing_exempt);

    println!("\n🔌 Transport");
    println!("   ├─ Max packet size: {} bytes", info.transport.max_packet_size);
    println!("   ├─ Frames per pass: {}", info.transport.once_process_limit);
    println!("   ├─ Poll timeout: {} ms", info.transport.poll_timeout_ms);
    println!(
        "   └─ Pending queue: {} bytes",
        info.transport.pending_queue_capacity
    );

    println!("\n🧩 Hardware");
    println!("   ├─ Backend: {}", info.backend);
    println!("   ├─ Mockable: {:?}", info.supported_mock_sensors);
    println!("   └─ Injected at start: {:?}", info.inject_on_start);

    if !info.sensors.is_empty() {
        println!("\n📡 Sensors ({})", info.sensors.len());
        for (i, sensor) in info.sensors.iter().enumerate() {
            let prefix = if i == info.sensors.len() - 1 {
                "└─"
            } else {
                "├─"
            };
            println!(
                "   {} {:>4} {} ({}, {}-{} ms{}{})",
                prefix,
                sensor.sensor_id,
                sensor.name,
                sensor.vendor,
                sensor.min_period_ms,
                sensor.max_period_ms,
                if sensor.on_change { ", on-change" } else { "" },
                if sensor.mock { ", mock" } else { "" },
            );
        }
    }

    println!();
}
