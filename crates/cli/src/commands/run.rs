//! `run` command implementation.

use anyhow::{Context, Result};
use contracts::{BrokerConfig, SensorId};
use std::time::Duration;
use tracing::info;

use crate::cli::RunArgs;
use crate::pipeline::{Broker, BrokerRunConfig};

/// Execute the `run` command
pub async fn run_broker(args: &RunArgs) -> Result<()> {
    let mut config = super::load_config(args.config.as_deref())?;

    // Apply CLI overrides
    if let Some(backend) = args.backend {
        info!(?backend, "Overriding backend from CLI");
        config.hdi.backend = backend.into();
    }
    for id in &args.inject {
        let id = SensorId::new(*id);
        if !config.hdi.inject_on_start.contains(&id) {
            config.hdi.inject_on_start.push(id);
        }
    }
    config_loader::ConfigLoader::validate(&config).context("Invalid configuration after overrides")?;

    info!(
        backend = ?config.hdi.backend,
        inject = ?config.hdi.inject_on_start,
        max_packet_size = config.transport.max_packet_size,
        subscriptions = args.subscriptions.len(),
        "Configuration loaded"
    );

    // Dry run - just validate and exit
    if args.dry_run {
        info!("Dry run mode - configuration is valid, exiting");
        print_config_summary(&config);
        return Ok(());
    }

    let broker = Broker::new(BrokerRunConfig {
        config,
        subscriptions: args.subscriptions.clone(),
        timeout: (args.timeout > 0).then(|| Duration::from_secs(args.timeout)),
        metrics_port: (args.metrics_port > 0).then_some(args.metrics_port),
    });

    let stats = broker
        .run(shutdown_signal())
        .await
        .context("Broker execution failed")?;

    info!(
        duration_secs = stats.duration.as_secs_f64(),
        events = stats.dispatch.total_events,
        "Broker stopped"
    );
    stats.print_summary();
    Ok(())
}

/// Resolves on Ctrl+C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "Ctrl+C handler unavailable");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "SIGTERM handler unavailable");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

/// Print configuration summary for dry-run mode
fn print_config_summary(config: &BrokerConfig) {
    println!("\n=== Configuration Summary ===\n");
    println!("Service:");
    println!(
        "  Default sampling period: {} ms",
        config.service.default_sampling_period_ns / 1_000_000
    );
    println!("  Max event count: {}", config.service.max_event_count);
    println!("  Event queue: {}", config.service.event_queue_capacity);
    println!("  Freezing exempt: {:?}", config.service.freezing_exempt);
    println!("\nTransport:");
    println!("  Max packet size: {} bytes", config.transport.max_packet_size);
    println!(
        "  Pending queue: {} bytes",
        config.transport.pending_queue_capacity
    );
    println!("\nHardware:");
    println!("  Backend: {:?}", config.hdi.backend);
    println!("  Mockable: {:?}", config.hdi.supported_mock_sensors);
    if !config.hdi.inject_on_start.is_empty() {
        println!("  Injected at start: {:?}", config.hdi.inject_on_start);
    }
    println!();
}
