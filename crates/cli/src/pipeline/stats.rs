//! Broker run statistics.

use std::time::Duration;

use observability::MetricsSummary;

/// What one in-process subscriber received
#[derive(Debug, Clone, Default)]
pub struct ClientStats {
    pub pid: i32,
    pub sensor_id: i32,
    pub events: u64,
    pub flush_completions: u64,
    pub bytes: u64,
    /// The broker closed the channel before shutdown
    pub hung_up: bool,
}

impl ClientStats {
    /// Received events per second over `duration`
    pub fn rate(&self, duration: Duration) -> f64 {
        if duration.as_secs_f64() > 0.0 {
            self.events as f64 / duration.as_secs_f64()
        } else {
            0.0
        }
    }
}

/// Statistics from a broker run
#[derive(Debug, Clone, Default)]
pub struct RunStats {
    /// Total duration of the run
    pub duration: Duration,

    /// Sensors listed by the connection after startup
    pub sensors_available: usize,

    /// Mocks present at shutdown
    pub mocked_sensors: usize,

    /// Per-subscriber receive counts
    pub clients: Vec<ClientStats>,

    /// Dispatcher counters
    pub dispatch: MetricsSummary,
}

impl RunStats {
    pub fn events_received(&self) -> u64 {
        self.clients.iter().map(|c| c.events).sum()
    }

    /// Print detailed summary
    pub fn print_summary(&self) {
        println!("\n╔══════════════════════════════════════════════════════════════╗");
        println!("║                      Broker Statistics                       ║");
        println!("╚══════════════════════════════════════════════════════════════╝\n");

        println!("📊 Overview");
        println!("   ├─ Duration: {:.2}s", self.duration.as_secs_f64());
        println!("   ├─ Sensors available: {}", self.sensors_available);
        println!("   ├─ Mocked sensors: {}", self.mocked_sensors);
        println!("   └─ Events received by clients: {}", self.events_received());

        if !self.clients.is_empty() {
            println!("\n👥 Subscribers");
            for (i, client) in self.clients.iter().enumerate() {
                let prefix = if i == self.clients.len() - 1 {
                    "└─"
                } else {
                    "├─"
                };
                println!(
                    "   {} pid {} / sensor {}: {} events ({:.1}/s), {} flushes, {} bytes{}",
                    prefix,
                    client.pid,
                    client.sensor_id,
                    client.events,
                    client.rate(self.duration),
                    client.flush_completions,
                    client.bytes,
                    if client.hung_up { ", hung up" } else { "" },
                );
            }
        }

        println!("\n📈 Dispatch");
        for line in self.dispatch.to_string().lines().skip(1) {
            println!("   {}", line);
        }
        println!();
    }
}
