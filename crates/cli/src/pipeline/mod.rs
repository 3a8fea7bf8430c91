//! Broker orchestration module.

mod orchestrator;
mod stats;

pub use orchestrator::{Broker, BrokerRunConfig};
pub use stats::{ClientStats, RunStats};
