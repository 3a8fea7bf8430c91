//! CLI argument definitions using clap.

use clap::{Parser, Subcommand, ValueEnum};
use contracts::BackendKind;
use std::path::PathBuf;

use crate::error::parse_subscription;

/// sensord - device-resident sensor broker
#[derive(Parser, Debug)]
#[command(
    name = "sensord",
    author,
    version,
    about = "Device-resident sensor broker",
    long_about = "Multiplexes hardware sensors between client processes.\n\n\
                  Arbitrates per-client sampling rates onto one hardware \n\
                  configuration and streams events to each subscriber over \n\
                  local stream sockets."
)]
pub struct Cli {
    /// Increase logging verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true, env = "SENSORD_VERBOSE")]
    pub verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Log output format
    #[arg(
        long,
        value_enum,
        default_value = "pretty",
        global = true,
        env = "SENSORD_LOG_FORMAT"
    )]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the broker
    Run(RunArgs),

    /// Validate configuration file without running
    Validate(ValidateArgs),

    /// Display configuration and sensor information
    Info(InfoArgs),
}

/// Arguments for the `run` command
#[derive(Parser, Debug, Clone)]
pub struct RunArgs {
    /// Path to configuration file (TOML or JSON); built-in defaults when absent
    #[arg(short, long, env = "SENSORD_CONFIG")]
    pub config: Option<PathBuf>,

    /// Override the primary backend from configuration
    #[arg(long, value_enum, env = "SENSORD_BACKEND")]
    pub backend: Option<BackendArg>,

    /// Additional mock sensors to inject at startup
    #[arg(long, value_delimiter = ',', env = "SENSORD_INJECT")]
    pub inject: Vec<i32>,

    /// In-process subscribers, as SENSOR:PERIOD_MS[:DELAY_MS]
    #[arg(long = "subscribe", value_parser = parse_subscription)]
    pub subscriptions: Vec<SubscriptionSpec>,

    /// Stop after this many seconds (0 = until Ctrl+C)
    #[arg(long, default_value = "0", env = "SENSORD_TIMEOUT")]
    pub timeout: u64,

    /// Validate configuration and exit without starting the broker
    #[arg(long)]
    pub dry_run: bool,

    /// Metrics server port (0 = disabled)
    #[arg(long, default_value = "0", env = "SENSORD_METRICS_PORT")]
    pub metrics_port: u16,
}

/// Arguments for the `validate` command
#[derive(Parser, Debug)]
pub struct ValidateArgs {
    /// Path to configuration file to validate
    #[arg(short, long, default_value = "sensord.toml")]
    pub config: PathBuf,

    /// Output validation result as JSON
    #[arg(long)]
    pub json: bool,
}

/// Arguments for the `info` command
#[derive(Parser, Debug)]
pub struct InfoArgs {
    /// Path to configuration file; built-in defaults when absent
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Output as JSON
    #[arg(long)]
    pub json: bool,

    /// List the sensors the software backend exposes
    #[arg(long)]
    pub sensors: bool,
}

/// Backend selection on the command line
#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum BackendArg {
    /// Vendor hardware, falling back to compatible
    Real,
    /// Software backend only
    Compatible,
}

impl From<BackendArg> for BackendKind {
    fn from(arg: BackendArg) -> Self {
        match arg {
            BackendArg::Real => BackendKind::Real,
            BackendArg::Compatible => BackendKind::Compatible,
        }
    }
}

/// One `--subscribe` entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionSpec {
    pub sensor_id: i32,
    pub period_ms: u64,
    pub delay_ms: u64,
}

impl SubscriptionSpec {
    pub fn period_ns(&self) -> i64 {
        (self.period_ms as i64).saturating_mul(1_000_000)
    }

    pub fn delay_ns(&self) -> i64 {
        (self.delay_ms as i64).saturating_mul(1_000_000)
    }
}

/// Log output format
#[derive(ValueEnum, Clone, Debug, Default)]
pub enum LogFormat {
    /// JSON structured logging
    Json,
    /// Human-readable pretty format
    #[default]
    Pretty,
    /// Compact single-line format
    Compact,
}

impl From<LogFormat> for observability::LogFormat {
    fn from(format: LogFormat) -> Self {
        match format {
            LogFormat::Json => Self::Json,
            LogFormat::Pretty => Self::Pretty,
            LogFormat::Compact => Self::Compact,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_args_parse_subscriptions() {
        let cli = Cli::try_parse_from([
            "sensord",
            "run",
            "--subscribe",
            "1:100",
            "--subscribe",
            "14:200:400",
            "--inject",
            "14,15",
            "--backend",
            "compatible",
        ])
        .unwrap();

        let Commands::Run(args) = cli.command else {
            panic!("expected run command");
        };
        assert_eq!(args.subscriptions.len(), 2);
        assert_eq!(args.subscriptions[0].period_ns(), 100_000_000);
        assert_eq!(args.subscriptions[1].delay_ms, 400);
        assert_eq!(args.inject, vec![14, 15]);
        assert_eq!(args.backend, Some(BackendArg::Compatible));
    }

    #[test]
    fn test_bad_subscription_rejected() {
        let result = Cli::try_parse_from(["sensord", "run", "--subscribe", "acc:fast"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_quiet_conflicts_with_verbose() {
        let result = Cli::try_parse_from(["sensord", "-q", "-v", "info"]);
        assert!(result.is_err());
    }
}
