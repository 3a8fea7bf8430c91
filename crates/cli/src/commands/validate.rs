//! `validate` command implementation.

use anyhow::{Context, Result};
use contracts::{BackendKind, BrokerConfig};
use serde::Serialize;
use tracing::info;

use crate::cli::ValidateArgs;

/// Smallest frame that still carries a seven-axis sample
const MIN_USEFUL_PACKET_SIZE: u32 = 64;

/// Below this, bursts from a fast sensor are dropped at the callback
const MIN_USEFUL_EVENT_QUEUE: usize = 64;

/// Validation result for JSON output
#[derive(Serialize)]
struct ValidationResult {
    valid: bool,
    config_path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    warnings: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    summary: Option<ConfigSummary>,
}

#[derive(Serialize)]
struct ConfigSummary {
    backend: String,
    max_packet_size: u32,
    event_queue_capacity: usize,
    mockable_sensors: usize,
    injected_sensors: usize,
    freezing_exempt: usize,
}

/// Execute the `validate` command
pub fn run_validate(args: &ValidateArgs) -> Result<()> {
    info!(config = %args.config.display(), "Validating configuration");

    let result = validate_config(args);

    if args.json {
        let json = serde_json::to_string_pretty(&result)
            .context("Failed to serialize validation result")?;
        println!("{}", json);
    } else {
        print_validation_result(&result);
    }

    if result.valid {
        Ok(())
    } else {
        anyhow::bail!("Configuration validation failed")
    }
}

fn validate_config(args: &ValidateArgs) -> ValidationResult {
    let config_path = args.config.display().to_string();

    if !args.config.exists() {
        return ValidationResult {
            valid: false,
            config_path,
            error: Some(format!("File not found: {}", args.config.display())),
            warnings: None,
            summary: None,
        };
    }

    match config_loader::ConfigLoader::load_from_path(&args.config) {
        Ok(config) => {
            let warnings = collect_warnings(&config);
            ValidationResult {
                valid: true,
                config_path,
                error: None,
                warnings: (!warnings.is_empty()).then_some(warnings),
                summary: Some(ConfigSummary {
                    backend: format!("{:?}", config.hdi.backend),
                    max_packet_size: config.transport.max_packet_size,
                    event_queue_capacity: config.service.event_queue_capacity,
                    mockable_sensors: config.hdi.supported_mock_sensors.len(),
                    injected_sensors: config.hdi.inject_on_start.len(),
                    freezing_exempt: config.service.freezing_exempt.len(),
                }),
            }
        }
        Err(e) => ValidationResult {
            valid: false,
            config_path,
            error: Some(e.to_string()),
            warnings: None,
            summary: None,
        },
    }
}

/// Collect configuration warnings (non-fatal issues)
fn collect_warnings(config: &BrokerConfig) -> Vec<String> {
    let mut warnings = Vec::new();

    if config.transport.max_packet_size < MIN_USEFUL_PACKET_SIZE {
        warnings.push(format!(
            "transport.max_packet_size = {} - multi-axis sensor events may not fit in one frame",
            config.transport.max_packet_size
        ));
    }

    if config.service.event_queue_capacity < MIN_USEFUL_EVENT_QUEUE {
        warnings.push(format!(
            "service.event_queue_capacity = {} - bursts will be dropped",
            config.service.event_queue_capacity
        ));
    }

    if config.service.freezing_exempt.is_empty() {
        warnings.push("service.freezing_exempt is empty - step counters stop while frozen".into());
    }

    if config.hdi.backend == BackendKind::Compatible && !config.hdi.inject_on_start.is_empty() {
        warnings.push(
            "hdi.inject_on_start with the compatible backend - mocks duplicate software sensors"
                .into(),
        );
    }

    warnings
}

fn print_validation_result(result: &ValidationResult) {
    if result.valid {
        println!("✓ Configuration is valid: {}", result.config_path);

        if let Some(ref summary) = result.summary {
            println!("\n  Backend: {}", summary.backend);
            println!("  Max packet size: {}", summary.max_packet_size);
            println!("  Event queue: {}", summary.event_queue_capacity);
            println!(
                "  Mock sensors: {} supported, {} injected",
                summary.mockable_sensors, summary.injected_sensors
            );
            println!("  Freezing exempt: {}", summary.freezing_exempt);
        }

        if let Some(ref warnings) = result.warnings {
            println!("\n⚠ Warnings:");
            for warning in warnings {
                println!("  - {}", warning);
            }
        }
    } else {
        println!("✗ Configuration is invalid: {}", result.config_path);
        if let Some(ref error) = result.error {
            println!("\n  Error: {}", error);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_valid_file_with_warnings() {
        let file = write_config("[transport]\nmax_packet_size = 32\n");
        let result = validate_config(&ValidateArgs {
            config: file.path().to_path_buf(),
            json: true,
        });
        assert!(result.valid);
        let warnings = result.warnings.unwrap();
        assert!(warnings.iter().any(|w| w.contains("max_packet_size")));
    }

    #[test]
    fn test_invalid_file_reports_error() {
        let file = write_config("[hdi]\ninject_on_start = [2]\n");
        let result = validate_config(&ValidateArgs {
            config: file.path().to_path_buf(),
            json: false,
        });
        assert!(!result.valid);
        assert!(result.error.unwrap().contains("supported_mock_sensors"));
    }

    #[test]
    fn test_default_config_has_no_warnings() {
        assert!(collect_warnings(&BrokerConfig::default()).is_empty());
    }
}
