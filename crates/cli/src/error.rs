//! Error types for CLI operations.

use thiserror::Error;

use crate::cli::SubscriptionSpec;

/// CLI-specific error types
#[derive(Error, Debug)]
pub enum CliError {
    /// Configuration file not found
    #[error("Configuration file not found: {path}")]
    ConfigNotFound { path: String },

    /// Malformed `--subscribe` value
    #[error("invalid subscription '{value}': {message}")]
    InvalidSubscription { value: String, message: String },
}

impl CliError {
    pub fn config_not_found(path: impl Into<String>) -> Self {
        Self::ConfigNotFound { path: path.into() }
    }

    pub fn invalid_subscription(value: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidSubscription {
            value: value.into(),
            message: message.into(),
        }
    }
}

/// Parse `SENSOR:PERIOD_MS[:DELAY_MS]`
pub fn parse_subscription(value: &str) -> Result<SubscriptionSpec, CliError> {
    let parts: Vec<&str> = value.split(':').collect();
    if !(2..=3).contains(&parts.len()) {
        return Err(CliError::invalid_subscription(
            value,
            "expected SENSOR:PERIOD_MS[:DELAY_MS]",
        ));
    }

    let number = |s: &str, what: &str| {
        s.trim()
            .parse::<u64>()
            .map_err(|e| CliError::invalid_subscription(value, format!("{what}: {e}")))
    };
    let sensor_id = parts[0]
        .trim()
        .parse::<i32>()
        .map_err(|e| CliError::invalid_subscription(value, format!("sensor id: {e}")))?;
    let period_ms = number(parts[1], "period")?;
    let delay_ms = match parts.get(2) {
        Some(s) => number(s, "delay")?,
        None => 0,
    };

    Ok(SubscriptionSpec {
        sensor_id,
        period_ms,
        delay_ms,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_subscription_forms() {
        let spec = parse_subscription("2:50").unwrap();
        assert_eq!(
            spec,
            SubscriptionSpec {
                sensor_id: 2,
                period_ms: 50,
                delay_ms: 0
            }
        );
        assert_eq!(parse_subscription("2:50:100").unwrap().delay_ms, 100);
    }

    #[test]
    fn test_parse_subscription_errors() {
        assert!(parse_subscription("2").is_err());
        assert!(parse_subscription("2:50:100:7").is_err());
        assert!(parse_subscription("2:-5").is_err());
    }
}
