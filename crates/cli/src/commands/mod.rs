//! Command implementations.

mod info;
mod run;
mod validate;

pub use info::run_info;
pub use run::run_broker;
pub use validate::run_validate;

use std::path::Path;

use anyhow::{Context, Result};
use contracts::BrokerConfig;
use tracing::info;

use crate::error::CliError;

/// Load the configuration file, or built-in defaults when no path is given
pub(crate) fn load_config(path: Option<&Path>) -> Result<BrokerConfig> {
    let Some(path) = path else {
        info!("No configuration file given, using defaults");
        return Ok(BrokerConfig::default());
    };

    if !path.exists() {
        return Err(CliError::config_not_found(path.display().to_string()).into());
    }

    config_loader::ConfigLoader::load_from_path(path)
        .with_context(|| format!("Failed to load config from {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_path_uses_defaults() {
        assert_eq!(load_config(None).unwrap(), BrokerConfig::default());
    }

    #[test]
    fn test_nonexistent_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_config(Some(&dir.path().join("none.toml"))).unwrap_err();
        assert!(err.to_string().contains("not found"));
    }
}
