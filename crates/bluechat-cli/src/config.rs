//! BlueChat CLI configuration
//!
//! Configuration is read from a TOML file: the one named by `--config`, or
//! `bluechat/config.toml` under the platform config directory when it exists.
//! Missing sections and keys fall back to their defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use bluechat_ble::BleTransportConfig;
use bluechat_core::ChatConfig;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{CliError, Result};

// ----------------------------------------------------------------------------
// CLI Application Configuration
// ----------------------------------------------------------------------------

/// Complete configuration for the CLI application
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Chat roles (UUIDs, payload bound, advertising, timeouts)
    pub chat: ChatConfig,

    /// BLE adapter settings
    pub ble: BleTransportConfig,

    /// Terminal presentation
    pub cli: CliConfig,
}

/// CLI-specific configuration options
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    /// Prompt shown before each input line
    pub prompt: String,

    /// Scan length when `scan` is run without `--seconds`
    pub scan_seconds: u64,
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            prompt: "> ".to_string(),
            scan_seconds: 10,
        }
    }
}

impl CliConfig {
    pub fn scan_duration(&self, override_seconds: Option<u64>) -> Duration {
        Duration::from_secs(override_seconds.unwrap_or(self.scan_seconds))
    }
}

// ----------------------------------------------------------------------------
// Loading and Saving
// ----------------------------------------------------------------------------

impl AppConfig {
    /// Load from the platform config directory, or defaults if there is no file
    pub fn load() -> Result<Self> {
        match Self::default_config_path() {
            Some(path) if path.exists() => Self::load_from_file(path),
            _ => {
                debug!("No configuration file found, using defaults");
                Ok(Self::default())
            }
        }
    }

    /// Load configuration from a specific file path
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!("Loading configuration from {}", path.display());
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// `<config dir>/bluechat/config.toml`
    pub fn default_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("bluechat").join("config.toml"))
    }

    /// Save configuration to a specific file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path.as_ref(), self.to_toml()?)?;
        Ok(())
    }

    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Validate the configuration for consistency and correctness
    pub fn validate(&self) -> Result<()> {
        self.chat.validate()?;
        self.ble.validate()?;
        if self.cli.scan_seconds == 0 {
            return Err(CliError::Config("cli.scan_seconds must be non-zero".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.chat.max_payload_size, 512);
        assert_eq!(config.cli.scan_duration(None), Duration::from_secs(10));
        assert_eq!(config.cli.scan_duration(Some(2)), Duration::from_secs(2));
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config = AppConfig::from_toml(
            r#"
            [chat]
            max_payload_size = 100

            [ble]
            local_name = "Kitchen Pi"
            "#,
        )
        .unwrap();
        assert_eq!(config.chat.max_payload_size, 100);
        assert_eq!(config.chat.unknown_device_name, "Unknown Device");
        assert_eq!(config.ble.local_name.as_deref(), Some("Kitchen Pi"));
        assert_eq!(config.cli, CliConfig::default());
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        assert!(matches!(
            AppConfig::from_toml("[cli]\nscan_seconds = 0\n"),
            Err(CliError::Config(_))
        ));
        assert!(matches!(
            AppConfig::from_toml("[chat]\nmax_payload_size = \"big\"\n"),
            Err(CliError::TomlParsing(_))
        ));
    }

    #[test]
    fn test_saved_config_loads_back() {
        let dir = std::env::temp_dir().join(format!("bluechat-config-{}", std::process::id()));
        let path = dir.join("config.toml");
        let mut config = AppConfig::default();
        config.cli.prompt = "chat> ".to_string();

        config.save_to_file(&path).unwrap();
        let loaded = AppConfig::load_from_file(&path).unwrap();
        assert_eq!(loaded, config);

        std::fs::remove_dir_all(dir).unwrap();
    }
}
