//! BLE transport configuration

use std::time::Duration;

use crate::error::BleTransportError;

// ----------------------------------------------------------------------------
// Configuration
// ----------------------------------------------------------------------------

/// Configuration for the BLE transport
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct BleTransportConfig {
    /// Which local adapter to use, in the order the platform lists them
    pub adapter_index: usize,
    /// Maximum time to wait for a link to come up
    pub connection_timeout: Duration,
    /// Maximum time to wait for remote service enumeration
    pub discovery_timeout: Duration,
    /// How often the GATT server polls BlueZ for connected remotes
    pub remote_poll_interval: Duration,
    /// Name put in advertisements; the adapter alias is used when unset
    pub local_name: Option<String>,
}

impl Default for BleTransportConfig {
    fn default() -> Self {
        Self {
            adapter_index: 0,
            connection_timeout: Duration::from_secs(10),
            discovery_timeout: Duration::from_secs(10),
            remote_poll_interval: Duration::from_secs(1),
            local_name: None,
        }
    }
}

impl BleTransportConfig {
    /// Create a new configuration with default settings
    pub fn new() -> Self {
        Self::default()
    }

    /// Select the adapter by index
    pub fn with_adapter_index(mut self, index: usize) -> Self {
        self.adapter_index = index;
        self
    }

    /// Set connection timeout
    pub fn with_connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    /// Set service discovery timeout
    pub fn with_discovery_timeout(mut self, timeout: Duration) -> Self {
        self.discovery_timeout = timeout;
        self
    }

    /// Set how often connected remotes are polled
    pub fn with_remote_poll_interval(mut self, interval: Duration) -> Self {
        self.remote_poll_interval = interval;
        self
    }

    /// Set the advertised local name
    pub fn with_local_name(mut self, name: impl Into<String>) -> Self {
        self.local_name = Some(name.into());
        self
    }

    pub fn validate(&self) -> Result<(), BleTransportError> {
        if self.connection_timeout.is_zero() {
            return Err(BleTransportError::InvalidConfig(
                "connection_timeout must be non-zero".to_string(),
            ));
        }
        if self.discovery_timeout.is_zero() {
            return Err(BleTransportError::InvalidConfig(
                "discovery_timeout must be non-zero".to_string(),
            ));
        }
        if self.remote_poll_interval.is_zero() {
            return Err(BleTransportError::InvalidConfig(
                "remote_poll_interval must be non-zero".to_string(),
            ));
        }
        if matches!(&self.local_name, Some(name) if name.trim().is_empty()) {
            return Err(BleTransportError::InvalidConfig(
                "local_name must not be blank".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = BleTransportConfig::default();
        assert_eq!(config.adapter_index, 0);
        assert!(config.local_name.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder_and_validation() {
        let config = BleTransportConfig::new()
            .with_adapter_index(1)
            .with_local_name("Kitchen Pi")
            .with_connection_timeout(Duration::from_secs(3));
        assert_eq!(config.adapter_index, 1);
        assert_eq!(config.local_name.as_deref(), Some("Kitchen Pi"));
        assert!(config.validate().is_ok());

        let bad = config.clone().with_connection_timeout(Duration::ZERO);
        assert!(matches!(
            bad.validate(),
            Err(BleTransportError::InvalidConfig(_))
        ));
        assert!(config.with_local_name("  ").validate().is_err());
    }
}
