//! Chat configuration
//!
//! One [`ChatConfig`] is shared by the discovery manager, the chat client and the
//! server controller so both roles agree on the service contract.

use core::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::ConfigError;
use crate::protocol::{
    ServiceDefinition, CHAT_CHARACTERISTIC_UUID, CHAT_SERVICE_UUID, MAX_ATTRIBUTE_LEN,
};

/// Placeholder shown when a peer's name is absent or cannot be read
pub const UNKNOWN_DEVICE_NAME: &str = "Unknown Device";

// ----------------------------------------------------------------------------
// Radio Settings
// ----------------------------------------------------------------------------

/// Scan duty cycle requested from the radio
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanMode {
    LowPower,
    Balanced,
    #[default]
    LowLatency,
}

/// Advertising interval requested from the radio
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdvertiseMode {
    LowPower,
    Balanced,
    #[default]
    LowLatency,
}

/// Transmit power requested for advertisements
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TxPower {
    UltraLow,
    Low,
    Medium,
    #[default]
    High,
}

/// How the local service is advertised
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdvertiseSettings {
    pub mode: AdvertiseMode,
    /// Remotes may connect to the advertisement
    pub connectable: bool,
    /// Include the adapter's name in the advertising payload
    pub include_device_name: bool,
    pub tx_power: TxPower,
    /// Zero advertises until stopped (bounded by the platform)
    pub duration: Duration,
}

impl Default for AdvertiseSettings {
    fn default() -> Self {
        Self {
            mode: AdvertiseMode::LowLatency,
            connectable: true,
            include_device_name: true,
            tx_power: TxPower::High,
            duration: Duration::ZERO,
        }
    }
}

impl AdvertiseSettings {
    /// Same settings, bounded to `duration`
    pub fn for_duration(&self, duration: Duration) -> Self {
        Self {
            duration,
            ..self.clone()
        }
    }

    /// Whether the advertisement runs until stopped
    pub fn is_indefinite(&self) -> bool {
        self.duration.is_zero()
    }
}

// ----------------------------------------------------------------------------
// Chat Configuration
// ----------------------------------------------------------------------------

/// Configuration shared by both chat roles
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatConfig {
    /// UUID of the advertised chat service
    pub service_uuid: Uuid,
    /// UUID of the read/write/notify message characteristic
    pub characteristic_uuid: Uuid,
    /// Upper bound on a single message payload; the negotiated link limit may be lower
    pub max_payload_size: usize,
    /// How long `make_discoverable` keeps the device visible
    pub discoverable_duration: Duration,
    pub scan_mode: ScanMode,
    pub advertise: AdvertiseSettings,
    /// How long a client waits for a session to become ready
    pub connection_timeout: Duration,
    /// Name shown for peers whose name is unresolved
    pub unknown_device_name: String,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            service_uuid: CHAT_SERVICE_UUID,
            characteristic_uuid: CHAT_CHARACTERISTIC_UUID,
            max_payload_size: MAX_ATTRIBUTE_LEN,
            discoverable_duration: Duration::from_secs(300),
            scan_mode: ScanMode::LowLatency,
            advertise: AdvertiseSettings::default(),
            connection_timeout: Duration::from_secs(30),
            unknown_device_name: UNKNOWN_DEVICE_NAME.to_string(),
        }
    }
}

impl ChatConfig {
    /// Create a new configuration with default settings
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the service and characteristic UUIDs
    pub fn with_uuids(mut self, service: Uuid, characteristic: Uuid) -> Self {
        self.service_uuid = service;
        self.characteristic_uuid = characteristic;
        self
    }

    /// Set maximum payload size
    pub fn with_max_payload_size(mut self, size: usize) -> Self {
        self.max_payload_size = size;
        self
    }

    /// Set how long the device stays discoverable
    pub fn with_discoverable_duration(mut self, duration: Duration) -> Self {
        self.discoverable_duration = duration;
        self
    }

    /// Set scan mode
    pub fn with_scan_mode(mut self, mode: ScanMode) -> Self {
        self.scan_mode = mode;
        self
    }

    /// Set advertising settings
    pub fn with_advertise_settings(mut self, settings: AdvertiseSettings) -> Self {
        self.advertise = settings;
        self
    }

    /// Set how long a client waits for its session to become ready
    pub fn with_connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    /// The service the server registers and the client expects
    pub fn service_definition(&self) -> ServiceDefinition {
        ServiceDefinition::chat(self.service_uuid, self.characteristic_uuid)
    }

    /// Validate the configuration for consistency
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_payload_size == 0 {
            return Err(ConfigError::Validation(
                "max_payload_size must be greater than 0".to_string(),
            ));
        }
        if self.max_payload_size > MAX_ATTRIBUTE_LEN {
            return Err(ConfigError::Validation(format!(
                "max_payload_size {} exceeds the ATT limit of {} bytes",
                self.max_payload_size, MAX_ATTRIBUTE_LEN
            )));
        }
        if self.service_uuid == self.characteristic_uuid {
            return Err(ConfigError::Validation(
                "service and characteristic UUIDs must differ".to_string(),
            ));
        }
        if self.service_uuid.is_nil() || self.characteristic_uuid.is_nil() {
            return Err(ConfigError::Validation("UUIDs must not be nil".to_string()));
        }
        if self.connection_timeout.is_zero() {
            return Err(ConfigError::Validation(
                "connection_timeout must be greater than 0".to_string(),
            ));
        }
        if self.unknown_device_name.trim().is_empty() {
            return Err(ConfigError::Validation(
                "unknown_device_name must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}
