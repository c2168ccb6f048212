//! Error types for BLE transport

use bluechat_core::{BluechatError, TransportError};
use thiserror::Error;

// ----------------------------------------------------------------------------
// Error Types
// ----------------------------------------------------------------------------

/// Errors specific to the BLE transport
#[derive(Error, Debug)]
pub enum BleTransportError {
    #[error("BLE adapter not available: {0}")]
    AdapterNotAvailable(String),

    #[error("Peer not found: {peer_id}")]
    PeerNotFound { peer_id: String },

    #[error("Failed to connect to peer {peer_id}: {reason}")]
    ConnectionFailed { peer_id: String, reason: String },

    #[error("Connection timeout")]
    ConnectionTimeout,

    #[error("Failed to discover services: {0}")]
    ServiceDiscoveryFailed(String),

    #[error("Characteristic not found: {characteristic}")]
    CharacteristicNotFound { characteristic: String },

    #[error("Failed to subscribe to notifications: {0}")]
    SubscriptionFailed(String),

    #[error("Failed to write to characteristic: {0}")]
    WriteFailed(String),

    #[error("Failed to get BLE events: {0}")]
    EventStreamFailed(String),

    #[error("Failed to register GATT service: {0}")]
    RegistrationFailed(String),

    #[error("Failed to start advertising: {0}")]
    AdvertiseFailed(String),

    #[error("Peripheral role not supported on this platform")]
    PeripheralUnsupported,

    #[error("Invalid BLE transport configuration: {0}")]
    InvalidConfig(String),

    #[error("Central error: {0}")]
    Central(#[from] btleplug::Error),

    #[cfg(target_os = "linux")]
    #[error("BlueZ error: {0}")]
    Bluez(#[from] bluer::Error),
}

impl From<BleTransportError> for TransportError {
    fn from(err: BleTransportError) -> Self {
        match err {
            BleTransportError::AdapterNotAvailable(reason) => {
                TransportError::Unavailable { reason }
            }
            BleTransportError::PeerNotFound { peer_id } => TransportError::PeerNotFound { peer_id },
            BleTransportError::ConnectionFailed { peer_id, reason } => {
                TransportError::ConnectionFailed { peer_id, reason }
            }
            BleTransportError::ServiceDiscoveryFailed(reason) => {
                TransportError::ServiceDiscoveryFailed { reason }
            }
            BleTransportError::CharacteristicNotFound { characteristic } => {
                TransportError::CharacteristicNotFound { characteristic }
            }
            BleTransportError::SubscriptionFailed(reason) => {
                TransportError::SubscriptionFailed { reason }
            }
            BleTransportError::WriteFailed(reason) => TransportError::WriteFailed { reason },
            BleTransportError::RegistrationFailed(reason) => {
                TransportError::RegistrationFailed { reason }
            }
            BleTransportError::AdvertiseFailed(reason) => TransportError::AdvertiseFailed { reason },
            BleTransportError::PeripheralUnsupported => TransportError::Unsupported {
                operation: "peripheral role".to_string(),
            },
            other => TransportError::Unavailable {
                reason: other.to_string(),
            },
        }
    }
}

impl From<BleTransportError> for BluechatError {
    fn from(err: BleTransportError) -> Self {
        BluechatError::Transport(err.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_maps_onto_core_errors() {
        let err: TransportError = BleTransportError::PeerNotFound {
            peer_id: "AA:BB".to_string(),
        }
        .into();
        assert_eq!(
            err,
            TransportError::PeerNotFound {
                peer_id: "AA:BB".to_string()
            }
        );

        let err: TransportError = BleTransportError::PeripheralUnsupported.into();
        assert!(matches!(err, TransportError::Unsupported { .. }));

        let err: TransportError = BleTransportError::ConnectionTimeout.into();
        assert_eq!(
            err,
            TransportError::Unavailable {
                reason: "Connection timeout".to_string()
            }
        );
    }

    #[test]
    fn test_wraps_into_bluechat_error() {
        let err: BluechatError = BleTransportError::WriteFailed("gone".to_string()).into();
        assert!(matches!(
            err,
            BluechatError::Transport(TransportError::WriteFailed { .. })
        ));
    }
}
