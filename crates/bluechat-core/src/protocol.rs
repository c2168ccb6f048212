//! BLE protocol constants and the chat service definition
//!
//! The wire contract is a single primary service holding one characteristic that
//! supports read, write and notify. Payloads on both write and notify are raw
//! UTF-8 text with no framing.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ----------------------------------------------------------------------------
// BLE Service and Characteristic UUIDs
// ----------------------------------------------------------------------------

/// BlueChat service UUID
pub const CHAT_SERVICE_UUID: Uuid = Uuid::from_u128(0x00001101_0000_1000_8000_00805F9B34FB);

/// BlueChat message characteristic UUID (read + write + notify)
pub const CHAT_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0x00001102_0000_1000_8000_00805F9B34FB);

/// Largest attribute value the ATT protocol allows
pub const MAX_ATTRIBUTE_LEN: usize = 512;

// ----------------------------------------------------------------------------
// Service Definition
// ----------------------------------------------------------------------------

/// Access flags of a characteristic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CharacteristicProperties {
    pub read: bool,
    pub write: bool,
    pub write_without_response: bool,
    pub notify: bool,
}

impl CharacteristicProperties {
    /// Read + write + notify, the only shape the chat characteristic uses
    pub const fn read_write_notify() -> Self {
        Self {
            read: true,
            write: true,
            write_without_response: false,
            notify: true,
        }
    }
}

/// Attribute permissions granted to remotes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CharacteristicPermissions {
    pub read: bool,
    pub write: bool,
}

/// A characteristic hosted by the local GATT server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CharacteristicDefinition {
    pub uuid: Uuid,
    pub properties: CharacteristicProperties,
    pub permissions: CharacteristicPermissions,
}

/// A primary service hosted by the local GATT server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceDefinition {
    pub uuid: Uuid,
    pub primary: bool,
    pub characteristics: Vec<CharacteristicDefinition>,
}

impl ServiceDefinition {
    /// Build the chat service with its single message characteristic
    pub fn chat(service: Uuid, characteristic: Uuid) -> Self {
        Self {
            uuid: service,
            primary: true,
            characteristics: vec![CharacteristicDefinition {
                uuid: characteristic,
                properties: CharacteristicProperties::read_write_notify(),
                permissions: CharacteristicPermissions {
                    read: true,
                    write: true,
                },
            }],
        }
    }

    /// Look up a characteristic of this service
    pub fn characteristic(&self, uuid: Uuid) -> Option<&CharacteristicDefinition> {
        self.characteristics.iter().find(|c| c.uuid == uuid)
    }
}

impl Default for ServiceDefinition {
    fn default() -> Self {
        Self::chat(CHAT_SERVICE_UUID, CHAT_CHARACTERISTIC_UUID)
    }
}

// ----------------------------------------------------------------------------
// Remote Service Enumeration
// ----------------------------------------------------------------------------

/// A characteristic reported by remote service discovery
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredCharacteristic {
    pub uuid: Uuid,
    pub properties: CharacteristicProperties,
}

/// A service reported by remote service discovery
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredService {
    pub uuid: Uuid,
    pub characteristics: Vec<DiscoveredCharacteristic>,
}

impl From<&ServiceDefinition> for DiscoveredService {
    fn from(def: &ServiceDefinition) -> Self {
        Self {
            uuid: def.uuid,
            characteristics: def
                .characteristics
                .iter()
                .map(|c| DiscoveredCharacteristic {
                    uuid: c.uuid,
                    properties: c.properties,
                })
                .collect(),
        }
    }
}

/// Handles of the chat service and characteristic on a connected remote
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedCharacteristic {
    pub service: Uuid,
    pub characteristic: Uuid,
    pub properties: CharacteristicProperties,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uuid_wire_contract() {
        assert_eq!(
            CHAT_SERVICE_UUID.to_string(),
            "00001101-0000-1000-8000-00805f9b34fb"
        );
        assert_eq!(
            CHAT_CHARACTERISTIC_UUID.to_string(),
            "00001102-0000-1000-8000-00805f9b34fb"
        );
    }

    #[test]
    fn test_chat_service_definition() {
        let def = ServiceDefinition::default();
        assert!(def.primary);
        assert_eq!(def.characteristics.len(), 1);

        let characteristic = def.characteristic(CHAT_CHARACTERISTIC_UUID).unwrap();
        assert!(characteristic.properties.read);
        assert!(characteristic.properties.write);
        assert!(characteristic.properties.notify);
        assert!(characteristic.permissions.read && characteristic.permissions.write);

        let discovered = DiscoveredService::from(&def);
        assert_eq!(discovered.uuid, CHAT_SERVICE_UUID);
        assert_eq!(discovered.characteristics[0].uuid, CHAT_CHARACTERISTIC_UUID);
    }
}
