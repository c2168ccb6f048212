//! Peripheral stand-in for platforms without a usable GATT server API

use bluechat_core::protocol::ServiceDefinition;
use bluechat_core::transport::{
    AdvertiseHandle, EventSender, GattStatus, PeerDescriptor, RequestId, ServerEvent,
    ServiceRegistration,
};
use bluechat_core::{AdvertiseSettings, PeerId, TransportError, TransportResult};
use tracing::warn;
use uuid::Uuid;

use crate::config::BleTransportConfig;
use crate::error::BleTransportError;

// ----------------------------------------------------------------------------
// Fallback Implementation
// ----------------------------------------------------------------------------

pub struct BlePeripheral {
    _config: BleTransportConfig,
}

fn unsupported() -> TransportError {
    BleTransportError::PeripheralUnsupported.into()
}

impl BlePeripheral {
    pub fn new(config: BleTransportConfig) -> Self {
        Self { _config: config }
    }

    pub async fn register_service(
        &self,
        service: &ServiceDefinition,
        _events: EventSender<ServerEvent>,
    ) -> TransportResult<ServiceRegistration> {
        warn!(
            "Cannot host service {}: no GATT server on this platform",
            service.uuid
        );
        Err(unsupported())
    }

    pub async fn unregister_service(&self, _registration: ServiceRegistration) -> TransportResult<()> {
        Err(unsupported())
    }

    pub async fn advertise(
        &self,
        service: Uuid,
        _settings: &AdvertiseSettings,
    ) -> TransportResult<AdvertiseHandle> {
        warn!(
            "BLE advertising not supported on this platform; {} will not be discoverable",
            service
        );
        Err(unsupported())
    }

    pub async fn stop_advertise(&self, _handle: AdvertiseHandle) -> TransportResult<()> {
        Err(unsupported())
    }

    pub async fn respond(
        &self,
        _remote: &PeerId,
        _request_id: RequestId,
        _status: GattStatus,
        _value: &[u8],
    ) -> TransportResult<()> {
        Err(unsupported())
    }

    pub async fn notify(
        &self,
        remotes: &[PeerId],
        _characteristic: Uuid,
        _value: &[u8],
    ) -> Vec<(PeerId, TransportResult<()>)> {
        remotes
            .iter()
            .map(|remote| (remote.clone(), Err(unsupported())))
            .collect()
    }

    pub fn set_value(&self, _characteristic: Uuid, _value: &[u8]) {}

    pub fn remote_payload_limit(&self, _remote: &PeerId) -> Option<usize> {
        None
    }

    pub async fn paired_devices(&self) -> TransportResult<Vec<PeerDescriptor>> {
        Err(unsupported())
    }
}
