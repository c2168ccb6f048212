//! BLE transport implementation combining the central and peripheral roles

use async_trait::async_trait;
use bluechat_core::protocol::ServiceDefinition;
use bluechat_core::transport::{
    AdvertiseHandle, DiscoveryEvent, EventSender, GattStatus, PeerDescriptor, RequestId,
    ServerEvent, ServiceRegistration, SessionEvent, SessionHandle, Transport,
};
use bluechat_core::{AdvertiseSettings, PeerId, ScanMode, TransportResult};
use tracing::debug;
use uuid::Uuid;

use crate::central::BleCentral;
use crate::config::BleTransportConfig;
use crate::error::BleTransportError;
use crate::peripheral::BlePeripheral;

// ----------------------------------------------------------------------------
// BLE Transport
// ----------------------------------------------------------------------------

/// Local Bluetooth radio exposed through the core [`Transport`] trait
pub struct BleTransport {
    config: BleTransportConfig,
    central: BleCentral,
    peripheral: BlePeripheral,
}

impl BleTransport {
    /// Create a transport with default settings
    pub fn new() -> Self {
        Self::build(BleTransportConfig::default())
    }

    /// Create a transport with custom configuration
    pub fn with_config(config: BleTransportConfig) -> Result<Self, BleTransportError> {
        config.validate()?;
        Ok(Self::build(config))
    }

    fn build(config: BleTransportConfig) -> Self {
        Self {
            central: BleCentral::new(config.clone()),
            peripheral: BlePeripheral::new(config.clone()),
            config,
        }
    }

    pub fn config(&self) -> &BleTransportConfig {
        &self.config
    }
}

impl Default for BleTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for BleTransport {
    async fn start_scan(
        &self,
        service: Uuid,
        mode: ScanMode,
        events: EventSender<DiscoveryEvent>,
    ) -> TransportResult<()> {
        self.central.start_scan(service, mode, events).await
    }

    async fn stop_scan(&self) -> TransportResult<()> {
        self.central.stop_scan().await
    }

    async fn bonded_peers(&self) -> TransportResult<Vec<PeerDescriptor>> {
        self.peripheral.paired_devices().await
    }

    async fn connected_peers(&self) -> TransportResult<Vec<PeerDescriptor>> {
        self.central.connected_peers().await
    }

    async fn peer_name(&self, peer: &PeerId) -> Option<String> {
        let name = self.central.peer_name(peer).await;
        if name.is_none() {
            debug!("No readable name for {}", peer);
        }
        name
    }

    async fn connect(
        &self,
        peer: &PeerId,
        events: EventSender<SessionEvent>,
    ) -> TransportResult<SessionHandle> {
        self.central.connect(peer, events).await
    }

    async fn discover_services(&self, session: SessionHandle) -> TransportResult<()> {
        self.central.discover_services(session).await
    }

    async fn subscribe(
        &self,
        session: SessionHandle,
        characteristic: Uuid,
    ) -> TransportResult<()> {
        self.central.subscribe(session, characteristic).await
    }

    async fn write(
        &self,
        session: SessionHandle,
        characteristic: Uuid,
        value: &[u8],
    ) -> TransportResult<()> {
        self.central.write(session, characteristic, value).await
    }

    async fn disconnect(&self, session: SessionHandle) {
        self.central.disconnect(session).await
    }

    async fn register_service(
        &self,
        service: &ServiceDefinition,
        events: EventSender<ServerEvent>,
    ) -> TransportResult<ServiceRegistration> {
        self.peripheral.register_service(service, events).await
    }

    async fn unregister_service(&self, registration: ServiceRegistration) -> TransportResult<()> {
        self.peripheral.unregister_service(registration).await
    }

    async fn advertise(
        &self,
        service: Uuid,
        settings: &AdvertiseSettings,
    ) -> TransportResult<AdvertiseHandle> {
        self.peripheral.advertise(service, settings).await
    }

    async fn stop_advertise(&self, handle: AdvertiseHandle) -> TransportResult<()> {
        self.peripheral.stop_advertise(handle).await
    }

    async fn respond(
        &self,
        remote: &PeerId,
        request_id: RequestId,
        status: GattStatus,
        value: &[u8],
    ) -> TransportResult<()> {
        self.peripheral
            .respond(remote, request_id, status, value)
            .await
    }

    async fn notify(
        &self,
        remotes: &[PeerId],
        characteristic: Uuid,
        value: &[u8],
    ) -> Vec<(PeerId, TransportResult<()>)> {
        self.peripheral.notify(remotes, characteristic, value).await
    }

    fn remote_payload_limit(&self, remote: &PeerId) -> Option<usize> {
        self.peripheral.remote_payload_limit(remote)
    }

    fn set_value(&self, characteristic: Uuid, value: &[u8]) {
        self.peripheral.set_value(characteristic, value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio_test::assert_ok;

    #[test]
    fn test_rejects_invalid_config() {
        let config = BleTransportConfig::new().with_discovery_timeout(Duration::ZERO);
        assert!(BleTransport::with_config(config).is_err());

        let transport =
            assert_ok!(BleTransport::with_config(BleTransportConfig::new().with_adapter_index(2)));
        assert_eq!(transport.config().adapter_index, 2);
    }

    #[tokio::test]
    async fn test_disconnect_unknown_session_is_silent() {
        let transport = BleTransport::new();
        transport.disconnect(SessionHandle::new(1)).await;
        assert!(transport.payload_limit(SessionHandle::new(1)).is_none());
    }
}
