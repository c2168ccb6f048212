//! Central role: scanning and client links through btleplug
//!
//! Every operation that the core expects to complete asynchronously runs on a
//! spawned task and reports back on the owner's event channel. A link keeps the
//! tasks it spawned so that releasing it silences any late completions.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bluechat_core::protocol::{CharacteristicProperties, DiscoveredCharacteristic, DiscoveredService};
use bluechat_core::transport::{
    DiscoveryEvent, EventSender, PeerDescriptor, SessionEvent, SessionEventKind, SessionHandle,
};
use bluechat_core::{PeerId, ScanMode, TransportError, TransportResult};
use btleplug::api::{
    BDAddr, Central, CentralEvent, CharPropFlags, Characteristic, Manager as _, Peripheral as _,
    ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::stream::StreamExt;
use tokio::sync::{Mutex, OnceCell};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::BleTransportConfig;
use crate::error::BleTransportError;

// ----------------------------------------------------------------------------
// Link Bookkeeping
// ----------------------------------------------------------------------------

struct Link {
    peer_id: PeerId,
    peripheral: Peripheral,
    events: EventSender<SessionEvent>,
    tasks: Vec<JoinHandle<()>>,
}

impl Link {
    fn emit(&self, session: SessionHandle, kind: SessionEventKind) {
        if self.events.send(SessionEvent::new(session, kind)).is_err() {
            debug!("Session {} owner is gone, dropping event", session);
        }
    }

    fn abort_tasks(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

struct CentralInner {
    config: BleTransportConfig,
    adapter: OnceCell<Adapter>,
    links: Mutex<HashMap<SessionHandle, Link>>,
    scan_task: Mutex<Option<JoinHandle<()>>>,
    next_session: AtomicU64,
}

// ----------------------------------------------------------------------------
// Central
// ----------------------------------------------------------------------------

/// Client-side half of the BLE transport
#[derive(Clone)]
pub struct BleCentral {
    inner: Arc<CentralInner>,
}

impl BleCentral {
    pub fn new(config: BleTransportConfig) -> Self {
        Self {
            inner: Arc::new(CentralInner {
                config,
                adapter: OnceCell::new(),
                links: Mutex::new(HashMap::new()),
                scan_task: Mutex::new(None),
                next_session: AtomicU64::new(1),
            }),
        }
    }

    /// Lazily open the configured adapter
    async fn adapter(&self) -> Result<&Adapter, BleTransportError> {
        self.inner
            .adapter
            .get_or_try_init(|| async {
                let manager = Manager::new()
                    .await
                    .map_err(|e| BleTransportError::AdapterNotAvailable(e.to_string()))?;
                let adapters = manager
                    .adapters()
                    .await
                    .map_err(|e| BleTransportError::AdapterNotAvailable(e.to_string()))?;
                let index = self.inner.config.adapter_index;
                let adapter = adapters.into_iter().nth(index).ok_or_else(|| {
                    BleTransportError::AdapterNotAvailable(format!("no adapter at index {}", index))
                })?;
                info!("BLE central adapter initialized");
                Ok(adapter)
            })
            .await
    }

    async fn find_peripheral(&self, peer: &PeerId) -> Result<Peripheral, BleTransportError> {
        let adapter = self.adapter().await?;
        let peripherals = adapter.peripherals().await?;
        peripherals
            .into_iter()
            .find(|p| same_address(p.address(), peer))
            .ok_or_else(|| BleTransportError::PeerNotFound {
                peer_id: peer.to_string(),
            })
    }

    /// Resolve a saved or paired address, scanning for it if the adapter has
    /// not seen it yet
    ///
    /// The search is bounded by the configured discovery timeout and leaves a
    /// caller's running scan untouched.
    async fn locate_peripheral(&self, peer: &PeerId) -> Result<Peripheral, BleTransportError> {
        if let Ok(peripheral) = self.find_peripheral(peer).await {
            return Ok(peripheral);
        }

        let adapter = self.adapter().await?.clone();
        let mut stream = adapter
            .events()
            .await
            .map_err(|e| BleTransportError::EventStreamFailed(e.to_string()))?;
        let already_scanning = self.inner.scan_task.lock().await.is_some();
        if !already_scanning {
            adapter.start_scan(ScanFilter::default()).await?;
        }
        debug!("{} not known to the adapter, searching", peer);

        let search = async {
            // It may have been reported before the event stream opened
            if let Ok(peripheral) = self.find_peripheral(peer).await {
                return Some(peripheral);
            }
            while let Some(event) = stream.next().await {
                let id = match event {
                    CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => id,
                    _ => continue,
                };
                match adapter.peripheral(&id).await {
                    Ok(peripheral) if same_address(peripheral.address(), peer) => {
                        return Some(peripheral)
                    }
                    _ => continue,
                }
            }
            None
        };
        let found = timeout(self.inner.config.discovery_timeout, search)
            .await
            .ok()
            .flatten();

        if !already_scanning {
            if let Err(e) = adapter.stop_scan().await {
                debug!("Failed to stop search scan: {}", e);
            }
        }
        found.ok_or_else(|| BleTransportError::PeerNotFound {
            peer_id: peer.to_string(),
        })
    }

    async fn link_peripheral(&self, session: SessionHandle) -> TransportResult<Peripheral> {
        let links = self.inner.links.lock().await;
        links
            .get(&session)
            .map(|link| link.peripheral.clone())
            .ok_or(TransportError::UnknownSession {
                session: session.id(),
            })
    }

    async fn track_task(&self, session: SessionHandle, task: JoinHandle<()>) {
        let mut links = self.inner.links.lock().await;
        match links.get_mut(&session) {
            Some(link) => link.tasks.push(task),
            None => task.abort(),
        }
    }

    // ------------------------------------------------------------------------
    // Scanning
    // ------------------------------------------------------------------------

    pub async fn start_scan(
        &self,
        service: Uuid,
        mode: ScanMode,
        events: EventSender<DiscoveryEvent>,
    ) -> TransportResult<()> {
        let adapter = self.adapter().await?.clone();
        let mut stream = adapter
            .events()
            .await
            .map_err(|e| BleTransportError::EventStreamFailed(e.to_string()))?;
        adapter
            .start_scan(ScanFilter {
                services: vec![service],
            })
            .await
            .map_err(BleTransportError::from)?;
        // btleplug exposes no duty-cycle control
        debug!("Scanning for {} (requested mode {:?})", service, mode);

        let task = tokio::spawn(async move {
            while let Some(event) = stream.next().await {
                let id = match event {
                    CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => id,
                    _ => continue,
                };
                let Ok(peripheral) = adapter.peripheral(&id).await else {
                    continue;
                };
                let Ok(Some(properties)) = peripheral.properties().await else {
                    continue;
                };
                // Some backends ignore the scan filter
                if !properties.services.contains(&service) {
                    continue;
                }
                let descriptor = PeerDescriptor::new(
                    PeerId::new(properties.address.to_string()),
                    properties.local_name,
                );
                if events.send(DiscoveryEvent::PeerFound(descriptor)).is_err() {
                    break;
                }
            }
            debug!("Scan event pump ended");
        });

        if let Some(previous) = self.inner.scan_task.lock().await.replace(task) {
            previous.abort();
        }
        info!("Started BLE scan for service {}", service);
        Ok(())
    }

    pub async fn stop_scan(&self) -> TransportResult<()> {
        if let Some(task) = self.inner.scan_task.lock().await.take() {
            task.abort();
        }
        if let Some(adapter) = self.inner.adapter.get() {
            adapter.stop_scan().await.map_err(BleTransportError::from)?;
            info!("Stopped BLE scan");
        }
        Ok(())
    }

    /// Peers with a live link to the local adapter
    pub async fn connected_peers(&self) -> TransportResult<Vec<PeerDescriptor>> {
        let adapter = self.adapter().await?;
        let peripherals = adapter.peripherals().await.map_err(BleTransportError::from)?;
        let mut connected = Vec::new();
        for peripheral in peripherals {
            if !peripheral.is_connected().await.unwrap_or(false) {
                continue;
            }
            let name = match peripheral.properties().await {
                Ok(Some(properties)) => properties.local_name,
                _ => None,
            };
            connected.push(PeerDescriptor::new(
                PeerId::new(peripheral.address().to_string()),
                name,
            ));
        }
        Ok(connected)
    }

    pub async fn peer_name(&self, peer: &PeerId) -> Option<String> {
        let peripheral = self.find_peripheral(peer).await.ok()?;
        peripheral.properties().await.ok().flatten()?.local_name
    }

    // ------------------------------------------------------------------------
    // Client Links
    // ------------------------------------------------------------------------

    pub async fn connect(
        &self,
        peer: &PeerId,
        events: EventSender<SessionEvent>,
    ) -> TransportResult<SessionHandle> {
        let adapter = self.adapter().await?.clone();
        let peripheral = self.locate_peripheral(peer).await?;
        let session = SessionHandle::new(self.inner.next_session.fetch_add(1, Ordering::Relaxed));

        self.inner.links.lock().await.insert(
            session,
            Link {
                peer_id: peer.clone(),
                peripheral: peripheral.clone(),
                events,
                tasks: Vec::new(),
            },
        );

        let central = self.clone();
        let connect_timeout = self.inner.config.connection_timeout;
        let task = tokio::spawn(async move {
            let outcome = match timeout(connect_timeout, peripheral.connect()).await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(e.to_string()),
                Err(_) => Err(BleTransportError::ConnectionTimeout.to_string()),
            };

            let mut links = central.inner.links.lock().await;
            match outcome {
                Ok(()) => {
                    let Some(link) = links.get_mut(&session) else {
                        return;
                    };
                    info!("Connected to {}", link.peer_id);
                    link.emit(session, SessionEventKind::ConnectionEstablished);
                    let watcher = central.watch_link(adapter, session, peripheral);
                    link.tasks.push(watcher);
                }
                Err(reason) => {
                    if let Some(mut link) = links.remove(&session) {
                        warn!("Connection to {} failed: {}", link.peer_id, reason);
                        link.emit(session, SessionEventKind::ConnectionFailed { reason });
                        link.abort_tasks();
                    }
                }
            }
        });
        self.track_task(session, task).await;

        Ok(session)
    }

    /// Report the link dropping unless the local side released it first
    fn watch_link(
        &self,
        adapter: Adapter,
        session: SessionHandle,
        peripheral: Peripheral,
    ) -> JoinHandle<()> {
        let central = self.clone();
        tokio::spawn(async move {
            let Ok(mut stream) = adapter.events().await else {
                warn!("Cannot watch {} for disconnection", session);
                return;
            };
            let id = peripheral.id();
            while let Some(event) = stream.next().await {
                if matches!(event, CentralEvent::DeviceDisconnected(ref gone) if *gone == id) {
                    let mut links = central.inner.links.lock().await;
                    if let Some(link) = links.remove(&session) {
                        info!("Link to {} lost", link.peer_id);
                        link.emit(
                            session,
                            SessionEventKind::ConnectionLost {
                                reason: "device disconnected".to_string(),
                            },
                        );
                    }
                    break;
                }
            }
        })
    }

    pub async fn discover_services(&self, session: SessionHandle) -> TransportResult<()> {
        let peripheral = self.link_peripheral(session).await?;
        let central = self.clone();
        let discovery_timeout = self.inner.config.discovery_timeout;
        let task = tokio::spawn(async move {
            let result = match timeout(discovery_timeout, peripheral.discover_services()).await {
                Ok(Ok(())) => Ok(peripheral
                    .services()
                    .into_iter()
                    .map(|service| DiscoveredService {
                        uuid: service.uuid,
                        characteristics: service
                            .characteristics
                            .iter()
                            .map(|c| DiscoveredCharacteristic {
                                uuid: c.uuid,
                                properties: properties_from_flags(c.properties),
                            })
                            .collect(),
                    })
                    .collect()),
                Ok(Err(e)) => Err(TransportError::ServiceDiscoveryFailed {
                    reason: e.to_string(),
                }),
                Err(_) => Err(TransportError::ServiceDiscoveryFailed {
                    reason: "timed out".to_string(),
                }),
            };
            let links = central.inner.links.lock().await;
            if let Some(link) = links.get(&session) {
                link.emit(session, SessionEventKind::ServicesDiscovered(result));
            }
        });
        self.track_task(session, task).await;
        Ok(())
    }

    pub async fn subscribe(
        &self,
        session: SessionHandle,
        characteristic: Uuid,
    ) -> TransportResult<()> {
        let peripheral = self.link_peripheral(session).await?;
        let central = self.clone();
        let task = tokio::spawn(async move {
            let outcome = async {
                let target = find_characteristic(&peripheral, characteristic)?;
                let notifications = peripheral
                    .notifications()
                    .await
                    .map_err(|e| TransportError::SubscriptionFailed {
                        reason: e.to_string(),
                    })?;
                peripheral
                    .subscribe(&target)
                    .await
                    .map_err(|e| TransportError::SubscriptionFailed {
                        reason: e.to_string(),
                    })?;
                Ok::<_, TransportError>(notifications)
            }
            .await;

            let mut notifications = {
                let links = central.inner.links.lock().await;
                let Some(link) = links.get(&session) else {
                    return;
                };
                match outcome {
                    Ok(stream) => {
                        link.emit(session, SessionEventKind::SubscriptionConfirmed(Ok(())));
                        stream
                    }
                    Err(err) => {
                        link.emit(session, SessionEventKind::SubscriptionConfirmed(Err(err)));
                        return;
                    }
                }
            };

            while let Some(notification) = notifications.next().await {
                let links = central.inner.links.lock().await;
                let Some(link) = links.get(&session) else {
                    break;
                };
                link.emit(
                    session,
                    SessionEventKind::CharacteristicChanged {
                        characteristic: notification.uuid,
                        value: notification.value,
                    },
                );
            }
            debug!("Notification pump for {} ended", session);
        });
        self.track_task(session, task).await;
        Ok(())
    }

    pub async fn write(
        &self,
        session: SessionHandle,
        characteristic: Uuid,
        value: &[u8],
    ) -> TransportResult<()> {
        let peripheral = self.link_peripheral(session).await?;
        let target = find_characteristic(&peripheral, characteristic)?;
        peripheral
            .write(&target, value, WriteType::WithResponse)
            .await
            .map_err(|e| BleTransportError::WriteFailed(e.to_string()))?;
        debug!("Wrote {} bytes on {}", value.len(), session);
        Ok(())
    }

    pub async fn disconnect(&self, session: SessionHandle) {
        let removed = self.inner.links.lock().await.remove(&session);
        let Some(mut link) = removed else {
            return;
        };
        link.abort_tasks();
        if let Err(e) = link.peripheral.disconnect().await {
            warn!("Failed to disconnect from {}: {}", link.peer_id, e);
        } else {
            info!("Disconnected from {}", link.peer_id);
        }
    }
}

// ----------------------------------------------------------------------------
// Helpers
// ----------------------------------------------------------------------------

fn find_characteristic(peripheral: &Peripheral, uuid: Uuid) -> TransportResult<Characteristic> {
    peripheral
        .characteristics()
        .into_iter()
        .find(|c| c.uuid == uuid)
        .ok_or_else(|| TransportError::CharacteristicNotFound {
            characteristic: uuid.to_string(),
        })
}

/// Case-insensitive match of a radio address against a typed peer id
fn same_address(address: BDAddr, peer: &PeerId) -> bool {
    address.to_string().eq_ignore_ascii_case(peer.as_str())
}

/// Translate btleplug property flags into the core's view
pub(crate) fn properties_from_flags(flags: CharPropFlags) -> CharacteristicProperties {
    CharacteristicProperties {
        read: flags.contains(CharPropFlags::READ),
        write: flags.contains(CharPropFlags::WRITE),
        write_without_response: flags.contains(CharPropFlags::WRITE_WITHOUT_RESPONSE),
        notify: flags.contains(CharPropFlags::NOTIFY) || flags.contains(CharPropFlags::INDICATE),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::assert_err;

    #[test]
    fn test_chat_characteristic_flags() {
        let flags = CharPropFlags::READ | CharPropFlags::WRITE | CharPropFlags::NOTIFY;
        assert_eq!(
            properties_from_flags(flags),
            CharacteristicProperties::read_write_notify()
        );
    }

    #[test]
    fn test_indicate_counts_as_notify() {
        let props = properties_from_flags(CharPropFlags::INDICATE);
        assert!(props.notify);
        assert!(!props.read && !props.write);
    }

    #[test]
    fn test_saved_addresses_match_in_any_case() {
        let address = BDAddr::from([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0x0F]);
        assert!(same_address(address, &PeerId::from("aa:bb:cc:dd:ee:0f")));
        assert!(same_address(address, &PeerId::from("AA:BB:CC:DD:EE:0F")));
        assert!(!same_address(address, &PeerId::from("AA:BB:CC:DD:EE:F0")));
    }

    #[tokio::test]
    async fn test_unknown_session_is_rejected() {
        let central = BleCentral::new(BleTransportConfig::default());
        let err = assert_err!(central.write(SessionHandle::new(42), Uuid::nil(), b"hi").await);
        assert_eq!(err, TransportError::UnknownSession { session: 42 });

        // Releasing an unknown link is a no-op
        central.disconnect(SessionHandle::new(42)).await;
    }
}
