//! In-process radio
//!
//! [`MemoryRadio`] links any number of [`MemoryDevice`]s, each of which is a full
//! [`Transport`]. Links are delivered synchronously onto the owners' event
//! channels, so a test that drives both ends sees every event in the order the
//! radio produced it. Faults can be injected per device.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hashbrown::{HashMap, HashSet};
use parking_lot::Mutex;
use tracing::{debug, trace};
use uuid::Uuid;

use super::{
    AdvertiseHandle, DiscoveryEvent, EventSender, GattStatus, PeerDescriptor, RemoteHandle,
    RequestId, ServerEvent, ServiceRegistration, SessionEvent, SessionEventKind, SessionHandle,
    Transport,
};
use crate::config::{AdvertiseSettings, ScanMode};
use crate::errors::{TransportError, TransportResult};
use crate::protocol::{DiscoveredService, ServiceDefinition};
use crate::types::PeerId;

// ----------------------------------------------------------------------------
// Fault Injection
// ----------------------------------------------------------------------------

/// Failures a [`MemoryDevice`] reports instead of succeeding
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryFaults {
    /// Scan, advertise and registration calls fail as if the radio were off
    pub radio_disabled: bool,
    /// Outbound connects are reported as failed
    pub fail_connect: bool,
    /// Service enumeration completes with an error
    pub fail_discovery: bool,
    /// Enumeration omits every characteristic
    pub omit_characteristic: bool,
    /// Subscriptions are refused
    pub fail_subscribe: bool,
    /// Writes are rejected
    pub fail_write: bool,
    /// Service registration fails
    pub fail_register: bool,
    /// Advertising fails
    pub fail_advertise: bool,
    /// Notifications addressed to this device are dropped with an error
    pub fail_notify: bool,
    /// Name lookups from this device take this long
    pub name_lookup_delay: Option<Duration>,
}

/// A response sent by a device's server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedResponse {
    pub remote: PeerId,
    pub request_id: RequestId,
    pub status: GattStatus,
    pub value: Vec<u8>,
}

// ----------------------------------------------------------------------------
// Radio State
// ----------------------------------------------------------------------------

struct ScanState {
    service: Uuid,
    events: EventSender<DiscoveryEvent>,
}

struct Registration {
    id: ServiceRegistration,
    service: ServiceDefinition,
    events: EventSender<ServerEvent>,
}

struct Advertisement {
    id: AdvertiseHandle,
    service: Uuid,
    connectable: bool,
}

#[derive(Default)]
struct DeviceState {
    name: Option<String>,
    faults: MemoryFaults,
    payload_limit: Option<usize>,
    scan: Option<ScanState>,
    registration: Option<Registration>,
    advertisement: Option<Advertisement>,
    bonded: Vec<PeerId>,
    writes: Vec<Vec<u8>>,
    responses: Vec<RecordedResponse>,
    values: HashMap<Uuid, Vec<u8>>,
}

struct Link {
    central: PeerId,
    peripheral: PeerId,
    events: EventSender<SessionEvent>,
    established: bool,
    subscriptions: HashSet<Uuid>,
}

#[derive(Default)]
struct RadioState {
    devices: HashMap<PeerId, DeviceState>,
    links: HashMap<SessionHandle, Link>,
    next_id: u64,
}

impl RadioState {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn device(&mut self, address: &PeerId) -> &mut DeviceState {
        self.devices.entry(address.clone()).or_default()
    }

    fn descriptor(&self, address: &PeerId) -> PeerDescriptor {
        let name = self.devices.get(address).and_then(|d| d.name.clone());
        PeerDescriptor::new(address.clone(), name)
    }

    /// Report `advertiser` to every scanner filtering for its service
    fn announce(&self, advertiser: &PeerId) {
        let Some(service) = self
            .devices
            .get(advertiser)
            .and_then(|d| d.advertisement.as_ref())
            .map(|a| a.service)
        else {
            return;
        };

        for (address, device) in &self.devices {
            if address == advertiser {
                continue;
            }
            if let Some(scan) = device.scan.as_ref().filter(|s| s.service == service) {
                let _ = scan
                    .events
                    .send(DiscoveryEvent::PeerFound(self.descriptor(advertiser)));
            }
        }
    }

    /// Tear down a link, telling whichever ends asked to hear about it
    fn drop_link(&mut self, session: SessionHandle, notify_central: bool, reason: &str) {
        let Some(link) = self.links.remove(&session) else {
            return;
        };
        if !link.established {
            return;
        }

        if notify_central {
            let _ = link.events.send(SessionEvent::new(
                session,
                SessionEventKind::ConnectionLost {
                    reason: reason.to_string(),
                },
            ));
        }
        if let Some(registration) = self
            .devices
            .get(&link.peripheral)
            .and_then(|d| d.registration.as_ref())
        {
            let _ = registration.events.send(ServerEvent::ConnectionLost {
                remote: link.central.clone(),
            });
        }
    }

    fn live_link(&self, session: SessionHandle) -> TransportResult<&Link> {
        self.links
            .get(&session)
            .filter(|l| l.established)
            .ok_or(TransportError::UnknownSession {
                session: session.id(),
            })
    }
}

// ----------------------------------------------------------------------------
// Memory Radio
// ----------------------------------------------------------------------------

/// Shared medium that [`MemoryDevice`]s talk over
#[derive(Clone, Default)]
pub struct MemoryRadio {
    state: Arc<Mutex<RadioState>>,
}

impl MemoryRadio {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a device with the given address
    pub fn device(&self, address: impl Into<PeerId>) -> MemoryDevice {
        let address = address.into();
        self.state.lock().device(&address);
        MemoryDevice {
            radio: self.clone(),
            address,
        }
    }

    /// Attach a device that advertises a readable name
    pub fn named_device(&self, address: impl Into<PeerId>, name: &str) -> MemoryDevice {
        let device = self.device(address);
        self.state.lock().device(&device.address).name = Some(name.to_string());
        device
    }

    pub fn set_faults(&self, address: &PeerId, faults: MemoryFaults) {
        self.state.lock().device(address).faults = faults;
    }

    /// Cap the payload any link touching `address` can carry
    pub fn set_payload_limit(&self, address: &PeerId, limit: Option<usize>) {
        self.state.lock().device(address).payload_limit = limit;
    }

    /// Record `a` and `b` as paired with each other
    pub fn bond(&self, a: &PeerId, b: &PeerId) {
        let mut state = self.state.lock();
        state.device(a).bonded.push(b.clone());
        state.device(b).bonded.push(a.clone());
    }

    /// Re-report every advertiser to every matching scanner, as real radios do
    pub fn repeat_advertisements(&self) {
        let state = self.state.lock();
        for address in state.devices.keys() {
            state.announce(address);
        }
    }

    /// Drop every link between `central` and `peripheral` as if out of range
    pub fn sever(&self, central: &PeerId, peripheral: &PeerId) {
        let mut state = self.state.lock();
        let sessions: Vec<SessionHandle> = state
            .links
            .iter()
            .filter(|(_, l)| &l.central == central && &l.peripheral == peripheral)
            .map(|(s, _)| *s)
            .collect();
        for session in sessions {
            debug!("Severing link {} ({} -> {})", session, central, peripheral);
            state.drop_link(session, true, "link lost");
        }
    }

    pub fn is_scanning(&self, address: &PeerId) -> bool {
        self.with_device(address, |d| d.scan.is_some())
    }

    pub fn is_advertising(&self, address: &PeerId) -> bool {
        self.with_device(address, |d| d.advertisement.is_some())
    }

    pub fn has_registration(&self, address: &PeerId) -> bool {
        self.with_device(address, |d| d.registration.is_some())
    }

    /// Payloads `address` has written as a client, oldest first
    pub fn writes(&self, address: &PeerId) -> Vec<Vec<u8>> {
        self.with_device(address, |d| d.writes.clone())
    }

    /// Responses `address` has sent as a server, oldest first
    pub fn responses(&self, address: &PeerId) -> Vec<RecordedResponse> {
        self.with_device(address, |d| d.responses.clone())
    }

    /// Value `address` last published for `characteristic` as a server
    pub fn served_value(&self, address: &PeerId, characteristic: Uuid) -> Option<Vec<u8>> {
        self.with_device(address, |d| d.values.get(&characteristic).cloned())
    }

    /// Number of established links touching `address`
    pub fn link_count(&self, address: &PeerId) -> usize {
        self.state
            .lock()
            .links
            .values()
            .filter(|l| l.established && (&l.central == address || &l.peripheral == address))
            .count()
    }

    fn with_device<T: Default>(&self, address: &PeerId, f: impl FnOnce(&DeviceState) -> T) -> T {
        self.state.lock().devices.get(address).map(f).unwrap_or_default()
    }
}

impl std::fmt::Debug for MemoryRadio {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("MemoryRadio")
            .field("devices", &state.devices.len())
            .field("links", &state.links.len())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Memory Device
// ----------------------------------------------------------------------------

/// One endpoint on a [`MemoryRadio`]
#[derive(Clone, Debug)]
pub struct MemoryDevice {
    radio: MemoryRadio,
    address: PeerId,
}

impl MemoryDevice {
    pub fn address(&self) -> &PeerId {
        &self.address
    }

    pub fn radio(&self) -> &MemoryRadio {
        &self.radio
    }

    fn faults(&self, state: &mut RadioState) -> MemoryFaults {
        state.device(&self.address).faults.clone()
    }

    fn unavailable() -> TransportError {
        TransportError::Unavailable {
            reason: "radio disabled".to_string(),
        }
    }
}

#[async_trait]
impl Transport for MemoryDevice {
    async fn start_scan(
        &self,
        service: Uuid,
        _mode: ScanMode,
        events: EventSender<DiscoveryEvent>,
    ) -> TransportResult<()> {
        let mut state = self.radio.state.lock();
        if self.faults(&mut state).radio_disabled {
            return Err(Self::unavailable());
        }

        state.device(&self.address).scan = Some(ScanState { service, events });
        let advertisers: Vec<PeerId> = state
            .devices
            .iter()
            .filter(|(address, d)| {
                *address != &self.address
                    && d.advertisement.as_ref().is_some_and(|a| a.service == service)
            })
            .map(|(address, _)| address.clone())
            .collect();
        for advertiser in advertisers {
            state.announce(&advertiser);
        }
        Ok(())
    }

    async fn stop_scan(&self) -> TransportResult<()> {
        self.radio.state.lock().device(&self.address).scan = None;
        Ok(())
    }

    async fn bonded_peers(&self) -> TransportResult<Vec<PeerDescriptor>> {
        let mut state = self.radio.state.lock();
        let bonded = state.device(&self.address).bonded.clone();
        Ok(bonded.iter().map(|p| state.descriptor(p)).collect())
    }

    async fn connected_peers(&self) -> TransportResult<Vec<PeerDescriptor>> {
        let state = self.radio.state.lock();
        let mut peers: Vec<PeerId> = state
            .links
            .values()
            .filter(|l| l.established)
            .filter_map(|l| {
                if l.central == self.address {
                    Some(l.peripheral.clone())
                } else if l.peripheral == self.address {
                    Some(l.central.clone())
                } else {
                    None
                }
            })
            .collect();
        peers.sort();
        peers.dedup();
        Ok(peers.iter().map(|p| state.descriptor(p)).collect())
    }

    async fn peer_name(&self, peer: &PeerId) -> Option<String> {
        let (delay, name) = {
            let mut state = self.radio.state.lock();
            let delay = self.faults(&mut state).name_lookup_delay;
            (delay, state.devices.get(peer).and_then(|d| d.name.clone()))
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        name
    }

    async fn connect(
        &self,
        peer: &PeerId,
        events: EventSender<SessionEvent>,
    ) -> TransportResult<SessionHandle> {
        let mut state = self.radio.state.lock();
        let session = SessionHandle::new(state.next_id());
        let remote = RemoteHandle::new(state.next_id());

        let reachable = state.devices.get(peer).is_some_and(|d| {
            d.registration.is_some()
                && d.advertisement.as_ref().map_or(true, |a| a.connectable)
        });
        if self.faults(&mut state).fail_connect || !reachable {
            debug!("Memory connect {} -> {} failed", self.address, peer);
            let _ = events.send(SessionEvent::new(
                session,
                SessionEventKind::ConnectionFailed {
                    reason: format!("{} is not accepting connections", peer),
                },
            ));
            return Ok(session);
        }

        let _ = events.send(SessionEvent::new(
            session,
            SessionEventKind::ConnectionEstablished,
        ));
        if let Some(registration) = state.devices.get(peer).and_then(|d| d.registration.as_ref()) {
            let _ = registration.events.send(ServerEvent::ConnectionEstablished {
                remote: self.address.clone(),
                handle: remote,
            });
        }
        state.links.insert(
            session,
            Link {
                central: self.address.clone(),
                peripheral: peer.clone(),
                events,
                established: true,
                subscriptions: HashSet::new(),
            },
        );
        trace!("Memory link {} established", session);
        Ok(session)
    }

    async fn discover_services(&self, session: SessionHandle) -> TransportResult<()> {
        let mut state = self.radio.state.lock();
        let faults = self.faults(&mut state);
        let link = state.live_link(session)?;

        let result = if faults.fail_discovery {
            Err(TransportError::ServiceDiscoveryFailed {
                reason: "enumeration aborted".to_string(),
            })
        } else {
            let services = state
                .devices
                .get(&link.peripheral)
                .and_then(|d| d.registration.as_ref())
                .map(|r| {
                    let mut service = DiscoveredService::from(&r.service);
                    if faults.omit_characteristic {
                        service.characteristics.clear();
                    }
                    vec![service]
                })
                .unwrap_or_default();
            Ok(services)
        };

        let _ = link.events.send(SessionEvent::new(
            session,
            SessionEventKind::ServicesDiscovered(result),
        ));
        Ok(())
    }

    async fn subscribe(
        &self,
        session: SessionHandle,
        characteristic: Uuid,
    ) -> TransportResult<()> {
        let mut state = self.radio.state.lock();
        let faults = self.faults(&mut state);
        let link = state.live_link(session)?;

        let hosted = state
            .devices
            .get(&link.peripheral)
            .and_then(|d| d.registration.as_ref())
            .is_some_and(|r| r.service.characteristic(characteristic).is_some());
        let result = if faults.fail_subscribe {
            Err(TransportError::SubscriptionFailed {
                reason: "descriptor write rejected".to_string(),
            })
        } else if !hosted {
            Err(TransportError::CharacteristicNotFound {
                characteristic: characteristic.to_string(),
            })
        } else {
            Ok(())
        };

        let events = link.events.clone();
        if result.is_ok() {
            if let Some(link) = state.links.get_mut(&session) {
                link.subscriptions.insert(characteristic);
            }
        }
        let _ = events.send(SessionEvent::new(
            session,
            SessionEventKind::SubscriptionConfirmed(result),
        ));
        Ok(())
    }

    async fn write(
        &self,
        session: SessionHandle,
        characteristic: Uuid,
        value: &[u8],
    ) -> TransportResult<()> {
        let mut state = self.radio.state.lock();
        if self.faults(&mut state).fail_write {
            return Err(TransportError::WriteFailed {
                reason: "remote rejected the write".to_string(),
            });
        }
        let link = state.live_link(session)?;
        let peripheral = link.peripheral.clone();
        let central = link.central.clone();

        let request_id = RequestId::new(state.next_id());
        let registration = state
            .devices
            .get(&peripheral)
            .and_then(|d| d.registration.as_ref())
            .ok_or_else(|| TransportError::WriteFailed {
                reason: format!("{} is not serving", peripheral),
            })?;
        registration
            .events
            .send(ServerEvent::WriteRequested {
                remote: central,
                request_id,
                characteristic,
                value: value.to_vec(),
                response_needed: true,
            })
            .map_err(|_| TransportError::WriteFailed {
                reason: "remote server stopped".to_string(),
            })?;

        state.device(&self.address).writes.push(value.to_vec());
        Ok(())
    }

    async fn disconnect(&self, session: SessionHandle) {
        let mut state = self.radio.state.lock();
        state.drop_link(session, false, "closed locally");
    }

    fn payload_limit(&self, session: SessionHandle) -> Option<usize> {
        let state = self.radio.state.lock();
        let link = state.links.get(&session)?;
        [&link.central, &link.peripheral]
            .iter()
            .filter_map(|p| state.devices.get(*p).and_then(|d| d.payload_limit))
            .min()
    }

    async fn register_service(
        &self,
        service: &ServiceDefinition,
        events: EventSender<ServerEvent>,
    ) -> TransportResult<ServiceRegistration> {
        let mut state = self.radio.state.lock();
        let faults = self.faults(&mut state);
        if faults.radio_disabled {
            return Err(Self::unavailable());
        }
        if faults.fail_register {
            return Err(TransportError::RegistrationFailed {
                reason: "GATT server unavailable".to_string(),
            });
        }

        let id = ServiceRegistration::new(state.next_id());
        state.device(&self.address).registration = Some(Registration {
            id,
            service: service.clone(),
            events,
        });
        Ok(id)
    }

    async fn unregister_service(&self, registration: ServiceRegistration) -> TransportResult<()> {
        let mut state = self.radio.state.lock();
        let current = state
            .device(&self.address)
            .registration
            .as_ref()
            .map(|r| r.id);
        if current != Some(registration) {
            return Ok(());
        }

        // Closing the server drops every remote attached to it
        let sessions: Vec<SessionHandle> = state
            .links
            .iter()
            .filter(|(_, l)| l.peripheral == self.address)
            .map(|(s, _)| *s)
            .collect();
        for session in sessions {
            state.drop_link(session, true, "server closed");
        }
        state.device(&self.address).registration = None;
        Ok(())
    }

    async fn advertise(
        &self,
        service: Uuid,
        settings: &AdvertiseSettings,
    ) -> TransportResult<AdvertiseHandle> {
        let id = {
            let mut state = self.radio.state.lock();
            let faults = self.faults(&mut state);
            if faults.radio_disabled {
                return Err(Self::unavailable());
            }
            if faults.fail_advertise {
                return Err(TransportError::AdvertiseFailed {
                    reason: "advertiser unavailable".to_string(),
                });
            }

            let id = AdvertiseHandle::new(state.next_id());
            state.device(&self.address).advertisement = Some(Advertisement {
                id,
                service,
                connectable: settings.connectable,
            });
            state.announce(&self.address);
            id
        };

        if !settings.is_indefinite() {
            let radio = self.radio.clone();
            let address = self.address.clone();
            let duration = settings.duration;
            tokio::spawn(async move {
                tokio::time::sleep(duration).await;
                let mut state = radio.state.lock();
                let device = state.device(&address);
                if device.advertisement.as_ref().map(|a| a.id) == Some(id) {
                    debug!("Advertisement {} on {} expired", id, address);
                    device.advertisement = None;
                }
            });
        }
        Ok(id)
    }

    async fn stop_advertise(&self, handle: AdvertiseHandle) -> TransportResult<()> {
        let mut state = self.radio.state.lock();
        let device = state.device(&self.address);
        if device.advertisement.as_ref().map(|a| a.id) == Some(handle) {
            device.advertisement = None;
        }
        Ok(())
    }

    async fn respond(
        &self,
        remote: &PeerId,
        request_id: RequestId,
        status: GattStatus,
        value: &[u8],
    ) -> TransportResult<()> {
        let mut state = self.radio.state.lock();
        state.device(&self.address).responses.push(RecordedResponse {
            remote: remote.clone(),
            request_id,
            status,
            value: value.to_vec(),
        });
        Ok(())
    }

    async fn notify(
        &self,
        remotes: &[PeerId],
        characteristic: Uuid,
        value: &[u8],
    ) -> Vec<(PeerId, TransportResult<()>)> {
        let state = self.radio.state.lock();
        remotes
            .iter()
            .map(|remote| {
                let link = state.links.iter().find(|(_, l)| {
                    l.established && &l.central == remote && l.peripheral == self.address
                });
                let refused = state.devices.get(remote).is_some_and(|d| d.faults.fail_notify);

                let result = match link {
                    Some(_) if refused => Err("remote refused the notification"),
                    Some((session, link)) if link.subscriptions.contains(&characteristic) => link
                        .events
                        .send(SessionEvent::new(
                            *session,
                            SessionEventKind::CharacteristicChanged {
                                characteristic,
                                value: value.to_vec(),
                            },
                        ))
                        .map_err(|_| "remote stopped listening"),
                    Some(_) => Err("remote is not subscribed"),
                    None => Err("remote is not connected"),
                };
                let result = result.map_err(|reason| TransportError::NotifyFailed {
                    peer_id: remote.to_string(),
                    reason: reason.to_string(),
                });
                (remote.clone(), result)
            })
            .collect()
    }

    fn remote_payload_limit(&self, remote: &PeerId) -> Option<usize> {
        let state = self.radio.state.lock();
        [remote, &self.address]
            .iter()
            .filter_map(|p| state.devices.get(*p).and_then(|d| d.payload_limit))
            .min()
    }

    fn set_value(&self, characteristic: Uuid, value: &[u8]) {
        self.radio
            .state
            .lock()
            .device(&self.address)
            .values
            .insert(characteristic, value.to_vec());
    }
}
