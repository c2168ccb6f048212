//! Linux peripheral role using bluer (BlueZ)
//!
//! BlueZ calls into the registered application for every read, write and
//! notification session. Reads are answered at once from the value the server
//! controller last published. Acknowledged writes are parked on a oneshot until
//! the controller answers through [`BlePeripheral::respond`].
//! BlueZ does not report inbound connections to GATT applications, so a monitor
//! task polls the adapter's device list and turns changes into server events.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bluechat_core::protocol::{CharacteristicDefinition, ServiceDefinition};
use bluechat_core::transport::{
    AdvertiseHandle, EventSender, GattStatus, PeerDescriptor, RemoteHandle, RequestId,
    ServerEvent, ServiceRegistration,
};
use bluechat_core::{AdvertiseSettings, PeerId, TransportError, TransportResult};
use bluer::adv::{Advertisement, AdvertisementHandle, Type as AdvertisementType};
use bluer::gatt::local::{
    Application, ApplicationHandle, Characteristic, CharacteristicNotifier, CharacteristicNotify,
    CharacteristicNotifyMethod, CharacteristicRead, CharacteristicReadRequest,
    CharacteristicWrite, CharacteristicWriteMethod, CharacteristicWriteRequest, ReqError,
    Service,
};
use bluer::gatt::WriteOp;
use tokio::sync::{oneshot, Mutex, OnceCell};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::tx_power_dbm;
use crate::config::BleTransportConfig;
use crate::error::BleTransportError;

/// How long BlueZ is kept waiting for the controller to answer a request
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(5);

/// ATT header bytes subtracted from the MTU
const ATT_HEADER_LEN: usize = 3;

type PendingResponse = oneshot::Sender<(GattStatus, Vec<u8>)>;

struct Registration {
    _application: ApplicationHandle,
    monitor: JoinHandle<()>,
}

struct PeripheralInner {
    config: BleTransportConfig,
    bluez: OnceCell<(bluer::Session, bluer::Adapter)>,
    registrations: Mutex<HashMap<ServiceRegistration, Registration>>,
    advertisements: Mutex<HashMap<AdvertiseHandle, AdvertisementHandle>>,
    notifiers: Mutex<HashMap<Uuid, CharacteristicNotifier>>,
    pending: parking_lot::Mutex<HashMap<RequestId, PendingResponse>>,
    values: parking_lot::Mutex<HashMap<Uuid, Vec<u8>>>,
    mtus: parking_lot::Mutex<HashMap<PeerId, usize>>,
    next_id: AtomicU64,
}

impl PeripheralInner {
    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn note_mtu(&self, remote: &PeerId, mtu: u16) {
        self.mtus.lock().insert(remote.clone(), mtu as usize);
    }

    /// Forward a request to the controller and wait for its answer
    async fn forward(
        &self,
        events: &EventSender<ServerEvent>,
        build: impl FnOnce(RequestId) -> ServerEvent,
    ) -> Result<Vec<u8>, ReqError> {
        let request_id = RequestId::new(self.next_id());
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(request_id, tx);

        if events.send(build(request_id)).is_err() {
            self.pending.lock().remove(&request_id);
            return Err(ReqError::Failed);
        }

        match timeout(RESPONSE_TIMEOUT, rx).await {
            Ok(Ok((status, value))) => status_result(status).map(|()| value),
            Ok(Err(_)) => Err(ReqError::Failed),
            Err(_) => {
                self.pending.lock().remove(&request_id);
                warn!("No answer for {} within {:?}", request_id, RESPONSE_TIMEOUT);
                Err(ReqError::Failed)
            }
        }
    }

    fn read_request(
        &self,
        characteristic: Uuid,
        req: CharacteristicReadRequest,
    ) -> Result<Vec<u8>, ReqError> {
        let remote = PeerId::new(req.device_address.to_string());
        self.note_mtu(&remote, req.mtu);
        self.read_value(characteristic, req.offset as usize)
    }

    /// Published value of `characteristic` from `offset`; unset reads as empty
    fn read_value(&self, characteristic: Uuid, offset: usize) -> Result<Vec<u8>, ReqError> {
        let values = self.values.lock();
        let value = values.get(&characteristic).map(Vec::as_slice).unwrap_or_default();
        value
            .get(offset..)
            .map(<[u8]>::to_vec)
            .ok_or(ReqError::InvalidOffset)
    }

    async fn write_request(
        &self,
        events: EventSender<ServerEvent>,
        characteristic: Uuid,
        value: Vec<u8>,
        req: CharacteristicWriteRequest,
    ) -> Result<(), ReqError> {
        let remote = PeerId::new(req.device_address.to_string());
        self.note_mtu(&remote, req.mtu);
        let response_needed = req.op_type != WriteOp::Command;

        if !response_needed {
            let event = ServerEvent::WriteRequested {
                remote,
                request_id: RequestId::new(self.next_id()),
                characteristic,
                value,
                response_needed,
            };
            return events.send(event).map_err(|_| ReqError::Failed);
        }

        self.forward(&events, |request_id| ServerEvent::WriteRequested {
            remote,
            request_id,
            characteristic,
            value,
            response_needed,
        })
        .await
        .map(|_| ())
    }
}

fn status_result(status: GattStatus) -> Result<(), ReqError> {
    match status {
        GattStatus::Success => Ok(()),
        GattStatus::InvalidOffset => Err(ReqError::InvalidOffset),
        GattStatus::RequestNotSupported => Err(ReqError::NotSupported),
        GattStatus::Failure => Err(ReqError::Failed),
    }
}

// ----------------------------------------------------------------------------
// Peripheral
// ----------------------------------------------------------------------------

/// Server-side half of the BLE transport
pub struct BlePeripheral {
    inner: Arc<PeripheralInner>,
}

impl BlePeripheral {
    pub fn new(config: BleTransportConfig) -> Self {
        Self {
            inner: Arc::new(PeripheralInner {
                config,
                bluez: OnceCell::new(),
                registrations: Mutex::new(HashMap::new()),
                advertisements: Mutex::new(HashMap::new()),
                notifiers: Mutex::new(HashMap::new()),
                pending: parking_lot::Mutex::new(HashMap::new()),
                values: parking_lot::Mutex::new(HashMap::new()),
                mtus: parking_lot::Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Lazily open a BlueZ session and power on the configured adapter
    async fn adapter(&self) -> Result<&bluer::Adapter, BleTransportError> {
        let (_, adapter) = self
            .inner
            .bluez
            .get_or_try_init(|| async {
                let session = bluer::Session::new()
                    .await
                    .map_err(|e| BleTransportError::AdapterNotAvailable(e.to_string()))?;
                let names = session.adapter_names().await?;
                let index = self.inner.config.adapter_index;
                let name = names.get(index).ok_or_else(|| {
                    BleTransportError::AdapterNotAvailable(format!("no adapter at index {}", index))
                })?;
                let adapter = session.adapter(name)?;
                if !adapter.is_powered().await.unwrap_or(false) {
                    adapter.set_powered(true).await?;
                }
                info!("BlueZ adapter {} initialized for the peripheral role", name);
                Ok::<_, BleTransportError>((session, adapter))
            })
            .await?;
        Ok(adapter)
    }

    fn characteristic(
        &self,
        definition: &CharacteristicDefinition,
        events: &EventSender<ServerEvent>,
    ) -> Characteristic {
        let uuid = definition.uuid;
        let props = definition.properties;

        let read = props.read.then(|| {
            let inner = self.inner.clone();
            CharacteristicRead {
                read: true,
                fun: Box::new(move |req: CharacteristicReadRequest| {
                    let result = inner.read_request(uuid, req);
                    Box::pin(async move { result })
                }),
                ..Default::default()
            }
        });

        let write = (props.write || props.write_without_response).then(|| {
            let inner = self.inner.clone();
            let events = events.clone();
            CharacteristicWrite {
                write: props.write,
                write_without_response: props.write_without_response,
                method: CharacteristicWriteMethod::Fun(Box::new(
                    move |value: Vec<u8>, req: CharacteristicWriteRequest| {
                        let inner = inner.clone();
                        let events = events.clone();
                        Box::pin(async move { inner.write_request(events, uuid, value, req).await })
                    },
                )),
                ..Default::default()
            }
        });

        let notify = props.notify.then(|| {
            let inner = self.inner.clone();
            CharacteristicNotify {
                notify: true,
                method: CharacteristicNotifyMethod::Fun(Box::new(move |notifier| {
                    let inner = inner.clone();
                    Box::pin(async move {
                        debug!("Remote subscribed to {}", uuid);
                        inner.notifiers.lock().await.insert(uuid, notifier);
                    })
                })),
                ..Default::default()
            }
        });

        Characteristic {
            uuid,
            read,
            write,
            notify,
            ..Default::default()
        }
    }

    /// Poll the adapter for connected devices and report changes
    fn spawn_monitor(
        &self,
        adapter: bluer::Adapter,
        events: EventSender<ServerEvent>,
    ) -> JoinHandle<()> {
        let inner = self.inner.clone();
        let interval = self.inner.config.remote_poll_interval;
        tokio::spawn(async move {
            let mut known: HashSet<PeerId> = HashSet::new();
            loop {
                tokio::time::sleep(interval).await;

                let addresses = match adapter.device_addresses().await {
                    Ok(addresses) => addresses,
                    Err(e) => {
                        debug!("Failed to list devices: {}", e);
                        continue;
                    }
                };
                let mut connected = HashSet::new();
                for address in addresses {
                    let Ok(device) = adapter.device(address) else {
                        continue;
                    };
                    if device.is_connected().await.unwrap_or(false) {
                        connected.insert(PeerId::new(address.to_string()));
                    }
                }

                for remote in connected.difference(&known) {
                    let handle = RemoteHandle::new(inner.next_id());
                    info!("Remote {} connected", remote);
                    let event = ServerEvent::ConnectionEstablished {
                        remote: remote.clone(),
                        handle,
                    };
                    if events.send(event).is_err() {
                        return;
                    }
                }
                for remote in known.difference(&connected) {
                    info!("Remote {} disconnected", remote);
                    inner.mtus.lock().remove(remote);
                    let event = ServerEvent::ConnectionLost {
                        remote: remote.clone(),
                    };
                    if events.send(event).is_err() {
                        return;
                    }
                }
                known = connected;
            }
        })
    }

    pub async fn register_service(
        &self,
        service: &ServiceDefinition,
        events: EventSender<ServerEvent>,
    ) -> TransportResult<ServiceRegistration> {
        let adapter = self.adapter().await?.clone();

        let application = Application {
            services: vec![Service {
                uuid: service.uuid,
                primary: service.primary,
                characteristics: service
                    .characteristics
                    .iter()
                    .map(|definition| self.characteristic(definition, &events))
                    .collect(),
                ..Default::default()
            }],
            ..Default::default()
        };

        let handle = adapter
            .serve_gatt_application(application)
            .await
            .map_err(|e| BleTransportError::RegistrationFailed(e.to_string()))?;
        let registration = ServiceRegistration::new(self.inner.next_id());
        let monitor = self.spawn_monitor(adapter, events);

        self.inner.registrations.lock().await.insert(
            registration,
            Registration {
                _application: handle,
                monitor,
            },
        );
        info!("GATT service {} registered as {}", service.uuid, registration);
        Ok(registration)
    }

    pub async fn unregister_service(&self, registration: ServiceRegistration) -> TransportResult<()> {
        let removed = self.inner.registrations.lock().await.remove(&registration);
        let Some(registration_state) = removed else {
            return Err(TransportError::RegistrationFailed {
                reason: format!("{} is not registered", registration),
            });
        };
        registration_state.monitor.abort();
        // Dropping the application handle unregisters it from BlueZ
        drop(registration_state);

        self.inner.notifiers.lock().await.clear();
        self.inner.pending.lock().clear();
        self.inner.values.lock().clear();
        self.inner.mtus.lock().clear();
        info!("GATT service {} unregistered", registration);
        Ok(())
    }

    pub async fn advertise(
        &self,
        service: Uuid,
        settings: &AdvertiseSettings,
    ) -> TransportResult<AdvertiseHandle> {
        let adapter = self.adapter().await?;

        let local_name = if settings.include_device_name {
            match &self.inner.config.local_name {
                Some(name) => Some(name.clone()),
                None => adapter.alias().await.ok(),
            }
        } else {
            None
        };
        // BlueZ picks the advertising interval itself
        debug!("Advertising {} (requested mode {:?})", service, settings.mode);

        let advertisement = Advertisement {
            advertisement_type: if settings.connectable {
                AdvertisementType::Peripheral
            } else {
                AdvertisementType::Broadcast
            },
            service_uuids: BTreeSet::from([service]),
            local_name,
            discoverable: Some(true),
            tx_power: Some(tx_power_dbm(settings.tx_power)),
            timeout: (!settings.is_indefinite()).then_some(settings.duration),
            ..Default::default()
        };

        let handle = adapter
            .advertise(advertisement)
            .await
            .map_err(|e| BleTransportError::AdvertiseFailed(e.to_string()))?;
        let advertise_handle = AdvertiseHandle::new(self.inner.next_id());
        self.inner
            .advertisements
            .lock()
            .await
            .insert(advertise_handle, handle);
        info!("Started BLE advertising for {}", service);
        Ok(advertise_handle)
    }

    pub async fn stop_advertise(&self, handle: AdvertiseHandle) -> TransportResult<()> {
        // Dropping the BlueZ handle ends the advertisement
        if self.inner.advertisements.lock().await.remove(&handle).is_some() {
            info!("Stopped BLE advertising");
        }
        Ok(())
    }

    pub async fn respond(
        &self,
        remote: &PeerId,
        request_id: RequestId,
        status: GattStatus,
        value: &[u8],
    ) -> TransportResult<()> {
        let pending = self.inner.pending.lock().remove(&request_id);
        let Some(tx) = pending else {
            return Err(TransportError::UnknownRequest {
                request: request_id.id(),
            });
        };
        if tx.send((status, value.to_vec())).is_err() {
            debug!("Request {} from {} was abandoned", request_id, remote);
        }
        Ok(())
    }

    /// BlueZ keeps one notification session per characteristic, shared by all
    /// subscribers, so every remote sees the same outcome
    pub async fn notify(
        &self,
        remotes: &[PeerId],
        characteristic: Uuid,
        value: &[u8],
    ) -> Vec<(PeerId, TransportResult<()>)> {
        let mut notifiers = self.inner.notifiers.lock().await;
        let outcome = match notifiers.get_mut(&characteristic) {
            Some(notifier) if !notifier.is_stopped() => notifier
                .notify(value.to_vec())
                .await
                .map_err(|e| e.to_string()),
            _ => Err("no subscriber".to_string()),
        };
        if outcome.is_err() {
            notifiers.remove(&characteristic);
        }

        remotes
            .iter()
            .map(|remote| {
                let result = outcome.clone().map_err(|reason| TransportError::NotifyFailed {
                    peer_id: remote.to_string(),
                    reason,
                });
                (remote.clone(), result)
            })
            .collect()
    }

    pub fn set_value(&self, characteristic: Uuid, value: &[u8]) {
        self.inner
            .values
            .lock()
            .insert(characteristic, value.to_vec());
    }

    pub fn remote_payload_limit(&self, remote: &PeerId) -> Option<usize> {
        self.inner
            .mtus
            .lock()
            .get(remote)
            .map(|mtu| mtu.saturating_sub(ATT_HEADER_LEN))
    }

    /// Devices BlueZ has paired with
    pub async fn paired_devices(&self) -> TransportResult<Vec<PeerDescriptor>> {
        let adapter = self.adapter().await?;
        let addresses = adapter
            .device_addresses()
            .await
            .map_err(BleTransportError::from)?;
        let mut paired = Vec::new();
        for address in addresses {
            let Ok(device) = adapter.device(address) else {
                continue;
            };
            if !device.is_paired().await.unwrap_or(false) {
                continue;
            }
            let name = device.name().await.ok().flatten();
            paired.push(PeerDescriptor::new(PeerId::new(address.to_string()), name));
        }
        Ok(paired)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_err, assert_ok};

    #[test]
    fn test_status_mapping() {
        assert!(status_result(GattStatus::Success).is_ok());
        assert!(matches!(
            status_result(GattStatus::InvalidOffset),
            Err(ReqError::InvalidOffset)
        ));
        assert!(matches!(
            status_result(GattStatus::RequestNotSupported),
            Err(ReqError::NotSupported)
        ));
        assert!(matches!(
            status_result(GattStatus::Failure),
            Err(ReqError::Failed)
        ));
    }

    #[tokio::test]
    async fn test_respond_to_unknown_request() {
        let peripheral = BlePeripheral::new(BleTransportConfig::default());
        let err = assert_err!(
            peripheral
                .respond(&PeerId::from("AA:BB"), RequestId::new(9), GattStatus::Success, b"")
                .await
        );
        assert_eq!(err, TransportError::UnknownRequest { request: 9 });
        assert_eq!(peripheral.remote_payload_limit(&PeerId::from("AA:BB")), None);
    }

    #[test]
    fn test_reads_are_served_from_published_value() {
        let peripheral = BlePeripheral::new(BleTransportConfig::default());
        let characteristic = Uuid::from_u128(0x1102);
        assert_eq!(
            assert_ok!(peripheral.inner.read_value(characteristic, 0)),
            Vec::<u8>::new()
        );

        peripheral.set_value(characteristic, b"hello");
        assert_eq!(
            assert_ok!(peripheral.inner.read_value(characteristic, 2)),
            b"llo".to_vec()
        );
        assert_eq!(
            assert_ok!(peripheral.inner.read_value(characteristic, 5)),
            Vec::<u8>::new()
        );
        assert!(matches!(
            peripheral.inner.read_value(characteristic, 9),
            Err(ReqError::InvalidOffset)
        ));
    }

    #[tokio::test]
    async fn test_forwarded_write_is_answered() {
        let peripheral = BlePeripheral::new(BleTransportConfig::default());
        let inner = peripheral.inner.clone();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

        let writer = tokio::spawn(async move {
            inner
                .forward(&tx, |request_id| ServerEvent::WriteRequested {
                    remote: PeerId::from("AA:BB"),
                    request_id,
                    characteristic: Uuid::nil(),
                    value: b"hi".to_vec(),
                    response_needed: true,
                })
                .await
        });

        let Some(ServerEvent::WriteRequested { remote, request_id, .. }) = rx.recv().await else {
            panic!("expected a write request");
        };
        assert_ok!(
            peripheral
                .respond(&remote, request_id, GattStatus::Success, b"hi")
                .await
        );
        assert_eq!(assert_ok!(writer.await.unwrap()), b"hi".to_vec());
    }
}
