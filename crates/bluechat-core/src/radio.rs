//! Shared radio session
//!
//! The local radio has one scan, one advertisement and one service registration
//! at a time. [`RadioSession`] owns that state so the discovery manager and the
//! server controller coordinate through it instead of through ambient globals.
//! Replacing an advertisement or registration always tears the old one down
//! first. A bounded advertisement from one role suspends the other role's
//! indefinite one until it ends.

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::{AdvertiseSettings, ScanMode};
use crate::errors::TransportResult;
use crate::protocol::ServiceDefinition;
use crate::transport::{
    AdvertiseHandle, DiscoveryEvent, EventSender, ServerEvent, ServiceRegistration, Transport,
};

/// Role holding the advertising slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdvertiseOwner {
    Server,
    Discovery,
}

#[derive(Debug)]
struct Advertisement {
    owner: AdvertiseOwner,
    handle: AdvertiseHandle,
    service: Uuid,
    settings: AdvertiseSettings,
}

#[derive(Debug, Default)]
struct RadioState {
    scanning: bool,
    advertisement: Option<Advertisement>,
    /// Indefinite advertisement waiting for a bounded one to end
    suspended: Option<Advertisement>,
    registration: Option<ServiceRegistration>,
}

/// Cloneable handle to the process-wide radio state
#[derive(Clone)]
pub struct RadioSession {
    transport: Arc<dyn Transport>,
    state: Arc<Mutex<RadioState>>,
}

impl std::fmt::Debug for RadioSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RadioSession").finish_non_exhaustive()
    }
}

impl RadioSession {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            state: Arc::new(Mutex::new(RadioState::default())),
        }
    }

    /// The transport this session drives
    pub fn transport(&self) -> Arc<dyn Transport> {
        Arc::clone(&self.transport)
    }

    // ------------------------------------------------------------------------
    // Scanning
    // ------------------------------------------------------------------------

    /// Start scanning; returns `false` if a scan was already running
    pub async fn start_scan(
        &self,
        service: Uuid,
        mode: ScanMode,
        events: EventSender<DiscoveryEvent>,
    ) -> TransportResult<bool> {
        let mut state = self.state.lock().await;
        if state.scanning {
            return Ok(false);
        }
        self.transport.start_scan(service, mode, events).await?;
        state.scanning = true;
        Ok(true)
    }

    /// Stop scanning; returns `false` if no scan was running
    pub async fn stop_scan(&self) -> bool {
        let mut state = self.state.lock().await;
        if !state.scanning {
            return false;
        }
        if let Err(e) = self.transport.stop_scan().await {
            warn!("Failed to stop scan cleanly: {}", e);
        }
        state.scanning = false;
        true
    }

    pub async fn is_scanning(&self) -> bool {
        self.state.lock().await.scanning
    }

    // ------------------------------------------------------------------------
    // Advertising
    // ------------------------------------------------------------------------

    /// Advertise `service` on behalf of `owner`
    ///
    /// Replaces `owner`'s previous advertisement. Another owner's indefinite
    /// advertisement is suspended and comes back once this one ends, either by
    /// expiring or through [`RadioSession::stop_advertising`].
    pub async fn advertise(
        &self,
        owner: AdvertiseOwner,
        service: Uuid,
        settings: &AdvertiseSettings,
    ) -> TransportResult<AdvertiseHandle> {
        let mut state = self.state.lock().await;
        if let Some(previous) = state.advertisement.take() {
            debug!("Replacing {:?} advertisement {}", previous.owner, previous.handle);
            self.release_advertisement(previous.handle).await;
            if previous.owner != owner && previous.settings.is_indefinite() {
                state.suspended = Some(previous);
            }
        }
        if state.suspended.as_ref().is_some_and(|s| s.owner == owner) {
            state.suspended = None;
        }

        let handle = match self.transport.advertise(service, settings).await {
            Ok(handle) => handle,
            Err(e) => {
                self.resume_suspended(&mut state).await;
                return Err(e);
            }
        };
        state.advertisement = Some(Advertisement {
            owner,
            handle,
            service,
            settings: settings.clone(),
        });

        if !settings.is_indefinite() {
            let session = self.clone();
            let duration = settings.duration;
            tokio::spawn(async move {
                tokio::time::sleep(duration).await;
                session.expire_advertisement(handle).await;
            });
        }
        Ok(handle)
    }

    /// Stop `owner`'s advertisement, resuming any it had suspended
    pub async fn stop_advertising(&self, owner: AdvertiseOwner) {
        let mut state = self.state.lock().await;
        if state.suspended.as_ref().is_some_and(|s| s.owner == owner) {
            state.suspended = None;
        }
        if state.advertisement.as_ref().is_some_and(|a| a.owner == owner) {
            if let Some(current) = state.advertisement.take() {
                self.release_advertisement(current.handle).await;
            }
            self.resume_suspended(&mut state).await;
        }
    }

    pub async fn is_advertising(&self) -> bool {
        self.state.lock().await.advertisement.is_some()
    }

    /// Owner of the advertisement currently on air
    pub async fn advertisement_owner(&self) -> Option<AdvertiseOwner> {
        self.state.lock().await.advertisement.as_ref().map(|a| a.owner)
    }

    async fn expire_advertisement(&self, handle: AdvertiseHandle) {
        let mut state = self.state.lock().await;
        if state.advertisement.as_ref().map(|a| a.handle) != Some(handle) {
            return;
        }
        debug!("Advertisement {} expired", handle);
        state.advertisement = None;
        self.release_advertisement(handle).await;
        self.resume_suspended(&mut state).await;
    }

    async fn resume_suspended(&self, state: &mut RadioState) {
        let Some(suspended) = state.suspended.take() else {
            return;
        };
        match self
            .transport
            .advertise(suspended.service, &suspended.settings)
            .await
        {
            Ok(handle) => {
                debug!("Resumed {:?} advertisement as {}", suspended.owner, handle);
                state.advertisement = Some(Advertisement { handle, ..suspended });
            }
            Err(e) => warn!("Failed to resume {:?} advertisement: {}", suspended.owner, e),
        }
    }

    async fn release_advertisement(&self, handle: AdvertiseHandle) {
        if let Err(e) = self.transport.stop_advertise(handle).await {
            warn!("Failed to stop advertisement {}: {}", handle, e);
        }
    }

    // ------------------------------------------------------------------------
    // Service Registration
    // ------------------------------------------------------------------------

    /// Register `service`, tearing down any previous registration first
    pub async fn register_service(
        &self,
        service: &ServiceDefinition,
        events: EventSender<ServerEvent>,
    ) -> TransportResult<ServiceRegistration> {
        let mut state = self.state.lock().await;
        if let Some(previous) = state.registration.take() {
            debug!("Replacing service registration {}", previous);
            self.release_registration(previous).await;
        }

        let registration = self.transport.register_service(service, events).await?;
        state.registration = Some(registration);
        Ok(registration)
    }

    /// Remove the current registration, if any
    pub async fn unregister_service(&self) {
        let mut state = self.state.lock().await;
        if let Some(registration) = state.registration.take() {
            self.release_registration(registration).await;
        }
    }

    pub async fn has_registration(&self) -> bool {
        self.state.lock().await.registration.is_some()
    }

    async fn release_registration(&self, registration: ServiceRegistration) {
        if let Err(e) = self.transport.unregister_service(registration).await {
            warn!("Failed to unregister service {}: {}", registration, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::CHAT_SERVICE_UUID;
    use crate::transport::{MemoryFaults, MemoryRadio};
    use std::time::Duration;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn test_scan_is_single_instance() {
        let radio = MemoryRadio::new();
        let device = radio.device("AA:BB");
        let session = RadioSession::new(Arc::new(device.clone()));

        let (tx, _rx) = mpsc::unbounded_channel();
        assert!(session
            .start_scan(CHAT_SERVICE_UUID, ScanMode::Balanced, tx.clone())
            .await
            .unwrap());
        assert!(!session
            .start_scan(CHAT_SERVICE_UUID, ScanMode::Balanced, tx)
            .await
            .unwrap());

        assert!(session.stop_scan().await);
        assert!(!session.stop_scan().await);
        assert!(!radio.is_scanning(device.address()));
    }

    #[tokio::test]
    async fn test_advertise_replaces_previous() {
        let radio = MemoryRadio::new();
        let device = radio.device("AA:BB");
        let session = RadioSession::new(Arc::new(device.clone()));

        let first = session
            .advertise(AdvertiseOwner::Server, CHAT_SERVICE_UUID, &AdvertiseSettings::default())
            .await
            .unwrap();
        let second = session
            .advertise(AdvertiseOwner::Server, CHAT_SERVICE_UUID, &AdvertiseSettings::default())
            .await
            .unwrap();
        assert_ne!(first, second);
        assert!(radio.is_advertising(device.address()));

        session.stop_advertising(AdvertiseOwner::Server).await;
        assert!(!session.is_advertising().await);
        assert!(!radio.is_advertising(device.address()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_bounded_advertisement_suspends_indefinite_one() {
        let radio = MemoryRadio::new();
        let device = radio.device("AA:BB");
        let session = RadioSession::new(Arc::new(device.clone()));
        let bounded = AdvertiseSettings::default().for_duration(Duration::from_secs(1));

        session
            .advertise(AdvertiseOwner::Server, CHAT_SERVICE_UUID, &AdvertiseSettings::default())
            .await
            .unwrap();
        session
            .advertise(AdvertiseOwner::Discovery, CHAT_SERVICE_UUID, &bounded)
            .await
            .unwrap();
        assert_eq!(session.advertisement_owner().await, Some(AdvertiseOwner::Discovery));

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(session.advertisement_owner().await, Some(AdvertiseOwner::Server));
        assert!(radio.is_advertising(device.address()));

        // Stopping an owner that no longer holds the slot leaves it alone
        session.stop_advertising(AdvertiseOwner::Discovery).await;
        assert!(radio.is_advertising(device.address()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_advertisement_clears_slot() {
        let radio = MemoryRadio::new();
        let device = radio.device("AA:BB");
        let session = RadioSession::new(Arc::new(device.clone()));
        let bounded = AdvertiseSettings::default().for_duration(Duration::from_secs(1));

        session
            .advertise(AdvertiseOwner::Discovery, CHAT_SERVICE_UUID, &bounded)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;

        assert!(!session.is_advertising().await);
        assert!(!radio.is_advertising(device.address()));
    }

    #[tokio::test]
    async fn test_server_stop_drops_suspended_advertisement() {
        let radio = MemoryRadio::new();
        let device = radio.device("AA:BB");
        let session = RadioSession::new(Arc::new(device.clone()));
        let bounded = AdvertiseSettings::default().for_duration(Duration::from_secs(60));

        session
            .advertise(AdvertiseOwner::Server, CHAT_SERVICE_UUID, &AdvertiseSettings::default())
            .await
            .unwrap();
        session
            .advertise(AdvertiseOwner::Discovery, CHAT_SERVICE_UUID, &bounded)
            .await
            .unwrap();
        session.stop_advertising(AdvertiseOwner::Server).await;
        session.stop_advertising(AdvertiseOwner::Discovery).await;

        assert!(!session.is_advertising().await);
        assert!(!radio.is_advertising(device.address()));
    }

    #[tokio::test]
    async fn test_failed_scan_leaves_radio_idle() {
        let radio = MemoryRadio::new();
        let device = radio.device("AA:BB");
        radio.set_faults(
            device.address(),
            MemoryFaults {
                radio_disabled: true,
                ..Default::default()
            },
        );
        let session = RadioSession::new(Arc::new(device));

        let (tx, _rx) = mpsc::unbounded_channel();
        assert!(session
            .start_scan(CHAT_SERVICE_UUID, ScanMode::LowLatency, tx)
            .await
            .is_err());
        assert!(!session.is_scanning().await);
    }
}
