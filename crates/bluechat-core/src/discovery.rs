//! Discovery manager
//!
//! Owns the scan and advertising lifecycle for the local device. Scan results are
//! deduplicated by peer id: a peer seen again only refreshes its entry. Radio
//! failures are logged and swallowed, so an unavailable radio simply discovers
//! nothing.

use core::time::Duration;

use hashbrown::HashMap;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::config::ChatConfig;
use crate::protocol::ServiceDefinition;
use crate::radio::{AdvertiseOwner, RadioSession};
use crate::transport::{DiscoveryEvent, EventReceiver, PeerDescriptor};
use crate::types::PeerId;

// ----------------------------------------------------------------------------
// Peer Set
// ----------------------------------------------------------------------------

/// Peers in first-seen order, unique by id
#[derive(Debug, Clone, Default)]
pub struct PeerSet {
    peers: Vec<PeerDescriptor>,
    index: HashMap<PeerId, usize>,
}

impl PeerSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `peer`, or refresh the existing entry; returns `true` if it was new
    pub fn insert(&mut self, peer: PeerDescriptor) -> bool {
        match self.index.get(&peer.id) {
            Some(&slot) => {
                let existing = &mut self.peers[slot];
                existing.last_seen = existing.last_seen.max(peer.last_seen);
                if peer.name.is_some() {
                    existing.name = peer.name;
                }
                false
            }
            None => {
                self.index.insert(peer.id.clone(), self.peers.len());
                self.peers.push(peer);
                true
            }
        }
    }

    pub fn contains(&self, id: &PeerId) -> bool {
        self.index.contains_key(id)
    }

    pub fn get(&self, id: &PeerId) -> Option<&PeerDescriptor> {
        self.index.get(id).map(|&slot| &self.peers[slot])
    }

    pub fn clear(&mut self) {
        self.peers.clear();
        self.index.clear();
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn as_slice(&self) -> &[PeerDescriptor] {
        &self.peers
    }

    pub fn to_vec(&self) -> Vec<PeerDescriptor> {
        self.peers.clone()
    }
}

impl FromIterator<PeerDescriptor> for PeerSet {
    fn from_iter<I: IntoIterator<Item = PeerDescriptor>>(iter: I) -> Self {
        let mut set = PeerSet::new();
        for peer in iter {
            set.insert(peer);
        }
        set
    }
}

// ----------------------------------------------------------------------------
// Discovery Manager
// ----------------------------------------------------------------------------

/// Scans for chat peers and makes the local device discoverable
pub struct DiscoveryManager {
    radio: RadioSession,
    config: ChatConfig,
    discovered: PeerSet,
    events: Option<EventReceiver<DiscoveryEvent>>,
    discovered_tx: watch::Sender<Vec<PeerDescriptor>>,
    paired_tx: watch::Sender<Vec<PeerDescriptor>>,
    connected_tx: watch::Sender<Vec<PeerDescriptor>>,
}

impl DiscoveryManager {
    pub fn new(radio: RadioSession, config: ChatConfig) -> Self {
        Self {
            radio,
            config,
            discovered: PeerSet::new(),
            events: None,
            discovered_tx: watch::channel(Vec::new()).0,
            paired_tx: watch::channel(Vec::new()).0,
            connected_tx: watch::channel(Vec::new()).0,
        }
    }

    /// Begin a scan cycle for the configured service
    ///
    /// Does nothing if a scan is already running. Otherwise the discovered set is
    /// cleared before the transport starts reporting peers.
    pub async fn start_scan(&mut self) {
        if self.radio.is_scanning().await {
            debug!("Scan already running");
            return;
        }

        self.discovered.clear();
        self.publish_discovered();

        let (tx, rx) = mpsc::unbounded_channel();
        match self
            .radio
            .start_scan(self.config.service_uuid, self.config.scan_mode, tx)
            .await
        {
            Ok(_) => {
                info!("Scanning for {}", self.config.service_uuid);
                self.events = Some(rx);
            }
            Err(e) => warn!("Scan unavailable: {}", e),
        }
    }

    /// Stop the current scan cycle; the discovered set is kept
    pub async fn stop_scan(&mut self) {
        if self.radio.stop_scan().await {
            info!("Scan stopped with {} peers", self.discovered.len());
        }
        self.events = None;
    }

    pub async fn is_scanning(&self) -> bool {
        self.radio.is_scanning().await
    }

    /// Advertise `service` for `duration`, zero meaning until stopped
    pub async fn start_advertising(&self, service: &ServiceDefinition, duration: Duration) -> bool {
        let settings = self.config.advertise.for_duration(duration);
        match self
            .radio
            .advertise(AdvertiseOwner::Discovery, service.uuid, &settings)
            .await
        {
            Ok(handle) => {
                info!("Advertising {} ({})", service.uuid, handle);
                true
            }
            Err(e) => {
                warn!("Advertising unavailable: {}", e);
                false
            }
        }
    }

    pub async fn stop_advertising(&self) {
        self.radio.stop_advertising(AdvertiseOwner::Discovery).await;
    }

    /// Stay visible for the configured discoverable window
    pub async fn make_discoverable(&self) -> bool {
        let service = self.config.service_definition();
        self.start_advertising(&service, self.config.discoverable_duration)
            .await
    }

    /// Rebuild the paired and connected peer lists from the transport
    pub async fn refresh_known_peers(&self) {
        let transport = self.radio.transport();

        let paired = transport.bonded_peers().await.unwrap_or_else(|e| {
            warn!("Paired devices unavailable: {}", e);
            Vec::new()
        });
        let connected = transport.connected_peers().await.unwrap_or_else(|e| {
            warn!("Connected devices unavailable: {}", e);
            Vec::new()
        });

        debug!(
            "Known peers: {} paired, {} connected",
            paired.len(),
            connected.len()
        );
        self.paired_tx.send_replace(paired);
        self.connected_tx.send_replace(connected);
    }

    // ------------------------------------------------------------------------
    // Event Processing
    // ------------------------------------------------------------------------

    /// Apply one scan result
    pub fn handle_event(&mut self, event: DiscoveryEvent) {
        match event {
            DiscoveryEvent::PeerFound(peer) => {
                let id = peer.id.clone();
                if self.discovered.insert(peer) {
                    debug!("Discovered {}", id);
                }
                self.publish_discovered();
            }
        }
    }

    /// Wait for the next scan result; `None` when not scanning
    pub async fn next_event(&mut self) -> Option<DiscoveryEvent> {
        self.events.as_mut()?.recv().await
    }

    /// Apply every scan result already queued
    pub fn process_pending(&mut self) -> usize {
        let mut handled = 0;
        while let Some(event) = self.events.as_mut().and_then(|rx| rx.try_recv().ok()) {
            self.handle_event(event);
            handled += 1;
        }
        handled
    }

    // ------------------------------------------------------------------------
    // Presentation Access
    // ------------------------------------------------------------------------

    pub fn discovered(&self) -> &[PeerDescriptor] {
        self.discovered.as_slice()
    }

    pub fn paired(&self) -> Vec<PeerDescriptor> {
        self.paired_tx.borrow().clone()
    }

    pub fn connected(&self) -> Vec<PeerDescriptor> {
        self.connected_tx.borrow().clone()
    }

    pub fn watch_discovered(&self) -> watch::Receiver<Vec<PeerDescriptor>> {
        self.discovered_tx.subscribe()
    }

    pub fn watch_paired(&self) -> watch::Receiver<Vec<PeerDescriptor>> {
        self.paired_tx.subscribe()
    }

    pub fn watch_connected(&self) -> watch::Receiver<Vec<PeerDescriptor>> {
        self.connected_tx.subscribe()
    }

    /// Name to show for `peer`, using the configured placeholder when unknown
    pub fn display_name<'a>(&'a self, peer: &'a PeerDescriptor) -> &'a str {
        peer.display_name(&self.config.unknown_device_name)
    }

    fn publish_discovered(&self) {
        self.discovered_tx.send_replace(self.discovered.to_vec());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Timestamp;
    use proptest::prelude::*;

    fn peer(id: &str, name: Option<&str>, seen: u64) -> PeerDescriptor {
        PeerDescriptor {
            id: PeerId::from(id),
            name: name.map(str::to_string),
            last_seen: Timestamp::new(seen),
        }
    }

    #[test]
    fn test_rediscovery_refreshes_entry() {
        let mut set = PeerSet::new();
        assert!(set.insert(peer("AA:BB", None, 1)));
        assert!(!set.insert(peer("AA:BB", Some("Pixel"), 5)));

        assert_eq!(set.len(), 1);
        let entry = set.get(&PeerId::from("AA:BB")).unwrap();
        assert_eq!(entry.name.as_deref(), Some("Pixel"));
        assert_eq!(entry.last_seen, Timestamp::new(5));
    }

    #[test]
    fn test_rediscovery_keeps_known_name() {
        let mut set = PeerSet::new();
        set.insert(peer("AA:BB", Some("Pixel"), 1));
        set.insert(peer("AA:BB", None, 2));
        assert_eq!(
            set.get(&PeerId::from("AA:BB")).unwrap().name.as_deref(),
            Some("Pixel")
        );
    }

    proptest! {
        #[test]
        fn peer_set_is_unique_and_ordered(ids in prop::collection::vec(0u8..8, 0..64)) {
            let set: PeerSet = ids
                .iter()
                .map(|i| peer(&format!("00:{:02X}", i), None, 0))
                .collect();

            let mut expected: Vec<String> = Vec::new();
            for i in &ids {
                let id = format!("00:{:02X}", i);
                if !expected.contains(&id) {
                    expected.push(id);
                }
            }
            let actual: Vec<String> = set.as_slice().iter().map(|p| p.id.to_string()).collect();
            prop_assert_eq!(actual, expected);
        }
    }
}
