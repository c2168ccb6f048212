//! Server role controller
//!
//! Hosts the chat service on the local radio, tracks connected remotes, answers
//! their read and write requests, and pushes outgoing text to all of them as
//! notifications. Remote connection state changes only on the transport's own
//! connection events; a failed notification never removes a remote.

use std::sync::Arc;

use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::codec::MessageCodec;
use crate::config::ChatConfig;
use crate::errors::{Result, SessionError};
use crate::history::{Message, MessageHistory};
use crate::radio::{AdvertiseOwner, RadioSession};
use crate::transport::{EventReceiver, GattStatus, RemoteHandle, RequestId, ServerEvent};
use crate::types::{PeerId, SystemTimeSource, TimeSource, Timestamp};

/// A remote connected to the local chat service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectedRemote {
    pub peer_id: PeerId,
    pub handle: RemoteHandle,
    pub connected_at: Timestamp,
}

/// Peripheral side of a two-peer chat
pub struct ServerController {
    radio: RadioSession,
    config: ChatConfig,
    time_source: Arc<dyn TimeSource>,
    running: bool,
    value: Vec<u8>,
    remotes: HashMap<PeerId, ConnectedRemote>,
    remotes_tx: watch::Sender<Vec<ConnectedRemote>>,
    history: MessageHistory,
    events: Option<EventReceiver<ServerEvent>>,
}

impl ServerController {
    pub fn new(radio: RadioSession, config: ChatConfig) -> Self {
        Self::with_time_source(radio, config, Arc::new(SystemTimeSource))
    }

    pub fn with_time_source(
        radio: RadioSession,
        config: ChatConfig,
        time_source: Arc<dyn TimeSource>,
    ) -> Self {
        Self {
            radio,
            config,
            history: MessageHistory::new(Arc::clone(&time_source)),
            time_source,
            running: false,
            value: Vec::new(),
            remotes: HashMap::new(),
            remotes_tx: watch::channel(Vec::new()).0,
            events: None,
        }
    }

    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    /// Register the chat service and advertise it
    ///
    /// A running server is stopped first. If advertising fails the registration
    /// is rolled back, leaving nothing behind.
    pub async fn start_server(&mut self) -> Result<()> {
        if self.running {
            info!("Restarting chat server");
            self.stop_server().await;
        }

        let definition = self.config.service_definition();
        let (tx, rx) = mpsc::unbounded_channel();
        if let Err(e) = self.radio.register_service(&definition, tx).await {
            error!("Failed to register chat service: {}", e);
            return Err(e.into());
        }

        if let Err(e) = self
            .radio
            .advertise(AdvertiseOwner::Server, definition.uuid, &self.config.advertise)
            .await
        {
            error!("Failed to advertise chat service: {}", e);
            warn!("Rolling back service registration");
            self.radio.unregister_service().await;
            return Err(e.into());
        }

        self.radio
            .transport()
            .set_value(self.config.characteristic_uuid, &self.value);
        self.events = Some(rx);
        self.running = true;
        info!("Chat server running on {}", definition.uuid);
        Ok(())
    }

    /// Withdraw the service and advertisement; never fails
    pub async fn stop_server(&mut self) {
        self.radio.stop_advertising(AdvertiseOwner::Server).await;
        self.radio.unregister_service().await;

        self.events = None;
        self.remotes.clear();
        self.publish_remotes();
        if std::mem::replace(&mut self.running, false) {
            info!("Chat server stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    // ------------------------------------------------------------------------
    // Messaging
    // ------------------------------------------------------------------------

    /// Send `text` to every connected remote
    ///
    /// Stores the payload as the characteristic value and records the message.
    /// Returns how many remotes accepted the notification.
    pub async fn broadcast(&mut self, text: &str) -> Result<usize> {
        if !self.running {
            return Err(SessionError::ServerNotRunning.into());
        }

        let transport = self.radio.transport();
        let link_limit = self
            .remotes
            .keys()
            .filter_map(|peer| transport.remote_payload_limit(peer))
            .min();
        let payload = MessageCodec::new(self.config.max_payload_size)
            .with_link_limit(link_limit)
            .encode(text)?;

        self.value = payload.clone();
        transport.set_value(self.config.characteristic_uuid, &payload);
        let mut targets: Vec<PeerId> = self.remotes.keys().cloned().collect();
        targets.sort();

        let mut delivered = 0;
        for (peer, result) in transport
            .notify(&targets, self.config.characteristic_uuid, &payload)
            .await
        {
            match result {
                Ok(()) => delivered += 1,
                Err(e) => warn!("Notification to {} failed: {}", peer, e),
            }
        }

        self.history.record_outgoing(text);
        debug!("Broadcast to {}/{} remotes", delivered, targets.len());
        Ok(delivered)
    }

    // ------------------------------------------------------------------------
    // Event Processing
    // ------------------------------------------------------------------------

    /// Apply one transport event; events arriving after a stop are dropped
    pub async fn handle_event(&mut self, event: ServerEvent) {
        if !self.running {
            debug!("Ignoring {} while stopped", event.name());
            return;
        }

        match event {
            ServerEvent::ConnectionEstablished { remote, handle } => {
                info!("Remote {} connected", remote);
                self.remotes.insert(
                    remote.clone(),
                    ConnectedRemote {
                        peer_id: remote,
                        handle,
                        connected_at: self.time_source.now(),
                    },
                );
                self.publish_remotes();
            }
            ServerEvent::ConnectionLost { remote } => {
                if self.remotes.remove(&remote).is_some() {
                    info!("Remote {} disconnected", remote);
                    self.publish_remotes();
                }
            }
            ServerEvent::ReadRequested {
                remote,
                request_id,
                characteristic,
                offset,
            } => {
                let (status, value) = if characteristic != self.config.characteristic_uuid {
                    (GattStatus::RequestNotSupported, &[][..])
                } else if offset > self.value.len() {
                    (GattStatus::InvalidOffset, &[][..])
                } else {
                    (GattStatus::Success, &self.value[offset..])
                };
                let value = value.to_vec();
                self.respond(&remote, request_id, status, &value).await;
            }
            ServerEvent::WriteRequested {
                remote,
                request_id,
                characteristic,
                value,
                response_needed,
            } => {
                let status = if characteristic == self.config.characteristic_uuid {
                    let text = MessageCodec::new(self.config.max_payload_size).decode(&value);
                    debug!("Received {} bytes from {}", value.len(), remote);
                    self.history.record_incoming(text);
                    GattStatus::Success
                } else {
                    GattStatus::RequestNotSupported
                };
                if response_needed {
                    self.respond(&remote, request_id, status, &value).await;
                }
            }
        }
    }

    /// Wait for the next transport event; `None` when not running
    pub async fn next_event(&mut self) -> Option<ServerEvent> {
        self.events.as_mut()?.recv().await
    }

    /// Apply every event already queued
    pub async fn process_pending(&mut self) -> usize {
        let mut handled = 0;
        while let Some(event) = self.events.as_mut().and_then(|rx| rx.try_recv().ok()) {
            self.handle_event(event).await;
            handled += 1;
        }
        handled
    }

    async fn respond(
        &self,
        remote: &PeerId,
        request_id: RequestId,
        status: GattStatus,
        value: &[u8],
    ) {
        if let Err(e) = self
            .radio
            .transport()
            .respond(remote, request_id, status, value)
            .await
        {
            warn!("Failed to answer {} from {}: {}", request_id, remote, e);
        }
    }

    fn publish_remotes(&self) {
        self.remotes_tx.send_replace(self.connected_remotes());
    }

    // ------------------------------------------------------------------------
    // Presentation Access
    // ------------------------------------------------------------------------

    /// Connected remotes ordered by peer id
    pub fn connected_remotes(&self) -> Vec<ConnectedRemote> {
        let mut remotes: Vec<ConnectedRemote> = self.remotes.values().cloned().collect();
        remotes.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));
        remotes
    }

    pub fn is_connected(&self, peer: &PeerId) -> bool {
        self.remotes.contains_key(peer)
    }

    pub fn watch_remotes(&self) -> watch::Receiver<Vec<ConnectedRemote>> {
        self.remotes_tx.subscribe()
    }

    /// Current characteristic value served to reads
    pub fn value(&self) -> &[u8] {
        &self.value
    }

    pub fn history(&self) -> &MessageHistory {
        &self.history
    }

    pub fn messages(&self) -> Vec<Message> {
        self.history.snapshot()
    }

    pub fn subscribe_messages(&self) -> broadcast::Receiver<Message> {
        self.history.subscribe()
    }
}

impl std::fmt::Debug for ServerController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerController")
            .field("running", &self.running)
            .field("remotes", &self.remotes.len())
            .field("messages", &self.history.len())
            .finish_non_exhaustive()
    }
}
