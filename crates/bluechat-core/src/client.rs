//! Chat client
//!
//! Drives one [`SessionState`] over a [`Transport`] on behalf of one chat
//! screen. Transport events arrive on a single ordered channel owned by the
//! client; events tagged with any session other than the current one are stale
//! and dropped. Dropping the client releases its connection.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, info, warn};

use crate::codec::MessageCodec;
use crate::config::ChatConfig;
use crate::errors::{BluechatError, Result, SessionError, TransportError};
use crate::history::{Message, MessageHistory};
use crate::session::{
    AuditEntry, ServiceTarget, SessionEffect, SessionInput, SessionPhase, SessionState,
};
use crate::transport::{
    EventReceiver, EventSender, SessionEvent, SessionEventKind, SessionHandle, Transport,
};
use crate::types::{PeerId, SystemTimeSource, TimeSource};

/// Longest `connect` waits on a name lookup before keeping the placeholder
const NAME_LOOKUP_TIMEOUT: Duration = Duration::from_secs(2);

// ----------------------------------------------------------------------------
// Connection Status
// ----------------------------------------------------------------------------

/// Connection projection for the presentation layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionStatus {
    pub phase: SessionPhase,
    /// True only while the session is ready
    pub connected: bool,
    pub peer_id: Option<PeerId>,
    pub device_name: Option<String>,
}

impl ConnectionStatus {
    fn of(state: &SessionState) -> Self {
        Self {
            phase: state.phase(),
            connected: state.is_ready(),
            peer_id: state.peer_id().cloned(),
            device_name: state.device_name().map(str::to_string),
        }
    }

    /// Name to show, `"Disconnected"` when there is no session
    pub fn label(&self) -> &str {
        self.device_name.as_deref().unwrap_or("Disconnected")
    }
}

// ----------------------------------------------------------------------------
// Chat Client
// ----------------------------------------------------------------------------

/// Client role of a two-peer chat
pub struct ChatClient {
    transport: Arc<dyn Transport>,
    config: ChatConfig,
    time_source: Arc<dyn TimeSource>,
    state: SessionState,
    handle: Option<SessionHandle>,
    audit_trail: Vec<AuditEntry>,
    history: MessageHistory,
    events_tx: EventSender<SessionEvent>,
    events_rx: EventReceiver<SessionEvent>,
    status: watch::Sender<ConnectionStatus>,
}

impl ChatClient {
    pub fn new(transport: Arc<dyn Transport>, config: ChatConfig) -> Self {
        Self::with_time_source(transport, config, Arc::new(SystemTimeSource))
    }

    /// Create a client whose messages are stamped by `time_source`
    pub fn with_time_source(
        transport: Arc<dyn Transport>,
        config: ChatConfig,
        time_source: Arc<dyn TimeSource>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let state = SessionState::Idle;
        let status = watch::channel(ConnectionStatus::of(&state)).0;
        Self {
            transport,
            config,
            history: MessageHistory::new(Arc::clone(&time_source)),
            time_source,
            state,
            handle: None,
            audit_trail: Vec::new(),
            events_tx,
            events_rx,
            status,
        }
    }

    // ------------------------------------------------------------------------
    // Session Control
    // ------------------------------------------------------------------------

    /// Start a session with `peer`
    ///
    /// Rejected while another session is live. A new session starts with an
    /// empty history. The session enters `Connecting` under the placeholder
    /// name; the peer's name is looked up alongside the connection and applied
    /// when it arrives. Connection failures move the session to `Failed` and
    /// are also returned.
    pub async fn connect(&mut self, peer: &PeerId) -> Result<()> {
        if self.state.is_live() {
            return Err(SessionError::SessionActive {
                peer_id: self
                    .state
                    .peer_id()
                    .map(PeerId::to_string)
                    .unwrap_or_default(),
                state: self.state.state_name().to_string(),
            }
            .into());
        }

        if self.state.is_terminal() {
            self.history.restart();
            self.audit_trail.clear();
        }

        info!("Connecting to {}", peer);
        let transport = Arc::clone(&self.transport);
        let lookup = async move {
            tokio::time::timeout(NAME_LOOKUP_TIMEOUT, transport.peer_name(peer))
                .await
                .ok()
                .flatten()
        };
        let connect = self.drive(SessionInput::Connect {
            peer_id: peer.clone(),
            device_name: self.config.unknown_device_name.clone(),
            target: ServiceTarget {
                service: self.config.service_uuid,
                characteristic: self.config.characteristic_uuid,
            },
        });
        let ((), name) = tokio::join!(connect, lookup);
        if let Some(name) = name {
            debug!("{} is {}", peer, name);
            self.drive(SessionInput::NameResolved { name }).await;
        }

        match &self.state {
            SessionState::Failed(failed) => Err(TransportError::ConnectionFailed {
                peer_id: peer.to_string(),
                reason: failed.reason.clone(),
            }
            .into()),
            _ => Ok(()),
        }
    }

    /// Close the session; does nothing unless a session is live
    pub async fn disconnect(&mut self) {
        if !self.state.is_live() || matches!(self.state, SessionState::Closing(_)) {
            return;
        }
        self.drive(SessionInput::Disconnect).await;
    }

    /// Disconnect and drop the client
    pub async fn close(mut self) {
        self.disconnect().await;
    }

    /// Send `text` to the peer
    ///
    /// Only valid while ready. The message is recorded once the transport
    /// acknowledged the write.
    pub async fn send(&mut self, text: &str) -> Result<Message> {
        let (handle, characteristic) = match (&self.state, self.handle) {
            (SessionState::Ready(ready), Some(handle)) => (handle, ready.resolved.characteristic),
            _ => {
                return Err(SessionError::NotConnected {
                    state: self.state.state_name().to_string(),
                }
                .into())
            }
        };

        let codec = MessageCodec::new(self.config.max_payload_size)
            .with_link_limit(self.transport.payload_limit(handle));
        let payload = codec.encode(text)?;
        self.transport
            .write(handle, characteristic, &payload)
            .await?;

        debug!("Sent {} bytes on {}", payload.len(), handle);
        Ok(self.history.record_outgoing(text))
    }

    /// Wait until the session is ready, bounded by the configured timeout
    ///
    /// Returns an error if the session fails, closes or times out first. A
    /// timed out session is disconnected.
    pub async fn wait_until_ready(&mut self) -> Result<()> {
        let deadline = self.config.connection_timeout;
        let outcome = tokio::time::timeout(deadline, async {
            loop {
                if self.state.is_ready() {
                    return Ok(());
                }
                if !self.state.is_live() {
                    return Err(BluechatError::from(SessionError::NotConnected {
                        state: self.state.state_name().to_string(),
                    }));
                }
                match self.events_rx.recv().await {
                    Some(event) => self.handle_event(event).await,
                    None => return Err(TransportError::ChannelClosed.into()),
                }
            }
        })
        .await;

        match outcome {
            Ok(result) => result,
            Err(_) => {
                let peer = self
                    .state
                    .peer_id()
                    .map(PeerId::to_string)
                    .unwrap_or_default();
                warn!("Session with {} not ready after {:?}", peer, deadline);
                self.disconnect().await;
                Err(TransportError::ConnectionFailed {
                    peer_id: peer,
                    reason: "timed out".to_string(),
                }
                .into())
            }
        }
    }

    // ------------------------------------------------------------------------
    // Event Processing
    // ------------------------------------------------------------------------

    /// Apply one transport event
    pub async fn handle_event(&mut self, event: SessionEvent) {
        if Some(event.session) != self.handle {
            debug!(
                "Ignoring stale {} for {} (current {:?})",
                event.kind.name(),
                event.session,
                self.handle
            );
            return;
        }

        let input = match event.kind {
            SessionEventKind::ConnectionEstablished => SessionInput::ConnectionEstablished,
            SessionEventKind::ConnectionFailed { reason } => {
                SessionInput::ConnectionFailed { reason }
            }
            SessionEventKind::ConnectionLost { reason } => SessionInput::ConnectionLost { reason },
            SessionEventKind::ServicesDiscovered(result) => {
                SessionInput::ServicesDiscovered(result)
            }
            SessionEventKind::SubscriptionConfirmed(result) => {
                SessionInput::SubscriptionConfirmed(result)
            }
            SessionEventKind::CharacteristicChanged {
                characteristic,
                value,
            } => SessionInput::NotificationReceived {
                characteristic,
                value,
            },
        };
        self.drive(input).await;
    }

    /// Wait for the next transport event
    pub async fn next_event(&mut self) -> Option<SessionEvent> {
        self.events_rx.recv().await
    }

    /// Apply every event already queued
    pub async fn process_pending(&mut self) -> usize {
        let mut handled = 0;
        while let Ok(event) = self.events_rx.try_recv() {
            self.handle_event(event).await;
            handled += 1;
        }
        handled
    }

    /// Run `input` and every input its effects produce, in order
    async fn drive(&mut self, input: SessionInput) {
        let mut pending = VecDeque::from([input]);
        while let Some(input) = pending.pop_front() {
            let input_name = input.name();
            let transition = match self
                .state
                .clone()
                .transition(input, self.time_source.now())
            {
                Ok(transition) => transition,
                Err(e) => {
                    debug!("Ignoring {}: {}", input_name, e);
                    continue;
                }
            };

            if transition.audit_entry.from_state != transition.audit_entry.to_state {
                info!(
                    "Session {} -> {}",
                    transition.audit_entry.from_state, transition.audit_entry.to_state
                );
            }
            if let SessionState::Failed(failed) = &transition.new_state {
                warn!("Session with {} failed: {}", failed.peer_id, failed.reason);
            }

            self.state = transition.new_state;
            self.audit_trail.push(transition.audit_entry);
            self.status.send_replace(ConnectionStatus::of(&self.state));

            for effect in transition.effects {
                if let Some(follow_up) = self.execute(effect).await {
                    pending.push_back(follow_up);
                }
            }
        }
    }

    async fn execute(&mut self, effect: SessionEffect) -> Option<SessionInput> {
        match effect {
            SessionEffect::OpenConnection { peer_id } => {
                match self.transport.connect(&peer_id, self.events_tx.clone()).await {
                    Ok(handle) => {
                        self.handle = Some(handle);
                        None
                    }
                    Err(e) => Some(SessionInput::ConnectionFailed {
                        reason: e.to_string(),
                    }),
                }
            }
            SessionEffect::DiscoverServices => {
                let handle = self.handle?;
                self.transport
                    .discover_services(handle)
                    .await
                    .err()
                    .map(|e| SessionInput::ServicesDiscovered(Err(e)))
            }
            SessionEffect::Subscribe { characteristic } => {
                let handle = self.handle?;
                self.transport
                    .subscribe(handle, characteristic)
                    .await
                    .err()
                    .map(|e| SessionInput::SubscriptionConfirmed(Err(e)))
            }
            SessionEffect::DeliverMessage { payload } => {
                let codec = MessageCodec::new(self.config.max_payload_size);
                self.history.record_incoming(codec.decode(&payload));
                None
            }
            SessionEffect::ReleaseConnection => {
                if let Some(handle) = self.handle.take() {
                    debug!("Releasing {}", handle);
                    self.transport.disconnect(handle).await;
                }
                matches!(self.state, SessionState::Closing(_)).then_some(SessionInput::Released)
            }
        }
    }

    // ------------------------------------------------------------------------
    // Presentation Access
    // ------------------------------------------------------------------------

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn phase(&self) -> SessionPhase {
        self.state.phase()
    }

    pub fn is_connected(&self) -> bool {
        self.state.is_ready()
    }

    pub fn peer_id(&self) -> Option<&PeerId> {
        self.state.peer_id()
    }

    pub fn device_name(&self) -> Option<&str> {
        self.state.device_name()
    }

    /// Transport handle of the current session, if one is open
    pub fn session_handle(&self) -> Option<SessionHandle> {
        self.handle
    }

    pub fn history(&self) -> &MessageHistory {
        &self.history
    }

    pub fn messages(&self) -> Vec<Message> {
        self.history.snapshot()
    }

    /// Receive messages appended to this client's history
    ///
    /// The stream outlives individual sessions: after a reconnect it carries
    /// the new session's messages.
    pub fn subscribe_messages(&self) -> broadcast::Receiver<Message> {
        self.history.subscribe()
    }

    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.subscribe()
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status.borrow().clone()
    }

    /// Every transition of the current session, oldest first
    pub fn audit_trail(&self) -> &[AuditEntry] {
        &self.audit_trail
    }
}

impl Drop for ChatClient {
    fn drop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                debug!("Releasing {} on drop", handle);
                let transport = Arc::clone(&self.transport);
                runtime.spawn(async move {
                    transport.disconnect(handle).await;
                });
            }
            Err(_) => warn!("No runtime to release {} on drop", handle),
        }
    }
}

impl std::fmt::Debug for ChatClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatClient")
            .field("state", &self.state.state_name())
            .field("handle", &self.handle)
            .field("messages", &self.history.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{MemoryFaults, MemoryRadio};

    #[tokio::test]
    async fn test_send_before_connect_is_rejected() {
        let radio = MemoryRadio::new();
        let device = radio.device("CC:DD");
        let mut client = ChatClient::new(Arc::new(device.clone()), ChatConfig::default());

        let err = client.send("hello").await.unwrap_err();
        assert!(err.is_not_connected());
        assert!(radio.writes(device.address()).is_empty());
        assert!(client.messages().is_empty());
    }

    #[tokio::test]
    async fn test_connect_to_absent_peer_fails() {
        let radio = MemoryRadio::new();
        let device = radio.device("CC:DD");
        let mut client = ChatClient::new(Arc::new(device), ChatConfig::default());

        client.connect(&PeerId::from("EE:FF")).await.unwrap();
        client.process_pending().await;

        assert_eq!(client.phase(), SessionPhase::Failed);
        assert_eq!(client.device_name(), Some("Unknown Device"));
        assert!(client.session_handle().is_none());
        assert!(!client.status().connected);
    }

    #[tokio::test]
    async fn test_disconnect_when_idle_is_noop() {
        let radio = MemoryRadio::new();
        let mut client = ChatClient::new(Arc::new(radio.device("CC:DD")), ChatConfig::default());

        client.disconnect().await;
        assert_eq!(client.phase(), SessionPhase::Idle);
        assert!(client.audit_trail().is_empty());
        assert_eq!(client.status().label(), "Disconnected");
    }

    #[tokio::test(start_paused = true)]
    async fn test_connecting_starts_before_name_is_known() {
        let radio = MemoryRadio::new();
        radio.named_device("CC:DD", "Kitchen Pi");
        let device = radio.device("11:22");
        radio.set_faults(
            device.address(),
            MemoryFaults {
                name_lookup_delay: Some(Duration::from_secs(1)),
                ..Default::default()
            },
        );
        let mut client = ChatClient::new(Arc::new(device), ChatConfig::default());

        client.connect(&PeerId::from("CC:DD")).await.unwrap();

        let inputs: Vec<&str> = client
            .audit_trail()
            .iter()
            .map(|entry| entry.input.as_str())
            .collect();
        assert_eq!(inputs[0], "Connect");
        assert_eq!(client.audit_trail()[0].to_state, SessionPhase::Connecting);
        assert_eq!(inputs.last(), Some(&"NameResolved"));
        assert_eq!(client.device_name(), Some("Kitchen Pi"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_name_lookup_keeps_placeholder() {
        let radio = MemoryRadio::new();
        radio.named_device("CC:DD", "Kitchen Pi");
        let device = radio.device("11:22");
        radio.set_faults(
            device.address(),
            MemoryFaults {
                name_lookup_delay: Some(Duration::from_secs(60)),
                ..Default::default()
            },
        );
        let mut client = ChatClient::new(Arc::new(device), ChatConfig::default());

        let started = tokio::time::Instant::now();
        client.connect(&PeerId::from("CC:DD")).await.unwrap();

        assert!(started.elapsed() <= NAME_LOOKUP_TIMEOUT);
        assert_eq!(client.device_name(), Some("Unknown Device"));
        assert!(client
            .audit_trail()
            .iter()
            .all(|entry| entry.input != "NameResolved"));
    }

    #[tokio::test]
    async fn test_message_stream_survives_reconnect() {
        let radio = MemoryRadio::new();
        let device = radio.device("11:22");
        let mut client = ChatClient::new(Arc::new(device), ChatConfig::default());
        let mut updates = client.subscribe_messages();

        client.connect(&PeerId::from("EE:FF")).await.unwrap();
        client.process_pending().await;
        assert_eq!(client.phase(), SessionPhase::Failed);
        client.connect(&PeerId::from("EE:FF")).await.unwrap();

        assert!(client.messages().is_empty());
        assert!(matches!(
            updates.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
    }
}
