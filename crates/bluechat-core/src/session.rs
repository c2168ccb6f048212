//! Linear session state machine
//!
//! One client session walks `Idle → Connecting → DiscoveringServices →
//! Subscribing → Ready`, and leaves through `Closing → Closed` on request or
//! through `Failed` when the link breaks. [`SessionState::transition`] is a pure
//! function of the current state and one input: it returns the next state, the
//! effects the driver must run against the transport, and an audit entry.
//! Inputs that do not fit the current state are rejected, never applied.

use core::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::errors::TransportError;
use crate::protocol::{DiscoveredService, ResolvedCharacteristic};
use crate::types::{PeerId, Timestamp};

// ----------------------------------------------------------------------------
// Session State Types
// ----------------------------------------------------------------------------

/// Service and characteristic a session must find on the remote
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceTarget {
    pub service: Uuid,
    pub characteristic: Uuid,
}

/// Where a session is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionPhase {
    Idle,
    Connecting,
    DiscoveringServices,
    Subscribing,
    Ready,
    Closing,
    Closed,
    Failed,
}

impl SessionPhase {
    pub fn name(&self) -> &'static str {
        match self {
            SessionPhase::Idle => "Idle",
            SessionPhase::Connecting => "Connecting",
            SessionPhase::DiscoveringServices => "DiscoveringServices",
            SessionPhase::Subscribing => "Subscribing",
            SessionPhase::Ready => "Ready",
            SessionPhase::Closing => "Closing",
            SessionPhase::Closed => "Closed",
            SessionPhase::Failed => "Failed",
        }
    }
}

impl fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Linear session state that must be consumed to transition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    /// No connection has been requested
    Idle,
    /// Waiting for the link to come up
    Connecting(ConnectingState),
    /// Link is up, enumerating remote services
    DiscoveringServices(LinkState),
    /// Chat characteristic found, enabling notifications
    Subscribing(ResolvedState),
    /// Messages can flow both ways
    Ready(ReadyState),
    /// Local side asked to close; the link is being released
    Closing(EndedState),
    /// Closed on request
    Closed(EndedState),
    /// Ended by an error or an unexpected disconnect
    Failed(FailedState),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectingState {
    pub peer_id: PeerId,
    pub device_name: String,
    pub target: ServiceTarget,
    pub started: Timestamp,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkState {
    pub peer_id: PeerId,
    pub device_name: String,
    pub target: ServiceTarget,
    pub connected_since: Timestamp,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedState {
    pub link: LinkState,
    pub resolved: ResolvedCharacteristic,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadyState {
    pub link: LinkState,
    pub resolved: ResolvedCharacteristic,
    pub ready_since: Timestamp,
    pub messages_received: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndedState {
    pub peer_id: PeerId,
    pub device_name: String,
    pub resolved: Option<ResolvedCharacteristic>,
    pub at: Timestamp,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedState {
    pub peer_id: PeerId,
    pub device_name: String,
    pub resolved: Option<ResolvedCharacteristic>,
    pub failed_at: Timestamp,
    pub reason: String,
}

// ----------------------------------------------------------------------------
// Inputs and Effects
// ----------------------------------------------------------------------------

/// Inputs that drive a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionInput {
    /// Caller asked to open a session
    Connect {
        peer_id: PeerId,
        device_name: String,
        target: ServiceTarget,
    },
    ConnectionEstablished,
    ConnectionFailed { reason: String },
    /// Link dropped without the local side asking for it
    ConnectionLost { reason: String },
    ServicesDiscovered(Result<Vec<DiscoveredService>, TransportError>),
    SubscriptionConfirmed(Result<(), TransportError>),
    /// A notification arrived on the link
    NotificationReceived { characteristic: Uuid, value: Vec<u8> },
    /// Caller asked to close the session
    Disconnect,
    /// The transport connection has been released
    Released,
    /// The peer's name became known after the session started
    NameResolved { name: String },
}

impl SessionInput {
    pub fn name(&self) -> &'static str {
        match self {
            SessionInput::Connect { .. } => "Connect",
            SessionInput::ConnectionEstablished => "ConnectionEstablished",
            SessionInput::ConnectionFailed { .. } => "ConnectionFailed",
            SessionInput::ConnectionLost { .. } => "ConnectionLost",
            SessionInput::ServicesDiscovered(_) => "ServicesDiscovered",
            SessionInput::SubscriptionConfirmed(_) => "SubscriptionConfirmed",
            SessionInput::NotificationReceived { .. } => "NotificationReceived",
            SessionInput::Disconnect => "Disconnect",
            SessionInput::Released => "Released",
            SessionInput::NameResolved { .. } => "NameResolved",
        }
    }
}

/// Work the driver performs after a transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEffect {
    OpenConnection { peer_id: PeerId },
    DiscoverServices,
    Subscribe { characteristic: Uuid },
    /// Decode the payload and append it to history
    DeliverMessage { payload: Vec<u8> },
    /// Release the transport connection
    ReleaseConnection,
}

// ----------------------------------------------------------------------------
// State Transition Results
// ----------------------------------------------------------------------------

/// Result of a state transition
#[derive(Debug, Clone)]
pub struct StateTransition {
    pub new_state: SessionState,
    pub effects: Vec<SessionEffect>,
    pub audit_entry: AuditEntry,
}

/// Audit trail entry for a state transition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub timestamp: Timestamp,
    pub peer_id: Option<PeerId>,
    pub from_state: SessionPhase,
    pub to_state: SessionPhase,
    pub input: String,
    pub effects_count: usize,
}

/// Errors that can occur during state transitions
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StateTransitionError {
    #[error("Invalid transition from {from_state} on {input}")]
    InvalidTransition {
        from_state: SessionPhase,
        input: &'static str,
    },
}

// ----------------------------------------------------------------------------
// State Machine Implementation
// ----------------------------------------------------------------------------

impl Default for SessionState {
    fn default() -> Self {
        SessionState::Idle
    }
}

impl SessionState {
    pub fn phase(&self) -> SessionPhase {
        match self {
            SessionState::Idle => SessionPhase::Idle,
            SessionState::Connecting(_) => SessionPhase::Connecting,
            SessionState::DiscoveringServices(_) => SessionPhase::DiscoveringServices,
            SessionState::Subscribing(_) => SessionPhase::Subscribing,
            SessionState::Ready(_) => SessionPhase::Ready,
            SessionState::Closing(_) => SessionPhase::Closing,
            SessionState::Closed(_) => SessionPhase::Closed,
            SessionState::Failed(_) => SessionPhase::Failed,
        }
    }

    /// Get current state name for logging/audit
    pub fn state_name(&self) -> &'static str {
        self.phase().name()
    }

    pub fn peer_id(&self) -> Option<&PeerId> {
        match self {
            SessionState::Idle => None,
            SessionState::Connecting(s) => Some(&s.peer_id),
            SessionState::DiscoveringServices(s) => Some(&s.peer_id),
            SessionState::Subscribing(s) => Some(&s.link.peer_id),
            SessionState::Ready(s) => Some(&s.link.peer_id),
            SessionState::Closing(s) | SessionState::Closed(s) => Some(&s.peer_id),
            SessionState::Failed(s) => Some(&s.peer_id),
        }
    }

    pub fn device_name(&self) -> Option<&str> {
        match self {
            SessionState::Idle => None,
            SessionState::Connecting(s) => Some(&s.device_name),
            SessionState::DiscoveringServices(s) => Some(&s.device_name),
            SessionState::Subscribing(s) => Some(&s.link.device_name),
            SessionState::Ready(s) => Some(&s.link.device_name),
            SessionState::Closing(s) | SessionState::Closed(s) => Some(&s.device_name),
            SessionState::Failed(s) => Some(&s.device_name),
        }
    }

    /// Chat characteristic handles, present once service discovery succeeded
    pub fn resolved(&self) -> Option<&ResolvedCharacteristic> {
        match self {
            SessionState::Idle
            | SessionState::Connecting(_)
            | SessionState::DiscoveringServices(_) => None,
            SessionState::Subscribing(s) => Some(&s.resolved),
            SessionState::Ready(s) => Some(&s.resolved),
            SessionState::Closing(s) | SessionState::Closed(s) => s.resolved.as_ref(),
            SessionState::Failed(s) => s.resolved.as_ref(),
        }
    }

    /// Check if state allows message sending
    pub fn is_ready(&self) -> bool {
        matches!(self, SessionState::Ready(_))
    }

    /// A connection is requested, up, or being released
    pub fn is_live(&self) -> bool {
        !matches!(
            self,
            SessionState::Idle | SessionState::Closed(_) | SessionState::Failed(_)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Closed(_) | SessionState::Failed(_))
    }

    fn renamed(mut self, name: String) -> Self {
        match &mut self {
            SessionState::Idle => {}
            SessionState::Connecting(s) => s.device_name = name,
            SessionState::DiscoveringServices(s) => s.device_name = name,
            SessionState::Subscribing(s) => s.link.device_name = name,
            SessionState::Ready(s) => s.link.device_name = name,
            SessionState::Closing(s) | SessionState::Closed(s) => s.device_name = name,
            SessionState::Failed(s) => s.device_name = name,
        }
        self
    }

    /// Process an input and transition to a new state (consumes self)
    pub fn transition(
        self,
        input: SessionInput,
        now: Timestamp,
    ) -> Result<StateTransition, StateTransitionError> {
        let from_state = self.phase();
        let input_name = input.name();

        let (new_state, effects) = match (self, input) {
            // From Idle, Closed or Failed
            (
                SessionState::Idle | SessionState::Closed(_) | SessionState::Failed(_),
                SessionInput::Connect {
                    peer_id,
                    device_name,
                    target,
                },
            ) => {
                let effects = vec![SessionEffect::OpenConnection {
                    peer_id: peer_id.clone(),
                }];
                let state = SessionState::Connecting(ConnectingState {
                    peer_id,
                    device_name,
                    target,
                    started: now,
                });
                (state, effects)
            }

            // From Connecting
            (SessionState::Connecting(state), SessionInput::ConnectionEstablished) => {
                let link = LinkState {
                    peer_id: state.peer_id,
                    device_name: state.device_name,
                    target: state.target,
                    connected_since: now,
                };
                (
                    SessionState::DiscoveringServices(link),
                    vec![SessionEffect::DiscoverServices],
                )
            }

            (
                SessionState::Connecting(state),
                SessionInput::ConnectionFailed { reason } | SessionInput::ConnectionLost { reason },
            ) => fail(state.peer_id, state.device_name, None, reason, now),

            // From DiscoveringServices
            (SessionState::DiscoveringServices(link), SessionInput::ServicesDiscovered(result)) => {
                match result.map_err(|e| e.to_string()).and_then(|services| {
                    resolve_target(&link.target, &services)
                }) {
                    Ok(resolved) => {
                        let effects = vec![SessionEffect::Subscribe {
                            characteristic: resolved.characteristic,
                        }];
                        (
                            SessionState::Subscribing(ResolvedState { link, resolved }),
                            effects,
                        )
                    }
                    Err(reason) => fail(link.peer_id, link.device_name, None, reason, now),
                }
            }

            // From Subscribing
            (SessionState::Subscribing(state), SessionInput::SubscriptionConfirmed(Ok(()))) => {
                let ready = ReadyState {
                    link: state.link,
                    resolved: state.resolved,
                    ready_since: now,
                    messages_received: 0,
                };
                (SessionState::Ready(ready), Vec::new())
            }

            (SessionState::Subscribing(state), SessionInput::SubscriptionConfirmed(Err(e))) => fail(
                state.link.peer_id,
                state.link.device_name,
                Some(state.resolved),
                e.to_string(),
                now,
            ),

            // From Ready
            (
                SessionState::Ready(mut state),
                SessionInput::NotificationReceived {
                    characteristic,
                    value,
                },
            ) if characteristic == state.resolved.characteristic => {
                state.messages_received += 1;
                (
                    SessionState::Ready(state),
                    vec![SessionEffect::DeliverMessage { payload: value }],
                )
            }

            // Unexpected disconnection while the link is up
            (SessionState::DiscoveringServices(link), SessionInput::ConnectionLost { reason }) => {
                fail(link.peer_id, link.device_name, None, reason, now)
            }
            (SessionState::Subscribing(state), SessionInput::ConnectionLost { reason }) => fail(
                state.link.peer_id,
                state.link.device_name,
                Some(state.resolved),
                reason,
                now,
            ),
            (SessionState::Ready(state), SessionInput::ConnectionLost { reason }) => fail(
                state.link.peer_id,
                state.link.device_name,
                Some(state.resolved),
                reason,
                now,
            ),

            // Explicit close from any live state
            (state @ SessionState::Connecting(_), SessionInput::Disconnect)
            | (state @ SessionState::DiscoveringServices(_), SessionInput::Disconnect)
            | (state @ SessionState::Subscribing(_), SessionInput::Disconnect)
            | (state @ SessionState::Ready(_), SessionInput::Disconnect) => {
                let ended = ended(&state, now);
                (
                    SessionState::Closing(ended),
                    vec![SessionEffect::ReleaseConnection],
                )
            }

            // From Closing
            (SessionState::Closing(state), SessionInput::Released) => {
                (SessionState::Closed(EndedState { at: now, ..state }), Vec::new())
            }

            // Relabels the session without moving it
            (state, SessionInput::NameResolved { name }) if state.peer_id().is_some() => {
                (state.renamed(name), Vec::new())
            }

            // Invalid transitions
            (_, input) => {
                return Err(StateTransitionError::InvalidTransition {
                    from_state,
                    input: input.name(),
                });
            }
        };

        let audit_entry = AuditEntry {
            timestamp: now,
            peer_id: new_state.peer_id().cloned(),
            from_state,
            to_state: new_state.phase(),
            input: input_name.to_string(),
            effects_count: effects.len(),
        };

        Ok(StateTransition {
            new_state,
            effects,
            audit_entry,
        })
    }
}

// ----------------------------------------------------------------------------
// Utility Functions
// ----------------------------------------------------------------------------

fn fail(
    peer_id: PeerId,
    device_name: String,
    resolved: Option<ResolvedCharacteristic>,
    reason: String,
    now: Timestamp,
) -> (SessionState, Vec<SessionEffect>) {
    let state = SessionState::Failed(FailedState {
        peer_id,
        device_name,
        resolved,
        failed_at: now,
        reason,
    });
    (state, vec![SessionEffect::ReleaseConnection])
}

fn ended(state: &SessionState, now: Timestamp) -> EndedState {
    EndedState {
        peer_id: state.peer_id().cloned().unwrap_or_else(|| PeerId::new("")),
        device_name: state.device_name().unwrap_or_default().to_string(),
        resolved: state.resolved().copied(),
        at: now,
    }
}

/// Find the target service and a notify-capable target characteristic
fn resolve_target(
    target: &ServiceTarget,
    services: &[DiscoveredService],
) -> Result<ResolvedCharacteristic, String> {
    let service = services
        .iter()
        .find(|s| s.uuid == target.service)
        .ok_or_else(|| format!("service {} not found", target.service))?;
    let characteristic = service
        .characteristics
        .iter()
        .find(|c| c.uuid == target.characteristic)
        .ok_or_else(|| format!("characteristic {} not found", target.characteristic))?;
    if !characteristic.properties.notify {
        return Err(format!(
            "characteristic {} does not support notifications",
            target.characteristic
        ));
    }

    Ok(ResolvedCharacteristic {
        service: service.uuid,
        characteristic: characteristic.uuid,
        properties: characteristic.properties,
    })
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{
        DiscoveredService, ServiceDefinition, CHAT_CHARACTERISTIC_UUID, CHAT_SERVICE_UUID,
    };

    fn target() -> ServiceTarget {
        ServiceTarget {
            service: CHAT_SERVICE_UUID,
            characteristic: CHAT_CHARACTERISTIC_UUID,
        }
    }

    fn connect_input() -> SessionInput {
        SessionInput::Connect {
            peer_id: PeerId::from("CC:DD"),
            device_name: "Unknown Device".to_string(),
            target: target(),
        }
    }

    fn chat_services() -> Vec<DiscoveredService> {
        vec![DiscoveredService::from(&ServiceDefinition::default())]
    }

    fn step(state: SessionState, input: SessionInput) -> StateTransition {
        state.transition(input, Timestamp::new(1_000)).unwrap()
    }

    fn ready_state() -> SessionState {
        let state = step(SessionState::Idle, connect_input()).new_state;
        let state = step(state, SessionInput::ConnectionEstablished).new_state;
        let state = step(state, SessionInput::ServicesDiscovered(Ok(chat_services()))).new_state;
        step(state, SessionInput::SubscriptionConfirmed(Ok(()))).new_state
    }

    #[test]
    fn test_initial_state() {
        let state = SessionState::default();
        assert_eq!(state.state_name(), "Idle");
        assert!(!state.is_ready());
        assert!(!state.is_live());
        assert!(state.resolved().is_none());
    }

    #[test]
    fn test_connection_flow() {
        let transition = step(SessionState::Idle, connect_input());
        assert_eq!(transition.new_state.phase(), SessionPhase::Connecting);
        assert_eq!(
            transition.effects,
            vec![SessionEffect::OpenConnection {
                peer_id: PeerId::from("CC:DD")
            }]
        );

        let transition = step(transition.new_state, SessionInput::ConnectionEstablished);
        assert_eq!(transition.new_state.phase(), SessionPhase::DiscoveringServices);
        assert_eq!(transition.effects, vec![SessionEffect::DiscoverServices]);
        assert!(transition.new_state.resolved().is_none());

        let transition = step(
            transition.new_state,
            SessionInput::ServicesDiscovered(Ok(chat_services())),
        );
        assert_eq!(transition.new_state.phase(), SessionPhase::Subscribing);
        assert_eq!(
            transition.new_state.resolved().unwrap().characteristic,
            CHAT_CHARACTERISTIC_UUID
        );

        let transition = step(transition.new_state, SessionInput::SubscriptionConfirmed(Ok(())));
        assert!(transition.new_state.is_ready());
        assert_eq!(transition.audit_entry.from_state, SessionPhase::Subscribing);
        assert_eq!(transition.audit_entry.to_state, SessionPhase::Ready);
    }

    #[test]
    fn test_missing_characteristic_fails() {
        let state = step(SessionState::Idle, connect_input()).new_state;
        let state = step(state, SessionInput::ConnectionEstablished).new_state;

        let mut services = chat_services();
        services[0].characteristics.clear();
        let transition = step(state, SessionInput::ServicesDiscovered(Ok(services)));

        assert_eq!(transition.new_state.phase(), SessionPhase::Failed);
        assert_eq!(transition.effects, vec![SessionEffect::ReleaseConnection]);
        assert!(transition.new_state.resolved().is_none());
    }

    #[test]
    fn test_enumeration_error_fails() {
        let state = step(SessionState::Idle, connect_input()).new_state;
        let state = step(state, SessionInput::ConnectionEstablished).new_state;
        let transition = step(
            state,
            SessionInput::ServicesDiscovered(Err(TransportError::ServiceDiscoveryFailed {
                reason: "gatt error".to_string(),
            })),
        );

        match transition.new_state {
            SessionState::Failed(failed) => assert!(failed.reason.contains("gatt error")),
            other => panic!("expected Failed, got {}", other.state_name()),
        }
    }

    #[test]
    fn test_connection_lost_from_ready_fails() {
        let transition = step(
            ready_state(),
            SessionInput::ConnectionLost {
                reason: "timeout".to_string(),
            },
        );
        assert_eq!(transition.new_state.phase(), SessionPhase::Failed);
        // Handles stay visible after the session passed discovery
        assert!(transition.new_state.resolved().is_some());
    }

    #[test]
    fn test_disconnect_goes_through_closing() {
        let transition = step(ready_state(), SessionInput::Disconnect);
        assert_eq!(transition.new_state.phase(), SessionPhase::Closing);
        assert_eq!(transition.effects, vec![SessionEffect::ReleaseConnection]);

        let transition = step(transition.new_state, SessionInput::Released);
        assert_eq!(transition.new_state.phase(), SessionPhase::Closed);
        assert!(transition.new_state.is_terminal());
    }

    #[test]
    fn test_notification_delivers_message() {
        let transition = step(
            ready_state(),
            SessionInput::NotificationReceived {
                characteristic: CHAT_CHARACTERISTIC_UUID,
                value: b"hey".to_vec(),
            },
        );
        assert_eq!(
            transition.effects,
            vec![SessionEffect::DeliverMessage {
                payload: b"hey".to_vec()
            }]
        );
        match transition.new_state {
            SessionState::Ready(ready) => assert_eq!(ready.messages_received, 1),
            other => panic!("expected Ready, got {}", other.state_name()),
        }
    }

    #[test]
    fn test_invalid_transition() {
        // Discovery results before the link is up
        let state = step(SessionState::Idle, connect_input()).new_state;
        let result = state.transition(
            SessionInput::ServicesDiscovered(Ok(chat_services())),
            Timestamp::new(2_000),
        );
        assert_eq!(
            result.unwrap_err(),
            StateTransitionError::InvalidTransition {
                from_state: SessionPhase::Connecting,
                input: "ServicesDiscovered",
            }
        );

        // Closing ignores a late link loss
        let closing = step(ready_state(), SessionInput::Disconnect).new_state;
        assert!(closing
            .transition(
                SessionInput::ConnectionLost {
                    reason: "late".to_string()
                },
                Timestamp::new(2_000)
            )
            .is_err());

        // Nothing to close when idle
        assert!(SessionState::Idle
            .transition(SessionInput::Disconnect, Timestamp::new(2_000))
            .is_err());
    }

    #[test]
    fn test_reconnect_after_failure() {
        let failed = step(
            step(SessionState::Idle, connect_input()).new_state,
            SessionInput::ConnectionFailed {
                reason: "refused".to_string(),
            },
        )
        .new_state;
        assert_eq!(failed.phase(), SessionPhase::Failed);

        let transition = step(failed, connect_input());
        assert_eq!(transition.new_state.phase(), SessionPhase::Connecting);
    }

    #[test]
    fn test_name_resolution_keeps_phase() {
        let connecting = step(SessionState::Idle, connect_input()).new_state;
        assert_eq!(connecting.device_name(), Some("Unknown Device"));

        let transition = step(
            connecting,
            SessionInput::NameResolved {
                name: "Kitchen Pi".to_string(),
            },
        );
        assert_eq!(transition.new_state.phase(), SessionPhase::Connecting);
        assert_eq!(transition.new_state.device_name(), Some("Kitchen Pi"));
        assert!(transition.effects.is_empty());

        let ready = step(
            ready_state(),
            SessionInput::NameResolved {
                name: "Kitchen Pi".to_string(),
            },
        )
        .new_state;
        assert!(ready.is_ready());
        assert_eq!(ready.device_name(), Some("Kitchen Pi"));

        assert!(SessionState::Idle
            .transition(
                SessionInput::NameResolved {
                    name: "Kitchen Pi".to_string()
                },
                Timestamp::new(2_000)
            )
            .is_err());
    }
}
