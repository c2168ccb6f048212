//! Transport abstraction consumed by the chat core
//!
//! Platform radios are reached only through [`Transport`]. Calls initiate work;
//! completions arrive as events on the channel the caller handed over when it
//! started scanning, connecting or serving. One channel per scan, per client and
//! per server run keeps each owner's events in the order the radio observed them.

pub mod memory;

use core::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::config::{AdvertiseSettings, ScanMode};
use crate::errors::{TransportError, TransportResult};
use crate::protocol::{DiscoveredService, ServiceDefinition};
use crate::types::{PeerId, Timestamp};

pub use memory::{MemoryDevice, MemoryFaults, MemoryRadio, RecordedResponse};

/// Sending half of an ordered event channel
pub type EventSender<E> = mpsc::UnboundedSender<E>;

/// Receiving half of an ordered event channel
pub type EventReceiver<E> = mpsc::UnboundedReceiver<E>;

// ----------------------------------------------------------------------------
// Handles
// ----------------------------------------------------------------------------

macro_rules! handle_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(u64);

        impl $name {
            pub fn new(id: u64) -> Self {
                Self(id)
            }

            pub fn id(&self) -> u64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}#{}", stringify!($name), self.0)
            }
        }
    };
}

handle_type!(
    /// One outbound connection attempt and, if it succeeds, its link
    SessionHandle
);
handle_type!(
    /// A remote connected to the local GATT server
    RemoteHandle
);
handle_type!(
    /// A running advertisement
    AdvertiseHandle
);
handle_type!(
    /// A service registered with the local GATT server
    ServiceRegistration
);
handle_type!(
    /// A read or write request awaiting a response
    RequestId
);

// ----------------------------------------------------------------------------
// Peer Descriptor
// ----------------------------------------------------------------------------

/// A remote device as seen by discovery
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerDescriptor {
    pub id: PeerId,
    /// Absent if the name is unresolved or unreadable
    pub name: Option<String>,
    pub last_seen: Timestamp,
}

impl PeerDescriptor {
    pub fn new(id: PeerId, name: Option<String>) -> Self {
        Self {
            id,
            name,
            last_seen: Timestamp::now(),
        }
    }

    /// The name to show, falling back to `placeholder`
    pub fn display_name<'a>(&'a self, placeholder: &'a str) -> &'a str {
        self.name.as_deref().unwrap_or(placeholder)
    }
}

// ----------------------------------------------------------------------------
// Events
// ----------------------------------------------------------------------------

/// Scan results
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryEvent {
    PeerFound(PeerDescriptor),
}

/// Client-side link events, tagged with the session they belong to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionEvent {
    pub session: SessionHandle,
    pub kind: SessionEventKind,
}

impl SessionEvent {
    pub fn new(session: SessionHandle, kind: SessionEventKind) -> Self {
        Self { session, kind }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEventKind {
    /// The link is up
    ConnectionEstablished,
    /// The link could not be brought up
    ConnectionFailed { reason: String },
    /// The link dropped without the local side asking for it
    ConnectionLost { reason: String },
    /// Remote service enumeration finished
    ServicesDiscovered(Result<Vec<DiscoveredService>, TransportError>),
    /// The remote acknowledged (or refused) a notification subscription
    SubscriptionConfirmed(Result<(), TransportError>),
    /// A notification arrived
    CharacteristicChanged { characteristic: Uuid, value: Vec<u8> },
}

impl SessionEventKind {
    /// Short name for logging
    pub fn name(&self) -> &'static str {
        match self {
            SessionEventKind::ConnectionEstablished => "ConnectionEstablished",
            SessionEventKind::ConnectionFailed { .. } => "ConnectionFailed",
            SessionEventKind::ConnectionLost { .. } => "ConnectionLost",
            SessionEventKind::ServicesDiscovered(_) => "ServicesDiscovered",
            SessionEventKind::SubscriptionConfirmed(_) => "SubscriptionConfirmed",
            SessionEventKind::CharacteristicChanged { .. } => "CharacteristicChanged",
        }
    }
}

/// Events delivered to the local GATT server
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    ConnectionEstablished {
        remote: PeerId,
        handle: RemoteHandle,
    },
    ConnectionLost {
        remote: PeerId,
    },
    ReadRequested {
        remote: PeerId,
        request_id: RequestId,
        characteristic: Uuid,
        offset: usize,
    },
    WriteRequested {
        remote: PeerId,
        request_id: RequestId,
        characteristic: Uuid,
        value: Vec<u8>,
        response_needed: bool,
    },
}

impl ServerEvent {
    /// Short name for logging
    pub fn name(&self) -> &'static str {
        match self {
            ServerEvent::ConnectionEstablished { .. } => "ConnectionEstablished",
            ServerEvent::ConnectionLost { .. } => "ConnectionLost",
            ServerEvent::ReadRequested { .. } => "ReadRequested",
            ServerEvent::WriteRequested { .. } => "WriteRequested",
        }
    }
}

/// Status sent back for a read or write request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GattStatus {
    Success,
    InvalidOffset,
    RequestNotSupported,
    Failure,
}

// ----------------------------------------------------------------------------
// Transport Trait
// ----------------------------------------------------------------------------

/// Capability surface of the local radio, covering both chat roles
///
/// Adapters that cannot play a role return [`TransportError::Unsupported`] from
/// that role's methods.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Report peers advertising `service` on `events` until [`Transport::stop_scan`]
    async fn start_scan(
        &self,
        service: Uuid,
        mode: ScanMode,
        events: EventSender<DiscoveryEvent>,
    ) -> TransportResult<()>;

    async fn stop_scan(&self) -> TransportResult<()>;

    /// Devices the platform has paired with
    async fn bonded_peers(&self) -> TransportResult<Vec<PeerDescriptor>>;

    /// Devices with a live GATT link to this radio
    async fn connected_peers(&self) -> TransportResult<Vec<PeerDescriptor>>;

    /// The remote's advertised name, if known and readable
    async fn peer_name(&self, peer: &PeerId) -> Option<String>;

    /// Begin connecting; the outcome arrives as a [`SessionEvent`]
    async fn connect(
        &self,
        peer: &PeerId,
        events: EventSender<SessionEvent>,
    ) -> TransportResult<SessionHandle>;

    /// Begin remote service enumeration; completes with `ServicesDiscovered`
    async fn discover_services(&self, session: SessionHandle) -> TransportResult<()>;

    /// Begin enabling notifications; completes with `SubscriptionConfirmed`
    async fn subscribe(&self, session: SessionHandle, characteristic: Uuid)
        -> TransportResult<()>;

    /// Write with response; returns once the remote acknowledged
    async fn write(
        &self,
        session: SessionHandle,
        characteristic: Uuid,
        value: &[u8],
    ) -> TransportResult<()>;

    /// Release the link; never fails and is safe to repeat
    async fn disconnect(&self, session: SessionHandle);

    /// Largest value a single write on this link can carry, if negotiated
    fn payload_limit(&self, _session: SessionHandle) -> Option<usize> {
        None
    }

    /// Host `service`; remote activity arrives on `events`
    async fn register_service(
        &self,
        service: &ServiceDefinition,
        events: EventSender<ServerEvent>,
    ) -> TransportResult<ServiceRegistration>;

    async fn unregister_service(&self, registration: ServiceRegistration) -> TransportResult<()>;

    /// Broadcast discoverability of `service`
    async fn advertise(
        &self,
        service: Uuid,
        settings: &AdvertiseSettings,
    ) -> TransportResult<AdvertiseHandle>;

    async fn stop_advertise(&self, handle: AdvertiseHandle) -> TransportResult<()>;

    /// Answer a read or write request
    async fn respond(
        &self,
        remote: &PeerId,
        request_id: RequestId,
        status: GattStatus,
        value: &[u8],
    ) -> TransportResult<()>;

    /// Push `value` to each remote in `remotes`, reporting the outcome per remote
    async fn notify(
        &self,
        remotes: &[PeerId],
        characteristic: Uuid,
        value: &[u8],
    ) -> Vec<(PeerId, TransportResult<()>)>;

    /// Largest value a notification to `remote` can carry, if negotiated
    fn remote_payload_limit(&self, _remote: &PeerId) -> Option<usize> {
        None
    }

    /// Value to serve for reads of `characteristic` without asking the controller
    ///
    /// Adapters that forward every read as [`ServerEvent::ReadRequested`] ignore it.
    fn set_value(&self, _characteristic: Uuid, _value: &[u8]) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handle_display() {
        assert_eq!(SessionHandle::new(7).to_string(), "SessionHandle#7");
        assert_eq!(RemoteHandle::new(3).id(), 3);
    }

    #[test]
    fn test_descriptor_placeholder() {
        let unnamed = PeerDescriptor::new(PeerId::from("AA:BB"), None);
        assert_eq!(unnamed.display_name("Unknown Device"), "Unknown Device");

        let named = PeerDescriptor::new(PeerId::from("AA:BB"), Some("Pixel".to_string()));
        assert_eq!(named.display_name("Unknown Device"), "Pixel");
    }
}
