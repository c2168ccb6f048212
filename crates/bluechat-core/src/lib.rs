//! BlueChat Core
//!
//! Platform-independent core of a two-peer Bluetooth LE text chat: the transport
//! abstraction, discovery, the client session state machine, the server role
//! controller, and the message codec and history. Platform radios plug in by
//! implementing [`Transport`]; [`MemoryRadio`] provides an in-process one.

// ----------------------------------------------------------------------------
// Module Declarations
// ----------------------------------------------------------------------------

pub mod client;
pub mod codec;
pub mod config;
pub mod discovery;
pub mod errors;
pub mod history;
pub mod protocol;
pub mod radio;
pub mod server;
pub mod session;
pub mod transport;
pub mod types;

// ----------------------------------------------------------------------------
// Public API
// ----------------------------------------------------------------------------

pub use client::{ChatClient, ConnectionStatus};
pub use codec::MessageCodec;
pub use config::{
    AdvertiseMode, AdvertiseSettings, ChatConfig, ScanMode, TxPower, UNKNOWN_DEVICE_NAME,
};
pub use discovery::{DiscoveryManager, PeerSet};
pub use errors::{
    BluechatError, CodecError, ConfigError, Result, SessionError, TransportError,
    TransportResult,
};
pub use history::{Direction, Message, MessageHistory};
pub use protocol::{
    ServiceDefinition, CHAT_CHARACTERISTIC_UUID, CHAT_SERVICE_UUID, MAX_ATTRIBUTE_LEN,
};
pub use radio::{AdvertiseOwner, RadioSession};
pub use server::{ConnectedRemote, ServerController};
pub use session::{SessionPhase, SessionState};
pub use transport::{
    DiscoveryEvent, MemoryDevice, MemoryFaults, MemoryRadio, PeerDescriptor, ServerEvent,
    SessionEvent, SessionEventKind, SessionHandle, Transport,
};
pub use types::{PeerId, SystemTimeSource, TimeSource, Timestamp};
