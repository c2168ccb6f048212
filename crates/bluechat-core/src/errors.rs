//! Error types for the BlueChat core
//!
//! Failures are grouped by concern: transport adapter failures, session misuse by
//! the presentation layer, payload encoding limits and configuration problems.
//! [`BluechatError`] unifies them for callers that do not care which layer failed.

use thiserror::Error;

// ----------------------------------------------------------------------------
// Specific Error Types
// ----------------------------------------------------------------------------

/// Failures reported by a transport adapter
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("Radio is not available: {reason}")]
    Unavailable { reason: String },

    #[error("Operation not supported by this transport: {operation}")]
    Unsupported { operation: String },

    #[error("Connection failed to peer {peer_id}: {reason}")]
    ConnectionFailed { peer_id: String, reason: String },

    #[error("Peer not found: {peer_id}")]
    PeerNotFound { peer_id: String },

    #[error("Unknown session handle: {session}")]
    UnknownSession { session: u64 },

    #[error("Service discovery failed: {reason}")]
    ServiceDiscoveryFailed { reason: String },

    #[error("Service not found: {service}")]
    ServiceNotFound { service: String },

    #[error("Characteristic not found: {characteristic}")]
    CharacteristicNotFound { characteristic: String },

    #[error("Failed to subscribe to notifications: {reason}")]
    SubscriptionFailed { reason: String },

    #[error("Failed to write to characteristic: {reason}")]
    WriteFailed { reason: String },

    #[error("Failed to notify remote {peer_id}: {reason}")]
    NotifyFailed { peer_id: String, reason: String },

    #[error("Failed to start advertising: {reason}")]
    AdvertiseFailed { reason: String },

    #[error("Failed to register GATT service: {reason}")]
    RegistrationFailed { reason: String },

    #[error("No pending request {request}")]
    UnknownRequest { request: u64 },

    #[error("Event channel closed")]
    ChannelClosed,
}

/// Misuse of a chat session by its owner
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("Not connected (session is {state})")]
    NotConnected { state: String },

    #[error("A session with {peer_id} is already active ({state})")]
    SessionActive { peer_id: String, state: String },

    #[error("Chat server is not running")]
    ServerNotRunning,
}

/// Payload encoding failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("Payload too large: {size} bytes (max: {max_size})")]
    PayloadTooLarge { size: usize, max_size: usize },
}

/// Configuration validation failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("Configuration validation error: {0}")]
    Validation(String),
}

// ----------------------------------------------------------------------------
// Unified Error Type
// ----------------------------------------------------------------------------

/// Main error type for BlueChat core operations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BluechatError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl BluechatError {
    /// Whether the error means the payload exceeded the negotiated limit
    pub fn is_size_exceeded(&self) -> bool {
        matches!(self, BluechatError::Codec(CodecError::PayloadTooLarge { .. }))
    }

    /// Whether the error means the caller tried to use a session that is not ready
    pub fn is_not_connected(&self) -> bool {
        matches!(self, BluechatError::Session(SessionError::NotConnected { .. }))
    }
}

/// Result type for core operations
pub type Result<T> = core::result::Result<T, BluechatError>;

/// Result type returned by transport adapters
pub type TransportResult<T> = core::result::Result<T, TransportError>;
