//! Bluetooth Low Energy transport implementation for BlueChat
//!
//! This crate provides a BLE transport that implements the `Transport` trait from
//! `bluechat-core`, so the chat client and server can run over a real radio.
//!
//! ## Architecture
//!
//! - [`config`] - Transport configuration and settings
//! - [`error`] - Error types specific to BLE transport
//! - `central` - Scanning and client links through `btleplug`
//! - `peripheral` - GATT server and advertising through `bluer`
//! - [`transport`] - The `Transport` implementation combining both roles
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use bluechat_ble::{BleTransport, BleTransportConfig};
//! use bluechat_core::{ChatClient, ChatConfig, PeerId};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = BleTransportConfig::new().with_local_name("BlueChat");
//! let transport = Arc::new(BleTransport::with_config(config)?);
//!
//! let mut client = ChatClient::new(transport, ChatConfig::default());
//! client.connect(&PeerId::new("AA:BB:CC:DD:EE:FF")).await?;
//! client.wait_until_ready().await?;
//! client.send("hello").await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Platform Support
//!
//! - **Linux**: both roles; the peripheral role goes through BlueZ
//! - **Other platforms**: central role only; server methods return `Unsupported`

mod central;
pub mod config;
pub mod error;
mod peripheral;
pub mod transport;

pub use config::BleTransportConfig;
pub use error::BleTransportError;
pub use transport::BleTransport;

// Re-export Transport trait for convenience
pub use bluechat_core::transport::Transport;
