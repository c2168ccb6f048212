//! Error handling for the BlueChat CLI

use thiserror::Error;

/// CLI-specific error types
#[derive(Error, Debug)]
pub enum CliError {
    #[error("BlueChat core error: {0}")]
    Core(#[from] bluechat_core::BluechatError),

    #[error("BLE transport error: {0}")]
    Ble(#[from] bluechat_ble::BleTransportError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid peer address: {0}")]
    InvalidPeer(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    TomlParsing(#[from] toml::de::Error),

    #[error("TOML serialization error: {0}")]
    TomlSerialization(#[from] toml::ser::Error),
}

/// Result type for CLI operations
pub type Result<T> = std::result::Result<T, CliError>;

impl From<bluechat_core::ConfigError> for CliError {
    fn from(err: bluechat_core::ConfigError) -> Self {
        CliError::Config(err.to_string())
    }
}
