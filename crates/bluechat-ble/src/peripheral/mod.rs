//! Peripheral role: hosting the chat service and advertising it
//!
//! Only BlueZ exposes a GATT server API we can drive, so Linux gets a full
//! implementation and every other platform reports the role as unsupported.

#[cfg(not(target_os = "linux"))]
mod fallback;
#[cfg(target_os = "linux")]
mod linux;

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        pub use linux::BlePeripheral;
    } else {
        pub use fallback::BlePeripheral;
    }
}

use bluechat_core::TxPower;

/// Advertised transmit power in dBm for each requested level
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
pub(crate) fn tx_power_dbm(level: TxPower) -> i16 {
    match level {
        TxPower::UltraLow => -21,
        TxPower::Low => -15,
        TxPower::Medium => -7,
        TxPower::High => 1,
    }
}
