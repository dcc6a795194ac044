//! Radio subsystem errors.

use peerlink_types::BluetoothAddress;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RadioError {
    #[error("radio is disabled")]
    Disabled,

    #[error("failed to start advertising: {0}")]
    Advertise(String),

    #[error("failed to start scanning: {0}")]
    Scan(String),

    #[error("GATT operation failed: {0}")]
    Gatt(String),

    #[error("device discovery failed: {0}")]
    DeviceDiscovery(String),

    #[error("Wi-Fi Direct operation failed: {0}")]
    WifiDirect(String),

    #[error("failed to create listening socket: {0}")]
    Listen(String),

    #[error("connection to {0} refused")]
    ConnectionRefused(BluetoothAddress),

    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),

    #[error("backend not available on this platform")]
    Unavailable,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
