//! Node and connection errors.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("invalid peer: {0}")]
    InvalidPeer(String),

    #[error("a connection attempt to {0} is already in progress")]
    AlreadyConnecting(String),

    #[error("the previous listener is still stopping")]
    ListenerStopping,

    #[error("Bluetooth is disabled")]
    RadioDisabled,

    #[error("shutting down")]
    ShuttingDown,

    #[error("radio error: {0}")]
    Radio(#[from] peerlink_radio::RadioError),

    #[error("protocol error: {0}")]
    Protocol(#[from] peerlink_protocol::ProtocolError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("discovery error: {0}")]
    Discovery(#[from] peerlink_discovery::DiscoveryError),

    #[error("connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("listener error: {0}")]
    Listener(#[from] peerlink_types::ListenerError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
