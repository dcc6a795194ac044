//! Discovery subsystem errors.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("discovery already running in the requested mode")]
    AlreadyRunning,

    #[error("no transport could be started: {0}")]
    StartFailed(String),

    #[error("invalid request id {0:?}")]
    InvalidRequestId(String),

    #[error("malformed advertisement: {0}")]
    Advertisement(String),

    #[error("identity error: {0}")]
    Identity(#[from] peerlink_types::IdentityError),

    #[error("listener error: {0}")]
    Listener(#[from] peerlink_types::ListenerError),

    #[error("radio error: {0}")]
    Radio(#[from] peerlink_radio::RadioError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
