//! Protocol errors.

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("handshake timed out after {0:?}")]
    Timeout(Duration),

    #[error("invalid identity: {0}")]
    Identity(#[from] peerlink_types::IdentityError),

    #[error("frame size {len} exceeds maximum {max}")]
    FrameTooLarge { len: usize, max: u32 },

    #[error("stream closed unexpectedly")]
    StreamClosed,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
