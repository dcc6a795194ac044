//! Identity handshake run on every new connection.
//!
//! Each side sends one frame carrying its identity JSON. The initiator
//! sends first and then waits; the responder waits and then replies. The
//! whole exchange is bounded by a deadline, and any failure leaves the
//! stream unusable; callers close it.

use std::time::Duration;

use peerlink_types::PeerIdentity;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;

use crate::error::ProtocolError;
use crate::wire::{read_frame, write_frame};

/// Perform the initiator side: send our identity, receive theirs.
pub async fn handshake_initiator<S>(
    stream: &mut S,
    local: &PeerIdentity,
    deadline: Duration,
) -> Result<PeerIdentity, ProtocolError>
where
    S: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    let exchange = async {
        send_identity(stream, local).await?;
        let remote = recv_identity(stream).await?;
        debug!(peer = %remote.peer_id, "handshake complete (initiator)");
        Ok(remote)
    };
    tokio::time::timeout(deadline, exchange)
        .await
        .map_err(|_| ProtocolError::Timeout(deadline))?
}

/// Perform the responder side: receive their identity, send ours.
pub async fn handshake_responder<S>(
    stream: &mut S,
    local: &PeerIdentity,
    deadline: Duration,
) -> Result<PeerIdentity, ProtocolError>
where
    S: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    let exchange = async {
        let remote = recv_identity(stream).await?;
        send_identity(stream, local).await?;
        debug!(peer = %remote.peer_id, "handshake complete (responder)");
        Ok(remote)
    };
    tokio::time::timeout(deadline, exchange)
        .await
        .map_err(|_| ProtocolError::Timeout(deadline))?
}

async fn send_identity<S>(stream: &mut S, identity: &PeerIdentity) -> Result<(), ProtocolError>
where
    S: AsyncWrite + Unpin + ?Sized,
{
    let payload = identity.encode()?;
    write_frame(stream, payload.as_bytes()).await
}

async fn recv_identity<S>(stream: &mut S) -> Result<PeerIdentity, ProtocolError>
where
    S: AsyncRead + Unpin + ?Sized,
{
    let payload = read_frame(stream).await?.ok_or_else(|| {
        ProtocolError::Handshake("stream closed before identity was received".to_string())
    })?;
    let text = std::str::from_utf8(&payload)
        .map_err(|e| ProtocolError::Handshake(format!("identity is not UTF-8: {e}")))?;
    Ok(PeerIdentity::decode(text)?)
}
