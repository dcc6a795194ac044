//! Wire format: length-prefixed frames.
//!
//! Each frame on the wire is:
//!   [4 bytes big-endian length][payload]

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

use crate::error::ProtocolError;

/// Maximum frame size (1 MiB). Checked before allocating the payload buffer.
pub const MAX_FRAME_SIZE: u32 = 1024 * 1024;

/// Encode a payload as a length-prefixed frame.
pub fn encode_frame(payload: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    let len = checked_len(payload.len())?;
    let mut buf = Vec::with_capacity(4 + payload.len());
    buf.extend_from_slice(&len.to_be_bytes());
    buf.extend_from_slice(payload);
    Ok(buf)
}

fn checked_len(len: usize) -> Result<u32, ProtocolError> {
    match u32::try_from(len) {
        Ok(n) if n <= MAX_FRAME_SIZE => Ok(n),
        _ => Err(ProtocolError::FrameTooLarge {
            len,
            max: MAX_FRAME_SIZE,
        }),
    }
}

/// Write one frame.
pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let frame = encode_frame(payload)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    trace!(len = payload.len(), "sent frame");
    Ok(())
}

/// Read one frame.
///
/// Returns `None` if the stream was closed cleanly before a new frame began.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Vec<u8>>, ProtocolError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len_buf);
    if len > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge {
            len: len as usize,
            max: MAX_FRAME_SIZE,
        });
    }

    let mut payload = vec![0u8; len as usize];
    match reader.read_exact(&mut payload).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(ProtocolError::StreamClosed);
        }
        Err(e) => return Err(e.into()),
    }
    trace!(len, "received frame");
    Ok(Some(payload))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_has_big_endian_length_prefix() {
        let bytes = encode_frame(b"hello").unwrap();
        assert_eq!(&bytes[..4], &[0, 0, 0, 5]);
        assert_eq!(&bytes[4..], b"hello");
    }

    #[tokio::test]
    async fn oversized_length_is_rejected_before_reading_payload() {
        let mut wire: &[u8] = &(MAX_FRAME_SIZE + 1).to_be_bytes();
        let result = read_frame(&mut wire).await;
        assert!(matches!(result, Err(ProtocolError::FrameTooLarge { .. })));
    }

    #[tokio::test]
    async fn clean_close_reads_as_none() {
        let mut wire: &[u8] = &[];
        assert!(read_frame(&mut wire).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn truncated_payload_is_an_error() {
        let mut bytes = encode_frame(b"hello").unwrap();
        bytes.truncate(6);
        let mut wire: &[u8] = &bytes;
        assert!(matches!(
            read_frame(&mut wire).await,
            Err(ProtocolError::StreamClosed)
        ));
    }

    #[tokio::test]
    async fn frames_over_duplex() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        write_frame(&mut a, b"one").await.unwrap();
        write_frame(&mut a, b"").await.unwrap();
        assert_eq!(read_frame(&mut b).await.unwrap().as_deref(), Some(&b"one"[..]));
        assert_eq!(read_frame(&mut b).await.unwrap().as_deref(), Some(&b""[..]));

        drop(a);
        assert!(read_frame(&mut b).await.unwrap().is_none());
    }
}
