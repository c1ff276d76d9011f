//! Length-prefix framing shared by the framed transports
//!
//! Both framed protocols delimit discrete messages on the byte stream
//! with a 4-byte big-endian length prefix: the handshake request and
//! response in both, and every ciphertext block in the encrypted one.
//!
//! Read lengths are capped: conforming peers never produce frames above
//! the chunk bound, and honoring an arbitrary length prefix would let a
//! hostile server drive an arbitrary allocation.

use std::io;

use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::OutboundError;

/// Cap for payload frames: one 32 KiB chunk plus nonce and auth tag
pub const MAX_FRAME_LEN: usize = 64 * 1024;

/// Cap for handshake frames
pub const MAX_HANDSHAKE_FRAME_LEN: usize = 4096;

/// Write `payload` as one length-prefixed frame, in a single write
pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> io::Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut frame = BytesMut::with_capacity(4 + payload.len());
    frame.put_u32(u32::try_from(payload.len()).map_err(|_| {
        io::Error::new(io::ErrorKind::InvalidInput, "frame payload too large")
    })?);
    frame.put_slice(payload);
    writer.write_all(&frame).await
}

/// Read one length-prefixed frame, rejecting lengths above `max_len`
pub async fn read_frame<R>(reader: &mut R, max_len: usize) -> io::Result<Vec<u8>>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > max_len {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame length {len} exceeds limit {max_len}"),
        ));
    }
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(payload)
}

/// Read the handshake response frame and require the literal `"ok"`
///
/// Any other body is surfaced as [`OutboundError::Rejected`] with that
/// body as the error message, exactly as the server sent it.
///
/// # Errors
///
/// I/O errors from the read, or `Rejected` for a non-"ok" body.
pub async fn expect_ok<R>(reader: &mut R) -> Result<(), OutboundError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let body = read_frame(reader, MAX_HANDSHAKE_FRAME_LEN).await?;
    if body == b"ok" {
        Ok(())
    } else {
        Err(OutboundError::rejected(
            String::from_utf8_lossy(&body).into_owned(),
        ))
    }
}
