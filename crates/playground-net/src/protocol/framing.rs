//! Length-prefixed framing over libp2p streams.
//!
//! Each frame is a 4-byte big-endian length followed by that many payload
//! bytes. The length is validated before any allocation; frames above
//! [`MAX_FRAME_SIZE`] are rejected. Empty frames are legal.
//!
//! libp2p streams implement the `futures` I/O traits, so the helpers here
//! are generic over `futures::io::{AsyncRead, AsyncWrite}`.

use futures::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use playground_core::{Error, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Maximum accepted frame payload (16 MiB).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Length of the frame header.
const HEADER_LEN: usize = 4;

/// Write one frame.
///
/// # Errors
///
/// Rejects payloads above [`MAX_FRAME_SIZE`] with [`Error::InvalidInput`];
/// everything else is the underlying stream failure.
pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    if payload.len() > MAX_FRAME_SIZE {
        return Err(Error::InvalidInput(format!(
            "frame of {} bytes exceeds maximum {MAX_FRAME_SIZE}",
            payload.len()
        )));
    }
    let len = u32::try_from(payload.len())
        .map_err(|_| Error::InvalidInput("frame too large for u32 prefix".into()))?;
    writer.write_all(&len.to_be_bytes()).await.map_err(map_io)?;
    writer.write_all(payload).await.map_err(map_io)?;
    writer.flush().await.map_err(map_io)?;
    Ok(())
}

/// Read one frame.
///
/// # Errors
///
/// A declared length above [`MAX_FRAME_SIZE`] fails with
/// [`Error::InvalidInput`] before any allocation; a short read maps to
/// [`Error::StreamClosed`].
pub async fn read_frame<R>(reader: &mut R) -> Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_LEN];
    reader.read_exact(&mut header).await.map_err(map_io)?;

    let len = u32::from_be_bytes(header) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(Error::InvalidInput(format!(
            "frame of {len} bytes exceeds maximum {MAX_FRAME_SIZE}"
        )));
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await.map_err(map_io)?;
    Ok(payload)
}

/// Serialize a message to JSON and write it as one frame.
///
/// # Errors
///
/// Propagates serialization and stream failures.
pub async fn write_message<W, T>(writer: &mut W, message: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let payload = serde_json::to_vec(message)?;
    write_frame(writer, &payload).await
}

/// Read one frame and deserialize it from JSON.
///
/// # Errors
///
/// Propagates framing and deserialization failures.
pub async fn read_message<R, T>(reader: &mut R) -> Result<T>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let payload = read_frame(reader).await?;
    Ok(serde_json::from_slice(&payload)?)
}

fn map_io(e: std::io::Error) -> Error {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        Error::StreamClosed
    } else {
        Error::Io(e)
    }
}
