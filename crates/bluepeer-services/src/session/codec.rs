//! Frame I/O over a transport connection.

use bluepeer_core::wire::{Frame, FrameHeader, HEADER_LEN};
use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::SessionError;
use crate::transport::TransportError;

/// Read one frame. Returns `None` on a clean end of stream between frames.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Frame>, SessionError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut header_buf = [0u8; HEADER_LEN];
    let mut filled = 0;
    while filled < HEADER_LEN {
        let n = reader
            .read(&mut header_buf[filled..])
            .await
            .map_err(TransportError::Io)?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(TransportError::Closed.into());
        }
        filled += n;
    }

    let header = FrameHeader::parse(&header_buf)?;
    let mut payload = BytesMut::zeroed(header.payload_len());
    reader.read_exact(&mut payload).await.map_err(|e| match e.kind() {
        std::io::ErrorKind::UnexpectedEof => TransportError::Closed,
        _ => TransportError::Io(e),
    })?;
    let frame = Frame::from_parts(&header, payload.freeze())?;
    tracing::trace!(opcode = ?frame.opcode, status = frame.status, len = frame.body.len(), "frame in");
    Ok(Some(frame))
}

pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> Result<(), SessionError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let bytes = frame.encode()?;
    writer.write_all(&bytes).await.map_err(TransportError::Io)?;
    writer.flush().await.map_err(TransportError::Io)?;
    tracing::trace!(opcode = ?frame.opcode, status = frame.status, len = frame.body.len(), "frame out");
    Ok(())
}
