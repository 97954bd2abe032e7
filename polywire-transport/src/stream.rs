//! Envelope framing over byte streams.
//!
//! Stream transports deliver whole envelopes to the daemon. The length prefix
//! is read first and checked against the ciphertext cap before any body byte
//! is buffered. An oversized envelope is skipped through a fixed-size copy
//! buffer, so the stream stays aligned on the next prefix and a hostile length
//! never makes the reader allocate more than one envelope's worth.

use polywire_core::envelope::{HEADER_SIZE, LENGTH_PREFIX_SIZE};
use polywire_core::{Envelope, ProtocolError};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

use crate::error::TransportError;

/// Read one complete envelope (prefix, type byte, ciphertext).
///
/// Returns `Ok(None)` on a clean end of stream before the first prefix byte.
/// A stream ending mid-envelope yields [`ProtocolError::MalformedEnvelope`].
/// An oversized declaration yields [`ProtocolError::PayloadTooLarge`] once
/// its type byte and body have been discarded, so the next call starts on a
/// fresh prefix.
pub async fn read_envelope<R>(reader: &mut R) -> Result<Option<Vec<u8>>, TransportError>
where
    R: AsyncRead + Unpin,
{
    let mut prefix = [0u8; LENGTH_PREFIX_SIZE];
    let mut filled = 0;
    while filled < LENGTH_PREFIX_SIZE {
        let n = reader.read(&mut prefix[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            warn!(read = filled, "stream ended inside length prefix");
            return Err(ProtocolError::MalformedEnvelope.into());
        }
        filled += n;
    }

    let length = match Envelope::read_length(&prefix) {
        Ok(length) => length,
        Err(e) => {
            let declared = u32::from_be_bytes(prefix) as u64;
            warn!(error = %e, "skipping oversized envelope");
            skip(reader, declared + 1).await?;
            return Err(e.into());
        }
    };

    let mut raw = vec![0u8; HEADER_SIZE + length];
    raw[..LENGTH_PREFIX_SIZE].copy_from_slice(&prefix);
    match reader.read_exact(&mut raw[LENGTH_PREFIX_SIZE..]).await {
        Ok(_) => Ok(Some(raw)),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            warn!(declared = length, "stream ended inside envelope body");
            Err(ProtocolError::MalformedEnvelope.into())
        }
        Err(e) => Err(e.into()),
    }
}

async fn skip<R>(reader: &mut R, count: u64) -> Result<(), TransportError>
where
    R: AsyncRead + Unpin,
{
    let skipped = tokio::io::copy(&mut (&mut *reader).take(count), &mut tokio::io::sink()).await?;
    if skipped < count {
        warn!(skipped, expected = count, "stream ended inside oversized envelope");
        return Err(ProtocolError::MalformedEnvelope.into());
    }
    debug!(skipped, "oversized envelope discarded");
    Ok(())
}

/// Write already-framed envelope bytes and flush.
pub async fn write_envelope<W>(writer: &mut W, raw: &[u8]) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(raw).await?;
    writer.flush().await?;
    Ok(())
}
