//! Framing for the supervisor/worker channel.
//!
//! The channel is a `UnixStream` pair shared across the process boundary. It
//! carries three messages:
//!
//! * worker -> supervisor: [`READY`], once, after the worker is serving
//! * worker -> supervisor: [`SCRAPE_REQUEST`], no payload
//! * supervisor -> worker: a 4-byte big-endian length followed by a JSON-encoded
//!   [`Snapshot`]
//!
//! Only one request/response cycle may be in flight at a time. The supervisor
//! half-closes its end to tell the worker to exit.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::ExporterError;
use crate::Snapshot;

pub const READY: &[u8] = b"ready";
pub const SCRAPE_REQUEST: &[u8] = b"scrape-plz";

pub fn encode_snapshot(snapshot: &Snapshot) -> Result<Vec<u8>, ExporterError> {
    Ok(serde_json::to_vec(snapshot)?)
}

pub fn decode_snapshot(payload: &[u8]) -> Result<Snapshot, ExporterError> {
    Ok(serde_json::from_slice(payload)?)
}

pub async fn send_token<W>(writer: &mut W, token: &[u8]) -> Result<(), ExporterError>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(token).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads one `token` from the stream.
///
/// Returns `Ok(false)` if the peer closed the stream cleanly before sending
/// anything. Any other byte sequence is a protocol violation.
pub async fn expect_token<R>(reader: &mut R, token: &[u8]) -> Result<bool, ExporterError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; token.len()];
    if reader.read(&mut buf[..1]).await? == 0 {
        return Ok(false);
    }
    if buf[0] != token[0] {
        return Err(unexpected(&buf[..1]));
    }
    read_exactly(reader, &mut buf[1..]).await?;
    if buf != token {
        return Err(unexpected(&buf));
    }
    Ok(true)
}

/// Writes a length-prefixed snapshot and returns the payload size.
pub async fn write_snapshot<W>(writer: &mut W, snapshot: &Snapshot) -> Result<usize, ExporterError>
where
    W: AsyncWrite + Unpin,
{
    let payload = encode_snapshot(snapshot)?;
    let len = u32::try_from(payload.len())
        .map_err(|_| ExporterError::PayloadTooLarge { len: payload.len() })?;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(&payload).await?;
    writer.flush().await?;
    Ok(payload.len())
}

/// Reads exactly one length-prefixed snapshot. Closing early is an error.
pub async fn read_snapshot<R>(reader: &mut R) -> Result<Snapshot, ExporterError>
where
    R: AsyncRead + Unpin,
{
    let mut len = [0u8; 4];
    read_exactly(reader, &mut len).await?;
    let mut payload = vec![0u8; u32::from_be_bytes(len) as usize];
    read_exactly(reader, &mut payload).await?;
    decode_snapshot(&payload)
}

async fn read_exactly<R>(reader: &mut R, buf: &mut [u8]) -> Result<(), ExporterError>
where
    R: AsyncRead + Unpin,
{
    let mut received = 0;
    while received < buf.len() {
        let n = reader.read(&mut buf[received..]).await?;
        if n == 0 {
            return Err(ExporterError::PrematureClose {
                expected: buf.len(),
                received,
            });
        }
        received += n;
    }
    Ok(())
}

fn unexpected(data: &[u8]) -> ExporterError {
    ExporterError::Protocol {
        details: format!("unexpected message {:?}", String::from_utf8_lossy(data)),
    }
}
