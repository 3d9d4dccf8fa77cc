//! Length-prefixed framing.
//!
//! Every package travels as a fixed 32-byte header followed by the encoded
//! payload. The header holds the payload length as a little-endian integer
//! in its low-order bytes; the remaining bytes are zero.
//!
//! ```text
//! +----------------------+------------------------+
//! | header (32 bytes)    | payload (len bytes)    |
//! | len: u64 LE | zeros  | codec(WirePackage)     |
//! +----------------------+------------------------+
//! ```

use crate::config::TransportConfig;
use crate::error::{TransportError, TransportResult};
use bytes::{BufMut, Bytes, BytesMut};
use std::time::Duration;
use tether_sync_protocol::WirePackage;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Size of the frame header in bytes.
pub const HEADER_SIZE: usize = 32;

/// Builds a frame around an already encoded payload.
pub fn frame_payload(payload: &[u8]) -> Bytes {
    let mut frame = BytesMut::with_capacity(HEADER_SIZE + payload.len());
    frame.put_u64_le(payload.len() as u64);
    frame.put_bytes(0, HEADER_SIZE - 8);
    frame.put_slice(payload);
    frame.freeze()
}

/// Encodes a package into a complete frame.
pub fn encode_frame(package: &WirePackage) -> TransportResult<Bytes> {
    let payload = package.to_bytes()?;
    Ok(frame_payload(&payload))
}

/// Reads the payload length out of a header.
pub fn parse_header(header: &[u8; HEADER_SIZE], max_frame_size: usize) -> TransportResult<usize> {
    let mut len_bytes = [0u8; 8];
    len_bytes.copy_from_slice(&header[..8]);
    let len = u64::from_le_bytes(len_bytes);
    if len > max_frame_size as u64 {
        return Err(TransportError::framing(format!(
            "frame announces {len} bytes, limit is {max_frame_size}"
        )));
    }
    Ok(len as usize)
}

/// Writes a frame in chunks of at most `chunk_size` bytes.
pub async fn write_frame<W>(writer: &mut W, frame: &[u8], chunk_size: usize) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    for chunk in frame.chunks(chunk_size.max(1)) {
        writer.write_all(chunk).await?;
    }
    writer.flush().await
}

/// Reads one frame and decodes its package.
///
/// Waiting for the first byte of a frame is unbounded: an idle connection is
/// not an error. Once a frame has started, every read must make progress
/// within `stall_timeout` or the frame is abandoned with a framing error.
pub async fn read_frame<R>(reader: &mut R, config: &TransportConfig) -> TransportResult<WirePackage>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut header = [0u8; HEADER_SIZE];
    if reader.read(&mut header[..1]).await? == 0 {
        return Err(TransportError::ConnectionLost);
    }
    read_exact_or_stall(reader, &mut header[1..], config.stall_timeout).await?;

    let len = parse_header(&header, config.max_frame_size)?;
    let mut payload = vec![0u8; len];
    read_exact_or_stall(reader, &mut payload, config.stall_timeout).await?;

    Ok(WirePackage::from_bytes(&payload)?)
}

async fn read_exact_or_stall<R>(reader: &mut R, buf: &mut [u8], stall_timeout: Duration) -> TransportResult<()>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut filled = 0;
    while filled < buf.len() {
        match tokio::time::timeout(stall_timeout, reader.read(&mut buf[filled..])).await {
            Err(_) => {
                return Err(TransportError::framing(format!(
                    "read stalled after {filled} of {} bytes",
                    buf.len()
                )))
            }
            Ok(Ok(0)) => return Err(TransportError::ConnectionLost),
            Ok(Ok(n)) => filled += n,
            Ok(Err(e)) => return Err(e.into()),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tether_model::Entity;
    use tether_sync_protocol::{FetchSpec, PackageMethod};

    fn config() -> TransportConfig {
        TransportConfig::default().with_stall_timeout(Duration::from_millis(200))
    }

    #[test]
    fn header_layout() {
        let frame = frame_payload(&[0xAB; 300]);
        assert_eq!(frame.len(), HEADER_SIZE + 300);
        assert_eq!(&frame[..2], &[0x2C, 0x01]);
        assert!(frame[2..HEADER_SIZE].iter().all(|b| *b == 0));
        assert_eq!(frame[HEADER_SIZE], 0xAB);
    }

    #[test]
    fn oversized_header_rejected() {
        let mut header = [0u8; HEADER_SIZE];
        header[..8].copy_from_slice(&1_000u64.to_le_bytes());
        assert!(matches!(
            parse_header(&header, 999),
            Err(TransportError::Framing { .. })
        ));
        assert_eq!(parse_header(&header, 1_000).unwrap(), 1_000);
    }

    #[tokio::test]
    async fn roundtrip_over_pipe() {
        let package = WirePackage::command(
            PackageMethod::Insert,
            Entity::new("Person").with("name", "Ada"),
        );
        let frame = encode_frame(&package).unwrap();

        let (mut client, mut server) = tokio::io::duplex(64);
        let writer = tokio::spawn(async move {
            write_frame(&mut client, &frame, 7).await.unwrap();
            client
        });
        let read = read_frame(&mut server, &config()).await.unwrap();
        writer.await.unwrap();
        assert_eq!(read, package);
    }

    #[tokio::test]
    async fn back_to_back_frames() {
        let first = WirePackage::fetch(FetchSpec::new("Person"));
        let second = WirePackage::fetch(FetchSpec::new("Address"));
        let mut bytes = encode_frame(&first).unwrap().to_vec();
        bytes.extend_from_slice(&encode_frame(&second).unwrap());

        let mut reader = bytes.as_slice();
        assert_eq!(read_frame(&mut reader, &config()).await.unwrap(), first);
        assert_eq!(read_frame(&mut reader, &config()).await.unwrap(), second);
        assert!(matches!(
            read_frame(&mut reader, &config()).await,
            Err(TransportError::ConnectionLost)
        ));
    }

    #[tokio::test]
    async fn stalled_payload_is_framing_error() {
        let frame = encode_frame(&WirePackage::fetch(FetchSpec::new("Person"))).unwrap();
        let (mut client, mut server) = tokio::io::duplex(1024);
        // Send the header and half the payload, then go quiet.
        let cut = HEADER_SIZE + (frame.len() - HEADER_SIZE) / 2;
        client.write_all(&frame[..cut]).await.unwrap();

        let err = read_frame(&mut server, &config()).await.unwrap_err();
        assert!(matches!(err, TransportError::Framing { .. }), "{err}");
        drop(client);
    }

    #[tokio::test]
    async fn truncated_frame_is_connection_lost() {
        let frame = encode_frame(&WirePackage::fetch(FetchSpec::new("Person"))).unwrap();
        let mut reader = &frame[..frame.len() - 1];
        assert!(matches!(
            read_frame(&mut reader, &config()).await,
            Err(TransportError::ConnectionLost)
        ));
    }

    #[tokio::test]
    async fn undecodable_payload_is_serialization_error() {
        let frame = frame_payload(&[0xFF, 0xFF, 0xFF]);
        let mut reader = &frame[..];
        assert!(matches!(
            read_frame(&mut reader, &config()).await,
            Err(TransportError::Serialization(_))
        ));
    }
}
