//! Length-delimited message framing.
//!
//! Every message on the socket is preceded by its byte length encoded as an
//! unsigned LEB128 varint, the same framing prost uses for
//! `encode_length_delimited`. The async variants serve the daemon; the
//! blocking variants serve the client library, which keeps no runtime.

use prost::Message;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{ProtocolError, Result};

/// Upper bound on a single frame. Anything larger is treated as a corrupt
/// or hostile peer rather than an allocation request.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Reads one length-delimited message from `reader`.
///
/// Returns `Ok(None)` on a clean end of stream (EOF before the first length
/// byte); EOF in the middle of a frame is an error.
///
/// # Errors
///
/// Returns an error on I/O failure, an oversized frame, or a payload that
/// does not decode as `M`.
pub async fn read_message<R, M>(reader: &mut R) -> Result<Option<M>>
where
    R: AsyncRead + Unpin,
    M: Message + Default,
{
    let len = match read_varint(reader).await? {
        Some(len) => len,
        None => return Ok(None),
    };

    if len > MAX_FRAME_LEN as u64 {
        return Err(ProtocolError::Oversized { len });
    }

    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload).await?;

    Ok(Some(M::decode(&payload[..])?))
}

/// Writes one length-delimited message to `writer` and flushes.
///
/// # Errors
///
/// Returns an error on I/O failure.
pub async fn write_message<W, M>(writer: &mut W, msg: &M) -> Result<()>
where
    W: AsyncWrite + Unpin,
    M: Message,
{
    let buf = msg.encode_length_delimited_to_vec();
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

/// Blocking counterpart of [`read_message`].
///
/// # Errors
///
/// Returns an error on I/O failure, an oversized frame, or a payload that
/// does not decode as `M`.
pub fn read_message_blocking<R, M>(reader: &mut R) -> Result<Option<M>>
where
    R: std::io::Read,
    M: Message + Default,
{
    let len = match read_varint_blocking(reader)? {
        Some(len) => len,
        None => return Ok(None),
    };

    if len > MAX_FRAME_LEN as u64 {
        return Err(ProtocolError::Oversized { len });
    }

    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload)?;

    Ok(Some(M::decode(&payload[..])?))
}

/// Blocking counterpart of [`write_message`].
///
/// # Errors
///
/// Returns an error on I/O failure.
pub fn write_message_blocking<W, M>(writer: &mut W, msg: &M) -> Result<()>
where
    W: std::io::Write,
    M: Message,
{
    let buf = msg.encode_length_delimited_to_vec();
    writer.write_all(&buf)?;
    writer.flush()?;
    Ok(())
}

/// Reads an unsigned LEB128 varint; `None` means EOF before the first byte.
async fn read_varint<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<u64>> {
    let mut value: u64 = 0;
    let mut shift = 0u32;

    loop {
        let mut byte = [0u8; 1];
        match reader.read_exact(&mut byte).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof && shift == 0 => {
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        }

        value |= u64::from(byte[0] & 0x7f) << shift;
        if byte[0] & 0x80 == 0 {
            return Ok(Some(value));
        }

        shift += 7;
        if shift >= 64 {
            return Err(ProtocolError::Framing("length varint too long".into()));
        }
    }
}

fn read_varint_blocking<R: std::io::Read>(reader: &mut R) -> Result<Option<u64>> {
    let mut value: u64 = 0;
    let mut shift = 0u32;

    loop {
        let mut byte = [0u8; 1];
        match reader.read_exact(&mut byte) {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof && shift == 0 => {
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        }

        value |= u64::from(byte[0] & 0x7f) << shift;
        if byte[0] & 0x80 == 0 {
            return Ok(Some(value));
        }

        shift += 7;
        if shift >= 64 {
            return Err(ProtocolError::Framing("length varint too long".into()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{ContainerRequest, ContainerStartRequest};
    use std::io::Cursor;

    fn start_request(name: &str) -> ContainerRequest {
        ContainerRequest {
            start: Some(ContainerStartRequest { name: name.into() }),
            ..ContainerRequest::default()
        }
    }

    #[tokio::test]
    async fn roundtrip_single_message() {
        let mut buf = Vec::new();
        write_message(&mut buf, &start_request("a/b")).await.unwrap();

        let mut cursor = Cursor::new(buf);
        let decoded: ContainerRequest = read_message(&mut cursor).await.unwrap().unwrap();
        assert_eq!(decoded.start.unwrap().name, "a/b");
    }

    #[tokio::test]
    async fn roundtrip_back_to_back_messages() {
        let mut buf = Vec::new();
        write_message(&mut buf, &start_request("first")).await.unwrap();
        write_message(&mut buf, &start_request("second")).await.unwrap();

        let mut cursor = Cursor::new(buf);
        let one: ContainerRequest = read_message(&mut cursor).await.unwrap().unwrap();
        let two: ContainerRequest = read_message(&mut cursor).await.unwrap().unwrap();
        assert_eq!(one.start.unwrap().name, "first");
        assert_eq!(two.start.unwrap().name, "second");

        let eof: Option<ContainerRequest> = read_message(&mut cursor).await.unwrap();
        assert!(eof.is_none());
    }

    #[tokio::test]
    async fn clean_eof_is_none() {
        let mut cursor = Cursor::new(Vec::new());
        let msg: Option<ContainerRequest> = read_message(&mut cursor).await.unwrap();
        assert!(msg.is_none());
    }

    #[tokio::test]
    async fn truncated_frame_is_an_error() {
        let mut buf = Vec::new();
        write_message(&mut buf, &start_request("abcdef")).await.unwrap();
        buf.truncate(buf.len() - 3);

        let mut cursor = Cursor::new(buf);
        let result: Result<Option<ContainerRequest>> = read_message(&mut cursor).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn oversized_frame_is_rejected_before_allocation() {
        // 10-byte varint encoding u64::MAX.
        let buf = vec![0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0x01];
        let mut cursor = Cursor::new(buf);
        let result: Result<Option<ContainerRequest>> = read_message(&mut cursor).await;
        assert!(matches!(result, Err(ProtocolError::Oversized { .. })));
    }

    #[test]
    fn blocking_roundtrip_matches_async_layout() {
        let mut buf = Vec::new();
        write_message_blocking(&mut buf, &start_request("x")).unwrap();

        let mut cursor = Cursor::new(buf);
        let decoded: ContainerRequest = read_message_blocking(&mut cursor).unwrap().unwrap();
        assert_eq!(decoded.start.unwrap().name, "x");
    }

    #[test]
    fn blocking_clean_eof_is_none() {
        let mut cursor = Cursor::new(Vec::new());
        let msg: Option<ContainerRequest> = read_message_blocking(&mut cursor).unwrap();
        assert!(msg.is_none());
    }
}
