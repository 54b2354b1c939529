//! Packet-level framing for TDS messages.

use crate::error::{HarnessError, Result};
use crate::parser::tds::{status, TdsHeader, TdsParseError, TDS_HEADER_SIZE};
use bytes::{BufMut, Bytes, BytesMut};
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::{timeout, Duration};

/// Upper bound on a reassembled message; nothing in a handshake comes close.
pub const MAX_MESSAGE_SIZE: usize = 1 << 20;

/// One complete message (all packets up to EOM).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TdsMessage {
    pub packet_type: u8,
    pub payload: Bytes,
}

/// Reads packets until EOM. Returns `None` if the peer closed before a header arrived.
pub async fn read_message<R>(reader: &mut R) -> Result<Option<TdsMessage>>
where
    R: AsyncRead + Unpin,
{
    let mut payload = BytesMut::new();
    let mut packet_type: Option<u8> = None;

    loop {
        let mut raw = [0u8; TDS_HEADER_SIZE];
        match reader.read_exact(&mut raw).await {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof && packet_type.is_none() => {
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        }

        let header = TdsHeader::parse(&raw).ok_or(TdsParseError::TooShort)?;
        if (header.length as usize) < TDS_HEADER_SIZE {
            return Err(TdsParseError::InvalidLength.into());
        }
        match packet_type {
            None => packet_type = Some(header.packet_type),
            Some(first) if first != header.packet_type => {
                return Err(TdsParseError::MixedPacketTypes(first, header.packet_type).into());
            }
            Some(_) => {}
        }

        let len = header.payload_length();
        if payload.len() + len > MAX_MESSAGE_SIZE {
            return Err(TdsParseError::MessageTooLarge(MAX_MESSAGE_SIZE).into());
        }
        let start = payload.len();
        payload.resize(start + len, 0);
        reader.read_exact(&mut payload[start..]).await?;

        if header.is_end_of_message() {
            return Ok(Some(TdsMessage {
                packet_type: header.packet_type,
                payload: payload.freeze(),
            }));
        }
    }
}

/// Splits `payload` into packets of at most `packet_size` bytes and writes them.
pub async fn write_message<W>(
    writer: &mut W,
    packet_type: u8,
    payload: &[u8],
    packet_size: usize,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let chunk_size = packet_size.clamp(TDS_HEADER_SIZE + 1, u16::MAX as usize) - TDS_HEADER_SIZE;
    let chunks: Vec<&[u8]> = if payload.is_empty() {
        vec![payload]
    } else {
        payload.chunks(chunk_size).collect()
    };

    let mut buf = BytesMut::with_capacity(chunk_size + TDS_HEADER_SIZE);
    let last = chunks.len() - 1;
    for (i, chunk) in chunks.into_iter().enumerate() {
        let mut header = TdsHeader::new(
            packet_type,
            if i == last { status::EOM } else { status::NORMAL },
            (chunk.len() + TDS_HEADER_SIZE) as u16,
        );
        header.packet_id = (i as u8).wrapping_add(1);
        buf.clear();
        buf.put_slice(&header.serialize());
        buf.put_slice(chunk);
        writer.write_all(&buf).await?;
    }
    writer.flush().await?;
    Ok(())
}

/// Reads one message of the given type, failing on timeout, EOF or a different type.
pub async fn expect_message<R>(
    reader: &mut R,
    packet_type: u8,
    limit: Duration,
    what: &str,
) -> Result<TdsMessage>
where
    R: AsyncRead + Unpin,
{
    let message = match timeout(limit, read_message(reader)).await {
        Ok(res) => res?,
        Err(_) => return Err(HarnessError::Timeout(format!("waiting for {}", what))),
    };
    match message {
        Some(msg) if msg.packet_type == packet_type => Ok(msg),
        Some(msg) => Err(HarnessError::Io(io::Error::new(
            io::ErrorKind::InvalidData,
            format!(
                "expected {} (packet type 0x{:02X}), got 0x{:02X}",
                what, packet_type, msg.packet_type
            ),
        ))),
        None => Err(HarnessError::Io(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("connection closed while waiting for {}", what),
        ))),
    }
}
