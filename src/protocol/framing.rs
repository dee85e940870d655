//! Varint length-delimited message framing
//!
//! Every message on the receiver TCP stream is prefixed with its byte length
//! as a base-128 varint: 7 data bits per byte, least significant group first,
//! bit 7 set on every byte except the last. This is the same layout protobuf's
//! `writeDelimitedTo` produces, so the receiver firmware can parse it directly.

use bytes::{Buf, BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, ProtocolError, Result};

/// Longest varint encoding of a u32
pub const MAX_VARINT32_LEN: usize = 5;

const CONTINUATION: u8 = 0b1000_0000;
const DATA_BITS: u8 = 0b0111_1111;

/// Append `value` as a varint. Zero encodes as a single zero byte.
pub fn encode_varint32(value: u32, buf: &mut impl BufMut) {
    let mut carry = value;
    while carry > DATA_BITS as u32 {
        buf.put_u8((carry as u8 & DATA_BITS) | CONTINUATION);
        carry >>= 7;
    }
    buf.put_u8(carry as u8);
}

/// Number of bytes `encode_varint32` writes for `value`
pub fn varint32_len(value: u32) -> usize {
    match value {
        0..=0x7F => 1,
        0x80..=0x3FFF => 2,
        0x4000..=0x1F_FFFF => 3,
        0x20_0000..=0xFFF_FFFF => 4,
        _ => 5,
    }
}

/// Folds varint bytes into a u32, one byte at a time.
#[derive(Debug, Default)]
struct VarintAccumulator {
    value: u64,
    shift: u32,
}

impl VarintAccumulator {
    /// Feed one byte; returns the value once the last byte has been seen.
    fn push(&mut self, byte: u8) -> std::result::Result<Option<u32>, ProtocolError> {
        if self.shift >= 7 * MAX_VARINT32_LEN as u32 {
            return Err(ProtocolError::VarintOverflow);
        }
        self.value |= ((byte & DATA_BITS) as u64) << self.shift;
        self.shift += 7;

        if self.value > u32::MAX as u64 {
            return Err(ProtocolError::VarintOverflow);
        }
        if byte & CONTINUATION == 0 {
            return Ok(Some(self.value as u32));
        }
        if self.shift >= 7 * MAX_VARINT32_LEN as u32 {
            return Err(ProtocolError::VarintOverflow);
        }
        Ok(None)
    }
}

/// Decode a varint from the front of `buf`.
pub fn decode_varint32(buf: &mut impl Buf) -> std::result::Result<u32, ProtocolError> {
    let mut acc = VarintAccumulator::default();
    loop {
        if !buf.has_remaining() {
            return Err(ProtocolError::UnexpectedEof);
        }
        if let Some(value) = acc.push(buf.get_u8())? {
            return Ok(value);
        }
    }
}

fn map_read_error(e: std::io::Error) -> Error {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        ProtocolError::UnexpectedEof.into()
    } else {
        Error::Io(e)
    }
}

/// Read a varint from the stream, one byte at a time.
pub async fn read_varint32<R: AsyncRead + Unpin>(reader: &mut R) -> Result<u32> {
    let mut acc = VarintAccumulator::default();
    loop {
        let byte = reader.read_u8().await.map_err(map_read_error)?;
        if let Some(value) = acc.push(byte)? {
            return Ok(value);
        }
    }
}

/// Read one length-delimited message body.
///
/// Fails with `MessageTooLarge` if the announced length exceeds `max_size`,
/// and with `UnexpectedEof` if the stream ends inside the prefix or body.
pub async fn read_delimited<R: AsyncRead + Unpin>(reader: &mut R, max_size: usize) -> Result<Vec<u8>> {
    let len = read_varint32(reader).await? as usize;
    if len > max_size {
        return Err(ProtocolError::MessageTooLarge(len).into());
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await.map_err(map_read_error)?;
    Ok(body)
}

/// Write one length-delimited message and flush.
pub async fn write_delimited<W: AsyncWrite + Unpin>(writer: &mut W, body: &[u8]) -> Result<()> {
    let len = u32::try_from(body.len()).map_err(|_| ProtocolError::MessageTooLarge(body.len()))?;

    let mut frame = BytesMut::with_capacity(varint32_len(len) + body.len());
    encode_varint32(len, &mut frame);
    frame.put_slice(body);

    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}
