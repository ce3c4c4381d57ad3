//! Codec for encoding/decoding handshake headers

use bytes::{Buf, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Codec errors
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Encode error: {0}")]
    Encode(String),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Header too large: {0} bytes")]
    HeaderTooLarge(usize),

    #[error("Truncated header: expected {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },

    #[error("Connection closed")]
    Closed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<ciborium::ser::Error<std::io::Error>> for CodecError {
    fn from(e: ciborium::ser::Error<std::io::Error>) -> Self {
        CodecError::Encode(e.to_string())
    }
}

impl From<ciborium::de::Error<std::io::Error>> for CodecError {
    fn from(e: ciborium::de::Error<std::io::Error>) -> Self {
        CodecError::Decode(e.to_string())
    }
}

/// Handshake header codec
///
/// Format: `[length: u32 big-endian][payload: CBOR]`. CBOR keeps the payload
/// self-describing (unknown fields are skipped, `values` keeps its types) and
/// the length prefix lets a reader stop exactly at the end of the header.
pub struct HeaderCodec;

impl HeaderCodec {
    const LENGTH_SIZE: usize = 4;

    /// Encode a header to bytes
    pub fn encode<T: Serialize>(header: &T) -> Result<Bytes, CodecError> {
        let mut payload = Vec::new();
        ciborium::into_writer(header, &mut payload)?;

        if payload.len() > crate::MAX_HEADER_SIZE as usize {
            return Err(CodecError::HeaderTooLarge(payload.len()));
        }

        let mut buf = BytesMut::with_capacity(Self::LENGTH_SIZE + payload.len());
        buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        buf.extend_from_slice(&payload);

        Ok(buf.freeze())
    }

    /// Decode a header from bytes
    ///
    /// Returns Ok(Some(header)) and consumes exactly one frame if a complete
    /// header was buffered, Ok(None) if more data is needed,
    /// Err on error
    pub fn decode<T: DeserializeOwned>(buf: &mut BytesMut) -> Result<Option<T>, CodecError> {
        if buf.len() < Self::LENGTH_SIZE {
            return Ok(None);
        }

        let mut length_bytes = [0u8; 4];
        length_bytes.copy_from_slice(&buf[..Self::LENGTH_SIZE]);
        let length = u32::from_be_bytes(length_bytes) as usize;

        if length > crate::MAX_HEADER_SIZE as usize {
            return Err(CodecError::HeaderTooLarge(length));
        }

        if buf.len() < Self::LENGTH_SIZE + length {
            return Ok(None);
        }

        // Deserialize before consuming so a bad frame leaves the buffer intact
        let header: T =
            ciborium::from_reader(&buf[Self::LENGTH_SIZE..Self::LENGTH_SIZE + length])?;
        buf.advance(Self::LENGTH_SIZE + length);

        Ok(Some(header))
    }

    /// Write one header to an async writer and flush it
    pub async fn write<W, T>(writer: &mut W, header: &T) -> Result<(), CodecError>
    where
        W: AsyncWrite + Unpin + ?Sized,
        T: Serialize,
    {
        let frame = Self::encode(header)?;
        writer.write_all(&frame).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Read exactly one header from an async reader
    ///
    /// Bytes following the header are left unread.
    pub async fn read<R, T>(reader: &mut R) -> Result<T, CodecError>
    where
        R: AsyncRead + Unpin + ?Sized,
        T: DeserializeOwned,
    {
        let mut length_bytes = [0u8; 4];
        let filled = read_full(reader, &mut length_bytes).await?;
        if filled == 0 {
            return Err(CodecError::Closed);
        }
        if filled < length_bytes.len() {
            return Err(CodecError::Truncated {
                expected: length_bytes.len(),
                actual: filled,
            });
        }

        let length = u32::from_be_bytes(length_bytes) as usize;
        if length > crate::MAX_HEADER_SIZE as usize {
            return Err(CodecError::HeaderTooLarge(length));
        }

        let mut payload = vec![0u8; length];
        let filled = read_full(reader, &mut payload).await?;
        if filled < length {
            return Err(CodecError::Truncated {
                expected: length,
                actual: filled,
            });
        }

        Ok(ciborium::from_reader(payload.as_slice())?)
    }
}

/// Read until `buf` is full or EOF; returns the number of bytes read
async fn read_full<R>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}
