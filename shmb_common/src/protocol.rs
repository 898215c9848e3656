//! Control-connection wire protocol.
//!
//! Every control connection carries one request and, on success, one reply:
//!
//! ```text
//! client -> broker   [cmd: u8]
//!   SHM_CREATE       [num_buffers: u64][buf_size: u64]
//!   SHM_ATTACH       [len: u64][name: len bytes UTF-8]
//! broker -> client   [COMPLETE: u8][len: u64][name: len bytes UTF-8]
//! ```
//!
//! Integers are little-endian. After the reply the connection stays open
//! and its liveness is the lease's liveness.

use crate::consts::MAX_STRING_LEN;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Single-byte command on the control connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Command {
    /// Broker reply: request succeeded, resolved name follows.
    Complete = 0x00,
    /// Create a new segment.
    ShmCreate = 0x01,
    /// Attach to an existing segment by name.
    ShmAttach = 0x02,
    /// Ask the broker process to shut down.
    Shutdown = 0x03,
}

impl Command {
    /// Convert from raw `u8` value. Returns `None` for invalid values.
    #[inline]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x00 => Some(Self::Complete),
            0x01 => Some(Self::ShmCreate),
            0x02 => Some(Self::ShmAttach),
            0x03 => Some(Self::Shutdown),
            _ => None,
        }
    }

    /// Wire representation.
    #[inline]
    pub const fn as_byte(self) -> u8 {
        self as u8
    }
}

/// Errors raised while decoding the control protocol.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The stream ended before a complete value arrived.
    #[error("connection closed by peer")]
    ConnectionClosed,

    /// A string payload was not valid UTF-8.
    #[error("string payload is not valid UTF-8")]
    InvalidUtf8,

    /// A string length prefix exceeded [`MAX_STRING_LEN`].
    #[error("string length {len} exceeds limit of {max} bytes")]
    StringTooLong {
        /// Announced length.
        len: u64,
        /// Accepted maximum.
        max: u64,
    },

    /// A fixed-width field was decoded from too few bytes.
    #[error("expected {expected} bytes, got {actual}")]
    ShortBuffer {
        /// Required byte count.
        expected: usize,
        /// Available byte count.
        actual: usize,
    },

    /// Transport error other than end-of-stream.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Encode a `u64` as 8 little-endian bytes.
#[inline]
pub fn encode_u64(value: u64) -> [u8; 8] {
    value.to_le_bytes()
}

/// Decode a `u64` from the first 8 bytes of `bytes`.
pub fn decode_u64(bytes: &[u8]) -> Result<u64, ProtocolError> {
    let raw: [u8; 8] = bytes
        .get(..8)
        .and_then(|b| b.try_into().ok())
        .ok_or(ProtocolError::ShortBuffer {
            expected: 8,
            actual: bytes.len(),
        })?;
    Ok(u64::from_le_bytes(raw))
}

/// Encode a string as an 8-byte length followed by its UTF-8 bytes.
pub fn encode_string(value: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(8 + value.len());
    out.extend_from_slice(&encode_u64(value.len() as u64));
    out.extend_from_slice(value.as_bytes());
    out
}

/// Full `SHM_CREATE` request frame.
pub fn create_request(num_buffers: u64, buf_size: u64) -> [u8; 17] {
    let mut out = [0u8; 17];
    out[0] = Command::ShmCreate.as_byte();
    out[1..9].copy_from_slice(&encode_u64(num_buffers));
    out[9..17].copy_from_slice(&encode_u64(buf_size));
    out
}

/// Full `SHM_ATTACH` request frame.
pub fn attach_request(name: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(9 + name.len());
    out.push(Command::ShmAttach.as_byte());
    out.extend_from_slice(&encode_string(name));
    out
}

/// Full `COMPLETE` reply frame carrying the resolved segment name.
pub fn complete_reply(name: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(9 + name.len());
    out.push(Command::Complete.as_byte());
    out.extend_from_slice(&encode_string(name));
    out
}

async fn read_exact_or_closed<R>(reader: &mut R, buf: &mut [u8]) -> Result<(), ProtocolError>
where
    R: AsyncRead + Unpin,
{
    match reader.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            Err(ProtocolError::ConnectionClosed)
        }
        Err(e) => Err(ProtocolError::Io(e)),
    }
}

/// Read one raw byte. `Ok(None)` means the peer closed the stream.
pub async fn read_byte<R>(reader: &mut R) -> Result<Option<u8>, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; 1];
    let n = reader.read(&mut buf).await?;
    Ok((n == 1).then_some(buf[0]))
}

/// Read one command byte.
///
/// Zero bytes read and unknown command values both yield `Ok(None)`: the
/// caller treats either as connection termination.
pub async fn read_command<R>(reader: &mut R) -> Result<Option<Command>, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let Some(byte) = read_byte(reader).await? else {
        return Ok(None);
    };
    let command = Command::from_u8(byte);
    if command.is_none() {
        tracing::trace!(byte, "unknown command byte");
    }
    Ok(command)
}

/// Read a little-endian `u64`.
pub async fn read_u64<R>(reader: &mut R) -> Result<u64, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; 8];
    read_exact_or_closed(reader, &mut buf).await?;
    Ok(u64::from_le_bytes(buf))
}

/// Read a length-prefixed UTF-8 string.
pub async fn read_string<R>(reader: &mut R) -> Result<String, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let len = read_u64(reader).await?;
    if len > MAX_STRING_LEN {
        return Err(ProtocolError::StringTooLong {
            len,
            max: MAX_STRING_LEN,
        });
    }
    let mut buf = vec![0u8; len as usize];
    read_exact_or_closed(reader, &mut buf).await?;
    String::from_utf8(buf).map_err(|_| ProtocolError::InvalidUtf8)
}
