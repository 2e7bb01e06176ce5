//! Binary framing.
//!
//! Wire layout of one frame, all integers little-endian:
//!
//! ```text
//! ┌──────────────┬─────────┬──────────────┬────────────────┬───────────┐
//! │ u64 length   │ u8 type │ u32 path_len │ path bytes     │ body      │
//! └──────────────┴─────────┴──────────────┴────────────────┴───────────┘
//! ```
//!
//! `length` counts everything after itself. Readers pull the length, read
//! exactly that many bytes and parse in one shot; a short read surfaces an
//! unexpected-EOF error. Writers emit the whole frame with one `write_all`.
//!
//! Cancellation: callers race [`send_frame`]/[`recv_frame`] against a
//! shutdown signal in `tokio::select!`. A dropped receive leaves the stream
//! mid-frame; the connection is only good for teardown afterwards.

use daq_core::error::DaqError;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound on a frame payload, guarding against hostile or corrupt
/// length prefixes.
pub const MAX_FRAME_LEN: u64 = 64 * 1024 * 1024;

/// Frame header: type byte plus path length field.
const HEADER_LEN: usize = 1 + 4;

/// Kind of payload a frame carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    Unknown = 0,
    /// Control-plane command; body starts with a `CmdType` byte.
    Cmd = 1,
    /// Data-plane payload.
    Data = 2,
    Ok = 3,
    /// Carries an error message in the body.
    Err = 4,
    /// End of a data run.
    Eof = 5,
}

impl FrameType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(FrameType::Unknown),
            1 => Some(FrameType::Cmd),
            2 => Some(FrameType::Data),
            3 => Some(FrameType::Ok),
            4 => Some(FrameType::Err),
            5 => Some(FrameType::Eof),
            _ => None,
        }
    }
}

impl Default for FrameType {
    fn default() -> Self {
        FrameType::Unknown
    }
}

impl std::fmt::Display for FrameType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            FrameType::Unknown => "unknown",
            FrameType::Cmd => "cmd",
            FrameType::Data => "data",
            FrameType::Ok => "ok",
            FrameType::Err => "err",
            FrameType::Eof => "eof",
        };
        f.write_str(label)
    }
}

/// The wire unit: a typed, path-tagged payload.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Frame {
    pub ftype: FrameType,
    pub path: Vec<u8>,
    pub body: Vec<u8>,
}

impl Frame {
    /// A data-plane frame with no path.
    pub fn data(body: Vec<u8>) -> Self {
        Frame {
            ftype: FrameType::Data,
            path: Vec::new(),
            body,
        }
    }

    /// End-of-run marker.
    pub fn eof() -> Self {
        Frame {
            ftype: FrameType::Eof,
            path: Vec::new(),
            body: Vec::new(),
        }
    }

    /// An error frame carrying a human-readable reason.
    pub fn error(msg: &str) -> Self {
        Frame {
            ftype: FrameType::Err,
            path: Vec::new(),
            body: msg.as_bytes().to_vec(),
        }
    }

    /// Full wire bytes, length prefix included.
    pub fn encode(&self) -> Vec<u8> {
        let payload_len = HEADER_LEN + self.path.len() + self.body.len();
        let mut buf = Vec::with_capacity(8 + payload_len);
        buf.extend_from_slice(&(payload_len as u64).to_le_bytes());
        buf.push(self.ftype as u8);
        buf.extend_from_slice(&(self.path.len() as u32).to_le_bytes());
        buf.extend_from_slice(&self.path);
        buf.extend_from_slice(&self.body);
        buf
    }

    /// Parses one payload (the bytes after the length prefix).
    pub fn decode(payload: &[u8]) -> Result<Self, DaqError> {
        if payload.len() < HEADER_LEN {
            return Err(DaqError::Protocol(format!(
                "frame payload too short: {} bytes",
                payload.len()
            )));
        }
        let ftype =
            FrameType::from_u8(payload[0]).ok_or(DaqError::InvalidFrameType(payload[0]))?;
        let path_len = u32::from_le_bytes(payload[1..HEADER_LEN].try_into().unwrap()) as usize;
        let rest = &payload[HEADER_LEN..];
        if rest.len() < path_len {
            return Err(DaqError::Protocol(format!(
                "frame path length {} exceeds payload ({} bytes left)",
                path_len,
                rest.len()
            )));
        }
        Ok(Frame {
            ftype,
            path: rest[..path_len].to_vec(),
            body: rest[path_len..].to_vec(),
        })
    }
}

/// Writes one frame to `w`.
pub async fn send_frame<W>(w: &mut W, frame: &Frame) -> Result<(), DaqError>
where
    W: AsyncWrite + Unpin,
{
    let bytes = frame.encode();
    w.write_all(&bytes).await?;
    w.flush().await?;
    Ok(())
}

/// Reads exactly one frame from `r`.
pub async fn recv_frame<R>(r: &mut R) -> Result<Frame, DaqError>
where
    R: AsyncRead + Unpin,
{
    let mut len = [0u8; 8];
    r.read_exact(&mut len).await?;
    let len = u64::from_le_bytes(len);
    if len > MAX_FRAME_LEN {
        return Err(DaqError::Protocol(format!(
            "frame payload of {len} bytes exceeds maximum {MAX_FRAME_LEN}"
        )));
    }
    let mut payload = vec![0u8; len as usize];
    r.read_exact(&mut payload).await?;
    Frame::decode(&payload)
}
