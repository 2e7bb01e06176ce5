//! Command codec.
//!
//! A command is a frame of type [`FrameType::Cmd`] whose path is the
//! canonical command path and whose body is `[ctype] ++ payload`. The
//! payload of each variant is marshalled with the sticky primitives in
//! [`crate::codec`]; decoding happens at the call site that knows which
//! variant to expect.

use std::fmt;

use daq_core::endpoint::EndPoint;
use daq_core::error::DaqError;
use daq_core::fsm::Status;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::codec::{Decoder, Encoder};
use crate::frame::{recv_frame, send_frame, Frame, FrameType};

/// Sanity bound on the number of end-points in one command.
const MAX_PORTS: u64 = 4096;

/// Wire tag of a command. The value comes straight off the network, so the
/// type can hold arbitrary bytes; converting an out-of-range value to its
/// path is a programming error and panics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CmdType(pub u8);

pub const CMD_UNKNOWN: CmdType = CmdType(0);
pub const CMD_JOIN: CmdType = CmdType(1);
pub const CMD_CONNECT: CmdType = CmdType(2);
pub const CMD_CONFIG: CmdType = CmdType(3);
pub const CMD_INIT: CmdType = CmdType(4);
pub const CMD_RESET: CmdType = CmdType(5);
pub const CMD_START: CmdType = CmdType(6);
pub const CMD_STOP: CmdType = CmdType(7);
pub const CMD_TERM: CmdType = CmdType(8);
pub const CMD_STATUS: CmdType = CmdType(9);
pub const CMD_LOG: CmdType = CmdType(10);

impl CmdType {
    /// Canonical slash-prefixed path of this command.
    ///
    /// # Panics
    ///
    /// Panics with `invalid cmd-type N` for values outside the defined
    /// range; such a value never comes from valid toolkit code.
    pub fn path(self) -> &'static str {
        match self {
            CMD_UNKNOWN => "/unknown",
            CMD_JOIN => "/join",
            CMD_CONNECT => "/connect",
            CMD_CONFIG => "/config",
            CMD_INIT => "/init",
            CMD_RESET => "/reset",
            CMD_START => "/start",
            CMD_STOP => "/stop",
            CMD_TERM => "/term",
            CMD_STATUS => "/status",
            CMD_LOG => "/log",
            CmdType(n) => panic!("invalid cmd-type {n}"),
        }
    }
}

impl fmt::Display for CmdType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.path())
    }
}

/// A raw command as carried by a frame: tag byte plus opaque payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cmd {
    pub ctype: CmdType,
    pub body: Vec<u8>,
}

impl Cmd {
    /// Splits a command frame into its tag and payload.
    pub fn from_frame(frame: &Frame) -> Result<Self, DaqError> {
        if frame.ftype != FrameType::Cmd {
            return Err(DaqError::NotACommand);
        }
        let (&ctype, body) = frame
            .body
            .split_first()
            .ok_or_else(|| DaqError::Protocol("empty command frame body".into()))?;
        Ok(Cmd {
            ctype: CmdType(ctype),
            body: body.to_vec(),
        })
    }
}

impl Frame {
    /// A bare command frame with no payload beyond the tag byte; lifecycle
    /// commands like `/init` or `/start` carry nothing else.
    pub fn command(ctype: CmdType) -> Frame {
        Frame {
            ftype: FrameType::Cmd,
            path: ctype.path().as_bytes().to_vec(),
            body: vec![ctype.0],
        }
    }
}

/// A command variant that can cross the wire.
pub trait Command: Sized {
    const CMD_TYPE: CmdType;

    /// Serializes the payload (without the leading tag byte).
    fn marshal(&self) -> Result<Vec<u8>, DaqError>;

    /// Parses the payload (the bytes after the leading tag byte).
    fn unmarshal(raw: &[u8]) -> Result<Self, DaqError>;

    /// Wraps this command into its wire frame.
    fn to_frame(&self) -> Result<Frame, DaqError> {
        let payload = self.marshal()?;
        let mut body = Vec::with_capacity(1 + payload.len());
        body.push(Self::CMD_TYPE.0);
        body.extend_from_slice(&payload);
        Ok(Frame {
            ftype: FrameType::Cmd,
            path: Self::CMD_TYPE.path().as_bytes().to_vec(),
            body,
        })
    }
}

/// Sends one command as a frame.
pub async fn send_cmd<W, C>(w: &mut W, cmd: &C) -> Result<(), DaqError>
where
    W: AsyncWrite + Unpin,
    C: Command,
{
    let frame = cmd.to_frame()?;
    send_frame(w, &frame).await
}

/// Receives one frame and splits it as a command.
pub async fn recv_cmd<R>(r: &mut R) -> Result<Cmd, DaqError>
where
    R: AsyncRead + Unpin,
{
    let frame = recv_frame(r).await?;
    Cmd::from_frame(&frame)
}

fn write_ports(enc: &mut Encoder<&mut Vec<u8>>, ports: &[EndPoint]) {
    enc.write_u64(ports.len() as u64);
    for p in ports {
        enc.write_str(&p.name);
        enc.write_str(&p.addr);
        enc.write_str(&p.kind);
    }
}

fn read_ports(dec: &mut Decoder<&[u8]>) -> Vec<EndPoint> {
    let n = dec.read_u64();
    if n > MAX_PORTS {
        dec.fail(DaqError::Protocol(format!(
            "end-point list of {n} entries exceeds maximum {MAX_PORTS}"
        )));
        return Vec::new();
    }
    (0..n)
        .map(|_| EndPoint {
            name: dec.read_str(),
            addr: dec.read_str(),
            kind: dec.read_str(),
        })
        .collect()
}

/// `/join`: a device announces its name and declared end-points.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct JoinCmd {
    pub name: String,
    pub in_ports: Vec<EndPoint>,
    pub out_ports: Vec<EndPoint>,
}

impl Command for JoinCmd {
    const CMD_TYPE: CmdType = CMD_JOIN;

    fn marshal(&self) -> Result<Vec<u8>, DaqError> {
        let mut buf = Vec::new();
        let mut enc = Encoder::new(&mut buf);
        enc.write_str(&self.name);
        write_ports(&mut enc, &self.in_ports);
        write_ports(&mut enc, &self.out_ports);
        enc.finish()?;
        Ok(buf)
    }

    fn unmarshal(raw: &[u8]) -> Result<Self, DaqError> {
        let mut dec = Decoder::new(raw);
        let name = dec.read_str();
        let in_ports = read_ports(&mut dec);
        let out_ports = read_ports(&mut dec);
        dec.finish()?;
        Ok(JoinCmd {
            name,
            in_ports,
            out_ports,
        })
    }
}

/// `/config`: run-control echoes the device's end-points, with producer
/// addresses filled in on the input side.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ConfigCmd {
    pub name: String,
    pub in_ports: Vec<EndPoint>,
    pub out_ports: Vec<EndPoint>,
}

impl Command for ConfigCmd {
    const CMD_TYPE: CmdType = CMD_CONFIG;

    fn marshal(&self) -> Result<Vec<u8>, DaqError> {
        let mut buf = Vec::new();
        let mut enc = Encoder::new(&mut buf);
        enc.write_str(&self.name);
        write_ports(&mut enc, &self.in_ports);
        write_ports(&mut enc, &self.out_ports);
        enc.finish()?;
        Ok(buf)
    }

    fn unmarshal(raw: &[u8]) -> Result<Self, DaqError> {
        let mut dec = Decoder::new(raw);
        let name = dec.read_str();
        let in_ports = read_ports(&mut dec);
        let out_ports = read_ports(&mut dec);
        dec.finish()?;
        Ok(ConfigCmd {
            name,
            in_ports,
            out_ports,
        })
    }
}

/// `/status`: a device reports its lifecycle state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusCmd {
    pub name: String,
    pub status: Status,
}

impl Command for StatusCmd {
    const CMD_TYPE: CmdType = CMD_STATUS;

    fn marshal(&self) -> Result<Vec<u8>, DaqError> {
        let mut buf = Vec::new();
        let mut enc = Encoder::new(&mut buf);
        enc.write_str(&self.name);
        enc.write_u8(self.status as u8);
        enc.finish()?;
        Ok(buf)
    }

    fn unmarshal(raw: &[u8]) -> Result<Self, DaqError> {
        let mut dec = Decoder::new(raw);
        let name = dec.read_str();
        let status = dec.read_u8();
        dec.finish()?;
        let status = Status::from_u8(status).ok_or(DaqError::InvalidStatus(status))?;
        Ok(StatusCmd { name, status })
    }
}

/// Severity of a `/log` message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LogLevel {
    Debug = 0,
    Info = 1,
    Warn = 2,
    Error = 3,
}

impl LogLevel {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(LogLevel::Debug),
            1 => Some(LogLevel::Info),
            2 => Some(LogLevel::Warn),
            3 => Some(LogLevel::Error),
            _ => None,
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        };
        f.write_str(label)
    }
}

/// `/log`: a spontaneous device→run-control log record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogCmd {
    pub name: String,
    pub level: LogLevel,
    pub msg: String,
}

impl Command for LogCmd {
    const CMD_TYPE: CmdType = CMD_LOG;

    fn marshal(&self) -> Result<Vec<u8>, DaqError> {
        let mut buf = Vec::new();
        let mut enc = Encoder::new(&mut buf);
        enc.write_str(&self.name);
        enc.write_u8(self.level as u8);
        enc.write_str(&self.msg);
        enc.finish()?;
        Ok(buf)
    }

    fn unmarshal(raw: &[u8]) -> Result<Self, DaqError> {
        let mut dec = Decoder::new(raw);
        let name = dec.read_str();
        let level = dec.read_u8();
        let msg = dec.read_str();
        dec.finish()?;
        let level = LogLevel::from_u8(level)
            .ok_or_else(|| DaqError::Protocol(format!("invalid log level {level:#04x}")))?;
        Ok(LogCmd { name, level, msg })
    }
}
