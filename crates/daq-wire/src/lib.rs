//! Wire protocol for the DAQ toolkit.
//!
//! Both planes of the system speak the same framing:
//!
//! - the **control plane** (device ⟷ run-control) carries command and
//!   status frames in both directions;
//! - the **data plane** (producer → consumer) carries data and EOF frames
//!   one way.
//!
//! A frame is a length-prefixed, typed, path-tagged payload (see
//! [`frame`]). Commands ride in frames of type [`frame::FrameType::Cmd`]
//! whose body starts with a [`command::CmdType`] byte (see [`command`]).
//! Command payloads are marshalled with the little-endian primitives in
//! [`codec`].

pub mod codec;
pub mod command;
pub mod frame;

pub use codec::{Decoder, Encoder};
pub use command::{
    Cmd, CmdType, Command, ConfigCmd, JoinCmd, LogCmd, LogLevel, StatusCmd, recv_cmd, send_cmd,
    CMD_CONFIG, CMD_CONNECT, CMD_INIT, CMD_JOIN, CMD_LOG, CMD_RESET, CMD_START, CMD_STATUS,
    CMD_STOP, CMD_TERM, CMD_UNKNOWN,
};
pub use frame::{recv_frame, send_frame, Frame, FrameType};
