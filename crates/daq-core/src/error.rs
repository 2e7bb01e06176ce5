//! Error types for the DAQ toolkit.
//!
//! [`DaqError`] is the single error enum shared by the wire codec, the
//! device runtime and run-control. Library code returns it directly;
//! application-level plumbing (runtimes, binaries, user handlers) wraps it
//! in `anyhow` for context.

use thiserror::Error;

use crate::fsm::{Status, Step};

/// Convenience alias for results using the toolkit error type.
pub type DaqResult<T> = std::result::Result<T, DaqError>;

/// Primary error type for the DAQ toolkit.
///
/// Protocol variants are fatal to the connection they occurred on.
/// Lifecycle variants are reported to the caller of the run-control driver
/// and mark the device `Error`. I/O failures tear the connection down.
#[derive(Error, Debug)]
pub enum DaqError {
    /// Underlying socket or in-memory stream failure. Short reads surface
    /// here as `ErrorKind::UnexpectedEof`.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// A frame header carried a type byte outside the defined range.
    #[error("invalid frame type {0:#04x}")]
    InvalidFrameType(u8),

    /// A command was expected but the frame is not a command frame.
    #[error("frame is not a command frame")]
    NotACommand,

    /// A status byte on the wire does not name a lifecycle state.
    #[error("invalid status byte {0:#04x}")]
    InvalidStatus(u8),

    /// Malformed wire payload that is structurally wrong rather than
    /// truncated: bad lengths, non-UTF-8 strings, empty command bodies.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A lifecycle step was requested from a state that does not allow it.
    #[error("illegal transition: {step} from {from}")]
    IllegalTransition { from: Status, step: Step },

    /// A device announced a name already registered with run-control.
    #[error("device '{0}' already joined")]
    DuplicateDevice(String),

    /// `/join` arrived after the first lifecycle transition was issued.
    #[error("late join: lifecycle already started")]
    LateJoin,

    /// A bounded wait elapsed.
    #[error("timed out waiting for {0}")]
    Timeout(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DaqError::InvalidFrameType(0x2a);
        assert_eq!(err.to_string(), "invalid frame type 0x2a");

        let err = DaqError::IllegalTransition {
            from: Status::Running,
            step: Step::Init,
        };
        assert_eq!(err.to_string(), "illegal transition: init from running");
    }

    #[test]
    fn test_io_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "early eof");
        let err = DaqError::from(io);
        assert!(matches!(err, DaqError::Io(_)));
    }
}
