//! Device lifecycle state machine.
//!
//! Every device moves through the same set of states, driven by
//! run-control commands:
//!
//! ```text
//! UnConf --config--> Conf         Conf   --config--> Conf
//! Conf   --init-->   Init         Init   --reset-->  Conf
//! Init   --start-->  Running      Running--stop-->   Stopped
//! Stopped--start-->  Running      Stopped--reset-->  Conf
//! (any)  --term-->   Exiting      (any failed step)  -> Error
//! ```
//!
//! A device applies a transition only after its local command handler
//! returned successfully; a handler error (or an illegal request) moves it
//! to [`Status::Error`].

use std::fmt;

/// Position of a device in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Status {
    UnConf = 0,
    Conf = 1,
    Init = 2,
    Stopped = 3,
    Running = 4,
    Exiting = 5,
    Error = 6,
}

/// A lifecycle step requested by run-control.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Step {
    Config,
    Init,
    Reset,
    Start,
    Stop,
    Term,
}

impl Status {
    /// Decodes a wire byte into a status.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Status::UnConf),
            1 => Some(Status::Conf),
            2 => Some(Status::Init),
            3 => Some(Status::Stopped),
            4 => Some(Status::Running),
            5 => Some(Status::Exiting),
            6 => Some(Status::Error),
            _ => None,
        }
    }

    /// Successor state after applying `step`, or `None` when the request is
    /// illegal from this state.
    pub fn step(self, step: Step) -> Option<Status> {
        match (self, step) {
            (Status::UnConf | Status::Conf, Step::Config) => Some(Status::Conf),
            (Status::Conf, Step::Init) => Some(Status::Init),
            (Status::Init | Status::Stopped, Step::Reset) => Some(Status::Conf),
            (Status::Init | Status::Stopped, Step::Start) => Some(Status::Running),
            (Status::Running, Step::Stop) => Some(Status::Stopped),
            (_, Step::Term) => Some(Status::Exiting),
            _ => None,
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Status::UnConf => "unconf",
            Status::Conf => "conf",
            Status::Init => "init",
            Status::Stopped => "stopped",
            Status::Running => "running",
            Status::Exiting => "exiting",
            Status::Error => "error",
        };
        f.write_str(label)
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Step::Config => "config",
            Step::Init => "init",
            Step::Reset => "reset",
            Step::Start => "start",
            Step::Stop => "stop",
            Step::Term => "term",
        };
        f.write_str(label)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_legal_transitions() {
        for (from, step, want) in [
            (Status::UnConf, Step::Config, Status::Conf),
            (Status::Conf, Step::Config, Status::Conf),
            (Status::Conf, Step::Init, Status::Init),
            (Status::Init, Step::Reset, Status::Conf),
            (Status::Init, Step::Start, Status::Running),
            (Status::Running, Step::Stop, Status::Stopped),
            (Status::Stopped, Step::Start, Status::Running),
            (Status::Stopped, Step::Reset, Status::Conf),
            (Status::UnConf, Step::Term, Status::Exiting),
            (Status::Running, Step::Term, Status::Exiting),
            (Status::Error, Step::Term, Status::Exiting),
        ] {
            assert_eq!(from.step(step), Some(want), "{from} --{step}--> {want}");
        }
    }

    #[test]
    fn test_illegal_transitions() {
        for (from, step) in [
            (Status::UnConf, Step::Init),
            (Status::UnConf, Step::Start),
            (Status::Conf, Step::Start),
            (Status::Conf, Step::Stop),
            (Status::Running, Step::Config),
            (Status::Running, Step::Start),
            (Status::Running, Step::Init),
            (Status::Stopped, Step::Stop),
            (Status::Error, Step::Config),
            (Status::Exiting, Step::Start),
        ] {
            assert_eq!(from.step(step), None, "{from} --{step}--> must be illegal");
        }
    }

    #[test]
    fn test_status_wire_roundtrip() {
        for status in [
            Status::UnConf,
            Status::Conf,
            Status::Init,
            Status::Stopped,
            Status::Running,
            Status::Exiting,
            Status::Error,
        ] {
            assert_eq!(Status::from_u8(status as u8), Some(status));
        }
        assert_eq!(Status::from_u8(7), None);
        assert_eq!(Status::from_u8(255), None);
    }
}
