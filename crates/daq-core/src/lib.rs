//! Core types shared by every crate in the DAQ toolkit.
//!
//! This crate holds the foundational vocabulary of the system: data
//! end-points ([`EndPoint`]), the device lifecycle state machine
//! ([`fsm::Status`]), the central error type ([`DaqError`]) and the
//! shutdown-signalling primitive ([`shutdown::Shutdown`]) threaded through
//! every long-running task.

pub mod endpoint;
pub mod error;
pub mod fsm;
pub mod shutdown;

pub use endpoint::EndPoint;
pub use error::{DaqError, DaqResult};
pub use fsm::{Status, Step};
