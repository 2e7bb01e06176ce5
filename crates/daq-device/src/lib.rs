//! Device runtime.
//!
//! A device is a long-running process with registered lifecycle handlers
//! and named data end-points. It opens one TCP connection to run-control,
//! announces itself with `/join`, then dispatches incoming commands to its
//! handlers while data flows peer-to-peer over separate sockets.
//!
//! ```no_run
//! use daq_core::shutdown;
//! use daq_device::Device;
//!
//! # async fn demo() -> anyhow::Result<()> {
//! let mut dev = Device::new("127.0.0.1:44000", "data-sink");
//! dev.cmd_handle("/init", |_ctx, _req| async { Ok(()) });
//! dev.input_handle("/adc", |_ctx, _frame| async { Ok(()) });
//!
//! let (_trigger, sd) = shutdown::channel();
//! dev.run(sd).await
//! # }
//! ```

mod context;
mod device;
mod handler;
mod port;

pub use context::Context;
pub use device::Device;

pub use daq_core::shutdown::Shutdown;
