//! Per-handler context.

use daq_core::shutdown::Shutdown;

/// Handed to every handler invocation: the device identity plus the
/// cancellation signal scoped to the handler's lifetime (the root signal
/// for command and input handlers, the current run for output and run
/// handlers).
#[derive(Debug, Clone)]
pub struct Context {
    name: String,
    shutdown: Shutdown,
}

impl Context {
    pub(crate) fn new(name: String, shutdown: Shutdown) -> Self {
        Self { name, shutdown }
    }

    /// Name of the device this handler belongs to.
    pub fn device(&self) -> &str {
        &self.name
    }

    /// True once this handler's scope has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.shutdown.is_shutdown()
    }

    /// Resolves when this handler's scope is cancelled; for use in
    /// `tokio::select!` against blocking work.
    pub async fn cancelled(&self) {
        self.shutdown.clone().recv().await;
    }
}
