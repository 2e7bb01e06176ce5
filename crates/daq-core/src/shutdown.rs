//! Cooperative shutdown signalling.
//!
//! The cancellation signal is an explicit argument on every long-running
//! entry point in the toolkit; there are no global shutdown flags. The
//! implementation is a thin wrapper over `tokio::sync::watch`: a
//! [`Trigger`] flips the flag once, every cloned [`Shutdown`] observes it.
//! Dropping the trigger releases waiters the same way.

use tokio::sync::watch;

/// Creates a linked trigger/receiver pair.
pub fn channel() -> (Trigger, Shutdown) {
    let (tx, rx) = watch::channel(false);
    (Trigger { tx }, Shutdown { rx })
}

/// Sending half: owned by whoever decides when to shut down.
#[derive(Debug)]
pub struct Trigger {
    tx: watch::Sender<bool>,
}

impl Trigger {
    /// Signals shutdown to every receiver. Idempotent.
    pub fn trigger(&self) {
        let _ = self.tx.send(true);
    }

    /// A fresh receiver tied to this trigger.
    pub fn subscribe(&self) -> Shutdown {
        Shutdown {
            rx: self.tx.subscribe(),
        }
    }
}

/// Receiving half: cheap to clone, one per task.
#[derive(Debug, Clone)]
pub struct Shutdown {
    rx: watch::Receiver<bool>,
}

impl Shutdown {
    /// True once shutdown has been signalled (or the trigger is gone).
    pub fn is_shutdown(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves when shutdown is signalled. Meant for `tokio::select!`
    /// arms; resolves immediately if the signal already fired.
    pub async fn recv(&mut self) {
        while !*self.rx.borrow_and_update() {
            if self.rx.changed().await.is_err() {
                // Trigger dropped: treat as shutdown.
                return;
            }
        }
    }
}
