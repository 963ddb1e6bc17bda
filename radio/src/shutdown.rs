//! Cooperative shutdown
//!
//! A trigger owns the only sender of a channel that never carries a message.
//! Dropping the sender disconnects the channel, which every cloned signal
//! observes without polling a shared flag.

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use parking_lot::Mutex;
use std::time::Duration;

/// Create a connected trigger/signal pair
pub fn shutdown_channel() -> (ShutdownTrigger, ShutdownSignal) {
    let (tx, rx) = channel::bounded(0);
    (
        ShutdownTrigger {
            tx: Mutex::new(Some(tx)),
        },
        ShutdownSignal { rx },
    )
}

/// Fires the shutdown; dropping it fires too
pub struct ShutdownTrigger {
    tx: Mutex<Option<Sender<()>>>,
}

impl ShutdownTrigger {
    /// Ask every unit holding a matching signal to stop
    pub fn trigger(&self) {
        self.tx.lock().take();
    }
}

/// Observed by engine units between blocking operations
#[derive(Clone)]
pub struct ShutdownSignal {
    rx: Receiver<()>,
}

impl ShutdownSignal {
    /// Check if shutdown was requested
    pub fn is_triggered(&self) -> bool {
        matches!(self.rx.try_recv(), Err(TryRecvError::Disconnected))
    }

    /// Sleep for up to `timeout`; returns true if shutdown was requested
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        matches!(
            self.rx.recv_timeout(timeout),
            Err(RecvTimeoutError::Disconnected)
        )
    }
}
