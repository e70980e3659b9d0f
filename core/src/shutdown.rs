//! Shutdown signalling for engine runs and replays.
//!
//! A single [`ShutdownHandle`] governs a whole engine run (or one replay
//! call). Every task holds a cloned [`ShutdownSignal`].
//!
//! # Modes
//!
//! - [`ShutdownMode::Graceful`]: stop accepting events, drain queued events,
//!   flush pending checkpoints
//! - [`ShutdownMode::Immediate`]: stop accepting events and abandon queued ones;
//!   positions already processed are still flushed best-effort
//!
//! # Example
//!
//! ```
//! use foldline_core::shutdown::{shutdown_channel, ShutdownMode};
//!
//! let (handle, signal) = shutdown_channel();
//! assert_eq!(signal.mode(), ShutdownMode::Running);
//!
//! handle.shutdown();
//! assert!(signal.is_shutdown());
//! assert!(!signal.is_immediate());
//! ```

use std::sync::Arc;
use tokio::sync::watch;

/// Current shutdown state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownMode {
    /// Normal operation
    Running,
    /// Drain queued work, then stop
    Graceful,
    /// Stop as soon as in-flight work allows
    Immediate,
}

/// Sending half: triggers shutdown.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    tx: Arc<watch::Sender<ShutdownMode>>,
}

/// Receiving half: observed by every engine task and passed to handlers.
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<ShutdownMode>,
}

/// Create a connected handle/signal pair.
#[must_use]
pub fn shutdown_channel() -> (ShutdownHandle, ShutdownSignal) {
    let (tx, rx) = watch::channel(ShutdownMode::Running);
    (ShutdownHandle { tx: Arc::new(tx) }, ShutdownSignal { rx })
}

impl ShutdownHandle {
    /// Request a graceful shutdown.
    ///
    /// Has no effect if an immediate shutdown was already requested.
    pub fn shutdown(&self) {
        self.tx.send_if_modified(|mode| {
            if *mode == ShutdownMode::Running {
                *mode = ShutdownMode::Graceful;
                true
            } else {
                false
            }
        });
    }

    /// Request an immediate shutdown, abandoning queued work.
    pub fn abort(&self) {
        self.tx.send_replace(ShutdownMode::Immediate);
    }

    /// Create another signal observing this handle.
    #[must_use]
    pub fn signal(&self) -> ShutdownSignal {
        ShutdownSignal {
            rx: self.tx.subscribe(),
        }
    }
}

impl ShutdownSignal {
    /// A signal that never fires, for callers that do not need cancellation.
    #[must_use]
    pub fn never() -> Self {
        let (_, signal) = shutdown_channel();
        signal
    }

    /// The current mode.
    #[must_use]
    pub fn mode(&self) -> ShutdownMode {
        *self.rx.borrow()
    }

    /// Returns `true` once any shutdown has been requested.
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.mode() != ShutdownMode::Running
    }

    /// Returns `true` once an immediate shutdown has been requested.
    #[must_use]
    pub fn is_immediate(&self) -> bool {
        self.mode() == ShutdownMode::Immediate
    }

    /// Wait until any shutdown is requested.
    ///
    /// If every handle has been dropped without requesting shutdown, this
    /// never completes.
    pub async fn cancelled(&mut self) -> ShutdownMode {
        self.wait_until(|mode| mode != ShutdownMode::Running).await
    }

    /// Wait until an immediate shutdown is requested.
    pub async fn immediate(&mut self) {
        self.wait_until(|mode| mode == ShutdownMode::Immediate).await;
    }

    async fn wait_until(&mut self, done: impl Fn(ShutdownMode) -> bool) -> ShutdownMode {
        let result = self.rx.wait_for(|mode| done(*mode)).await.map(|mode| *mode);
        match result {
            Ok(mode) => mode,
            Err(_) => std::future::pending().await,
        }
    }
}
