//! Host environment signals: connectivity and process exit.

use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;

/// Explicit handle to the hosting environment.
///
/// Cloned into every collaborator that needs to know whether the network is
/// reachable or whether the process is about to go away.
#[derive(Clone, Debug)]
pub struct Environment {
    inner: Arc<EnvironmentInner>,
}

#[derive(Debug)]
struct EnvironmentInner {
    online_tx: watch::Sender<bool>,
    exit_tx: watch::Sender<bool>,
}

impl Environment {
    /// Online, not exiting.
    pub fn new() -> Self {
        let (online_tx, _) = watch::channel(true);
        let (exit_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(EnvironmentInner {
                online_tx,
                exit_tx,
            }),
        }
    }

    pub fn is_online(&self) -> bool {
        *self.inner.online_tx.borrow()
    }

    pub fn is_offline(&self) -> bool {
        !self.is_online()
    }

    pub fn set_online(&self, online: bool) {
        let previous = self.inner.online_tx.send_replace(online);
        if previous != online {
            info!(online, "Connectivity changed");
        }
    }

    /// Resolve once the environment is online.
    pub async fn online(&self) {
        let mut rx = self.inner.online_tx.subscribe();
        let _ = rx.wait_for(|online| *online).await;
    }

    /// Signal that the process may terminate at any moment.
    ///
    /// Idempotent. Deferred work observing this flag must become immediate.
    pub fn signal_exit(&self) {
        let was_exiting = self.inner.exit_tx.send_replace(true);
        if !was_exiting {
            info!("Exit signalled");
        }
    }

    pub fn is_exiting(&self) -> bool {
        *self.inner.exit_tx.borrow()
    }

    /// Receiver that flips to `true` on exit.
    pub fn exit_signal(&self) -> watch::Receiver<bool> {
        self.inner.exit_tx.subscribe()
    }

    /// Resolve once exit has been signalled.
    pub async fn exited(&self) {
        let mut rx = self.exit_signal();
        // Sender lives in `self`, so wait_for only fails if it is dropped.
        let _ = rx.wait_for(|exiting| *exiting).await;
    }
}

impl Default for Environment {
    fn default() -> Self {
        Self::new()
    }
}
