//! Hierarchical cancellation built on `tokio::sync::watch`.
//!
//! A [`CancelSignal`] is observed by a worker; a [`CancelHandle`] is held by
//! whoever owns that worker. Signals derived with [`CancelSignal::child`]
//! observe their own handle plus every ancestor, so cancelling the engine's
//! root shutdown channel stops every watch, stream and forward beneath it.
//!
//! Dropping a handle cancels its signal: a worker whose owner forgot about it
//! exits instead of leaking.

use futures_util::future::select_all;
use tokio::sync::watch;

/// Owner side of a cancellable unit of work.
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    /// Cancel the associated signal and all of its children.
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }

    /// Whether `cancel` has been called on this handle.
    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }
}

/// Worker side of a cancellable unit of work.
#[derive(Debug, Clone)]
pub struct CancelSignal {
    receivers: Vec<watch::Receiver<bool>>,
}

impl CancelSignal {
    /// Root signal driven by a shutdown channel.
    pub fn root(shutdown: watch::Receiver<bool>) -> Self {
        Self {
            receivers: vec![shutdown],
        }
    }

    /// A standalone signal with no ancestors, cancelled only through (or by
    /// dropping) the returned handle.
    pub fn detached() -> (CancelHandle, Self) {
        let (tx, rx) = watch::channel(false);
        (CancelHandle { tx }, Self { receivers: vec![rx] })
    }

    /// Derive a child signal with its own handle.
    pub fn child(&self) -> (CancelHandle, Self) {
        let (tx, rx) = watch::channel(false);
        let mut receivers = self.receivers.clone();
        receivers.push(rx);
        (CancelHandle { tx }, Self { receivers })
    }

    /// Returns true if this signal or any ancestor has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.receivers
            .iter()
            .any(|rx| *rx.borrow() || rx.has_changed().is_err())
    }

    /// Resolve once this signal or any ancestor is cancelled.
    ///
    /// Cancel-safe: may be used as a `tokio::select!` branch repeatedly.
    pub async fn cancelled(&self) {
        if self.is_cancelled() {
            return;
        }

        let waits = self.receivers.iter().cloned().map(|mut rx| {
            Box::pin(async move {
                // An error means the owning handle was dropped.
                let _ = rx.wait_for(|cancelled| *cancelled).await;
            })
        });

        let _ = select_all(waits).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_child_observes_parent() {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let root = CancelSignal::root(shutdown_rx);
        let (_handle, child) = root.child();
        let (_grand_handle, grandchild) = child.child();

        assert!(!grandchild.is_cancelled());

        shutdown_tx.send(true).unwrap();

        tokio::time::timeout(Duration::from_secs(1), grandchild.cancelled())
            .await
            .unwrap();
        assert!(child.is_cancelled());
    }

    #[tokio::test]
    async fn test_child_does_not_cancel_parent() {
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let root = CancelSignal::root(shutdown_rx);
        let (handle, child) = root.child();

        handle.cancel();

        assert!(handle.is_cancelled());
        assert!(child.is_cancelled());
        assert!(!root.is_cancelled());
    }

    #[tokio::test]
    async fn test_dropped_handle_cancels() {
        let (handle, signal) = CancelSignal::detached();
        drop(handle);

        tokio::time::timeout(Duration::from_secs(1), signal.cancelled())
            .await
            .unwrap();
        assert!(signal.is_cancelled());
    }

    #[tokio::test]
    async fn test_pending_until_cancelled() {
        let (handle, signal) = CancelSignal::detached();

        let waited = tokio::time::timeout(Duration::from_millis(20), signal.cancelled()).await;
        assert!(waited.is_err());

        handle.cancel();
        signal.cancelled().await;
    }
}
