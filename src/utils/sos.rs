//! Signal-of-Stop: cooperative cancellation shared by the process shutdown
//! path and in-flight file transfers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

/// Clones share state; cancelling any clone wakes every waiter.
#[derive(Debug, Clone, Default)]
pub struct SignalOfStop {
    internal: Arc<SharedState>,
}

#[derive(Debug, Default)]
struct SharedState {
    closing: AtomicBool,
    notify: Notify,
}

impl SignalOfStop {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.internal.closing.store(true, Ordering::Release);
        self.internal.notify.notify_waiters();
    }

    pub fn cancelled(&self) -> bool {
        self.internal.closing.load(Ordering::Acquire)
    }

    /// Resolve once [`cancel`](Self::cancel) has been called. Returns
    /// immediately if it already was.
    pub async fn wait(&self) {
        loop {
            let notified = self.internal.notify.notified();
            tokio::pin!(notified);
            // Register before checking the flag so a concurrent cancel is not missed.
            notified.as_mut().enable();
            if self.cancelled() {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn wait_returns_after_cancel_from_clone() {
        let sos = SignalOfStop::new();
        let clone = sos.clone();
        let waiter = tokio::spawn(async move { clone.wait().await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        sos.cancel();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(sos.cancelled());
    }

    #[tokio::test]
    async fn wait_after_cancel_is_immediate() {
        let sos = SignalOfStop::new();
        sos.cancel();
        tokio::time::timeout(Duration::from_millis(100), sos.wait())
            .await
            .unwrap();
    }
}
