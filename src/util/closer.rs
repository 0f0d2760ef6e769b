use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// Shutdown handshake between the owner and a set of background tasks.
/// The owner signals, tasks observe [`Closer::captured`] and call
/// [`Closer::done`] on exit; `signal_and_wait` blocks until all have.
#[derive(Debug, Clone)]
pub(crate) struct Closer {
    token: CancellationToken,
    running: Arc<AtomicUsize>,
    notify: Arc<Notify>,
}

impl Closer {
    pub(crate) fn new(running: usize) -> Self {
        Self {
            token: CancellationToken::new(),
            running: Arc::new(AtomicUsize::new(running)),
            notify: Arc::new(Notify::new()),
        }
    }

    pub(crate) fn done(&self) {
        let prev = self.running.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(prev > 0);
        if prev == 1 {
            self.notify.notify_waiters();
        }
    }

    pub(crate) async fn captured(&self) {
        self.token.cancelled().await;
    }

    pub(crate) fn signal(&self) {
        self.token.cancel();
    }

    pub(crate) async fn signal_and_wait(&self) {
        self.signal();
        loop {
            if self.running.load(Ordering::SeqCst) == 0 {
                return;
            }
            let notified = self.notify.notified();
            if self.running.load(Ordering::SeqCst) == 0 {
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
    async fn signal_releases_all_workers() {
        let closer = Closer::new(3);
        for _ in 0..3 {
            let c = closer.clone();
            tokio::spawn(async move {
                c.captured().await;
                c.done();
            });
        }
        tokio::time::timeout(Duration::from_secs(1), closer.signal_and_wait())
            .await
            .expect("workers did not drain");
    }
}
