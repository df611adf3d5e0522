//! In-flight message accounting for campaign pipes
//!
//! A pipe adds a ticket per message it hands off (plus a sentinel ticket
//! held until its subscribers are exhausted) and the cleanup watcher waits
//! for the count to drain to zero. Tickets count messages, not tasks, which
//! is why this is a counter and not a task tracker.

use std::sync::atomic::{AtomicI64, Ordering};
use tokio::sync::Notify;

/// Counter + notification waitgroup
#[derive(Debug, Default)]
pub struct WaitGroup {
    count: AtomicI64,
    notify: Notify,
}

impl WaitGroup {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take `n` tickets
    pub fn add(&self, n: i64) {
        self.count.fetch_add(n, Ordering::SeqCst);
    }

    /// Release one ticket; wakes waiters when the count drains to zero
    pub fn done(&self) {
        let prev = self.count.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(prev > 0, "waitgroup ticket released more times than taken");
        if prev <= 1 {
            self.notify.notify_waiters();
        }
    }

    /// Current ticket count
    pub fn count(&self) -> i64 {
        self.count.load(Ordering::SeqCst)
    }

    /// Wait until the count drains to zero
    pub async fn wait(&self) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register interest before the count check so a `done` racing
            // between the check and the await cannot be missed.
            notified.as_mut().enable();
            if self.count.load(Ordering::SeqCst) <= 0 {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_wait_returns_immediately_at_zero() {
        let wg = WaitGroup::new();
        tokio::time::timeout(Duration::from_millis(100), wg.wait())
            .await
            .expect("wait at zero should not block");
    }

    #[tokio::test]
    async fn test_wait_blocks_until_drained() {
        let wg = Arc::new(WaitGroup::new());
        wg.add(3);

        let waiter = {
            let wg = wg.clone();
            tokio::spawn(async move { wg.wait().await })
        };

        for _ in 0..3 {
            assert!(!waiter.is_finished());
            wg.done();
            tokio::task::yield_now().await;
        }

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should finish after final done")
            .unwrap();
        assert_eq!(wg.count(), 0);
    }
}
