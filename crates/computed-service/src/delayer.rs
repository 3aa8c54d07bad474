//! Coalescing of invalidation notifications.

use std::collections::BTreeSet;
use std::time::Duration;

use tokio::time::Instant;

use crate::compute::ComputedKey;

/// Collects invalidated keys until no new invalidation arrived for a quiescence window.
///
/// Each consumer owns its own delayer. Every [`notify`](Self::notify) of a key that is not
/// pending yet pushes the deadline out to `now + window`. Once it passes, [`ready`](Self::ready)
/// hands out all collected keys as one batch. A zero window emits every batch immediately.
#[derive(Debug)]
pub struct UpdateDelayer {
    window: Duration,
    pending: BTreeSet<ComputedKey>,
    deadline: Option<Instant>,
}

impl UpdateDelayer {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            pending: BTreeSet::new(),
            deadline: None,
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Records that `key` was invalidated.
    pub fn notify(&mut self, key: ComputedKey) {
        if self.pending.insert(key) {
            self.deadline = Some(Instant::now() + self.window);
        }
    }

    /// Records a number of invalidated keys at once.
    pub fn notify_all(&mut self, keys: impl IntoIterator<Item = ComputedKey>) {
        let before = self.pending.len();
        self.pending.extend(keys);
        if self.pending.len() > before {
            self.deadline = Some(Instant::now() + self.window);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Waits for the quiescence window to pass and returns the coalesced batch.
    ///
    /// Never resolves while nothing is pending. This is cancel safe: dropping the future keeps
    /// all pending keys for the next call.
    pub async fn ready(&mut self) -> Vec<ComputedKey> {
        let Some(deadline) = self.deadline else {
            return std::future::pending().await;
        };
        if !self.window.is_zero() {
            tokio::time::sleep_until(deadline).await;
        }
        self.take()
    }

    /// Drains all pending keys without waiting.
    pub fn take(&mut self) -> Vec<ComputedKey> {
        self.deadline = None;
        std::mem::take(&mut self.pending).into_iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time;

    use super::*;

    fn key(name: &str) -> ComputedKey {
        ComputedKey::unit("test", name)
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_is_coalesced() {
        let mut delayer = UpdateDelayer::new(Duration::from_millis(100));
        let start = Instant::now();

        delayer.notify(key("k1"));
        time::advance(Duration::from_millis(30)).await;
        delayer.notify(key("k2"));
        time::advance(Duration::from_millis(30)).await;
        delayer.notify_all([key("k3"), key("k1")]);

        let batch = delayer.ready().await;
        assert_eq!(batch, vec![key("k1"), key("k2"), key("k3")]);
        // The window restarts with every notification.
        assert!(start.elapsed() >= Duration::from_millis(160));
        assert!(delayer.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_spaced_invalidations_are_separate() {
        let mut delayer = UpdateDelayer::new(Duration::from_millis(100));

        delayer.notify(key("k1"));
        let first = delayer.ready().await;
        time::advance(Duration::from_millis(200)).await;
        delayer.notify(key("k2"));
        let second = delayer.ready().await;

        assert_eq!(first, vec![key("k1")]);
        assert_eq!(second, vec![key("k2")]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_window_is_immediate() {
        let mut delayer = UpdateDelayer::new(Duration::ZERO);
        let start = Instant::now();

        delayer.notify(key("k1"));
        assert_eq!(delayer.ready().await, vec![key("k1")]);
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ready_is_cancel_safe() {
        let mut delayer = UpdateDelayer::new(Duration::from_millis(100));
        delayer.notify(key("k1"));

        let timed_out = time::timeout(Duration::from_millis(50), delayer.ready()).await;
        assert!(timed_out.is_err());

        delayer.notify(key("k2"));
        assert_eq!(delayer.ready().await, vec![key("k1"), key("k2")]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_nothing_pending_never_resolves() {
        let mut delayer = UpdateDelayer::new(Duration::from_millis(100));
        let timed_out = time::timeout(Duration::from_secs(10), delayer.ready()).await;
        assert!(timed_out.is_err());
    }
}
