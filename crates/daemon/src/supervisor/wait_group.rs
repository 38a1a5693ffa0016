//! Completion counter for groups of concurrent tasks.
//!
//! A [`WaitGroup`] counts units of work that are still in flight. Each unit
//! holds a [`WaitGroupGuard`] obtained from [`WaitGroup::enter`]; dropping the
//! guard marks the unit as finished, whether the task returned normally,
//! panicked, or was dropped by the runtime.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::error::Elapsed;

/// A cloneable counter that can be awaited until it reaches zero.
#[derive(Debug, Clone)]
pub struct WaitGroup {
    count: Arc<watch::Sender<usize>>,
}

/// Marks one unit of a [`WaitGroup`] as done when dropped.
#[derive(Debug)]
#[must_use = "dropping the guard immediately marks the unit as done"]
pub struct WaitGroupGuard {
    count: Arc<watch::Sender<usize>>,
}

impl WaitGroup {
    /// Creates an empty wait group.
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(0usize);
        Self {
            count: Arc::new(tx),
        }
    }

    /// Registers one unit of work and returns the guard that completes it.
    pub fn enter(&self) -> WaitGroupGuard {
        self.count.send_modify(|count| *count += 1);
        WaitGroupGuard {
            count: Arc::clone(&self.count),
        }
    }

    /// Returns the number of units still in flight.
    pub fn count(&self) -> usize {
        *self.count.borrow()
    }

    /// Waits until every registered unit is done.
    pub async fn wait(&self) {
        let mut rx = self.count.subscribe();
        // The sender lives as long as `self`, so this cannot fail.
        let _ = rx.wait_for(|count| *count == 0).await;
    }

    /// Waits until every unit is done or `timeout` elapses.
    ///
    /// `None` waits indefinitely.
    pub async fn wait_timeout(&self, timeout: Option<Duration>) -> Result<(), Elapsed> {
        match timeout {
            Some(limit) => tokio::time::timeout(limit, self.wait()).await,
            None => {
                self.wait().await;
                Ok(())
            }
        }
    }
}

impl Default for WaitGroup {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for WaitGroupGuard {
    fn drop(&mut self) {
        self.count
            .send_modify(|count| *count = count.saturating_sub(1));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_empty_group_completes_immediately() {
        let group = WaitGroup::new();
        assert_eq!(group.count(), 0);
        assert!(group
            .wait_timeout(Some(Duration::from_millis(10)))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_guard_drop_completes_unit() {
        let group = WaitGroup::new();
        let guard = group.enter();
        assert_eq!(group.count(), 1);

        drop(guard);
        assert_eq!(group.count(), 0);
        group.wait().await;
    }

    #[tokio::test]
    async fn test_wait_times_out_while_units_pending() {
        let group = WaitGroup::new();
        let _guard = group.enter();

        let result = group.wait_timeout(Some(Duration::from_millis(20))).await;
        assert!(result.is_err());
        assert_eq!(group.count(), 1);
    }

    #[tokio::test]
    async fn test_wait_wakes_when_last_unit_finishes() {
        let group = WaitGroup::new();
        let first = group.enter();
        let second = group.enter();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            drop(first);
            tokio::time::sleep(Duration::from_millis(20)).await;
            drop(second);
        });

        group
            .wait_timeout(Some(Duration::from_secs(2)))
            .await
            .expect("group should drain");
        assert_eq!(group.count(), 0);
    }

    #[tokio::test]
    async fn test_guard_released_on_panic() {
        let group = WaitGroup::new();
        let guard = group.enter();

        let handle = tokio::spawn(async move {
            let _guard = guard;
            panic!("boom");
        });
        assert!(handle.await.is_err());

        assert_eq!(group.count(), 0);
    }

    #[tokio::test]
    async fn test_clones_share_the_counter() {
        let group = WaitGroup::new();
        let clone = group.clone();
        let _guard = clone.enter();
        assert_eq!(group.count(), 1);
    }
}
