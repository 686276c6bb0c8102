//! Readiness barrier.
//!
//! Counts distinct workers that have signalled ready and resolves once the
//! target is reached. A worker signalling twice counts once. Once resolved the
//! barrier stays resolved.

use clio_core::WorkerId;
use std::collections::HashSet;
use std::sync::{Mutex, PoisonError};
use tokio::sync::watch;

/// Resolves once `target` distinct workers have been observed
#[derive(Debug)]
pub struct ReadinessBarrier {
    target: usize,
    seen: Mutex<HashSet<WorkerId>>,
    ready: watch::Sender<bool>,
}

impl ReadinessBarrier {
    /// Create a barrier waiting for `target` workers
    #[must_use]
    pub fn new(target: usize) -> Self {
        let (ready, _) = watch::channel(target == 0);
        Self {
            target,
            seen: Mutex::new(HashSet::new()),
            ready,
        }
    }

    /// Number of workers the barrier waits for
    #[must_use]
    pub fn target(&self) -> usize {
        self.target
    }

    /// Record a ready signal. Returns whether the barrier is now resolved.
    pub fn observe(&self, worker: WorkerId) -> bool {
        let mut seen = self.seen.lock().unwrap_or_else(PoisonError::into_inner);
        seen.insert(worker);
        if seen.len() >= self.target && !*self.ready.borrow() {
            self.ready.send_replace(true);
        }
        *self.ready.borrow()
    }

    /// Distinct workers seen so far
    #[must_use]
    pub fn seen_count(&self) -> usize {
        self.seen
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Whether the barrier has resolved
    #[must_use]
    pub fn is_ready(&self) -> bool {
        *self.ready.borrow()
    }

    /// Wait until resolved
    pub async fn wait(&self) {
        let mut rx = self.ready.subscribe();
        // The sender lives in `self`, so the channel cannot close while we wait.
        let _ = rx.wait_for(|ready| *ready).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_zero_target_is_ready() {
        assert!(ReadinessBarrier::new(0).is_ready());
    }

    #[test]
    fn test_duplicate_signals_count_once() {
        let barrier = ReadinessBarrier::new(2);
        let a = WorkerId::new();
        assert!(!barrier.observe(a));
        assert!(!barrier.observe(a));
        assert_eq!(barrier.seen_count(), 1);
        assert!(barrier.observe(WorkerId::new()));
    }

    #[tokio::test]
    async fn test_wait_resolves_after_target() {
        let barrier = Arc::new(ReadinessBarrier::new(3));
        let waiter = {
            let barrier = Arc::clone(&barrier);
            tokio::spawn(async move { barrier.wait().await })
        };
        for _ in 0..3 {
            barrier.observe(WorkerId::new());
        }
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_wait_blocks_when_short() {
        let barrier = ReadinessBarrier::new(2);
        barrier.observe(WorkerId::new());
        let waited = tokio::time::timeout(Duration::from_millis(50), barrier.wait()).await;
        assert!(waited.is_err());
    }

    proptest! {
        #[test]
        fn prop_resolves_iff_enough_distinct(target in 0usize..8, picks in prop::collection::vec(0usize..8, 0..32)) {
            let pool: Vec<WorkerId> = (0..8u8).map(|i| WorkerId::from_bytes([i; 16])).collect();
            let barrier = ReadinessBarrier::new(target);
            let mut distinct = HashSet::new();
            for pick in picks {
                distinct.insert(pick);
                let resolved = barrier.observe(pool[pick]);
                prop_assert_eq!(resolved, distinct.len() >= target);
            }
            prop_assert_eq!(barrier.is_ready(), distinct.len() >= target);
        }
    }
}
