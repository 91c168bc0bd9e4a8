//! Keyed async locks
//!
//! One `tokio::sync::Mutex` per key, created on demand. Users are serialized
//! through `lock`, while session leases use `try_lock` so that a concurrent
//! action is rejected instead of queued.

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

#[derive(Default)]
pub struct KeyedLocks {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, key: &str) -> Arc<Mutex<()>> {
        // Clone the Arc out so the shard guard is dropped before awaiting.
        self.locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    pub async fn lock(&self, key: &str) -> OwnedMutexGuard<()> {
        self.entry(key).lock_owned().await
    }

    pub fn try_lock(&self, key: &str) -> Option<OwnedMutexGuard<()>> {
        self.entry(key).try_lock_owned().ok()
    }

    pub fn is_locked(&self, key: &str) -> bool {
        match self.locks.get(key) {
            Some(lock) => lock.try_lock().is_err(),
            None => false,
        }
    }

    /// Drop entries nobody holds or waits on.
    pub fn prune(&self) -> usize {
        let before = self.locks.len();
        self.locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        before - self.locks.len()
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_try_lock_rejects_second_holder() {
        let locks = KeyedLocks::new();
        let guard = locks.try_lock("session:1").unwrap();
        assert!(locks.try_lock("session:1").is_none());
        assert!(locks.try_lock("session:2").is_some());
        assert!(locks.is_locked("session:1"));

        drop(guard);
        assert!(locks.try_lock("session:1").is_some());
    }

    #[tokio::test]
    async fn test_lock_serializes_holders() {
        let locks = Arc::new(KeyedLocks::new());
        let counter = Arc::new(std::sync::atomic::AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let locks = locks.clone();
            let counter = counter.clone();
            handles.push(tokio::spawn(async move {
                let _guard = locks.lock("user:1").await;
                let seen = counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(2)).await;
                assert_eq!(counter.load(std::sync::atomic::Ordering::SeqCst), seen + 1);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(counter.load(std::sync::atomic::Ordering::SeqCst), 8);
    }

    #[tokio::test]
    async fn test_prune_keeps_held_locks() {
        let locks = KeyedLocks::new();
        let _held = locks.lock("a").await;
        drop(locks.lock("b").await);

        assert_eq!(locks.prune(), 1);
        assert_eq!(locks.len(), 1);
    }
}
