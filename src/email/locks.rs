use crate::email::thread::ThreadId;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// One async lock per thread id
///
/// Slow network attempts on one thread never stall unrelated threads.
/// Entries nobody holds are pruned when new locks are handed out.
#[derive(Debug, Clone, Default)]
pub struct ThreadLocks {
    inner: Arc<Mutex<HashMap<ThreadId, Arc<AsyncMutex<()>>>>>,
}

impl ThreadLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, id: &ThreadId) -> Arc<AsyncMutex<()>> {
        let mut map = match self.inner.lock() {
            Ok(map) => map,
            Err(poisoned) => poisoned.into_inner(),
        };
        map.retain(|key, lock| key == id || Arc::strong_count(lock) > 1);
        map.entry(id.clone())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// Wait for exclusive access to the thread
    pub async fn lock(&self, id: &ThreadId) -> OwnedMutexGuard<()> {
        self.entry(id).lock_owned().await
    }

    /// Exclusive access if nobody else holds it
    pub fn try_lock(&self, id: &ThreadId) -> Option<OwnedMutexGuard<()>> {
        self.entry(id).try_lock_owned().ok()
    }

    /// Number of tracked ids
    pub fn len(&self) -> usize {
        match self.inner.lock() {
            Ok(map) => map.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_same_thread_is_exclusive() {
        let locks = ThreadLocks::new();
        let id = ThreadId::generate();

        let guard = locks.lock(&id).await;
        assert!(locks.try_lock(&id).is_none());
        drop(guard);
        assert!(locks.try_lock(&id).is_some());
    }

    #[tokio::test]
    async fn test_other_threads_are_independent() {
        let locks = ThreadLocks::new();
        let a = ThreadId::generate();
        let b = ThreadId::generate();

        let _held = locks.lock(&a).await;
        let other = tokio::time::timeout(Duration::from_millis(100), locks.lock(&b)).await;
        assert!(other.is_ok());
    }

    #[tokio::test]
    async fn test_waiter_proceeds_after_release() {
        let locks = ThreadLocks::new();
        let id = ThreadId::generate();
        let guard = locks.lock(&id).await;

        let waiter = {
            let locks = locks.clone();
            let id = id.clone();
            tokio::spawn(async move {
                let _guard = locks.lock(&id).await;
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
        drop(guard);
        waiter.await.unwrap();
    }

    #[tokio::test]
    async fn test_unused_entries_are_pruned() {
        let locks = ThreadLocks::new();
        for _ in 0..10 {
            let id = ThreadId::generate();
            let _guard = locks.lock(&id).await;
        }
        let _last = locks.lock(&ThreadId::generate()).await;
        assert_eq!(locks.len(), 1);
    }
}
