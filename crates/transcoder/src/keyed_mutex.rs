//! Async per-key mutual exclusion.
//!
//! Each key maps to its own FIFO-fair `tokio::sync::Mutex`. Callers on the same
//! key queue in arrival order; callers on different keys never contend beyond
//! the short map lookup. Slots are dropped from the map once nobody holds or
//! waits on them.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

type Slot = Arc<AsyncMutex<()>>;

pub struct KeyedMutex<K> {
    slots: Mutex<HashMap<K, Slot>>,
}

impl<K: Eq + Hash + Clone> KeyedMutex<K> {
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Wait for exclusive ownership of `key`.
    ///
    /// Acquiring a key already held by the same call chain deadlocks.
    pub async fn lock(&self, key: &K) -> KeyedGuard<'_, K> {
        let mut guard = KeyedGuard {
            owner: self,
            key: key.clone(),
            slot: self.slot(key),
            held: None,
        };
        let acquire = guard.slot.clone().lock_owned();
        guard.held = Some(acquire.await);
        guard
    }

    /// Run `f` while holding `key`.
    pub async fn with_lock<F, Fut, T>(&self, key: &K, f: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let _guard = self.lock(key).await;
        f().await
    }

    /// Number of keys currently held or waited on.
    pub fn len(&self) -> usize {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn slot(&self, key: &K) -> Slot {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        slots.entry(key.clone()).or_default().clone()
    }

    fn release(&self, key: &K, slot: &Slot) {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        // One reference in the map, one in the releasing guard.
        if Arc::strong_count(slot) == 2
            && slots.get(key).is_some_and(|current| Arc::ptr_eq(current, slot))
        {
            slots.remove(key);
        }
    }
}

impl<K: Eq + Hash + Clone> Default for KeyedMutex<K> {
    fn default() -> Self {
        Self::new()
    }
}

/// Exclusive hold on one key; released on drop.
pub struct KeyedGuard<'a, K: Eq + Hash + Clone> {
    owner: &'a KeyedMutex<K>,
    key: K,
    slot: Slot,
    held: Option<OwnedMutexGuard<()>>,
}

impl<K: Eq + Hash + Clone> Drop for KeyedGuard<'_, K> {
    fn drop(&mut self) {
        self.held.take();
        self.owner.release(&self.key, &self.slot);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn same_key_runs_in_arrival_order() {
        let locks = Arc::new(KeyedMutex::new());
        let order = Arc::new(Mutex::new(Vec::new()));

        let held = locks.lock(&"a").await;
        let mut handles = Vec::new();
        for i in 0..5 {
            let locks = locks.clone();
            let order = order.clone();
            handles.push(tokio::spawn(async move {
                locks
                    .with_lock(&"a", || async {
                        order.lock().unwrap().push(i);
                    })
                    .await;
            }));
            // let each waiter enqueue before the next one is spawned
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(order.lock().unwrap().is_empty());

        drop(held);
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn distinct_keys_do_not_block() {
        let locks = KeyedMutex::new();
        let _a = locks.lock(&"a").await;
        let b = tokio::time::timeout(Duration::from_millis(100), locks.lock(&"b")).await;
        assert!(b.is_ok());
        assert_eq!(locks.len(), 2);
    }

    #[tokio::test]
    async fn same_key_blocks_while_held() {
        let locks = KeyedMutex::new();
        let _a = locks.lock(&"a").await;
        let again = tokio::time::timeout(Duration::from_millis(50), locks.lock(&"a")).await;
        assert!(again.is_err());
    }

    #[tokio::test]
    async fn slots_are_reclaimed() {
        let locks = KeyedMutex::new();
        {
            let _a = locks.lock(&"a").await;
            let _b = locks.lock(&"b").await;
        }
        assert!(locks.is_empty());

        // a waiter that gives up must not pin the slot
        let held = locks.lock(&"a").await;
        let gave_up = tokio::time::timeout(Duration::from_millis(20), locks.lock(&"a")).await;
        assert!(gave_up.is_err());
        drop(held);
        assert!(locks.is_empty());
    }
}
