//! Per-key async mutexes
//!
//! Mutations touching the same service or routing key must not interleave,
//! while disjoint keys proceed in parallel. [`KeyLocks`] hands out one
//! `tokio::sync::Mutex` per key on demand and forgets it again once the
//! last guard is released.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::OwnedMutexGuard;

type Slots<K> = Arc<Mutex<HashMap<K, Arc<tokio::sync::Mutex<()>>>>>;

/// Lazily created async mutex per key
pub struct KeyLocks<K> {
    slots: Slots<K>,
}

impl<K> KeyLocks<K>
where
    K: Eq + Hash + Clone,
{
    pub fn new() -> Self {
        Self {
            slots: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Wait for exclusive access to `key`
    pub async fn lock(&self, key: &K) -> KeyGuard<K> {
        let slot = {
            let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(slots.entry(key.clone()).or_default())
        };

        let guard = slot.lock_owned().await;

        KeyGuard {
            key: key.clone(),
            slots: Arc::clone(&self.slots),
            guard: Some(guard),
        }
    }

    /// Number of keys currently locked or waited on
    pub fn len(&self) -> usize {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<K> Default for KeyLocks<K>
where
    K: Eq + Hash + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

/// Exclusive access to one key; released on drop
#[derive(Debug)]
pub struct KeyGuard<K>
where
    K: Eq + Hash,
{
    key: K,
    slots: Slots<K>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl<K> Drop for KeyGuard<K>
where
    K: Eq + Hash,
{
    fn drop(&mut self) {
        // Release before pruning so a waiter never sees a removed slot
        self.guard.take();

        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(slot) = slots.get(&self.key) {
            if Arc::strong_count(slot) == 1 {
                slots.remove(&self.key);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio_test::{assert_pending, assert_ready, task};

    use super::*;

    #[tokio::test]
    async fn test_same_key_is_exclusive() {
        let locks = KeyLocks::<String>::new();
        let key = "a".to_string();
        let guard = locks.lock(&key).await;

        let mut waiter = task::spawn(locks.lock(&key));
        assert_pending!(waiter.poll());

        drop(guard);
        assert!(waiter.is_woken());
        let _g = assert_ready!(waiter.poll());
    }

    #[tokio::test]
    async fn test_disjoint_keys_do_not_block() {
        let locks = KeyLocks::<String>::new();
        let _a = locks.lock(&"a".to_string()).await;

        let b = tokio::time::timeout(Duration::from_millis(100), locks.lock(&"b".to_string()))
            .await;
        assert!(b.is_ok());
    }

    #[tokio::test]
    async fn test_slots_are_pruned() {
        let locks = KeyLocks::<u32>::new();
        {
            let _a = locks.lock(&1).await;
            let _b = locks.lock(&2).await;
            assert_eq!(locks.len(), 2);
        }
        assert!(locks.is_empty());
    }
}
