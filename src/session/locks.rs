use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

const PRUNE_THRESHOLD: usize = 1024;

/// One async mutex per key, created on demand.
///
/// Slots nobody holds or waits on are dropped once the map grows past a threshold, so the map
/// tracks roughly the set of keys in use rather than every key ever seen.
#[derive(Debug, Default)]
pub struct KeyedLocks {
    slots: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

pub type KeyGuard = OwnedMutexGuard<()>;

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, key: &str) -> KeyGuard {
        let slot = {
            let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
            if slots.len() >= PRUNE_THRESHOLD {
                // strong_count == 1: only the map references it
                slots.retain(|_, slot| Arc::strong_count(slot) > 1);
            }
            slots
                .entry(key.to_owned())
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone()
        };

        slot.lock_owned().await
    }

    /// Non-blocking variant; `None` if another task holds the key.
    #[cfg(test)]
    pub fn try_lock(&self, key: &str) -> Option<KeyGuard> {
        let slot = {
            let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
            slots
                .entry(key.to_owned())
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone()
        };

        slot.try_lock_owned().ok()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
