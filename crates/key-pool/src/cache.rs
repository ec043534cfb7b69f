//! Active-key cache
//!
//! Per-provider memoization of the active key list. An entry is served while
//! it is younger than the TTL and not dirty; any write that changes a key's
//! status or cooldown marks the provider dirty so the next read reloads.
//!
//! There is no reload coalescing. Concurrent misses for the same provider each
//! hit the store and the last one to finish wins.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::time::Instant;

use crate::key::Key;

/// Capability interface so a shared cache backend can replace the local one.
pub trait KeyCache: Send + Sync {
    /// Cached keys if the entry exists, is fresh, and is not dirty.
    fn get(&self, provider: &str) -> Option<Arc<Vec<Key>>>;

    /// Replace the provider's entry with a freshly loaded list.
    fn put(&self, provider: &str, keys: Arc<Vec<Key>>);

    /// Mark the provider dirty without reloading.
    fn invalidate(&self, provider: &str);

    /// Mark every provider dirty.
    fn invalidate_all(&self);

    /// Number of providers currently held.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

struct Entry {
    keys: Arc<Vec<Key>>,
    loaded_at: Instant,
    last_used: Instant,
    dirty: bool,
}

/// Process-local [`KeyCache`] with a TTL, a dirty flag, and LRU eviction once
/// more than `max_providers` providers are cached.
pub struct ActiveKeyCache {
    ttl: Duration,
    max_providers: usize,
    entries: Mutex<HashMap<String, Entry>>,
}

impl ActiveKeyCache {
    pub fn new(ttl: Duration, max_providers: usize) -> Self {
        Self {
            ttl,
            max_providers: max_providers.max(1),
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl KeyCache for ActiveKeyCache {
    fn get(&self, provider: &str) -> Option<Arc<Vec<Key>>> {
        let now = Instant::now();
        let mut entries = self.lock();
        let entry = entries.get_mut(provider)?;
        if entry.dirty || now.duration_since(entry.loaded_at) >= self.ttl {
            return None;
        }
        entry.last_used = now;
        Some(Arc::clone(&entry.keys))
    }

    fn put(&self, provider: &str, keys: Arc<Vec<Key>>) {
        let now = Instant::now();
        let mut entries = self.lock();
        if !entries.contains_key(provider) && entries.len() >= self.max_providers {
            let oldest = entries
                .iter()
                .min_by_key(|(_, e)| e.last_used)
                .map(|(name, _)| name.clone());
            if let Some(oldest) = oldest {
                entries.remove(&oldest);
            }
        }
        entries.insert(
            provider.to_string(),
            Entry {
                keys,
                loaded_at: now,
                last_used: now,
                dirty: false,
            },
        );
    }

    fn invalidate(&self, provider: &str) {
        if let Some(entry) = self.lock().get_mut(provider) {
            entry.dirty = true;
        }
    }

    fn invalidate_all(&self) {
        for entry in self.lock().values_mut() {
            entry.dirty = true;
        }
    }

    fn len(&self) -> usize {
        self.lock().len()
    }
}
