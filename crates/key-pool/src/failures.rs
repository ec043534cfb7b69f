//! Consecutive rate-limit counter
//!
//! Counts back-to-back 429s per key so the dispatch loop can escalate a key
//! into a long cooldown. The table is bounded: cleanup runs opportunistically
//! on writes once the cleanup interval has elapsed or the table is full. It
//! drops entries older than `max_age`, then, if still above 80% of
//! `max_entries`, the oldest 20%.
//!
//! Counts are instance-local and best-effort. Losing them only delays an
//! escalation.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

/// Capability interface so a shared counter backend can replace the local one.
pub trait FailureCounter: Send + Sync {
    /// Record one more consecutive failure and return the new count.
    fn increment(&self, key_id: &str) -> u32;

    /// Forget the key's streak.
    fn reset(&self, key_id: &str);

    /// Current streak, zero if unknown or expired.
    fn count(&self, key_id: &str) -> u32;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Bounds for [`LocalFailureCounter`].
#[derive(Debug, Clone, Copy)]
pub struct FailureCounterConfig {
    pub max_entries: usize,
    pub max_age: Duration,
    pub cleanup_interval: Duration,
}

impl Default for FailureCounterConfig {
    fn default() -> Self {
        Self {
            max_entries: 10_000,
            max_age: Duration::from_secs(600),
            cleanup_interval: Duration::from_secs(120),
        }
    }
}

struct Entry {
    count: u32,
    updated_at: Instant,
}

struct Inner {
    entries: HashMap<String, Entry>,
    last_cleanup: Instant,
}

pub struct LocalFailureCounter {
    config: FailureCounterConfig,
    inner: Mutex<Inner>,
}

impl LocalFailureCounter {
    pub fn new(config: FailureCounterConfig) -> Self {
        Self {
            config: FailureCounterConfig {
                max_entries: config.max_entries.max(1),
                ..config
            },
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                last_cleanup: Instant::now(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn is_expired(&self, entry: &Entry, now: Instant) -> bool {
        now.duration_since(entry.updated_at) >= self.config.max_age
    }

    fn cleanup(&self, inner: &mut Inner, now: Instant) {
        let before = inner.entries.len();
        let max_age = self.config.max_age;
        inner
            .entries
            .retain(|_, e| now.duration_since(e.updated_at) < max_age);

        let high_water = self.config.max_entries * 4 / 5;
        if inner.entries.len() > high_water {
            let evict = (inner.entries.len() / 5).max(1);
            let mut by_age: Vec<(Instant, String)> = inner
                .entries
                .iter()
                .map(|(id, e)| (e.updated_at, id.clone()))
                .collect();
            by_age.sort_unstable();
            for (_, id) in by_age.into_iter().take(evict) {
                inner.entries.remove(&id);
            }
        }

        inner.last_cleanup = now;
        debug!(
            before,
            after = inner.entries.len(),
            "consecutive failure table cleaned"
        );
    }
}

impl Default for LocalFailureCounter {
    fn default() -> Self {
        Self::new(FailureCounterConfig::default())
    }
}

impl FailureCounter for LocalFailureCounter {
    fn increment(&self, key_id: &str) -> u32 {
        let now = Instant::now();
        let mut inner = self.lock();

        let due = now.duration_since(inner.last_cleanup) >= self.config.cleanup_interval;
        let full = !inner.entries.contains_key(key_id)
            && inner.entries.len() >= self.config.max_entries;
        if due || full {
            self.cleanup(&mut inner, now);
        }

        let max_age = self.config.max_age;
        let entry = inner.entries.entry(key_id.to_string()).or_insert(Entry {
            count: 0,
            updated_at: now,
        });
        if now.duration_since(entry.updated_at) >= max_age {
            entry.count = 0;
        }
        entry.count += 1;
        entry.updated_at = now;
        entry.count
    }

    fn reset(&self, key_id: &str) {
        self.lock().entries.remove(key_id);
    }

    fn count(&self, key_id: &str) -> u32 {
        let now = Instant::now();
        let inner = self.lock();
        match inner.entries.get(key_id) {
            Some(entry) if !self.is_expired(entry, now) => entry.count,
            _ => 0,
        }
    }

    fn len(&self) -> usize {
        self.lock().entries.len()
    }
}
