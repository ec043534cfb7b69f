//! Key pool facade
//!
//! Ties the persistent store to the active-key cache. Reads go through the
//! cache; every write that can change which keys are active, or whether they
//! are cooling, marks the affected provider dirty.

use std::sync::Arc;

use tracing::{debug, info};

use crate::cache::KeyCache;
use crate::error::Result;
use crate::key::{Key, KeyStatus};
use crate::store::{KeyPage, KeyQuery, KeyStore};

/// Upper bound on keys loaded per provider refresh.
pub const DEFAULT_QUERY_LIMIT: usize = 1000;

pub struct KeyPool {
    store: Arc<dyn KeyStore>,
    cache: Arc<dyn KeyCache>,
    query_limit: usize,
}

impl KeyPool {
    pub fn new(store: Arc<dyn KeyStore>, cache: Arc<dyn KeyCache>, query_limit: usize) -> Self {
        Self {
            store,
            cache,
            query_limit: query_limit.max(1),
        }
    }

    /// Active keys for a provider, served from cache when fresh.
    ///
    /// The list is capped at the query limit and in random order, so very
    /// large pools are sampled rather than loaded whole.
    pub async fn active_keys(&self, provider: &str) -> Result<Arc<Vec<Key>>> {
        if let Some(keys) = self.cache.get(provider) {
            return Ok(keys);
        }
        let keys = Arc::new(self.store.list_active(provider, self.query_limit).await?);
        metrics::counter!("pool_cache_reloads_total", "provider" => provider.to_string())
            .increment(1);
        debug!(provider, keys = keys.len(), "active keys reloaded");
        self.cache.put(provider, Arc::clone(&keys));
        Ok(keys)
    }

    /// Set a key's status and invalidate the provider's cache entry.
    ///
    /// Returns `false` when the key is unknown or already has `status`; the
    /// cache is left alone and nothing is counted in that case.
    pub async fn set_status(&self, provider: &str, key_id: &str, status: KeyStatus) -> Result<bool> {
        let changed = self.store.set_status(key_id, status).await?;
        if changed {
            self.cache.invalidate(provider);
            if status == KeyStatus::Blocked {
                metrics::counter!("pool_keys_blocked_total", "provider" => provider.to_string())
                    .increment(1);
            }
            info!(key_id, provider, status = status.as_str(), "key status updated");
        } else {
            debug!(key_id, provider, status = status.as_str(), "status unchanged");
        }
        Ok(changed)
    }

    /// Start a model cooldown unless one is already running.
    ///
    /// The cache is only invalidated when the write was applied; a no-op
    /// means a fresher caller already set the window.
    pub async fn set_model_cooldown(
        &self,
        provider: &str,
        key_id: &str,
        model: &str,
        seconds: u64,
        now: i64,
    ) -> Result<bool> {
        let seconds = i64::try_from(seconds).unwrap_or(i64::MAX / 2);
        let applied = self
            .store
            .set_model_cooldown_if_available(key_id, model, seconds, now)
            .await?;
        if applied {
            self.cache.invalidate(provider);
        } else {
            debug!(key_id, provider, model, "key already cooling, cooldown not extended");
        }
        Ok(applied)
    }

    pub async fn list_keys(&self, query: &KeyQuery) -> Result<KeyPage> {
        self.store.list_keys(query).await
    }

    pub async fn get_key(&self, id: &str) -> Result<Option<Key>> {
        self.store.get(id).await
    }

    /// Register keys for a provider. Blank entries are skipped; duplicates
    /// are ignored by the store. Returns the number inserted.
    pub async fn add_keys(&self, provider: &str, secrets: &[String], remark: &str, now: i64) -> Result<u64> {
        let cleaned: Vec<String> = secrets
            .iter()
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        if cleaned.is_empty() {
            return Ok(0);
        }
        let inserted = self.store.add_keys(provider, &cleaned, remark, now).await?;
        if inserted > 0 {
            self.cache.invalidate(provider);
        }
        info!(provider, submitted = cleaned.len(), inserted, "keys added");
        Ok(inserted)
    }

    pub async fn delete_keys(&self, ids: &[String]) -> Result<u64> {
        let deleted = self.store.delete_keys(ids).await?;
        if deleted > 0 {
            // ids do not say which providers they belonged to
            self.cache.invalidate_all();
        }
        info!(requested = ids.len(), deleted, "keys deleted");
        Ok(deleted)
    }

    pub async fn delete_blocked(&self, provider: &str) -> Result<u64> {
        let deleted = self.store.delete_blocked(provider).await?;
        info!(provider, deleted, "blocked keys deleted");
        Ok(deleted)
    }

    /// Number of providers with a cached active-key list.
    pub fn cached_providers(&self) -> usize {
        self.cache.len()
    }
}
