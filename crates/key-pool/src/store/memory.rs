//! In-memory key store for tests and ephemeral deployments.

use std::sync::{Mutex, MutexGuard};

use super::{KeyPage, KeyQuery, KeyStore, SortBy, SortOrder, StoreFuture};
use crate::error::Result;
use crate::key::{Key, KeyStatus, ModelCooling};

/// Process-local [`KeyStore`]. The conditional cooldown write is atomic
/// because the check and the update happen under one lock.
#[derive(Default)]
pub struct MemoryKeyStore {
    keys: Mutex<Vec<Key>>,
}

impl MemoryKeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the store with fully-formed keys (tests use this to set up cooldowns).
    pub fn with_keys(keys: Vec<Key>) -> Self {
        Self {
            keys: Mutex::new(keys),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Key>> {
        self.keys.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn ready<'a, T: Send + 'a>(value: Result<T>) -> StoreFuture<'a, T> {
    Box::pin(std::future::ready(value))
}

impl KeyStore for MemoryKeyStore {
    fn list_active<'a>(&'a self, provider: &'a str, limit: usize) -> StoreFuture<'a, Vec<Key>> {
        let keys = self
            .lock()
            .iter()
            .filter(|k| k.provider == provider && k.status == KeyStatus::Active)
            .take(limit)
            .cloned()
            .collect();
        ready(Ok(keys))
    }

    fn get<'a>(&'a self, id: &'a str) -> StoreFuture<'a, Option<Key>> {
        let key = self.lock().iter().find(|k| k.id == id).cloned();
        ready(Ok(key))
    }

    fn set_status<'a>(&'a self, id: &'a str, status: KeyStatus) -> StoreFuture<'a, bool> {
        let mut keys = self.lock();
        let changed = match keys.iter_mut().find(|k| k.id == id) {
            Some(key) if key.status != status => {
                key.status = status;
                true
            }
            _ => false,
        };
        ready(Ok(changed))
    }

    fn set_model_cooldown_if_available<'a>(
        &'a self,
        id: &'a str,
        model: &'a str,
        seconds: i64,
        now: i64,
    ) -> StoreFuture<'a, bool> {
        let mut keys = self.lock();
        let Some(key) = keys.iter_mut().find(|k| k.id == id) else {
            return ready(Ok(false));
        };
        if !key.is_usable_for(model, now) {
            return ready(Ok(false));
        }
        let entry = key
            .model_coolings
            .entry(model.to_string())
            .or_insert_with(ModelCooling::default);
        entry.end_at = now + seconds;
        entry.total_seconds += seconds;
        key.total_cooling_seconds += seconds;
        ready(Ok(true))
    }

    fn list_keys<'a>(&'a self, query: &'a KeyQuery) -> StoreFuture<'a, KeyPage> {
        let search = query.search();
        let mut matched: Vec<Key> = self
            .lock()
            .iter()
            .filter(|k| query.provider.as_deref().is_none_or(|p| k.provider == p))
            .filter(|k| query.status.is_none_or(|s| k.status == s))
            .filter(|k| search.is_none_or(|q| k.key.contains(q) || k.remark.contains(q)))
            .cloned()
            .collect();

        matched.sort_by(|a, b| {
            let ord = match query.sort_by {
                SortBy::CreatedAt => a.created_at.cmp(&b.created_at),
                SortBy::TotalCoolingSeconds => a.total_cooling_seconds.cmp(&b.total_cooling_seconds),
            }
            .then_with(|| a.id.cmp(&b.id));
            match query.sort_order {
                SortOrder::Asc => ord,
                SortOrder::Desc => ord.reverse(),
            }
        });

        let total = matched.len() as u64;
        let keys = matched
            .into_iter()
            .skip(query.offset() as usize)
            .take(query.limit() as usize)
            .collect();
        ready(Ok(KeyPage { keys, total }))
    }

    fn add_keys<'a>(
        &'a self,
        provider: &'a str,
        secrets: &'a [String],
        remark: &'a str,
        now: i64,
    ) -> StoreFuture<'a, u64> {
        let mut keys = self.lock();
        let mut inserted = 0;
        for secret in secrets {
            if keys.iter().any(|k| k.provider == provider && &k.key == secret) {
                continue;
            }
            keys.push(Key::new(provider, secret, remark, now));
            inserted += 1;
        }
        ready(Ok(inserted))
    }

    fn delete_keys<'a>(&'a self, ids: &'a [String]) -> StoreFuture<'a, u64> {
        let mut keys = self.lock();
        let before = keys.len();
        keys.retain(|k| !ids.contains(&k.id));
        ready(Ok((before - keys.len()) as u64))
    }

    fn delete_blocked<'a>(&'a self, provider: &'a str) -> StoreFuture<'a, u64> {
        let mut keys = self.lock();
        let before = keys.len();
        keys.retain(|k| !(k.provider == provider && k.status == KeyStatus::Blocked));
        ready(Ok((before - keys.len()) as u64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn conditional_cooldown_matches_sqlite_semantics() {
        let store = MemoryKeyStore::new();
        store
            .add_keys("openai", &["sk-1".to_string()], "", 0)
            .await
            .unwrap();
        let id = store.list_active("openai", 1).await.unwrap()[0].id.clone();

        assert!(store.set_model_cooldown_if_available(&id, "gpt-4o", 65, 100).await.unwrap());
        assert!(!store.set_model_cooldown_if_available(&id, "gpt-4o", 65, 120).await.unwrap());
        let key = store.get(&id).await.unwrap().unwrap();
        assert_eq!(key.model_coolings["gpt-4o"].end_at, 165);
        assert_eq!(key.total_cooling_seconds, 65);

        assert!(store.set_model_cooldown_if_available(&id, "gpt-4o", 10, 165).await.unwrap());
        let key = store.get(&id).await.unwrap().unwrap();
        assert_eq!(key.model_coolings["gpt-4o"].total_seconds, 75);
    }

    #[tokio::test]
    async fn missing_key_is_a_silent_no_op() {
        let store = MemoryKeyStore::new();
        assert!(!store.set_model_cooldown_if_available("nope", "m", 10, 0).await.unwrap());
        assert!(!store.set_status("nope", KeyStatus::Blocked).await.unwrap());
    }

    #[tokio::test]
    async fn repeated_status_write_reports_no_change() {
        let store = MemoryKeyStore::new();
        store.add_keys("openai", &["sk-1".to_string()], "", 0).await.unwrap();
        let id = store.list_active("openai", 1).await.unwrap()[0].id.clone();

        assert!(store.set_status(&id, KeyStatus::Blocked).await.unwrap());
        assert!(!store.set_status(&id, KeyStatus::Blocked).await.unwrap());
        assert!(store.set_status(&id, KeyStatus::Active).await.unwrap());
    }

    #[tokio::test]
    async fn listing_sorts_by_total_cooling() {
        let store = MemoryKeyStore::new();
        let secrets: Vec<String> = ["a", "b", "c"].iter().map(|s| s.to_string()).collect();
        store.add_keys("openai", &secrets, "", 0).await.unwrap();
        let ids: Vec<String> = store
            .list_active("openai", 10)
            .await
            .unwrap()
            .into_iter()
            .map(|k| k.id)
            .collect();
        store.set_model_cooldown_if_available(&ids[1], "m", 50, 0).await.unwrap();
        store.set_model_cooldown_if_available(&ids[2], "m", 10, 0).await.unwrap();

        let page = store
            .list_keys(&KeyQuery {
                sort_by: SortBy::TotalCoolingSeconds,
                ..KeyQuery::default()
            })
            .await
            .unwrap();
        let totals: Vec<i64> = page.keys.iter().map(|k| k.total_cooling_seconds).collect();
        assert_eq!(totals, vec![50, 10, 0]);
    }
}
