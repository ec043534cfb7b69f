//! Persistent key storage
//!
//! The store is the single source of truth for key status and per-model
//! cooldowns. Everything else in this crate (cache, failure counters) is
//! derived state that can be lost without corrupting anything.
//!
//! `set_model_cooldown_if_available` must be a single conditional write at
//! the storage layer. Two requests racing on a stale cache snapshot may both
//! call it; only the first may take effect.

mod memory;
mod sqlite;

pub use memory::MemoryKeyStore;
pub use sqlite::SqliteKeyStore;

use std::future::Future;
use std::pin::Pin;

use serde::Deserialize;

use crate::error::Result;
use crate::key::{Key, KeyStatus};

/// Rows per multi-row insert statement.
pub const BATCH_INSERT_SIZE: usize = 15;

/// Boxed future returned by [`KeyStore`] methods.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Column used to order admin listings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortBy {
    #[default]
    #[serde(alias = "createdAt")]
    CreatedAt,
    #[serde(alias = "totalCoolingSeconds")]
    TotalCoolingSeconds,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

/// Filter, sort and pagination for admin listings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct KeyQuery {
    pub provider: Option<String>,
    pub status: Option<KeyStatus>,
    /// Substring match on the key value or remark.
    pub q: Option<String>,
    pub sort_by: SortBy,
    pub sort_order: SortOrder,
    /// 1-based page number.
    pub page: u32,
    pub page_size: u32,
}

impl Default for KeyQuery {
    fn default() -> Self {
        Self {
            provider: None,
            status: None,
            q: None,
            sort_by: SortBy::default(),
            sort_order: SortOrder::default(),
            page: 1,
            page_size: 20,
        }
    }
}

impl KeyQuery {
    pub(crate) fn offset(&self) -> u64 {
        u64::from(self.page.max(1) - 1) * u64::from(self.limit())
    }

    pub(crate) fn limit(&self) -> u32 {
        self.page_size.clamp(1, 1000)
    }

    pub(crate) fn search(&self) -> Option<&str> {
        self.q.as_deref().map(str::trim).filter(|q| !q.is_empty())
    }
}

/// One page of an admin listing plus the unpaginated total.
#[derive(Debug, Clone)]
pub struct KeyPage {
    pub keys: Vec<Key>,
    pub total: u64,
}

/// Persistent store for keys.
///
/// Uses `Pin<Box<dyn Future>>` return types so the pool can hold an
/// `Arc<dyn KeyStore>`.
pub trait KeyStore: Send + Sync {
    /// Up to `limit` active keys for a provider, in no particular order.
    fn list_active<'a>(&'a self, provider: &'a str, limit: usize) -> StoreFuture<'a, Vec<Key>>;

    fn get<'a>(&'a self, id: &'a str) -> StoreFuture<'a, Option<Key>>;

    /// Status write. Returns `true` only when the status actually changed;
    /// rewriting the current status or an unknown id is a no-op.
    fn set_status<'a>(&'a self, id: &'a str, status: KeyStatus) -> StoreFuture<'a, bool>;

    /// Start a cooldown of `seconds` for `model`, but only if the key is not
    /// already cooling for that model at `now`. Also adds `seconds` to the
    /// per-model and per-key totals. Returns whether the write was applied;
    /// `false` is not an error.
    fn set_model_cooldown_if_available<'a>(
        &'a self,
        id: &'a str,
        model: &'a str,
        seconds: i64,
        now: i64,
    ) -> StoreFuture<'a, bool>;

    fn list_keys<'a>(&'a self, query: &'a KeyQuery) -> StoreFuture<'a, KeyPage>;

    /// Insert active keys, skipping any `(provider, key)` pair that already
    /// exists. Returns the number of rows inserted.
    fn add_keys<'a>(
        &'a self,
        provider: &'a str,
        secrets: &'a [String],
        remark: &'a str,
        now: i64,
    ) -> StoreFuture<'a, u64>;

    fn delete_keys<'a>(&'a self, ids: &'a [String]) -> StoreFuture<'a, u64>;

    /// Delete every blocked key of a provider.
    fn delete_blocked<'a>(&'a self, provider: &'a str) -> StoreFuture<'a, u64>;
}
