//! Key data model

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Lifecycle status of a key. `Blocked` is terminal until the key is deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyStatus {
    Active,
    Blocked,
}

impl KeyStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            KeyStatus::Active => "active",
            KeyStatus::Blocked => "blocked",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "active" => Some(KeyStatus::Active),
            "blocked" => Some(KeyStatus::Blocked),
            _ => None,
        }
    }
}

/// Cooldown window for one model on one key. Timestamps are unix seconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelCooling {
    pub end_at: i64,
    /// Cumulative seconds this model has spent cooling on this key.
    pub total_seconds: i64,
}

/// A provider credential registered with the pool.
#[derive(Debug, Clone, PartialEq)]
pub struct Key {
    pub id: String,
    pub key: String,
    pub provider: String,
    pub status: KeyStatus,
    pub remark: String,
    pub model_coolings: HashMap<String, ModelCooling>,
    pub total_cooling_seconds: i64,
    pub created_at: i64,
}

impl Key {
    /// A fresh active key with a generated id.
    pub fn new(provider: &str, key: &str, remark: &str, created_at: i64) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            key: key.to_string(),
            provider: provider.to_string(),
            status: KeyStatus::Active,
            remark: remark.to_string(),
            model_coolings: HashMap::new(),
            total_cooling_seconds: 0,
            created_at,
        }
    }

    /// End of the cooldown window for `model`, if one was ever set.
    pub fn cooling_end(&self, model: &str) -> Option<i64> {
        self.model_coolings.get(model).map(|c| c.end_at)
    }

    /// A key is usable for a model when it has no cooldown for it or the
    /// cooldown has already ended.
    pub fn is_usable_for(&self, model: &str, now: i64) -> bool {
        self.cooling_end(model).is_none_or(|end_at| end_at <= now)
    }

    /// Secret value safe for logs.
    pub fn masked(&self) -> String {
        common::mask_key(&self.key)
    }
}
