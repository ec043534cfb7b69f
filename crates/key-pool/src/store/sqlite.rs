//! SQLite-backed key store using sqlx.
//!
//! Schema: `keys(id, key, provider, status, remark, model_coolings, total_cooling_seconds, created_at)`
//! with a unique constraint on `(provider, key)` so bulk inserts are idempotent.
//! `model_coolings` is a JSON object `{ "<model>": { "end_at": i64, "total_seconds": i64 } }`
//! updated in place with SQLite's JSON functions.

use std::collections::HashMap;
use std::str::FromStr;

use sqlx::{
    SqlitePool,
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
};
use tracing::debug;

use super::{BATCH_INSERT_SIZE, KeyPage, KeyQuery, KeyStore, SortBy, SortOrder, StoreFuture};
use crate::error::{Error, Result};
use crate::key::{Key, KeyStatus};

const COLUMNS: &str =
    "id, key, provider, status, remark, model_coolings, total_cooling_seconds, created_at";

/// Ids per `DELETE ... WHERE id IN (...)` statement.
const DELETE_CHUNK: usize = 100;

type KeyRow = (String, String, String, String, String, String, i64, i64);

/// A persistent [`KeyStore`] backed by `SQLite`.
pub struct SqliteKeyStore {
    pool: SqlitePool,
}

impl SqliteKeyStore {
    /// Connects to a `SQLite` database (e.g. `"sqlite:./keys.db"` or `"sqlite::memory:"`).
    ///
    /// Creates the database file if it does not exist and runs migrations.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let opts = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        // Every connection to an in-memory database is a separate database.
        let max_connections = if database_url.contains(":memory:") { 1 } else { 5 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(opts)
            .await?;
        Self::migrate(&pool).await?;
        Ok(Self { pool })
    }

    async fn migrate(pool: &SqlitePool) -> Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS keys (
                id                    TEXT    PRIMARY KEY,
                key                   TEXT    NOT NULL,
                provider              TEXT    NOT NULL,
                status                TEXT    NOT NULL DEFAULT 'active',
                remark                TEXT    NOT NULL DEFAULT '',
                model_coolings        TEXT    NOT NULL DEFAULT '{}',
                total_cooling_seconds INTEGER NOT NULL DEFAULT 0,
                created_at            INTEGER NOT NULL DEFAULT (unixepoch()),
                UNIQUE (provider, key)
            )",
        )
        .execute(pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_keys_provider_status ON keys(provider, status)",
        )
        .execute(pool)
        .await?;

        Ok(())
    }
}

fn row_to_key(row: KeyRow) -> Result<Key> {
    let (id, key, provider, status, remark, coolings, total_cooling_seconds, created_at) = row;
    let status = KeyStatus::parse(&status)
        .ok_or_else(|| Error::InvalidInput(format!("unknown status {status:?} for key {id}")))?;
    let model_coolings = if coolings.trim().is_empty() {
        HashMap::new()
    } else {
        serde_json::from_str(&coolings)?
    };
    Ok(Key {
        id,
        key,
        provider,
        status,
        remark,
        model_coolings,
        total_cooling_seconds,
        created_at,
    })
}

/// JSON path addressing one model inside `model_coolings`.
fn model_path(model: &str) -> Result<String> {
    if model.is_empty() || model.contains('"') {
        return Err(Error::InvalidInput(format!("unsupported model name {model:?}")));
    }
    Ok(format!("$.\"{model}\""))
}

fn placeholders(row: &str, n: usize) -> String {
    vec![row; n].join(", ")
}

impl KeyStore for SqliteKeyStore {
    fn list_active<'a>(&'a self, provider: &'a str, limit: usize) -> StoreFuture<'a, Vec<Key>> {
        Box::pin(async move {
            let rows: Vec<KeyRow> = sqlx::query_as(&format!(
                "SELECT {COLUMNS} FROM keys
                 WHERE provider = ? AND status = 'active'
                 ORDER BY RANDOM() LIMIT ?"
            ))
            .bind(provider)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;
            rows.into_iter().map(row_to_key).collect()
        })
    }

    fn get<'a>(&'a self, id: &'a str) -> StoreFuture<'a, Option<Key>> {
        Box::pin(async move {
            let row: Option<KeyRow> =
                sqlx::query_as(&format!("SELECT {COLUMNS} FROM keys WHERE id = ?"))
                    .bind(id)
                    .fetch_optional(&self.pool)
                    .await?;
            row.map(row_to_key).transpose()
        })
    }

    fn set_status<'a>(&'a self, id: &'a str, status: KeyStatus) -> StoreFuture<'a, bool> {
        Box::pin(async move {
            let result = sqlx::query("UPDATE keys SET status = ? WHERE id = ? AND status <> ?")
                .bind(status.as_str())
                .bind(id)
                .bind(status.as_str())
                .execute(&self.pool)
                .await?;
            Ok(result.rows_affected() > 0)
        })
    }

    fn set_model_cooldown_if_available<'a>(
        &'a self,
        id: &'a str,
        model: &'a str,
        seconds: i64,
        now: i64,
    ) -> StoreFuture<'a, bool> {
        Box::pin(async move {
            let path = model_path(model)?;
            let end_path = format!("{path}.end_at");
            let total_path = format!("{path}.total_seconds");

            // SET expressions read the pre-update row, so the totals below
            // accumulate onto the previous values.
            let result = sqlx::query(
                "UPDATE keys
                 SET model_coolings = json_set(
                         model_coolings, ?,
                         json_object(
                             'end_at', ?,
                             'total_seconds', COALESCE(json_extract(model_coolings, ?), 0) + ?)),
                     total_cooling_seconds = total_cooling_seconds + ?
                 WHERE id = ? AND COALESCE(json_extract(model_coolings, ?), 0) <= ?",
            )
            .bind(&path)
            .bind(now + seconds)
            .bind(&total_path)
            .bind(seconds)
            .bind(seconds)
            .bind(id)
            .bind(&end_path)
            .bind(now)
            .execute(&self.pool)
            .await?;

            let applied = result.rows_affected() > 0;
            debug!(key_id = id, model, seconds, applied, "conditional cooldown write");
            Ok(applied)
        })
    }

    fn list_keys<'a>(&'a self, query: &'a KeyQuery) -> StoreFuture<'a, KeyPage> {
        Box::pin(async move {
            let mut filter = String::from(" WHERE 1 = 1");
            let mut binds: Vec<String> = Vec::new();
            if let Some(provider) = &query.provider {
                filter.push_str(" AND provider = ?");
                binds.push(provider.clone());
            }
            if let Some(status) = query.status {
                filter.push_str(" AND status = ?");
                binds.push(status.as_str().to_string());
            }
            if let Some(search) = query.search() {
                filter.push_str(" AND (key LIKE ? OR remark LIKE ?)");
                let pattern = format!("%{search}%");
                binds.push(pattern.clone());
                binds.push(pattern);
            }

            let count_sql = format!("SELECT COUNT(*) FROM keys{filter}");
            let mut count = sqlx::query_scalar::<_, i64>(&count_sql);
            for value in &binds {
                count = count.bind(value.as_str());
            }
            let total = count.fetch_one(&self.pool).await?;

            let column = match query.sort_by {
                SortBy::CreatedAt => "created_at",
                SortBy::TotalCoolingSeconds => "total_cooling_seconds",
            };
            let direction = match query.sort_order {
                SortOrder::Asc => "ASC",
                SortOrder::Desc => "DESC",
            };
            let page_sql = format!(
                "SELECT {COLUMNS} FROM keys{filter}
                 ORDER BY {column} {direction}, id {direction}
                 LIMIT ? OFFSET ?"
            );
            let mut page = sqlx::query_as::<_, KeyRow>(&page_sql);
            for value in &binds {
                page = page.bind(value.as_str());
            }
            let rows = page
                .bind(i64::from(query.limit()))
                .bind(query.offset() as i64)
                .fetch_all(&self.pool)
                .await?;

            Ok(KeyPage {
                keys: rows.into_iter().map(row_to_key).collect::<Result<_>>()?,
                total: total.max(0) as u64,
            })
        })
    }

    fn add_keys<'a>(
        &'a self,
        provider: &'a str,
        secrets: &'a [String],
        remark: &'a str,
        now: i64,
    ) -> StoreFuture<'a, u64> {
        Box::pin(async move {
            let mut inserted = 0;
            for chunk in secrets.chunks(BATCH_INSERT_SIZE) {
                let sql = format!(
                    "INSERT OR IGNORE INTO keys ({COLUMNS}) VALUES {}",
                    placeholders("(?, ?, ?, 'active', ?, '{}', 0, ?)", chunk.len())
                );
                let mut insert = sqlx::query(&sql);
                for secret in chunk {
                    insert = insert
                        .bind(uuid::Uuid::new_v4().to_string())
                        .bind(secret.as_str())
                        .bind(provider)
                        .bind(remark)
                        .bind(now);
                }
                inserted += insert.execute(&self.pool).await?.rows_affected();
            }
            Ok(inserted)
        })
    }

    fn delete_keys<'a>(&'a self, ids: &'a [String]) -> StoreFuture<'a, u64> {
        Box::pin(async move {
            let mut deleted = 0;
            for chunk in ids.chunks(DELETE_CHUNK) {
                let sql = format!(
                    "DELETE FROM keys WHERE id IN ({})",
                    placeholders("?", chunk.len())
                );
                let mut delete = sqlx::query(&sql);
                for id in chunk {
                    delete = delete.bind(id.as_str());
                }
                deleted += delete.execute(&self.pool).await?.rows_affected();
            }
            Ok(deleted)
        })
    }

    fn delete_blocked<'a>(&'a self, provider: &'a str) -> StoreFuture<'a, u64> {
        Box::pin(async move {
            let result = sqlx::query("DELETE FROM keys WHERE provider = ? AND status = 'blocked'")
                .bind(provider)
                .execute(&self.pool)
                .await?;
            Ok(result.rows_affected())
        })
    }
}
