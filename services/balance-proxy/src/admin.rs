//! Admin API for key management
//!
//! Runs on a separate listener (`[admin] listen_addr`) so it is never
//! reachable through the proxy port. Key secrets are always masked.
//!
//! Endpoints:
//! - GET    /admin/keys            list keys (filter, sort, paginate)
//! - POST   /admin/keys            bulk add keys for a provider
//! - DELETE /admin/keys            delete keys by id
//! - DELETE /admin/keys/blocked    delete a provider's blocked keys
//! - GET    /admin/keys/{id}       one key with its model cooldowns
//! - GET    /admin/pool            in-memory pool state

use std::sync::Arc;

use axum::Router;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::http::header::CONTENT_TYPE;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get};
use chrono::Utc;
use key_pool::{DeferredTracker, FailureCounter, Key, KeyPool, KeyQuery};
use serde::Deserialize;
use tracing::warn;

/// Shared state for admin API handlers.
#[derive(Clone)]
pub struct AdminState {
    pool: Arc<KeyPool>,
    failures: Arc<dyn FailureCounter>,
    deferred: DeferredTracker,
}

impl AdminState {
    pub fn new(
        pool: Arc<KeyPool>,
        failures: Arc<dyn FailureCounter>,
        deferred: DeferredTracker,
    ) -> Self {
        Self {
            pool,
            failures,
            deferred,
        }
    }
}

/// Build the admin axum router with all key management endpoints.
pub fn build_admin_router(state: AdminState) -> Router {
    Router::new()
        .route(
            "/admin/keys",
            get(list_keys).post(add_keys).delete(delete_keys),
        )
        .route("/admin/keys/blocked", delete(delete_blocked))
        .route("/admin/keys/{id}", get(get_key))
        .route("/admin/pool", get(pool_status))
        .with_state(state)
}

fn json_response(status: StatusCode, body: serde_json::Value) -> Response {
    (status, [(CONTENT_TYPE, "application/json")], body.to_string()).into_response()
}

fn store_error(e: key_pool::Error) -> Response {
    let status = match e {
        key_pool::Error::InvalidInput(_) => StatusCode::BAD_REQUEST,
        key_pool::Error::NotFound(_) => StatusCode::NOT_FOUND,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    warn!(error = %e, "admin store operation failed");
    json_response(status, serde_json::json!({ "error": e.to_string() }))
}

/// Key as shown to operators.
fn key_view(key: &Key) -> serde_json::Value {
    serde_json::json!({
        "id": key.id,
        "key": key.masked(),
        "provider": key.provider,
        "status": key.status.as_str(),
        "remark": key.remark,
        "model_coolings": key.model_coolings,
        "total_cooling_seconds": key.total_cooling_seconds,
        "created_at": key.created_at,
    })
}

/// GET /admin/keys
async fn list_keys(State(state): State<AdminState>, Query(query): Query<KeyQuery>) -> Response {
    match state.pool.list_keys(&query).await {
        Ok(page) => json_response(
            StatusCode::OK,
            serde_json::json!({
                "keys": page.keys.iter().map(key_view).collect::<Vec<_>>(),
                "total": page.total,
                "page": query.page.max(1),
                "page_size": query.page_size,
            }),
        ),
        Err(e) => store_error(e),
    }
}

/// Keys as pasted by an operator (newline or comma separated) or as a list.
#[derive(Deserialize)]
#[serde(untagged)]
enum KeyList {
    Text(String),
    List(Vec<String>),
}

impl KeyList {
    fn into_vec(self) -> Vec<String> {
        match self {
            KeyList::Text(text) => text
                .split(['\n', ','])
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
            KeyList::List(list) => list,
        }
    }
}

#[derive(Deserialize)]
struct AddKeysRequest {
    provider: String,
    keys: KeyList,
    #[serde(default)]
    remark: String,
}

/// POST /admin/keys
async fn add_keys(
    State(state): State<AdminState>,
    axum::Json(body): axum::Json<AddKeysRequest>,
) -> Response {
    let provider = body.provider.trim();
    if provider.is_empty() || provider.contains('/') {
        return json_response(
            StatusCode::BAD_REQUEST,
            serde_json::json!({ "error": "provider must be a non-empty path segment" }),
        );
    }
    let keys = body.keys.into_vec();
    let submitted = keys.len();
    match state
        .pool
        .add_keys(provider, &keys, body.remark.trim(), Utc::now().timestamp())
        .await
    {
        Ok(inserted) => json_response(
            StatusCode::OK,
            serde_json::json!({
                "provider": provider,
                "submitted": submitted,
                "inserted": inserted,
            }),
        ),
        Err(e) => store_error(e),
    }
}

#[derive(Deserialize)]
struct DeleteKeysRequest {
    ids: Vec<String>,
}

/// DELETE /admin/keys
async fn delete_keys(
    State(state): State<AdminState>,
    axum::Json(body): axum::Json<DeleteKeysRequest>,
) -> Response {
    match state.pool.delete_keys(&body.ids).await {
        Ok(deleted) => json_response(StatusCode::OK, serde_json::json!({ "deleted": deleted })),
        Err(e) => store_error(e),
    }
}

#[derive(Deserialize)]
struct ProviderParam {
    provider: String,
}

/// DELETE /admin/keys/blocked?provider=
async fn delete_blocked(
    State(state): State<AdminState>,
    Query(param): Query<ProviderParam>,
) -> Response {
    match state.pool.delete_blocked(&param.provider).await {
        Ok(deleted) => json_response(
            StatusCode::OK,
            serde_json::json!({ "provider": param.provider, "deleted": deleted }),
        ),
        Err(e) => store_error(e),
    }
}

/// GET /admin/keys/{id}
async fn get_key(State(state): State<AdminState>, Path(id): Path<String>) -> Response {
    match state.pool.get_key(&id).await {
        Ok(Some(key)) => json_response(StatusCode::OK, key_view(&key)),
        Ok(None) => json_response(
            StatusCode::NOT_FOUND,
            serde_json::json!({ "error": format!("key {id} not found") }),
        ),
        Err(e) => store_error(e),
    }
}

/// GET /admin/pool
async fn pool_status(State(state): State<AdminState>) -> Response {
    json_response(
        StatusCode::OK,
        serde_json::json!({
            "cached_providers": state.pool.cached_providers(),
            "failure_entries": state.failures.len(),
            "pending_writes": state.deferred.pending(),
        }),
    )
}
