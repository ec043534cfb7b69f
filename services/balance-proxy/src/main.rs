//! Balance Proxy
//!
//! Single-binary Rust service that:
//! 1. Loads a pool of provider API keys from SQLite
//! 2. Accepts `/api/<provider>/...` requests from callers holding an access key
//! 3. Forwards each request with a pooled key, rotating keys on auth failures
//!    and rate limits
//! 4. Serves a key management API on a separate admin listener

mod admin;
mod backoff;
mod config;
mod error;
mod metrics;
mod proxy;
mod request;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::Router;
use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get};
use key_pool::{ActiveKeyCache, DeferredTracker, KeyPool, LocalFailureCounter, SqliteKeyStore};
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::admin::AdminState;
use crate::config::Config;
use crate::metrics::ServiceMetrics;
use crate::proxy::{DispatchSettings, ProxyState};

/// How long in-flight requests and deferred writes get after a shutdown signal.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Shared application state accessible from all handlers
#[derive(Clone)]
struct AppState {
    proxy: ProxyState,
    metrics: ServiceMetrics,
    prometheus: PrometheusHandle,
}

/// Build the axum router with all routes and shared state.
///
/// Applies a concurrency limit layer based on `max_connections`.
fn build_router(state: AppState, max_connections: usize) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/api/{*rest}", any(proxy_handler))
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_connections))
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and LOG_LEVEL / RUST_LOG support
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("starting balance-proxy");

    // Install Prometheus metrics recorder before any metrics are emitted
    let prometheus_handle = metrics::install_recorder();

    // CLI: simple --config flag parsing
    let args: Vec<String> = std::env::args().collect();
    let cli_config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str());

    let config_path = Config::resolve_path(cli_config_path);
    info!(path = %config_path.display(), "loading configuration");

    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    info!(
        listen_addr = %config.proxy.listen_addr,
        upstream_url = %config.proxy.upstream_url,
        custom_providers = config.custom_providers.len(),
        max_attempts = config.dispatch.max_attempts,
        "configuration loaded"
    );
    if config.proxy.auth_keys.is_empty() {
        warn!("no access keys configured (AUTH_KEY or auth_keys_file), every proxy request will be rejected");
    }

    let store = SqliteKeyStore::connect(&config.store.database_url)
        .await
        .with_context(|| format!("failed to open key store {}", config.store.database_url))?;
    let cache = ActiveKeyCache::new(
        Duration::from_secs(config.cache.ttl_secs),
        config.cache.max_providers,
    );
    let pool = Arc::new(KeyPool::new(
        Arc::new(store),
        Arc::new(cache),
        config.cache.query_limit,
    ));
    let failures = Arc::new(LocalFailureCounter::new(config.failures.to_counter_config()));
    let deferred = DeferredTracker::new();

    let custom_providers: HashMap<String, String> = config
        .custom_providers
        .iter()
        .map(|p| {
            let base = p.base_url.trim_end_matches('/');
            (p.name.clone(), format!("{base}/"))
        })
        .collect();

    let client = reqwest::Client::builder()
        .build()
        .context("failed to build HTTP client")?;

    let metrics = ServiceMetrics::new();

    let proxy_state = ProxyState {
        client,
        upstream_url: config.proxy.upstream_url.clone(),
        custom_providers: Arc::new(custom_providers),
        timeout: Duration::from_secs(config.proxy.timeout_secs),
        max_body_bytes: config.proxy.max_body_bytes,
        auth_keys: Arc::new(config.proxy.auth_keys),
        pool: Arc::clone(&pool),
        failures: failures.clone(),
        cooldowns: config.dispatch.cooldown_policy(),
        deferred: deferred.clone(),
        settings: DispatchSettings {
            max_attempts: config.dispatch.max_attempts,
            candidate_floor: config.dispatch.candidate_floor,
            normalize_errors: config.dispatch.normalize_errors,
            backoff: config.dispatch.backoff.to_backoff(),
        },
        requests_total: metrics.requests_total.clone(),
        errors_total: metrics.errors_total.clone(),
        in_flight: metrics.in_flight.clone(),
    };

    let app_state = AppState {
        proxy: proxy_state,
        metrics: metrics.clone(),
        prometheus: prometheus_handle,
    };

    let app = build_router(app_state, config.proxy.max_connections);

    let listen_addr = config.proxy.listen_addr;
    let listener = TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind to {listen_addr}"))?;
    info!(addr = %listen_addr, "accepting proxy requests");

    // Admin API on its own listener, stopped together with the proxy
    let (admin_shutdown_tx, admin_shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let admin_handle = match &config.admin {
        Some(admin) => {
            let admin_listener = TcpListener::bind(admin.listen_addr)
                .await
                .with_context(|| format!("failed to bind admin API to {}", admin.listen_addr))?;
            let admin_app =
                admin::build_admin_router(AdminState::new(pool, failures, deferred.clone()));
            info!(addr = %admin.listen_addr, "admin API listening");
            Some(tokio::spawn(async move {
                axum::serve(admin_listener, admin_app)
                    .with_graceful_shutdown(async {
                        let _ = admin_shutdown_rx.await;
                    })
                    .await
            }))
        }
        None => {
            info!("admin API disabled");
            None
        }
    };

    let in_flight = metrics.in_flight.clone();

    // Graceful shutdown with drain timeout:
    // 1. shutdown_signal() fires on SIGTERM/SIGINT
    // 2. axum stops accepting new connections and drains in-flight requests
    // 3. pending deferred store writes get the rest of the same deadline
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await
    });

    shutdown_signal().await;

    let _ = shutdown_tx.send(());
    let _ = admin_shutdown_tx.send(());

    let drain = async {
        match server_handle.await {
            Ok(Ok(())) => info!("all in-flight requests drained"),
            Ok(Err(e)) => error!(error = %e, "server error during shutdown"),
            Err(e) => error!(error = %e, "server task panicked"),
        }
        if let Some(handle) = admin_handle {
            match handle.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!(error = %e, "admin server error during shutdown"),
                Err(e) => error!(error = %e, "admin server task panicked"),
            }
        }
        deferred.drained().await;
    };

    // The drain timeout starts at signal receipt
    if tokio::time::timeout(DRAIN_TIMEOUT, drain).await.is_err() {
        warn!(
            remaining = in_flight.load(Ordering::Relaxed),
            pending_writes = deferred.pending(),
            drain_timeout_secs = DRAIN_TIMEOUT.as_secs(),
            "drain timeout exceeded, forcing shutdown"
        );
    }

    info!("shutdown complete");
    Ok(())
}

/// Health endpoint: status, uptime and request counters.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let uptime = state.metrics.started_at.elapsed().as_secs();
    let requests = state.metrics.requests_total.load(Ordering::Relaxed);
    let errors = state.metrics.errors_total.load(Ordering::Relaxed);

    let body = serde_json::json!({
        "status": "healthy",
        "uptime_seconds": uptime,
        "requests_served": requests,
        "errors_total": errors,
        "in_flight": state.metrics.in_flight.load(Ordering::Relaxed),
        "pending_writes": state.proxy.deferred.pending(),
    });

    (
        axum::http::StatusCode::OK,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
}

/// Prometheus metrics endpoint, text exposition format.
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        axum::http::StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        state.prometheus.render(),
    )
}

/// Proxy handler for `/api/<provider>/...`.
async fn proxy_handler(
    State(state): State<AppState>,
    request: axum::http::Request<axum::body::Body>,
) -> Response {
    let request_id = format!("req_{}", uuid::Uuid::new_v4().as_simple());
    proxy::proxy_request(&state.proxy, request, request_id).await
}

/// Wait for SIGTERM or SIGINT for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use common::Secret;
    use key_pool::{CooldownPolicy, MemoryKeyStore};
    use tower::ServiceExt;

    /// PrometheusHandle without installing a global recorder.
    fn test_prometheus_handle() -> PrometheusHandle {
        let recorder = metrics_exporter_prometheus::PrometheusBuilder::new().build_recorder();
        recorder.handle()
    }

    fn test_app_state(upstream_url: &str, keys: &[(&str, &str)]) -> AppState {
        let metrics = ServiceMetrics::new();
        let keys = keys
            .iter()
            .map(|(provider, secret)| key_pool::Key::new(provider, secret, "", 0))
            .collect();
        let pool = Arc::new(KeyPool::new(
            Arc::new(MemoryKeyStore::with_keys(keys)),
            Arc::new(ActiveKeyCache::new(Duration::from_secs(60), 100)),
            1000,
        ));
        AppState {
            proxy: ProxyState {
                client: reqwest::Client::new(),
                upstream_url: upstream_url.to_string(),
                custom_providers: Arc::new(HashMap::new()),
                timeout: Duration::from_secs(5),
                max_body_bytes: 1024,
                auth_keys: Arc::new(vec![Secret::new("access".to_string())]),
                pool,
                failures: Arc::new(LocalFailureCounter::default()),
                cooldowns: CooldownPolicy::default(),
                deferred: DeferredTracker::new(),
                settings: DispatchSettings {
                    max_attempts: 3,
                    candidate_floor: 1,
                    normalize_errors: false,
                    backoff: backoff::Backoff {
                        initial: Duration::from_millis(1),
                        max: Duration::from_millis(2),
                        multiplier: 2.0,
                        jitter: 0.0,
                    },
                },
                requests_total: metrics.requests_total.clone(),
                errors_total: metrics.errors_total.clone(),
                in_flight: metrics.in_flight.clone(),
            },
            metrics,
            prometheus: test_prometheus_handle(),
        }
    }

    async fn start_ok_upstream() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        tokio::spawn(async move {
            let app = axum::Router::new().fallback(|| async {
                (StatusCode::OK, [("x-upstream", "mock")], r#"{"ok":true}"#)
            });
            axum::serve(listener, app).await.unwrap();
        });
        url
    }

    #[tokio::test]
    async fn health_endpoint_returns_json() {
        let state = test_app_state("http://unused", &[]);
        state
            .metrics
            .requests_total
            .fetch_add(5, Ordering::Relaxed);

        let app = build_router(state, 1000);
        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["status"], "healthy");
        assert_eq!(json["requests_served"], 5);
        assert!(json["uptime_seconds"].is_u64());
        assert_eq!(json["pending_writes"], 0);
    }

    #[tokio::test]
    async fn metrics_endpoint_returns_prometheus_format() {
        let app = build_router(test_app_state("http://unused", &[]), 1000);
        let response = app
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let content_type = response
            .headers()
            .get("content-type")
            .unwrap()
            .to_str()
            .unwrap();
        assert!(content_type.contains("text/plain"));
    }

    #[tokio::test]
    async fn api_route_proxies_with_pooled_key() {
        let upstream = start_ok_upstream().await;
        let state = test_app_state(&upstream, &[("openai", "sk-pooled")]);
        let requests_total = state.metrics.requests_total.clone();
        let app = build_router(state, 1000);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/openai/v1/chat/completions")
                    .method("POST")
                    .header("authorization", "Bearer access")
                    .body(Body::from(r#"{"model":"gpt-4o-mini"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers().get("x-upstream").unwrap(), "mock");
        assert_eq!(requests_total.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn paths_outside_api_are_not_proxied() {
        let app = build_router(test_app_state("http://unused", &[]), 1000);
        let response = app
            .oneshot(Request::builder().uri("/v1/chat/completions").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn oversized_body_is_rejected_with_request_id() {
        let state = test_app_state("http://unused", &[("openai", "sk-1")]);
        let errors_total = state.metrics.errors_total.clone();
        let app = build_router(state, 1000);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/openai/v1/chat/completions")
                    .method("POST")
                    .header("authorization", "Bearer access")
                    .body(Body::from(vec![b'x'; 2048]))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["error"]["type"], "proxy_error");
        assert!(json["error"]["request_id"].as_str().unwrap().starts_with("req_"));
        assert_eq!(errors_total.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn concurrency_limit_queues_excess_requests() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let upstream_url = format!("http://{}", listener.local_addr().unwrap());
        tokio::spawn(async move {
            let app = axum::Router::new().fallback(|| async {
                tokio::time::sleep(Duration::from_millis(200)).await;
                (StatusCode::OK, "slow")
            });
            axum::serve(listener, app).await.unwrap();
        });

        let state = test_app_state(&upstream_url, &[("openai", "sk-1")]);
        let app = build_router(state, 1);

        let test_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let test_url = format!("http://{}", test_listener.local_addr().unwrap());
        tokio::spawn(async move {
            axum::serve(test_listener, app).await.unwrap();
        });

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .unwrap();
        let send = |path: &str| {
            client
                .post(format!("{test_url}/api/openai/{path}"))
                .header("authorization", "Bearer access")
                .body(r#"{"model":"gpt-4o"}"#)
                .send()
        };

        let (r1, r2) = tokio::join!(send("slow1"), send("slow2"));
        let (s1, s2) = (r1.unwrap().status(), r2.unwrap().status());
        assert!(
            s1.is_success() && s2.is_success(),
            "excess requests are queued, not rejected. s1={s1}, s2={s2}"
        );
    }
}
