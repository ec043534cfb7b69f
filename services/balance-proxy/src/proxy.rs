//! Key-rotating dispatch loop
//!
//! Receives `/api/<provider>/...` requests, authenticates the caller, picks a
//! pooled key for the requested model and forwards the request. Failures the
//! key is responsible for rotate to another key:
//!
//! - 2xx: success, the key's rate-limit streak is reset
//! - 400 with an invalid-key reason, 401, 403: key blocked
//! - 429: model cooldown on the key (escalated after repeated 429s)
//! - 5xx or no response: backoff, same candidates
//! - anything else: returned to the caller
//!
//! Store writes are deferred so the next attempt does not wait on them.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use axum::body::{Body, Bytes};
use axum::http::header::{CONTENT_LENGTH, CONTENT_TYPE, HOST, RETRY_AFTER};
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use common::Secret;
use key_pool::{
    CooldownDecision, CooldownPolicy, Deferred, DeferredTracker, FailureCounter, Key, KeyPool,
    KeyStatus, select_at,
};
use provider::{AuthHeader, ErrorCode, UnifiedError};
use tracing::{debug, error, info, instrument, warn};

use crate::backoff::Backoff;
use crate::error::{Error, Result};
use crate::metrics;
use crate::request::{self, Route, Target};

/// Headers to strip before forwarding (hop-by-hop per RFC 2616 Section 13.5.1)
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

const REQUEST_ID_HEADER: &str = "x-request-id";

/// Retry loop knobs, resolved from `[dispatch]`.
#[derive(Debug, Clone, Copy)]
pub struct DispatchSettings {
    pub max_attempts: u32,
    pub candidate_floor: usize,
    pub normalize_errors: bool,
    pub backoff: Backoff,
}

/// Shared state passed to the proxy handler via axum State extractor
#[derive(Clone)]
pub struct ProxyState {
    pub client: reqwest::Client,
    /// Gateway base URL
    pub upstream_url: String,
    /// Providers called directly: name -> base URL ending in `/`
    pub custom_providers: Arc<HashMap<String, String>>,
    pub timeout: Duration,
    pub max_body_bytes: usize,
    pub auth_keys: Arc<Vec<Secret<String>>>,
    pub pool: Arc<KeyPool>,
    pub failures: Arc<dyn FailureCounter>,
    pub cooldowns: CooldownPolicy,
    pub deferred: DeferredTracker,
    pub settings: DispatchSettings,
    pub requests_total: Arc<AtomicU64>,
    pub errors_total: Arc<AtomicU64>,
    pub in_flight: Arc<AtomicU64>,
}

/// Outcome of one proxied request plus the store writes it queued.
pub struct Dispatched {
    pub result: Result<Response>,
    pub attempts: u32,
    pub writes: Vec<Deferred>,
}

/// Decrements the in-flight gauge when the handler returns or is dropped.
struct InFlightGuard(Arc<AtomicU64>);

impl InFlightGuard {
    fn enter(counter: &Arc<AtomicU64>) -> Self {
        counter.fetch_add(1, Ordering::Relaxed);
        Self(Arc::clone(counter))
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

/// JSON error response: {"error":{"type":"proxy_error","message":"...","request_id":"req_..."}}
pub fn error_response(status: StatusCode, message: &str, request_id: &str) -> Response {
    let body = serde_json::json!({
        "error": {
            "type": "proxy_error",
            "message": message,
            "request_id": request_id,
        }
    });
    (
        status,
        [(CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
        .into_response()
}

/// Proxy an inbound request through the key pool.
///
/// Deferred store writes are detached; they finish on their own and are
/// drained at shutdown.
#[instrument(skip_all, fields(request_id = %request_id, method = %request.method(), path = %request.uri().path()))]
pub async fn proxy_request(
    state: &ProxyState,
    request: axum::http::Request<Body>,
    request_id: String,
) -> Response {
    state.requests_total.fetch_add(1, Ordering::Relaxed);
    let _in_flight = InFlightGuard::enter(&state.in_flight);
    let started = Instant::now();
    let method = request.method().to_string();

    let dispatched = dispatch(state, request, &request_id).await;
    for write in dispatched.writes {
        write.detach();
    }

    let response = match dispatched.result {
        Ok(response) => response,
        Err(e) => {
            state.errors_total.fetch_add(1, Ordering::Relaxed);
            match &e {
                Error::Store(_) | Error::RetriesExhausted => {
                    error!(error = %e, attempts = dispatched.attempts, "request failed")
                }
                _ => info!(error = %e, "request rejected"),
            }
            error_response(e.status(), &e.to_string(), &request_id)
        }
    };

    metrics::record_request(
        response.status().as_u16(),
        &method,
        started.elapsed().as_secs_f64(),
    );
    response
}

/// Parse, authenticate and forward one request.
pub async fn dispatch(
    state: &ProxyState,
    request: axum::http::Request<Body>,
    request_id: &str,
) -> Dispatched {
    let mut writes = Vec::new();
    let mut attempts = 0;
    let result = match Inbound::parse(state, request).await {
        Ok(inbound) => forward(state, &inbound, request_id, &mut attempts, &mut writes).await,
        Err(e) => Err(e),
    };
    Dispatched {
        result,
        attempts,
        writes,
    }
}

/// Inbound request reduced to what the loop needs.
struct Inbound {
    method: Method,
    headers: HeaderMap,
    body: Bytes,
    route: Route,
    target: Target,
}

impl Inbound {
    async fn parse(state: &ProxyState, request: axum::http::Request<Body>) -> Result<Self> {
        let route = Route::from_uri(request.uri()).ok_or(Error::ModelNotFound)?;
        if !request::authenticate(request.headers(), &route.provider, &state.auth_keys) {
            return Err(Error::InvalidAuthKey);
        }

        let (parts, body) = request.into_parts();
        let body = axum::body::to_bytes(body, state.max_body_bytes)
            .await
            .map_err(|e| Error::InvalidBody(e.to_string()))?;

        let model = request::extract_model(&parts.method, &body, &route.resource)
            .ok_or(Error::ModelNotFound)?;
        let target = request::resolve_target(&route.provider, model)?;

        Ok(Self {
            method: parts.method,
            headers: parts.headers,
            body,
            route,
            target,
        })
    }
}

/// Where and how a request is sent upstream.
struct Upstream {
    url: String,
    auth: AuthHeader,
}

impl Upstream {
    fn resolve(state: &ProxyState, route: &Route) -> Self {
        if let Some(base_url) = state.custom_providers.get(&route.provider) {
            return Self {
                url: format!("{base_url}{}", route.without_provider()),
                auth: AuthHeader::BEARER,
            };
        }
        Self {
            url: format!(
                "{}/{}",
                state.upstream_url.trim_end_matches('/'),
                route.resource
            ),
            auth: AuthHeader::for_provider(&route.provider),
        }
    }
}

async fn forward(
    state: &ProxyState,
    inbound: &Inbound,
    request_id: &str,
    attempts: &mut u32,
    writes: &mut Vec<Deferred>,
) -> Result<Response> {
    let target = &inbound.target;
    let mut candidates = state.pool.active_keys(&target.provider).await?;
    if candidates.is_empty() {
        warn!(provider = %target.provider, "no active keys");
        return Err(Error::NoActiveKeys);
    }

    let upstream = Upstream::resolve(state, &inbound.route);
    let mut base_headers = forwardable_headers(&inbound.headers, request_id);
    // The caller's access key never reaches the provider.
    base_headers.remove(AuthHeader::for_provider(&inbound.route.provider).name);
    let settings = state.settings;

    for attempt in 0..settings.max_attempts {
        let now = Utc::now();
        let Some(key) = select_at(&candidates, &target.model, now.timestamp()).cloned() else {
            break;
        };
        *attempts = attempt + 1;

        let Ok(auth_value) = HeaderValue::from_str(&upstream.auth.value_for(&key.key)) else {
            warn!(key_id = %key.id, key = %key.masked(), "key is not a valid header value");
            writes.push(block_key(state, target, &key));
            drop_candidate(&mut candidates, &key.id, settings.candidate_floor);
            continue;
        };
        let mut headers = base_headers.clone();
        headers.insert(HeaderName::from_static(upstream.auth.name), auth_value);

        debug!(
            attempt,
            key_id = %key.id,
            provider = %target.provider,
            model = %target.model,
            "dispatching"
        );

        let sent = state
            .client
            .request(inbound.method.clone(), &upstream.url)
            .headers(headers)
            .timeout(state.timeout)
            .body(inbound.body.clone())
            .send()
            .await;

        let response = match sent {
            Ok(response) => response,
            Err(e) => {
                metrics::record_upstream_error(ErrorCode::NetworkError);
                warn!(
                    attempt,
                    key_id = %key.id,
                    timeout = e.is_timeout(),
                    error = %e,
                    "upstream request failed"
                );
                pause(settings, attempt).await;
                continue;
            }
        };

        let status = response.status();
        if status.is_success() {
            state.failures.reset(&key.id);
            metrics::record_attempts(*attempts);
            return Ok(stream_response(response, request_id));
        }

        match status.as_u16() {
            400 => {
                let (headers, body) = read_failure(response, state.max_body_bytes).await;
                let unified = provider::classify(&inbound.route.provider, 400, &body);
                if unified.is_key_invalid() {
                    warn!(key_id = %key.id, key = %key.masked(), message = %unified.message, "invalid key");
                    writes.push(block_key(state, target, &key));
                    drop_candidate(&mut candidates, &key.id, settings.candidate_floor);
                    continue;
                }
                metrics::record_attempts(*attempts);
                return Ok(terminal_response(status, &headers, body, &unified, settings, request_id));
            }
            401 | 403 => {
                warn!(
                    key_id = %key.id,
                    key = %key.masked(),
                    status = status.as_u16(),
                    "key rejected by provider"
                );
                writes.push(block_key(state, target, &key));
                drop_candidate(&mut candidates, &key.id, settings.candidate_floor);
            }
            429 => {
                let (headers, body) = read_failure(response, state.max_body_bytes).await;
                let unified = provider::classify(&inbound.route.provider, 429, &body);
                let header_secs = headers
                    .get(RETRY_AFTER)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.trim().parse::<u64>().ok());
                let decision = state.cooldowns.on_rate_limited(
                    state.failures.as_ref(),
                    &key.id,
                    &target.provider,
                    unified.retry_after_seconds,
                    header_secs,
                    now,
                );
                warn!(
                    key_id = %key.id,
                    model = %target.model,
                    seconds = decision.seconds,
                    source = decision.source.as_str(),
                    "rate limited, cooling key"
                );
                writes.push(cool_key(state, target, &key, decision, now.timestamp()));
                drop_candidate(&mut candidates, &key.id, settings.candidate_floor);
            }
            s if s >= 500 => {
                metrics::record_upstream_error(ErrorCode::from_status(s));
                warn!(attempt, key_id = %key.id, status = s, "upstream server error");
                pause(settings, attempt).await;
            }
            _ => {
                let (headers, body) = read_failure(response, state.max_body_bytes).await;
                let unified = provider::classify(&inbound.route.provider, status.as_u16(), &body);
                metrics::record_attempts(*attempts);
                return Ok(terminal_response(status, &headers, body, &unified, settings, request_id));
            }
        }
    }

    metrics::record_attempts(*attempts);
    Err(Error::RetriesExhausted)
}

/// Sleep the backoff delay unless this was the last attempt.
async fn pause(settings: DispatchSettings, attempt: u32) {
    if attempt + 1 < settings.max_attempts {
        tokio::time::sleep(settings.backoff.delay(attempt)).await;
    }
}

/// Remove a failed key from this request's candidates while more than
/// `floor` remain. The shared cached list is copied on first removal.
fn drop_candidate(candidates: &mut Arc<Vec<Key>>, key_id: &str, floor: usize) {
    if candidates.len() > floor {
        Arc::make_mut(candidates).retain(|k| k.id != key_id);
    }
}

fn block_key(state: &ProxyState, target: &Target, key: &Key) -> Deferred {
    let pool = Arc::clone(&state.pool);
    let provider = target.provider.clone();
    let key_id = key.id.clone();
    state.deferred.spawn("block_key", async move {
        pool.set_status(&provider, &key_id, KeyStatus::Blocked)
            .await
            .map(|_| ())
    })
}

/// Write a model cooldown; only a write that was applied is counted.
fn cool_key(
    state: &ProxyState,
    target: &Target,
    key: &Key,
    decision: CooldownDecision,
    now: i64,
) -> Deferred {
    let pool = Arc::clone(&state.pool);
    let provider = target.provider.clone();
    let model = target.model.clone();
    let key_id = key.id.clone();
    state.deferred.spawn("set_model_cooldown", async move {
        let applied = pool
            .set_model_cooldown(&provider, &key_id, &model, decision.seconds, now)
            .await?;
        if applied {
            metrics::record_cooldown(&provider, decision.escalated());
        }
        Ok(())
    })
}

/// Inbound headers safe to send upstream, plus the request id.
fn forwardable_headers(inbound: &HeaderMap, request_id: &str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (name, value) in inbound {
        if is_hop_by_hop(name.as_str()) || name == HOST || name == CONTENT_LENGTH {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }
    if let Ok(value) = HeaderValue::from_str(request_id) {
        headers.insert(HeaderName::from_static(REQUEST_ID_HEADER), value);
    }
    headers
}

/// Buffer a failure response for classification, keeping at most `limit`
/// bytes of its body.
async fn read_failure(mut response: reqwest::Response, limit: usize) -> (HeaderMap, Bytes) {
    let headers = response.headers().clone();
    let mut body = Vec::new();
    loop {
        match response.chunk().await {
            Ok(Some(chunk)) => {
                let room = limit.saturating_sub(body.len());
                if chunk.len() > room {
                    body.extend_from_slice(&chunk[..room]);
                    debug!(limit, "upstream error body truncated");
                    break;
                }
                body.extend_from_slice(&chunk);
            }
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, "failed to read upstream error body");
                break;
            }
        }
    }
    (headers, Bytes::from(body))
}

/// Stream a successful upstream response back without buffering it.
fn stream_response(response: reqwest::Response, request_id: &str) -> Response {
    let mut builder = Response::builder().status(response.status());
    for (name, value) in response.headers() {
        if !is_hop_by_hop(name.as_str()) {
            builder = builder.header(name, value);
        }
    }
    builder
        .body(Body::from_stream(response.bytes_stream()))
        .unwrap_or_else(|e| {
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                &format!("response build error: {e}"),
                request_id,
            )
        })
}

/// Response for a failure retrying cannot fix: the provider's own response,
/// or the unified error body when normalization is on.
fn terminal_response(
    status: StatusCode,
    headers: &HeaderMap,
    body: Bytes,
    unified: &UnifiedError,
    settings: DispatchSettings,
    request_id: &str,
) -> Response {
    info!(
        status = status.as_u16(),
        code = unified.code.as_str(),
        "terminal upstream error"
    );
    if settings.normalize_errors {
        return (
            status,
            [(CONTENT_TYPE, "application/json")],
            unified.to_json(),
        )
            .into_response();
    }
    // The buffered body may be truncated, so its length is not the upstream's.
    let mut builder = Response::builder().status(status);
    for (name, value) in headers {
        if !is_hop_by_hop(name.as_str()) && name != CONTENT_LENGTH {
            builder = builder.header(name, value);
        }
    }
    builder.body(Body::from(body)).unwrap_or_else(|e| {
        error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            &format!("response build error: {e}"),
            request_id,
        )
    })
}

/// Check if a header is hop-by-hop (should be stripped before forwarding)
pub fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP_HEADERS
        .iter()
        .any(|h| h.eq_ignore_ascii_case(name))
}
