//! Error classifier
//!
//! Maps a provider failure response onto [`UnifiedError`]. Each provider family
//! has its own envelope parser; dispatch is a match on [`ProviderKind`]. Bodies
//! that are not JSON stay `unknown_error` with the raw text retained.
//!
//! Retry hints are returned capped at [`MAX_RETRY_HINT_SECS`] and with
//! [`RETRY_BUFFER_SECS`] already added, so a caller can use
//! `retry_after_seconds` directly as a cooldown.

use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Deserialize;
use serde_json::Value;

use crate::{ErrorCode, ProviderKind, UnifiedError, seconds_until_midnight};

/// Added to every provider-suggested retry delay.
pub const RETRY_BUFFER_SECS: u64 = 2;

/// Upper bound for a provider-suggested retry delay, before the buffer.
pub const MAX_RETRY_HINT_SECS: u64 = 24 * 60 * 60;

/// Turn a provider-suggested delay into a cooldown: capped at
/// [`MAX_RETRY_HINT_SECS`], then [`RETRY_BUFFER_SECS`] added.
pub fn buffered_retry_secs(secs: u64) -> u64 {
    secs.min(MAX_RETRY_HINT_SECS).saturating_add(RETRY_BUFFER_SECS)
}

const GOOGLE_ERROR_INFO: &str = "type.googleapis.com/google.rpc.ErrorInfo";
const GOOGLE_QUOTA_FAILURE: &str = "type.googleapis.com/google.rpc.QuotaFailure";
const GOOGLE_RETRY_INFO: &str = "type.googleapis.com/google.rpc.RetryInfo";

/// "try again in 20s", "Please retry after 5 seconds", "try again in 1.5m"
static RETRY_HINT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)(?:try again in|retry after)\s+(\d+(?:\.\d+)?)\s*(?:(milliseconds?|ms|seconds?|secs?|s|minutes?|mins?|m)\b)?",
    )
    .unwrap_or_else(|e| panic!("retry hint pattern is invalid: {e}"))
});

/// Classify a failure response using the current wall clock.
pub fn classify(provider: &str, status: u16, body: &[u8]) -> UnifiedError {
    classify_at(provider, status, body, Utc::now())
}

/// Classify a failure response as of `now` (used for quota reset arithmetic).
pub fn classify_at(provider: &str, status: u16, body: &[u8], now: DateTime<Utc>) -> UnifiedError {
    let mut unified = UnifiedError::unknown(provider, status, String::from_utf8_lossy(body).into());

    let Ok(parsed) = serde_json::from_slice::<Value>(body) else {
        return unified;
    };
    // Google sometimes wraps the envelope in a one-element array.
    let envelope = match parsed {
        Value::Array(items) => items.into_iter().next().unwrap_or(Value::Null),
        other => other,
    };

    match ProviderKind::from_name(provider) {
        ProviderKind::GoogleAiStudio => parse_google(&mut unified, &envelope, now),
        ProviderKind::Anthropic => parse_anthropic(&mut unified, &envelope),
        ProviderKind::OpenAi | ProviderKind::AzureOpenAi | ProviderKind::Compat => {
            parse_openai(&mut unified, &envelope)
        }
        ProviderKind::ElevenLabs | ProviderKind::Cartesia | ProviderKind::Other => {
            parse_generic(&mut unified, &envelope)
        }
    }

    unified.original = envelope;
    unified
}

// --- Google AI Studio ---

#[derive(Debug, Default, Deserialize)]
struct GoogleEnvelope {
    error: Option<GoogleBody>,
}

#[derive(Debug, Default, Deserialize)]
struct GoogleBody {
    #[serde(default)]
    message: String,
    #[serde(default)]
    details: Vec<GoogleDetail>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GoogleDetail {
    #[serde(rename = "@type", default)]
    type_url: String,
    reason: Option<String>,
    retry_delay: Option<String>,
    #[serde(default)]
    violations: Vec<GoogleViolation>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GoogleViolation {
    #[serde(default)]
    description: String,
    quota_id: Option<String>,
}

impl GoogleBody {
    fn detail(&self, type_url: &str) -> Option<&GoogleDetail> {
        self.details.iter().find(|d| d.type_url == type_url)
    }
}

fn parse_google(unified: &mut UnifiedError, envelope: &Value, now: DateTime<Utc>) {
    let Ok(GoogleEnvelope { error: Some(body) }) = GoogleEnvelope::deserialize(envelope) else {
        return;
    };
    if !body.message.is_empty() {
        unified.message = body.message.clone();
    }

    unified.code = match unified.status {
        400 => {
            let invalid = body
                .detail(GOOGLE_ERROR_INFO)
                .and_then(|d| d.reason.as_deref())
                == Some("API_KEY_INVALID");
            if invalid {
                ErrorCode::InvalidApiKey
            } else {
                ErrorCode::BadRequest
            }
        }
        429 => {
            if let Some(quota) = body.detail(GOOGLE_QUOTA_FAILURE) {
                if let Some(first) = quota.violations.first()
                    && !first.description.is_empty()
                {
                    unified.message = first.description.clone();
                }
                let daily = quota.violations.iter().any(|v| {
                    v.quota_id
                        .as_deref()
                        .is_some_and(|id| id.contains("PerDay"))
                });
                if daily && let Some(tz) = ProviderKind::GoogleAiStudio.quota_reset_timezone() {
                    unified.retry_after_seconds = Some(seconds_until_midnight(tz, now));
                }
            }
            if unified.retry_after_seconds.is_none() {
                unified.retry_after_seconds = body
                    .detail(GOOGLE_RETRY_INFO)
                    .and_then(|d| d.retry_delay.as_deref())
                    .and_then(parse_duration_secs)
                    .map(buffered_retry_secs);
            }
            ErrorCode::RateLimitExceeded
        }
        status => ErrorCode::from_status(status),
    };
}

// --- Anthropic ---

#[derive(Debug, Deserialize)]
struct AnthropicEnvelope {
    error: Option<AnthropicBody>,
}

#[derive(Debug, Deserialize)]
struct AnthropicBody {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    message: String,
}

fn parse_anthropic(unified: &mut UnifiedError, envelope: &Value) {
    let Ok(AnthropicEnvelope { error: Some(body) }) = AnthropicEnvelope::deserialize(envelope)
    else {
        return;
    };
    if !body.message.is_empty() {
        unified.message = body.message.clone();
    }
    unified.code = match body.kind.as_str() {
        "invalid_request_error" => ErrorCode::BadRequest,
        "authentication_error" => ErrorCode::InvalidApiKey,
        "permission_error" => ErrorCode::PermissionDenied,
        "not_found_error" => ErrorCode::NotFound,
        "rate_limit_error" => ErrorCode::RateLimitExceeded,
        "api_error" => ErrorCode::ServerError,
        "overloaded_error" => ErrorCode::ServiceUnavailable,
        _ => ErrorCode::from_status(unified.status),
    };
    if unified.code == ErrorCode::RateLimitExceeded {
        unified.retry_after_seconds = retry_hint(&body.message);
    }
}

// --- OpenAI, Azure OpenAI and the gateway compat endpoint ---

#[derive(Debug, Deserialize)]
struct OpenAiEnvelope {
    error: Option<OpenAiBody>,
}

#[derive(Debug, Deserialize)]
struct OpenAiBody {
    #[serde(default)]
    message: String,
    #[serde(rename = "type", default)]
    kind: Option<String>,
    #[serde(default)]
    code: Option<Value>,
}

impl OpenAiBody {
    fn code_is(&self, expected: &str) -> bool {
        self.code.as_ref().and_then(Value::as_str) == Some(expected)
            || self.kind.as_deref() == Some(expected)
    }
}

fn parse_openai(unified: &mut UnifiedError, envelope: &Value) {
    let Ok(OpenAiEnvelope { error: Some(body) }) = OpenAiEnvelope::deserialize(envelope) else {
        return;
    };
    if !body.message.is_empty() {
        unified.message = body.message.clone();
    }
    unified.code = match unified.status {
        400 | 401 if body.code_is("invalid_api_key") => ErrorCode::InvalidApiKey,
        429 => {
            unified.retry_after_seconds = retry_hint(&body.message);
            if body.code_is("insufficient_quota") {
                unified.message = "Insufficient quota. Please check your billing details.".into();
            }
            ErrorCode::RateLimitExceeded
        }
        status => ErrorCode::from_status(status),
    };
}

// --- Everything else ---

fn parse_generic(unified: &mut UnifiedError, envelope: &Value) {
    let message = envelope
        .pointer("/error/message")
        .or_else(|| envelope.get("message"))
        .or_else(|| envelope.get("detail"))
        .or_else(|| envelope.get("error"))
        .and_then(Value::as_str);
    if let Some(message) = message
        && !message.is_empty()
    {
        unified.message = message.to_string();
    }
    unified.code = ErrorCode::from_status(unified.status);
    if unified.code == ErrorCode::RateLimitExceeded {
        unified.retry_after_seconds = retry_hint(&unified.message);
    }
}

/// Extract a retry delay from a human-readable message, buffer included.
fn retry_hint(message: &str) -> Option<u64> {
    let caps = RETRY_HINT.captures(message)?;
    let value: f64 = caps.get(1)?.as_str().parse().ok()?;
    let unit = caps.get(2).map(|m| m.as_str().to_ascii_lowercase());
    let secs = match unit.as_deref() {
        Some(u) if u.starts_with("ms") || u.starts_with("milli") => value / 1000.0,
        Some(u) if u.starts_with('m') => value * 60.0,
        _ => value,
    };
    // Float to int casts saturate, so an absurd hint lands on the cap.
    Some(buffered_retry_secs(secs.ceil().max(0.0) as u64))
}

/// Parse a protobuf duration string such as `"37s"` or `"1.5s"`, rounding up.
fn parse_duration_secs(raw: &str) -> Option<u64> {
    let value: f64 = raw.trim().trim_end_matches('s').parse().ok()?;
    if !value.is_finite() || value < 0.0 {
        return None;
    }
    Some(value.ceil() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at() -> DateTime<Utc> {
        // 2025-01-15 23:00 PST
        Utc.with_ymd_and_hms(2025, 1, 16, 7, 0, 0).unwrap()
    }

    #[test]
    fn google_retry_info_adds_buffer() {
        let body = r#"{"error":{"code":429,"message":"Resource has been exhausted","status":"RESOURCE_EXHAUSTED","details":[
            {"@type":"type.googleapis.com/google.rpc.QuotaFailure","violations":[{"quotaMetric":"generativelanguage.googleapis.com/generate_content_free_tier_requests","quotaId":"GenerateRequestsPerMinutePerProjectPerModel-FreeTier","description":"per-minute quota exceeded"}]},
            {"@type":"type.googleapis.com/google.rpc.RetryInfo","retryDelay":"37s"}]}}"#;
        let err = classify_at("google-ai-studio", 429, body.as_bytes(), at());
        assert_eq!(err.code, ErrorCode::RateLimitExceeded);
        assert_eq!(err.retry_after_seconds, Some(37 + RETRY_BUFFER_SECS));
        assert_eq!(err.message, "per-minute quota exceeded");
    }

    #[test]
    fn google_daily_quota_waits_until_pacific_midnight() {
        let body = r#"[{"error":{"code":429,"message":"quota","details":[
            {"@type":"type.googleapis.com/google.rpc.QuotaFailure","violations":[{"quotaId":"GenerateRequestsPerDayPerProjectPerModel-FreeTier"}]},
            {"@type":"type.googleapis.com/google.rpc.RetryInfo","retryDelay":"10s"}]}}]"#;
        let err = classify_at("google-ai-studio", 429, body.as_bytes(), at());
        assert_eq!(err.code, ErrorCode::RateLimitExceeded);
        assert_eq!(err.retry_after_seconds, Some(3600));
        // message falls back to the envelope message when the violation has no description
        assert_eq!(err.message, "quota");
    }

    #[test]
    fn google_invalid_key_on_400() {
        let body = r#"[{"error":{"code":400,"message":"API key not valid. Please pass a valid API key.","status":"INVALID_ARGUMENT","details":[
            {"@type":"type.googleapis.com/google.rpc.ErrorInfo","reason":"API_KEY_INVALID","domain":"googleapis.com"}]}}]"#;
        let err = classify("google-ai-studio", 400, body.as_bytes());
        assert_eq!(err.code, ErrorCode::InvalidApiKey);
        assert!(err.is_key_invalid());
    }

    #[test]
    fn google_plain_400_is_bad_request() {
        let body = r#"{"error":{"code":400,"message":"Invalid JSON payload","status":"INVALID_ARGUMENT"}}"#;
        let err = classify("google-ai-studio", 400, body.as_bytes());
        assert_eq!(err.code, ErrorCode::BadRequest);
        assert_eq!(err.message, "Invalid JSON payload");
    }

    #[test]
    fn anthropic_error_types() {
        let cases = [
            ("authentication_error", 401, ErrorCode::InvalidApiKey),
            ("permission_error", 403, ErrorCode::PermissionDenied),
            ("invalid_request_error", 400, ErrorCode::BadRequest),
            ("not_found_error", 404, ErrorCode::NotFound),
            ("api_error", 500, ErrorCode::ServerError),
            ("overloaded_error", 529, ErrorCode::ServiceUnavailable),
        ];
        for (kind, status, expected) in cases {
            let body = format!(r#"{{"type":"error","error":{{"type":"{kind}","message":"m"}}}}"#);
            let err = classify("anthropic", status, body.as_bytes());
            assert_eq!(err.code, expected, "type {kind}");
        }
    }

    #[test]
    fn anthropic_rate_limit_hint() {
        let body = r#"{"type":"error","error":{"type":"rate_limit_error","message":"Rate limited. Please try again in 12 seconds."}}"#;
        let err = classify("anthropic", 429, body.as_bytes());
        assert_eq!(err.code, ErrorCode::RateLimitExceeded);
        assert_eq!(err.retry_after_seconds, Some(12 + RETRY_BUFFER_SECS));
    }

    #[test]
    fn openai_rate_limit_hint_rounds_up() {
        let body = r#"{"error":{"message":"Rate limit reached for gpt-4o. Please try again in 6.5s.","type":"requests","param":null,"code":"rate_limit_exceeded"}}"#;
        let err = classify("openai", 429, body.as_bytes());
        assert_eq!(err.code, ErrorCode::RateLimitExceeded);
        assert_eq!(err.retry_after_seconds, Some(7 + RETRY_BUFFER_SECS));
    }

    #[test]
    fn openai_millisecond_hint() {
        let body = r#"{"error":{"message":"Please try again in 450ms.","type":"tokens","code":"rate_limit_exceeded"}}"#;
        let err = classify("openai", 429, body.as_bytes());
        assert_eq!(err.retry_after_seconds, Some(1 + RETRY_BUFFER_SECS));
    }

    #[test]
    fn azure_retry_after_phrase() {
        let body = r#"{"error":{"code":"429","message":"Requests to the ChatCompletions_Create Operation have exceeded call rate limit. Please retry after 20 seconds."}}"#;
        let err = classify("azure-openai", 429, body.as_bytes());
        assert_eq!(err.retry_after_seconds, Some(20 + RETRY_BUFFER_SECS));
    }

    #[test]
    fn openai_insufficient_quota_rewrites_message() {
        let body = r#"{"error":{"message":"You exceeded your current quota","type":"insufficient_quota","param":null,"code":"insufficient_quota"}}"#;
        let err = classify("openai", 429, body.as_bytes());
        assert_eq!(err.code, ErrorCode::RateLimitExceeded);
        assert!(err.message.starts_with("Insufficient quota"));
        assert!(err.retry_after_seconds.is_none());
    }

    #[test]
    fn openai_invalid_key() {
        let body = r#"{"error":{"message":"Incorrect API key provided","type":"invalid_request_error","param":null,"code":"invalid_api_key"}}"#;
        assert_eq!(
            classify("openai", 401, body.as_bytes()).code,
            ErrorCode::InvalidApiKey
        );
        assert_eq!(
            classify("openai", 400, body.as_bytes()).code,
            ErrorCode::InvalidApiKey
        );
    }

    #[test]
    fn generic_provider_maps_by_status() {
        let body = r#"{"detail":"Too many requests, retry after 3 seconds"}"#;
        let err = classify("elevenlabs", 429, body.as_bytes());
        assert_eq!(err.code, ErrorCode::RateLimitExceeded);
        assert_eq!(err.message, "Too many requests, retry after 3 seconds");
        assert_eq!(err.retry_after_seconds, Some(3 + RETRY_BUFFER_SECS));

        let err = classify("some-new-provider", 401, br#"{"message":"bad key"}"#);
        assert_eq!(err.code, ErrorCode::InvalidApiKey);
    }

    #[test]
    fn unparseable_body_is_unknown_and_keeps_raw_text() {
        let err = classify("openai", 429, b"<html>upstream hiccup</html>");
        assert_eq!(err.code, ErrorCode::UnknownError);
        assert_eq!(err.message, "An unknown error occurred with status: 429");
        assert!(err.retry_after_seconds.is_none());
        assert_eq!(err.original, Value::String("<html>upstream hiccup</html>".into()));
    }

    #[test]
    fn json_without_envelope_stays_unknown_for_known_providers() {
        let err = classify("anthropic", 500, br#"{"unexpected":true}"#);
        assert_eq!(err.code, ErrorCode::UnknownError);
    }

    #[test]
    fn hint_does_not_mistake_words_for_units() {
        assert_eq!(retry_hint("retry after 5 more attempts"), Some(5 + RETRY_BUFFER_SECS));
        assert_eq!(retry_hint("try again in 2 minutes"), Some(120 + RETRY_BUFFER_SECS));
        assert_eq!(retry_hint("nothing to see"), None);
    }

    #[test]
    fn huge_message_hint_is_capped() {
        let body = r#"{"error":{"message":"Please try again in 99999999999999999999999s.","code":"rate_limit_exceeded"}}"#;
        let err = classify("openai", 429, body.as_bytes());
        assert_eq!(
            err.retry_after_seconds,
            Some(MAX_RETRY_HINT_SECS + RETRY_BUFFER_SECS)
        );
    }

    #[test]
    fn huge_google_retry_delay_is_capped() {
        let body = r#"{"error":{"code":429,"message":"slow down","details":[
            {"@type":"type.googleapis.com/google.rpc.RetryInfo","retryDelay":"1e30s"}]}}"#;
        let err = classify_at("google-ai-studio", 429, body.as_bytes(), at());
        assert_eq!(
            err.retry_after_seconds,
            Some(MAX_RETRY_HINT_SECS + RETRY_BUFFER_SECS)
        );
    }

    #[test]
    fn buffered_retry_secs_saturates() {
        assert_eq!(buffered_retry_secs(0), RETRY_BUFFER_SECS);
        assert_eq!(buffered_retry_secs(30), 30 + RETRY_BUFFER_SECS);
        assert_eq!(
            buffered_retry_secs(u64::MAX),
            MAX_RETRY_HINT_SECS + RETRY_BUFFER_SECS
        );
    }
}
