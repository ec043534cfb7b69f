//! Provider-agnostic error representation

use serde::Serialize;

/// Normalized failure category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    InvalidApiKey,
    PermissionDenied,
    RateLimitExceeded,
    NotFound,
    BadRequest,
    ServerError,
    ServiceUnavailable,
    UnknownError,
    /// Transport failure: no response was received.
    NetworkError,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InvalidApiKey => "invalid_api_key",
            Self::PermissionDenied => "permission_denied",
            Self::RateLimitExceeded => "rate_limit_exceeded",
            Self::NotFound => "not_found",
            Self::BadRequest => "bad_request",
            Self::ServerError => "server_error",
            Self::ServiceUnavailable => "service_unavailable",
            Self::UnknownError => "unknown_error",
            Self::NetworkError => "network_error",
        }
    }

    /// Fallback mapping used when a body carries no provider-specific reason.
    pub fn from_status(status: u16) -> Self {
        match status {
            400 => Self::BadRequest,
            401 => Self::InvalidApiKey,
            403 => Self::PermissionDenied,
            404 => Self::NotFound,
            429 => Self::RateLimitExceeded,
            503 => Self::ServiceUnavailable,
            500..=599 => Self::ServerError,
            _ => Self::UnknownError,
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of classifying an upstream failure response.
///
/// Serializes to the normalized body returned to callers when error
/// normalization is enabled. `original` is kept for logs only.
#[derive(Debug, Clone, Serialize)]
pub struct UnifiedError {
    pub error: bool,
    pub code: ErrorCode,
    pub message: String,
    pub provider: String,
    pub status: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_seconds: Option<u64>,
    #[serde(skip)]
    pub original: serde_json::Value,
}

impl UnifiedError {
    /// The starting point for every classification: unknown, with the raw
    /// body text preserved.
    pub fn unknown(provider: &str, status: u16, raw: String) -> Self {
        Self {
            error: true,
            code: ErrorCode::UnknownError,
            message: format!("An unknown error occurred with status: {status}"),
            provider: provider.to_string(),
            status,
            retry_after_seconds: None,
            original: serde_json::Value::String(raw),
        }
    }

    /// True when the failure is the key's fault and rotating keys may help.
    pub fn is_key_invalid(&self) -> bool {
        self.code == ErrorCode::InvalidApiKey
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"error":true,"code":"{}","status":{}}}"#,
                self.code, self.status
            )
        })
    }
}
