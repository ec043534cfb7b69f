//! Service-specific error types

use axum::http::StatusCode;
use thiserror::Error;

/// Per-request failures that end a request before or after the dispatch loop.
///
/// Upstream responses (success or terminal provider errors) are not errors
/// here; they are returned to the caller as-is.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid auth key")]
    InvalidAuthKey,

    #[error("Not supported request: valid provider or model not found")]
    ModelNotFound,

    #[error("invalid request body: {0}")]
    InvalidBody(String),

    #[error("No active keys available")]
    NoActiveKeys,

    #[error("key store unavailable: {0}")]
    Store(#[from] key_pool::Error),

    #[error("Internal server error after retries")]
    RetriesExhausted,
}

impl Error {
    pub fn status(&self) -> StatusCode {
        match self {
            Error::InvalidAuthKey => StatusCode::FORBIDDEN,
            Error::ModelNotFound | Error::InvalidBody(_) => StatusCode::BAD_REQUEST,
            Error::NoActiveKeys => StatusCode::SERVICE_UNAVAILABLE,
            Error::Store(_) | Error::RetriesExhausted => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Result alias using service Error
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statuses_match_failure_kind() {
        assert_eq!(Error::InvalidAuthKey.status(), StatusCode::FORBIDDEN);
        assert_eq!(Error::ModelNotFound.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            Error::InvalidBody("too large".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(Error::NoActiveKeys.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            Error::RetriesExhausted.status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            Error::Store(key_pool::Error::NotFound("k".into())).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn messages_are_stable() {
        assert_eq!(Error::NoActiveKeys.to_string(), "No active keys available");
        assert_eq!(
            Error::RetriesExhausted.to_string(),
            "Internal server error after retries"
        );
        assert_eq!(
            Error::ModelNotFound.to_string(),
            "Not supported request: valid provider or model not found"
        );
    }
}
