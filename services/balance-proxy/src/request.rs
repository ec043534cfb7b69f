//! Inbound request parsing
//!
//! Proxy requests look like `/api/<provider>/<rest...>`. Everything after
//! `/api/`, query string included, is the resource forwarded upstream.

use axum::http::{HeaderMap, Method, Uri};
use common::Secret;
use provider::{AuthHeader, ProviderKind};

use crate::error::{Error, Result};

const API_PREFIX: &str = "/api/";

/// Provider-relative resource of an inbound request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    /// Path after `/api/` plus `?query` when present.
    pub resource: String,
    /// First path segment of the resource.
    pub provider: String,
}

impl Route {
    pub fn from_uri(uri: &Uri) -> Option<Self> {
        let path = uri.path().strip_prefix(API_PREFIX)?;
        let provider = path.split('/').next().unwrap_or_default();
        if provider.is_empty() {
            return None;
        }
        let resource = match uri.query() {
            Some(q) => format!("{path}?{q}"),
            None => path.to_string(),
        };
        Some(Self {
            resource,
            provider: provider.to_string(),
        })
    }

    /// Resource without the leading provider segment, for providers that
    /// are called directly rather than through the gateway.
    pub fn without_provider(&self) -> &str {
        let rest = &self.resource[self.provider.len()..];
        rest.strip_prefix('/').unwrap_or(rest)
    }
}

/// Provider and model a request is dispatched for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    /// Provider whose keys serve the request.
    pub provider: String,
    pub model: String,
}

/// Check the caller's access key, carried in the same header the provider
/// itself would use.
pub fn authenticate(headers: &HeaderMap, provider: &str, allowed: &[Secret<String>]) -> bool {
    let header = AuthHeader::for_provider(provider);
    let Some(raw) = headers.get(header.name).and_then(|v| v.to_str().ok()) else {
        return false;
    };
    let presented = header.extract(raw);
    !presented.is_empty() && allowed.iter().any(|k| k.matches(presented))
}

/// Model named by a request: the JSON body's `model` field for POST, else
/// the path segment after `/models/` up to the first `:`.
pub fn extract_model(method: &Method, body: &[u8], resource: &str) -> Option<String> {
    if method == Method::POST
        && !body.is_empty()
        && let Ok(value) = serde_json::from_slice::<serde_json::Value>(body)
        && let Some(model) = value.get("model").and_then(|m| m.as_str())
        && !model.is_empty()
    {
        return Some(model.to_string());
    }
    model_from_path(resource)
}

fn model_from_path(resource: &str) -> Option<String> {
    let (_, after) = resource.split_once("/models/")?;
    let model = after.split([':', '?', '/']).next().unwrap_or_default();
    (!model.is_empty()).then(|| model.to_string())
}

/// Resolve which provider's keys serve the request. `compat` requests name
/// the real provider in the model string: `google-ai-studio/gemini-2.0-flash`.
pub fn resolve_target(provider: &str, model: String) -> Result<Target> {
    if ProviderKind::from_name(provider) != ProviderKind::Compat {
        return Ok(Target {
            provider: provider.to_string(),
            model,
        });
    }
    let mut parts = model.split('/');
    match (parts.next(), parts.next()) {
        (Some(real_provider), Some(real_model))
            if !real_provider.is_empty() && !real_model.is_empty() =>
        {
            Ok(Target {
                provider: real_provider.to_string(),
                model: real_model.to_string(),
            })
        }
        _ => Err(Error::ModelNotFound),
    }
}
