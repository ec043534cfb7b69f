//! Provider knowledge for the balance proxy
//!
//! Everything in this crate is pure: no I/O, no shared state. It answers three
//! questions about an upstream provider:
//! - which header carries the API key (`auth`)
//! - what a failure response means (`classify`)
//! - when a daily quota resets (`clock`)
//!
//! Providers are identified by the name used as the first path segment of an
//! inbound request (e.g. `google-ai-studio`, `openai`). Unknown names are not an
//! error; they get bearer auth and generic status-based classification.

pub mod auth;
pub mod classify;
pub mod clock;
mod unified;

pub use auth::AuthHeader;
pub use classify::{
    MAX_RETRY_HINT_SECS, RETRY_BUFFER_SECS, buffered_retry_secs, classify, classify_at,
};
pub use clock::seconds_until_midnight;
pub use unified::{ErrorCode, UnifiedError};

use chrono_tz::Tz;

/// Known provider families, keyed by their routing name.
///
/// Adding a provider means adding a variant here and, if its error envelope
/// differs from the generic shape, one arm in [`classify`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    GoogleAiStudio,
    Anthropic,
    OpenAi,
    AzureOpenAi,
    ElevenLabs,
    Cartesia,
    /// Gateway unified endpoint: model strings are `provider/model`.
    Compat,
    Other,
}

impl ProviderKind {
    pub fn from_name(name: &str) -> Self {
        match name {
            "google-ai-studio" => Self::GoogleAiStudio,
            "anthropic" => Self::Anthropic,
            "openai" => Self::OpenAi,
            "azure-openai" => Self::AzureOpenAi,
            "elevenlabs" => Self::ElevenLabs,
            "cartesia" => Self::Cartesia,
            "compat" => Self::Compat,
            _ => Self::Other,
        }
    }

    /// Timezone in which this provider's daily quotas reset, if it has
    /// daily quotas at all.
    pub fn quota_reset_timezone(self) -> Option<Tz> {
        match self {
            Self::GoogleAiStudio => Some(chrono_tz::America::Los_Angeles),
            _ => None,
        }
    }
}
