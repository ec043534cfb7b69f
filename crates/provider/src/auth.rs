//! Per-provider API key header table

use crate::ProviderKind;

/// Header used to carry an API key for a provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthHeader {
    pub name: &'static str,
    /// `Authorization: Bearer <key>` when true, the raw key otherwise.
    pub bearer: bool,
}

impl AuthHeader {
    pub const BEARER: AuthHeader = AuthHeader {
        name: "authorization",
        bearer: true,
    };

    /// Look up the header for a provider name. Unknown providers use bearer auth.
    pub fn for_provider(provider: &str) -> Self {
        let name = match ProviderKind::from_name(provider) {
            ProviderKind::GoogleAiStudio => "x-goog-api-key",
            ProviderKind::Anthropic | ProviderKind::ElevenLabs => "x-api-key",
            ProviderKind::AzureOpenAi => "api-key",
            ProviderKind::Cartesia => "x-api-key",
            ProviderKind::OpenAi | ProviderKind::Compat | ProviderKind::Other => {
                return Self::BEARER;
            }
        };
        Self {
            name,
            bearer: false,
        }
    }

    /// Header value carrying `key`.
    pub fn value_for(&self, key: &str) -> String {
        if self.bearer {
            format!("Bearer {key}")
        } else {
            key.to_string()
        }
    }

    /// Recover the key from an inbound header value.
    pub fn extract<'a>(&self, raw: &'a str) -> &'a str {
        let raw = raw.trim();
        if self.bearer {
            if let Some(rest) = raw.strip_prefix("Bearer ") {
                return rest.trim_start();
            }
            if let Some(rest) = raw.strip_prefix("bearer ") {
                return rest.trim_start();
            }
        }
        raw
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_specific_headers() {
        assert_eq!(
            AuthHeader::for_provider("google-ai-studio").name,
            "x-goog-api-key"
        );
        assert_eq!(AuthHeader::for_provider("anthropic").name, "x-api-key");
        assert_eq!(AuthHeader::for_provider("elevenlabs").name, "x-api-key");
        assert_eq!(AuthHeader::for_provider("azure-openai").name, "api-key");
        assert_eq!(AuthHeader::for_provider("cartesia").name, "x-api-key");
        assert!(!AuthHeader::for_provider("anthropic").bearer);
    }

    #[test]
    fn default_is_bearer_authorization() {
        for provider in ["openai", "compat", "groq", ""] {
            assert_eq!(AuthHeader::for_provider(provider), AuthHeader::BEARER);
        }
        assert_eq!(AuthHeader::BEARER.value_for("sk-1"), "Bearer sk-1");
    }

    #[test]
    fn extract_strips_bearer_prefix_only_for_bearer_headers() {
        assert_eq!(AuthHeader::BEARER.extract("Bearer  abc "), "abc");
        assert_eq!(AuthHeader::BEARER.extract("abc"), "abc");
        let google = AuthHeader::for_provider("google-ai-studio");
        assert_eq!(google.extract("Bearer abc"), "Bearer abc");
        assert_eq!(google.value_for("abc"), "abc");
    }
}
