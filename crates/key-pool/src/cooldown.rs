//! Rate-limit cooldown policy
//!
//! Decides how long a key should cool for a model after a 429. Precedence:
//! 1. escalation, once the key's consecutive 429 streak reaches the threshold
//! 2. the classifier's retry hint
//! 3. a numeric `retry-after` response header
//! 4. the default short cooldown
//!
//! Escalation resets the streak. For providers with daily quotas the long
//! cooldown runs until local midnight in the provider's timezone.

use chrono::{DateTime, Utc};
use provider::{ProviderKind, buffered_retry_secs, seconds_until_midnight};
use tracing::error;

use crate::failures::FailureCounter;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CooldownSource {
    Escalated,
    ProviderHint,
    RetryAfterHeader,
    Default,
}

impl CooldownSource {
    pub fn as_str(self) -> &'static str {
        match self {
            CooldownSource::Escalated => "escalated",
            CooldownSource::ProviderHint => "provider_hint",
            CooldownSource::RetryAfterHeader => "retry_after_header",
            CooldownSource::Default => "default",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CooldownDecision {
    pub seconds: u64,
    pub source: CooldownSource,
}

impl CooldownDecision {
    pub fn escalated(&self) -> bool {
        self.source == CooldownSource::Escalated
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CooldownPolicy {
    /// Consecutive 429s that trigger escalation.
    pub threshold: u32,
    pub default_secs: u64,
    /// Long cooldown for providers without a quota timezone.
    pub long_secs: u64,
}

impl Default for CooldownPolicy {
    fn default() -> Self {
        Self {
            threshold: 3,
            default_secs: 65,
            long_secs: 24 * 60 * 60,
        }
    }
}

impl CooldownPolicy {
    /// Record a 429 for `key_id` and decide its cooldown.
    ///
    /// `hint` is the classifier's `retry_after_seconds` (buffer already
    /// included); `retry_after_header` is the raw header value in seconds.
    pub fn on_rate_limited(
        &self,
        counter: &dyn FailureCounter,
        key_id: &str,
        provider: &str,
        hint: Option<u64>,
        retry_after_header: Option<u64>,
        now: DateTime<Utc>,
    ) -> CooldownDecision {
        let streak = counter.increment(key_id);
        if streak >= self.threshold.max(1) {
            counter.reset(key_id);
            let seconds = self.long_cooldown(provider, now);
            error!(
                key_id,
                provider,
                streak,
                seconds,
                "consecutive rate limits, escalating to long cooldown"
            );
            return CooldownDecision {
                seconds,
                source: CooldownSource::Escalated,
            };
        }

        if let Some(seconds) = hint {
            return CooldownDecision {
                seconds,
                source: CooldownSource::ProviderHint,
            };
        }
        if let Some(seconds) = retry_after_header {
            return CooldownDecision {
                seconds: buffered_retry_secs(seconds),
                source: CooldownSource::RetryAfterHeader,
            };
        }
        CooldownDecision {
            seconds: self.default_secs,
            source: CooldownSource::Default,
        }
    }

    /// Long cooldown for a provider: until its quota reset if it has one.
    pub fn long_cooldown(&self, provider: &str, now: DateTime<Utc>) -> u64 {
        ProviderKind::from_name(provider)
            .quota_reset_timezone()
            .map(|tz| seconds_until_midnight(tz, now))
            .unwrap_or(self.long_secs)
    }
}
