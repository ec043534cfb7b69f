//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! Inbound access keys come from the AUTH_KEY env var or `auth_keys_file`,
//! never from the TOML directly, so they do not end up in checked-in config.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use common::Secret;
use key_pool::{CooldownPolicy, FailureCounterConfig};
use serde::Deserialize;

use crate::backoff::Backoff;

/// Root configuration
#[derive(Debug, Deserialize)]
pub struct Config {
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub admin: Option<AdminConfig>,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub failures: FailuresConfig,
    #[serde(default)]
    pub custom_providers: Vec<CustomProvider>,
}

/// HTTP proxy settings
#[derive(Debug, Deserialize)]
pub struct ProxyConfig {
    pub listen_addr: SocketAddr,
    /// Base URL of the AI gateway; the request path after `/api/` is appended.
    pub upstream_url: String,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
    /// File with inbound access keys, comma or newline separated
    /// (alternative to the AUTH_KEY env var)
    #[serde(default)]
    pub auth_keys_file: Option<PathBuf>,
    #[serde(skip)]
    pub auth_keys: Vec<Secret<String>>,
}

/// Admin API listener. The admin API is not served when this section is absent.
#[derive(Debug, Clone, Deserialize)]
pub struct AdminConfig {
    pub listen_addr: SocketAddr,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_database_url")]
    pub database_url: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database_url: default_database_url(),
        }
    }
}

/// Retry loop settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    pub max_attempts: u32,
    pub consecutive_429_threshold: u32,
    pub default_cooldown_secs: u64,
    pub long_cooldown_secs: u64,
    /// Failed keys are dropped from a request's candidate list only while
    /// the list is longer than this.
    pub candidate_floor: usize,
    /// Replace terminal provider error bodies with the unified error JSON.
    pub normalize_errors: bool,
    pub backoff: BackoffConfig,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_attempts: 30,
            consecutive_429_threshold: 3,
            default_cooldown_secs: 65,
            long_cooldown_secs: 24 * 60 * 60,
            candidate_floor: 1,
            normalize_errors: false,
            backoff: BackoffConfig::default(),
        }
    }
}

impl DispatchConfig {
    pub fn cooldown_policy(&self) -> CooldownPolicy {
        CooldownPolicy {
            threshold: self.consecutive_429_threshold,
            default_secs: self.default_cooldown_secs,
            long_secs: self.long_cooldown_secs,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    pub jitter_factor: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 100,
            max_delay_ms: 5_000,
            multiplier: 2.0,
            jitter_factor: 0.1,
        }
    }
}

impl BackoffConfig {
    pub fn to_backoff(&self) -> Backoff {
        Backoff {
            initial: Duration::from_millis(self.initial_delay_ms),
            max: Duration::from_millis(self.max_delay_ms),
            multiplier: self.multiplier,
            jitter: self.jitter_factor,
        }
    }
}

/// Active-key cache settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub ttl_secs: u64,
    pub max_providers: usize,
    /// Maximum keys loaded per provider refresh
    pub query_limit: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 1,
            max_providers: 100,
            query_limit: 1_000,
        }
    }
}

/// Consecutive 429 table bounds
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FailuresConfig {
    pub max_entries: usize,
    pub max_age_secs: u64,
    pub cleanup_interval_secs: u64,
}

impl Default for FailuresConfig {
    fn default() -> Self {
        Self {
            max_entries: 10_000,
            max_age_secs: 600,
            cleanup_interval_secs: 120,
        }
    }
}

impl FailuresConfig {
    pub fn to_counter_config(&self) -> FailureCounterConfig {
        FailureCounterConfig {
            max_entries: self.max_entries,
            max_age: Duration::from_secs(self.max_age_secs),
            cleanup_interval: Duration::from_secs(self.cleanup_interval_secs),
        }
    }
}

/// Provider served directly from its own base URL with bearer auth instead
/// of through the gateway.
#[derive(Debug, Clone, Deserialize)]
pub struct CustomProvider {
    pub name: String,
    pub base_url: String,
}

fn default_timeout() -> u64 {
    60
}

fn default_max_connections() -> usize {
    1000
}

fn default_max_body_bytes() -> usize {
    10 * 1024 * 1024
}

fn default_database_url() -> String {
    "sqlite:balance-proxy.db".to_string()
}

fn is_http_url(url: &str) -> bool {
    url.starts_with("http://") || url.starts_with("https://")
}

/// Split a comma or newline separated list of access keys.
fn parse_auth_keys(raw: &str) -> Vec<Secret<String>> {
    raw.split([',', '\n'])
        .map(str::trim)
        .filter(|k| !k.is_empty())
        .map(|k| Secret::new(k.to_string()))
        .collect()
}

impl Config {
    /// Load configuration from a TOML file, then overlay environment variables.
    ///
    /// Access key resolution order:
    /// 1. AUTH_KEY env var (comma separated)
    /// 2. auth_keys_file path from config
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;

        if let Ok(url) = std::env::var("DATABASE_URL")
            && !url.trim().is_empty()
        {
            config.store.database_url = url.trim().to_string();
        }

        if let Ok(raw) = std::env::var("CONSECUTIVE_429_THRESHOLD") {
            config.dispatch.consecutive_429_threshold = raw.trim().parse().map_err(|e| {
                common::Error::invalid("CONSECUTIVE_429_THRESHOLD", format!("{raw:?}: {e}"))
            })?;
        }

        if let Ok(raw) = std::env::var("AUTH_KEY") {
            config.proxy.auth_keys = parse_auth_keys(&raw);
        } else if let Some(ref keys_file) = config.proxy.auth_keys_file {
            let raw = std::fs::read_to_string(keys_file).map_err(|e| {
                common::Error::Config(format!(
                    "failed to read auth_keys_file {}: {e}",
                    keys_file.display()
                ))
            })?;
            config.proxy.auth_keys = parse_auth_keys(&raw);
        }

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> common::Result<()> {
        use common::Error;

        if !is_http_url(&self.proxy.upstream_url) {
            return Err(Error::invalid(
                "proxy.upstream_url",
                format!(
                    "must start with http:// or https://, got: {}",
                    self.proxy.upstream_url
                ),
            ));
        }
        if self.proxy.timeout_secs == 0 {
            return Err(Error::invalid("proxy.timeout_secs", "must be greater than 0"));
        }
        if self.proxy.max_connections == 0 {
            return Err(Error::invalid(
                "proxy.max_connections",
                "must be greater than 0",
            ));
        }
        if self.dispatch.max_attempts == 0 {
            return Err(Error::invalid(
                "dispatch.max_attempts",
                "must be greater than 0",
            ));
        }
        if self.dispatch.consecutive_429_threshold == 0 {
            return Err(Error::invalid(
                "dispatch.consecutive_429_threshold",
                "must be greater than 0",
            ));
        }
        let backoff = &self.dispatch.backoff;
        if !(0.0..=1.0).contains(&backoff.jitter_factor) {
            return Err(Error::invalid(
                "dispatch.backoff.jitter_factor",
                "must be between 0 and 1",
            ));
        }
        if !(backoff.multiplier >= 1.0) {
            return Err(Error::invalid(
                "dispatch.backoff.multiplier",
                "must be at least 1",
            ));
        }
        if self.cache.ttl_secs == 0 {
            return Err(Error::invalid("cache.ttl_secs", "must be greater than 0"));
        }
        if self.failures.max_entries == 0 {
            return Err(Error::invalid(
                "failures.max_entries",
                "must be greater than 0",
            ));
        }
        for custom in &self.custom_providers {
            if custom.name.is_empty() || custom.name.contains('/') {
                return Err(Error::invalid(
                    "custom_providers.name",
                    format!("invalid provider name {:?}", custom.name),
                ));
            }
            if !is_http_url(&custom.base_url) {
                return Err(Error::invalid(
                    "custom_providers.base_url",
                    format!("{}: must start with http:// or https://", custom.name),
                ));
            }
        }
        Ok(())
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("balance-proxy.toml")
    }
}
