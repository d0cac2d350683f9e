//! Coordinator configuration.
//!
//! `CoordinatorConfig` is the explicit, validated configuration handed to the coordinator at
//! construction. The subset that applications may change at runtime lives in [`Settings`] and
//! is shared through a [`DynamicConfig`](crate::adaptive::DynamicConfig).

use http::HeaderValue;
use std::time::Duration;
use thiserror::Error;

/// Default number of requests combined into one batch exchange.
pub const DEFAULT_MAX_REQUESTS_PER_BATCH: usize = 10;
/// Default number of exchanges in flight at once.
pub const DEFAULT_MAX_ACTIVE_REQUESTS: usize = 6;
/// Default debounce window before pending requests are dispatched.
pub const DEFAULT_BATCH_TIMEOUT: Duration = Duration::from_millis(20);
/// Give up retrying when nothing succeeded for this long.
pub const DEFAULT_GIVE_UP_TIMEOUT: Duration = Duration::from_secs(90);
/// Longest URL sent as-is; the practical browser/server limit is 2048 and parameters are
/// appended later.
pub const DEFAULT_MAX_URL_LENGTH: usize = 1900;

/// Errors produced while validating configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BuildError {
    #[error("max_requests_per_batch must be > 0 (got {0})")]
    InvalidMaxPerBatch(usize),
    #[error("max_active_requests must be > 0 (got {0})")]
    InvalidMaxActive(usize),
    #[error("give_up_timeout must be > 0")]
    InvalidGiveUpTimeout,
    #[error("rate_limit_interval must be > 0")]
    InvalidRateLimitInterval,
    #[error("invalid service base URL '{0}'")]
    InvalidBaseUrl(String),
}

/// Constants of the pacing policy. The exact values are empirical; only the shape of the
/// policy (ratchet-only increase, floor at zero) is fixed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacingConfig {
    /// Interval the `x-ratelimit-limit` header is assumed to refer to. Also the fallback
    /// wait when a throttled response has no usable `Retry-After`.
    pub rate_limit_interval: Duration,
    /// Added to the interval before dividing it among permitted requests.
    pub safety_margin: Duration,
    /// Added to the inter-request delay on each throttling event.
    pub throttle_increment: Duration,
    /// Aborts faster than this are treated as preflight throttling rather than timeouts.
    pub preflight_abort_window: Duration,
}

impl Default for PacingConfig {
    fn default() -> Self {
        Self {
            rate_limit_interval: Duration::from_millis(1000),
            safety_margin: Duration::from_millis(60),
            throttle_increment: Duration::from_millis(100),
            preflight_abort_window: Duration::from_secs(15),
        }
    }
}

/// Settings that may change while the coordinator is running.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub service_base_url: String,
    pub max_requests_per_batch: usize,
    pub max_active_requests: usize,
    pub api_key: String,
    /// Sent as the `Authorization` header of every exchange.
    pub authorization: Option<HeaderValue>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            service_base_url: String::new(),
            max_requests_per_batch: DEFAULT_MAX_REQUESTS_PER_BATCH,
            max_active_requests: DEFAULT_MAX_ACTIVE_REQUESTS,
            api_key: String::new(),
            authorization: None,
        }
    }
}

/// Full coordinator configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoordinatorConfig {
    pub service_base_url: String,
    pub max_requests_per_batch: usize,
    pub max_active_requests: usize,
    pub batch_timeout: Duration,
    pub give_up_timeout: Duration,
    pub max_url_length: usize,
    pub api_key: String,
    pub pacing: PacingConfig,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            service_base_url: String::new(),
            max_requests_per_batch: DEFAULT_MAX_REQUESTS_PER_BATCH,
            max_active_requests: DEFAULT_MAX_ACTIVE_REQUESTS,
            batch_timeout: DEFAULT_BATCH_TIMEOUT,
            give_up_timeout: DEFAULT_GIVE_UP_TIMEOUT,
            max_url_length: DEFAULT_MAX_URL_LENGTH,
            api_key: String::new(),
            pacing: PacingConfig::default(),
        }
    }
}

impl CoordinatorConfig {
    /// Configuration for a service base URL with every other value defaulted.
    pub fn new(service_base_url: impl Into<String>) -> Self {
        Self { service_base_url: service_base_url.into(), ..Self::default() }
    }

    /// Check invariants and normalise the base URL (no trailing slash) and API key (trimmed).
    pub fn validate(mut self) -> Result<Self, BuildError> {
        self.service_base_url = normalize_base_url(&self.service_base_url)?;
        if self.max_requests_per_batch == 0 {
            return Err(BuildError::InvalidMaxPerBatch(0));
        }
        if self.max_active_requests == 0 {
            return Err(BuildError::InvalidMaxActive(0));
        }
        if self.give_up_timeout.is_zero() {
            return Err(BuildError::InvalidGiveUpTimeout);
        }
        if self.pacing.rate_limit_interval.is_zero() {
            return Err(BuildError::InvalidRateLimitInterval);
        }
        self.api_key = self.api_key.trim().to_string();
        Ok(self)
    }

    /// The runtime-mutable part of this configuration.
    pub fn settings(&self) -> Settings {
        Settings {
            service_base_url: self.service_base_url.clone(),
            max_requests_per_batch: self.max_requests_per_batch,
            max_active_requests: self.max_active_requests,
            api_key: self.api_key.clone(),
            authorization: None,
        }
    }
}

/// Trim whitespace and trailing slashes; a non-empty base must be an absolute URL.
pub fn normalize_base_url(base: &str) -> Result<String, BuildError> {
    let base = base.trim().trim_end_matches('/').to_string();
    if !base.is_empty() && url::Url::parse(&base).is_err() {
        return Err(BuildError::InvalidBaseUrl(base));
    }
    Ok(base)
}
