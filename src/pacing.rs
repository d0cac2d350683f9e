//! Pacing policy: the minimum delay between dispatches, inferred from rate-limit signals.
//!
//! Pure state and arithmetic; the coordinator feeds it timestamps from its [`Clock`] and the
//! headers of every response.
//!
//! Shape of the policy:
//! - An `x-ratelimit-limit: N` header (requests per `rate_limit_interval`) sets the delay to
//!   `ceil((interval + margin) / max(1, floor(N / 2)))`. Each request is paired with a CORS
//!   preflight that counts against the same limit, hence the halving.
//! - Each throttling event adds `throttle_increment` while the delay is still below the
//!   interval; the coordinator drops concurrency to one at the same time.
//! - The delay never decreases automatically. [`PacingPolicy::reset`] is the only way back to
//!   zero (used when the service context changes).
//! - A `Retry-After` wait holds every dispatch until it elapses.
//!
//! [`Clock`]: crate::clock::Clock

use crate::config::PacingConfig;
use http::{HeaderMap, HeaderValue};
use std::time::{Duration, SystemTime};

/// Header names that announce a request quota, checked in order.
const RATE_LIMIT_HEADERS: [&str; 3] = ["x-ratelimit-limit", "x-rate-limit-limit", "ratelimit-limit"];

/// Mutable pacing state owned by the coordinator.
#[derive(Debug, Clone)]
pub struct PacingPolicy {
    config: PacingConfig,
    give_up_timeout: Duration,
    min_delay_ms: u64,
    last_request_ms: Option<u64>,
    last_success_ms: u64,
    hold_until_ms: u64,
}

/// What a throttling event changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThrottleOutcome {
    /// The inter-request delay was increased; concurrency should drop to one.
    pub ratcheted: bool,
    /// Delay in force after the event.
    pub min_delay: Duration,
}

impl PacingPolicy {
    /// Fresh policy; `now_ms` counts as the last success so the give-up window starts now.
    pub fn new(config: PacingConfig, give_up_timeout: Duration, now_ms: u64) -> Self {
        Self {
            config,
            give_up_timeout,
            min_delay_ms: 0,
            last_request_ms: None,
            last_success_ms: now_ms,
            hold_until_ms: 0,
        }
    }

    /// Inspect response headers for a request quota. Returns `true` if the delay grew.
    pub fn observe(&mut self, headers: &HeaderMap) -> bool {
        match rate_limit_from_headers(headers) {
            Some(limit) => {
                let candidate = delay_for_limit(limit, &self.config);
                let candidate_ms = duration_ms(candidate);
                if candidate_ms > self.min_delay_ms {
                    tracing::debug!(limit, delay_ms = candidate_ms, "pacing raised from rate-limit header");
                    self.min_delay_ms = candidate_ms;
                    true
                } else {
                    false
                }
            }
            None => false,
        }
    }

    /// How long the next dispatch must wait.
    pub fn delay_before_next(&self, now_ms: u64) -> Duration {
        let spacing = match self.last_request_ms {
            Some(last) => (last + self.min_delay_ms).saturating_sub(now_ms),
            None => 0,
        };
        let hold = self.hold_until_ms.saturating_sub(now_ms);
        Duration::from_millis(spacing.max(hold))
    }

    /// Note that an exchange was sent.
    pub fn record_request(&mut self, now_ms: u64) {
        self.last_request_ms = Some(now_ms);
    }

    /// Note a success response; restarts the give-up window.
    pub fn record_success(&mut self, now_ms: u64) {
        self.last_success_ms = now_ms;
    }

    /// Note a throttling event (429 or preflight abort) and hold dispatch for `retry_after`.
    pub fn record_failure(&mut self, now_ms: u64, retry_after: Duration) -> ThrottleOutcome {
        let interval_ms = duration_ms(self.config.rate_limit_interval);
        let ratcheted = self.min_delay_ms < interval_ms;
        if ratcheted {
            self.min_delay_ms += duration_ms(self.config.throttle_increment);
        }
        self.hold_until_ms = self.hold_until_ms.max(now_ms.saturating_add(duration_ms(retry_after)));
        ThrottleOutcome { ratcheted, min_delay: self.min_delay() }
    }

    /// Whether retries are still allowed, i.e. the last success is within the give-up window.
    pub fn can_retry(&self, now_ms: u64) -> bool {
        now_ms.saturating_sub(self.last_success_ms) < duration_ms(self.give_up_timeout)
    }

    /// Inter-request delay currently in force.
    pub fn min_delay(&self) -> Duration {
        Duration::from_millis(self.min_delay_ms)
    }

    /// Treat an abort as throttling only if it came back quickly.
    pub fn is_preflight_abort(&self, elapsed: Duration) -> bool {
        elapsed < self.config.preflight_abort_window
    }

    /// Fallback wait for throttled responses without a usable `Retry-After`.
    pub fn default_retry_after(&self) -> Duration {
        self.config.rate_limit_interval
    }

    /// Forget everything learned about the server.
    pub fn reset(&mut self, now_ms: u64) {
        self.min_delay_ms = 0;
        self.last_request_ms = None;
        self.last_success_ms = now_ms;
        self.hold_until_ms = 0;
    }
}

/// Per-request delay for a quota of `limit` requests per interval.
pub fn delay_for_limit(limit: u64, config: &PacingConfig) -> Duration {
    let per_interval = (limit / 2).max(1);
    let window = duration_ms(config.rate_limit_interval + config.safety_margin);
    Duration::from_millis((window + per_interval - 1) / per_interval)
}

/// Quota announced by the response, if any header carries a plain integer.
pub fn rate_limit_from_headers(headers: &HeaderMap) -> Option<u64> {
    RATE_LIMIT_HEADERS.iter().find_map(|name| {
        let value = headers.get(*name)?.to_str().ok()?.trim();
        if !value.is_empty() && value.bytes().all(|b| b.is_ascii_digit()) {
            value.parse::<u64>().ok()
        } else {
            None
        }
    })
}

/// Wait requested by the `Retry-After` header as delay-seconds or HTTP-date.
///
/// Missing, malformed or past values yield `fallback`.
pub fn retry_after(headers: &HeaderMap, now: SystemTime, fallback: Duration) -> Duration {
    headers
        .get(http::header::RETRY_AFTER)
        .and_then(|value| parse_retry_after(value, now))
        .unwrap_or(fallback)
}

fn parse_retry_after(value: &HeaderValue, now: SystemTime) -> Option<Duration> {
    let value = value.to_str().ok()?.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let at = httpdate::parse_http_date(value).ok()?;
    at.duration_since(now).ok()
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
