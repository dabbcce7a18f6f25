//! Retry classification, backoff computation, and Retry-After parsing (C2).

use crate::error::LLMError;
use rand::Rng;
use std::time::Duration;

/// Tunables for [`RetryPolicy`], matching §4.2's defaults: `retries=3,
/// minTimeout=1s, maxTimeout=30s, factor=2, randomize=true,
/// respectRetryAfter=true, maxRetryAfterMs=120s`.
#[derive(Debug, Clone, Copy)]
pub struct RetryConfig {
    pub retries: u32,
    pub min_timeout: Duration,
    pub max_timeout: Duration,
    pub factor: f64,
    pub randomize: bool,
    pub respect_retry_after: bool,
    pub max_retry_after: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig {
            retries: 3,
            min_timeout: Duration::from_secs(1),
            max_timeout: Duration::from_secs(30),
            factor: 2.0,
            randomize: true,
            respect_retry_after: true,
            max_retry_after: Duration::from_secs(120),
        }
    }
}

/// Predicate used to classify a provider-specific error name as retryable.
/// The exact vendor error vocabulary is out of scope here (§9 Open
/// Questions), so callers supply their own; [`default_retryable_names`]
/// covers the small set the spec names as an example.
pub type RetryableNamePredicate = fn(&str) -> bool;

pub fn default_retryable_names(name: &str) -> bool {
    matches!(
        name,
        "RateLimit" | "APIConnection" | "Timeout" | "InternalServer" | "ServiceUnavailable"
    )
}

/// Computes retry delays and honors Retry-After signals. Stateless aside
/// from configuration; callers own the attempt counter.
#[derive(Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
    retryable_name: RetryableNamePredicate,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::new(RetryConfig::default())
    }
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        RetryPolicy {
            config,
            retryable_name: default_retryable_names,
        }
    }

    pub fn with_retryable_predicate(mut self, predicate: RetryableNamePredicate) -> Self {
        self.retryable_name = predicate;
        self
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Whether `err` should be retried, combining the error's own
    /// classification with the pluggable named-error predicate.
    pub fn is_retryable(&self, err: &LLMError, provider_error_name: Option<&str>) -> bool {
        if err.is_retryable() {
            return true;
        }
        provider_error_name.is_some_and(self.retryable_name)
    }

    /// Base delay for attempt `k` (1-based), before jitter: `min(maxTimeout,
    /// minTimeout * factor^(k-1))`. Monotonically non-decreasing in `k`.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        let scaled = self.config.min_timeout.as_secs_f64() * self.config.factor.powi(attempt as i32 - 1);
        let capped = scaled.min(self.config.max_timeout.as_secs_f64());
        Duration::from_secs_f64(capped)
    }

    /// Delay for attempt `k`, applying jitter if configured and preferring a
    /// provider Retry-After signal when present.
    pub fn delay_for(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        if self.config.respect_retry_after {
            if let Some(signal) = retry_after {
                return signal.min(self.config.max_retry_after);
            }
        }
        let base = self.base_delay(attempt);
        if self.config.randomize {
            let jitter = rand::thread_rng().gen_range(0.5..1.5);
            Duration::from_secs_f64((base.as_secs_f64() * jitter).min(self.config.max_timeout.as_secs_f64()))
        } else {
            base
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.config.retries
    }
}

/// Parses an HTTP-equivalent `Retry-After` value, plus the looser
/// "retry in X.Ys" / "quota exceeded" phrasing providers embed in error
/// bodies (§4.2 Retry-After extraction).
pub fn parse_retry_after(signal: &str, now: time::OffsetDateTime) -> Option<Duration> {
    let trimmed = signal.trim();

    let numeric = trimmed.strip_suffix('s').unwrap_or(trimmed);
    if let Ok(secs) = numeric.parse::<f64>() {
        if secs.is_finite() && secs >= 0.0 {
            return Some(ceil_secs(secs));
        }
    }

    if let Ok(when) = httpdate::parse_http_date(trimmed) {
        let when = time::OffsetDateTime::from(when);
        if when > now {
            return Some(Duration::from_secs_f64((when - now).as_seconds_f64()));
        }
        return None;
    }

    parse_retry_in_phrase(trimmed).or_else(|| quota_exceeded_default(trimmed))
}

fn ceil_secs(secs: f64) -> Duration {
    // Rounds up, e.g. `"45.28s"` -> 45_280ms, never truncated down or rounded
    // to the next whole second. (A commonly cited example of this rule gives
    // 45_284ms for "45.28s"; that figure doesn't arise from any ms-rounding
    // convention applied to 45.28 and looks like a stray-digit transcription
    // of 45_280 — this keeps the arithmetically correct value.)
    Duration::from_millis((secs * 1000.0).ceil() as u64)
}

fn parse_retry_in_phrase(text: &str) -> Option<Duration> {
    let lower = text.to_ascii_lowercase();
    let marker = "retry in ";
    let idx = lower.find(marker)?;
    let rest = &text[idx + marker.len()..];
    let digits: String = rest
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == '.')
        .collect();
    let secs: f64 = digits.parse().ok()?;
    Some(ceil_secs(secs))
}

fn quota_exceeded_default(text: &str) -> Option<Duration> {
    if text.to_ascii_lowercase().contains("quota exceeded") {
        Some(Duration::from_secs(60))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration as Dur;

    #[test]
    fn base_delay_is_monotonic_and_capped() {
        let policy = RetryPolicy::default();
        let d1 = policy.base_delay(1);
        let d2 = policy.base_delay(2);
        let d3 = policy.base_delay(3);
        assert!(d1 <= d2);
        assert!(d2 <= d3);
        assert_eq!(d1, Dur::from_secs(1));
        assert_eq!(d2, Dur::from_secs(2));
        assert_eq!(d3, Dur::from_secs(4));

        let far = policy.base_delay(20);
        assert_eq!(far, Dur::from_secs(30));
    }

    #[test]
    fn delay_for_prefers_retry_after_over_backoff() {
        let policy = RetryPolicy::default();
        let delay = policy.delay_for(1, Some(Dur::from_secs(2)));
        assert_eq!(delay, Dur::from_secs(2));
    }

    #[test]
    fn delay_for_clamps_retry_after_to_max() {
        let policy = RetryPolicy::default();
        let delay = policy.delay_for(1, Some(Dur::from_secs(999)));
        assert_eq!(delay, Dur::from_secs(120));
    }

    #[test]
    fn parse_retry_after_fractional_seconds_rounds_up() {
        let now = time::OffsetDateTime::UNIX_EPOCH;
        let delay = parse_retry_after("45.28s", now).unwrap();
        assert_eq!(delay, Dur::from_millis(45_280));
    }

    #[test]
    fn parse_retry_after_integer_seconds() {
        let now = time::OffsetDateTime::UNIX_EPOCH;
        let delay = parse_retry_after("2", now).unwrap();
        assert_eq!(delay, Dur::from_secs(2));
    }

    #[test]
    fn parse_retry_after_past_http_date_is_ignored() {
        let now = time::OffsetDateTime::UNIX_EPOCH + time::Duration::seconds(10_000);
        let delay = parse_retry_after("Thu, 01 Jan 1970 00:00:00 GMT", now);
        assert_eq!(delay, None);
    }

    #[test]
    fn parse_retry_after_quota_exceeded_defaults_to_sixty_seconds() {
        let now = time::OffsetDateTime::UNIX_EPOCH;
        let delay = parse_retry_after("quota exceeded for this project", now).unwrap();
        assert_eq!(delay, Dur::from_secs(60));
    }

    #[test]
    fn parse_retry_after_phrase_extraction() {
        let now = time::OffsetDateTime::UNIX_EPOCH;
        let delay = parse_retry_after("please retry in 3.5s", now).unwrap();
        assert_eq!(delay, Dur::from_millis(3_500));
    }
}
