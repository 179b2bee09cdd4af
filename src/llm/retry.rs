//! Backoff policy for rate-limit and overload responses.

use std::time::Duration;

use chrono::{DateTime, Utc};

/// How many times to send a request and how long to wait in between.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total sends, including the first.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_backoff: Duration,
    /// Upper bound applied to a server-provided `Retry-After`.
    pub max_retry_after: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_backoff: Duration::from_secs(15),
            max_retry_after: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// 429 (rate limited) and 529 (overloaded) are the only retryable statuses.
    pub fn is_retryable(status: u16) -> bool {
        matches!(status, 429 | 529)
    }

    /// Delay before the send following failed attempt number `attempt`
    /// (1-based).
    pub fn delay_for(&self, attempt: u32, retry_after: Option<&str>) -> Duration {
        if let Some(delay) = retry_after.and_then(|v| parse_retry_after(v, Utc::now())) {
            return delay.min(self.max_retry_after);
        }
        let exponent = attempt.saturating_sub(1).min(16);
        self.base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_backoff)
    }
}

/// Parse a `Retry-After` value: delta-seconds (integer or fractional) or an
/// HTTP date. Dates in the past yield zero.
pub fn parse_retry_after(value: &str, now: DateTime<Utc>) -> Option<Duration> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    if let Ok(secs) = value.parse::<f64>() {
        if secs.is_finite() && secs >= 0.0 {
            return Some(Duration::from_secs_f64(secs));
        }
        return None;
    }
    let when = DateTime::parse_from_rfc2822(value).ok()?;
    let delta = when.with_timezone(&Utc) - now;
    Some(delta.to_std().unwrap_or(Duration::ZERO))
}
