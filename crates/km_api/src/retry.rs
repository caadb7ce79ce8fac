use std::time::Duration;

/// What one HTTP attempt produced, as seen by the retry policy.
#[derive(Clone, Copy, Debug)]
pub struct AttemptOutcome {
    /// HTTP status, when a response arrived at all.
    pub status: Option<u16>,
    /// Parsed `Retry-After`, when the backend sent one.
    pub retry_after: Option<Duration>,
    /// True when the attempt failed before any response (DNS, connect,
    /// timeout).
    pub transport: bool,
}

/// Consulted once per attempt; `Some(backoff)` retries after the delay,
/// `None` makes the current outcome final.
pub trait RetryPolicy: Send + Sync {
    fn decide(&self, outcome: &AttemptOutcome, attempt: u32) -> Option<Duration>;
}

/// Exponential backoff over transport errors and 5xx. 429 honors
/// `Retry-After`; other 4xx are final.
#[derive(Clone, Debug)]
pub struct DefaultRetryPolicy {
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for DefaultRetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
        }
    }
}

impl DefaultRetryPolicy {
    pub fn with_max_attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Default::default()
        }
    }

    fn backoff_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let backoff = self.base_backoff.saturating_mul(1u32 << exp);
        backoff.min(self.max_backoff)
    }
}

impl RetryPolicy for DefaultRetryPolicy {
    fn decide(&self, outcome: &AttemptOutcome, attempt: u32) -> Option<Duration> {
        if attempt >= self.max_attempts {
            return None;
        }
        if outcome.transport {
            return Some(self.backoff_for(attempt));
        }
        match outcome.status {
            Some(429) => Some(outcome.retry_after.unwrap_or_else(|| self.backoff_for(attempt))),
            Some(status) if status >= 500 => Some(self.backoff_for(attempt)),
            _ => None,
        }
    }
}

/// Never retries; used where a single attempt is wanted (token fetches).
#[derive(Clone, Copy, Debug, Default)]
pub struct NoRetry;

impl RetryPolicy for NoRetry {
    fn decide(&self, _outcome: &AttemptOutcome, _attempt: u32) -> Option<Duration> {
        None
    }
}
