//! Refresh scheduling and retry policy
//!
//! Everything here is a pure computation over a [`Token`] and its configuration.
//! The token manager consults the policy after every acquisition attempt to
//! decide when to refresh next, or how long to wait before trying again.

use std::time::Duration;

use credstream_clock::UnixTime;
use thiserror::Error;

use crate::Token;

/// Default fraction of a token's lifetime after which it is due for refresh
pub const DEFAULT_EXPIRATION_REFRESH_RATIO: f64 = 0.8;
/// Default minimum time before expiry at which a refresh must be due
pub const DEFAULT_LOWER_REFRESH_BOUND: Duration = Duration::from_millis(0);
/// Default number of attempts in a single acquisition cycle
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
/// Default fixed delay between attempts in a single acquisition cycle
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(3);

/// An invalid refresh or retry configuration
#[derive(Clone, Debug, Error, PartialEq)]
pub enum ConfigError {
    /// The expiration refresh ratio was outside of `(0, 1]`
    #[error("expiration refresh ratio must be within (0, 1], got {0}")]
    InvalidRefreshRatio(f64),
    /// An acquisition cycle must be allowed at least one attempt
    #[error("max attempts must be at least 1")]
    NoAttempts,
}

/// Configuration for retrying a failed acquisition
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u32,
    delay: Duration,
}

impl Default for RetryPolicy {
    /// Default retry policy
    ///
    /// Makes up to 3 attempts, waiting 3 ms between each.
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            delay: DEFAULT_RETRY_DELAY,
        }
    }
}

impl RetryPolicy {
    /// Constructs a new retry policy
    ///
    /// An acquisition cycle will make up to `max_attempts` attempts, waiting a fixed
    /// `delay` after each failure.
    pub fn new(max_attempts: u32, delay: Duration) -> Result<Self, ConfigError> {
        if max_attempts == 0 {
            return Err(ConfigError::NoAttempts);
        }

        Ok(Self {
            max_attempts,
            delay,
        })
    }

    /// The maximum number of attempts in one acquisition cycle
    #[inline]
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// The fixed delay between attempts
    #[inline]
    pub fn delay(&self) -> Duration {
        self.delay
    }
}

/// Configuration for determining when a token should be refreshed
#[derive(Clone, Debug, PartialEq)]
pub struct RefreshConfig {
    expiration_refresh_ratio: f64,
    lower_refresh_bound: Duration,
    retry: RetryPolicy,
    request_timeout: Option<Duration>,
}

impl Default for RefreshConfig {
    /// Default refresh configuration
    ///
    /// Refreshes once 80% of the token's lifetime has passed, with no lower
    /// bound, using the default [`RetryPolicy`] and no request timeout.
    fn default() -> Self {
        Self {
            expiration_refresh_ratio: DEFAULT_EXPIRATION_REFRESH_RATIO,
            lower_refresh_bound: DEFAULT_LOWER_REFRESH_BOUND,
            retry: RetryPolicy::default(),
            request_timeout: None,
        }
    }
}

impl RefreshConfig {
    /// Constructs a new refresh configuration
    ///
    /// A token will be due for refresh once `expiration_refresh_ratio` of its lifetime
    /// has passed, and always with at least `lower_refresh_bound` remaining before
    /// it expires.
    pub fn new(
        expiration_refresh_ratio: f64,
        lower_refresh_bound: Duration,
        retry: RetryPolicy,
    ) -> Result<Self, ConfigError> {
        if !(expiration_refresh_ratio > 0.0 && expiration_refresh_ratio <= 1.0) {
            return Err(ConfigError::InvalidRefreshRatio(expiration_refresh_ratio));
        }

        Ok(Self {
            expiration_refresh_ratio,
            lower_refresh_bound,
            retry,
            request_timeout: None,
        })
    }

    /// Bounds each individual identity provider request
    ///
    /// A request that does not complete in time counts as a failed attempt.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    /// The fraction of a token's lifetime after which it is due for refresh
    #[inline]
    pub fn expiration_refresh_ratio(&self) -> f64 {
        self.expiration_refresh_ratio
    }

    /// The minimum time before expiry at which a refresh must be due
    #[inline]
    pub fn lower_refresh_bound(&self) -> Duration {
        self.lower_refresh_bound
    }

    /// The retry policy for failed acquisitions
    #[inline]
    pub fn retry(&self) -> RetryPolicy {
        self.retry
    }

    /// The bound on a single identity provider request, if any
    #[inline]
    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout
    }

    /// The time at which `token` becomes due for refresh
    ///
    /// This is the earlier of the ratio point of the token's lifetime and
    /// `expires_at - lower_refresh_bound`.
    pub fn refresh_deadline(&self, token: &Token) -> UnixTime {
        let by_ratio = token.issued_at() + token.lifetime().mul_f64(self.expiration_refresh_ratio);
        let by_bound = token.expires_at() - self.lower_refresh_bound;
        by_ratio.min(by_bound)
    }

    /// How long to wait, as of `now`, before refreshing `token`
    ///
    /// Zero if the token is already due.
    pub fn next_refresh_delay(&self, token: &Token, now: UnixTime) -> Duration {
        self.refresh_deadline(token) - now
    }
}

/// How long to wait before the next acquisition attempt
///
/// After a successful fetch this is the time until `token` becomes due; after a
/// failed attempt it is the fixed retry delay.
pub fn next_delay(token: &Token, config: &RefreshConfig, attempt_failed: bool, now: UnixTime) -> Duration {
    if attempt_failed {
        config.retry.delay
    } else {
        config.next_refresh_delay(token, now)
    }
}

/// The outcome of recording a failed attempt
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetryDecision {
    /// Attempts remain; try again after the delay
    RetryAfter(Duration),
    /// Attempts are exhausted; the cycle has failed
    GiveUp,
}

/// Tracks consecutive failures within a single acquisition cycle
#[derive(Debug)]
pub struct RetryState {
    policy: RetryPolicy,
    failures: u32,
}

impl RetryState {
    /// Starts tracking a new acquisition cycle
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            failures: 0,
        }
    }

    /// The number of failed attempts recorded so far
    #[inline]
    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Reports a failure and decides whether to try again
    pub fn record_failure(&mut self) -> RetryDecision {
        self.failures = self.failures.saturating_add(1);
        if self.failures >= self.policy.max_attempts {
            RetryDecision::GiveUp
        } else {
            RetryDecision::RetryAfter(self.policy.delay)
        }
    }
}

impl From<RetryPolicy> for RetryState {
    fn from(policy: RetryPolicy) -> Self {
        Self::new(policy)
    }
}

#[cfg(test)]
mod tests {
    use color_eyre::Result;

    use super::*;

    fn hour_token() -> Result<Token> {
        Ok(Token::new("x", UnixTime(0), UnixTime(3_600_000))?)
    }

    #[test]
    fn refresh_is_due_at_the_ratio_of_the_lifetime() -> Result<()> {
        let config = RefreshConfig::new(0.75, Duration::ZERO, RetryPolicy::default())?;
        let token = hour_token()?;

        assert_eq!(config.refresh_deadline(&token), UnixTime(2_700_000));
        assert_eq!(
            config.next_refresh_delay(&token, UnixTime(700_000)),
            Duration::from_secs(2_000)
        );
        Ok(())
    }

    #[test]
    fn lower_bound_pulls_the_refresh_earlier() -> Result<()> {
        let config = RefreshConfig::new(0.9, Duration::from_secs(30 * 60), RetryPolicy::default())?;
        let token = hour_token()?;

        assert_eq!(config.refresh_deadline(&token), UnixTime(1_800_000));
        Ok(())
    }

    #[test]
    fn tiny_ratio_refreshes_almost_immediately() -> Result<()> {
        let config = RefreshConfig::new(0.00001, Duration::ZERO, RetryPolicy::default())?;
        let token = hour_token()?;

        assert_eq!(config.next_refresh_delay(&token, UnixTime(0)), Duration::from_millis(36));
        Ok(())
    }

    #[test]
    fn delay_saturates_once_due() -> Result<()> {
        let config = RefreshConfig::default();
        let token = hour_token()?;

        assert_eq!(config.next_refresh_delay(&token, UnixTime(3_000_000)), Duration::ZERO);
        assert_eq!(config.next_refresh_delay(&token, UnixTime(9_000_000)), Duration::ZERO);
        Ok(())
    }

    #[test]
    fn failed_attempts_use_the_fixed_delay() -> Result<()> {
        let retry = RetryPolicy::new(3, Duration::from_millis(50))?;
        let config = RefreshConfig::new(0.5, Duration::ZERO, retry)?;
        let token = hour_token()?;

        assert_eq!(next_delay(&token, &config, true, UnixTime(0)), Duration::from_millis(50));
        assert_eq!(next_delay(&token, &config, false, UnixTime(0)), Duration::from_secs(1_800));
        Ok(())
    }

    #[test]
    fn gives_up_after_max_attempts() -> Result<()> {
        let mut state = RetryState::new(RetryPolicy::new(3, Duration::from_millis(50))?);

        assert_eq!(state.record_failure(), RetryDecision::RetryAfter(Duration::from_millis(50)));
        assert_eq!(state.record_failure(), RetryDecision::RetryAfter(Duration::from_millis(50)));
        assert_eq!(state.record_failure(), RetryDecision::GiveUp);
        assert_eq!(state.failures(), 3);
        Ok(())
    }

    #[test]
    fn single_attempt_gives_up_immediately() -> Result<()> {
        let mut state = RetryState::from(RetryPolicy::new(1, Duration::from_secs(1))?);
        assert_eq!(state.record_failure(), RetryDecision::GiveUp);
        Ok(())
    }

    #[test]
    fn rejects_invalid_configuration() {
        assert_eq!(
            RefreshConfig::new(0.0, Duration::ZERO, RetryPolicy::default()),
            Err(ConfigError::InvalidRefreshRatio(0.0))
        );
        assert!(RefreshConfig::new(1.5, Duration::ZERO, RetryPolicy::default()).is_err());
        assert!(RefreshConfig::new(f64::NAN, Duration::ZERO, RetryPolicy::default()).is_err());
        assert!(RefreshConfig::new(1.0, Duration::ZERO, RetryPolicy::default()).is_ok());
        assert_eq!(RetryPolicy::new(0, Duration::ZERO), Err(ConfigError::NoAttempts));
    }
}
