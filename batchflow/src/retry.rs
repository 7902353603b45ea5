//! Retry policy with per-class budgets, backoff and jitter.
//!
//! Upstream failures and timeouts share one budget and back off
//! exponentially. Rate-limit signals have their own budget and always wait the
//! full cooldown. Every other class is never retried here.

use crate::errors::{FailureClass, StageError};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Backoff strategy for retry delays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum BackoffStrategy {
    /// delay = base * 2^attempt
    #[default]
    Exponential,
    /// delay = base * (attempt + 1)
    Linear,
    /// delay = base
    Constant,
}

/// Jitter strategy to spread out concurrent retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum JitterStrategy {
    /// No jitter
    None,
    /// Random from 0 to delay
    #[default]
    Full,
    /// Half fixed, half random
    Equal,
    /// min(max, random(base, prev * 3))
    Decorrelated,
}

/// How a stage is retried.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts allowed for upstream failures and timeouts.
    pub max_attempts: u32,
    /// Base backoff delay.
    pub backoff_base: Duration,
    /// Backoff ceiling.
    pub max_backoff: Duration,
    /// Backoff strategy.
    pub backoff_strategy: BackoffStrategy,
    /// Jitter strategy.
    pub jitter: JitterStrategy,
    /// Wait after a rate-limit signal.
    pub rate_limit_cooldown: Duration,
    /// Rate-limit retries allowed.
    pub rate_limit_max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            backoff_strategy: BackoffStrategy::Exponential,
            jitter: JitterStrategy::Full,
            rate_limit_cooldown: Duration::from_secs(60),
            rate_limit_max_attempts: 3,
        }
    }
}

impl RetryPolicy {
    /// Creates a policy allowing `max_attempts` tries for transient failures.
    #[must_use]
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Self::default()
        }
    }

    /// A policy that never retries.
    #[must_use]
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            rate_limit_max_attempts: 0,
            ..Self::default()
        }
    }

    /// Sets the base backoff delay.
    #[must_use]
    pub fn with_backoff_base(mut self, base: Duration) -> Self {
        self.backoff_base = base;
        self
    }

    /// Sets the backoff ceiling.
    #[must_use]
    pub fn with_max_backoff(mut self, max: Duration) -> Self {
        self.max_backoff = max;
        self
    }

    /// Sets the backoff strategy.
    #[must_use]
    pub fn with_backoff(mut self, strategy: BackoffStrategy) -> Self {
        self.backoff_strategy = strategy;
        self
    }

    /// Sets the jitter strategy.
    #[must_use]
    pub fn with_jitter(mut self, strategy: JitterStrategy) -> Self {
        self.jitter = strategy;
        self
    }

    /// Sets the rate-limit cooldown and retry budget.
    #[must_use]
    pub fn with_rate_limit(mut self, cooldown: Duration, max_attempts: u32) -> Self {
        self.rate_limit_cooldown = cooldown;
        self.rate_limit_max_attempts = max_attempts;
        self
    }
}

/// Outcome of a retry decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry after the specified delay.
    Retry(Duration),
    /// The class is retryable but its budget is spent.
    GiveUp,
    /// The class is never retried here.
    NotRetryable,
}

/// Retry bookkeeping for one stage run.
#[derive(Debug, Default, Clone)]
pub struct RetryState {
    transient_failures: u32,
    rate_limited: u32,
    previous_delay_ms: Option<u64>,
}

impl RetryState {
    /// Creates a fresh state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Upstream failures and timeouts seen so far.
    #[must_use]
    pub fn transient_failures(&self) -> u32 {
        self.transient_failures
    }

    /// Rate-limit signals seen so far.
    #[must_use]
    pub fn rate_limited(&self) -> u32 {
        self.rate_limited
    }

    /// Records a failure and decides what to do next.
    pub fn decide(&mut self, policy: &RetryPolicy, error: &StageError) -> RetryDecision {
        match error.class {
            FailureClass::RateLimited => {
                self.rate_limited += 1;
                if self.rate_limited > policy.rate_limit_max_attempts {
                    RetryDecision::GiveUp
                } else {
                    RetryDecision::Retry(policy.rate_limit_cooldown)
                }
            }
            FailureClass::UpstreamFailure | FailureClass::Timeout => {
                self.transient_failures += 1;
                if self.transient_failures >= policy.max_attempts {
                    RetryDecision::GiveUp
                } else {
                    RetryDecision::Retry(self.backoff_delay(self.transient_failures - 1, policy))
                }
            }
            FailureClass::Fatal
            | FailureClass::DataNotReady
            | FailureClass::ResourceExhausted
            | FailureClass::Cancelled => RetryDecision::NotRetryable,
        }
    }

    /// Computes the backoff delay before retry number `attempt` (0-indexed).
    pub fn backoff_delay(&mut self, attempt: u32, policy: &RetryPolicy) -> Duration {
        let base = duration_ms(policy.backoff_base);
        let max = duration_ms(policy.max_backoff);

        let delay = match policy.backoff_strategy {
            BackoffStrategy::Exponential => base.saturating_mul(2u64.saturating_pow(attempt)),
            BackoffStrategy::Linear => base.saturating_mul(u64::from(attempt) + 1),
            BackoffStrategy::Constant => base,
        }
        .min(max);

        let jittered = match policy.jitter {
            JitterStrategy::None => delay,
            JitterStrategy::Full => {
                if delay == 0 {
                    0
                } else {
                    rand::thread_rng().gen_range(0..=delay)
                }
            }
            JitterStrategy::Equal => {
                let half = delay / 2;
                if half == 0 {
                    delay
                } else {
                    half + rand::thread_rng().gen_range(0..=half)
                }
            }
            JitterStrategy::Decorrelated => {
                let prev = self.previous_delay_ms.unwrap_or(base);
                let upper = prev.saturating_mul(3).min(max);
                if upper <= base {
                    base
                } else {
                    rand::thread_rng().gen_range(base..=upper)
                }
            }
        };

        self.previous_delay_ms = Some(jittered);
        Duration::from_millis(jittered)
    }
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn fixed(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(max_attempts)
            .with_backoff_base(Duration::from_millis(100))
            .with_jitter(JitterStrategy::None)
    }

    #[test]
    fn test_policy_builder() {
        let policy = RetryPolicy::new(5)
            .with_backoff_base(Duration::from_millis(500))
            .with_max_backoff(Duration::from_secs(10))
            .with_backoff(BackoffStrategy::Linear)
            .with_rate_limit(Duration::from_secs(30), 2);

        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.backoff_strategy, BackoffStrategy::Linear);
        assert_eq!(policy.rate_limit_cooldown, Duration::from_secs(30));
        assert_eq!(policy.rate_limit_max_attempts, 2);
        assert_eq!(policy.jitter, JitterStrategy::Full);
    }

    #[test]
    fn test_exponential_backoff_without_jitter() {
        let policy = fixed(5);
        let mut state = RetryState::new();
        let delays: Vec<_> = (0..3).map(|a| state.backoff_delay(a, &policy)).collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(400)
            ]
        );
    }

    #[test]
    fn test_linear_and_constant_backoff() {
        let mut state = RetryState::new();
        let linear = fixed(5).with_backoff(BackoffStrategy::Linear);
        assert_eq!(state.backoff_delay(2, &linear), Duration::from_millis(300));

        let constant = fixed(5).with_backoff(BackoffStrategy::Constant);
        assert_eq!(state.backoff_delay(7, &constant), Duration::from_millis(100));
    }

    #[test]
    fn test_backoff_capped_at_max() {
        let policy = fixed(5)
            .with_backoff_base(Duration::from_secs(1))
            .with_max_backoff(Duration::from_secs(5));
        let mut state = RetryState::new();
        assert_eq!(state.backoff_delay(40, &policy), Duration::from_secs(5));
    }

    #[test]
    fn test_jittered_delays_stay_in_bounds() {
        let mut state = RetryState::new();
        let full = fixed(5).with_jitter(JitterStrategy::Full);
        let equal = fixed(5).with_jitter(JitterStrategy::Equal);
        let decorrelated = fixed(5)
            .with_jitter(JitterStrategy::Decorrelated)
            .with_max_backoff(Duration::from_millis(900));

        for _ in 0..20 {
            assert!(state.backoff_delay(0, &full) <= Duration::from_millis(100));
            let d = state.backoff_delay(0, &equal);
            assert!(d >= Duration::from_millis(50) && d <= Duration::from_millis(100));
            let d = state.backoff_delay(0, &decorrelated);
            assert!(d >= Duration::from_millis(100) && d <= Duration::from_millis(900));
        }
    }

    #[test]
    fn test_transient_budget() {
        let policy = fixed(3);
        let mut state = RetryState::new();
        let err = StageError::upstream("503");

        assert_eq!(state.decide(&policy, &err), RetryDecision::Retry(Duration::from_millis(100)));
        assert_eq!(
            state.decide(&policy, &StageError::timeout(crate::core::StageKind::Process, Duration::from_secs(1))),
            RetryDecision::Retry(Duration::from_millis(200))
        );
        assert_eq!(state.decide(&policy, &err), RetryDecision::GiveUp);
        assert_eq!(state.transient_failures(), 3);
    }

    #[test]
    fn test_rate_limit_budget_is_separate() {
        let policy = fixed(2).with_rate_limit(Duration::from_secs(60), 2);
        let mut state = RetryState::new();
        let limited = StageError::rate_limited("429");

        assert_eq!(state.decide(&policy, &limited), RetryDecision::Retry(Duration::from_secs(60)));
        assert_eq!(state.decide(&policy, &StageError::upstream("500")), RetryDecision::Retry(Duration::from_millis(100)));
        assert_eq!(state.decide(&policy, &limited), RetryDecision::Retry(Duration::from_secs(60)));
        assert_eq!(state.decide(&policy, &limited), RetryDecision::GiveUp);
        assert_eq!(state.rate_limited(), 3);
        assert_eq!(state.transient_failures(), 1);
    }

    #[test]
    fn test_non_retryable_classes() {
        let policy = RetryPolicy::default();
        let mut state = RetryState::new();
        for err in [
            StageError::fatal("bad"),
            StageError::data_not_ready("missing"),
            StageError::cancelled("stop"),
            StageError::resource_exhausted("upload", Duration::from_secs(1)),
        ] {
            assert_eq!(state.decide(&policy, &err), RetryDecision::NotRetryable);
        }
    }

    #[test]
    fn test_no_retry_policy() {
        let policy = RetryPolicy::no_retry();
        let mut state = RetryState::new();
        assert_eq!(state.decide(&policy, &StageError::upstream("x")), RetryDecision::GiveUp);
        assert_eq!(state.decide(&policy, &StageError::rate_limited("x")), RetryDecision::GiveUp);
    }
}
