// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Connection Retry Policy
//!
//! Connection attempts are retried with a fixed delay unless another
//! [`Backoff`] is configured.

use crate::config::ConnectionParams;
use std::{fmt, sync::Arc, time::Duration};

/// Computes the delay to wait after a failed attempt.
#[derive(Clone, Default)]
pub enum Backoff {
    /// Always wait the base delay.
    #[default]
    Fixed,
    /// Multiply the base delay by `factor` per failed attempt, capped at `max`.
    Exponential { factor: u32, max: Duration },
    /// Caller supplied strategy, given the failed attempt number (starting
    /// at 1) and the base delay.
    Custom(Arc<dyn Fn(u32, Duration) -> Duration + Send + Sync>),
}

impl fmt::Debug for Backoff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Backoff::Fixed => write!(f, "Fixed"),
            Backoff::Exponential { factor, max } => f
                .debug_struct("Exponential")
                .field("factor", factor)
                .field("max", max)
                .finish(),
            Backoff::Custom(_) => write!(f, "Custom"),
        }
    }
}

/// How many times a connection is dialed and how long to wait in between.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub(crate) max_attempts: u32,
    pub(crate) delay: Duration,
    pub(crate) backoff: Backoff,
}

impl RetryPolicy {
    /// Creates a fixed-delay policy.
    ///
    /// # Parameters
    /// * `max_attempts` - Total attempts; zero still performs one
    /// * `delay` - Base delay between attempts
    ///
    /// # Examples
    /// ```
    /// use apexmq::retry::RetryPolicy;
    /// use std::time::Duration;
    ///
    /// let policy = RetryPolicy::new(0, Duration::from_secs(2));
    ///
    /// assert_eq!(policy.max_attempts(), 1);
    /// assert_eq!(policy.delay_after(1), Duration::from_secs(2));
    /// ```
    pub fn new(max_attempts: u32, delay: Duration) -> RetryPolicy {
        RetryPolicy {
            max_attempts: max_attempts.max(1),
            delay,
            backoff: Backoff::Fixed,
        }
    }

    /// The policy configured by `MAX_RETRIES` and `RETRY_DELAY`.
    pub fn from_params(params: &ConnectionParams) -> RetryPolicy {
        RetryPolicy::new(params.max_retries, params.retry_delay)
    }

    /// Replaces the fixed-delay strategy.
    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Always at least one.
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn base_delay(&self) -> Duration {
        self.delay
    }

    /// Delay to wait after the given failed attempt (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        match &self.backoff {
            Backoff::Fixed => self.delay,
            Backoff::Exponential { factor, max } => {
                let exp = attempt.saturating_sub(1);
                let multiplier = factor.saturating_pow(exp);
                self.delay.saturating_mul(multiplier).min(*max)
            }
            Backoff::Custom(strategy) => strategy(attempt, self.delay),
        }
    }
}
