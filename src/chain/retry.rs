// src/chain/retry.rs

use std::time::Duration;

use crate::types::BackoffKind;

/// Delay schedule between retries of one stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub kind: BackoffKind,
    pub base: Duration,
    pub factor: u32,
    pub max: Option<Duration>,
}

impl Backoff {
    pub fn fixed(base: Duration) -> Self {
        Self {
            kind: BackoffKind::Fixed,
            base,
            factor: 1,
            max: None,
        }
    }

    pub fn exponential(base: Duration, factor: u32, max: Option<Duration>) -> Self {
        Self {
            kind: BackoffKind::Exponential,
            base,
            factor,
            max,
        }
    }

    /// Delay before retry number `retries_so_far + 1`.
    ///
    /// `retries_so_far` is the cycle's `attempt_count` at the time of the
    /// failure (0 after the first attempt failed). Saturates instead of
    /// overflowing, so the sequence is non-decreasing for exponential and
    /// constant for fixed.
    pub fn delay_for(&self, retries_so_far: u32) -> Duration {
        match self.kind {
            BackoffKind::Fixed => self.base,
            BackoffKind::Exponential => {
                let mult = self.factor.max(1).saturating_pow(retries_so_far);
                let delay = self.base.saturating_mul(mult);
                match self.max {
                    Some(max) => delay.min(max),
                    None => delay,
                }
            }
        }
    }
}

/// Failure-recovery policy of one stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries allowed after the first attempt; `max_retries + 1` attempts in
    /// total before the cycle fails terminally.
    pub max_retries: u32,
    pub backoff: Backoff,
}

impl RetryPolicy {
    pub fn no_retries() -> Self {
        Self {
            max_retries: 0,
            backoff: Backoff::fixed(Duration::ZERO),
        }
    }

    /// Whether a failure at `attempt_count` still leaves a retry.
    pub fn allows_retry(&self, attempt_count: u32) -> bool {
        attempt_count < self.max_retries
    }
}
