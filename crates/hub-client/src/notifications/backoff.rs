//! Capped exponential backoff for the push channel.
//!
//! `delay = min(base * 2^attempt, max)`, optionally with jitter that never pushes the
//! delay past `max`.

use rand::RngExt;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{ClientError, Result};

/// Reconnection settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    /// Delay before the first reconnection.
    pub base_delay_ms: u64,
    /// Hard cap on the computed delay.
    pub max_delay_ms: u64,
    /// Consecutive abnormal closures tolerated before giving up.
    pub max_attempts: u32,
    /// When true, adds random jitter of [0, base/2).
    pub jitter: bool,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: 1000,
            max_delay_ms: 30_000,
            max_attempts: 5,
            jitter: false,
        }
    }
}

impl ReconnectPolicy {
    pub fn new(base: Duration, max: Duration, max_attempts: u32) -> Self {
        Self {
            base_delay_ms: base.as_millis() as u64,
            max_delay_ms: max.as_millis() as u64,
            max_attempts,
            jitter: false,
        }
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.base_delay_ms == 0 {
            return Err(ClientError::config("reconnect.base_delay_ms must be > 0"));
        }
        if self.max_delay_ms < self.base_delay_ms {
            return Err(ClientError::config(
                "reconnect.max_delay_ms must be >= reconnect.base_delay_ms",
            ));
        }
        Ok(())
    }

    /// Compute the delay for a given attempt number (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = Duration::from_millis(self.base_delay_ms);
        let max = Duration::from_millis(self.max_delay_ms);

        // Attempts >= 32 saturate instead of overflowing the shift.
        let multiplier = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        let capped = base.checked_mul(multiplier).unwrap_or(max).min(max);

        if !self.jitter {
            return capped;
        }

        let jitter_range_ms = self.base_delay_ms / 2;
        let remaining_ms = u64::try_from(max.saturating_sub(capped).as_millis()).unwrap_or(0);
        let jitter_limit_ms = jitter_range_ms.min(remaining_ms);
        if jitter_limit_ms == 0 {
            return capped;
        }

        let jitter_ms = rand::rng().random_range(0..jitter_limit_ms);
        (capped + Duration::from_millis(jitter_ms)).min(max)
    }
}

/// Attempt bookkeeping for one channel.
///
/// Reset on every successful open, incremented on every abnormal close. Once the
/// counter exceeds `max_attempts` the channel gives up.
#[derive(Debug, Clone)]
pub struct ReconnectState {
    policy: ReconnectPolicy,
    attempt: u32,
}

impl ReconnectState {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self { policy, attempt: 0 }
    }

    #[inline]
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    #[inline]
    pub fn policy(&self) -> &ReconnectPolicy {
        &self.policy
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Record an abnormal closure.
    ///
    /// Returns the delay before the next attempt, or `None` once the budget is spent.
    pub fn on_abnormal_close(&mut self) -> Option<Duration> {
        self.attempt = self.attempt.saturating_add(1);
        if self.is_exhausted() {
            return None;
        }
        Some(self.policy.delay_for_attempt(self.attempt - 1))
    }

    #[inline]
    pub fn is_exhausted(&self) -> bool {
        self.attempt > self.policy.max_attempts
    }
}
