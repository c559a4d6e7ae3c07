//! Reconnection policy and backoff arithmetic
//!
//! The controller only configures the policy; the engine's I/O loop asks
//! [`ReconnectPolicy::decide`] what to do after the connection drops.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How the engine re-establishes a lost connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ReconnectPolicy {
    /// Never reconnect automatically; only an explicit `reconnect()` does
    Disabled,
    /// Retry with a growing delay between attempts
    Backoff {
        initial_delay_secs: u32,
        max_delay_secs: u32,
        #[serde(default = "default_exponential")]
        exponential_backoff: bool,
    },
}

fn default_exponential() -> bool {
    true
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::Backoff {
            initial_delay_secs: 1,
            max_delay_secs: 60 * 30,
            exponential_backoff: true,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before reconnection attempt `attempt` (1-based).
    ///
    /// Linear growth is `initial * attempt`, exponential is
    /// `initial * attempt^2`, both capped at the maximum. When the maximum is
    /// not above the initial delay the initial delay is used as-is.
    /// Returns `None` when reconnection is disabled.
    pub fn delay_for_attempt(&self, attempt: u32) -> Option<Duration> {
        match *self {
            ReconnectPolicy::Disabled => None,
            ReconnectPolicy::Backoff {
                initial_delay_secs,
                max_delay_secs,
                exponential_backoff,
            } => {
                let initial = u64::from(initial_delay_secs);
                let max = u64::from(max_delay_secs);
                let attempt = u64::from(attempt.max(1));
                let secs = if max > initial {
                    let factor = if exponential_backoff {
                        attempt.saturating_mul(attempt)
                    } else {
                        attempt
                    };
                    initial.saturating_mul(factor).min(max)
                } else {
                    initial
                };
                Some(Duration::from_secs(secs))
            }
        }
    }

    /// Decide what the I/O loop does after a connection loss
    pub fn decide(&self, attempts_so_far: u32, shutdown_requested: bool) -> ReconnectionDecision {
        if shutdown_requested {
            return ReconnectionDecision::AbortShutdownRequested;
        }
        let attempt = attempts_so_far.saturating_add(1);
        match self.delay_for_attempt(attempt) {
            Some(delay) => ReconnectionDecision::Proceed { attempt, delay },
            None => ReconnectionDecision::AbortDisabled,
        }
    }

    pub fn is_enabled(&self) -> bool {
        !matches!(self, ReconnectPolicy::Disabled)
    }

    /// Check the policy is usable
    pub fn validate(&self) -> Result<(), String> {
        if let ReconnectPolicy::Backoff {
            initial_delay_secs,
            max_delay_secs,
            ..
        } = self
        {
            if *initial_delay_secs == 0 {
                return Err("reconnect initial_delay_secs must be greater than 0".to_string());
            }
            if max_delay_secs < initial_delay_secs {
                return Err(format!(
                    "reconnect max_delay_secs ({max_delay_secs}) must not be below initial_delay_secs ({initial_delay_secs})"
                ));
            }
        }
        Ok(())
    }
}

/// Decision result for reconnection attempts
#[derive(Debug, PartialEq)]
pub enum ReconnectionDecision {
    /// Sleep for `delay`, then try again
    Proceed { attempt: u32, delay: Duration },
    /// Session is being torn down
    AbortShutdownRequested,
    /// Automatic reconnection is switched off
    AbortDisabled,
}
