//! Configuration loading and representation.
//!
//! Values come from the process environment with defaults for everything, so
//! an empty environment yields a working in-memory setup.

use std::time::Duration;

use thiserror::Error;

pub const ENV_COMMIT_MAX_ATTEMPTS: &str = "STOCKROOM_COMMIT_MAX_ATTEMPTS";
pub const ENV_COMMIT_BACKOFF_MS: &str = "STOCKROOM_COMMIT_BACKOFF_MS";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{key} must be an unsigned integer, got '{value}'")]
    NotANumber { key: &'static str, value: String },

    #[error("{key} must be at least 1")]
    ZeroAttempts { key: &'static str },
}

/// How often a command is re-run after an optimistic concurrency conflict.
///
/// Every attempt reloads the aggregate and decides again from fresh state.
/// The delay before attempt `n` (1-based, `n > 1`) is `backoff * (n - 1)`.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
        }
    }

    /// A single attempt, never retried.
    pub fn no_retry() -> Self {
        Self::new(1, Duration::ZERO)
    }

    /// Saturates at `Duration::MAX` for absurd backoff settings.
    pub fn delay_before(&self, attempt: u32) -> Duration {
        self.backoff
            .checked_mul(attempt.saturating_sub(1))
            .unwrap_or(Duration::MAX)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::ZERO)
    }
}

#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct InfraConfig {
    pub retry: RetryPolicy,
}

impl InfraConfig {
    /// Load from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load through an arbitrary key lookup (tests pass a map here).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = RetryPolicy::default();

        let max_attempts = match parse_u64(&lookup, ENV_COMMIT_MAX_ATTEMPTS)? {
            Some(0) => {
                return Err(ConfigError::ZeroAttempts {
                    key: ENV_COMMIT_MAX_ATTEMPTS,
                });
            }
            Some(n) => u32::try_from(n).unwrap_or(u32::MAX),
            None => defaults.max_attempts,
        };
        let backoff = parse_u64(&lookup, ENV_COMMIT_BACKOFF_MS)?
            .map(Duration::from_millis)
            .unwrap_or(defaults.backoff);

        Ok(Self {
            retry: RetryPolicy::new(max_attempts, backoff),
        })
    }
}

fn parse_u64<F>(lookup: &F, key: &'static str) -> Result<Option<u64>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) if raw.trim().is_empty() => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|_| ConfigError::NotANumber { key, value: raw }),
    }
}
