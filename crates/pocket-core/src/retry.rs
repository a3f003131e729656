//! ============================================================================
//! Retry Logic - Exponential Backoff for Maintenance Runs
//! ============================================================================
//! A failed maintenance pass is retried later rather than immediately:
//! - Exponential backoff with jitter between attempts
//! - Error classification (retryable vs permanent)
//! ============================================================================

use rand::Rng;
use std::time::Duration;

/// Configuration for retry behavior
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts per scheduled run, first attempt included
    pub max_attempts: u32,
    /// Base delay between retries (will be multiplied by 2^attempt)
    pub base_delay_ms: u64,
    /// Maximum delay between retries
    pub max_delay_ms: u64,
    /// Whether to add jitter to delays
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay_ms: 30_000,
            max_delay_ms: 15 * 60 * 1000,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// Whether another attempt may follow attempt number `attempt` (0-based)
    pub fn allows_retry(&self, attempt: u32, kind: ErrorKind) -> bool {
        kind == ErrorKind::Retryable && attempt + 1 < self.max_attempts
    }
}

/// Error classification for retry decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Error is likely transient, should retry
    Retryable,
    /// Error is permanent, don't retry
    Permanent,
}

/// Classify an error to determine if retry is appropriate
pub fn classify_error(error: &str) -> ErrorKind {
    let lower = error.to_lowercase();

    // Stored data is unreadable; retrying reads the same bytes
    if lower.contains("corrupt")
        || lower.contains("failed to deserialize")
        || lower.contains("upgrade required")
        || lower.contains("cannot determine home directory")
    {
        return ErrorKind::Permanent;
    }

    // Default to retryable: I/O hiccups, storage full, lock contention
    ErrorKind::Retryable
}

/// Backoff after attempt `attempt` (0-based): `base * 2^attempt`, capped at
/// `max_delay_ms`, plus up to half again at random when jitter is on
pub fn calculate_delay(attempt: u32, config: &RetryConfig) -> Duration {
    let exponential = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
    let delay = config
        .base_delay_ms
        .saturating_mul(exponential)
        .min(config.max_delay_ms);

    let jitter = if config.jitter && delay > 1 {
        rand::thread_rng().gen_range(0..=delay / 2)
    } else {
        0
    };

    Duration::from_millis(delay.saturating_add(jitter))
}
