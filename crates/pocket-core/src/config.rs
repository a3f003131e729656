//! ============================================================================
//! Agent Configuration
//! ============================================================================
//! Defaults come from the environment (loaded from `.env` by the binaries).
//! Unset variables use built-in defaults; unparsable ones are logged and
//! ignored.
//! ============================================================================

use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

use crate::agent::MAX_ROUNDS;
use crate::improvement::ReviewConfig;

const MS_PER_DAY: i64 = 24 * 60 * 60 * 1000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Memory database file; None resolves to ~/.pocket-agent/memory.redb
    pub db_path: Option<String>,
    /// LLM rounds per turn before giving up
    pub max_rounds: usize,
    /// Hours between self-improvement passes
    pub review_interval_hours: u64,
    /// Recent failed turns examined per pass
    pub review_failure_window: usize,
    /// Failures of one tool needed before a lesson is written
    pub lesson_threshold: usize,
    /// Age after which memory becomes prunable
    pub prune_max_age_days: i64,
    /// Recent turns counted in the health summary
    pub summary_window: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            db_path: std::env::var("POCKET_DB_PATH").ok(),
            max_rounds: env_parse("POCKET_MAX_ROUNDS", MAX_ROUNDS),
            review_interval_hours: env_parse("POCKET_REVIEW_INTERVAL_HOURS", 4),
            review_failure_window: 20,
            lesson_threshold: 3,
            prune_max_age_days: env_parse("POCKET_PRUNE_DAYS", 30),
            summary_window: 50,
        }
    }
}

impl AgentConfig {
    pub fn review_config(&self) -> ReviewConfig {
        ReviewConfig {
            failure_window: self.review_failure_window,
            lesson_threshold: self.lesson_threshold,
            prune_max_age_ms: self.prune_max_age_days.saturating_mul(MS_PER_DAY),
            summary_window: self.summary_window,
            ..ReviewConfig::default()
        }
    }

    pub fn review_interval(&self) -> Duration {
        Duration::from_secs(self.review_interval_hours.max(1) * 60 * 60)
    }
}

/// Parse an environment variable, falling back to `default` when unset or invalid
fn env_parse<T: FromStr + Copy + std::fmt::Debug>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => match raw.trim().parse() {
            Ok(value) => value,
            Err(_) => {
                warn!("Ignoring invalid {}={:?}, using {:?}", key, raw, default);
                default
            }
        },
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_parse_fallbacks() {
        std::env::set_var("POCKET_TEST_ROUNDS_VALID", " 12 ");
        std::env::set_var("POCKET_TEST_ROUNDS_INVALID", "twelve");

        assert_eq!(env_parse("POCKET_TEST_ROUNDS_VALID", 8usize), 12);
        assert_eq!(env_parse("POCKET_TEST_ROUNDS_INVALID", 8usize), 8);
        assert_eq!(env_parse("POCKET_TEST_ROUNDS_UNSET", 8usize), 8);
    }

    #[test]
    fn test_review_config_conversion() {
        let config = AgentConfig {
            db_path: None,
            max_rounds: 8,
            review_interval_hours: 4,
            review_failure_window: 20,
            lesson_threshold: 3,
            prune_max_age_days: 30,
            summary_window: 50,
        };

        let review = config.review_config();
        assert_eq!(review.prune_max_age_ms, 30 * MS_PER_DAY);
        assert_eq!(review.lesson_threshold, 3);
        assert_eq!(config.review_interval(), Duration::from_secs(4 * 3600));
    }
}
