//! Runtime settings threaded through every constructor.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;
use validator::Validate;

use crate::error::{ConfigError, Result};
use crate::poll::{Poller, RetryPolicy};

/// Default worker count for the copy and backup phases.
pub const DEFAULT_MAX_CONCURRENT: usize = 5;

/// Tunables for workflows and resource backends.
///
/// Loaded from the `settings` section of the network file, then overridden
/// by `STATECRAFT_*` environment variables and CLI flags.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct Settings {
    /// Workers copying artifacts to machines.
    #[validate(range(min = 1, max = 256))]
    pub max_concurrent_copy: usize,
    /// Workers running per-machine backup operations.
    #[validate(range(min = 1, max = 256))]
    pub max_concurrent_backup: usize,
    /// Delay between provider status checks.
    #[validate(range(min = 1))]
    pub poll_interval_secs: u64,
    /// Budget for a created object to become ready.
    pub create_timeout_secs: u64,
    /// Budget for a clean stop before forcing it.
    pub stop_timeout_secs: u64,
    /// Budget for a forced stop before forcing it again.
    pub force_stop_timeout_secs: u64,
    /// Budget for SSH to come up after boot.
    pub ssh_timeout_secs: u64,
    /// Attempts for calls rejected with transient errors.
    #[validate(range(min = 1, max = 50))]
    pub retry_attempts: u32,
    /// Upper bound of one retry backoff.
    pub retry_max_delay_secs: u64,
    /// Fixed answer for confirmation prompts.
    #[serde(skip)]
    pub auto_response: Option<bool>,
    /// Scales every delay and budget from seconds down to milliseconds.
    #[serde(skip)]
    pub test_mode: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            max_concurrent_copy: DEFAULT_MAX_CONCURRENT,
            max_concurrent_backup: DEFAULT_MAX_CONCURRENT,
            poll_interval_secs: 5,
            create_timeout_secs: 900,
            stop_timeout_secs: 600,
            force_stop_timeout_secs: 120,
            ssh_timeout_secs: 600,
            retry_attempts: 7,
            retry_max_delay_secs: 30,
            auto_response: None,
            test_mode: false,
        }
    }
}

impl Settings {
    /// Settings for tests: every delay is a millisecond and prompts are
    /// auto-approved.
    #[must_use]
    pub fn for_tests() -> Self {
        Self {
            auto_response: Some(true),
            test_mode: true,
            ..Self::default()
        }
    }

    /// Converts a configured number of seconds into a duration.
    #[must_use]
    pub const fn duration(&self, secs: u64) -> Duration {
        if self.test_mode {
            Duration::from_millis(secs)
        } else {
            Duration::from_secs(secs)
        }
    }

    /// Poller with the configured interval and the given budget.
    #[must_use]
    pub const fn poller(&self, timeout_secs: u64) -> Poller {
        Poller::new(self.duration(self.poll_interval_secs), self.duration(timeout_secs))
    }

    /// Poller with the configured interval and no budget.
    #[must_use]
    pub const fn unbounded_poller(&self) -> Poller {
        Poller::unbounded(self.duration(self.poll_interval_secs))
    }

    /// Retry policy for transient provider errors.
    #[must_use]
    pub const fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry_attempts,
            base_delay: self.duration(1),
            max_delay: self.duration(self.retry_max_delay_secs),
        }
    }

    /// Applies `STATECRAFT_*` environment overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if an override does not parse.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        if let Some(value) = env_number("STATECRAFT_MAX_CONCURRENT_COPY")? {
            debug!("Overriding max_concurrent_copy from environment");
            self.max_concurrent_copy = value;
        }
        if let Some(value) = env_number("STATECRAFT_MAX_CONCURRENT_BACKUP")? {
            debug!("Overriding max_concurrent_backup from environment");
            self.max_concurrent_backup = value;
        }
        if let Ok(value) = std::env::var("STATECRAFT_AUTO_CONFIRM") {
            debug!("Overriding auto_response from environment");
            self.auto_response = match value.to_lowercase().as_str() {
                "yes" | "true" | "1" => Some(true),
                "no" | "false" | "0" => Some(false),
                _ => {
                    return Err(ConfigError::validation(
                        format!("expected yes or no, got '{value}'"),
                        "STATECRAFT_AUTO_CONFIRM",
                    )
                    .into());
                }
            };
        }
        Ok(())
    }

    /// Checks value ranges.
    ///
    /// # Errors
    ///
    /// Returns a validation error naming the first offending field.
    pub fn check(&self) -> Result<()> {
        self.validate().map_err(|errors| {
            let field = errors
                .field_errors()
                .keys()
                .next()
                .map_or_else(String::new, ToString::to_string);
            ConfigError::validation(format!("invalid settings: {errors}"), field).into()
        })
    }
}

fn env_number(name: &str) -> Result<Option<usize>> {
    match std::env::var(name) {
        Ok(value) => value.parse().map(Some).map_err(|_| {
            ConfigError::validation(format!("expected a number, got '{value}'"), name).into()
        }),
        Err(_) => Ok(None),
    }
}
