//! Session configuration
//!
//! Defaults are overridable from the environment, one variable per knob.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration for a unit-of-work session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Bounded wait for pessimistic row locks, in milliseconds.
    pub lock_wait_ms: u64,
    /// Page size used when the caller does not supply one.
    pub default_page_size: i64,
    /// Upper bound on caller-supplied page sizes.
    pub max_page_size: i64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            lock_wait_ms: 1_000,
            default_page_size: 20,
            max_page_size: 1_000,
        }
    }
}

impl SessionConfig {
    /// Load configuration from environment variables, falling back to
    /// defaults for anything unset or unparsable.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(ms) = std::env::var("DM_LOCK_WAIT_MS") {
            config.lock_wait_ms = ms.parse().unwrap_or(config.lock_wait_ms);
        }
        if let Ok(size) = std::env::var("DM_DEFAULT_PAGE_SIZE") {
            config.default_page_size = size.parse().unwrap_or(config.default_page_size);
        }
        if let Ok(size) = std::env::var("DM_MAX_PAGE_SIZE") {
            config.max_page_size = size.parse().unwrap_or(config.max_page_size);
        }
        config
    }

    pub fn lock_wait(&self) -> Duration {
        Duration::from_millis(self.lock_wait_ms)
    }
}
