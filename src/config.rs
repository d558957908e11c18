//! Service configuration
//!
//! Loaded from environment variables with defaults for everything.

use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ServiceConfig {
    pub retry: RetryPolicy,
    pub pages: PageLimits,
    pub storage: StorageConfig,
}

/// How often a conflicting write is retried before `ConflictRetryable` is surfaced.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one
    pub max_attempts: u32,
    /// Backoff before the second attempt, doubled each time after
    pub base_backoff_ms: u64,
    /// Upper bound for a single backoff
    pub max_backoff_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PageLimits {
    pub default_limit: usize,
    pub max_limit: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StorageConfig {
    /// sled database directory
    pub path: PathBuf,
    /// Throw the database away when it is dropped. `path` is ignored.
    pub temporary: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff_ms: 10,
            max_backoff_ms: 200,
        }
    }
}

impl Default for PageLimits {
    fn default() -> Self {
        Self {
            default_limit: 50,
            max_limit: 500,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("incidents.db"),
            temporary: false,
        }
    }
}

impl RetryPolicy {
    /// Backoff ceiling before attempt `attempt` (1-based, the first attempt has none).
    pub fn backoff_ceiling(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let factor = 1u64.checked_shl(attempt - 2).unwrap_or(u64::MAX);
        let ms = self.base_backoff_ms.saturating_mul(factor);
        let ms = ms.min(self.max_backoff_ms);
        Duration::from_millis(ms)
    }
}

impl PageLimits {
    /// Resolves a requested page size against the limits.
    pub fn clamp(&self, requested: Option<usize>) -> usize {
        requested
            .unwrap_or(self.default_limit)
            .clamp(1, self.max_limit.max(1))
    }
}

impl ServiceConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            retry: RetryPolicy {
                max_attempts: parse_var("INCIDENT_RETRY_ATTEMPTS")
                    .unwrap_or(defaults.retry.max_attempts),
                base_backoff_ms: parse_var("INCIDENT_RETRY_BASE_MS")
                    .unwrap_or(defaults.retry.base_backoff_ms),
                max_backoff_ms: parse_var("INCIDENT_RETRY_MAX_MS")
                    .unwrap_or(defaults.retry.max_backoff_ms),
            },
            pages: PageLimits {
                default_limit: parse_var("INCIDENT_PAGE_DEFAULT")
                    .unwrap_or(defaults.pages.default_limit),
                max_limit: parse_var("INCIDENT_PAGE_MAX").unwrap_or(defaults.pages.max_limit),
            },
            storage: StorageConfig {
                path: env::var("INCIDENT_DB_PATH")
                    .map(PathBuf::from)
                    .unwrap_or(defaults.storage.path),
                temporary: parse_var("INCIDENT_DB_TEMPORARY")
                    .unwrap_or(defaults.storage.temporary),
            },
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.retry.max_attempts == 0 {
            anyhow::bail!("retry.max_attempts must be at least 1");
        }
        if self.retry.base_backoff_ms > self.retry.max_backoff_ms {
            anyhow::bail!(
                "retry.base_backoff_ms ({}) exceeds retry.max_backoff_ms ({})",
                self.retry.base_backoff_ms,
                self.retry.max_backoff_ms
            );
        }
        if self.pages.max_limit == 0 || self.pages.default_limit > self.pages.max_limit {
            anyhow::bail!(
                "pages.default_limit ({}) must be within 1..={}",
                self.pages.default_limit,
                self.pages.max_limit
            );
        }
        Ok(())
    }
}

fn parse_var<T: std::str::FromStr>(name: &str) -> Option<T> {
    env::var(name).ok().and_then(|s| s.parse().ok())
}
