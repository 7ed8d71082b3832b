//! Engine configuration.
//!
//! Built once from the environment (via `dotenvy`) with code defaults,
//! then passed explicitly to the components that need it. There is no
//! global mutable configuration.

use std::time::Duration;

/// Configuration for the ingestion engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// SQLite connection URL (e.g. `sqlite:pipeline.db?mode=rwc`)
    pub database_url: String,
    /// Default lease duration for claimed jobs, in seconds
    pub lease_seconds: i64,
    /// Maximum failed attempts before a job is dead-lettered
    pub max_attempts: i32,
    /// Base delay for exponential retry backoff, in seconds
    pub backoff_base_secs: i64,
    /// Ceiling for retry backoff, in seconds
    pub backoff_ceiling_secs: i64,
    /// Maximum number of jobs a worker claims per poll
    pub batch_size: i64,
    /// How long the worker waits when no jobs are available
    pub poll_interval: Duration,
    /// Postings not seen for this many hours are due a freshness check
    pub freshness_window_hours: i64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite:pipeline.db?mode=rwc".to_string(),
            lease_seconds: 60,
            max_attempts: 3,
            backoff_base_secs: 30,
            backoff_ceiling_secs: 3600,
            batch_size: 10,
            poll_interval: Duration::from_secs(5),
            freshness_window_hours: 72,
        }
    }
}

impl EngineConfig {
    /// Load configuration from the environment, falling back to defaults.
    ///
    /// Reads a `.env` file if one is present.
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();

        let defaults = Self::default();
        Self {
            database_url: env_or("PIPELINE_DATABASE_URL", defaults.database_url),
            lease_seconds: env_parsed("PIPELINE_LEASE_SECONDS", defaults.lease_seconds),
            max_attempts: env_parsed("PIPELINE_MAX_ATTEMPTS", defaults.max_attempts),
            backoff_base_secs: env_parsed("PIPELINE_BACKOFF_BASE_SECS", defaults.backoff_base_secs),
            backoff_ceiling_secs: env_parsed(
                "PIPELINE_BACKOFF_CEILING_SECS",
                defaults.backoff_ceiling_secs,
            ),
            batch_size: env_parsed("PIPELINE_BATCH_SIZE", defaults.batch_size),
            poll_interval: Duration::from_secs(env_parsed(
                "PIPELINE_POLL_INTERVAL_SECS",
                defaults.poll_interval.as_secs(),
            )),
            freshness_window_hours: env_parsed(
                "PIPELINE_FRESHNESS_WINDOW_HOURS",
                defaults.freshness_window_hours,
            ),
        }
    }
}

fn env_or(key: &str, default: String) -> String {
    std::env::var(key).unwrap_or(default)
}

fn env_parsed<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
