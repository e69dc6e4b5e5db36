//! Configuration management for hexsweep
//!
//! This module handles loading and validating configuration from environment
//! variables and TOML files.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::grid::DENSE_THRESHOLD;
use crate::utils::retry::RetryConfig;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// External search API configuration
    pub search: SearchConfig,

    /// Request quota configuration
    pub quota: QuotaConfig,

    /// Hexagon processor configuration
    pub processor: ProcessorConfig,

    /// Database configuration
    pub database: DatabaseConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

/// External search API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    /// Base URL of the business search API
    pub base_url: String,

    /// API key sent as `X-Api-Key`
    pub api_key: Option<String>,

    /// Rate limit (requests per second)
    pub rate_limit: f64,

    /// Request timeout in seconds
    pub request_timeout_secs: u64,

    /// Maximum results the API returns for one query
    pub per_query_cap: u32,

    /// User agent string
    pub user_agent: String,
}

/// Request quota configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QuotaConfig {
    /// Request units available per UTC day
    pub daily_limit: u64,

    /// Expected request units per cell before the overlap multiplier
    pub calls_per_cell: f64,

    /// Hard cap on cells processed by a test run
    pub test_max_cells: usize,

    /// Request units budgeted per cell in a test run
    pub test_calls_per_cell: u64,

    /// Subdivision batches above this size are denied outright
    pub max_subdivision_batch: usize,
}

/// Hexagon processor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessorConfig {
    /// Result count above which a cell is split
    pub density_threshold: u64,

    /// Resolution levels added by one split
    pub subdivision_step: u8,

    /// Attempts made by `retry_failed_hexagons`
    pub retry_max_attempts: u32,

    /// Base backoff for `retry_failed_hexagons`, in milliseconds
    pub retry_base_delay_ms: u64,

    /// Backoff cap, in milliseconds
    pub retry_max_delay_ms: u64,

    /// Random jitter bound added to each backoff, in milliseconds
    pub retry_jitter_ms: u64,

    /// How long finished run state stays readable, in seconds
    pub run_retention_secs: u64,
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// SQLite database path
    pub sqlite_path: PathBuf,

    /// Age after which a cached tile is refetched
    pub cache_freshness_days: i64,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log format (text, json)
    pub format: String,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            base_url: String::from("http://localhost:8080"),
            api_key: None,
            rate_limit: 5.0,
            request_timeout_secs: 30,
            per_query_cap: 60,
            user_agent: format!("hexsweep/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            daily_limit: 10_000,
            calls_per_cell: 1.0,
            test_max_cells: 5,
            test_calls_per_cell: 3,
            max_subdivision_batch: 100,
        }
    }
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            density_threshold: DENSE_THRESHOLD,
            subdivision_step: 1,
            retry_max_attempts: 3,
            retry_base_delay_ms: 2000,
            retry_max_delay_ms: 30_000,
            retry_jitter_ms: 1000,
            run_retention_secs: 60,
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            sqlite_path: PathBuf::from("data/hexsweep.db"),
            cache_freshness_days: 30,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: String::from("info"),
            format: String::from("text"),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse::<T>().ok())
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let search = SearchConfig {
            base_url: std::env::var("HEXSWEEP_SEARCH_URL").unwrap_or(defaults.search.base_url),
            api_key: std::env::var("HEXSWEEP_API_KEY").ok(),
            rate_limit: env_parse("HEXSWEEP_RATE_LIMIT").unwrap_or(defaults.search.rate_limit),
            request_timeout_secs: env_parse("HEXSWEEP_REQUEST_TIMEOUT")
                .unwrap_or(defaults.search.request_timeout_secs),
            per_query_cap: env_parse("HEXSWEEP_PER_QUERY_CAP")
                .unwrap_or(defaults.search.per_query_cap),
            user_agent: std::env::var("HEXSWEEP_USER_AGENT")
                .unwrap_or(defaults.search.user_agent),
        };

        let quota = QuotaConfig {
            daily_limit: env_parse("HEXSWEEP_DAILY_LIMIT").unwrap_or(defaults.quota.daily_limit),
            calls_per_cell: env_parse("HEXSWEEP_CALLS_PER_CELL")
                .unwrap_or(defaults.quota.calls_per_cell),
            ..defaults.quota
        };

        let processor = ProcessorConfig {
            density_threshold: env_parse("HEXSWEEP_DENSITY_THRESHOLD")
                .unwrap_or(defaults.processor.density_threshold),
            retry_base_delay_ms: env_parse("HEXSWEEP_RETRY_BASE_DELAY_MS")
                .unwrap_or(defaults.processor.retry_base_delay_ms),
            ..defaults.processor
        };

        let database = DatabaseConfig {
            sqlite_path: std::env::var("HEXSWEEP_SQLITE_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.database.sqlite_path),
            cache_freshness_days: env_parse("HEXSWEEP_CACHE_DAYS")
                .unwrap_or(defaults.database.cache_freshness_days),
        };

        let logging = LoggingConfig {
            level: std::env::var("HEXSWEEP_LOG_LEVEL").unwrap_or(defaults.logging.level),
            format: std::env::var("HEXSWEEP_LOG_FORMAT").unwrap_or(defaults.logging.format),
        };

        Ok(Self {
            search,
            quota,
            processor,
            database,
            logging,
        })
    }

    /// Load configuration from a file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse TOML config file: {}", path.display()))?;

        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.search.rate_limit <= 0.0 {
            anyhow::bail!("rate_limit must be positive");
        }

        if self.search.per_query_cap == 0 {
            anyhow::bail!("per_query_cap must be greater than 0");
        }

        if self.quota.calls_per_cell <= 0.0 {
            anyhow::bail!("calls_per_cell must be positive");
        }

        if self.quota.test_max_cells == 0 {
            anyhow::bail!("test_max_cells must be greater than 0");
        }

        if self.processor.subdivision_step == 0 {
            anyhow::bail!("subdivision_step must be at least 1");
        }

        if self.database.cache_freshness_days < 0 {
            anyhow::bail!("cache_freshness_days must not be negative");
        }

        Ok(())
    }

    /// Get request timeout as Duration
    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.search.request_timeout_secs)
    }
}

impl ProcessorConfig {
    /// Retry policy used when re-dispatching failed cells
    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig::with_delays(
            self.retry_max_attempts,
            self.retry_base_delay_ms,
            self.retry_max_delay_ms,
        )
        .with_jitter(self.retry_jitter_ms)
    }

    /// Retention window for finished run state
    pub fn run_retention(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.run_retention_secs as i64)
    }
}
