//! hexsweep - hexagonal-grid business search planner
//!
//! Drives a rate- and quota-limited business search API across a city's
//! H3 grid, subdividing cells that turn out too dense for a single search.
//!
//! # Architecture
//!
//! The library is organized into several modules:
//!
//! - [`grid`] - Cell parsing, coverage sampling and subdivision
//! - [`quota`] - Daily request budget and batch admission
//! - [`search`] - External search client
//! - [`storage`] - SQLite tile cache and import logs
//! - [`processor`] - Two-phase processing pipeline and its state
//! - [`config`] - Configuration management and settings
//! - [`metrics`] - Prometheus counters
//! - [`utils`] - Retry, clock and shared helpers
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use hexsweep::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::from_env()?;
//!     let search = Arc::new(HttpSearchClient::new(&config.search)?);
//!     let quota = Arc::new(DailyQuotaManager::new(&config.quota));
//!     let mut processor = HexagonProcessor::new(&config, search, quota);
//!     let cells = vec!["8830e1d8d1fffff".to_string()];
//!     let response = processor
//!         .process_unified_pipeline(&cells, RunOptions::default())
//!         .await?;
//!     println!("{} businesses", response.stats.total_businesses);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod grid;
pub mod metrics;
pub mod models;
pub mod processor;
pub mod quota;
pub mod search;
pub mod storage;
pub mod utils;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::error::{Error, ErrorCategory, HexsweepErrorTrait, Result};
    pub use crate::models::{Business, CoverageQuality};
    pub use crate::processor::{
        CellOutcome, CellStatus, HexagonProcessor, PipelineResponse, ProcessorError, RunOptions,
    };
    pub use crate::quota::{DailyQuotaManager, QuotaManager};
    pub use crate::search::{HttpSearchClient, SearchClient};
    pub use crate::storage::{SqliteTileStore, TileStore};
}

// Direct re-exports for convenience
pub use models::{Business, CoverageQuality};
