//! External business search
//!
//! [`SearchClient`] is the seam between the processor and the rate-limited
//! search API. [`client::HttpSearchClient`] is the production implementation.

pub mod client;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::models::{Business, CoverageQuality};
use crate::utils::error::SearchError;

pub use client::HttpSearchClient;

/// Deduplicated search result for one cell
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchOutcome {
    /// Number of unique businesses found
    pub total_count: u64,
    pub unique_items: Vec<Business>,
    pub coverage_quality: CoverageQuality,
    /// External requests issued to produce this outcome
    pub api_calls: u32,
}

impl SearchOutcome {
    /// Build an outcome from deduplicated items
    pub fn new(unique_items: Vec<Business>, coverage_quality: CoverageQuality, api_calls: u32) -> Self {
        Self {
            total_count: unique_items.len() as u64,
            unique_items,
            coverage_quality,
            api_calls,
        }
    }
}

/// Searches one grid cell against the external API.
///
/// An `Err` is treated by the processor as a failure of that cell only.
#[async_trait]
pub trait SearchClient: Send + Sync {
    async fn search_cell(&self, cell_id: &str) -> Result<SearchOutcome, SearchError>;
}
