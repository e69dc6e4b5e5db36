//! Request-quota admission control for the external search API.
//!
//! This module provides:
//!
//! - [`QuotaManager`]: trait for estimating and tracking request units
//! - [`DailyQuotaManager`]: in-memory rolling daily budget
//! - [`authorize_batch`]: the admission policy applied to a batch of cells
//!
//! The processor only reads estimates from the manager and reports actual
//! consumption back through [`QuotaManager::track_api_call`].

pub mod daily;

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::config::QuotaConfig;

pub use daily::DailyQuotaManager;

/// Overlap multiplier applied to base-resolution cells
pub const BASE_OVERLAP_MULTIPLIER: f64 = 1.5;

/// Overlap multiplier applied to subdivision cells (finer sampling)
pub const SUBDIVISION_OVERLAP_MULTIPLIER: f64 = 2.0;

/// How close a prospective batch brings the daily budget to exhaustion
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    /// Classify a projected utilisation ratio (used + estimated) / limit
    pub fn from_utilization(ratio: f64) -> Self {
        if ratio <= 0.5 {
            Self::Low
        } else if ratio <= 0.8 {
            Self::Medium
        } else if ratio <= 1.0 {
            Self::High
        } else {
            Self::Critical
        }
    }
}

impl std::fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Medium => write!(f, "medium"),
            Self::High => write!(f, "high"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

/// Cost estimate for a prospective batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuotaEstimate {
    pub estimated_calls: u64,
    pub can_process_request: bool,
    pub risk_level: RiskLevel,
    pub recommendations: Vec<String>,
    /// Units left in the current window when the estimate was made
    pub daily_remaining: u64,
}

/// Current consumption snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuotaStatus {
    pub daily_limit: u64,
    pub daily_used: u64,
    pub daily_remaining: u64,
    pub window: NaiveDate,
    /// daily_used / daily_limit
    pub utilization: f64,
}

/// Quota manager consumed by the processor.
///
/// All methods are `Send + Sync` so a status endpoint can read consumption
/// while a run is issuing calls.
#[async_trait]
pub trait QuotaManager: Send + Sync {
    /// Estimate the cost of processing `cell_count` cells. Never mutates state.
    async fn estimate_quota_for_city(
        &self,
        cell_count: usize,
        resolution: u8,
        overlap_multiplier: f64,
    ) -> QuotaEstimate;

    /// Current consumption snapshot
    async fn quota_status(&self) -> QuotaStatus;

    /// Record one external request
    async fn track_api_call(&self);
}

/// Result of the admission policy
#[derive(Debug, Clone, PartialEq)]
pub enum Admission {
    /// Process the first `cells` cells of the batch
    Admitted {
        cells: usize,
        budget_calls: u64,
        test_mode: bool,
    },
    /// Batch rejected; nothing may be sent to the search API
    Denied { estimate: QuotaEstimate },
}

impl Admission {
    pub fn is_admitted(&self) -> bool {
        matches!(self, Self::Admitted { .. })
    }
}

/// Apply the admission policy to a batch
///
/// A batch is admitted when the estimate allows it, or when the caller runs
/// in test mode. Test runs are always capped at `test_max_cells` cells and
/// `test_calls_per_cell` units per cell, whatever the remaining budget.
pub fn authorize_batch(
    estimate: &QuotaEstimate,
    cell_count: usize,
    test_mode: bool,
    config: &QuotaConfig,
) -> Admission {
    if test_mode {
        let cells = cell_count.min(config.test_max_cells);
        if cells < cell_count {
            tracing::warn!(
                requested = cell_count,
                capped = cells,
                "Test run capped to safety ceiling"
            );
        }
        return Admission::Admitted {
            cells,
            budget_calls: cells as u64 * config.test_calls_per_cell,
            test_mode: true,
        };
    }

    if estimate.can_process_request {
        Admission::Admitted {
            cells: cell_count,
            budget_calls: estimate.estimated_calls,
            test_mode: false,
        }
    } else {
        Admission::Denied {
            estimate: estimate.clone(),
        }
    }
}
