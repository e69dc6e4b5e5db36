//! Density detection and subdivision
//!
//! The external search API caps results per query, so a cell whose result
//! count exceeds [`DENSE_THRESHOLD`] is replaced by its children one
//! resolution finer.

use serde::{Deserialize, Serialize};

use super::{cell_key, parse_cell, resolution};
use crate::models::CoverageQuality;
use crate::utils::error::GridError;

/// Result count above which a cell is considered dense
pub const DENSE_THRESHOLD: u64 = 240;

/// Whether a result count exceeds the density threshold
pub fn detect_dense_hexagon(result_count: u64) -> bool {
    detect_dense_with_threshold(result_count, DENSE_THRESHOLD)
}

/// Same as [`detect_dense_hexagon`] with a configured threshold
pub fn detect_dense_with_threshold(result_count: u64, threshold: u64) -> bool {
    result_count > threshold
}

/// Children produced by splitting a cell
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SplitResult {
    pub parent: String,
    pub from_resolution: u8,
    pub to_resolution: u8,
    pub split_hexagons: Vec<String>,
}

/// Compute the finer-grid cells covering `cell_id`
///
/// Pure function of its inputs: the same arguments always yield the same
/// ordered child set.
pub fn split_hexagon(
    cell_id: &str,
    from_resolution: u8,
    to_resolution: u8,
) -> Result<SplitResult, GridError> {
    let cell = parse_cell(cell_id)?;
    let actual = u8::from(cell.resolution());
    if actual != from_resolution {
        return Err(GridError::ResolutionMismatch {
            cell: cell_id.to_string(),
            expected: from_resolution,
            actual,
        });
    }
    if to_resolution <= from_resolution {
        return Err(GridError::NotFiner {
            from: from_resolution,
            to: to_resolution,
        });
    }
    let target = resolution(to_resolution)?;

    Ok(SplitResult {
        parent: cell_key(cell),
        from_resolution,
        to_resolution,
        split_hexagons: cell.children(target).map(cell_key).collect(),
    })
}

/// Outcome of one child as seen by the merge
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChildResult {
    Completed { result_count: u64 },
    Failed,
}

/// Parent-level estimate rebuilt from child results
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergedEstimate {
    pub total_count: u64,
    pub coverage_quality: CoverageQuality,
    pub completed_children: usize,
    pub failed_children: usize,
}

/// Combine child counts back into one parent estimate
///
/// Counts are summed; any failed child downgrades quality to poor.
pub fn merge_sub_hexagon_results(children: &[ChildResult]) -> MergedEstimate {
    let mut total_count = 0;
    let mut completed_children = 0;
    let mut failed_children = 0;

    for child in children {
        match child {
            ChildResult::Completed { result_count } => {
                total_count += result_count;
                completed_children += 1;
            }
            ChildResult::Failed => failed_children += 1,
        }
    }

    let coverage_quality = if failed_children > 0 {
        CoverageQuality::Poor
    } else {
        CoverageQuality::Excellent
    };

    MergedEstimate {
        total_count,
        coverage_quality,
        completed_children,
        failed_children,
    }
}
