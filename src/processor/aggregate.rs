//! Rolling child results up into parent summaries

use serde::{Deserialize, Serialize};

use super::state::{CellRecord, CellStatus, ProcessingState};
use crate::grid::splitter::{merge_sub_hexagon_results, ChildResult, MergedEstimate};
use crate::models::CoverageQuality;

/// Summary of a split parent's children
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregatedChildResults {
    pub parent_id: String,
    pub total_children: usize,
    pub completed_children: usize,
    pub failed_children: usize,
    pub split_children: usize,
    pub pending_children: usize,
    pub total_businesses: u64,
    pub coverage_quality: CoverageQuality,
    /// completed / total, 1.0 when there are no children
    pub completion_ratio: f64,
}

impl AggregatedChildResults {
    /// Every child has reached a terminal state
    pub fn is_settled(&self) -> bool {
        self.pending_children == 0
    }
}

/// One entry of the merged coverage report
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergedCellResult {
    pub cell_id: String,
    pub resolution: u8,
    pub status: CellStatus,
    pub total_result_count: u64,
    pub coverage_quality: CoverageQuality,
    /// Count and quality come from the children
    pub merged_from_children: bool,
    pub child_count: usize,
}

/// Quality label for a set of children
///
/// Sets with a failed child and fully completed sets keep the merge's label
/// (`poor` and `excellent`); otherwise the label follows the share of
/// completed children.
fn aggregate_quality(merged: &MergedEstimate, total: usize) -> CoverageQuality {
    if merged.failed_children > 0 || merged.completed_children == total {
        return merged.coverage_quality;
    }
    let ratio = merged.completed_children as f64 / total as f64;
    if ratio > 0.8 {
        CoverageQuality::Good
    } else if ratio > 0.6 {
        CoverageQuality::Fair
    } else {
        CoverageQuality::Unknown
    }
}

/// Aggregate the children of `parent_id`; `None` if the cell is not tracked
pub fn aggregate_children(state: &ProcessingState, parent_id: &str) -> Option<AggregatedChildResults> {
    state.get(parent_id)?;
    let children: Vec<&CellRecord> = state
        .graph()
        .children_of(parent_id)
        .unwrap_or_default()
        .iter()
        .filter_map(|id| state.get(id))
        .collect();

    let mut settled = Vec::with_capacity(children.len());
    let mut split_children = 0;
    let mut pending_children = 0;
    for child in &children {
        match child.status {
            CellStatus::Fetched | CellStatus::Dense | CellStatus::Split => {
                if child.status == CellStatus::Split {
                    split_children += 1;
                }
                settled.push(ChildResult::Completed {
                    result_count: child.total_result_count.unwrap_or(0),
                });
            }
            CellStatus::Failed => settled.push(ChildResult::Failed),
            CellStatus::Queued | CellStatus::Processing => pending_children += 1,
        }
    }

    let merged = merge_sub_hexagon_results(&settled);
    let total_children = children.len();
    let completion_ratio = if total_children > 0 {
        merged.completed_children as f64 / total_children as f64
    } else {
        1.0
    };

    Some(AggregatedChildResults {
        parent_id: parent_id.to_string(),
        total_children,
        completed_children: merged.completed_children,
        failed_children: merged.failed_children,
        split_children,
        pending_children,
        total_businesses: merged.total_count,
        coverage_quality: aggregate_quality(&merged, total_children),
        completion_ratio,
    })
}

/// Merged view of every completed top-level cell, in first-seen order
///
/// A split parent whose children are all settled shows the aggregated child
/// values; otherwise a cell shows its own. Reads only, so repeated calls
/// without new processing return the same output.
pub fn merged_results(state: &ProcessingState) -> Vec<MergedCellResult> {
    state
        .records()
        .filter(|r| r.parent_id.is_none() && r.status.is_success())
        .map(|record| {
            let own = MergedCellResult {
                cell_id: record.cell_id.clone(),
                resolution: record.resolution,
                status: record.status,
                total_result_count: record.total_result_count.unwrap_or(0),
                coverage_quality: record.coverage_quality,
                merged_from_children: false,
                child_count: record.child_ids.as_ref().map_or(0, Vec::len),
            };

            match aggregate_children(state, &record.cell_id) {
                Some(agg) if agg.total_children > 0 && agg.is_settled() => MergedCellResult {
                    total_result_count: agg.total_businesses,
                    coverage_quality: agg.coverage_quality,
                    merged_from_children: true,
                    ..own
                },
                _ => own,
            }
        })
        .collect()
}
