//! Processing state owned by one processor instance
//!
//! Per-cell records, the subdivision queue and the parent/child graph live
//! together in [`ProcessingState`] so that a split updates all of them at
//! once.

use std::collections::{HashMap, VecDeque};

use serde::{Deserialize, Serialize};

use super::error::{ProcessorError, ProcessorResult};
use crate::models::CoverageQuality;

// ============================================================================
// Status
// ============================================================================

/// Lifecycle of one cell
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CellStatus {
    Queued,
    Processing,
    Fetched,
    Dense,
    Failed,
    Split,
}

/// Kind of status change being requested
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Normal forward progress
    Advance,
    /// Explicit re-dispatch of a finished cell
    Retry,
}

impl CellStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Processing => "processing",
            Self::Fetched => "fetched",
            Self::Dense => "dense",
            Self::Failed => "failed",
            Self::Split => "split",
        }
    }

    /// Finished for this cell unless explicitly retried
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Fetched | Self::Dense | Self::Failed)
    }

    /// Search succeeded for this cell
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Fetched | Self::Dense | Self::Split)
    }

    /// Transition table
    pub fn can_transition_to(&self, next: CellStatus, kind: Transition) -> bool {
        use CellStatus::*;
        match kind {
            Transition::Advance => matches!(
                (self, next),
                (Queued, Processing)
                    | (Processing, Fetched)
                    | (Processing, Dense)
                    | (Processing, Failed)
                    | (Dense, Split)
            ),
            Transition::Retry => {
                matches!((self, next), (Failed | Fetched | Dense, Processing))
            }
        }
    }
}

impl std::fmt::Display for CellStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which pipeline phase a cell belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Base,
    Subdivision,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Base => "base",
            Self::Subdivision => "subdivision",
        }
    }
}

// ============================================================================
// Cell Record
// ============================================================================

/// Processing record for one cell
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CellRecord {
    pub cell_id: String,
    pub resolution: u8,
    pub status: CellStatus,
    pub coverage_quality: CoverageQuality,
    /// Set on first successful fetch and never overwritten afterwards
    pub total_result_count: Option<u64>,
    pub needs_subdivision: bool,
    pub parent_id: Option<String>,
    pub child_ids: Option<Vec<String>>,
    pub processing_time_ms: u64,
    pub last_error: Option<String>,
    /// Number of search invocations made for this cell
    pub attempts: u32,
    pub from_cache: bool,
}

impl CellRecord {
    pub fn queued(cell_id: impl Into<String>, resolution: u8, parent_id: Option<String>) -> Self {
        Self {
            cell_id: cell_id.into(),
            resolution,
            status: CellStatus::Queued,
            coverage_quality: CoverageQuality::Unknown,
            total_result_count: None,
            needs_subdivision: false,
            parent_id,
            child_ids: None,
            processing_time_ms: 0,
            last_error: None,
            attempts: 0,
            from_cache: false,
        }
    }

    pub fn phase(&self) -> Phase {
        if self.parent_id.is_some() {
            Phase::Subdivision
        } else {
            Phase::Base
        }
    }

    /// Store the result count unless one is already recorded; returns the count in effect
    pub fn record_result_count(&mut self, count: u64) -> u64 {
        *self.total_result_count.get_or_insert(count)
    }
}

// ============================================================================
// Relationship Graph
// ============================================================================

/// Parent -> children and child -> parent maps
#[derive(Debug, Default, Clone)]
pub struct RelationshipGraph {
    children: HashMap<String, Vec<String>>,
    parents: HashMap<String, String>,
}

impl RelationshipGraph {
    /// Record a split; both maps are updated or neither is
    pub fn link(&mut self, parent: &str, children: &[String]) -> ProcessorResult<()> {
        if children.is_empty() {
            return Err(ProcessorError::Relationship(format!(
                "split of {parent} produced no children"
            )));
        }
        if self.children.contains_key(parent) {
            return Err(ProcessorError::Relationship(format!(
                "{parent} was already split"
            )));
        }
        if let Some(child) = children
            .iter()
            .find(|c| c.as_str() == parent || self.parents.contains_key(*c))
        {
            return Err(ProcessorError::Relationship(format!(
                "{child} already has a parent"
            )));
        }

        self.children.insert(parent.to_string(), children.to_vec());
        for child in children {
            self.parents.insert(child.clone(), parent.to_string());
        }
        Ok(())
    }

    pub fn children_of(&self, parent: &str) -> Option<&[String]> {
        self.children.get(parent).map(Vec::as_slice)
    }

    pub fn parent_of(&self, child: &str) -> Option<&str> {
        self.parents.get(child).map(String::as_str)
    }

    /// Parent -> children map
    pub fn parent_child_relationships(&self) -> &HashMap<String, Vec<String>> {
        &self.children
    }

    /// Child -> parent map
    pub fn child_parent_relationships(&self) -> &HashMap<String, String> {
        &self.parents
    }

    pub fn clear(&mut self) {
        self.children.clear();
        self.parents.clear();
    }
}

// ============================================================================
// Processing State
// ============================================================================

/// All in-memory processing state
#[derive(Debug, Default)]
pub struct ProcessingState {
    records: HashMap<String, CellRecord>,
    /// Insertion order of `records`
    order: Vec<String>,
    subdivision_queue: VecDeque<String>,
    graph: RelationshipGraph,
}

impl ProcessingState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a new queued cell; returns false if the cell is already known
    pub fn insert_queued(&mut self, cell_id: &str, resolution: u8, parent_id: Option<String>) -> bool {
        if self.records.contains_key(cell_id) {
            return false;
        }
        self.records.insert(
            cell_id.to_string(),
            CellRecord::queued(cell_id, resolution, parent_id),
        );
        self.order.push(cell_id.to_string());
        true
    }

    pub fn get(&self, cell_id: &str) -> Option<&CellRecord> {
        self.records.get(cell_id)
    }

    pub(crate) fn get_mut(&mut self, cell_id: &str) -> ProcessorResult<&mut CellRecord> {
        self.records
            .get_mut(cell_id)
            .ok_or_else(|| ProcessorError::UnknownCell(cell_id.to_string()))
    }

    /// Apply a status change through the transition table
    pub fn transition(
        &mut self,
        cell_id: &str,
        next: CellStatus,
        kind: Transition,
    ) -> ProcessorResult<()> {
        let record = self.get_mut(cell_id)?;
        if !record.status.can_transition_to(next, kind) {
            return Err(ProcessorError::IllegalTransition {
                cell_id: cell_id.to_string(),
                from: record.status,
                to: next,
            });
        }
        record.status = next;
        Ok(())
    }

    /// Turn a dense cell into a split parent and queue its children
    ///
    /// Children already tracked are linked but not queued again.
    pub fn record_split(
        &mut self,
        parent_id: &str,
        children: Vec<String>,
        child_resolution: u8,
    ) -> ProcessorResult<()> {
        let parent = self.get(parent_id).ok_or_else(|| ProcessorError::UnknownCell(parent_id.to_string()))?;
        if !parent.status.can_transition_to(CellStatus::Split, Transition::Advance) {
            return Err(ProcessorError::IllegalTransition {
                cell_id: parent_id.to_string(),
                from: parent.status,
                to: CellStatus::Split,
            });
        }

        self.graph.link(parent_id, &children)?;

        for child in &children {
            if self.insert_queued(child, child_resolution, Some(parent_id.to_string())) {
                self.subdivision_queue.push_back(child.clone());
            } else if let Some(existing) = self.records.get_mut(child) {
                existing.parent_id.get_or_insert_with(|| parent_id.to_string());
            }
        }

        let parent = self.get_mut(parent_id)?;
        parent.child_ids = Some(children);
        parent.status = CellStatus::Split;
        Ok(())
    }

    /// Snapshot of queued subdivision entries, in queue order
    pub fn queued_subdivisions(&self) -> Vec<String> {
        self.subdivision_queue
            .iter()
            .filter(|id| {
                self.records
                    .get(id.as_str())
                    .is_some_and(|r| r.status == CellStatus::Queued)
            })
            .cloned()
            .collect()
    }

    /// Remove an entry from the subdivision queue
    pub fn dequeue_subdivision(&mut self, cell_id: &str) {
        self.subdivision_queue.retain(|id| id != cell_id);
    }

    pub fn subdivision_queue(&self) -> impl Iterator<Item = &CellRecord> {
        self.subdivision_queue
            .iter()
            .filter_map(|id| self.records.get(id))
    }

    pub fn subdivision_queue_len(&self) -> usize {
        self.subdivision_queue.len()
    }

    pub fn graph(&self) -> &RelationshipGraph {
        &self.graph
    }

    /// Records in the order cells were first seen
    pub fn records(&self) -> impl Iterator<Item = &CellRecord> {
        self.order.iter().filter_map(|id| self.records.get(id))
    }

    /// Ids of cells currently failed, in first-seen order
    pub fn failed_ids(&self) -> Vec<String> {
        self.records()
            .filter(|r| r.status == CellStatus::Failed)
            .map(|r| r.cell_id.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Drop everything
    pub fn clear(&mut self) {
        self.records.clear();
        self.order.clear();
        self.subdivision_queue.clear();
        self.graph.clear();
    }
}
