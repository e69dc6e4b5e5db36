//! Error types for the hexagon processor

use thiserror::Error;

use super::state::CellStatus;
use crate::quota::QuotaEstimate;
use crate::utils::error::GridError;

/// Result type for processor operations
pub type ProcessorResult<T> = Result<T, ProcessorError>;

/// Errors surfaced to callers of the processor.
///
/// Only input and admission problems reach the caller as errors; per-cell
/// search failures are recorded as `failed` cells instead.
#[derive(Error, Debug)]
pub enum ProcessorError {
    /// No cells supplied
    #[error("Cell list is empty")]
    EmptyInput,

    /// A supplied cell key is malformed
    #[error("Invalid cell in input: {0}")]
    InvalidCell(#[from] GridError),

    /// Not enough quota for the batch
    #[error(
        "Quota exceeded: batch needs an estimated {} calls but only {} remain today",
        .estimate.estimated_calls,
        .estimate.daily_remaining
    )]
    QuotaExceeded { estimate: QuotaEstimate },

    /// Subdivision queue larger than allowed in one pass
    #[error("Subdivision batch of {size} cells exceeds the limit of {limit}")]
    SubdivisionBatchTooLarge { size: usize, limit: usize },

    /// Status change not allowed by the transition table
    #[error("Illegal status transition for {cell_id}: {from} -> {to}")]
    IllegalTransition {
        cell_id: String,
        from: CellStatus,
        to: CellStatus,
    },

    /// Cell not tracked by the processor
    #[error("Unknown cell: {0}")]
    UnknownCell(String),

    /// Parent/child bookkeeping would become inconsistent
    #[error("Relationship error: {0}")]
    Relationship(String),
}

impl ProcessorError {
    /// Check if retrying later might succeed without changing the input
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::QuotaExceeded { .. } | Self::SubdivisionBatchTooLarge { .. }
        )
    }

    /// Whether this is a batch-level admission rejection
    pub fn is_admission_denial(&self) -> bool {
        self.is_recoverable()
    }

    /// Operator-facing recommendations attached to the error
    pub fn recommendations(&self) -> &[String] {
        match self {
            Self::QuotaExceeded { estimate } => &estimate.recommendations,
            _ => &[],
        }
    }
}
