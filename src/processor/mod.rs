//! Hexagon processing and subdivision engine
//!
//! [`HexagonProcessor`] owns all processing state and drives the two-phase
//! pipeline:
//!
//! 1. **Base scan**: every input cell is searched in input order. Dense
//!    cells are split and their children queued.
//! 2. **Subdivision drain**: queued children are searched under a second
//!    quota check with the subdivision overlap multiplier.
//!
//! Cells are processed one at a time, so at most one external call per run
//! is in flight against the quota. A failing cell is recorded as `failed`
//! and never aborts its siblings; only malformed input and batch-level
//! quota denials are returned as errors.
//!
//! # Example
//!
//! ```ignore
//! let mut processor = HexagonProcessor::new(&config, search, quota)
//!     .with_store(store);
//! let response = processor
//!     .process_unified_pipeline(&cells, RunOptions::default())
//!     .await?;
//! println!("{} cells merged", response.results.len());
//! ```

pub mod aggregate;
pub mod diagnostics;
pub mod error;
pub mod run;
pub mod state;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{Config, ProcessorConfig, QuotaConfig};
use crate::grid::splitter::detect_dense_with_threshold;
use crate::grid::{cell_key, parse_cell, split_hexagon};
use crate::metrics;
use crate::models::CoverageQuality;
use crate::quota::{
    authorize_batch, Admission, QuotaEstimate, QuotaManager, BASE_OVERLAP_MULTIPLIER,
    SUBDIVISION_OVERLAP_MULTIPLIER,
};
use crate::search::{SearchClient, SearchOutcome};
use crate::storage::{CachedTile, RunLogEntry, RunLogStatus, RunLogUpdate, TileStore};
use crate::utils::clock::{Clock, SystemClock};
use crate::utils::error::SearchError;
use crate::utils::retry::process_with_retry;

pub use aggregate::{AggregatedChildResults, MergedCellResult};
pub use diagnostics::{ErrorSummary, FailureClass};
pub use error::{ProcessorError, ProcessorResult};
pub use run::{RunState, RunTracker};
pub use state::{CellRecord, CellStatus, Phase, ProcessingState, Transition};

// ============================================================================
// Result Types
// ============================================================================

/// Result of processing one cell
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum CellOutcome {
    Fetched {
        cell_id: String,
        result_count: u64,
        coverage_quality: CoverageQuality,
        from_cache: bool,
    },
    /// Dense but not split (subdivision child, or no finer resolution)
    Dense {
        cell_id: String,
        result_count: u64,
        coverage_quality: CoverageQuality,
    },
    Split {
        cell_id: String,
        result_count: u64,
        coverage_quality: CoverageQuality,
        children: Vec<String>,
    },
    Failed {
        cell_id: String,
        error: String,
    },
}

impl CellOutcome {
    pub fn cell_id(&self) -> &str {
        match self {
            Self::Fetched { cell_id, .. }
            | Self::Dense { cell_id, .. }
            | Self::Split { cell_id, .. }
            | Self::Failed { cell_id, .. } => cell_id,
        }
    }

    pub fn status(&self) -> CellStatus {
        match self {
            Self::Fetched { .. } => CellStatus::Fetched,
            Self::Dense { .. } => CellStatus::Dense,
            Self::Split { .. } => CellStatus::Split,
            Self::Failed { .. } => CellStatus::Failed,
        }
    }

    pub fn result_count(&self) -> Option<u64> {
        match self {
            Self::Fetched { result_count, .. }
            | Self::Dense { result_count, .. }
            | Self::Split { result_count, .. } => Some(*result_count),
            Self::Failed { .. } => None,
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }
}

/// Options for a batch run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunOptions {
    /// Bypass quota denial, capped to the test safety ceiling
    pub test_mode: bool,
}

impl RunOptions {
    pub fn test() -> Self {
        Self { test_mode: true }
    }
}

/// Phase-1 batch result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchReport {
    pub run_id: Uuid,
    pub estimate: QuotaEstimate,
    pub test_mode: bool,
    pub outcomes: Vec<CellOutcome>,
    /// Cells not processed: already tracked, or beyond the test cap
    pub skipped: Vec<String>,
    pub api_calls: u64,
}

/// Phase-2 drain result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubdivisionReport {
    pub run_id: Uuid,
    /// `None` when the queue was empty and no estimate was needed
    pub estimate: Option<QuotaEstimate>,
    pub outcomes: Vec<CellOutcome>,
    pub remaining_in_queue: usize,
    pub api_calls: u64,
}

/// Both phases of one run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TwoPhaseReport {
    pub run_id: Uuid,
    pub phase1: BatchReport,
    pub phase2: Option<SubdivisionReport>,
    /// Why phase 2 did not run, if it was denied
    pub subdivision_denied: Option<String>,
    pub results: Vec<MergedCellResult>,
    pub stats: ProcessingStats,
    pub run: Option<RunState>,
}

/// Structured response of the unified pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineResponse {
    /// Both phases ran; individual cells may still have failed
    pub success: bool,
    pub run_id: Uuid,
    pub results: Vec<MergedCellResult>,
    pub stats: ProcessingStats,
    pub subdivision_denied: Option<String>,
    pub processed_hexagons: usize,
    pub total_hexagons: usize,
    pub api_calls: u64,
}

impl From<TwoPhaseReport> for PipelineResponse {
    fn from(report: TwoPhaseReport) -> Self {
        let (processed, total, calls) = report.run.as_ref().map_or_else(
            || {
                let phase2 = report.phase2.as_ref();
                (
                    report.phase1.outcomes.len() + phase2.map_or(0, |p| p.outcomes.len()),
                    report.phase1.outcomes.len() + phase2.map_or(0, |p| p.outcomes.len()),
                    report.phase1.api_calls + phase2.map_or(0, |p| p.api_calls),
                )
            },
            |run| (run.processed_hexagons(), run.total_hexagons(), run.actual_api_calls),
        );

        Self {
            success: report.subdivision_denied.is_none(),
            run_id: report.run_id,
            results: report.results,
            stats: report.stats,
            subdivision_denied: report.subdivision_denied,
            processed_hexagons: processed,
            total_hexagons: total,
            api_calls: calls,
        }
    }
}

/// Counts of tracked cells by status
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessingStats {
    pub total_hexagons: usize,
    pub queued: usize,
    pub processing: usize,
    pub fetched: usize,
    pub dense: usize,
    pub failed: usize,
    pub split: usize,
    pub subdivision_queue_size: usize,
    pub parent_count: usize,
    /// Sum over the merged results
    pub total_businesses: u64,
    /// Successful cells over finished cells, 0.0 before any finish
    pub success_rate: f64,
}

/// One subdivision-queue entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub cell_id: String,
    pub parent_id: Option<String>,
    pub resolution: u8,
    pub status: CellStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubdivisionQueueStatus {
    pub queue_size: usize,
    /// Entries still waiting to be searched
    pub pending: usize,
    pub parent_count: usize,
    pub entries: Vec<QueueEntry>,
}

/// Result of re-dispatching failed cells
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetryReport {
    pub attempted: usize,
    pub recovered: Vec<String>,
    pub still_failed: Vec<String>,
    pub outcomes: Vec<CellOutcome>,
    pub api_calls: u64,
}

/// Base batch that passed admission
struct AdmittedBatch {
    cells: Vec<(String, u8)>,
    skipped: Vec<String>,
    estimate: QuotaEstimate,
    budget_calls: u64,
    test_mode: bool,
}

/// Bookkeeping for one dispatch of a cell
struct Attempt {
    started: Instant,
    invocations: u32,
    from_cache: bool,
    /// Calls spent on failed invocations before the final one
    prior_failed_calls: u64,
}

impl Attempt {
    fn single(from_cache: bool) -> Self {
        Self {
            started: Instant::now(),
            invocations: u32::from(!from_cache),
            from_cache,
            prior_failed_calls: 0,
        }
    }
}

// ============================================================================
// Processor
// ============================================================================

/// Orchestrates per-cell processing and the two-phase pipeline
pub struct HexagonProcessor {
    search: Arc<dyn SearchClient>,
    quota: Arc<dyn QuotaManager>,
    store: Option<Arc<dyn TileStore>>,
    config: ProcessorConfig,
    quota_config: QuotaConfig,
    clock: Arc<dyn Clock>,
    state: ProcessingState,
    runs: RunTracker,
}

impl HexagonProcessor {
    pub fn new(config: &Config, search: Arc<dyn SearchClient>, quota: Arc<dyn QuotaManager>) -> Self {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        Self {
            search,
            quota,
            store: None,
            config: config.processor.clone(),
            quota_config: config.quota.clone(),
            runs: RunTracker::new(config.processor.run_retention(), Arc::clone(&clock)),
            clock,
            state: ProcessingState::new(),
        }
    }

    /// Attach a tile cache and run-log store
    pub fn with_store(mut self, store: Arc<dyn TileStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Replace the clock used for timestamps and run retention
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.runs = RunTracker::new(self.config.run_retention(), Arc::clone(&clock));
        self.clock = clock;
        self
    }

    // ------------------------------------------------------------------------
    // Single cell
    // ------------------------------------------------------------------------

    /// Search one cell and record its outcome
    ///
    /// The cell must be new or still queued; a dense base cell is split and
    /// its children queued as usual.
    pub async fn process_hexagon_with_coverage(&mut self, cell_id: &str) -> ProcessorResult<CellOutcome> {
        let cell = parse_cell(cell_id.trim())?;
        let key = cell_key(cell);
        let (resolution, phase) = match self.state.get(&key) {
            Some(record) => (record.resolution, record.phase()),
            None => (u8::from(cell.resolution()), Phase::Base),
        };

        let overlap = match phase {
            Phase::Base => BASE_OVERLAP_MULTIPLIER,
            Phase::Subdivision => SUBDIVISION_OVERLAP_MULTIPLIER,
        };
        let estimate = self.quota.estimate_quota_for_city(1, resolution, overlap).await;
        if let Admission::Denied { estimate } = authorize_batch(&estimate, 1, false, &self.quota_config) {
            metrics::record_quota_denial(phase.as_str());
            warn!(cell_id = %key, estimated_calls = estimate.estimated_calls, "Cell denied by quota admission");
            return Err(ProcessorError::QuotaExceeded { estimate });
        }

        // Admitted: only now does the cell enter the processing state
        self.state.insert_queued(&key, resolution, None);
        let (outcome, _) = self.process_cell(&key, None).await?;
        self.state.dequeue_subdivision(&key);
        Ok(outcome)
    }

    // ------------------------------------------------------------------------
    // Phases
    // ------------------------------------------------------------------------

    /// Run phase 1 only: admit the batch and search every base cell
    ///
    /// # Errors
    ///
    /// `EmptyInput` or `InvalidCell` for bad input, `QuotaExceeded` when the
    /// batch is denied. No cell is searched in either case.
    pub async fn process_base_batch(&mut self, cells: &[String], options: RunOptions) -> ProcessorResult<BatchReport> {
        let batch = self.admit_base_batch(cells, options.test_mode).await?;
        let run_id = self
            .runs
            .start(batch.cells.len(), batch.budget_calls, batch.test_mode)
            .await;
        let report = self.run_phase_one(run_id, batch).await;
        self.runs.finish(run_id).await;
        Ok(report)
    }

    /// Drain the subdivision queue once
    ///
    /// # Errors
    ///
    /// `SubdivisionBatchTooLarge` or `QuotaExceeded` when the queued batch is
    /// denied; the queue is left untouched.
    pub async fn process_subdivision_queue(&mut self, options: RunOptions) -> ProcessorResult<SubdivisionReport> {
        let run_id = self.runs.start(0, 0, options.test_mode).await;
        let report = self.drain_subdivisions(run_id, options.test_mode).await;
        self.runs.finish(run_id).await;
        report
    }

    /// Base scan followed by one subdivision drain
    ///
    /// A phase-2 denial is reported in the result, not returned as an error.
    pub async fn process_two_phase_algorithm(
        &mut self,
        cells: &[String],
        options: RunOptions,
    ) -> ProcessorResult<TwoPhaseReport> {
        let batch = self.admit_base_batch(cells, options.test_mode).await?;
        let run_id = self
            .runs
            .start(batch.cells.len(), batch.budget_calls, batch.test_mode)
            .await;
        Ok(self.execute_two_phase(run_id, batch).await)
    }

    /// Two-phase run with an import log in the store
    pub async fn process_unified_pipeline(
        &mut self,
        cells: &[String],
        options: RunOptions,
    ) -> ProcessorResult<PipelineResponse> {
        let batch = self.admit_base_batch(cells, options.test_mode).await?;
        let run_id = self
            .runs
            .start(batch.cells.len(), batch.budget_calls, batch.test_mode)
            .await;
        self.log_run_start(run_id, batch.cells.len(), batch.test_mode)
            .await;

        let report = self.execute_two_phase(run_id, batch).await;
        self.log_run_end(&report).await;
        Ok(PipelineResponse::from(report))
    }

    async fn admit_base_batch(&self, cells: &[String], test_mode: bool) -> ProcessorResult<AdmittedBatch> {
        if cells.is_empty() {
            return Err(ProcessorError::EmptyInput);
        }

        // Validate everything before touching any state
        let mut seen = HashSet::new();
        let mut fresh = Vec::with_capacity(cells.len());
        let mut skipped = Vec::new();
        for raw in cells {
            let cell = parse_cell(raw.trim())?;
            let key = cell_key(cell);
            if !seen.insert(key.clone()) {
                debug!(cell_id = %key, "Duplicate cell in input, ignoring");
                continue;
            }
            if self.state.get(&key).is_some() {
                debug!(cell_id = %key, "Cell already tracked, skipping");
                skipped.push(key);
                continue;
            }
            fresh.push((key, u8::from(cell.resolution())));
        }

        let resolution = fresh.iter().map(|(_, res)| *res).max().unwrap_or(0);
        let estimate = self
            .quota
            .estimate_quota_for_city(fresh.len(), resolution, BASE_OVERLAP_MULTIPLIER)
            .await;

        match authorize_batch(&estimate, fresh.len(), test_mode, &self.quota_config) {
            Admission::Denied { estimate } => {
                metrics::record_quota_denial(Phase::Base.as_str());
                warn!(
                    cells = fresh.len(),
                    estimated_calls = estimate.estimated_calls,
                    remaining = estimate.daily_remaining,
                    "Batch denied by quota admission"
                );
                Err(ProcessorError::QuotaExceeded { estimate })
            }
            Admission::Admitted {
                cells: admitted,
                budget_calls,
                test_mode,
            } => {
                skipped.extend(fresh.split_off(admitted).into_iter().map(|(id, _)| id));
                Ok(AdmittedBatch {
                    cells: fresh,
                    skipped,
                    estimate,
                    budget_calls,
                    test_mode,
                })
            }
        }
    }

    async fn run_phase_one(&mut self, run_id: Uuid, batch: AdmittedBatch) -> BatchReport {
        info!(run_id = %run_id, cells = batch.cells.len(), test_mode = batch.test_mode, "Phase 1: base scan");

        let mut outcomes = Vec::with_capacity(batch.cells.len());
        let mut skipped = batch.skipped;
        let mut api_calls = 0;
        for (i, (cell_id, resolution)) in batch.cells.iter().enumerate() {
            if batch.test_mode && api_calls >= batch.budget_calls {
                warn!(
                    run_id = %run_id,
                    spent = api_calls,
                    budget = batch.budget_calls,
                    remaining = batch.cells.len() - i,
                    "Test budget spent, skipping remaining cells"
                );
                skipped.extend(batch.cells[i..].iter().map(|(id, _)| id.clone()));
                break;
            }

            self.state.insert_queued(cell_id, *resolution, None);
            match self.process_cell(cell_id, Some(run_id)).await {
                Ok((outcome, calls)) => {
                    api_calls += calls;
                    outcomes.push(outcome);
                }
                Err(e) => warn!(cell_id = %cell_id, error = %e, "Skipping cell"),
            }
            // A base cell may already have been queued as a sibling's child
            self.state.dequeue_subdivision(cell_id);
        }

        BatchReport {
            run_id,
            estimate: batch.estimate,
            test_mode: batch.test_mode,
            outcomes,
            skipped,
            api_calls,
        }
    }

    async fn drain_subdivisions(&mut self, run_id: Uuid, test_mode: bool) -> ProcessorResult<SubdivisionReport> {
        let queued = self.state.queued_subdivisions();
        if queued.is_empty() {
            return Ok(SubdivisionReport {
                run_id,
                estimate: None,
                outcomes: Vec::new(),
                remaining_in_queue: self.state.subdivision_queue_len(),
                api_calls: 0,
            });
        }

        let limit = self.quota_config.max_subdivision_batch;
        if queued.len() > limit {
            metrics::record_quota_denial(Phase::Subdivision.as_str());
            warn!(run_id = %run_id, size = queued.len(), limit, "Subdivision batch too large");
            return Err(ProcessorError::SubdivisionBatchTooLarge {
                size: queued.len(),
                limit,
            });
        }

        let resolution = queued
            .iter()
            .filter_map(|id| self.state.get(id))
            .map(|r| r.resolution)
            .max()
            .unwrap_or(0);
        let estimate = self
            .quota
            .estimate_quota_for_city(queued.len(), resolution, SUBDIVISION_OVERLAP_MULTIPLIER)
            .await;

        let (admitted, budget_calls) = match authorize_batch(&estimate, queued.len(), test_mode, &self.quota_config) {
            Admission::Denied { estimate } => {
                metrics::record_quota_denial(Phase::Subdivision.as_str());
                warn!(
                    run_id = %run_id,
                    cells = queued.len(),
                    estimated_calls = estimate.estimated_calls,
                    "Subdivision batch denied by quota admission"
                );
                return Err(ProcessorError::QuotaExceeded { estimate });
            }
            Admission::Admitted { cells, budget_calls, .. } => (cells, budget_calls),
        };

        info!(run_id = %run_id, cells = admitted, queued = queued.len(), "Phase 2: subdivision drain");
        self.runs.add_phase2(run_id, admitted, budget_calls).await;

        let mut outcomes = Vec::with_capacity(admitted);
        let mut api_calls = 0;
        for cell_id in queued.into_iter().take(admitted) {
            if test_mode && api_calls >= budget_calls {
                warn!(
                    run_id = %run_id,
                    spent = api_calls,
                    budget = budget_calls,
                    "Test budget spent, leaving remaining children queued"
                );
                break;
            }
            match self.process_cell(&cell_id, Some(run_id)).await {
                Ok((outcome, calls)) => {
                    api_calls += calls;
                    outcomes.push(outcome);
                }
                Err(e) => warn!(cell_id = %cell_id, error = %e, "Skipping subdivision cell"),
            }
            self.state.dequeue_subdivision(&cell_id);
        }

        Ok(SubdivisionReport {
            run_id,
            estimate: Some(estimate),
            outcomes,
            remaining_in_queue: self.state.subdivision_queue_len(),
            api_calls,
        })
    }

    async fn execute_two_phase(&mut self, run_id: Uuid, batch: AdmittedBatch) -> TwoPhaseReport {
        let test_mode = batch.test_mode;
        let phase1 = self.run_phase_one(run_id, batch).await;

        let (phase2, subdivision_denied) = match self.drain_subdivisions(run_id, test_mode).await {
            Ok(report) => (Some(report), None),
            Err(e) => {
                warn!(run_id = %run_id, error = %e, "Phase 2 not run, keeping phase 1 results");
                (None, Some(e.to_string()))
            }
        };

        self.runs.finish(run_id).await;
        let run = self.runs.get(run_id).await;
        if let Some(run) = &run {
            info!(
                run_id = %run_id,
                processed = run.processed_hexagons(),
                total = run.total_hexagons(),
                api_calls = run.actual_api_calls,
                "Run complete"
            );
        }

        TwoPhaseReport {
            run_id,
            phase1,
            phase2,
            subdivision_denied,
            results: self.get_merged_results(),
            stats: self.get_processing_stats(),
            run,
        }
    }

    // ------------------------------------------------------------------------
    // Per-cell processing
    // ------------------------------------------------------------------------

    async fn process_cell(&mut self, cell_id: &str, run_id: Option<Uuid>) -> ProcessorResult<(CellOutcome, u64)> {
        self.state
            .transition(cell_id, CellStatus::Processing, Transition::Advance)?;

        if let Some(cached) = self.cached_outcome(cell_id).await {
            debug!(cell_id, count = cached.total_count, "Cache hit");
            metrics::record_cache_hit();
            return self
                .complete_cell(cell_id, Ok(cached), Attempt::single(true), run_id)
                .await;
        }

        let attempt = Attempt::single(false);
        let result = self.search.search_cell(cell_id).await;
        self.complete_cell(cell_id, result, attempt, run_id).await
    }

    async fn cached_outcome(&self, cell_id: &str) -> Option<SearchOutcome> {
        let store = self.store.as_ref()?;
        match store.get_valid_cached_tile(cell_id).await {
            Ok(tile) => tile.map(|tile| SearchOutcome {
                total_count: tile.result_count,
                unique_items: tile.items,
                coverage_quality: tile.coverage_quality,
                api_calls: 0,
            }),
            Err(e) => {
                warn!(cell_id, error = %e, "Tile cache lookup failed, searching instead");
                None
            }
        }
    }

    async fn complete_cell(
        &mut self,
        cell_id: &str,
        result: Result<SearchOutcome, SearchError>,
        attempt: Attempt,
        run_id: Option<Uuid>,
    ) -> ProcessorResult<(CellOutcome, u64)> {
        let elapsed = attempt.started.elapsed();
        let record = self.state.get_mut(cell_id)?;
        record.attempts += attempt.invocations;
        let phase = record.phase();
        let resolution = record.resolution;

        let (outcome, calls) = match result {
            Ok(found) => {
                let calls = if attempt.from_cache {
                    0
                } else {
                    u64::from(found.api_calls)
                };
                let outcome = self.record_success(cell_id, &found, attempt.from_cache, elapsed)?;
                if !attempt.from_cache {
                    self.persist_tile(cell_id, resolution, &found).await;
                }
                (outcome, calls)
            }
            Err(e) => {
                let calls = match e {
                    SearchError::InvalidCell(_) => 0,
                    _ => 1,
                };
                (self.record_failure(cell_id, &e, elapsed)?, calls)
            }
        };
        let calls = calls + attempt.prior_failed_calls;

        self.account_calls(run_id, calls).await;
        if let Some(run_id) = run_id {
            self.runs.record_processed(run_id, phase).await;
        }
        metrics::record_cell(outcome.status().as_str(), phase.as_str(), elapsed.as_secs_f64());

        Ok((outcome, calls))
    }

    fn record_success(
        &mut self,
        cell_id: &str,
        found: &SearchOutcome,
        from_cache: bool,
        elapsed: Duration,
    ) -> ProcessorResult<CellOutcome> {
        let threshold = self.config.density_threshold;
        let record = self.state.get_mut(cell_id)?;
        let count = record.record_result_count(found.total_count);
        let dense = detect_dense_with_threshold(count, threshold);
        record.coverage_quality = found.coverage_quality;
        record.needs_subdivision = dense;
        record.processing_time_ms = elapsed.as_millis() as u64;
        record.last_error = None;
        record.from_cache = from_cache;
        let resolution = record.resolution;
        let phase = record.phase();
        let coverage_quality = record.coverage_quality;

        if !dense {
            self.state
                .transition(cell_id, CellStatus::Fetched, Transition::Advance)?;
            debug!(cell_id, count, "Cell fetched");
            return Ok(CellOutcome::Fetched {
                cell_id: cell_id.to_string(),
                result_count: count,
                coverage_quality,
                from_cache,
            });
        }

        self.state
            .transition(cell_id, CellStatus::Dense, Transition::Advance)?;

        // Only base cells are subdivided
        if phase == Phase::Base {
            if let Some(children) = self.try_split(cell_id, resolution) {
                return Ok(CellOutcome::Split {
                    cell_id: cell_id.to_string(),
                    result_count: count,
                    coverage_quality,
                    children,
                });
            }
        }

        debug!(cell_id, count, "Cell dense, not subdivided");
        Ok(CellOutcome::Dense {
            cell_id: cell_id.to_string(),
            result_count: count,
            coverage_quality,
        })
    }

    fn try_split(&mut self, cell_id: &str, resolution: u8) -> Option<Vec<String>> {
        let target = resolution.saturating_add(self.config.subdivision_step);
        let split = match split_hexagon(cell_id, resolution, target) {
            Ok(split) => split,
            Err(e) => {
                warn!(cell_id, error = %e, "Dense cell cannot be subdivided");
                return None;
            }
        };

        let children = split.split_hexagons;
        match self.state.record_split(cell_id, children.clone(), target) {
            Ok(()) => {
                info!(cell_id, children = children.len(), to_resolution = target, "Dense cell split");
                Some(children)
            }
            Err(e) => {
                warn!(cell_id, error = %e, "Failed to record split");
                None
            }
        }
    }

    fn record_failure(&mut self, cell_id: &str, error: &SearchError, elapsed: Duration) -> ProcessorResult<CellOutcome> {
        let message = error.to_string();
        self.state
            .transition(cell_id, CellStatus::Failed, Transition::Advance)?;
        let record = self.state.get_mut(cell_id)?;
        record.last_error = Some(message.clone());
        record.needs_subdivision = false;
        record.processing_time_ms = elapsed.as_millis() as u64;

        warn!(
            cell_id,
            error = %message,
            recoverable = error.is_recoverable(),
            "Cell failed"
        );
        Ok(CellOutcome::Failed {
            cell_id: cell_id.to_string(),
            error: message,
        })
    }

    /// Report external calls to the quota manager, metrics and the run
    async fn account_calls(&self, run_id: Option<Uuid>, calls: u64) {
        for _ in 0..calls {
            self.quota.track_api_call().await;
        }
        metrics::record_api_calls(calls);
        if let Some(run_id) = run_id {
            self.runs.record_api_calls(run_id, calls).await;
        }
    }

    async fn persist_tile(&self, cell_id: &str, resolution: u8, found: &SearchOutcome) {
        let Some(store) = &self.store else {
            return;
        };
        let tile = CachedTile {
            cell_id: cell_id.to_string(),
            resolution,
            result_count: found.total_count,
            coverage_quality: found.coverage_quality,
            items: found.unique_items.clone(),
            fetched_at: self.clock.now(),
        };
        if let Err(e) = store.upsert_tile(&tile).await {
            warn!(cell_id, error = %e, "Failed to persist tile, continuing");
        }
    }

    async fn log_run_start(&self, run_id: Uuid, total_cells: usize, test_mode: bool) {
        let Some(store) = &self.store else {
            return;
        };
        let entry = RunLogEntry {
            run_id,
            started_at: self.clock.now(),
            total_cells,
            test_mode,
        };
        if let Err(e) = store.create_run_log(&entry).await {
            warn!(run_id = %run_id, error = %e, "Failed to create import log, continuing");
        }
    }

    async fn log_run_end(&self, report: &TwoPhaseReport) {
        let Some(store) = &self.store else {
            return;
        };
        let update = RunLogUpdate {
            status: RunLogStatus::Completed,
            finished_at: self.clock.now(),
            processed_cells: report.run.as_ref().map_or(0, RunState::processed_hexagons),
            failed_cells: report.stats.failed,
            api_calls: report.run.as_ref().map_or(0, |r| r.actual_api_calls),
            error: report.subdivision_denied.clone(),
        };
        if let Err(e) = store.update_run_log(report.run_id, &update).await {
            warn!(run_id = %report.run_id, error = %e, "Failed to update import log, continuing");
        }
    }

    // ------------------------------------------------------------------------
    // Retry
    // ------------------------------------------------------------------------

    /// Re-dispatch every failed cell with exponential backoff
    pub async fn retry_failed_hexagons(&mut self) -> RetryReport {
        let failed = self.state.failed_ids();
        let retry = self.config.retry_config();
        let mut report = RetryReport {
            attempted: failed.len(),
            ..Default::default()
        };
        if failed.is_empty() {
            return report;
        }
        info!(cells = failed.len(), max_attempts = retry.max_attempts, "Retrying failed cells");

        for cell_id in failed {
            if let Err(e) = self
                .state
                .transition(&cell_id, CellStatus::Processing, Transition::Retry)
            {
                warn!(cell_id = %cell_id, error = %e, "Cannot retry cell");
                continue;
            }

            let started = Instant::now();
            let search = Arc::clone(&self.search);
            let mut invocations: u32 = 0;
            let result = process_with_retry(&retry, || {
                invocations += 1;
                let search = Arc::clone(&search);
                let id = cell_id.clone();
                async move { search.search_cell(&id).await }
            })
            .await;

            let attempt = Attempt {
                started,
                invocations,
                from_cache: false,
                prior_failed_calls: u64::from(invocations.saturating_sub(1)),
            };
            match self.complete_cell(&cell_id, result, attempt, None).await {
                Ok((outcome, calls)) => {
                    report.api_calls += calls;
                    if outcome.is_failed() {
                        report.still_failed.push(cell_id);
                    } else {
                        report.recovered.push(cell_id);
                    }
                    report.outcomes.push(outcome);
                }
                Err(e) => warn!(cell_id = %cell_id, error = %e, "Retry bookkeeping failed"),
            }
        }

        info!(
            recovered = report.recovered.len(),
            still_failed = report.still_failed.len(),
            "Retry pass complete"
        );
        report
    }

    // ------------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------------

    pub fn get_processing_stats(&self) -> ProcessingStats {
        let mut stats = ProcessingStats::default();
        for record in self.state.records() {
            stats.total_hexagons += 1;
            match record.status {
                CellStatus::Queued => stats.queued += 1,
                CellStatus::Processing => stats.processing += 1,
                CellStatus::Fetched => stats.fetched += 1,
                CellStatus::Dense => stats.dense += 1,
                CellStatus::Failed => stats.failed += 1,
                CellStatus::Split => stats.split += 1,
            }
        }
        stats.subdivision_queue_size = self.state.subdivision_queue_len();
        stats.parent_count = self.state.graph().parent_child_relationships().len();
        stats.total_businesses = self
            .get_merged_results()
            .iter()
            .map(|m| m.total_result_count)
            .sum();

        let succeeded = stats.fetched + stats.dense + stats.split;
        let finished = succeeded + stats.failed;
        if finished > 0 {
            stats.success_rate = succeeded as f64 / finished as f64;
        }
        stats
    }

    pub fn get_merged_results(&self) -> Vec<MergedCellResult> {
        aggregate::merged_results(&self.state)
    }

    pub fn get_aggregated_child_results(&self, parent_id: &str) -> Option<AggregatedChildResults> {
        aggregate::aggregate_children(&self.state, parent_id)
    }

    pub fn get_subdivision_queue_status(&self) -> SubdivisionQueueStatus {
        let entries: Vec<QueueEntry> = self
            .state
            .subdivision_queue()
            .map(|r| QueueEntry {
                cell_id: r.cell_id.clone(),
                parent_id: r.parent_id.clone(),
                resolution: r.resolution,
                status: r.status,
            })
            .collect();
        SubdivisionQueueStatus {
            queue_size: entries.len(),
            pending: entries.iter().filter(|e| e.status == CellStatus::Queued).count(),
            parent_count: self.state.graph().parent_child_relationships().len(),
            entries,
        }
    }

    pub fn get_error_summary(&self) -> ErrorSummary {
        diagnostics::summarize_failures(&self.state)
    }

    /// Parent -> children map produced by splits
    pub fn parent_child_relationships(&self) -> &HashMap<String, Vec<String>> {
        self.state.graph().parent_child_relationships()
    }

    /// Child -> parent map produced by splits
    pub fn child_parent_relationships(&self) -> &HashMap<String, String> {
        self.state.graph().child_parent_relationships()
    }

    pub fn cell(&self, cell_id: &str) -> Option<&CellRecord> {
        self.state.get(cell_id)
    }

    pub fn state(&self) -> &ProcessingState {
        &self.state
    }

    /// Progress of a run, `None` once evicted
    pub async fn run_progress(&self, run_id: Uuid) -> Option<RunState> {
        self.runs.get(run_id).await
    }

    /// Handle for polling progress from another task
    pub fn run_tracker(&self) -> RunTracker {
        self.runs.clone()
    }

    /// Drop all in-memory processing and run state
    pub async fn clear_history(&mut self) {
        self.state.clear();
        self.runs.clear().await;
        info!("Processing history cleared");
    }
}
