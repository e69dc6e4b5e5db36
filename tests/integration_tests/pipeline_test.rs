//! Two-phase pipeline integration tests
//!
//! Exercises the processor end to end against a scripted search API:
//! 1. Base scan with density detection and splitting
//! 2. Subdivision drain and progress accounting
//! 3. Merging child results back into parents
//! 4. Tile cache and import-log persistence

use std::sync::Arc;

use chrono::{Duration, TimeZone, Utc};
use hexsweep::models::CoverageQuality;
use hexsweep::processor::{CellOutcome, CellStatus, ProcessorError, RunOptions};
use hexsweep::quota::QuotaManager;
use hexsweep::storage::{CachedTile, RunLogStatus, SqliteTileStore, TileStore};
use hexsweep::utils::clock::ManualClock;

use super::fixtures::{base_cells, businesses, children_of, harness, test_config, FailingStore, Reply, ScriptedSearch};

// ============================================================================
// Base Scan
// ============================================================================

#[tokio::test]
async fn test_dense_cell_queues_only_its_children() {
    let cells = base_cells(3);
    let dense = cells[0].clone();
    let search = ScriptedSearch::new(Reply::Count(50)).script(&dense, &[Reply::Count(300)]);
    let mut h = harness(search);

    let report = h
        .processor
        .process_base_batch(&cells, RunOptions::default())
        .await
        .unwrap();

    assert_eq!(report.outcomes.len(), 3);
    assert!(matches!(report.outcomes[0], CellOutcome::Split { .. }));
    assert!(matches!(report.outcomes[1], CellOutcome::Fetched { result_count: 50, .. }));

    let queue = h.processor.get_subdivision_queue_status();
    let children = children_of(&dense);
    assert_eq!(queue.queue_size, children.len());
    assert_eq!(queue.pending, children.len());
    assert!(queue
        .entries
        .iter()
        .all(|e| e.parent_id.as_deref() == Some(dense.as_str())));

    let relationships = h.processor.parent_child_relationships();
    assert_eq!(relationships.len(), 1);
    assert_eq!(relationships[&dense], children);
    for child in &children {
        assert_eq!(h.processor.child_parent_relationships()[child], dense);
    }
}

#[tokio::test]
async fn test_cells_searched_in_input_order() {
    let cells = base_cells(4);
    let mut h = harness(ScriptedSearch::new(Reply::Count(1)));

    h.processor
        .process_base_batch(&cells, RunOptions::default())
        .await
        .unwrap();

    assert_eq!(h.search.searched(), cells);
}

#[tokio::test]
async fn test_exactly_threshold_is_not_dense() {
    let cells = base_cells(1);
    let mut h = harness(ScriptedSearch::new(Reply::Count(240)));

    h.processor
        .process_base_batch(&cells, RunOptions::default())
        .await
        .unwrap();

    let record = h.processor.cell(&cells[0]).unwrap();
    assert_eq!(record.status, CellStatus::Fetched);
    assert!(!record.needs_subdivision);
    assert_eq!(h.processor.get_subdivision_queue_status().queue_size, 0);
}

// ============================================================================
// Two Phases
// ============================================================================

#[tokio::test]
async fn test_two_phase_dense_and_normal() {
    let cells = base_cells(2);
    let (a, b) = (cells[0].clone(), cells[1].clone());
    let children = children_of(&a);
    let search = ScriptedSearch::new(Reply::Count(5))
        .script(&a, &[Reply::Count(300)])
        .script(&b, &[Reply::Count(50)]);
    let mut h = harness(search);

    let report = h
        .processor
        .process_two_phase_algorithm(&cells, RunOptions::default())
        .await
        .unwrap();

    assert!(report.subdivision_denied.is_none());
    assert_eq!(report.stats.split, 1);
    assert_eq!(report.phase2.as_ref().unwrap().outcomes.len(), children.len());

    let b_record = h.processor.cell(&b).unwrap();
    assert_eq!(b_record.status, CellStatus::Fetched);
    assert_eq!(b_record.total_result_count, Some(50));

    let run = report.run.as_ref().unwrap();
    assert_eq!(run.phase1_processed, 2);
    assert_eq!(run.phase2_processed, children.len());
    assert_eq!(run.processed_hexagons(), 2 + children.len());
    assert_eq!(run.total_hexagons(), 2 + children.len());
    assert_eq!(run.actual_api_calls, (2 + children.len()) as u64);
    assert!(!run.is_active);

    assert_eq!(h.search.calls(), 2 + children.len());
    assert_eq!(h.quota.quota_status().await.daily_used, (2 + children.len()) as u64);

    let merged_a = report.results.iter().find(|r| r.cell_id == a).unwrap();
    assert!(merged_a.merged_from_children);
    assert_eq!(merged_a.total_result_count, 5 * children.len() as u64);
    assert_eq!(merged_a.coverage_quality, CoverageQuality::Excellent);

    let merged_b = report.results.iter().find(|r| r.cell_id == b).unwrap();
    assert!(!merged_b.merged_from_children);
    assert_eq!(merged_b.total_result_count, 50);
    assert_eq!(report.results.len(), 2);
}

#[tokio::test]
async fn test_dense_child_is_not_split_again() {
    let cells = base_cells(1);
    let a = cells[0].clone();
    let children = children_of(&a);
    let search = ScriptedSearch::new(Reply::Count(3))
        .script(&a, &[Reply::Count(400)])
        .script(&children[0], &[Reply::Count(500)]);
    let mut h = harness(search);

    h.processor
        .process_two_phase_algorithm(&cells, RunOptions::default())
        .await
        .unwrap();

    let child = h.processor.cell(&children[0]).unwrap();
    assert_eq!(child.status, CellStatus::Dense);
    assert!(child.needs_subdivision);
    assert!(child.child_ids.is_none());
    assert_eq!(h.processor.parent_child_relationships().len(), 1);
    assert_eq!(h.processor.get_subdivision_queue_status().queue_size, 0);
}

#[tokio::test]
async fn test_aggregate_with_failed_child_is_poor() {
    let cells = base_cells(1);
    let a = cells[0].clone();
    let children = children_of(&a);
    let last = children.last().unwrap().clone();
    let search = ScriptedSearch::new(Reply::Count(10))
        .script(&a, &[Reply::Count(300)])
        .script(&last, &[Reply::ServerError(502)]);
    let mut h = harness(search);

    h.processor
        .process_two_phase_algorithm(&cells, RunOptions::default())
        .await
        .unwrap();

    let agg = h.processor.get_aggregated_child_results(&a).unwrap();
    assert_eq!(agg.total_children, children.len());
    assert_eq!(agg.failed_children, 1);
    assert_eq!(agg.completed_children, children.len() - 1);
    assert_eq!(agg.total_businesses, 10 * (children.len() as u64 - 1));
    assert_eq!(agg.coverage_quality, CoverageQuality::Poor);

    let merged = h.processor.get_merged_results();
    assert_eq!(merged[0].coverage_quality, CoverageQuality::Poor);
    assert_eq!(merged[0].total_result_count, agg.total_businesses);
}

#[tokio::test]
async fn test_merged_results_idempotent() {
    let cells = base_cells(3);
    let search = ScriptedSearch::new(Reply::Count(7)).script(&cells[1], &[Reply::Count(260)]);
    let mut h = harness(search);

    h.processor
        .process_two_phase_algorithm(&cells, RunOptions::default())
        .await
        .unwrap();

    let first = h.processor.get_merged_results();
    let second = h.processor.get_merged_results();
    assert_eq!(first, second);
    assert_eq!(
        first.iter().map(|r| r.cell_id.clone()).collect::<Vec<_>>(),
        cells
    );
}

#[tokio::test]
async fn test_drain_without_queue_is_noop() {
    let mut h = harness(ScriptedSearch::new(Reply::Count(1)));

    let report = h
        .processor
        .process_subdivision_queue(RunOptions::default())
        .await
        .unwrap();

    assert!(report.outcomes.is_empty());
    assert!(report.estimate.is_none());
    assert_eq!(h.search.calls(), 0);
}

// ============================================================================
// Single Cell
// ============================================================================

#[tokio::test]
async fn test_single_cell_processing() {
    let cells = base_cells(1);
    let a = cells[0].clone();
    let children = children_of(&a);
    let mut h = harness(ScriptedSearch::new(Reply::Count(2)).script(&a, &[Reply::Count(999)]));

    let outcome = h.processor.process_hexagon_with_coverage(&a).await.unwrap();
    match outcome {
        CellOutcome::Split {
            result_count,
            children: split_children,
            ..
        } => {
            assert_eq!(result_count, 999);
            assert_eq!(split_children, children);
        }
        other => panic!("expected split, got {other:?}"),
    }

    // A queued child can be processed on its own and leaves the queue
    let outcome = h
        .processor
        .process_hexagon_with_coverage(&children[0])
        .await
        .unwrap();
    assert!(matches!(outcome, CellOutcome::Fetched { result_count: 2, .. }));
    assert_eq!(
        h.processor.get_subdivision_queue_status().queue_size,
        children.len() - 1
    );

    // A finished cell cannot be processed again without a retry
    let err = h.processor.process_hexagon_with_coverage(&a).await.unwrap_err();
    assert!(matches!(err, ProcessorError::IllegalTransition { .. }));
}

// ============================================================================
// Persistence
// ============================================================================

#[tokio::test]
async fn test_cache_hit_skips_search_and_quota() {
    let cells = base_cells(2);
    let store = Arc::new(SqliteTileStore::in_memory().unwrap());
    store
        .upsert_tile(&CachedTile {
            cell_id: cells[0].clone(),
            resolution: 7,
            result_count: 42,
            coverage_quality: CoverageQuality::Good,
            items: businesses(&cells[0], 42),
            fetched_at: Utc::now(),
        })
        .await
        .unwrap();

    let mut h = harness(ScriptedSearch::new(Reply::Count(9)));
    h.processor = h.processor.with_store(store.clone());

    let report = h
        .processor
        .process_base_batch(&cells, RunOptions::default())
        .await
        .unwrap();

    assert!(matches!(
        report.outcomes[0],
        CellOutcome::Fetched {
            result_count: 42,
            from_cache: true,
            ..
        }
    ));
    assert_eq!(h.search.calls_for(&cells[0]), 0);
    assert_eq!(h.search.calls(), 1);
    assert_eq!(h.quota.quota_status().await.daily_used, 1);
    assert_eq!(report.api_calls, 1);

    let stored = store.get_valid_cached_tile(&cells[1]).await.unwrap().unwrap();
    assert_eq!(stored.result_count, 9);
}

#[tokio::test]
async fn test_unified_pipeline_writes_import_log() {
    let cells = base_cells(2);
    let children = children_of(&cells[0]);
    let store = Arc::new(SqliteTileStore::in_memory().unwrap());
    let search = ScriptedSearch::new(Reply::Count(4)).script(&cells[0], &[Reply::Count(320)]);
    let mut h = harness(search);
    h.processor = h.processor.with_store(store.clone());

    let response = h
        .processor
        .process_unified_pipeline(&cells, RunOptions::default())
        .await
        .unwrap();

    assert!(response.success);
    assert_eq!(response.processed_hexagons, 2 + children.len());
    assert_eq!(response.results.len(), 2);

    let log = store.get_run_log(response.run_id).unwrap().unwrap();
    assert_eq!(log.status, RunLogStatus::Completed);
    assert_eq!(log.entry.total_cells, 2);
    assert_eq!(log.processed_cells, 2 + children.len());
    assert_eq!(log.failed_cells, 0);
    assert_eq!(log.api_calls, (2 + children.len()) as u64);
    assert!(log.finished_at.is_some());
}

#[tokio::test]
async fn test_store_failures_do_not_abort_processing() {
    let cells = base_cells(3);
    let mut h = harness(ScriptedSearch::new(Reply::Count(11)));
    h.processor = h.processor.with_store(Arc::new(FailingStore));

    let response = h
        .processor
        .process_unified_pipeline(&cells, RunOptions::default())
        .await
        .unwrap();

    assert!(response.success);
    assert_eq!(response.stats.fetched, 3);
    assert_eq!(response.stats.total_businesses, 33);
    assert_eq!(h.search.calls(), 3);
}

// ============================================================================
// Run State
// ============================================================================

#[tokio::test]
async fn test_run_state_evicted_after_retention() {
    let cells = base_cells(1);
    let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2026, 4, 2, 9, 0, 0).unwrap()));
    let mut h = harness(ScriptedSearch::new(Reply::Count(1)));
    h.processor = h.processor.with_clock(clock.clone());

    let report = h
        .processor
        .process_two_phase_algorithm(&cells, RunOptions::default())
        .await
        .unwrap();

    let tracker = h.processor.run_tracker();
    assert!(h.processor.run_progress(report.run_id).await.is_some());
    clock.advance(Duration::seconds(test_config().processor.run_retention_secs as i64));
    assert!(h.processor.run_progress(report.run_id).await.is_none());
    assert_eq!(tracker.len().await, 0);
}

#[tokio::test]
async fn test_clear_history_resets_everything() {
    let cells = base_cells(2);
    let search = ScriptedSearch::new(Reply::Count(1)).script(&cells[0], &[Reply::Count(300)]);
    let mut h = harness(search);

    let report = h
        .processor
        .process_base_batch(&cells, RunOptions::default())
        .await
        .unwrap();
    h.processor.clear_history().await;

    let stats = h.processor.get_processing_stats();
    assert_eq!(stats.total_hexagons, 0);
    assert_eq!(stats.subdivision_queue_size, 0);
    assert!(h.processor.parent_child_relationships().is_empty());
    assert!(h.processor.get_merged_results().is_empty());
    assert!(h.processor.run_progress(report.run_id).await.is_none());

    // Cells can be processed again after a reset
    let again = h
        .processor
        .process_base_batch(&cells, RunOptions::default())
        .await
        .unwrap();
    assert_eq!(again.outcomes.len(), 2);
}
