//! Error scenario integration tests
//!
//! Tests failure modes and how they surface:
//! 1. Malformed and empty input
//! 2. Quota denial for base and subdivision batches
//! 3. Per-cell failure isolation
//! 4. Retrying failed cells
//! 5. Error summaries

use hexsweep::config::Config;
use hexsweep::processor::{CellOutcome, CellStatus, FailureClass, ProcessorError, RunOptions};
use hexsweep::quota::QuotaManager;

use super::fixtures::{base_cells, children_of, harness, harness_with, test_config, Reply, ScriptedSearch};

fn config_with_limit(daily_limit: u64) -> Config {
    let mut config = test_config();
    config.quota.daily_limit = daily_limit;
    config
}

// ============================================================================
// Input Errors
// ============================================================================

#[tokio::test]
async fn test_empty_input_rejected() {
    let mut h = harness(ScriptedSearch::new(Reply::Count(1)));

    let err = h
        .processor
        .process_two_phase_algorithm(&[], RunOptions::default())
        .await
        .unwrap_err();

    assert!(matches!(err, ProcessorError::EmptyInput));
    assert_eq!(h.search.calls(), 0);
}

#[tokio::test]
async fn test_malformed_cell_rejects_whole_batch() {
    let mut cells = base_cells(2);
    cells.push("not-a-cell".to_string());
    let mut h = harness(ScriptedSearch::new(Reply::Count(1)));

    let err = h
        .processor
        .process_unified_pipeline(&cells, RunOptions::default())
        .await
        .unwrap_err();

    assert!(matches!(err, ProcessorError::InvalidCell(_)));
    assert_eq!(h.search.calls(), 0);
    assert_eq!(h.processor.get_processing_stats().total_hexagons, 0);
}

#[tokio::test]
async fn test_duplicate_cells_processed_once() {
    let cells = base_cells(2);
    let input = vec![cells[0].clone(), cells[1].clone(), cells[0].to_uppercase()];
    let mut h = harness(ScriptedSearch::new(Reply::Count(1)));

    let report = h
        .processor
        .process_base_batch(&input, RunOptions::default())
        .await
        .unwrap();

    assert_eq!(report.outcomes.len(), 2);
    assert_eq!(h.search.calls(), 2);
}

// ============================================================================
// Quota
// ============================================================================

#[tokio::test]
async fn test_quota_denial_makes_no_search_calls() {
    let cells = base_cells(4);
    let mut h = harness_with(config_with_limit(100), ScriptedSearch::new(Reply::Count(1)), Some(100));

    let err = h
        .processor
        .process_two_phase_algorithm(&cells, RunOptions::default())
        .await
        .unwrap_err();

    match &err {
        ProcessorError::QuotaExceeded { estimate } => {
            assert!(!estimate.can_process_request);
            assert_eq!(estimate.estimated_calls, 6);
            assert!(!estimate.recommendations.is_empty());
        }
        other => panic!("expected quota denial, got {other:?}"),
    }
    assert!(err.is_admission_denial());
    assert!(!err.recommendations().is_empty());
    assert_eq!(h.search.calls(), 0);
    assert_eq!(h.processor.get_processing_stats().total_hexagons, 0);
}

#[tokio::test]
async fn test_test_mode_bypasses_quota_with_cap() {
    let cells = base_cells(7);
    let mut h = harness_with(config_with_limit(100), ScriptedSearch::new(Reply::Count(1)), Some(100));

    let report = h
        .processor
        .process_base_batch(&cells, RunOptions::test())
        .await
        .unwrap();

    assert!(report.test_mode);
    assert_eq!(report.outcomes.len(), 5);
    assert_eq!(report.skipped, cells[5..].to_vec());
    assert_eq!(h.search.calls(), 5);

    let run = h.processor.run_progress(report.run_id).await.unwrap();
    assert_eq!(run.estimated_api_calls, 15);
}

#[tokio::test]
async fn test_test_mode_stops_when_call_budget_spent() {
    let cells = base_cells(10);
    let search = ScriptedSearch::new(Reply::Costly { count: 60, calls: 7 });
    let mut h = harness_with(config_with_limit(0), search, None);

    let report = h
        .processor
        .process_base_batch(&cells, RunOptions::test())
        .await
        .unwrap();

    // Budget is 5 cells x 3 units; the third 7-call cell crosses it
    assert_eq!(report.outcomes.len(), 3);
    assert_eq!(report.api_calls, 21);
    assert_eq!(h.search.calls(), 3);
    assert_eq!(h.quota.quota_status().await.daily_used, 21);
    assert_eq!(report.skipped.len(), 7);
    for cell in &cells[3..] {
        assert!(report.skipped.contains(cell), "{cell} should be skipped");
    }

    // Budget-skipped cells leave no state behind and can run later
    assert_eq!(h.processor.get_processing_stats().total_hexagons, 3);
    let later = h
        .processor
        .process_base_batch(&cells[3..5], RunOptions::test())
        .await
        .unwrap();
    assert_eq!(later.outcomes.len(), 2);
}

#[tokio::test]
async fn test_single_cell_denial_leaves_no_state() {
    let cells = base_cells(1);
    let mut h = harness_with(config_with_limit(0), ScriptedSearch::new(Reply::Count(4)), None);

    let err = h
        .processor
        .process_hexagon_with_coverage(&cells[0])
        .await
        .unwrap_err();

    assert!(matches!(err, ProcessorError::QuotaExceeded { .. }));
    assert_eq!(h.search.calls(), 0);
    let stats = h.processor.get_processing_stats();
    assert_eq!(stats.total_hexagons, 0);
    assert_eq!(stats.queued, 0);
    assert!(h.processor.cell(&cells[0]).is_none());

    // The denied cell is still eligible for a later batch
    let report = h
        .processor
        .process_base_batch(&cells, RunOptions::test())
        .await
        .unwrap();
    assert_eq!(report.outcomes.len(), 1);
    assert!(report.skipped.is_empty());
    assert_eq!(h.search.calls(), 1);
}

#[tokio::test]
async fn test_phase_two_denial_keeps_phase_one_results() {
    let cells = base_cells(2);
    let (a, b) = (cells[0].clone(), cells[1].clone());
    let children = children_of(&a);
    let search = ScriptedSearch::new(Reply::Count(30)).script(&a, &[Reply::Count(300)]);
    // Phase 1 needs 3 units; phase 2 needs 14 with only 8 left
    let mut h = harness_with(config_with_limit(10), search, None);

    let report = h
        .processor
        .process_two_phase_algorithm(&cells, RunOptions::default())
        .await
        .unwrap();

    let denied = report.subdivision_denied.as_deref().unwrap();
    assert!(denied.contains("Quota exceeded"), "{denied}");
    assert!(report.phase2.is_none());
    assert_eq!(h.search.calls(), 2);

    assert_eq!(h.processor.cell(&a).unwrap().status, CellStatus::Split);
    assert_eq!(h.processor.cell(&b).unwrap().status, CellStatus::Fetched);
    let queue = h.processor.get_subdivision_queue_status();
    assert_eq!(queue.pending, children.len());

    // Parent shows its own count until the children settle
    let merged_a = report.results.iter().find(|r| r.cell_id == a).unwrap();
    assert!(!merged_a.merged_from_children);
    assert_eq!(merged_a.total_result_count, 300);
}

#[tokio::test]
async fn test_oversized_subdivision_batch_denied() {
    let cells = base_cells(15);
    let mut search = ScriptedSearch::new(Reply::Count(5));
    for cell in &cells {
        search = search.script(cell, &[Reply::Count(250)]);
    }
    let mut h = harness_with(test_config(), search, None);

    let report = h
        .processor
        .process_base_batch(&cells, RunOptions::default())
        .await
        .unwrap();
    assert_eq!(report.outcomes.len(), 15);
    let queued = h.processor.get_subdivision_queue_status().queue_size;
    assert!(queued > 100);

    let err = h
        .processor
        .process_subdivision_queue(RunOptions::default())
        .await
        .unwrap_err();
    match err {
        ProcessorError::SubdivisionBatchTooLarge { size, limit } => {
            assert_eq!(size, queued);
            assert_eq!(limit, 100);
        }
        other => panic!("expected oversized batch, got {other:?}"),
    }
    assert_eq!(h.search.calls(), 15);
    assert_eq!(h.processor.get_subdivision_queue_status().queue_size, queued);
}

// ============================================================================
// Failure Isolation
// ============================================================================

#[tokio::test]
async fn test_failed_cell_does_not_abort_siblings() {
    let cells = base_cells(3);
    let search = ScriptedSearch::new(Reply::Count(8)).script(&cells[1], &[Reply::ServerError(503)]);
    let mut h = harness(search);

    let response = h
        .processor
        .process_unified_pipeline(&cells, RunOptions::default())
        .await
        .unwrap();

    assert!(response.success);
    assert_eq!(response.stats.fetched, 2);
    assert_eq!(response.stats.failed, 1);
    assert_eq!(response.results.len(), 2);
    assert_eq!(h.search.calls(), 3);
    assert_eq!(h.quota.quota_status().await.daily_used, 3);

    let record = h.processor.cell(&cells[1]).unwrap();
    assert_eq!(record.status, CellStatus::Failed);
    assert_eq!(record.last_error.as_deref(), Some("Server error: 503"));
    assert!(record.total_result_count.is_none());
}

#[tokio::test]
async fn test_error_summary_buckets_by_message() {
    let cells = base_cells(4);
    let search = ScriptedSearch::new(Reply::Count(1))
        .script(&cells[0], &[Reply::RateLimit])
        .script(&cells[1], &[Reply::RateLimit])
        .script(&cells[2], &[Reply::Timeout]);
    let mut h = harness(search);

    h.processor
        .process_base_batch(&cells, RunOptions::default())
        .await
        .unwrap();

    let summary = h.processor.get_error_summary();
    assert_eq!(summary.total_failed, 3);
    assert_eq!(
        summary.by_message["Rate limit exceeded"],
        vec![cells[0].clone(), cells[1].clone()]
    );
    assert_eq!(summary.by_message["Request timeout"], vec![cells[2].clone()]);
    assert_eq!(summary.dominant_class(), Some(FailureClass::RateLimited));
    assert!(summary
        .recommendations
        .iter()
        .any(|r| r.contains("implement better rate limiting")));
}

// ============================================================================
// Retry
// ============================================================================

#[tokio::test]
async fn test_retry_recovers_failed_cell() {
    let cells = base_cells(2);
    let search = ScriptedSearch::new(Reply::Count(6))
        .script(&cells[0], &[Reply::ServerError(500), Reply::ServerError(500), Reply::Count(12)]);
    let mut h = harness(search);

    h.processor
        .process_base_batch(&cells, RunOptions::default())
        .await
        .unwrap();
    assert_eq!(h.processor.get_processing_stats().failed, 1);

    let retry = h.processor.retry_failed_hexagons().await;
    assert_eq!(retry.attempted, 1);
    assert_eq!(retry.recovered, vec![cells[0].clone()]);
    assert!(retry.still_failed.is_empty());
    assert!(matches!(retry.outcomes[0], CellOutcome::Fetched { result_count: 12, .. }));
    assert_eq!(retry.api_calls, 2);

    let record = h.processor.cell(&cells[0]).unwrap();
    assert_eq!(record.status, CellStatus::Fetched);
    assert_eq!(record.total_result_count, Some(12));
    assert_eq!(record.attempts, 3);
    assert!(record.last_error.is_none());
    assert_eq!(h.processor.get_error_summary().total_failed, 0);
}

#[tokio::test]
async fn test_retry_exhausts_attempts() {
    let cells = base_cells(1);
    let search = ScriptedSearch::new(Reply::RateLimit);
    let mut h = harness(search);

    h.processor
        .process_base_batch(&cells, RunOptions::default())
        .await
        .unwrap();

    let retry = h.processor.retry_failed_hexagons().await;
    assert_eq!(retry.still_failed, cells);
    assert!(retry.recovered.is_empty());

    let max_attempts = test_config().processor.retry_max_attempts as usize;
    assert_eq!(h.search.calls(), 1 + max_attempts);
    assert_eq!(h.quota.quota_status().await.daily_used, (1 + max_attempts) as u64);

    let record = h.processor.cell(&cells[0]).unwrap();
    assert_eq!(record.status, CellStatus::Failed);
    assert_eq!(record.attempts as usize, 1 + max_attempts);
}

#[tokio::test]
async fn test_retry_dense_base_cell_splits() {
    let cells = base_cells(1);
    let children = children_of(&cells[0]);
    let search = ScriptedSearch::new(Reply::Count(2)).script(&cells[0], &[Reply::Timeout, Reply::Count(280)]);
    let mut h = harness(search);

    h.processor
        .process_base_batch(&cells, RunOptions::default())
        .await
        .unwrap();
    let retry = h.processor.retry_failed_hexagons().await;

    assert!(matches!(retry.outcomes[0], CellOutcome::Split { .. }));
    assert_eq!(h.processor.get_subdivision_queue_status().pending, children.len());
}

#[tokio::test]
async fn test_retry_with_nothing_failed() {
    let cells = base_cells(2);
    let mut h = harness(ScriptedSearch::new(Reply::Count(1)));
    h.processor
        .process_base_batch(&cells, RunOptions::default())
        .await
        .unwrap();

    let retry = h.processor.retry_failed_hexagons().await;
    assert_eq!(retry.attempted, 0);
    assert_eq!(h.search.calls(), 2);
}
