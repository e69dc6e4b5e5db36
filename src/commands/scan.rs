use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;

use hexsweep::error::{Error, HexsweepErrorTrait};
use hexsweep::processor::{HexagonProcessor, PipelineResponse, RunOptions};
use hexsweep::quota::{DailyQuotaManager, QuotaManager};
use hexsweep::search::HttpSearchClient;
use hexsweep::storage::SqliteTileStore;
use hexsweep::utils::{format_percent, truncate_text};

use super::{load_config, CellSource};

/// Parameters for the scan command
#[derive(Debug, Clone)]
pub struct ScanParams {
    pub config_path: Option<PathBuf>,
    pub source: CellSource,
    pub test_mode: bool,
    pub retry: bool,
    pub use_cache: bool,
    pub json: bool,
}

pub async fn scan(params: ScanParams) -> Result<()> {
    let config = load_config(params.config_path.as_deref())?;
    let cells = params.source.load().await?;

    let search = Arc::new(
        HttpSearchClient::new(&config.search)
            .map_err(Error::from)
            .context("Failed to create search client")?,
    );
    let quota = Arc::new(DailyQuotaManager::new(&config.quota));
    let mut processor = HexagonProcessor::new(&config, search, quota.clone());

    if params.use_cache {
        let store = SqliteTileStore::new(&config.database.sqlite_path, config.database.cache_freshness_days)
            .map_err(|e| Error::storage(&e))
            .context("Failed to open tile store")?;
        processor = processor.with_store(Arc::new(store));
    }

    let options = RunOptions {
        test_mode: params.test_mode,
    };
    let response = match processor.process_unified_pipeline(&cells, options).await {
        Ok(response) => response,
        Err(e) => {
            for recommendation in e.recommendations() {
                eprintln!("  - {recommendation}");
            }
            let err = Error::from(e);
            tracing::warn!(category = %err.category(), recoverable = err.is_recoverable(), "Scan rejected");
            return Err(err).context("Scan rejected");
        }
    };

    if params.json {
        println!("{}", serde_json::to_string_pretty(&response).map_err(Error::from)?);
    } else {
        print_response(&response);
    }

    if params.retry && response.stats.failed > 0 {
        let retried = processor.retry_failed_hexagons().await;
        println!(
            "\nRetry: {} recovered, {} still failed",
            retried.recovered.len(),
            retried.still_failed.len()
        );
    }

    let summary = processor.get_error_summary();
    if summary.total_failed > 0 {
        println!("\nFailures ({}):", summary.total_failed);
        for (message, cells) in &summary.by_message {
            println!("  {} x {}", cells.len(), truncate_text(message, 80));
        }
        for recommendation in &summary.recommendations {
            println!("  -> {recommendation}");
        }
    }

    let status = quota.quota_status().await;
    println!(
        "\nQuota: {}/{} used today ({})",
        status.daily_used,
        status.daily_limit,
        format_percent(status.utilization)
    );
    Ok(())
}

fn print_response(response: &PipelineResponse) {
    let stats = &response.stats;
    println!("Run {}", response.run_id);
    println!("================================");
    println!(
        "Processed {}/{} cells with {} API calls",
        response.processed_hexagons, response.total_hexagons, response.api_calls
    );
    println!(
        "  fetched: {}  dense: {}  split: {}  failed: {}  queued: {}",
        stats.fetched, stats.dense, stats.split, stats.failed, stats.queued
    );
    println!("  success rate: {}", format_percent(stats.success_rate));
    println!("  businesses: {}", stats.total_businesses);
    if let Some(reason) = &response.subdivision_denied {
        println!("  subdivision skipped: {reason}");
    }

    println!();
    for result in &response.results {
        let merged = if result.merged_from_children {
            format!(" (merged from {} children)", result.child_count)
        } else {
            String::new()
        };
        println!(
            "{}  r{}  {:>6}  {}{}",
            result.cell_id, result.resolution, result.total_result_count, result.coverage_quality, merged
        );
    }
}
