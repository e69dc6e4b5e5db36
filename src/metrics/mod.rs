//! Prometheus metrics for the hexagon processor
//!
//! Tracks:
//! - Cells processed, labelled by final status and phase
//! - External search calls and cache hits
//! - Quota admission denials per phase
//! - Per-cell processing duration
//!
//! # Usage
//!
//! Call `init_metrics()` at application startup to register all metrics.
//! If initialization fails, metrics operations become no-ops.

use prometheus::{
    register_counter, register_counter_vec, register_histogram_vec, Counter, CounterVec, Encoder,
    HistogramVec, TextEncoder,
};
use std::sync::OnceLock;

// ============================================================================
// Metrics Storage
// ============================================================================

struct ProcessorMetrics {
    cells_processed: CounterVec,
    api_calls: Counter,
    cache_hits: Counter,
    quota_denials: CounterVec,
    cell_duration: HistogramVec,
}

static PROCESSOR_METRICS: OnceLock<ProcessorMetrics> = OnceLock::new();

/// Flag to track if initialization was attempted
static METRICS_INIT_ATTEMPTED: OnceLock<bool> = OnceLock::new();

// ============================================================================
// Initialization
// ============================================================================

/// Initialize all Prometheus metrics
///
/// Safe to call more than once; only the first call registers.
///
/// # Example
///
/// ```ignore
/// if let Err(e) = hexsweep::metrics::init_metrics() {
///     eprintln!("Warning: Metrics initialization failed: {}", e);
/// }
/// ```
pub fn init_metrics() -> Result<(), Box<dyn std::error::Error>> {
    if METRICS_INIT_ATTEMPTED.get().is_some() {
        return Ok(());
    }
    METRICS_INIT_ATTEMPTED.set(true).ok();

    let metrics = ProcessorMetrics {
        cells_processed: register_counter_vec!(
            "hexsweep_cells_processed_total",
            "Cells processed by final status and phase",
            &["status", "phase"]
        )?,
        api_calls: register_counter!(
            "hexsweep_api_calls_total",
            "External search requests issued"
        )?,
        cache_hits: register_counter!(
            "hexsweep_cache_hits_total",
            "Cells served from the tile cache"
        )?,
        quota_denials: register_counter_vec!(
            "hexsweep_quota_denials_total",
            "Batches rejected by quota admission control",
            &["phase"]
        )?,
        cell_duration: register_histogram_vec!(
            "hexsweep_cell_duration_seconds",
            "Time spent processing one cell in seconds",
            &["phase"],
            vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]
        )?,
    };

    PROCESSOR_METRICS
        .set(metrics)
        .map_err(|_| "Processor metrics already initialized")?;

    tracing::info!("Prometheus metrics initialized successfully");
    Ok(())
}

/// Check if metrics have been initialized
pub fn metrics_initialized() -> bool {
    PROCESSOR_METRICS.get().is_some()
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Encode all metrics to Prometheus text format
pub fn encode_metrics() -> Result<String, Box<dyn std::error::Error>> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}

/// Record one processed cell
pub fn record_cell(status: &str, phase: &str, duration_secs: f64) {
    let Some(m) = PROCESSOR_METRICS.get() else {
        return;
    };

    m.cells_processed.with_label_values(&[status, phase]).inc();
    m.cell_duration
        .with_label_values(&[phase])
        .observe(duration_secs);
}

/// Record external search requests
pub fn record_api_calls(count: u64) {
    if count == 0 {
        return;
    }
    if let Some(m) = PROCESSOR_METRICS.get() {
        m.api_calls.inc_by(count as f64);
    }
}

pub fn record_cache_hit() {
    if let Some(m) = PROCESSOR_METRICS.get() {
        m.cache_hits.inc();
    }
}

/// Record a batch rejected by admission control
pub fn record_quota_denial(phase: &str) {
    if let Some(m) = PROCESSOR_METRICS.get() {
        m.quota_denials.with_label_values(&[phase]).inc();
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_metrics() {
        assert!(init_metrics().is_ok());
        // Second call is a no-op
        assert!(init_metrics().is_ok());
        assert!(metrics_initialized());
    }

    #[test]
    fn test_encode_metrics() {
        let _ = init_metrics();
        record_cell("fetched", "base", 0.2);
        record_api_calls(3);
        let text = encode_metrics().unwrap();
        assert!(text.contains("hexsweep_"));
    }

    #[test]
    fn test_recording_does_not_panic() {
        record_cell("failed", "subdivision", 0.01);
        record_api_calls(0);
        record_cache_hit();
        record_quota_denial("base");
    }
}
