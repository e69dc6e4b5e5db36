//! Failure bucketing and operator recommendations

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::state::{CellStatus, ProcessingState};

/// Failure counts above which connectivity is suspected
const CONNECTIVITY_FAILURE_THRESHOLD: usize = 10;

/// Categories of per-cell failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    /// Rate limiting by the search API
    RateLimited,
    /// Daily quota used up
    Quota,
    Timeout,
    /// Connection or DNS problems
    Network,
    /// 5xx responses
    Server,
    /// Malformed cells or undecodable responses
    Invalid,
    Unknown,
}

impl FailureClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RateLimited => "rate_limited",
            Self::Quota => "quota",
            Self::Timeout => "timeout",
            Self::Network => "network",
            Self::Server => "server",
            Self::Invalid => "invalid",
            Self::Unknown => "unknown",
        }
    }

    /// Check if a retry can plausibly succeed
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Invalid | Self::Quota)
    }

    /// Suggested wait before retrying this kind of failure
    pub fn recommended_backoff(&self) -> Duration {
        match self {
            Self::RateLimited => Duration::from_secs(60),
            Self::Quota => Duration::from_secs(3600),
            Self::Timeout | Self::Network => Duration::from_secs(5),
            Self::Server => Duration::from_secs(10),
            Self::Invalid | Self::Unknown => Duration::from_secs(1),
        }
    }

    /// Classify an error message
    pub fn classify(error_message: &str) -> Self {
        let lower = error_message.to_lowercase();

        // Check more specific patterns first
        if lower.contains("rate limit") || lower.contains("429") || lower.contains("too many requests") {
            Self::RateLimited
        } else if lower.contains("quota") {
            Self::Quota
        } else if lower.contains("timeout") || lower.contains("timed out") {
            Self::Timeout
        } else if lower.contains("connection")
            || lower.contains("connect")
            || lower.contains("network")
            || lower.contains("dns")
        {
            Self::Network
        } else if lower.contains("server error") || lower.contains("status 5") {
            Self::Server
        } else if lower.contains("invalid") || lower.contains("decod") || lower.contains("malformed") {
            Self::Invalid
        } else {
            Self::Unknown
        }
    }
}

impl std::fmt::Display for FailureClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failed cells grouped for operators
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ErrorSummary {
    pub total_failed: usize,
    /// Error message -> cells that failed with it
    pub by_message: BTreeMap<String, Vec<String>>,
    pub by_class: BTreeMap<FailureClass, usize>,
    pub recommendations: Vec<String>,
}

impl ErrorSummary {
    /// Most frequent failure class, ties broken by class order
    pub fn dominant_class(&self) -> Option<FailureClass> {
        self.by_class
            .iter()
            .max_by(|a, b| a.1.cmp(b.1).then(b.0.cmp(a.0)))
            .map(|(class, _)| *class)
    }
}

/// Bucket every failed cell by message and derive recommendations
pub fn summarize_failures(state: &ProcessingState) -> ErrorSummary {
    let mut summary = ErrorSummary::default();

    for record in state.records().filter(|r| r.status == CellStatus::Failed) {
        let message = record
            .last_error
            .clone()
            .unwrap_or_else(|| "unknown error".to_string());
        *summary.by_class.entry(FailureClass::classify(&message)).or_default() += 1;
        summary
            .by_message
            .entry(message)
            .or_default()
            .push(record.cell_id.clone());
        summary.total_failed += 1;
    }

    summary.recommendations = recommendations(&summary);
    summary
}

fn recommendations(summary: &ErrorSummary) -> Vec<String> {
    let mut out = Vec::new();
    if summary.total_failed == 0 {
        return out;
    }
    let count = |class| summary.by_class.get(&class).copied().unwrap_or(0);

    if summary.dominant_class() == Some(FailureClass::RateLimited) {
        out.push("Rate-limit errors dominate: implement better rate limiting or lower search.rate_limit".to_string());
    }
    if summary.total_failed > CONNECTIVITY_FAILURE_THRESHOLD {
        out.push(format!(
            "{} cells failed: check connectivity to the search API",
            summary.total_failed
        ));
    }
    if count(FailureClass::Quota) > 0 {
        out.push("Quota exhausted for some cells: wait for the daily reset before retrying".to_string());
    }
    if count(FailureClass::Timeout) > 0 {
        out.push("Timeouts detected: consider raising search.request_timeout_secs".to_string());
    }
    if count(FailureClass::Server) > 0 {
        out.push("The search API returned server errors: retry failed cells later".to_string());
    }
    if count(FailureClass::Invalid) > 0 {
        out.push("Some failures are not retryable: check the input cells and API responses".to_string());
    }
    out
}
