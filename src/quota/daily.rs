//! In-memory rolling daily quota.
//!
//! The window is the UTC calendar day of the injected [`Clock`]; the counter
//! resets the first time it is touched on a new day.
//!
//! ## Limitations
//!
//! - Single-process only: state is not shared across process boundaries
//! - Consumption is lost on restart

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::NaiveDate;

use super::{QuotaEstimate, QuotaManager, QuotaStatus, RiskLevel};
use crate::config::QuotaConfig;
use crate::utils::clock::{Clock, SystemClock};

/// Resolution at or above which a coarser base grid is suggested
const FINE_RESOLUTION: u8 = 10;

#[derive(Debug)]
struct Window {
    day: NaiveDate,
    used: u64,
}

/// Daily request budget tracked in memory
pub struct DailyQuotaManager {
    daily_limit: u64,
    calls_per_cell: f64,
    window: Mutex<Window>,
    clock: Arc<dyn Clock>,
}

impl DailyQuotaManager {
    /// Create a manager driven by the system clock
    pub fn new(config: &QuotaConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Create a manager reading time from `clock`
    pub fn with_clock(config: &QuotaConfig, clock: Arc<dyn Clock>) -> Self {
        let day = clock.now().date_naive();
        Self {
            daily_limit: config.daily_limit,
            calls_per_cell: config.calls_per_cell,
            window: Mutex::new(Window { day, used: 0 }),
            clock,
        }
    }

    /// Seed consumption, e.g. from a persisted counter
    pub fn with_used(self, used: u64) -> Self {
        self.current_window(|w| w.used = used);
        self
    }

    // Runs `f` on the window after rolling it over to today if needed
    fn current_window<T>(&self, f: impl FnOnce(&mut Window) -> T) -> T {
        let today = self.clock.now().date_naive();
        let mut window = self.window.lock().unwrap_or_else(|e| e.into_inner());
        if window.day != today {
            tracing::info!(
                previous = %window.day,
                used = window.used,
                "Daily quota window rolled over"
            );
            window.day = today;
            window.used = 0;
        }
        f(&mut window)
    }

    fn recommendations(
        &self,
        risk: RiskLevel,
        resolution: u8,
        estimated_calls: u64,
        remaining: u64,
    ) -> Vec<String> {
        let mut recs = Vec::new();
        match risk {
            RiskLevel::Critical => {
                recs.push(format!(
                    "Estimated {estimated_calls} calls exceeds the {remaining} remaining today; reduce the number of cells or wait for the daily quota reset"
                ));
                recs.push("Split the city into smaller batches across several days".to_string());
            }
            RiskLevel::High => {
                recs.push(
                    "This batch will consume most of the remaining daily quota".to_string(),
                );
            }
            RiskLevel::Medium => {
                recs.push("Monitor quota usage while the batch runs".to_string());
            }
            RiskLevel::Low => {}
        }
        if resolution >= FINE_RESOLUTION {
            recs.push(format!(
                "Resolution {resolution} produces many small cells; consider a coarser base grid"
            ));
        }
        recs
    }
}

#[async_trait]
impl QuotaManager for DailyQuotaManager {
    async fn estimate_quota_for_city(
        &self,
        cell_count: usize,
        resolution: u8,
        overlap_multiplier: f64,
    ) -> QuotaEstimate {
        let estimated_calls =
            (cell_count as f64 * overlap_multiplier * self.calls_per_cell).ceil() as u64;
        let used = self.current_window(|w| w.used);
        let remaining = self.daily_limit.saturating_sub(used);

        let utilization = if self.daily_limit == 0 {
            if estimated_calls == 0 {
                0.0
            } else {
                f64::INFINITY
            }
        } else {
            (used + estimated_calls) as f64 / self.daily_limit as f64
        };
        let risk_level = RiskLevel::from_utilization(utilization);

        QuotaEstimate {
            estimated_calls,
            can_process_request: estimated_calls <= remaining,
            risk_level,
            recommendations: self.recommendations(risk_level, resolution, estimated_calls, remaining),
            daily_remaining: remaining,
        }
    }

    async fn quota_status(&self) -> QuotaStatus {
        let (day, used) = self.current_window(|w| (w.day, w.used));
        QuotaStatus {
            daily_limit: self.daily_limit,
            daily_used: used,
            daily_remaining: self.daily_limit.saturating_sub(used),
            window: day,
            utilization: if self.daily_limit == 0 {
                1.0
            } else {
                used as f64 / self.daily_limit as f64
            },
        }
    }

    async fn track_api_call(&self) {
        self.current_window(|w| w.used += 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::clock::ManualClock;
    use chrono::{Duration, TimeZone, Utc};

    fn manager(limit: u64) -> (DailyQuotaManager, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 5, 1, 23, 0, 0).unwrap(),
        ));
        let config = QuotaConfig {
            daily_limit: limit,
            ..Default::default()
        };
        (DailyQuotaManager::with_clock(&config, clock.clone()), clock)
    }

    #[tokio::test]
    async fn test_estimate_is_pure() {
        let (quota, _) = manager(1000);
        let estimate = quota.estimate_quota_for_city(100, 8, 1.5).await;
        assert_eq!(estimate.estimated_calls, 150);
        assert!(estimate.can_process_request);
        assert_eq!(estimate.risk_level, RiskLevel::Low);
        assert_eq!(quota.quota_status().await.daily_used, 0);
    }

    #[tokio::test]
    async fn test_estimate_rounds_up() {
        let (quota, _) = manager(1000);
        let estimate = quota.estimate_quota_for_city(3, 8, 1.5).await;
        assert_eq!(estimate.estimated_calls, 5);
    }

    #[tokio::test]
    async fn test_exhausted_budget_denies() {
        let (quota, _) = manager(100);
        let quota = quota.with_used(90);
        let estimate = quota.estimate_quota_for_city(10, 8, 2.0).await;
        assert_eq!(estimate.estimated_calls, 20);
        assert!(!estimate.can_process_request);
        assert_eq!(estimate.risk_level, RiskLevel::Critical);
        assert!(!estimate.recommendations.is_empty());
        assert_eq!(estimate.daily_remaining, 10);
    }

    #[tokio::test]
    async fn test_track_and_rollover() {
        let (quota, clock) = manager(50);
        for _ in 0..3 {
            quota.track_api_call().await;
        }
        let status = quota.quota_status().await;
        assert_eq!(status.daily_used, 3);
        assert_eq!(status.daily_remaining, 47);

        clock.advance(Duration::hours(2));
        let status = quota.quota_status().await;
        assert_eq!(status.daily_used, 0);
        assert_eq!(status.window, NaiveDate::from_ymd_opt(2024, 5, 2).unwrap());
    }

    #[tokio::test]
    async fn test_fine_resolution_recommendation() {
        let (quota, _) = manager(10_000);
        let estimate = quota.estimate_quota_for_city(10, 11, 1.5).await;
        assert!(estimate
            .recommendations
            .iter()
            .any(|r| r.contains("coarser base grid")));
    }
}
