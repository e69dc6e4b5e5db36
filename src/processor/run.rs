//! Run progress tracking
//!
//! Run state is advisory progress information, shared between the
//! processing flow and any number of pollers. Finished runs are evicted once
//! the retention window has passed on the injected clock.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::state::Phase;
use crate::utils::clock::Clock;

/// Progress counters for one run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunState {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub is_active: bool,
    pub test_mode: bool,
    pub phase1_total: usize,
    pub phase1_processed: usize,
    pub phase2_total: usize,
    pub phase2_processed: usize,
    pub actual_api_calls: u64,
    pub estimated_api_calls: u64,
}

impl RunState {
    fn new(run_id: Uuid, started_at: DateTime<Utc>, phase1_total: usize, estimated: u64, test_mode: bool) -> Self {
        Self {
            run_id,
            started_at,
            finished_at: None,
            is_active: true,
            test_mode,
            phase1_total,
            phase1_processed: 0,
            phase2_total: 0,
            phase2_processed: 0,
            actual_api_calls: 0,
            estimated_api_calls: estimated,
        }
    }

    pub fn total_hexagons(&self) -> usize {
        self.phase1_total + self.phase2_total
    }

    pub fn processed_hexagons(&self) -> usize {
        self.phase1_processed + self.phase2_processed
    }

    /// Fraction of known cells processed, 0.0 when nothing is known yet
    pub fn progress(&self) -> f64 {
        match self.total_hexagons() {
            0 => 0.0,
            total => self.processed_hexagons() as f64 / total as f64,
        }
    }

    fn is_expired(&self, now: DateTime<Utc>, retention: Duration) -> bool {
        match self.finished_at {
            Some(finished) if !self.is_active => now - finished >= retention,
            _ => false,
        }
    }
}

/// Shared handle to all in-flight and recently finished runs
#[derive(Clone)]
pub struct RunTracker {
    runs: Arc<RwLock<HashMap<Uuid, RunState>>>,
    retention: Duration,
    clock: Arc<dyn Clock>,
}

impl RunTracker {
    pub fn new(retention: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            runs: Arc::new(RwLock::new(HashMap::new())),
            retention,
            clock,
        }
    }

    /// Register a new active run
    pub async fn start(&self, phase1_total: usize, estimated_api_calls: u64, test_mode: bool) -> Uuid {
        let run_id = Uuid::new_v4();
        let now = self.clock.now();
        let state = RunState::new(run_id, now, phase1_total, estimated_api_calls, test_mode);
        let mut runs = self.runs.write().await;
        self.evict_expired(&mut runs, now);
        runs.insert(run_id, state);
        drop(runs);
        tracing::debug!(run_id = %run_id, phase1_total, "Run started");
        run_id
    }

    /// Count one processed cell
    pub async fn record_processed(&self, run_id: Uuid, phase: Phase) {
        self.update(run_id, |run| match phase {
            Phase::Base => run.phase1_processed += 1,
            Phase::Subdivision => run.phase2_processed += 1,
        })
        .await;
    }

    pub async fn record_api_calls(&self, run_id: Uuid, calls: u64) {
        if calls == 0 {
            return;
        }
        self.update(run_id, |run| run.actual_api_calls += calls).await;
    }

    /// Add phase-2 cells once the subdivision count is known
    pub async fn add_phase2(&self, run_id: Uuid, cells: usize, estimated_api_calls: u64) {
        self.update(run_id, |run| {
            run.phase2_total += cells;
            run.estimated_api_calls += estimated_api_calls;
        })
        .await;
    }

    /// Mark a run finished; it stays readable for the retention window
    pub async fn finish(&self, run_id: Uuid) {
        let now = self.clock.now();
        self.update(run_id, |run| {
            run.is_active = false;
            run.finished_at = Some(now);
        })
        .await;
        tracing::debug!(run_id = %run_id, "Run finished");
    }

    /// Snapshot of one run, evicting it first if expired
    pub async fn get(&self, run_id: Uuid) -> Option<RunState> {
        let now = self.clock.now();
        {
            let runs = self.runs.read().await;
            match runs.get(&run_id) {
                None => return None,
                Some(run) if !run.is_expired(now, self.retention) => return Some(run.clone()),
                Some(_) => {}
            }
        }
        self.runs.write().await.remove(&run_id);
        None
    }

    /// Snapshots of runs still in progress
    pub async fn active_runs(&self) -> Vec<RunState> {
        let mut runs = self.runs.write().await;
        self.evict_expired(&mut runs, self.clock.now());
        let mut active: Vec<RunState> = runs.values().filter(|r| r.is_active).cloned().collect();
        active.sort_by_key(|r| r.started_at);
        active
    }

    /// Evict every expired run; returns how many were removed
    pub async fn sweep(&self) -> usize {
        let mut runs = self.runs.write().await;
        self.evict_expired(&mut runs, self.clock.now())
    }

    fn evict_expired(&self, runs: &mut HashMap<Uuid, RunState>, now: DateTime<Utc>) -> usize {
        let before = runs.len();
        runs.retain(|_, run| !run.is_expired(now, self.retention));
        let evicted = before - runs.len();
        if evicted > 0 {
            tracing::debug!(evicted, "Evicted finished runs");
        }
        evicted
    }

    /// Number of tracked runs, expired ones included
    pub async fn len(&self) -> usize {
        self.runs.read().await.len()
    }

    pub async fn clear(&self) {
        self.runs.write().await.clear();
    }

    async fn update(&self, run_id: Uuid, f: impl FnOnce(&mut RunState)) {
        if let Some(run) = self.runs.write().await.get_mut(&run_id) {
            f(run);
        }
    }
}
