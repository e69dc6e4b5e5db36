//! Test fixtures for integration tests
//!
//! Provides a scripted search client, a store that always fails, and helpers
//! for building real H3 cells around Seoul.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::anyhow;
use async_trait::async_trait;
use uuid::Uuid;

use hexsweep::config::Config;
use hexsweep::grid::{cell_at, split_hexagon, GeoPoint};
use hexsweep::models::{Business, CoverageQuality};
use hexsweep::processor::HexagonProcessor;
use hexsweep::quota::DailyQuotaManager;
use hexsweep::search::{SearchClient, SearchOutcome};
use hexsweep::storage::{CachedTile, RunLogEntry, RunLogUpdate, TileStore};
use hexsweep::utils::error::SearchError;

pub const SEOUL: GeoPoint = GeoPoint {
    lat: 37.5665,
    lng: 126.9780,
};

/// Scripted reply of the fake search API
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Reply {
    Count(u64),
    /// `count` businesses found with `calls` requests (a saturated cell)
    Costly { count: u64, calls: u32 },
    RateLimit,
    ServerError(u16),
    Timeout,
}

/// Search client answering from per-cell scripts
pub struct ScriptedSearch {
    scripts: Mutex<HashMap<String, VecDeque<Reply>>>,
    default_reply: Reply,
    calls: AtomicUsize,
    log: Mutex<Vec<String>>,
}

impl ScriptedSearch {
    pub fn new(default_reply: Reply) -> Self {
        Self {
            scripts: Mutex::new(HashMap::new()),
            default_reply,
            calls: AtomicUsize::new(0),
            log: Mutex::new(Vec::new()),
        }
    }

    /// Replies for `cell_id`, used in order before falling back to the default
    pub fn script(self, cell_id: &str, replies: &[Reply]) -> Self {
        self.scripts
            .lock()
            .unwrap()
            .insert(cell_id.to_string(), replies.iter().copied().collect());
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn calls_for(&self, cell_id: &str) -> usize {
        self.log.lock().unwrap().iter().filter(|c| *c == cell_id).count()
    }

    /// Cells in the order they were searched
    pub fn searched(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }
}

#[async_trait]
impl SearchClient for ScriptedSearch {
    async fn search_cell(&self, cell_id: &str) -> Result<SearchOutcome, SearchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.log.lock().unwrap().push(cell_id.to_string());

        let reply = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(cell_id)
            .and_then(VecDeque::pop_front)
            .unwrap_or(self.default_reply);

        match reply {
            Reply::Count(n) => Ok(SearchOutcome::new(
                businesses(cell_id, n),
                CoverageQuality::Excellent,
                1,
            )),
            Reply::Costly { count, calls } => Ok(SearchOutcome::new(
                businesses(cell_id, count),
                CoverageQuality::Good,
                calls,
            )),
            Reply::RateLimit => Err(SearchError::RateLimit),
            Reply::ServerError(code) => Err(SearchError::ServerError(code)),
            Reply::Timeout => Err(SearchError::Timeout),
        }
    }
}

pub fn businesses(cell_id: &str, n: u64) -> Vec<Business> {
    (0..n)
        .map(|i| Business {
            id: format!("{cell_id}-{i}"),
            name: format!("Shop {i}"),
            lat: SEOUL.lat,
            lng: SEOUL.lng,
            address: None,
            category: Some("cafe".to_string()),
        })
        .collect()
}

/// Store whose every operation fails
pub struct FailingStore;

#[async_trait]
impl TileStore for FailingStore {
    async fn get_valid_cached_tile(&self, _cell_id: &str) -> anyhow::Result<Option<CachedTile>> {
        Err(anyhow!("database is locked"))
    }

    async fn upsert_tile(&self, _tile: &CachedTile) -> anyhow::Result<()> {
        Err(anyhow!("database is locked"))
    }

    async fn create_run_log(&self, _entry: &RunLogEntry) -> anyhow::Result<()> {
        Err(anyhow!("database is locked"))
    }

    async fn update_run_log(&self, _run_id: Uuid, _update: &RunLogUpdate) -> anyhow::Result<()> {
        Err(anyhow!("database is locked"))
    }
}

/// Config with millisecond retry delays
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.processor.retry_base_delay_ms = 1;
    config.processor.retry_max_delay_ms = 5;
    config.processor.retry_jitter_ms = 0;
    config
}

/// `n` distinct resolution-7 cells around Seoul, in a stable order
pub fn base_cells(n: usize) -> Vec<String> {
    let parent = cell_at(SEOUL, 5).unwrap();
    let mut cells = split_hexagon(&parent, 5, 7).unwrap().split_hexagons;
    assert!(n <= cells.len(), "fixture supports up to {} cells", cells.len());
    cells.truncate(n);
    cells
}

/// Children a resolution-7 cell splits into
pub fn children_of(cell_id: &str) -> Vec<String> {
    split_hexagon(cell_id, 7, 8).unwrap().split_hexagons
}

pub struct Harness {
    pub processor: HexagonProcessor,
    pub search: Arc<ScriptedSearch>,
    pub quota: Arc<DailyQuotaManager>,
}

pub fn harness(search: ScriptedSearch) -> Harness {
    harness_with(test_config(), search, None)
}

/// Harness with a quota already partly consumed
pub fn harness_with(config: Config, search: ScriptedSearch, used: Option<u64>) -> Harness {
    let search = Arc::new(search);
    let mut quota = DailyQuotaManager::new(&config.quota);
    if let Some(used) = used {
        quota = quota.with_used(used);
    }
    let quota = Arc::new(quota);
    let processor = HexagonProcessor::new(&config, search.clone(), quota.clone());
    Harness {
        processor,
        search,
        quota,
    }
}
