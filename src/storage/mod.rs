//! Tile cache and import-log persistence
//!
//! The processor talks to storage through the [`TileStore`] trait and treats
//! every error as non-fatal. [`SqliteTileStore`] is the bundled backend.
//!
//! # Tables
//!
//! ```text
//! tiles        (cell_id PK, resolution, result_count, coverage_quality,
//!               items_json, fetched_at, updated_at, upsert_count)
//! import_logs  (run_id PK, started_at, finished_at, status, total_cells,
//!               processed_cells, failed_cells, api_calls, test_mode, error)
//! ```

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{Business, CoverageQuality};
use crate::utils::clock::{Clock, SystemClock};

/// Default freshness window for cached tiles
pub const DEFAULT_CACHE_FRESHNESS_DAYS: i64 = 30;

// ============================================================================
// Core Types
// ============================================================================

/// A previously fetched cell
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedTile {
    pub cell_id: String,
    pub resolution: u8,
    pub result_count: u64,
    pub coverage_quality: CoverageQuality,
    pub items: Vec<Business>,
    pub fetched_at: DateTime<Utc>,
}

/// Status recorded in the import log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunLogStatus {
    Running,
    Completed,
    Failed,
}

impl RunLogStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl std::str::FromStr for RunLogStatus {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(match s {
            "running" => Self::Running,
            "completed" => Self::Completed,
            _ => Self::Failed,
        })
    }
}

/// Import log row created at the start of a run
#[derive(Debug, Clone, PartialEq)]
pub struct RunLogEntry {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub total_cells: usize,
    pub test_mode: bool,
}

/// Final figures written when a run ends
#[derive(Debug, Clone, PartialEq)]
pub struct RunLogUpdate {
    pub status: RunLogStatus,
    pub finished_at: DateTime<Utc>,
    pub processed_cells: usize,
    pub failed_cells: usize,
    pub api_calls: u64,
    pub error: Option<String>,
}

/// Stored import log
#[derive(Debug, Clone, PartialEq)]
pub struct RunLogRecord {
    pub entry: RunLogEntry,
    pub status: RunLogStatus,
    pub finished_at: Option<DateTime<Utc>>,
    pub processed_cells: usize,
    pub failed_cells: usize,
    pub api_calls: u64,
    pub error: Option<String>,
}

// ============================================================================
// Repository Trait
// ============================================================================

/// Persistence consumed by the processor
#[async_trait]
pub trait TileStore: Send + Sync {
    /// Tile for `cell_id` if present and younger than the freshness window
    async fn get_valid_cached_tile(&self, cell_id: &str) -> Result<Option<CachedTile>>;

    /// Insert or refresh a tile; a fresh stored count is never overwritten
    async fn upsert_tile(&self, tile: &CachedTile) -> Result<()>;

    async fn create_run_log(&self, entry: &RunLogEntry) -> Result<()>;

    async fn update_run_log(&self, run_id: Uuid, update: &RunLogUpdate) -> Result<()>;
}

// ============================================================================
// SQLite Implementation
// ============================================================================

/// SQLite implementation of [`TileStore`]
///
/// Uses `Mutex` to ensure thread-safety for the SQLite connection.
pub struct SqliteTileStore {
    conn: Mutex<Connection>,
    freshness: Duration,
    clock: Arc<dyn Clock>,
}

impl SqliteTileStore {
    /// Open (or create) a database file
    pub fn new(path: impl AsRef<Path>, freshness_days: i64) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        let store = Self::from_connection(conn, freshness_days, Arc::new(SystemClock))?;
        tracing::info!(path = %path.display(), "SQLite tile store initialized");
        Ok(store)
    }

    /// Create in-memory store (for testing)
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to create in-memory SQLite")?;
        Self::from_connection(conn, DEFAULT_CACHE_FRESHNESS_DAYS, Arc::new(SystemClock))
    }

    /// Replace the clock used for freshness checks
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    fn from_connection(conn: Connection, freshness_days: i64, clock: Arc<dyn Clock>) -> Result<Self> {
        let store = Self {
            conn: Mutex::new(conn),
            freshness: Duration::days(freshness_days),
            clock,
        };
        store.create_schema()?;
        Ok(store)
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn create_schema(&self) -> Result<()> {
        let conn = self.lock();
        conn.execute_batch(
            r#"
                CREATE TABLE IF NOT EXISTS tiles (
                    cell_id TEXT PRIMARY KEY,
                    resolution INTEGER NOT NULL,
                    result_count INTEGER NOT NULL,
                    coverage_quality TEXT NOT NULL,
                    items_json TEXT NOT NULL,
                    fetched_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL,
                    upsert_count INTEGER NOT NULL DEFAULT 1
                );

                CREATE INDEX IF NOT EXISTS idx_tiles_fetched_at
                    ON tiles(fetched_at);

                CREATE TABLE IF NOT EXISTS import_logs (
                    run_id TEXT PRIMARY KEY,
                    started_at TEXT NOT NULL,
                    finished_at TEXT,
                    status TEXT NOT NULL,
                    total_cells INTEGER NOT NULL,
                    processed_cells INTEGER NOT NULL DEFAULT 0,
                    failed_cells INTEGER NOT NULL DEFAULT 0,
                    api_calls INTEGER NOT NULL DEFAULT 0,
                    test_mode INTEGER NOT NULL DEFAULT 0,
                    error TEXT
                );
                "#,
        )
        .context("Failed to create SQLite schema")?;

        Ok(())
    }

    fn is_fresh(&self, fetched_at: DateTime<Utc>) -> bool {
        self.clock.now() - fetched_at < self.freshness
    }

    /// Number of times a tile has been written, for diagnostics
    pub fn upsert_count(&self, cell_id: &str) -> Result<Option<u32>> {
        let conn = self.lock();
        conn.query_row(
            "SELECT upsert_count FROM tiles WHERE cell_id = ?1",
            params![cell_id],
            |row| row.get::<_, u32>(0),
        )
        .optional()
        .context("Failed to read upsert count")
    }

    /// Load an import log
    pub fn get_run_log(&self, run_id: Uuid) -> Result<Option<RunLogRecord>> {
        let conn = self.lock();
        let row = conn
            .query_row(
                "SELECT started_at, finished_at, status, total_cells, processed_cells,
                        failed_cells, api_calls, test_mode, error
                 FROM import_logs WHERE run_id = ?1",
                params![run_id.to_string()],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, i64>(3)?,
                        row.get::<_, i64>(4)?,
                        row.get::<_, i64>(5)?,
                        row.get::<_, i64>(6)?,
                        row.get::<_, bool>(7)?,
                        row.get::<_, Option<String>>(8)?,
                    ))
                },
            )
            .optional()
            .context("Failed to query import log")?;

        let Some((started, finished, status, total, processed, failed, calls, test_mode, error)) = row
        else {
            return Ok(None);
        };

        Ok(Some(RunLogRecord {
            entry: RunLogEntry {
                run_id,
                started_at: parse_timestamp(&started)?,
                total_cells: total as usize,
                test_mode,
            },
            status: status.parse().unwrap_or(RunLogStatus::Failed),
            finished_at: finished.as_deref().map(parse_timestamp).transpose()?,
            processed_cells: processed as usize,
            failed_cells: failed as usize,
            api_calls: calls as u64,
            error,
        }))
    }
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(s)
        .with_context(|| format!("Invalid timestamp in database: {s}"))?
        .with_timezone(&Utc))
}

#[async_trait]
impl TileStore for SqliteTileStore {
    async fn get_valid_cached_tile(&self, cell_id: &str) -> Result<Option<CachedTile>> {
        let conn = self.lock();
        let row = conn
            .query_row(
                "SELECT resolution, result_count, coverage_quality, items_json, fetched_at
                 FROM tiles WHERE cell_id = ?1",
                params![cell_id],
                |row| {
                    Ok((
                        row.get::<_, u8>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                    ))
                },
            )
            .optional()
            .context("Failed to query tile")?;

        let Some((resolution, count, quality, items_json, fetched_at)) = row else {
            return Ok(None);
        };

        let fetched_at = parse_timestamp(&fetched_at)?;
        if !self.is_fresh(fetched_at) {
            tracing::debug!(cell_id, %fetched_at, "Cached tile expired");
            return Ok(None);
        }

        Ok(Some(CachedTile {
            cell_id: cell_id.to_string(),
            resolution,
            result_count: count as u64,
            coverage_quality: quality.parse().unwrap_or_default(),
            items: serde_json::from_str(&items_json).context("Failed to decode cached items")?,
            fetched_at,
        }))
    }

    async fn upsert_tile(&self, tile: &CachedTile) -> Result<()> {
        let conn = self.lock();
        let now = self.clock.now().to_rfc3339();

        let existing: Option<String> = conn
            .query_row(
                "SELECT fetched_at FROM tiles WHERE cell_id = ?1",
                params![tile.cell_id],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to read existing tile")?;

        let keep_existing = match existing.as_deref() {
            Some(ts) => self.is_fresh(parse_timestamp(ts)?),
            None => false,
        };

        if keep_existing {
            conn.execute(
                "UPDATE tiles SET updated_at = ?2, upsert_count = upsert_count + 1
                 WHERE cell_id = ?1",
                params![tile.cell_id, now],
            )
            .context("Failed to update tile bookkeeping")?;
            return Ok(());
        }

        let items_json = serde_json::to_string(&tile.items).context("Failed to encode items")?;
        conn.execute(
            "INSERT INTO tiles (cell_id, resolution, result_count, coverage_quality,
                                items_json, fetched_at, updated_at, upsert_count)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 1)
             ON CONFLICT(cell_id) DO UPDATE SET
                resolution = excluded.resolution,
                result_count = excluded.result_count,
                coverage_quality = excluded.coverage_quality,
                items_json = excluded.items_json,
                fetched_at = excluded.fetched_at,
                updated_at = excluded.updated_at,
                upsert_count = tiles.upsert_count + 1",
            params![
                tile.cell_id,
                tile.resolution,
                tile.result_count as i64,
                tile.coverage_quality.as_str(),
                items_json,
                tile.fetched_at.to_rfc3339(),
                now,
            ],
        )
        .context("Failed to upsert tile")?;

        Ok(())
    }

    async fn create_run_log(&self, entry: &RunLogEntry) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO import_logs (run_id, started_at, status, total_cells, test_mode)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                entry.run_id.to_string(),
                entry.started_at.to_rfc3339(),
                RunLogStatus::Running.as_str(),
                entry.total_cells as i64,
                entry.test_mode,
            ],
        )
        .context("Failed to create import log")?;
        Ok(())
    }

    async fn update_run_log(&self, run_id: Uuid, update: &RunLogUpdate) -> Result<()> {
        let conn = self.lock();
        let changed = conn
            .execute(
                "UPDATE import_logs SET status = ?2, finished_at = ?3, processed_cells = ?4,
                        failed_cells = ?5, api_calls = ?6, error = ?7
                 WHERE run_id = ?1",
                params![
                    run_id.to_string(),
                    update.status.as_str(),
                    update.finished_at.to_rfc3339(),
                    update.processed_cells as i64,
                    update.failed_cells as i64,
                    update.api_calls as i64,
                    update.error,
                ],
            )
            .context("Failed to update import log")?;

        if changed == 0 {
            anyhow::bail!("Import log {run_id} not found");
        }
        Ok(())
    }
}
