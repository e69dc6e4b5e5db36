//! Hexagonal grid helpers
//!
//! Cells are H3 indexes keyed by their canonical hex string. This module
//! parses keys and exposes the two grid-level collaborators of the processor:
//!
//! - [`coverage`] - sub-sample search points for a cell
//! - [`splitter`] - density detection and subdivision into finer cells

pub mod coverage;
pub mod splitter;

use h3o::{CellIndex, LatLng, Resolution};
use serde::{Deserialize, Serialize};

use crate::utils::error::GridError;

pub use coverage::{generate_search_points, get_coverage_stats, validate_coverage, Coverage, CoverageStats};
pub use splitter::{
    detect_dense_hexagon, merge_sub_hexagon_results, split_hexagon, ChildResult, MergedEstimate,
    SplitResult, DENSE_THRESHOLD,
};

/// A WGS84 coordinate in degrees
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lng: f64,
}

impl GeoPoint {
    /// Whether both coordinates are finite and inside the valid ranges
    pub fn is_valid(&self) -> bool {
        self.lat.is_finite()
            && self.lng.is_finite()
            && (-90.0..=90.0).contains(&self.lat)
            && (-180.0..=180.0).contains(&self.lng)
    }
}

impl From<LatLng> for GeoPoint {
    fn from(ll: LatLng) -> Self {
        Self {
            lat: ll.lat(),
            lng: ll.lng(),
        }
    }
}

/// Parse a cell key into an H3 index
pub fn parse_cell(cell_id: &str) -> Result<CellIndex, GridError> {
    cell_id
        .trim()
        .parse::<CellIndex>()
        .map_err(|_| GridError::InvalidCell(cell_id.to_string()))
}

/// Resolution of a cell key
pub fn cell_resolution(cell_id: &str) -> Result<u8, GridError> {
    parse_cell(cell_id).map(|cell| u8::from(cell.resolution()))
}

/// Convert a raw resolution number
pub fn resolution(level: u8) -> Result<Resolution, GridError> {
    Resolution::try_from(level).map_err(|_| GridError::InvalidResolution(level))
}

/// Canonical key for an H3 index
pub fn cell_key(cell: CellIndex) -> String {
    cell.to_string()
}

/// Key of the cell containing a coordinate
pub fn cell_at(point: GeoPoint, level: u8) -> Result<String, GridError> {
    let ll = LatLng::new(point.lat, point.lng)
        .map_err(|_| GridError::InvalidCell(format!("{},{}", point.lat, point.lng)))?;
    Ok(cell_key(ll.to_cell(resolution(level)?)))
}
