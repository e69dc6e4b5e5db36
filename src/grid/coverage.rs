//! Coverage estimation for a single cell
//!
//! A cell is searched from its center plus one sub-sample point per boundary
//! vertex, placed halfway between the center and the vertex.

use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

use super::{cell_key, parse_cell, GeoPoint};
use crate::utils::error::GridError;

/// Minimum number of sub-sample points a well-formed coverage carries
pub const MIN_SUB_POINTS: usize = 5;

/// Fraction of the resolution's edge length used as the per-point search radius
const RADIUS_EDGE_FACTOR: f64 = 0.6;

/// Search points for one cell
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Coverage {
    pub cell_id: String,
    pub resolution: u8,
    pub center: GeoPoint,
    pub sub_points: Vec<GeoPoint>,
    /// Distance from the center to a vertex, in meters
    pub cell_radius_m: f64,
    /// Radius searched around every sub-sample point, in meters
    pub search_radius_m: f64,
    /// Area of the cell, in square meters
    pub cell_area_m2: f64,
}

impl Coverage {
    /// Center followed by the sub-sample points
    pub fn all_points(&self) -> impl Iterator<Item = &GeoPoint> {
        std::iter::once(&self.center).chain(self.sub_points.iter())
    }
}

/// Aggregate numbers describing a coverage
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CoverageStats {
    pub total_points: usize,
    /// Estimated share of the cell area inside at least one search disc (0.0 - 1.0)
    pub estimated_coverage: f64,
}

/// Build the deterministic set of search points for a cell
pub fn generate_search_points(cell_id: &str) -> Result<Coverage, GridError> {
    let cell = parse_cell(cell_id)?;
    let center = GeoPoint::from(h3o::LatLng::from(cell));

    let sub_points = cell
        .boundary()
        .iter()
        .map(|vertex| GeoPoint {
            lat: (center.lat + vertex.lat()) / 2.0,
            lng: midpoint_lng(center.lng, vertex.lng()),
        })
        .collect();

    let cell_radius_m = cell.resolution().edge_length_m();

    Ok(Coverage {
        cell_id: cell_key(cell),
        resolution: u8::from(cell.resolution()),
        center,
        sub_points,
        cell_radius_m,
        search_radius_m: cell_radius_m * RADIUS_EDGE_FACTOR,
        cell_area_m2: cell.area_m2(),
    })
}

/// Structural sanity check before trusting a coverage
pub fn validate_coverage(coverage: &Coverage) -> bool {
    coverage.sub_points.len() >= MIN_SUB_POINTS
        && coverage.all_points().all(GeoPoint::is_valid)
        && coverage.search_radius_m.is_finite()
        && coverage.search_radius_m > 0.0
        && coverage.cell_area_m2 > 0.0
}

/// Pure aggregation over a coverage
pub fn get_coverage_stats(coverage: &Coverage) -> CoverageStats {
    let total_points = coverage.sub_points.len() + 1;
    let disc_area = PI * coverage.search_radius_m * coverage.search_radius_m;
    let estimated_coverage = if coverage.cell_area_m2 > 0.0 {
        (total_points as f64 * disc_area / coverage.cell_area_m2).min(1.0)
    } else {
        0.0
    };

    CoverageStats {
        total_points,
        estimated_coverage,
    }
}

// Midpoint that stays on the short side of the antimeridian
fn midpoint_lng(a: f64, b: f64) -> f64 {
    let mut delta = b - a;
    if delta > 180.0 {
        delta -= 360.0;
    } else if delta < -180.0 {
        delta += 360.0;
    }
    let mid = a + delta / 2.0;
    if mid > 180.0 {
        mid - 360.0
    } else if mid < -180.0 {
        mid + 360.0
    } else {
        mid
    }
}
