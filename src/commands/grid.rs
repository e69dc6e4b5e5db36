use anyhow::{Context, Result};

use hexsweep::error::Error;
use hexsweep::grid::{
    cell_at, cell_resolution, generate_search_points, get_coverage_stats, split_hexagon,
    validate_coverage, GeoPoint,
};
use hexsweep::utils::format_percent;

pub fn split(cell: &str, to: Option<u8>) -> Result<()> {
    let from = cell_resolution(cell).map_err(Error::from)?;
    let to = to.unwrap_or(from + 1);
    let result = split_hexagon(cell, from, to)
        .map_err(Error::from)
        .context("Split failed")?;

    println!(
        "{} (r{}) -> {} cells at r{}",
        result.parent,
        result.from_resolution,
        result.split_hexagons.len(),
        result.to_resolution
    );
    for child in &result.split_hexagons {
        println!("  {child}");
    }
    Ok(())
}

pub fn coverage(cell: Option<String>, point: Option<(f64, f64)>, resolution: u8) -> Result<()> {
    let cell_id = match (cell, point) {
        (Some(cell), _) => cell,
        (None, Some((lat, lng))) => cell_at(GeoPoint { lat, lng }, resolution).map_err(Error::from)?,
        (None, None) => anyhow::bail!("Give a cell id or --lat/--lng"),
    };

    let coverage = generate_search_points(&cell_id).map_err(Error::from)?;
    let stats = get_coverage_stats(&coverage);

    println!("Coverage for {} (r{})", coverage.cell_id, coverage.resolution);
    println!("================================");
    println!("  center: {:.6}, {:.6}", coverage.center.lat, coverage.center.lng);
    for (i, point) in coverage.sub_points.iter().enumerate() {
        println!("  point {}: {:.6}, {:.6}", i + 1, point.lat, point.lng);
    }
    println!(
        "  radius: {:.0} m (center {:.0} m)",
        coverage.search_radius_m, coverage.cell_radius_m
    );
    println!("  area: {:.0} m2", coverage.cell_area_m2);
    println!(
        "  points: {}  estimated coverage: {}",
        stats.total_points,
        format_percent(stats.estimated_coverage)
    );
    println!("  valid: {}", validate_coverage(&coverage));
    Ok(())
}
