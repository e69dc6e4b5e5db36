use anyhow::Result;
use std::path::PathBuf;

use hexsweep::error::Error;
use hexsweep::grid::cell_resolution;
use hexsweep::quota::{
    authorize_batch, Admission, DailyQuotaManager, QuotaManager, BASE_OVERLAP_MULTIPLIER,
    SUBDIVISION_OVERLAP_MULTIPLIER,
};
use hexsweep::utils::format_percent;

use super::{load_config, CellSource};

pub async fn estimate(config_path: Option<PathBuf>, source: CellSource, subdivision: bool) -> Result<()> {
    let config = load_config(config_path.as_deref())?;
    let cells = source.load().await?;

    let mut resolution = 0;
    for cell in &cells {
        resolution = resolution.max(cell_resolution(cell).map_err(Error::from)?);
    }

    let overlap = if subdivision {
        SUBDIVISION_OVERLAP_MULTIPLIER
    } else {
        BASE_OVERLAP_MULTIPLIER
    };
    let quota = DailyQuotaManager::new(&config.quota);
    let estimate = quota
        .estimate_quota_for_city(cells.len(), resolution, overlap)
        .await;
    let status = quota.quota_status().await;

    println!("Quota estimate");
    println!("================================");
    println!("  cells: {} (resolution {resolution}, overlap {overlap})", cells.len());
    println!("  estimated calls: {}", estimate.estimated_calls);
    println!(
        "  remaining today: {} of {} ({} used)",
        estimate.daily_remaining,
        status.daily_limit,
        format_percent(status.utilization)
    );
    println!("  risk: {}", estimate.risk_level);

    match authorize_batch(&estimate, cells.len(), false, &config.quota) {
        Admission::Admitted { .. } => println!("  admission: admitted"),
        Admission::Denied { .. } => println!("  admission: denied (use --test-mode for a capped trial)"),
    }

    for recommendation in &estimate.recommendations {
        println!("  -> {recommendation}");
    }
    Ok(())
}
