pub mod estimate;
pub mod grid;
pub mod scan;

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use hexsweep::config::Config;
use hexsweep::error::Error;

// Re-export command functions for convenience
pub use estimate::estimate;
pub use grid::{coverage, split};
pub use scan::{scan, ScanParams};

/// Where the CLI reads cell ids from
#[derive(Debug, Clone, Default)]
pub struct CellSource {
    pub cells: Vec<String>,
    pub file: Option<PathBuf>,
}

impl CellSource {
    /// Inline cells followed by file cells; blank lines and `#` comments skipped
    pub async fn load(&self) -> Result<Vec<String>> {
        let mut cells: Vec<String> = self
            .cells
            .iter()
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty())
            .collect();

        if let Some(path) = &self.file {
            let content = tokio::fs::read_to_string(path)
                .await
                .map_err(Error::from)
                .with_context(|| format!("Failed to read cell file: {}", path.display()))?;
            cells.extend(parse_cell_lines(&content));
        }

        if cells.is_empty() {
            anyhow::bail!("No cells given: use --cells or --file");
        }
        Ok(cells)
    }
}

fn parse_cell_lines(content: &str) -> impl Iterator<Item = String> + '_ {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
}

/// Load config from a file when given, otherwise from the environment
pub fn load_config(path: Option<&Path>) -> Result<Config> {
    let config = match path {
        Some(path) => Config::from_file(path),
        None => Config::from_env(),
    }
    .map_err(|e| Error::config(format!("{e:#}")))?;
    config
        .validate()
        .map_err(|e| Error::config(e.to_string()))
        .context("Invalid configuration")?;
    Ok(config)
}
