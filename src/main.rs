use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use hexsweep::error::{Error, HexsweepErrorTrait};

mod commands;

use commands::{CellSource, ScanParams};

#[derive(Parser)]
#[command(
    name = "hexsweep",
    version,
    about = "Hexagonal-grid business search planner with adaptive subdivision",
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log format (text, json)
    #[arg(long, global = true, env = "HEXSWEEP_LOG_FORMAT", default_value = "text")]
    log_format: String,

    /// TOML configuration file (defaults to HEXSWEEP_* environment variables)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the two-phase search over a list of cells
    Scan {
        /// Comma-separated cell ids
        #[arg(long, value_delimiter = ',')]
        cells: Vec<String>,

        /// File with one cell id per line
        #[arg(short, long)]
        file: Option<PathBuf>,

        /// Bypass quota denial with the test safety cap
        #[arg(long, default_value = "false")]
        test_mode: bool,

        /// Retry failed cells once the run finishes
        #[arg(long, default_value = "false")]
        retry: bool,

        /// Skip the SQLite tile cache and import log
        #[arg(long, default_value = "false")]
        no_cache: bool,

        /// Print the full response as JSON
        #[arg(long, default_value = "false")]
        json: bool,
    },

    /// Estimate quota cost of a batch without searching
    Estimate {
        /// Comma-separated cell ids
        #[arg(long, value_delimiter = ',')]
        cells: Vec<String>,

        /// File with one cell id per line
        #[arg(short, long)]
        file: Option<PathBuf>,

        /// Use the subdivision overlap multiplier
        #[arg(long, default_value = "false")]
        subdivision: bool,
    },

    /// List the finer cells a cell splits into
    Split {
        /// Cell id to split
        cell: String,

        /// Target resolution (defaults to one level finer)
        #[arg(short, long)]
        to: Option<u8>,
    },

    /// Show the search points sampled for a cell
    Coverage {
        /// Cell id (or use --lat/--lng/--resolution)
        cell: Option<String>,

        #[arg(long, requires = "lng", allow_hyphen_values = true)]
        lat: Option<f64>,

        #[arg(long, requires = "lat", allow_hyphen_values = true)]
        lng: Option<f64>,

        #[arg(short, long, default_value = "8")]
        resolution: u8,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize tracing/logging
    setup_tracing(&cli.log_format, cli.verbose)?;

    if let Err(e) = hexsweep::metrics::init_metrics() {
        tracing::warn!(error = %e, "Metrics initialization failed, continuing without metrics");
    }

    if let Err(e) = run(cli).await {
        if let Some(err) = e.downcast_ref::<Error>() {
            tracing::error!(
                category = %err.category(),
                recoverable = err.is_recoverable(),
                "Command failed"
            );
            if err.is_recoverable() {
                eprintln!("The {} error may clear up on its own; try again later.", err.category());
            }
        }
        return Err(e);
    }

    Ok(())
}

async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Scan {
            cells,
            file,
            test_mode,
            retry,
            no_cache,
            json,
        } => {
            tracing::info!(
                cells = cells.len(),
                file = ?file,
                test_mode,
                retry,
                "Starting scan command"
            );
            commands::scan(ScanParams {
                config_path: cli.config,
                source: CellSource { cells, file },
                test_mode,
                retry,
                use_cache: !no_cache,
                json,
            })
            .await?;
        }

        Commands::Estimate {
            cells,
            file,
            subdivision,
        } => {
            commands::estimate(cli.config, CellSource { cells, file }, subdivision).await?;
        }

        Commands::Split { cell, to } => {
            commands::split(&cell, to)?;
        }

        Commands::Coverage {
            cell,
            lat,
            lng,
            resolution,
        } => {
            commands::coverage(cell, lat.zip(lng), resolution)?;
        }
    }

    Ok(())
}

fn setup_tracing(format: &str, verbose: bool) -> Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if verbose {
            tracing_subscriber::EnvFilter::new("hexsweep=debug,info")
        } else {
            tracing_subscriber::EnvFilter::new("hexsweep=info,warn")
        }
    });

    match format {
        "json" => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().json())
                .init();
        }
        _ => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().with_target(false))
                .init();
        }
    }

    Ok(())
}
