//! apv-verify - AP pipeline verification harness
//!
//! Subcommands:
//! - `unit`: run the pipeline for one (visit, detector) unit in this process
//!   and write its job file
//! - `run`: run every configured unit as a child process, then merge
//! - `merge`: merge existing unit job files

use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::{Context, Result};
use apv_common::config::{resolve_output_dir, ConfigResolver, LoggingConfig};
use apv_verify::driver::{self, UnitProcess, WorkerOptions, DEFAULT_WORKERS};
use apv_verify::unit::{parse_id_list, UnitId};
use apv_verify::{report, Harness};
use clap::{Parser, Subcommand};
use tracing::{error, info, warn};
use uuid::Uuid;

/// Command-line arguments for apv-verify
#[derive(Parser, Debug)]
#[command(name = "apv-verify")]
#[command(about = "Runs the AP pipeline over a dataset and collects verification metrics")]
#[command(version)]
struct Args {
    /// Configuration file (default: APV_CONFIG, then ~/.config/apv/apv.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Output directory (default: APV_OUTPUT, then config, then ./apv-output)
    #[arg(short, long, global = true)]
    output: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run one unit and write its job file
    Unit {
        #[arg(long)]
        visit: u64,

        #[arg(long)]
        detector: u32,

        /// Run id recorded in the job metadata (generated if omitted)
        #[arg(long)]
        run_id: Option<Uuid>,
    },

    /// Run all units with bounded parallelism, then merge
    Run {
        #[command(flatten)]
        selection: UnitSelection,

        /// Maximum concurrent unit processes
        #[arg(short, long, default_value_t = DEFAULT_WORKERS, env = "APV_WORKERS")]
        workers: usize,

        /// Extra attempts for a failed unit
        #[arg(long, default_value_t = 0)]
        retries: u32,
    },

    /// Merge existing unit job files
    Merge {
        #[command(flatten)]
        selection: UnitSelection,
    },
}

/// Units to process; overrides the `[dataset]` config section
#[derive(clap::Args, Debug)]
struct UnitSelection {
    /// Visits, e.g. `410915,410929` or `410915-410920`
    #[arg(long)]
    visits: Option<String>,

    /// Detectors, e.g. `1-62`
    #[arg(long)]
    detectors: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = ConfigResolver::new(args.config.clone())
        .load()
        .context("Failed to load configuration")?;
    init_logging(&config.logging)?;

    info!("Starting apv-verify v{}", env!("CARGO_PKG_VERSION"));

    let output_dir = resolve_output_dir(args.output.as_deref(), &config);
    info!("Output directory: {}", output_dir.display());

    let mut harness = Harness::from_config(&config, output_dir)?;

    match args.command {
        Commands::Unit {
            visit,
            detector,
            run_id,
        } => run_one(&harness, UnitId::new(visit, detector), run_id.unwrap_or_else(Uuid::new_v4)),
        Commands::Run {
            selection,
            workers,
            retries,
        } => {
            apply_selection(&mut harness, &selection)?;
            run_all(&harness, args.config, WorkerOptions { workers, retries }).await
        }
        Commands::Merge { selection } => {
            apply_selection(&mut harness, &selection)?;
            merge_all(&harness)
        }
    }
}

fn run_one(harness: &Harness, unit: UnitId, run_id: Uuid) -> Result<()> {
    info!(unit = %unit, run_id = %run_id, "Running unit");
    driver::execute_unit(
        unit,
        &harness.workspace,
        &harness.stages,
        &harness.measurers,
        harness.dataset.as_deref(),
        run_id,
    )
    .with_context(|| format!("Unit {} failed", unit))
}

async fn run_all(harness: &Harness, config_path: Option<PathBuf>, options: WorkerOptions) -> Result<()> {
    let units = harness.units();
    if units.is_empty() {
        anyhow::bail!("No units to run: set [dataset] visits/detectors or pass --visits/--detectors");
    }
    if harness.stages.is_empty() {
        warn!("No stages configured, units will only record metadata");
    }

    let process = UnitProcess {
        executable: std::env::current_exe().context("Failed to locate apv-verify executable")?,
        config_path,
        output_dir: harness.workspace.root().to_path_buf(),
        run_id: Uuid::new_v4(),
    };
    info!(run_id = %process.run_id, units = units.len(), "Run starting");

    let outcomes = driver::run_units(&units, options, |unit| process.launch(unit)).await;
    let failed = outcomes.iter().filter(|o| !o.success).count();
    if failed > 0 {
        error!(failed, total = outcomes.len(), "Some units failed, merging what is available");
    }
    print!("{}", report::render_outcomes(&outcomes));

    merge_all(harness)
}

fn merge_all(harness: &Harness) -> Result<()> {
    let units = harness.units();
    let merged = driver::merge_workspace(&harness.workspace, &units, &harness.policy)
        .context("Merge failed")?;

    let summary = report::render_job(&merged);
    info!("Aggregate metrics:\n{}", summary);
    print!("{}", summary);
    Ok(())
}

fn apply_selection(harness: &mut Harness, selection: &UnitSelection) -> Result<()> {
    if let Some(visits) = &selection.visits {
        harness.visits = parse_id_list(visits)?;
    }
    if let Some(detectors) = &selection.detectors {
        harness.detectors = parse_id_list(detectors)?;
    }
    Ok(())
}

/// Initialize tracing; RUST_LOG overrides the configured level
fn init_logging(logging: &LoggingConfig) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&logging.level));

    match &logging.file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file {}", path.display()))?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .init();
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use apv_common::config::TomlConfig;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Args::command().debug_assert();
    }

    #[test]
    fn test_parse_run_arguments() {
        let args = Args::parse_from([
            "apv-verify",
            "run",
            "--visits",
            "410915,410929",
            "--detectors",
            "1-4",
            "--workers",
            "8",
            "--retries",
            "1",
            "--output",
            "/tmp/apv",
        ]);
        assert_eq!(args.output, Some(PathBuf::from("/tmp/apv")));
        match args.command {
            Commands::Run {
                selection,
                workers,
                retries,
            } => {
                assert_eq!(selection.visits.as_deref(), Some("410915,410929"));
                assert_eq!(selection.detectors.as_deref(), Some("1-4"));
                assert_eq!(workers, 8);
                assert_eq!(retries, 1);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_apply_selection_overrides_config() {
        let config = TomlConfig::from_toml_str("[dataset]\nvisits = [1]\ndetectors = [1]").unwrap();
        let mut harness = Harness::from_config(&config, PathBuf::from("/tmp/apv")).unwrap();
        let selection = UnitSelection {
            visits: None,
            detectors: Some("3-4".to_string()),
        };
        apply_selection(&mut harness, &selection).unwrap();
        assert_eq!(harness.units(), vec![UnitId::new(1, 3), UnitId::new(1, 4)]);
    }
}
