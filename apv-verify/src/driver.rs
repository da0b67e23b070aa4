//! Multi-unit driver
//!
//! Units run as separate processes (`apv-verify unit ...`), at most
//! `workers` at a time, and share nothing but the output directory. Once
//! every unit has finished, the per-unit job files are merged in unit order
//! by a single process.
//!
//! A unit that fails still leaves its partial job file behind, so failures
//! only reduce coverage. The merge itself needs the final unit's file.

use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use apv_common::{job_file, time, Error, MeasurementSet, Result};
use futures::stream::{self, StreamExt};
use tokio::process::Command;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::measurers::Measurers;
use crate::merge;
use crate::policy::CombinePolicy;
use crate::runner::{run_unit, Stage, UnitContext};
use crate::unit::{UnitId, Workspace};

/// Default number of concurrent unit processes
pub const DEFAULT_WORKERS: usize = 4;

/// How units are scheduled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerOptions {
    /// Maximum concurrent units (at least 1)
    pub workers: usize,
    /// Extra attempts for a failed unit
    pub retries: u32,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            retries: 0,
        }
    }
}

/// Final status of one unit after all attempts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitOutcome {
    pub unit: UnitId,
    pub attempts: u32,
    pub success: bool,
}

/// Run `launch` for every unit with bounded concurrency and retries
///
/// `launch` returns `Ok(true)` when the unit succeeded, `Ok(false)` when it
/// ran and failed, `Err` when it could not be started. Both failure kinds
/// are retried. Outcomes are returned in `units` order.
pub async fn run_units<F, Fut>(
    units: &[UnitId],
    options: WorkerOptions,
    launch: F,
) -> Vec<UnitOutcome>
where
    F: Fn(UnitId) -> Fut,
    Fut: Future<Output = anyhow::Result<bool>>,
{
    let total = units.len();
    let finished = Arc::new(AtomicUsize::new(0));
    let launch = &launch;

    info!(
        units = total,
        workers = options.workers,
        retries = options.retries,
        "Processing units"
    );

    let mut outcomes: Vec<(usize, UnitOutcome)> = stream::iter(units.iter().copied().enumerate())
        .map(|(index, unit)| {
            let finished = finished.clone();
            async move {
                let mut attempts = 0;
                let mut success = false;

                while attempts <= options.retries {
                    attempts += 1;
                    match launch(unit).await {
                        Ok(true) => {
                            success = true;
                            break;
                        }
                        Ok(false) => {
                            warn!(unit = %unit, attempt = attempts, "Unit failed");
                        }
                        Err(e) => {
                            error!(unit = %unit, attempt = attempts, error = ?e, "Unit could not be started");
                        }
                    }
                }

                let current = finished.fetch_add(1, Ordering::Relaxed) + 1;
                info!(
                    unit = %unit,
                    success,
                    attempts,
                    progress = format!("{}/{}", current, total),
                    "Unit done"
                );

                (
                    index,
                    UnitOutcome {
                        unit,
                        attempts,
                        success,
                    },
                )
            }
        })
        .buffer_unordered(options.workers.max(1))
        .collect()
        .await;

    outcomes.sort_by_key(|(index, _)| *index);
    outcomes.into_iter().map(|(_, outcome)| outcome).collect()
}

/// Launches `apv-verify unit` child processes
#[derive(Debug, Clone)]
pub struct UnitProcess {
    pub executable: PathBuf,
    pub config_path: Option<PathBuf>,
    pub output_dir: PathBuf,
    pub run_id: Uuid,
}

impl UnitProcess {
    /// Run one unit in a child process; `Ok(false)` on a non-zero exit
    pub async fn launch(&self, unit: UnitId) -> anyhow::Result<bool> {
        let mut command = Command::new(&self.executable);
        command
            .arg("unit")
            .arg("--visit")
            .arg(unit.visit.to_string())
            .arg("--detector")
            .arg(unit.detector.to_string())
            .arg("--output")
            .arg(&self.output_dir)
            .arg("--run-id")
            .arg(self.run_id.to_string());
        if let Some(config) = &self.config_path {
            command.arg("--config").arg(config);
        }

        debug!(unit = %unit, executable = %self.executable.display(), "Spawning unit process");
        let status = command.status().await?;
        Ok(status.success())
    }
}

/// Run one unit in this process and write its job file
///
/// The job file is written whether or not the unit succeeds. The returned
/// error is the unit's outcome: a stage failure, a measurement collection
/// failure, or a failure to write the job.
pub fn execute_unit(
    unit: UnitId,
    workspace: &Workspace,
    stages: &[Box<dyn Stage>],
    measurers: &Measurers,
    dataset: Option<&str>,
    run_id: Uuid,
) -> anyhow::Result<()> {
    let ctx = UnitContext {
        unit,
        unit_dir: workspace.ensure_unit_dir(unit)?,
        output_dir: workspace.root().to_path_buf(),
        dataset: dataset.map(str::to_string),
    };

    let mut job = MeasurementSet::new();
    job.set_meta("run_id", run_id.to_string());
    job.set_meta("visit", unit.visit);
    job.set_meta("detector", unit.detector);
    job.set_meta("data_id", unit.data_id());
    if let Some(dataset) = dataset {
        job.set_meta("dataset", dataset);
    }
    job.set_meta("started_at", time::now_rfc3339());

    let run = run_unit(stages, &ctx, measurers, job);
    let state = run.state.to_string();
    let (mut job, outcome) = run.into_parts();
    job.set_meta("finished_at", time::now_rfc3339());
    job.set_meta("status", state);

    let path = workspace.unit_job_path(unit);
    job_file::write_job(&job, &path)?;
    info!(unit = %unit, path = %path.display(), measurements = job.len(), "Unit job written");

    outcome
}

/// Per-unit jobs found on disk, in unit order
#[derive(Debug, Default)]
pub struct LoadedJobs {
    pub jobs: Vec<MeasurementSet>,
    pub missing: Vec<UnitId>,
}

/// Read every unit's job file; missing files are skipped
///
/// # Errors
/// [`Error::MeasurementStorage`] if a file exists but cannot be read or
/// parsed.
pub fn load_unit_jobs(workspace: &Workspace, units: &[UnitId]) -> Result<LoadedJobs> {
    let mut loaded = LoadedJobs::default();
    for &unit in units {
        let path = workspace.unit_job_path(unit);
        if !path.exists() {
            warn!(unit = %unit, path = %path.display(), "Unit job file missing, skipping");
            loaded.missing.push(unit);
            continue;
        }
        let job = job_file::read_job(&path)
            .map_err(|e| Error::storage(format!("Reading unit job {}", path.display()), e))?;
        loaded.jobs.push(job);
    }
    Ok(loaded)
}

/// Job of the last unit in processing order
///
/// # Errors
/// [`Error::MissingFinalJob`] if there are no units or the file does not
/// exist, [`Error::MeasurementStorage`] if it cannot be parsed.
pub fn load_final_job(workspace: &Workspace, units: &[UnitId]) -> Result<MeasurementSet> {
    let last = units
        .iter()
        .max()
        .ok_or_else(|| Error::MissingFinalJob(workspace.root().to_path_buf()))?;
    let path = workspace.unit_job_path(*last);
    if !path.exists() {
        return Err(Error::MissingFinalJob(path));
    }
    job_file::read_job(&path)
        .map_err(|e| Error::storage(format!("Reading final job {}", path.display()), e))
}

/// Merge the units' job files and write the aggregate job
///
/// The final job is checked first, so a run whose last unit left nothing
/// produces no aggregate at all.
pub fn merge_workspace(
    workspace: &Workspace,
    units: &[UnitId],
    policy: &CombinePolicy,
) -> Result<MeasurementSet> {
    let mut units = units.to_vec();
    units.sort();
    units.dedup();

    let final_job = load_final_job(workspace, &units)?;
    let loaded = load_unit_jobs(workspace, &units)?;

    let mut merged = merge::merge(&loaded.jobs, &final_job, policy)?;
    merged.set_meta("merged_at", time::now_rfc3339());
    merged.set_meta("units_merged", loaded.jobs.len());
    merged.set_meta(
        "units_missing",
        loaded
            .missing
            .iter()
            .map(|unit| unit.to_string())
            .collect::<Vec<_>>(),
    );

    let path = workspace.merged_job_path();
    job_file::write_job(&merged, &path)?;
    info!(
        path = %path.display(),
        units = loaded.jobs.len(),
        missing = loaded.missing.len(),
        measurements = merged.len(),
        "Merged job written"
    );
    Ok(merged)
}
