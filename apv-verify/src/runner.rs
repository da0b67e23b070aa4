//! Per-unit runner with failure recovery
//!
//! Runs a unit's stages strictly in order. A failing stage ends the sequence,
//! but every measurement collected up to that point stays in the job and a
//! post-step always runs afterwards:
//!
//! 1. metric dumps referenced by `…verify_json_path` metadata keys are read
//!    and merged into the job
//! 2. measurements are derived from the combined metadata
//!
//! The result is a [`UnitRun`]: the job together with how the run ended, so
//! the caller can persist a partial job before reporting the failure.

use std::fmt;
use std::path::{Path, PathBuf};

use apv_common::{job_file, Error, MeasurementSet, StageMetadata};
use tracing::{debug, error, info, warn};

use crate::measurers::Measurers;
use crate::unit::UnitId;

/// Metadata key suffix naming a serialized job written by a stage
pub const VERIFY_JSON_PATH_SUFFIX: &str = "verify_json_path";

/// Where a stage runs
#[derive(Debug, Clone)]
pub struct UnitContext {
    pub unit: UnitId,
    /// Scratch directory for this unit; relative metric dump paths resolve here
    pub unit_dir: PathBuf,
    pub output_dir: PathBuf,
    pub dataset: Option<String>,
}

/// One step of the per-unit pipeline
///
/// A stage may add measurements to `job` directly and returns the metadata it
/// produced. Errors are opaque to the runner and are reported unchanged.
pub trait Stage: Send + Sync {
    fn name(&self) -> &str;

    fn run(&self, ctx: &UnitContext, job: &mut MeasurementSet) -> anyhow::Result<StageMetadata>;
}

/// Progress of a unit through its stages
#[derive(Debug)]
pub enum UnitState {
    NotStarted,
    /// Stage at this index is executing
    Running(usize),
    Completed,
    Failed {
        stage_index: usize,
        stage_name: String,
        cause: anyhow::Error,
    },
}

impl UnitState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, UnitState::Completed | UnitState::Failed { .. })
    }
}

impl fmt::Display for UnitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnitState::NotStarted => write!(f, "not started"),
            UnitState::Running(index) => write!(f, "running stage {}", index),
            UnitState::Completed => write!(f, "completed"),
            UnitState::Failed {
                stage_index,
                stage_name,
                ..
            } => write!(f, "failed in stage {} ({})", stage_index, stage_name),
        }
    }
}

/// Outcome of one unit: the job it produced and how it ended
#[derive(Debug)]
pub struct UnitRun {
    pub job: MeasurementSet,
    /// Combined metadata of every stage that completed
    pub metadata: StageMetadata,
    pub state: UnitState,
    /// Failure of the post-step, if any
    pub collection_error: Option<Error>,
}

impl UnitRun {
    pub fn is_success(&self) -> bool {
        matches!(self.state, UnitState::Completed) && self.collection_error.is_none()
    }

    /// Split into the job and the unit's outcome
    ///
    /// A post-step failure takes precedence over a stage failure; the stage
    /// failure was already logged when it happened.
    pub fn into_parts(self) -> (MeasurementSet, anyhow::Result<()>) {
        let outcome = match (self.collection_error, self.state) {
            (Some(e), _) => Err(anyhow::Error::new(e)),
            (None, UnitState::Failed { cause, .. }) => Err(cause),
            (None, _) => Ok(()),
        };
        (self.job, outcome)
    }

    /// The job on success, the unit's error otherwise
    pub fn into_result(self) -> anyhow::Result<MeasurementSet> {
        let (job, outcome) = self.into_parts();
        outcome.map(|()| job)
    }
}

/// Run `stages` in order for one unit, then collect measurements
///
/// Never panics or returns early on a stage failure: the returned
/// [`UnitRun`] always carries whatever the job holds at the end.
pub fn run_unit(
    stages: &[Box<dyn Stage>],
    ctx: &UnitContext,
    measurers: &Measurers,
    mut job: MeasurementSet,
) -> UnitRun {
    let mut metadata = StageMetadata::new();
    let mut state = UnitState::NotStarted;

    info!(unit = %ctx.unit, stages = stages.len(), "Unit starting");

    for (index, stage) in stages.iter().enumerate() {
        state = UnitState::Running(index);
        debug!(unit = %ctx.unit, stage = stage.name(), "Stage starting");

        match stage.run(ctx, &mut job) {
            Ok(stage_metadata) => {
                metadata.combine(&stage_metadata);
                debug!(
                    unit = %ctx.unit,
                    stage = stage.name(),
                    measurements = job.len(),
                    "Stage completed"
                );
            }
            Err(cause) => {
                error!(
                    unit = %ctx.unit,
                    stage = stage.name(),
                    error = ?cause,
                    "Stage failed, collecting measurements made so far"
                );
                state = UnitState::Failed {
                    stage_index: index,
                    stage_name: stage.name().to_string(),
                    cause,
                };
                break;
            }
        }
    }
    if !state.is_terminal() {
        state = UnitState::Completed;
    }

    let collection_error = collect_measurements(ctx, &metadata, measurers, &mut job).err();
    if let Some(e) = &collection_error {
        warn!(unit = %ctx.unit, error = %e, "Measurement collection failed");
    }

    info!(
        unit = %ctx.unit,
        state = %state,
        measurements = job.len(),
        "Unit finished"
    );

    UnitRun {
        job,
        metadata,
        state,
        collection_error,
    }
}

/// Post-step: merge metric dumps, then derive measurements from metadata
///
/// Both parts always run; a dump failure is reported in preference to a
/// measurer failure.
fn collect_measurements(
    ctx: &UnitContext,
    metadata: &StageMetadata,
    measurers: &Measurers,
    job: &mut MeasurementSet,
) -> apv_common::Result<()> {
    let dumps = update_metrics(metadata, &ctx.unit_dir, job);
    let derived = measurers.collect(metadata, job);
    dumps.and(derived)
}

/// Merge every job dump referenced by a `…verify_json_path` metadata key
///
/// Relative paths resolve against `base_dir`. Dumps are merged in key
/// order; later dumps overwrite earlier ones.
///
/// # Errors
/// [`Error::MeasurementStorage`] if a key does not hold a path or the file
/// cannot be read or parsed. Dumps before the failing one stay merged.
pub fn update_metrics(
    metadata: &StageMetadata,
    base_dir: &Path,
    job: &mut MeasurementSet,
) -> apv_common::Result<()> {
    let keys = metadata
        .names()
        .into_iter()
        .filter(|key| key.ends_with(VERIFY_JSON_PATH_SUFFIX));

    for key in keys {
        let path = metadata
            .get_as_string(&key)
            .map_err(|e| Error::storage(format!("Metadata key {} holds no path", key), e))?;
        let path = base_dir.join(path);

        let dump = job_file::read_job(&path)
            .map_err(|e| Error::storage(format!("Reading metrics from {}", path.display()), e))?;
        debug!(
            key = %key,
            path = %path.display(),
            measurements = dump.len(),
            "Metric dump merged"
        );
        *job += dump;
    }
    Ok(())
}
