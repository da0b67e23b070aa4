//! apv-verify library interface
//!
//! Runs the AP pipeline unit by unit, collects measurements even when a
//! stage fails, and merges the per-unit jobs into one aggregate job.

pub mod combine;
pub mod driver;
pub mod measurers;
pub mod merge;
pub mod policy;
pub mod report;
pub mod runner;
pub mod stages;
pub mod unit;

use std::path::PathBuf;

use apv_common::config::TomlConfig;
use apv_common::Result;

use crate::measurers::Measurers;
use crate::policy::CombinePolicy;
use crate::runner::Stage;
use crate::unit::{unit_grid, UnitId, Workspace};

/// Everything a run needs, built once from configuration
pub struct Harness {
    pub workspace: Workspace,
    pub stages: Vec<Box<dyn Stage>>,
    pub measurers: Measurers,
    pub policy: CombinePolicy,
    pub dataset: Option<String>,
    pub visits: Vec<u64>,
    pub detectors: Vec<u32>,
}

impl Harness {
    /// Build the harness for `output_dir`
    ///
    /// # Errors
    /// [`apv_common::Error::Config`] for invalid metric declarations or merge
    /// rules.
    pub fn from_config(config: &TomlConfig, output_dir: PathBuf) -> Result<Self> {
        let registry = config.metric_registry()?;
        let measurers = Measurers::new(
            registry,
            config.measurements.timing.clone(),
            config.measurements.memory.clone(),
        );

        Ok(Self {
            workspace: Workspace::new(output_dir),
            stages: stages::stages_from_config(&config.stages),
            measurers,
            policy: CombinePolicy::from_config(&config.merge)?,
            dataset: config.dataset.name.clone(),
            visits: config.dataset.visits.clone(),
            detectors: config.dataset.detectors.clone(),
        })
    }

    /// Configured units in processing order
    pub fn units(&self) -> Vec<UnitId> {
        unit_grid(&self.visits, &self.detectors)
    }
}
