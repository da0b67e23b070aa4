//! Configuration loading and output folder resolution
//!
//! The configuration file is TOML. Resolution follows a fixed priority:
//! 1. Command-line argument (highest priority)
//! 2. Environment variable
//! 3. Platform config file (`~/.config/apv/apv.toml`, then `/etc/apv/apv.toml` on Linux)
//! 4. Compiled defaults (fallback)
//!
//! An explicitly requested file that does not exist is an error. A missing
//! platform file is not: the compiled defaults apply.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::measurement::Metric;
use crate::registry::MetricRegistry;
use crate::{Error, Result};

/// Environment variable naming the configuration file
pub const CONFIG_ENV_VAR: &str = "APV_CONFIG";

/// Environment variable naming the output directory
pub const OUTPUT_ENV_VAR: &str = "APV_OUTPUT";

/// Output directory used when nothing else is configured
pub const DEFAULT_OUTPUT_DIR: &str = "apv-output";

/// Default timing table: task metadata prefix → metric name
const DEFAULT_TIMING: &[(&str, &str)] = &[
    ("apPipe.runDataRef", "ap_pipe.ApPipeTime"),
    ("apPipe:ccdProcessor.runDataRef", "pipe_tasks.ProcessCcdTime"),
    ("apPipe:ccdProcessor:isr.runDataRef", "ip_isr.IsrTime"),
    ("apPipe:ccdProcessor:charImage.runDataRef", "pipe_tasks.CharacterizeImageTime"),
    ("apPipe:ccdProcessor:calibrate.runDataRef", "pipe_tasks.CalibrateTime"),
    ("apPipe:differencer.runDataRef", "pipe_tasks.ImageDifferenceTime"),
    ("apPipe:differencer:astrometer.loadAndMatch", "meas_astrom.AstrometryTime"),
    ("apPipe:differencer:register.run", "pipe_tasks.RegisterImageTime"),
    ("apPipe:differencer:subtract.subtractExposures", "ip_diffim.ImagePsfMatchTime"),
    ("apPipe:differencer:detection.run", "meas_algorithms.SourceDetectionTime"),
    ("apPipe:differencer:measurement.run", "ip_diffim.DipoleFitTime"),
    ("apPipe:associator.run", "ap_association.AssociationTime"),
];

/// Default memory table: task metadata prefix → metric name
const DEFAULT_MEMORY: &[(&str, &str)] = &[("apPipe.runDataRef", "ap_pipe.ApPipeMemory")];

/// Root configuration loaded from TOML
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TomlConfig {
    /// Directory receiving per-unit job files and the merged job
    #[serde(default)]
    pub output_dir: Option<PathBuf>,

    /// Logging configuration (optional)
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Units of work to process
    #[serde(default)]
    pub dataset: DatasetConfig,

    /// Pipeline stages, run in order for every unit
    #[serde(default)]
    pub stages: Vec<StageConfig>,

    /// Measurements derived from stage metadata
    #[serde(default)]
    pub measurements: MeasurementsConfig,

    /// Combination rules for the merge step
    #[serde(default)]
    pub merge: MergeConfig,

    /// Extra metric declarations, keyed by metric name
    #[serde(default)]
    pub metrics: BTreeMap<String, MetricConfig>,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log file path (optional, logs to stderr if not specified)
    #[serde(default)]
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: None,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Dataset selection: every (visit, detector) combination is one unit
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DatasetConfig {
    /// Dataset label recorded in job metadata
    #[serde(default)]
    pub name: Option<String>,

    #[serde(default)]
    pub visits: Vec<u64>,

    #[serde(default)]
    pub detectors: Vec<u32>,
}

/// One external pipeline stage
///
/// `args` and `env` values may use the placeholders `{visit}`, `{detector}`,
/// `{data_id}`, `{unit_dir}`, `{output_dir}` and `{dataset}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageConfig {
    pub name: String,
    pub program: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

/// Metadata-derived measurement settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeasurementsConfig {
    /// Task metadata prefix → timing metric name
    #[serde(default = "default_timing")]
    pub timing: BTreeMap<String, String>,

    /// Task metadata prefix → peak memory metric name
    #[serde(default = "default_memory")]
    pub memory: BTreeMap<String, String>,
}

impl Default for MeasurementsConfig {
    fn default() -> Self {
        Self {
            timing: default_timing(),
            memory: default_memory(),
        }
    }
}

fn default_timing() -> BTreeMap<String, String> {
    to_table(DEFAULT_TIMING)
}

fn default_memory() -> BTreeMap<String, String> {
    to_table(DEFAULT_MEMORY)
}

fn to_table(entries: &[(&str, &str)]) -> BTreeMap<String, String> {
    entries
        .iter()
        .map(|(task, metric)| (task.to_string(), metric.to_string()))
        .collect()
}

/// Merge rule overrides
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MergeConfig {
    /// Metric names ending with this suffix are summed (default: `Time`)
    #[serde(default)]
    pub duration_suffix: Option<String>,

    /// Per-metric rules; a rule for a metric replaces the built-in one
    #[serde(default)]
    pub rules: Vec<MergeRuleConfig>,
}

/// Combination kind as written in the config file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CombineKindConfig {
    Sum,
    WeightedFraction,
    PartialFraction,
    LastValue,
}

/// One per-metric merge rule
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeRuleConfig {
    pub metric: String,
    pub combine: CombineKindConfig,
    /// Denominator metric, required for `weighted_fraction`
    #[serde(default)]
    pub weights: Option<String>,
    /// "Denominator minus numerator" metric, required for `partial_fraction`
    #[serde(default)]
    pub partials: Option<String>,
}

/// Declaration of a metric not in the built-in registry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricConfig {
    pub unit: String,
    #[serde(default)]
    pub description: String,
}

impl TomlConfig {
    /// Parse configuration from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::Config(format!("Parse TOML failed: {}", e)))
    }

    /// Read and parse a configuration file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Read {} failed: {}", path.display(), e)))?;
        Self::from_toml_str(&content)
    }

    /// Built-in metric registry extended with `[metrics]` declarations
    pub fn metric_registry(&self) -> Result<MetricRegistry> {
        let mut registry = MetricRegistry::with_defaults();
        for (name, declared) in &self.metrics {
            let unit = declared.unit.parse().map_err(|_| {
                Error::Config(format!("Metric {} has unknown unit {:?}", name, declared.unit))
            })?;
            registry.register(Metric::new(name.as_str(), unit, declared.description.clone()));
        }
        Ok(registry)
    }
}

/// Locates and loads the configuration file
#[derive(Debug, Clone, Default)]
pub struct ConfigResolver {
    cli_path: Option<PathBuf>,
}

impl ConfigResolver {
    pub fn new(cli_path: Option<PathBuf>) -> Self {
        Self { cli_path }
    }

    /// Load configuration following the priority order in the module docs
    pub fn load(&self) -> Result<TomlConfig> {
        // Priority 1: Command-line argument
        if let Some(path) = &self.cli_path {
            if !path.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    path.display()
                )));
            }
            info!("Loading configuration from {}", path.display());
            return TomlConfig::from_file(path);
        }

        // Priority 2: Environment variable
        if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
            let path = PathBuf::from(path);
            if path.exists() {
                info!("Loading configuration from {} ({})", path.display(), CONFIG_ENV_VAR);
                return TomlConfig::from_file(&path);
            }
            warn!(
                "{} points to missing file {}, falling back",
                CONFIG_ENV_VAR,
                path.display()
            );
        }

        // Priority 3: Platform config file
        if let Some(path) = platform_config_file() {
            info!("Loading configuration from {}", path.display());
            return TomlConfig::from_file(&path);
        }

        // Priority 4: Compiled defaults
        debug!("No configuration file found, using compiled defaults");
        Ok(TomlConfig::default())
    }
}

/// First existing platform config file, if any
fn platform_config_file() -> Option<PathBuf> {
    let user_config = dirs::config_dir().map(|d| d.join("apv").join("apv.toml"));
    if let Some(path) = user_config {
        if path.exists() {
            return Some(path);
        }
    }

    if cfg!(target_os = "linux") {
        let system_config = PathBuf::from("/etc/apv/apv.toml");
        if system_config.exists() {
            return Some(system_config);
        }
    }
    None
}

/// Resolve the output directory
///
/// Priority: command-line argument → `APV_OUTPUT` → TOML `output_dir` →
/// `./apv-output`.
pub fn resolve_output_dir(cli_arg: Option<&Path>, config: &TomlConfig) -> PathBuf {
    if let Some(path) = cli_arg {
        return path.to_path_buf();
    }

    if let Ok(path) = std::env::var(OUTPUT_ENV_VAR) {
        if !path.trim().is_empty() {
            return PathBuf::from(path);
        }
    }

    if let Some(path) = &config.output_dir {
        return path.clone();
    }

    PathBuf::from(DEFAULT_OUTPUT_DIR)
}
