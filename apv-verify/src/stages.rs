//! External command stages
//!
//! Each configured stage is a program run once per unit. Arguments and
//! environment values may use these placeholders:
//!
//! | placeholder     | value                          |
//! |-----------------|--------------------------------|
//! | `{visit}`       | visit number                   |
//! | `{detector}`    | detector number                |
//! | `{data_id}`     | `visit=V detector=D`           |
//! | `{unit_dir}`    | the unit's scratch directory   |
//! | `{output_dir}`  | the run's output directory     |
//! | `{dataset}`     | dataset name, empty if unset   |
//!
//! The program runs in the unit's scratch directory. Its standard output is
//! the stage metadata (a JSON object, or nothing); a non-zero exit status
//! fails the stage.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{bail, Context};
use apv_common::config::StageConfig;
use apv_common::{MeasurementSet, StageMetadata};
use tracing::debug;

use crate::runner::{Stage, UnitContext};

/// Longest stderr excerpt kept in a stage error
const STDERR_EXCERPT_CHARS: usize = 2000;

/// A pipeline stage backed by an external program
#[derive(Debug, Clone)]
pub struct CommandStage {
    name: String,
    program: PathBuf,
    args: Vec<String>,
    env: BTreeMap<String, String>,
}

impl CommandStage {
    pub fn new(name: impl Into<String>, program: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            program: program.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    fn command(&self, ctx: &UnitContext) -> Command {
        let mut command = Command::new(resolve_program(&self.program));
        command
            .args(self.args.iter().map(|arg| expand(arg, ctx)))
            .envs(self.env.iter().map(|(key, value)| (key, expand(value, ctx))))
            .current_dir(&ctx.unit_dir);
        command
    }
}

impl From<&StageConfig> for CommandStage {
    fn from(config: &StageConfig) -> Self {
        Self {
            name: config.name.clone(),
            program: config.program.clone(),
            args: config.args.clone(),
            env: config.env.clone(),
        }
    }
}

impl Stage for CommandStage {
    fn name(&self) -> &str {
        &self.name
    }

    fn run(&self, ctx: &UnitContext, _job: &mut MeasurementSet) -> anyhow::Result<StageMetadata> {
        debug!(
            unit = %ctx.unit,
            stage = %self.name,
            program = %self.program.display(),
            "Running stage command"
        );

        let output = self
            .command(ctx)
            .output()
            .with_context(|| format!("Failed to start {}", self.program.display()))?;

        let stderr = String::from_utf8_lossy(&output.stderr);
        for line in stderr.lines() {
            debug!(unit = %ctx.unit, stage = %self.name, "{}", line);
        }

        if !output.status.success() {
            bail!(
                "Stage {} exited with {}: {}",
                self.name,
                output.status,
                excerpt(&stderr)
            );
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        StageMetadata::from_json_str(&stdout)
            .with_context(|| format!("Stage {} printed invalid metadata", self.name))
    }
}

/// Build the stage list from configuration, in order
pub fn stages_from_config(configs: &[StageConfig]) -> Vec<Box<dyn Stage>> {
    configs
        .iter()
        .map(|config| Box::new(CommandStage::from(config)) as Box<dyn Stage>)
        .collect()
}

/// Program path as seen from the unit directory
///
/// Relative paths with a directory part are taken from the current
/// directory; bare names are left for the `PATH` lookup.
fn resolve_program(program: &Path) -> PathBuf {
    if program.is_absolute() || program.components().count() < 2 {
        return program.to_path_buf();
    }
    std::path::absolute(program).unwrap_or_else(|_| program.to_path_buf())
}

/// Substitute unit placeholders in `template`
pub fn expand(template: &str, ctx: &UnitContext) -> String {
    template
        .replace("{visit}", &ctx.unit.visit.to_string())
        .replace("{detector}", &ctx.unit.detector.to_string())
        .replace("{data_id}", &ctx.unit.data_id())
        .replace("{unit_dir}", &ctx.unit_dir.to_string_lossy())
        .replace("{output_dir}", &ctx.output_dir.to_string_lossy())
        .replace("{dataset}", ctx.dataset.as_deref().unwrap_or(""))
}

/// Last part of a stage's stderr
fn excerpt(stderr: &str) -> String {
    let trimmed = stderr.trim();
    let count = trimmed.chars().count();
    if count <= STDERR_EXCERPT_CHARS {
        return trimmed.to_string();
    }
    let tail: String = trimmed.chars().skip(count - STDERR_EXCERPT_CHARS).collect();
    format!("...{}", tail)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::unit::{UnitId, Workspace};
    use tempfile::TempDir;

    fn context(dir: &Path) -> UnitContext {
        UnitContext {
            unit: UnitId::new(410915, 5),
            unit_dir: dir.join("units").join("v410915_d05"),
            output_dir: dir.to_path_buf(),
            dataset: Some("HiTS2015".to_string()),
        }
    }

    #[test]
    fn test_expand_placeholders() {
        let ctx = context(Path::new("/out"));
        assert_eq!(expand("--id {data_id}", &ctx), "--id visit=410915 detector=5");
        assert_eq!(expand("{visit}/{detector}", &ctx), "410915/5");
        assert_eq!(expand("{unit_dir}", &ctx), "/out/units/v410915_d05");
        assert_eq!(expand("{output_dir}/{dataset}", &ctx), "/out/HiTS2015");
        assert_eq!(expand("{unknown}", &ctx), "{unknown}");
    }

    #[test]
    fn test_resolve_program() {
        let cwd = std::env::current_dir().unwrap();
        assert_eq!(resolve_program(Path::new("bin/isr")), cwd.join("bin/isr"));
        assert_eq!(resolve_program(Path::new("./isr.sh")), cwd.join("./isr.sh"));
        assert_eq!(resolve_program(Path::new("sh")), PathBuf::from("sh"));
        assert_eq!(resolve_program(Path::new("/bin/sh")), PathBuf::from("/bin/sh"));
    }

    /// A relative output directory still yields placeholders valid inside the unit directory
    #[cfg(unix)]
    #[test]
    fn test_relative_output_dir_paths_resolve_in_stage() {
        let workspace = Workspace::new("target-apv-stage-test");
        let unit = UnitId::new(1, 1);
        let ctx = UnitContext {
            unit,
            unit_dir: workspace.ensure_unit_dir(unit).unwrap(),
            output_dir: workspace.root().to_path_buf(),
            dataset: None,
        };

        let stage = CommandStage::new("isr", "/bin/sh")
            .arg("-c")
            .arg("test -d '{unit_dir}' && test -d '{output_dir}'");
        let result = stage.run(&ctx, &mut MeasurementSet::new());
        std::fs::remove_dir_all(workspace.root()).unwrap();

        assert!(result.is_ok(), "stage failed: {:?}", result.err());
    }

    #[test]
    fn test_excerpt_keeps_tail() {
        let long = "x".repeat(STDERR_EXCERPT_CHARS + 10) + "END";
        let cut = excerpt(&long);
        assert!(cut.starts_with("..."));
        assert!(cut.ends_with("END"));
        assert_eq!(excerpt("  short\n"), "short");
    }

    #[test]
    fn test_from_config() {
        let config = StageConfig {
            name: "isr".to_string(),
            program: PathBuf::from("/opt/pipe/bin/isr"),
            args: vec!["{data_id}".to_string()],
            env: BTreeMap::from([("OUT".to_string(), "{unit_dir}".to_string())]),
        };
        let stages = stages_from_config(std::slice::from_ref(&config));
        assert_eq!(stages.len(), 1);
        assert_eq!(stages[0].name(), "isr");
    }

    #[cfg(unix)]
    #[test]
    fn test_command_stdout_is_metadata() {
        let temp_dir = TempDir::new().unwrap();
        let ctx = context(temp_dir.path());
        std::fs::create_dir_all(&ctx.unit_dir).unwrap();

        let stage = CommandStage::new("echo", "/bin/sh")
            .arg("-c")
            .arg(r#"printf '{"isr": {"visit": %s, "cwd": "%s"}}' {visit} "$(pwd -P)""#);
        let metadata = stage.run(&ctx, &mut MeasurementSet::new()).unwrap();

        assert_eq!(metadata.get_as_i64("isr.visit").unwrap(), 410915);
        assert!(metadata
            .get_as_string("isr.cwd")
            .unwrap()
            .ends_with("v410915_d05"));
    }

    #[cfg(unix)]
    #[test]
    fn test_command_env_is_expanded() {
        let temp_dir = TempDir::new().unwrap();
        let ctx = context(temp_dir.path());
        std::fs::create_dir_all(&ctx.unit_dir).unwrap();

        let stage = CommandStage::new("env", "/bin/sh")
            .arg("-c")
            .arg(r#"printf '{"detector": "%s"}' "$APV_DETECTOR""#)
            .env("APV_DETECTOR", "{detector}");
        let metadata = stage.run(&ctx, &mut MeasurementSet::new()).unwrap();
        assert_eq!(metadata.get_as_i64("detector").unwrap(), 5);
    }

    #[cfg(unix)]
    #[test]
    fn test_command_failure_reports_stderr() {
        let temp_dir = TempDir::new().unwrap();
        let ctx = context(temp_dir.path());
        std::fs::create_dir_all(&ctx.unit_dir).unwrap();

        let stage = CommandStage::new("broken", "/bin/sh")
            .arg("-c")
            .arg("echo 'no template for visit' >&2; exit 3");
        let err = stage.run(&ctx, &mut MeasurementSet::new()).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("broken"));
        assert!(message.contains("no template for visit"));
    }

    #[cfg(unix)]
    #[test]
    fn test_command_empty_stdout_is_empty_metadata() {
        let temp_dir = TempDir::new().unwrap();
        let ctx = context(temp_dir.path());
        std::fs::create_dir_all(&ctx.unit_dir).unwrap();

        let stage = CommandStage::new("quiet", "/bin/sh").arg("-c").arg("true");
        assert!(stage.run(&ctx, &mut MeasurementSet::new()).unwrap().is_empty());
    }

    #[test]
    fn test_missing_program_fails_stage() {
        let temp_dir = TempDir::new().unwrap();
        let ctx = context(temp_dir.path());
        std::fs::create_dir_all(&ctx.unit_dir).unwrap();

        let stage = CommandStage::new("ghost", "/nonexistent/bin/stage");
        assert!(stage.run(&ctx, &mut MeasurementSet::new()).is_err());
    }
}
