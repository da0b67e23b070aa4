//! Job file codec
//!
//! Jobs are persisted as JSON objects:
//!
//! ```json
//! {
//!   "measurements": [
//!     {"metric": "ip_isr.IsrTime", "value": 1.25, "unit": "s",
//!      "extras": {}, "notes": {"estimator": "pipe.base.timeMethod"}}
//!   ],
//!   "metrics": [
//!     {"name": "ip_isr.IsrTime", "unit": "s", "description": "..."}
//!   ],
//!   "meta": {"visit": 410915, "detector": 5}
//! }
//! ```
//!
//! `metrics` holds the descriptors of every resolved measurement so the
//! typed measurement can be rebuilt on load without a registry. Values are
//! written with shortest round-trip formatting, so reading a file back gives
//! bit-identical floats.
//!
//! Writes go to `<file>.tmp` first and are renamed into place, so a reader
//! never observes a half-written job.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::measurement::{
    Extras, Measurement, MeasurementSet, Metric, MetricName, MetricRef, Notes, Quantity, Unit,
};
use crate::Result;

#[derive(Debug, Serialize, Deserialize)]
struct JobFile {
    measurements: Vec<MeasurementRecord>,
    #[serde(default)]
    metrics: Vec<Metric>,
    #[serde(default)]
    meta: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Serialize, Deserialize)]
struct MeasurementRecord {
    metric: MetricName,
    value: f64,
    unit: Unit,
    #[serde(default)]
    extras: Extras,
    #[serde(default)]
    notes: Notes,
}

impl From<&MeasurementSet> for JobFile {
    fn from(job: &MeasurementSet) -> Self {
        let mut metrics: Vec<Metric> = Vec::new();
        let measurements = job
            .iter()
            .map(|m| {
                if let Some(metric) = m.resolved_metric() {
                    if !metrics.iter().any(|known| known.name == metric.name) {
                        metrics.push(metric.clone());
                    }
                }
                MeasurementRecord {
                    metric: m.name().clone(),
                    value: m.value(),
                    unit: m.unit(),
                    extras: m.extras().clone(),
                    notes: m.notes().clone(),
                }
            })
            .collect();

        JobFile {
            measurements,
            metrics,
            meta: job.meta().clone(),
        }
    }
}

impl JobFile {
    fn into_job(self) -> Result<MeasurementSet> {
        let mut job = MeasurementSet::new();
        for record in self.measurements {
            let metric = match self.metrics.iter().find(|m| m.name == record.metric) {
                Some(descriptor) => MetricRef::Resolved(descriptor.clone()),
                None => MetricRef::Unresolved(record.metric),
            };
            let measurement = Measurement::new(metric, Quantity::new(record.value, record.unit))?
                .with_extras(record.extras)
                .with_notes(record.notes);
            job.insert(measurement);
        }
        for (key, value) in self.meta {
            job.set_meta(key, value);
        }
        Ok(job)
    }
}

/// Serialize a job to pretty-printed JSON
pub fn to_json(job: &MeasurementSet) -> Result<String> {
    Ok(serde_json::to_string_pretty(&JobFile::from(job))?)
}

/// Deserialize a job from JSON
///
/// # Errors
/// [`crate::Error::Json`] for malformed input, [`crate::Error::UnitMismatch`]
/// when a measurement disagrees with a descriptor stored in the same file.
pub fn from_json(json: &str) -> Result<MeasurementSet> {
    let file: JobFile = serde_json::from_str(json)?;
    file.into_job()
}

/// Read a job file from disk
pub fn read_job(path: &Path) -> Result<MeasurementSet> {
    let content = std::fs::read_to_string(path)?;
    from_json(&content)
}

/// Write a job file atomically (temp file + rename)
pub fn write_job(job: &MeasurementSet, path: &Path) -> Result<()> {
    let json = to_json(job)?;

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let temp_path = temp_path_for(path);
    std::fs::write(&temp_path, json)?;
    std::fs::rename(&temp_path, path)?;

    debug!(
        path = %path.display(),
        measurements = job.len(),
        "Job file written"
    );
    Ok(())
}

fn temp_path_for(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::MetricRegistry;
    use crate::Error;
    use serde_json::json;
    use tempfile::TempDir;

    fn sample_job() -> MeasurementSet {
        let registry = MetricRegistry::with_defaults();
        let mut job = MeasurementSet::new();
        job.insert(
            registry
                .measure("ip_isr.IsrTime", Quantity::seconds(0.1 + 0.2))
                .unwrap()
                .with_note("estimator", "pipe.base.timeMethod"),
        );
        job.insert(
            registry
                .measure("association.fracUpdatedDiaObjects", Quantity::dimensionless(1.0 / 3.0))
                .unwrap()
                .with_extra("nUpdated", 4)
                .with_extra("source", json!({"task": "association"})),
        );
        job.insert(Measurement::new("custom.Unregistered", Quantity::bytes(6.02e23)).unwrap());
        job.set_meta("visit", 410915);
        job.set_meta("detector", 5);
        job.set_meta("dataset", "HiTS2015");
        job
    }

    #[test]
    fn test_round_trip_is_exact() {
        let job = sample_job();
        let json = to_json(&job).unwrap();
        let restored = from_json(&json).unwrap();

        assert_eq!(restored, job);
        // Floats survive bit-for-bit
        assert_eq!(
            restored.get("ip_isr.IsrTime").unwrap().value().to_bits(),
            (0.1f64 + 0.2).to_bits()
        );
        assert!(restored.get("custom.Unregistered").unwrap().resolved_metric().is_none());
        assert!(restored.get("ip_isr.IsrTime").unwrap().resolved_metric().is_some());
    }

    #[test]
    fn test_round_trip_empty_job() {
        let job = MeasurementSet::new();
        let restored = from_json(&to_json(&job).unwrap()).unwrap();
        assert_eq!(restored, job);
    }

    #[test]
    fn test_descriptor_unit_enforced_on_load() {
        let json = r#"{
            "measurements": [{"metric": "ip_isr.IsrTime", "value": 3.0, "unit": "count"}],
            "metrics": [{"name": "ip_isr.IsrTime", "unit": "s"}],
            "meta": {}
        }"#;
        assert!(matches!(from_json(json), Err(Error::UnitMismatch { .. })));
    }

    #[test]
    fn test_optional_sections_default() {
        let json = r#"{"measurements": [{"metric": "a.B", "value": 1.0, "unit": ""}]}"#;
        let job = from_json(json).unwrap();
        assert_eq!(job.get("a.B").unwrap().unit(), Unit::Dimensionless);
        assert!(job.meta().is_empty());
    }

    #[test]
    fn test_malformed_json_is_error() {
        assert!(matches!(from_json("{not json"), Err(Error::Json(_))));
    }

    #[test]
    fn test_write_then_read() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nested").join("apv.verify.json");

        let job = sample_job();
        write_job(&job, &path).unwrap();

        assert!(path.exists());
        assert!(!temp_dir.path().join("nested").join("apv.verify.json.tmp").exists());
        assert_eq!(read_job(&path).unwrap(), job);
    }
}
