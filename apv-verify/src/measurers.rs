//! Measurements derived from stage metadata
//!
//! Stages report raw numbers (CPU clock readings, object counts) in their
//! metadata. After a unit's stages have run, the [`Measurers`] turn those
//! numbers into measurements of registered metrics.

use std::collections::BTreeMap;

use apv_common::{Measurement, MeasurementSet, MetricRegistry, Quantity, Result, StageMetadata};
use tracing::debug;

/// Note attached to every timing measurement
pub const TIMING_ESTIMATOR: &str = "pipe.base.timeMethod";

const END_CPU_TIME: &str = "EndCpuTime";
const START_CPU_TIME: &str = "StartCpuTime";
const END_MAX_RSS: &str = "EndMaxResidentSetSize";

/// Derives measurements from a unit's combined metadata
#[derive(Debug, Clone)]
pub struct Measurers {
    registry: MetricRegistry,
    /// Method target (`task.method`) → timing metric
    timing: BTreeMap<String, String>,
    /// Method target (`task.method`) → memory metric
    memory: BTreeMap<String, String>,
}

impl Measurers {
    pub fn new(
        registry: MetricRegistry,
        timing: BTreeMap<String, String>,
        memory: BTreeMap<String, String>,
    ) -> Self {
        Self {
            registry,
            timing,
            memory,
        }
    }

    pub fn registry(&self) -> &MetricRegistry {
        &self.registry
    }

    /// Add every derivable measurement to `job`
    ///
    /// Missing metadata only means fewer measurements. All measurements that
    /// can be built are inserted even when another one fails; the first
    /// failure is returned.
    pub fn collect(&self, metadata: &StageMetadata, job: &mut MeasurementSet) -> Result<()> {
        let mut first_error = None;
        let mut record = |result: Result<Option<Measurement>>| match result {
            Ok(measurement) => job.insert_if_defined(measurement),
            Err(e) => {
                first_error.get_or_insert(e);
            }
        };

        for (target, metric) in &self.timing {
            record(measure_runtime(&self.registry, metadata, target, metric));
        }
        for (target, metric) in &self.memory {
            record(measure_memory(&self.registry, metadata, target, metric));
        }
        for result in measure_association(&self.registry, metadata) {
            record(result);
        }
        for result in measure_differencing(&self.registry, metadata) {
            record(result);
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Wall time of one method run, from its start/end CPU clock readings
///
/// `target` is `task.method`, e.g. `apPipe:ccdProcessor:isr.runDataRef`.
/// The first metadata key ending in `{target}EndCpuTime` whose
/// `StartCpuTime` counterpart exists is used. Returns `None` when the method
/// did not run.
pub fn measure_runtime(
    registry: &MetricRegistry,
    metadata: &StageMetadata,
    target: &str,
    metric: &str,
) -> Result<Option<Measurement>> {
    let end_suffix = format!("{}{}", target, END_CPU_TIME);
    let timed = metadata.names().into_iter().find_map(|end_key| {
        let stem = end_key.strip_suffix(&end_suffix)?;
        let start_key = format!("{}{}{}", stem, target, START_CPU_TIME);
        metadata.contains(&start_key).then_some((start_key, end_key))
    });

    let Some((start_key, end_key)) = timed else {
        debug!(target_method = target, "No timing information");
        return Ok(None);
    };
    let start = metadata.get_as_f64(&start_key)?;
    let end = metadata.get_as_f64(&end_key)?;

    registry
        .measure(metric, Quantity::seconds(end - start))
        .map(|m| Some(m.with_note("estimator", TIMING_ESTIMATOR)))
}

/// Peak resident set size reported at the end of a method run, in bytes
pub fn measure_memory(
    registry: &MetricRegistry,
    metadata: &StageMetadata,
    target: &str,
    metric: &str,
) -> Result<Option<Measurement>> {
    let suffix = format!("{}{}", target, END_MAX_RSS);
    let Some(key) = metadata.names().into_iter().find(|key| key.ends_with(&suffix)) else {
        return Ok(None);
    };
    let bytes = metadata.get_as_f64(&key)?;
    registry
        .measure(metric, Quantity::bytes(bytes))
        .map(|m| Some(m.with_note("estimator", TIMING_ESTIMATOR)))
}

/// Association counts and the fraction of loaded DIAObjects updated
pub fn measure_association(
    registry: &MetricRegistry,
    metadata: &StageMetadata,
) -> Vec<Result<Option<Measurement>>> {
    vec![
        measure_count(registry, metadata, "association.numNewDiaObjects"),
        measure_count(registry, metadata, "association.numUnassociatedDiaObjects"),
        measure_fraction_updated(registry, metadata),
        measure_count(registry, metadata, "association.totalUnassociatedDiaObjects"),
    ]
}

/// Science source count and the difference-to-science source ratio
pub fn measure_differencing(
    registry: &MetricRegistry,
    metadata: &StageMetadata,
) -> Vec<Result<Option<Measurement>>> {
    vec![
        measure_count(registry, metadata, "ip_diffim.numSciSources"),
        measure_fraction_dia_to_sci(registry, metadata),
    ]
}

/// Count stored under the metric's own name
fn measure_count(
    registry: &MetricRegistry,
    metadata: &StageMetadata,
    key: &str,
) -> Result<Option<Measurement>> {
    if !metadata.contains(key) {
        return Ok(None);
    }
    let count = metadata.get_as_i64(key)?;
    registry.measure(key, Quantity::count(count as f64)).map(Some)
}

fn measure_fraction_updated(
    registry: &MetricRegistry,
    metadata: &StageMetadata,
) -> Result<Option<Measurement>> {
    const UPDATED: &str = "association.numUpdatedDiaObjects";
    const UNASSOCIATED: &str = "association.numUnassociatedDiaObjects";

    if !metadata.contains(UPDATED) || !metadata.contains(UNASSOCIATED) {
        return Ok(None);
    }
    let updated = metadata.get_as_f64(UPDATED)?;
    let unassociated = metadata.get_as_f64(UNASSOCIATED)?;
    let fraction = if updated <= 0.0 || unassociated <= 0.0 {
        0.0
    } else {
        updated / (updated + unassociated)
    };

    registry
        .measure("association.fracUpdatedDiaObjects", Quantity::dimensionless(fraction))
        .map(Some)
}

fn measure_fraction_dia_to_sci(
    registry: &MetricRegistry,
    metadata: &StageMetadata,
) -> Result<Option<Measurement>> {
    const SCI: &str = "ip_diffim.numSciSources";
    const DIA: &str = "ip_diffim.numDiaSources";

    if !metadata.contains(SCI) || !metadata.contains(DIA) {
        return Ok(None);
    }
    let sci = metadata.get_as_f64(SCI)?;
    let dia = metadata.get_as_f64(DIA)?;
    if sci == 0.0 {
        debug!("No science sources, source ratio undefined");
        return Ok(None);
    }

    registry
        .measure(
            "ip_diffim.fracDiaSourcesToSciSources",
            Quantity::dimensionless(dia / sci),
        )
        .map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;
    use apv_common::config::MeasurementsConfig;
    use apv_common::{Error, Metric, Unit};
    use serde_json::json;

    fn measurers() -> Measurers {
        let defaults = MeasurementsConfig::default();
        Measurers::new(MetricRegistry::with_defaults(), defaults.timing, defaults.memory)
    }

    fn metadata(value: serde_json::Value) -> StageMetadata {
        StageMetadata::from_value(value).unwrap()
    }

    #[test]
    fn test_runtime_from_cpu_clock() {
        let md = metadata(json!({
            "apPipe:ccdProcessor:isr": {
                "runDataRefStartCpuTime": 10.25,
                "runDataRefEndCpuTime": 12.75
            }
        }));
        let m = measure_runtime(
            &MetricRegistry::with_defaults(),
            &md,
            "apPipe:ccdProcessor:isr.runDataRef",
            "ip_isr.IsrTime",
        )
        .unwrap()
        .unwrap();

        assert_eq!(m.value(), 2.5);
        assert_eq!(m.unit(), Unit::Second);
        assert_eq!(m.notes()["estimator"], TIMING_ESTIMATOR);
    }

    #[test]
    fn test_runtime_matches_nested_task_prefix() {
        // The target may omit parent tasks
        let md = metadata(json!({
            "apPipe:differencer:register": {
                "runStartCpuTime": 1.0,
                "runEndCpuTime": 4.0
            }
        }));
        let m = measure_runtime(
            &MetricRegistry::with_defaults(),
            &md,
            "register.run",
            "pipe_tasks.RegisterImageTime",
        )
        .unwrap()
        .unwrap();
        assert_eq!(m.value(), 3.0);
    }

    #[test]
    fn test_runtime_missing_start_is_skipped() {
        let md = metadata(json!({"isr": {"runDataRefEndCpuTime": 12.0}}));
        let m = measure_runtime(&MetricRegistry::with_defaults(), &md, "isr.runDataRef", "ip_isr.IsrTime")
            .unwrap();
        assert!(m.is_none());
    }

    #[test]
    fn test_runtime_wrong_unit_metric_is_error() {
        let md = metadata(json!({"isr": {"runStartCpuTime": 1.0, "runEndCpuTime": 2.0}}));
        let result = measure_runtime(
            &MetricRegistry::with_defaults(),
            &md,
            "isr.run",
            "ip_diffim.numSciSources",
        );
        assert!(matches!(result, Err(Error::UnitMismatch { .. })));
    }

    #[test]
    fn test_memory() {
        let md = metadata(json!({"apPipe": {"runDataRefEndMaxResidentSetSize": 2147483648u64}}));
        let m = measure_memory(
            &MetricRegistry::with_defaults(),
            &md,
            "apPipe.runDataRef",
            "ap_pipe.ApPipeMemory",
        )
        .unwrap()
        .unwrap();
        assert_eq!(m.unit(), Unit::Byte);
        assert_eq!(m.value(), 2147483648.0);
    }

    #[test]
    fn test_fraction_updated() {
        let registry = MetricRegistry::with_defaults();
        let md = metadata(json!({
            "association": {"numUpdatedDiaObjects": 3, "numUnassociatedDiaObjects": 9}
        }));
        let m = measure_fraction_updated(&registry, &md).unwrap().unwrap();
        assert_eq!(m.value(), 0.25);

        let md = metadata(json!({
            "association": {"numUpdatedDiaObjects": 0, "numUnassociatedDiaObjects": 9}
        }));
        assert_eq!(measure_fraction_updated(&registry, &md).unwrap().unwrap().value(), 0.0);

        let md = metadata(json!({"association": {"numUpdatedDiaObjects": 4}}));
        assert!(measure_fraction_updated(&registry, &md).unwrap().is_none());
    }

    #[test]
    fn test_dia_to_sci_ratio() {
        let registry = MetricRegistry::with_defaults();
        let md = metadata(json!({"ip_diffim": {"numSciSources": 200, "numDiaSources": 50}}));
        let m = measure_fraction_dia_to_sci(&registry, &md).unwrap().unwrap();
        assert_eq!(m.value(), 0.25);

        let md = metadata(json!({"ip_diffim": {"numSciSources": 0, "numDiaSources": 5}}));
        assert!(measure_fraction_dia_to_sci(&registry, &md).unwrap().is_none());
    }

    #[test]
    fn test_collect_fills_job() {
        let md = metadata(json!({
            "apPipe": {"runDataRefStartCpuTime": 0.0, "runDataRefEndCpuTime": 30.0,
                       "runDataRefEndMaxResidentSetSize": 1024},
            "apPipe:ccdProcessor:isr": {"runDataRefStartCpuTime": 1.0, "runDataRefEndCpuTime": 3.0},
            "association": {
                "numNewDiaObjects": 7,
                "numUpdatedDiaObjects": 1,
                "numUnassociatedDiaObjects": 3,
                "totalUnassociatedDiaObjects": 12
            },
            "ip_diffim": {"numSciSources": 40, "numDiaSources": 10}
        }));
        let mut job = MeasurementSet::new();
        measurers().collect(&md, &mut job).unwrap();

        assert_eq!(job.get("ap_pipe.ApPipeTime").unwrap().value(), 30.0);
        assert_eq!(job.get("ip_isr.IsrTime").unwrap().value(), 2.0);
        assert_eq!(job.get("ap_pipe.ApPipeMemory").unwrap().value(), 1024.0);
        assert_eq!(job.get("association.numNewDiaObjects").unwrap().value(), 7.0);
        assert_eq!(job.get("association.fracUpdatedDiaObjects").unwrap().value(), 0.25);
        assert_eq!(job.get("association.totalUnassociatedDiaObjects").unwrap().value(), 12.0);
        assert_eq!(job.get("ip_diffim.fracDiaSourcesToSciSources").unwrap().value(), 0.25);
        assert!(!job.contains("pipe_tasks.CalibrateTime"));
    }

    #[test]
    fn test_collect_keeps_measurements_around_a_failure() {
        let mut registry = MetricRegistry::with_defaults();
        // Declared with a unit the count measurer cannot produce
        registry.register(Metric::new("association.numNewDiaObjects", Unit::Second, ""));
        let measurers = Measurers::new(registry, BTreeMap::new(), BTreeMap::new());

        let md = metadata(json!({
            "association": {"numNewDiaObjects": 7, "numUnassociatedDiaObjects": 3}
        }));
        let mut job = MeasurementSet::new();
        let result = measurers.collect(&md, &mut job);

        assert!(matches!(result, Err(Error::UnitMismatch { .. })));
        assert_eq!(job.get("association.numUnassociatedDiaObjects").unwrap().value(), 3.0);
    }

    #[test]
    fn test_collect_on_empty_metadata() {
        let mut job = MeasurementSet::new();
        measurers().collect(&StageMetadata::new(), &mut job).unwrap();
        assert!(job.is_empty());
    }
}
