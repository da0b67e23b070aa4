//! Merge driver: combines per-unit jobs into one aggregate job
//!
//! Measurements are grouped by metric name across the unit jobs in unit
//! order, classified through a [`CombinePolicy`] and reduced with the
//! matching combinator. Cumulative metrics are copied from the final job
//! instead. Unit metadata is merged in unit order, so the last unit wins.
//!
//! A metric whose fraction is undefined (zero total weight, or a partial
//! denominator of a fraction equal to 1) is logged and left out; every other
//! error aborts the merge.

use apv_common::{Error, Measurement, MeasurementSet, MetricName, Result};
use tracing::{debug, warn};

use crate::combine;
use crate::policy::{CombinatorKind, CombinePolicy};

/// Combine `unit_jobs` (in unit order) into a fresh aggregate job
///
/// `final_job` is the job of the last unit in processing order; it is the
/// only source of [`CombinatorKind::LastValue`] metrics. Inputs are not
/// modified.
///
/// # Errors
/// - [`Error::MismatchedPairing`] if a unit job holds a fraction without its
///   paired metric (or the reverse)
/// - [`Error::UnitMismatch`] if a metric's measurements mix units
pub fn merge(
    unit_jobs: &[MeasurementSet],
    final_job: &MeasurementSet,
    policy: &CombinePolicy,
) -> Result<MeasurementSet> {
    let mut merged = MeasurementSet::new();

    for name in observed_names(unit_jobs) {
        let Some(kind) = policy.classify(name.as_str()) else {
            debug!(metric = %name, "No combine rule, metric not aggregated");
            continue;
        };

        let combined = match &kind {
            CombinatorKind::Sum => combine::sum(&group(unit_jobs, &name)),
            CombinatorKind::WeightedFraction { weights } => {
                let (fractions, weights) = pair_groups(unit_jobs, &name, weights)?;
                combine::weighted_fraction(&fractions, &weights)
            }
            CombinatorKind::PartialFraction { partials } => {
                let (fractions, partials) = pair_groups(unit_jobs, &name, partials)?;
                combine::partial_fraction(&fractions, &partials)
            }
            CombinatorKind::LastValue => Ok(combine::last_value(final_job, name.as_str())),
        };

        match combined {
            Ok(measurement) => merged.insert_if_defined(measurement),
            Err(e) if e.is_undefined_arithmetic() => {
                warn!(metric = %name, error = %e, "Metric undefined for this run, omitted");
            }
            Err(e) => return Err(e),
        }
    }

    // Cumulative metrics the unit jobs never reported still come from the final job
    for name in policy.last_value_metrics() {
        if !merged.contains(name.as_str()) {
            merged.insert_if_defined(combine::last_value(final_job, name.as_str()));
        }
    }

    for job in unit_jobs {
        merged.merge_meta(job);
    }

    debug!(
        units = unit_jobs.len(),
        measurements = merged.len(),
        "Unit jobs merged"
    );
    Ok(merged)
}

/// Metric names in first-observed order across the unit jobs
fn observed_names(unit_jobs: &[MeasurementSet]) -> Vec<MetricName> {
    let mut names: Vec<MetricName> = Vec::new();
    for name in unit_jobs.iter().flat_map(|job| job.names()) {
        if !names.contains(name) {
            names.push(name.clone());
        }
    }
    names
}

fn group<'a>(unit_jobs: &'a [MeasurementSet], name: &MetricName) -> Vec<&'a Measurement> {
    unit_jobs
        .iter()
        .filter_map(|job| job.get(name.as_str()))
        .collect()
}

/// Numerator and denominator groups, paired unit by unit
///
/// The groups must line up one-to-one. The only unit left out is one whose
/// denominator is exactly zero and whose fraction is absent (e.g. no science
/// sources): its weight contributes nothing to either sum.
fn pair_groups<'a>(
    unit_jobs: &'a [MeasurementSet],
    numerator: &MetricName,
    denominator: &MetricName,
) -> Result<(Vec<&'a Measurement>, Vec<&'a Measurement>)> {
    let mut numerators = Vec::new();
    let mut denominators = Vec::new();
    let mut aligned = true;

    for job in unit_jobs {
        match (job.get(numerator.as_str()), job.get(denominator.as_str())) {
            (Some(n), Some(d)) => {
                numerators.push(n);
                denominators.push(d);
            }
            (None, Some(d)) if d.value() == 0.0 => {
                debug!(metric = %numerator, "Zero denominator without fraction, skipped");
            }
            (None, None) => {}
            _ => aligned = false,
        }
    }

    if aligned {
        return Ok((numerators, denominators));
    }
    Err(Error::MismatchedPairing {
        numerator: numerator.to_string(),
        denominator: denominator.to_string(),
        numerators: group(unit_jobs, numerator).len(),
        denominators: group(unit_jobs, denominator).len(),
    })
}
