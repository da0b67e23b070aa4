//! Plain-text summaries of a run

use std::fmt::Write;

use apv_common::human_time::format_seconds;
use apv_common::{Measurement, MeasurementSet, Unit};

use crate::driver::UnitOutcome;

/// Table of an aggregate job: metric, value, unit
pub fn render_job(job: &MeasurementSet) -> String {
    let width = job
        .names()
        .map(|name| name.as_str().len())
        .max()
        .unwrap_or(0)
        .max("metric".len());

    let mut out = String::new();
    let _ = writeln!(out, "{:<width$}  {:>14}  unit", "metric", "value", width = width);
    let _ = writeln!(out, "{}", "-".repeat(width + 22));
    for measurement in job {
        let _ = writeln!(
            out,
            "{:<width$}  {:>14}  {}",
            measurement.name().as_str(),
            format_value(measurement),
            measurement.unit(),
            width = width
        );
    }
    if job.is_empty() {
        let _ = writeln!(out, "(no measurements)");
    }
    out
}

/// One line per failed unit plus a total
pub fn render_outcomes(outcomes: &[UnitOutcome]) -> String {
    let failed: Vec<&UnitOutcome> = outcomes.iter().filter(|o| !o.success).collect();

    let mut out = String::new();
    let _ = writeln!(
        out,
        "units: {} total, {} succeeded, {} failed",
        outcomes.len(),
        outcomes.len() - failed.len(),
        failed.len()
    );
    for outcome in failed {
        let _ = writeln!(
            out,
            "  FAILED {} ({} attempt{})",
            outcome.unit,
            outcome.attempts,
            if outcome.attempts == 1 { "" } else { "s" }
        );
    }
    out
}

fn format_value(measurement: &Measurement) -> String {
    let value = measurement.value();
    match measurement.unit() {
        Unit::Second => format_seconds(value),
        Unit::Count if value.fract() == 0.0 => format!("{}", value as i64),
        Unit::Count => format!("{:.1}", value),
        Unit::Dimensionless => format!("{:.4}", value),
        Unit::Byte => format!("{:.0}", value),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::unit::UnitId;
    use apv_common::{MetricRegistry, Quantity};

    #[test]
    fn test_render_job() {
        let registry = MetricRegistry::with_defaults();
        let mut job = MeasurementSet::new();
        job.insert(registry.measure("ap_pipe.ApPipeTime", Quantity::seconds(330.5)).unwrap());
        job.insert(registry.measure("association.numNewDiaObjects", Quantity::count(42.0)).unwrap());
        job.insert(
            registry
                .measure("association.fracUpdatedDiaObjects", Quantity::dimensionless(1.0 / 3.0))
                .unwrap(),
        );

        let text = render_job(&job);
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 5);
        assert!(lines[0].starts_with("metric"));
        assert!(lines[2].contains("ap_pipe.ApPipeTime") && lines[2].contains("5:30.5s"));
        assert!(lines[3].contains(" 42 ") && lines[3].ends_with("count"));
        assert!(lines[4].contains("0.3333") && lines[4].ends_with("dimensionless"));
    }

    #[test]
    fn test_render_empty_job() {
        assert!(render_job(&MeasurementSet::new()).contains("(no measurements)"));
    }

    #[test]
    fn test_render_outcomes() {
        let outcomes = vec![
            UnitOutcome {
                unit: UnitId::new(410915, 5),
                attempts: 1,
                success: true,
            },
            UnitOutcome {
                unit: UnitId::new(410915, 10),
                attempts: 3,
                success: false,
            },
        ];
        let text = render_outcomes(&outcomes);
        assert!(text.starts_with("units: 2 total, 1 succeeded, 1 failed"));
        assert!(text.contains("FAILED v410915_d10 (3 attempts)"));
    }
}
