//! Combinators: reductions of one metric's measurements across units
//!
//! Every combinator is pure. Inputs are never modified, an empty input
//! yields `Ok(None)`, and a result carries the identity of its inputs so it
//! can be inserted into the aggregate job under the original name.
//!
//! Extras and notes of combined inputs are merged key by key with the first
//! occurrence kept, so the aggregate records the earliest unit's provenance.

use apv_common::measurement::{Extras, Notes};
use apv_common::{Error, Measurement, MeasurementSet, MetricRef, Quantity, Result, Unit};

/// Sum of same-unit measurements
///
/// The result is identified by the first input with a resolved metric, or by
/// the first input's name if none is resolved.
///
/// # Errors
/// [`Error::UnitMismatch`] if the inputs do not share one unit.
pub fn sum(inputs: &[&Measurement]) -> Result<Option<Measurement>> {
    let Some(first) = inputs.first() else {
        return Ok(None);
    };
    let unit = common_unit(inputs, first.unit())?;
    let total: f64 = inputs.iter().map(|m| m.value()).sum();

    build(inputs, Quantity::new(total, unit)).map(Some)
}

/// Weighted average of fractions, `Σ(fᵢ·wᵢ) / Σwᵢ`
///
/// `fractions[i]` is weighted by `weights[i]`. Extras and notes come from the
/// fractions only.
///
/// # Errors
/// - [`Error::MismatchedPairing`] if the two lists differ in length
/// - [`Error::UnitMismatch`] if the fractions (or the weights) mix units
/// - [`Error::DivisionByZero`] if the weights sum to zero
pub fn weighted_fraction(
    fractions: &[&Measurement],
    weights: &[&Measurement],
) -> Result<Option<Measurement>> {
    check_pairing(fractions, weights)?;
    let Some(first) = fractions.first() else {
        return Ok(None);
    };
    let unit = common_unit(fractions, first.unit())?;
    common_unit(weights, weights[0].unit())?;

    let total_weight: f64 = weights.iter().map(|w| w.value()).sum();
    if total_weight == 0.0 {
        return Err(Error::DivisionByZero {
            metric: first.name().to_string(),
        });
    }
    let weighted: f64 = fractions
        .iter()
        .zip(weights)
        .map(|(f, w)| f.value() * w.value())
        .sum();

    build(fractions, Quantity::new(weighted / total_weight, unit)).map(Some)
}

/// Weighted average of fractions whose denominators are only known as
/// "denominator minus numerator"
///
/// Each denominator is rebuilt as `pᵢ / (1 − fᵢ)` and the result is
/// [`weighted_fraction`] of the fractions by the rebuilt denominators.
///
/// # Errors
/// - [`Error::MismatchedPairing`] if the two lists differ in length
/// - [`Error::UndefinedDenominator`] if any fraction is exactly 1
/// - anything [`weighted_fraction`] returns
pub fn partial_fraction(
    fractions: &[&Measurement],
    partials: &[&Measurement],
) -> Result<Option<Measurement>> {
    check_pairing(fractions, partials)?;

    let denominators = fractions
        .iter()
        .zip(partials)
        .enumerate()
        .map(|(index, (fraction, partial))| rebuild_denominator(index, fraction, partial))
        .collect::<Result<Vec<_>>>()?;
    let denominators: Vec<&Measurement> = denominators.iter().collect();

    weighted_fraction(fractions, &denominators)
}

/// The final job's measurement of `name`, for cumulative metrics whose last
/// value already describes the whole run
pub fn last_value(final_job: &MeasurementSet, name: &str) -> Option<Measurement> {
    final_job.get(name).cloned()
}

fn rebuild_denominator(
    index: usize,
    fraction: &Measurement,
    partial: &Measurement,
) -> Result<Measurement> {
    if fraction.value() == 1.0 {
        return Err(Error::UndefinedDenominator {
            metric: fraction.name().to_string(),
            index,
        });
    }
    let value = partial.value() / (1.0 - fraction.value());
    Ok(
        Measurement::new(partial.metric().clone(), Quantity::new(value, partial.unit()))?
            .with_extras(partial.extras().clone())
            .with_notes(partial.notes().clone()),
    )
}

fn check_pairing(numerators: &[&Measurement], denominators: &[&Measurement]) -> Result<()> {
    if numerators.len() == denominators.len() {
        return Ok(());
    }
    let name_of = |group: &[&Measurement]| {
        group
            .first()
            .map(|m| m.name().to_string())
            .unwrap_or_else(|| "<empty>".to_string())
    };
    Err(Error::MismatchedPairing {
        numerator: name_of(numerators),
        denominator: name_of(denominators),
        numerators: numerators.len(),
        denominators: denominators.len(),
    })
}

/// Check every input has `unit`
fn common_unit(inputs: &[&Measurement], unit: Unit) -> Result<Unit> {
    match inputs.iter().find(|m| m.unit() != unit) {
        Some(odd) => Err(Error::UnitMismatch {
            metric: odd.name().to_string(),
            expected: unit,
            found: odd.unit(),
        }),
        None => Ok(unit),
    }
}

/// Result measurement: identity, quantity, first-wins extras and notes
fn build(inputs: &[&Measurement], quantity: Quantity) -> Result<Measurement> {
    let identity: MetricRef = inputs
        .iter()
        .find(|m| m.resolved_metric().is_some())
        .unwrap_or(&inputs[0])
        .metric()
        .clone();

    let mut extras = Extras::new();
    let mut notes = Notes::new();
    for input in inputs {
        for (key, value) in input.extras() {
            extras.entry(key.clone()).or_insert_with(|| value.clone());
        }
        for (key, note) in input.notes() {
            notes.entry(key.clone()).or_insert_with(|| note.clone());
        }
    }

    Ok(Measurement::new(identity, quantity)?
        .with_extras(extras)
        .with_notes(notes))
}
