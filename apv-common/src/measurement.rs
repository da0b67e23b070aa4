//! Measurements and measurement sets (jobs)
//!
//! A [`Measurement`] is one scalar observation of a named metric. A
//! [`MeasurementSet`] holds at most one measurement per metric name plus a
//! flat metadata map describing the run that produced it.
//!
//! # Lifecycle
//!
//! One set is created per unit of work, grows as each pipeline stage
//! completes, and is written to disk exactly once when the unit finishes.
//! Aggregation always builds a fresh set; unit-level sets are never mutated
//! after they are persisted.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::ops::AddAssign;
use std::str::FromStr;

use crate::{Error, Result};

// ============================================================================
// Units and quantities
// ============================================================================

/// Physical unit attached to a measurement value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Unit {
    /// Wall-clock or CPU time
    #[serde(rename = "s")]
    Second,
    /// Object counts
    #[serde(rename = "count")]
    Count,
    /// Ratios and fractions
    #[serde(rename = "")]
    Dimensionless,
    /// Memory usage
    #[serde(rename = "byte")]
    Byte,
}

impl Unit {
    /// Short symbol used in job files and reports
    pub fn symbol(&self) -> &'static str {
        match self {
            Unit::Second => "s",
            Unit::Count => "count",
            Unit::Dimensionless => "",
            Unit::Byte => "byte",
        }
    }
}

impl fmt::Display for Unit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Unit::Dimensionless => f.write_str("dimensionless"),
            other => f.write_str(other.symbol()),
        }
    }
}

impl FromStr for Unit {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "s" | "second" | "seconds" => Ok(Unit::Second),
            "count" | "ct" => Ok(Unit::Count),
            "" | "dimensionless" => Ok(Unit::Dimensionless),
            "byte" | "bytes" | "B" => Ok(Unit::Byte),
            other => Err(Error::InvalidInput(format!("Unknown unit: {:?}", other))),
        }
    }
}

/// A numeric value with its unit
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Quantity {
    pub value: f64,
    pub unit: Unit,
}

impl Quantity {
    pub fn new(value: f64, unit: Unit) -> Self {
        Self { value, unit }
    }

    pub fn seconds(value: f64) -> Self {
        Self::new(value, Unit::Second)
    }

    pub fn count(value: f64) -> Self {
        Self::new(value, Unit::Count)
    }

    pub fn dimensionless(value: f64) -> Self {
        Self::new(value, Unit::Dimensionless)
    }

    pub fn bytes(value: f64) -> Self {
        Self::new(value, Unit::Byte)
    }
}

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.unit {
            Unit::Dimensionless => write!(f, "{}", self.value),
            unit => write!(f, "{} {}", self.value, unit.symbol()),
        }
    }
}

// ============================================================================
// Metric identity
// ============================================================================

/// Fully qualified metric name, `package.metricName`
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MetricName(String);

impl MetricName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Package part (everything before the first dot), if any
    pub fn package(&self) -> Option<&str> {
        self.0.split_once('.').map(|(package, _)| package)
    }

    /// Metric part (everything after the first dot, or the whole name)
    pub fn metric(&self) -> &str {
        self.0.split_once('.').map_or(self.0.as_str(), |(_, metric)| metric)
    }
}

impl fmt::Display for MetricName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MetricName {
    fn from(name: &str) -> Self {
        Self(name.to_string())
    }
}

impl From<String> for MetricName {
    fn from(name: String) -> Self {
        Self(name)
    }
}

/// Registered metric descriptor with its declared unit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metric {
    pub name: MetricName,
    pub unit: Unit,
    #[serde(default)]
    pub description: String,
}

impl Metric {
    pub fn new(name: impl Into<MetricName>, unit: Unit, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            unit,
            description: description.into(),
        }
    }
}

/// Identity of a measured metric
///
/// Measurements made for a registered metric carry its descriptor and are
/// checked against the declared unit. Unknown metrics are kept by name only.
#[derive(Debug, Clone, PartialEq)]
pub enum MetricRef {
    Resolved(Metric),
    Unresolved(MetricName),
}

impl MetricRef {
    pub fn name(&self) -> &MetricName {
        match self {
            MetricRef::Resolved(metric) => &metric.name,
            MetricRef::Unresolved(name) => name,
        }
    }

    pub fn declared_unit(&self) -> Option<Unit> {
        match self {
            MetricRef::Resolved(metric) => Some(metric.unit),
            MetricRef::Unresolved(_) => None,
        }
    }
}

impl From<Metric> for MetricRef {
    fn from(metric: Metric) -> Self {
        MetricRef::Resolved(metric)
    }
}

impl From<MetricName> for MetricRef {
    fn from(name: MetricName) -> Self {
        MetricRef::Unresolved(name)
    }
}

impl From<&str> for MetricRef {
    fn from(name: &str) -> Self {
        MetricRef::Unresolved(MetricName::from(name))
    }
}

// ============================================================================
// Measurement
// ============================================================================

/// Auxiliary diagnostic values attached to a measurement
pub type Extras = BTreeMap<String, serde_json::Value>;

/// Free-text annotations attached to a measurement
pub type Notes = BTreeMap<String, String>;

/// One observed value of a metric
#[derive(Debug, Clone, PartialEq)]
pub struct Measurement {
    metric: MetricRef,
    quantity: Quantity,
    extras: Extras,
    notes: Notes,
}

impl Measurement {
    /// Create a measurement
    ///
    /// # Errors
    /// [`Error::UnitMismatch`] if `metric` declares a unit other than
    /// `quantity.unit`.
    pub fn new(metric: impl Into<MetricRef>, quantity: Quantity) -> Result<Self> {
        let metric = metric.into();
        if let Some(expected) = metric.declared_unit() {
            if expected != quantity.unit {
                return Err(Error::UnitMismatch {
                    metric: metric.name().to_string(),
                    expected,
                    found: quantity.unit,
                });
            }
        }
        Ok(Self {
            metric,
            quantity,
            extras: Extras::new(),
            notes: Notes::new(),
        })
    }

    pub fn with_extras(mut self, extras: Extras) -> Self {
        self.extras = extras;
        self
    }

    pub fn with_notes(mut self, notes: Notes) -> Self {
        self.notes = notes;
        self
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.extras.insert(key.into(), value.into());
        self
    }

    pub fn with_note(mut self, key: impl Into<String>, note: impl Into<String>) -> Self {
        self.notes.insert(key.into(), note.into());
        self
    }

    pub fn name(&self) -> &MetricName {
        self.metric.name()
    }

    pub fn metric(&self) -> &MetricRef {
        &self.metric
    }

    /// Registered descriptor, if this measurement's metric was resolved
    pub fn resolved_metric(&self) -> Option<&Metric> {
        match &self.metric {
            MetricRef::Resolved(metric) => Some(metric),
            MetricRef::Unresolved(_) => None,
        }
    }

    pub fn quantity(&self) -> Quantity {
        self.quantity
    }

    pub fn value(&self) -> f64 {
        self.quantity.value
    }

    pub fn unit(&self) -> Unit {
        self.quantity.unit
    }

    pub fn extras(&self) -> &Extras {
        &self.extras
    }

    pub fn notes(&self) -> &Notes {
        &self.notes
    }
}

impl fmt::Display for Measurement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name(), self.quantity)
    }
}

// ============================================================================
// Measurement set
// ============================================================================

/// Measurements keyed by metric name, plus run metadata
///
/// Measurements keep insertion order; re-inserting a metric replaces the
/// earlier entry in place.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MeasurementSet {
    measurements: Vec<Measurement>,
    meta: BTreeMap<String, serde_json::Value>,
}

/// A job is the persisted form of one run's measurement set
pub type Job = MeasurementSet;

impl MeasurementSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a measurement, replacing any entry for the same metric
    pub fn insert(&mut self, measurement: Measurement) {
        match self
            .measurements
            .iter_mut()
            .find(|existing| existing.name() == measurement.name())
        {
            Some(existing) => *existing = measurement,
            None => self.measurements.push(measurement),
        }
    }

    /// Insert `measurement` if there is one
    pub fn insert_if_defined(&mut self, measurement: Option<Measurement>) {
        if let Some(measurement) = measurement {
            self.insert(measurement);
        }
    }

    pub fn get(&self, name: &str) -> Option<&Measurement> {
        self.measurements.iter().find(|m| m.name().as_str() == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn len(&self) -> usize {
        self.measurements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.measurements.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Measurement> {
        self.measurements.iter()
    }

    pub fn names(&self) -> impl Iterator<Item = &MetricName> {
        self.measurements.iter().map(|m| m.name())
    }

    pub fn meta(&self) -> &BTreeMap<String, serde_json::Value> {
        &self.meta
    }

    pub fn set_meta(&mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) {
        self.meta.insert(key.into(), value.into());
    }

    /// Merge every measurement and metadata entry of `other` into `self`
    ///
    /// Conflicts resolve in favour of `other` (last writer wins).
    pub fn merge(&mut self, other: &MeasurementSet) {
        for measurement in other.iter() {
            self.insert(measurement.clone());
        }
        self.merge_meta(other);
    }

    /// Merge only the metadata of `other`, last writer wins
    pub fn merge_meta(&mut self, other: &MeasurementSet) {
        for (key, value) in &other.meta {
            self.meta.insert(key.clone(), value.clone());
        }
    }
}

impl AddAssign<&MeasurementSet> for MeasurementSet {
    fn add_assign(&mut self, other: &MeasurementSet) {
        self.merge(other);
    }
}

impl AddAssign<MeasurementSet> for MeasurementSet {
    fn add_assign(&mut self, other: MeasurementSet) {
        self.merge(&other);
    }
}

impl<'a> IntoIterator for &'a MeasurementSet {
    type Item = &'a Measurement;
    type IntoIter = std::slice::Iter<'a, Measurement>;

    fn into_iter(self) -> Self::IntoIter {
        self.measurements.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn timing_metric() -> Metric {
        Metric::new("ip_isr.IsrTime", Unit::Second, "ISR wall time")
    }

    #[test]
    fn test_measurement_accepts_declared_unit() {
        let m = Measurement::new(timing_metric(), Quantity::seconds(1.5)).unwrap();
        assert_eq!(m.name().as_str(), "ip_isr.IsrTime");
        assert_eq!(m.unit(), Unit::Second);
        assert!(m.resolved_metric().is_some());
    }

    #[test]
    fn test_measurement_rejects_wrong_unit() {
        let err = Measurement::new(timing_metric(), Quantity::count(3.0)).unwrap_err();
        match err {
            Error::UnitMismatch { metric, expected, found } => {
                assert_eq!(metric, "ip_isr.IsrTime");
                assert_eq!(expected, Unit::Second);
                assert_eq!(found, Unit::Count);
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_unresolved_metric_accepts_any_unit() {
        let m = Measurement::new("foo.Bar", Quantity::bytes(1024.0)).unwrap();
        assert!(m.resolved_metric().is_none());
        assert_eq!(m.unit(), Unit::Byte);
    }

    #[test]
    fn test_metric_name_parts() {
        let name = MetricName::from("association.numNewDiaObjects");
        assert_eq!(name.package(), Some("association"));
        assert_eq!(name.metric(), "numNewDiaObjects");

        let bare = MetricName::from("Time");
        assert_eq!(bare.package(), None);
        assert_eq!(bare.metric(), "Time");
    }

    #[test]
    fn test_insert_overwrites_in_place() {
        let mut set = MeasurementSet::new();
        set.insert(Measurement::new("a.First", Quantity::count(1.0)).unwrap());
        set.insert(Measurement::new("a.Second", Quantity::count(2.0)).unwrap());
        set.insert(Measurement::new("a.First", Quantity::count(10.0)).unwrap());

        assert_eq!(set.len(), 2);
        let names: Vec<_> = set.names().map(|n| n.as_str()).collect();
        assert_eq!(names, vec!["a.First", "a.Second"]);
        assert_eq!(set.get("a.First").unwrap().value(), 10.0);
    }

    #[test]
    fn test_merge_is_last_writer_wins() {
        let mut first = MeasurementSet::new();
        first.insert(Measurement::new("a.X", Quantity::count(1.0)).unwrap());
        first.set_meta("k", 1);
        first.set_meta("only_first", "yes");

        let mut second = MeasurementSet::new();
        second.insert(Measurement::new("a.X", Quantity::count(2.0)).unwrap());
        second.insert(Measurement::new("a.Y", Quantity::count(5.0)).unwrap());
        second.set_meta("k", 2);

        first += &second;

        assert_eq!(first.get("a.X").unwrap().value(), 2.0);
        assert_eq!(first.get("a.Y").unwrap().value(), 5.0);
        assert_eq!(first.meta()["k"], json!(2));
        assert_eq!(first.meta()["only_first"], json!("yes"));
        // Source is untouched
        assert_eq!(second.len(), 2);
    }

    #[test]
    fn test_unit_parsing() {
        assert_eq!("seconds".parse::<Unit>().unwrap(), Unit::Second);
        assert_eq!("ct".parse::<Unit>().unwrap(), Unit::Count);
        assert_eq!("".parse::<Unit>().unwrap(), Unit::Dimensionless);
        assert_eq!("bytes".parse::<Unit>().unwrap(), Unit::Byte);
        assert!("parsec".parse::<Unit>().is_err());
    }
}
