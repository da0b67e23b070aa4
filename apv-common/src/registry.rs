//! Metric registry
//!
//! Maps metric names to their descriptors so measurements can be validated
//! against a declared unit. The built-in table covers the AP pipeline
//! metrics; configuration may add more.

use std::collections::BTreeMap;

use crate::measurement::{Measurement, Metric, MetricName, MetricRef, Quantity, Unit};
use crate::Result;

/// Built-in AP pipeline metrics: (name, unit, description)
const DEFAULT_METRICS: &[(&str, Unit, &str)] = &[
    ("ap_pipe.ApPipeTime", Unit::Second, "Wall time of the complete AP pipeline"),
    ("pipe_tasks.ProcessCcdTime", Unit::Second, "Wall time of single-frame processing"),
    ("ip_isr.IsrTime", Unit::Second, "Wall time of instrument signature removal"),
    ("pipe_tasks.CharacterizeImageTime", Unit::Second, "Wall time of image characterization"),
    ("pipe_tasks.CalibrateTime", Unit::Second, "Wall time of photometric and astrometric calibration"),
    ("pipe_tasks.ImageDifferenceTime", Unit::Second, "Wall time of image differencing"),
    ("meas_astrom.AstrometryTime", Unit::Second, "Wall time of template astrometry"),
    ("pipe_tasks.RegisterImageTime", Unit::Second, "Wall time of template registration"),
    ("ip_diffim.ImagePsfMatchTime", Unit::Second, "Wall time of PSF matching"),
    ("meas_algorithms.SourceDetectionTime", Unit::Second, "Wall time of difference image source detection"),
    ("ip_diffim.DipoleFitTime", Unit::Second, "Wall time of dipole fitting"),
    ("ap_association.AssociationTime", Unit::Second, "Wall time of source association"),
    ("ap_pipe.ApPipeMemory", Unit::Byte, "Peak memory of the AP pipeline"),
    ("ip_diffim.numSciSources", Unit::Count, "Number of sources detected on the science image"),
    ("ip_diffim.fracDiaSourcesToSciSources", Unit::Dimensionless, "Ratio of difference image sources to science sources"),
    ("association.numNewDiaObjects", Unit::Count, "Number of DIAObjects created by this unit"),
    ("association.numUnassociatedDiaObjects", Unit::Count, "Number of loaded DIAObjects with no new association"),
    ("association.fracUpdatedDiaObjects", Unit::Dimensionless, "Fraction of loaded DIAObjects with a new association"),
    ("association.totalUnassociatedDiaObjects", Unit::Count, "DIAObjects with exactly one DIASource across the whole run"),
];

/// Registry of known metrics
#[derive(Debug, Clone, Default)]
pub struct MetricRegistry {
    metrics: BTreeMap<MetricName, Metric>,
}

impl MetricRegistry {
    /// Empty registry; every measurement stays unresolved
    pub fn empty() -> Self {
        Self::default()
    }

    /// Registry holding the built-in AP pipeline metrics
    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();
        for (name, unit, description) in DEFAULT_METRICS {
            registry.register(Metric::new(*name, *unit, *description));
        }
        registry
    }

    /// Add or replace a metric descriptor
    pub fn register(&mut self, metric: Metric) {
        self.metrics.insert(metric.name.clone(), metric);
    }

    pub fn get(&self, name: &str) -> Option<&Metric> {
        self.metrics.get(&MetricName::from(name))
    }

    pub fn len(&self) -> usize {
        self.metrics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.metrics.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Metric> {
        self.metrics.values()
    }

    /// Identity for `name`: resolved when registered, by name otherwise
    pub fn resolve(&self, name: &str) -> MetricRef {
        match self.get(name) {
            Some(metric) => MetricRef::Resolved(metric.clone()),
            None => MetricRef::Unresolved(MetricName::from(name)),
        }
    }

    /// Build a measurement for `name`, checking the declared unit if any
    pub fn measure(&self, name: &str, quantity: Quantity) -> Result<Measurement> {
        Measurement::new(self.resolve(name), quantity)
    }
}
