//! Metric classification for the merge step
//!
//! A [`CombinePolicy`] maps each metric name to the combinator that reduces
//! it across units. Explicit per-metric rules take priority; otherwise a name
//! ending in the duration suffix is summed. Names matching neither are left
//! out of the aggregate.

use apv_common::config::{CombineKindConfig, MergeConfig, MergeRuleConfig};
use apv_common::{Error, MetricName, Result};

/// Default suffix marking duration metrics
pub const DEFAULT_DURATION_SUFFIX: &str = "Time";

/// How a metric's measurements are combined
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CombinatorKind {
    /// Plain sum across units
    Sum,
    /// Fraction averaged with the paired denominator metric as weights
    WeightedFraction { weights: MetricName },
    /// Fraction averaged with denominators rebuilt from a
    /// "denominator minus numerator" metric
    PartialFraction { partials: MetricName },
    /// Cumulative metric copied from the final unit's job
    LastValue,
}

impl CombinatorKind {
    /// Name of the paired metric, for fraction kinds
    pub fn paired_metric(&self) -> Option<&MetricName> {
        match self {
            CombinatorKind::WeightedFraction { weights } => Some(weights),
            CombinatorKind::PartialFraction { partials } => Some(partials),
            CombinatorKind::Sum | CombinatorKind::LastValue => None,
        }
    }
}

/// Explicit rule for one metric
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricRule {
    pub metric: MetricName,
    pub kind: CombinatorKind,
}

/// Classification table used by the merge driver
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CombinePolicy {
    duration_suffix: String,
    rules: Vec<MetricRule>,
}

impl Default for CombinePolicy {
    /// Rules for the AP pipeline metrics
    fn default() -> Self {
        Self::new(DEFAULT_DURATION_SUFFIX)
            .with_rule("ip_diffim.numSciSources", CombinatorKind::Sum)
            .with_rule("association.numNewDiaObjects", CombinatorKind::Sum)
            .with_rule(
                "association.fracUpdatedDiaObjects",
                CombinatorKind::PartialFraction {
                    partials: MetricName::from("association.numUnassociatedDiaObjects"),
                },
            )
            .with_rule(
                "ip_diffim.fracDiaSourcesToSciSources",
                CombinatorKind::WeightedFraction {
                    weights: MetricName::from("ip_diffim.numSciSources"),
                },
            )
            .with_rule("association.totalUnassociatedDiaObjects", CombinatorKind::LastValue)
    }
}

impl CombinePolicy {
    /// Policy with no explicit rules
    pub fn new(duration_suffix: impl Into<String>) -> Self {
        Self {
            duration_suffix: duration_suffix.into(),
            rules: Vec::new(),
        }
    }

    /// Add a rule, replacing any earlier rule for the same metric
    pub fn with_rule(mut self, metric: impl Into<MetricName>, kind: CombinatorKind) -> Self {
        let metric = metric.into();
        match self.rules.iter_mut().find(|rule| rule.metric == metric) {
            Some(rule) => rule.kind = kind,
            None => self.rules.push(MetricRule { metric, kind }),
        }
        self
    }

    /// Default rules overridden by the `[merge]` config section
    ///
    /// # Errors
    /// [`Error::Config`] if a fraction rule does not name its paired metric.
    pub fn from_config(config: &MergeConfig) -> Result<Self> {
        let mut policy = Self::default();
        if let Some(suffix) = &config.duration_suffix {
            policy.duration_suffix = suffix.clone();
        }
        for rule in &config.rules {
            let kind = kind_from_config(rule)?;
            policy = policy.with_rule(rule.metric.as_str(), kind);
        }
        Ok(policy)
    }

    pub fn duration_suffix(&self) -> &str {
        &self.duration_suffix
    }

    pub fn rules(&self) -> &[MetricRule] {
        &self.rules
    }

    /// Combinator for `name`, or `None` if the metric is not aggregated
    pub fn classify(&self, name: &str) -> Option<CombinatorKind> {
        if let Some(rule) = self.rules.iter().find(|rule| rule.metric.as_str() == name) {
            return Some(rule.kind.clone());
        }
        if !self.duration_suffix.is_empty() && name.ends_with(&self.duration_suffix) {
            return Some(CombinatorKind::Sum);
        }
        None
    }

    /// Metrics copied from the final job, in rule order
    pub fn last_value_metrics(&self) -> impl Iterator<Item = &MetricName> {
        self.rules
            .iter()
            .filter(|rule| rule.kind == CombinatorKind::LastValue)
            .map(|rule| &rule.metric)
    }
}

fn kind_from_config(rule: &MergeRuleConfig) -> Result<CombinatorKind> {
    let paired = |field: &Option<String>, key: &str| {
        field.as_deref().map(MetricName::from).ok_or_else(|| {
            Error::Config(format!(
                "Merge rule for {} needs `{}`",
                rule.metric, key
            ))
        })
    };

    Ok(match rule.combine {
        CombineKindConfig::Sum => CombinatorKind::Sum,
        CombineKindConfig::LastValue => CombinatorKind::LastValue,
        CombineKindConfig::WeightedFraction => CombinatorKind::WeightedFraction {
            weights: paired(&rule.weights, "weights")?,
        },
        CombineKindConfig::PartialFraction => CombinatorKind::PartialFraction {
            partials: paired(&rule.partials, "partials")?,
        },
    })
}
