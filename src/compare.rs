//! Differences between two group aggregates.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::aggregate::{AggregateError, GroupStatistics, RecordFilter};
use crate::metrics::NodeCategory;
use crate::registry::AnalysisRegistry;

/// The metadata axis two groups differ on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComparisonAxis {
    Condition,
    Timepoint,
}

impl fmt::Display for ComparisonAxis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Condition => f.write_str("condition"),
            Self::Timepoint => f.write_str("timepoint"),
        }
    }
}

/// Relative change in percent. A zero baseline yields a signed infinity
/// (`+inf` unless the difference is negative); callers must check
/// [`f64::is_infinite`].
pub fn percent_change(baseline: f64, other: f64) -> f64 {
    let diff = other - baseline;
    if baseline == 0.0 {
        if diff < 0.0 {
            f64::NEG_INFINITY
        } else {
            f64::INFINITY
        }
    } else {
        diff / baseline * 100.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MetricDelta {
    pub baseline: f64,
    pub other: f64,
    /// `other - baseline`, signed.
    pub absolute_diff: f64,
    #[serde(with = "sentinel_float")]
    pub percent_change: f64,
}

impl MetricDelta {
    pub fn between(baseline: f64, other: f64) -> Self {
        Self {
            baseline,
            other,
            absolute_diff: other - baseline,
            percent_change: percent_change(baseline, other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryChange {
    pub baseline: NodeCategory,
    pub other: NodeCategory,
    pub changed: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodalDelta {
    pub in_strength: MetricDelta,
    pub out_strength: MetricDelta,
    pub causal_flow: MetricDelta,
    pub category: CategoryChange,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Comparison {
    pub axis: ComparisonAxis,
    pub baseline: String,
    pub other: String,
    /// The filter held fixed on the other axis, if any.
    pub fixed: Option<String>,
    pub global: BTreeMap<String, MetricDelta>,
    pub nodal: BTreeMap<String, NodalDelta>,
    pub pairwise: BTreeMap<String, MetricDelta>,
}

/// Compare two aggregates over the keys present on both sides.
pub fn compare_groups(
    axis: ComparisonAxis,
    baseline_label: &str,
    other_label: &str,
    fixed: Option<&str>,
    baseline: &GroupStatistics,
    other: &GroupStatistics,
) -> Comparison {
    let global = baseline
        .global
        .iter()
        .filter_map(|(name, b)| {
            let o = other.global.get(name)?;
            Some((name.clone(), MetricDelta::between(b.mean, o.mean)))
        })
        .collect();

    let nodal = baseline
        .nodal
        .iter()
        .filter_map(|(channel, b)| {
            let o = other.nodal.get(channel)?;
            let delta = NodalDelta {
                in_strength: MetricDelta::between(b.in_strength.mean, o.in_strength.mean),
                out_strength: MetricDelta::between(b.out_strength.mean, o.out_strength.mean),
                causal_flow: MetricDelta::between(b.causal_flow.mean, o.causal_flow.mean),
                category: CategoryChange {
                    baseline: b.dominant_category,
                    other: o.dominant_category,
                    changed: b.dominant_category != o.dominant_category,
                },
            };
            Some((channel.clone(), delta))
        })
        .collect();

    let pairwise = baseline
        .pairwise
        .iter()
        .filter_map(|(pair, b)| {
            let o = other.pairwise.get(pair)?;
            Some((pair.clone(), MetricDelta::between(b.mean, o.mean)))
        })
        .collect();

    Comparison {
        axis,
        baseline: baseline_label.to_string(),
        other: other_label.to_string(),
        fixed: fixed.map(str::to_string),
        global,
        nodal,
        pairwise,
    }
}

impl AnalysisRegistry {
    /// `c1` is the baseline. Optionally restricted to one timepoint.
    pub fn get_condition_comparison(
        &self,
        c1: &str,
        c2: &str,
        timepoint: Option<&str>,
    ) -> Result<Comparison, AggregateError> {
        let side = |condition: &str| {
            let mut filter = RecordFilter::all().condition(condition);
            filter.timepoint = timepoint.map(str::to_string);
            self.side_statistics(&filter, condition)
        };
        let baseline = side(c1)?;
        let other = side(c2)?;
        Ok(compare_groups(
            ComparisonAxis::Condition,
            c1,
            c2,
            timepoint,
            &baseline,
            &other,
        ))
    }

    /// `t1` is the baseline. Optionally restricted to one condition.
    pub fn get_timepoint_comparison(
        &self,
        t1: &str,
        t2: &str,
        condition: Option<&str>,
    ) -> Result<Comparison, AggregateError> {
        let side = |timepoint: &str| {
            let mut filter = RecordFilter::all().timepoint(timepoint);
            filter.condition = condition.map(str::to_string);
            self.side_statistics(&filter, timepoint)
        };
        let baseline = side(t1)?;
        let other = side(t2)?;
        Ok(compare_groups(
            ComparisonAxis::Timepoint,
            t1,
            t2,
            condition,
            &baseline,
            &other,
        ))
    }

    fn side_statistics(
        &self,
        filter: &RecordFilter,
        label: &str,
    ) -> Result<GroupStatistics, AggregateError> {
        self.get_group_statistics(filter)
            .map_err(|e| AggregateError::InsufficientData {
                side: label.to_string(),
                reason: Box::new(e),
            })
    }
}

/// JSON has no infinity; the sentinel is written as the strings `"inf"` /
/// `"-inf"` and read back from them.
mod sentinel_float {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(v: &f64, s: S) -> Result<S::Ok, S::Error> {
        if v.is_infinite() {
            s.serialize_str(if *v > 0.0 { "inf" } else { "-inf" })
        } else {
            s.serialize_f64(*v)
        }
    }

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Num(f64),
        Str(String),
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<f64, D::Error> {
        match Repr::deserialize(d)? {
            Repr::Num(v) => Ok(v),
            Repr::Str(s) => match s.as_str() {
                "inf" => Ok(f64::INFINITY),
                "-inf" => Ok(f64::NEG_INFINITY),
                other => Err(serde::de::Error::custom(format!(
                    "invalid percent change {other:?}"
                ))),
            },
        }
    }
}
