//! Group-level statistics over a filtered set of analysis records.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::metadata::Metadata;
use crate::metrics::{mean, population_std, NodeCategory};
use crate::registry::{AnalysisRecord, AnalysisRegistry};

/// Returned as a value when a selection is empty; callers branch on it.
#[derive(Error, Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum AggregateError {
    #[error("no matching analyses found for {0}")]
    NoMatchingRecords(RecordFilter),

    #[error("could not get statistics for {side}: {reason}")]
    InsufficientData { side: String, reason: Box<AggregateError> },
}

/// Equality filter on recording metadata; unset fields match anything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordFilter {
    pub condition: Option<String>,
    pub timepoint: Option<String>,
    pub participant: Option<String>,
}

impl RecordFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn condition(mut self, condition: impl Into<String>) -> Self {
        self.condition = Some(condition.into());
        self
    }

    pub fn timepoint(mut self, timepoint: impl Into<String>) -> Self {
        self.timepoint = Some(timepoint.into());
        self
    }

    pub fn participant(mut self, participant: impl Into<String>) -> Self {
        self.participant = Some(participant.into());
        self
    }

    pub fn matches(&self, meta: &Metadata) -> bool {
        let eq = |want: &Option<String>, have: &str| want.as_deref().map_or(true, |w| w == have);
        eq(&self.condition, &meta.condition)
            && eq(&self.timepoint, &meta.timepoint)
            && eq(&self.participant, &meta.participant_id)
    }
}

impl fmt::Display for RecordFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = [
            ("participant", &self.participant),
            ("condition", &self.condition),
            ("timepoint", &self.timepoint),
        ]
        .iter()
        .filter_map(|(name, v)| v.as_ref().map(|v| format!("{name}={v}")))
        .collect();
        if parts.is_empty() {
            f.write_str("all records")
        } else {
            f.write_str(&parts.join(", "))
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MeanStd {
    pub mean: f64,
    /// Population standard deviation.
    pub std: f64,
}

impl MeanStd {
    fn of(values: &[f64]) -> Self {
        let mean = mean(values);
        Self {
            mean,
            std: population_std(values, mean),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodalSummary {
    pub in_strength: MeanStd,
    pub out_strength: MeanStd,
    pub causal_flow: MeanStd,
    pub dominant_category: NodeCategory,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MetricSummary {
    pub mean: f64,
    pub std: f64,
    pub min: f64,
    pub max: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupStatistics {
    pub filter: RecordFilter,
    pub record_count: usize,
    /// Keyed by channel.
    pub nodal: BTreeMap<String, NodalSummary>,
    /// Keyed by global metric name.
    pub global: BTreeMap<String, MetricSummary>,
    /// Keyed by `source→target`.
    pub pairwise: BTreeMap<String, MeanStd>,
}

/// Most frequent category. Ties go to the category declared first
/// (sender, then receiver, then neutral).
pub fn dominant_category(categories: &[NodeCategory]) -> Option<NodeCategory> {
    let mut best: Option<(NodeCategory, usize)> = None;
    for cat in NodeCategory::ALL {
        let count = categories.iter().filter(|&&c| c == cat).count();
        if count > 0 && best.map_or(true, |(_, n)| count > n) {
            best = Some((cat, count));
        }
    }
    best.map(|(cat, _)| cat)
}

/// Summaries over `records`, or `None` when there are none.
pub fn summarize<'a, I>(filter: RecordFilter, records: I) -> Option<GroupStatistics>
where
    I: IntoIterator<Item = &'a AnalysisRecord>,
{
    let records: Vec<&AnalysisRecord> = records.into_iter().collect();
    if records.is_empty() {
        return None;
    }

    #[derive(Default)]
    struct NodalAcc {
        in_strength: Vec<f64>,
        out_strength: Vec<f64>,
        causal_flow: Vec<f64>,
        categories: Vec<NodeCategory>,
    }

    let mut nodal_acc: BTreeMap<String, NodalAcc> = BTreeMap::new();
    let mut global_acc: BTreeMap<String, Vec<f64>> = BTreeMap::new();
    let mut pair_acc: BTreeMap<String, Vec<f64>> = BTreeMap::new();

    for rec in &records {
        for node in &rec.nodal {
            let acc = nodal_acc.entry(node.channel.clone()).or_default();
            acc.in_strength.push(node.in_strength);
            acc.out_strength.push(node.out_strength);
            acc.causal_flow.push(node.causal_flow);
            acc.categories.push(node.category);
        }
        for (name, value) in rec.global.named_values() {
            global_acc.entry(name).or_default().push(value);
        }
        for pair in &rec.pairwise.directional {
            pair_acc.entry(pair.name()).or_default().push(pair.value);
        }
    }

    let nodal = nodal_acc
        .into_iter()
        .filter_map(|(channel, acc)| {
            let dominant_category = dominant_category(&acc.categories)?;
            Some((
                channel,
                NodalSummary {
                    in_strength: MeanStd::of(&acc.in_strength),
                    out_strength: MeanStd::of(&acc.out_strength),
                    causal_flow: MeanStd::of(&acc.causal_flow),
                    dominant_category,
                },
            ))
        })
        .collect();

    let global = global_acc
        .into_iter()
        .map(|(name, values)| {
            let ms = MeanStd::of(&values);
            let summary = MetricSummary {
                mean: ms.mean,
                std: ms.std,
                min: values.iter().copied().fold(f64::INFINITY, f64::min),
                max: values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
            };
            (name, summary)
        })
        .collect();

    let pairwise = pair_acc
        .into_iter()
        .map(|(pair, values)| (pair, MeanStd::of(&values)))
        .collect();

    Some(GroupStatistics {
        filter,
        record_count: records.len(),
        nodal,
        global,
        pairwise,
    })
}

impl AnalysisRegistry {
    /// Records matching `filter`, in key order.
    pub fn filtered<'a>(
        &'a self,
        filter: &'a RecordFilter,
    ) -> impl Iterator<Item = &'a AnalysisRecord> + 'a {
        self.records().filter(move |r| filter.matches(&r.metadata))
    }

    pub fn get_group_statistics(
        &self,
        filter: &RecordFilter,
    ) -> Result<GroupStatistics, AggregateError> {
        summarize(filter.clone(), self.filtered(filter))
            .ok_or_else(|| AggregateError::NoMatchingRecords(filter.clone()))
    }

    /// Statistics for one participant across all conditions and timepoints.
    pub fn get_group_statistics_by_participant(
        &self,
        participant: &str,
    ) -> Result<GroupStatistics, AggregateError> {
        self.get_group_statistics(&RecordFilter::all().participant(participant))
    }
}
