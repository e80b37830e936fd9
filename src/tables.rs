//! Long-format tables and their group summaries.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::metadata::Metadata;
use crate::metrics::{mean, NodeCategory};
use crate::registry::{AnalysisRecord, AnalysisRegistry};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum MetricType {
    Global,
    Nodal,
    Pairwise,
}

impl MetricType {
    pub const ALL: [MetricType; 3] = [Self::Global, Self::Nodal, Self::Pairwise];
}

impl fmt::Display for MetricType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Global => "Global",
            Self::Nodal => "Nodal",
            Self::Pairwise => "Pairwise",
        })
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid {kind} {value:?}, expected one of: {expected}")]
pub struct ParseTableOptionError {
    kind: &'static str,
    value: String,
    expected: &'static str,
}

impl FromStr for MetricType {
    type Err = ParseTableOptionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "global" => Ok(Self::Global),
            "nodal" => Ok(Self::Nodal),
            "pairwise" => Ok(Self::Pairwise),
            _ => Err(ParseTableOptionError {
                kind: "metric type",
                value: s.to_string(),
                expected: "global, nodal, pairwise",
            }),
        }
    }
}

/// Variable name of pairwise rows.
pub const PAIRWISE_VARIABLE: &str = "GC Value";

/// One value in the long-format table. Fields that do not apply to a metric
/// type are left empty.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableRow {
    #[serde(rename = "Participant")]
    pub participant: String,
    #[serde(rename = "Condition")]
    pub condition: String,
    #[serde(rename = "Timepoint")]
    pub timepoint: String,
    #[serde(rename = "Metric_Type")]
    pub metric_type: MetricType,
    #[serde(rename = "Electrode")]
    pub electrode: Option<String>,
    #[serde(rename = "Source")]
    pub source: Option<String>,
    #[serde(rename = "Target")]
    pub target: Option<String>,
    #[serde(rename = "Variable")]
    pub variable: String,
    #[serde(rename = "Value")]
    pub value: f64,
}

impl TableRow {
    fn base(
        meta: &Metadata,
        metric_type: MetricType,
        variable: impl Into<String>,
        value: f64,
    ) -> Self {
        Self {
            participant: meta.participant_id.clone(),
            condition: meta.condition.clone(),
            timepoint: meta.timepoint.clone(),
            metric_type,
            electrode: None,
            source: None,
            target: None,
            variable: variable.into(),
            value,
        }
    }
}

/// Selection for the combined table. Empty lists select everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableFilter {
    pub metric_types: Vec<MetricType>,
    pub conditions: Vec<String>,
    pub timepoints: Vec<String>,
    pub participants: Vec<String>,
}

impl TableFilter {
    fn wants(&self, metric_type: MetricType) -> bool {
        self.metric_types.is_empty() || self.metric_types.contains(&metric_type)
    }

    fn matches(&self, meta: &Metadata) -> bool {
        let allowed = |list: &[String], v: &str| list.is_empty() || list.iter().any(|x| x == v);
        allowed(&self.conditions, &meta.condition)
            && allowed(&self.timepoints, &meta.timepoint)
            && allowed(&self.participants, &meta.participant_id)
    }
}

/// Long-format rows of one record: global, then nodal (without category),
/// then pairwise.
pub fn record_rows(record: &AnalysisRecord, filter: &TableFilter) -> Vec<TableRow> {
    let meta = &record.metadata;
    let mut rows = Vec::new();
    if filter.wants(MetricType::Global) {
        for (name, value) in record.global.named_values() {
            rows.push(TableRow::base(meta, MetricType::Global, name, value));
        }
    }
    if filter.wants(MetricType::Nodal) {
        for node in &record.nodal {
            for (variable, value) in [
                ("in_strength", node.in_strength),
                ("out_strength", node.out_strength),
                ("causal_flow", node.causal_flow),
            ] {
                let mut row = TableRow::base(meta, MetricType::Nodal, variable, value);
                row.electrode = Some(node.channel.clone());
                rows.push(row);
            }
        }
    }
    if filter.wants(MetricType::Pairwise) {
        for pair in &record.pairwise.directional {
            let mut row = TableRow::base(meta, MetricType::Pairwise, PAIRWISE_VARIABLE, pair.value);
            row.source = Some(pair.source.clone());
            row.target = Some(pair.target.clone());
            rows.push(row);
        }
    }
    rows
}

/// How [`AnalysisRegistry::create_group_tables`] partitions the combined table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupBy {
    Condition,
    Timepoint,
    Participant,
    ConditionTimepoint,
}

impl FromStr for GroupBy {
    type Err = ParseTableOptionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "condition" => Ok(Self::Condition),
            "timepoint" => Ok(Self::Timepoint),
            "participant" => Ok(Self::Participant),
            "condition_timepoint" => Ok(Self::ConditionTimepoint),
            _ => Err(ParseTableOptionError {
                kind: "groupby value",
                value: s.to_string(),
                expected: "condition, timepoint, participant, condition_timepoint",
            }),
        }
    }
}

/// Aggregate of one (Metric_Type, Variable, Electrode, Source, Target) group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummaryRow {
    #[serde(rename = "Metric_Type")]
    pub metric_type: MetricType,
    #[serde(rename = "Variable")]
    pub variable: String,
    #[serde(rename = "Electrode")]
    pub electrode: Option<String>,
    #[serde(rename = "Source")]
    pub source: Option<String>,
    #[serde(rename = "Target")]
    pub target: Option<String>,
    pub count: usize,
    pub mean: f64,
    /// Sample standard deviation; empty for a single value.
    pub std: Option<f64>,
    pub min: f64,
    pub max: f64,
}

type SummaryKey = (MetricType, String, Option<String>, Option<String>, Option<String>);

/// Group rows by (Metric_Type, Variable, Electrode, Source, Target); rows
/// missing a field form their own group. Output is sorted by that key.
pub fn summarize_rows(rows: &[TableRow]) -> Vec<SummaryRow> {
    let mut groups: BTreeMap<SummaryKey, Vec<f64>> = BTreeMap::new();
    for row in rows {
        let key = (
            row.metric_type,
            row.variable.clone(),
            row.electrode.clone(),
            row.source.clone(),
            row.target.clone(),
        );
        groups.entry(key).or_default().push(row.value);
    }
    groups
        .into_iter()
        .map(|((metric_type, variable, electrode, source, target), values)| {
            let m = mean(&values);
            SummaryRow {
                metric_type,
                variable,
                electrode,
                source,
                target,
                count: values.len(),
                mean: m,
                std: sample_std(&values, m),
                min: values.iter().copied().fold(f64::INFINITY, f64::min),
                max: values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
            }
        })
        .collect()
}

fn sample_std(values: &[f64], mean: f64) -> Option<f64> {
    if values.len() < 2 {
        return None;
    }
    let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (values.len() - 1) as f64;
    Some(var.sqrt())
}

#[derive(Debug, Clone, PartialEq)]
pub enum Table {
    Rows(Vec<TableRow>),
    Summary(Vec<SummaryRow>),
}

impl Table {
    pub fn len(&self) -> usize {
        match self {
            Self::Rows(r) => r.len(),
            Self::Summary(s) => s.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Named tables in creation order: `combined` first, `combined_summary` last.
pub type NamedTables = Vec<(String, Table)>;

fn unique_in_order<'a>(
    rows: &'a [TableRow],
    field: impl Fn(&'a TableRow) -> &'a str,
) -> Vec<&'a str> {
    let mut seen: Vec<&str> = Vec::new();
    for row in rows {
        let v = field(row);
        if !seen.contains(&v) {
            seen.push(v);
        }
    }
    seen
}

fn push_partition(tables: &mut NamedTables, name: String, rows: Vec<TableRow>) {
    if rows.is_empty() {
        return;
    }
    let summary = summarize_rows(&rows);
    tables.push((name.clone(), Table::Rows(rows)));
    tables.push((format!("{name}_summary"), Table::Summary(summary)));
}

impl AnalysisRegistry {
    /// All records as long-format rows, in key order.
    pub fn create_combined_table(&self, filter: &TableFilter) -> Vec<TableRow> {
        self.records()
            .filter(|r| filter.matches(&r.metadata))
            .flat_map(|r| record_rows(r, filter))
            .collect()
    }

    /// `None` when the filtered combined table is empty.
    pub fn create_group_tables(
        &self,
        groupby: Option<GroupBy>,
        filter: &TableFilter,
    ) -> Option<NamedTables> {
        let combined = self.create_combined_table(filter);
        if combined.is_empty() {
            return None;
        }
        let mut tables: NamedTables = Vec::new();

        let select = |pred: &dyn Fn(&TableRow) -> bool| -> Vec<TableRow> {
            combined.iter().filter(|r| pred(r)).cloned().collect()
        };

        match groupby {
            Some(GroupBy::Condition) => {
                for c in unique_in_order(&combined, |r| r.condition.as_str()) {
                    push_partition(
                        &mut tables,
                        format!("condition_{c}"),
                        select(&|r| r.condition == c),
                    );
                }
            }
            Some(GroupBy::Timepoint) => {
                for t in unique_in_order(&combined, |r| r.timepoint.as_str()) {
                    push_partition(
                        &mut tables,
                        format!("timepoint_{t}"),
                        select(&|r| r.timepoint == t),
                    );
                }
            }
            Some(GroupBy::Participant) => {
                for p in unique_in_order(&combined, |r| r.participant.as_str()) {
                    push_partition(
                        &mut tables,
                        format!("participant_{p}"),
                        select(&|r| r.participant == p),
                    );
                }
            }
            Some(GroupBy::ConditionTimepoint) => {
                let timepoints = unique_in_order(&combined, |r| r.timepoint.as_str());
                for c in unique_in_order(&combined, |r| r.condition.as_str()) {
                    for t in &timepoints {
                        push_partition(
                            &mut tables,
                            format!("condition_{c}_timepoint_{t}"),
                            select(&|r| r.condition == c && r.timepoint == *t),
                        );
                    }
                }
            }
            None => {}
        }

        let combined_summary = summarize_rows(&combined);
        tables.insert(0, ("combined".to_string(), Table::Rows(combined)));
        tables.push(("combined_summary".to_string(), Table::Summary(combined_summary)));
        Some(tables)
    }
}

/// Per-recording nodal table row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodalTableRow {
    #[serde(rename = "Electrode")]
    pub electrode: String,
    #[serde(rename = "In-Strength")]
    pub in_strength: f64,
    #[serde(rename = "Out-Strength")]
    pub out_strength: f64,
    #[serde(rename = "Causal Flow")]
    pub causal_flow: f64,
    #[serde(rename = "Category")]
    pub category: NodeCategory,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PairwiseTableRow {
    #[serde(rename = "Source")]
    pub source: String,
    #[serde(rename = "Target")]
    pub target: String,
    #[serde(rename = "GC Value")]
    pub value: f64,
}

pub fn nodal_table(record: &AnalysisRecord) -> Vec<NodalTableRow> {
    record
        .nodal
        .iter()
        .map(|n| NodalTableRow {
            electrode: n.channel.clone(),
            in_strength: n.in_strength,
            out_strength: n.out_strength,
            causal_flow: n.causal_flow,
            category: n.category,
        })
        .collect()
}

pub fn pairwise_table(record: &AnalysisRecord) -> Vec<PairwiseTableRow> {
    record
        .pairwise
        .directional
        .iter()
        .map(|p| PairwiseTableRow {
            source: p.source.clone(),
            target: p.target.clone(),
            value: p.value,
        })
        .collect()
}

/// Header and the single row of the per-recording global table.
pub fn global_table(record: &AnalysisRecord) -> (Vec<String>, Vec<f64>) {
    record.global.named_values().into_iter().unzip()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::record;
    use pretty_assertions::assert_eq;

    fn registry() -> AnalysisRegistry {
        let mut reg = AnalysisRegistry::default();
        reg.insert_record(record("1", "rest", "T1", 10.0));
        reg.insert_record(record("2", "rest", "T1", 12.0));
        reg.insert_record(record("1", "task", "T2", 4.0));
        reg
    }

    #[test]
    fn test_record_rows_shape() {
        let rec = record("1", "rest", "T1", 1.0);
        let rows = record_rows(&rec, &TableFilter::default());
        // 9 global + 3 channels × 3 nodal + 6 pairs
        assert_eq!(rows.len(), 9 + 9 + 6);
        assert_eq!(rows[0].metric_type, MetricType::Global);
        assert_eq!(rows[0].variable, "global_gc_strength");
        let nodal = rows.iter().find(|r| r.metric_type == MetricType::Nodal).unwrap();
        assert_eq!(nodal.electrode.as_deref(), Some("A"));
        assert!(nodal.source.is_none());
        let pair = rows.last().unwrap();
        assert_eq!(pair.variable, PAIRWISE_VARIABLE);
        assert_eq!(pair.source.as_deref(), Some("C"));
        assert_eq!(pair.target.as_deref(), Some("B"));
        assert!(!rows.iter().any(|r| r.variable == "category"));
    }

    #[test]
    fn test_combined_table_filters() {
        let reg = registry();
        let filter = TableFilter {
            metric_types: vec![MetricType::Global],
            conditions: vec!["rest".into()],
            ..Default::default()
        };
        let rows = reg.create_combined_table(&filter);
        assert_eq!(rows.len(), 18);
        assert!(rows.iter().all(|r| r.condition == "rest"));
        assert_eq!(rows[0].participant, "1");
    }

    #[test]
    fn test_group_tables_by_condition() {
        let reg = registry();
        let tables = reg
            .create_group_tables(Some(GroupBy::Condition), &TableFilter::default())
            .unwrap();
        let names: Vec<&str> = tables.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "combined",
                "condition_rest",
                "condition_rest_summary",
                "condition_task",
                "condition_task_summary",
                "combined_summary"
            ]
        );
    }

    #[test]
    fn test_group_tables_condition_timepoint_skips_empty() {
        let reg = registry();
        let tables = reg
            .create_group_tables(Some(GroupBy::ConditionTimepoint), &TableFilter::default())
            .unwrap();
        let names: Vec<&str> = tables.iter().map(|(n, _)| n.as_str()).collect();
        assert!(names.contains(&"condition_rest_timepoint_T1"));
        assert!(names.contains(&"condition_task_timepoint_T2"));
        assert!(!names.contains(&"condition_rest_timepoint_T2"));
    }

    #[test]
    fn test_group_tables_empty_is_none() {
        let reg = AnalysisRegistry::default();
        assert!(reg.create_group_tables(None, &TableFilter::default()).is_none());
    }

    #[test]
    fn test_invalid_groupby_rejected() {
        let err = "electrode".parse::<GroupBy>().unwrap_err();
        assert!(err.to_string().contains("condition_timepoint"));
        assert_eq!("participant".parse::<GroupBy>(), Ok(GroupBy::Participant));
    }

    #[test]
    fn test_summary_uses_sample_std() {
        let reg = registry();
        let filter = TableFilter {
            conditions: vec!["rest".into()],
            ..Default::default()
        };
        let summary = summarize_rows(&reg.create_combined_table(&filter));
        let total = summary
            .iter()
            .find(|s| s.variable == "global_gc_strength")
            .unwrap();
        assert_eq!(total.count, 2);
        assert_eq!(total.mean, 11.0);
        // sample std of [10, 12]
        assert!((total.std.unwrap() - 2f64.sqrt()).abs() < 1e-12);
        assert_eq!(total.electrode, None);
    }

    #[test]
    fn test_summary_single_value_has_no_std() {
        let rows = record_rows(&record("1", "rest", "T1", 1.0), &TableFilter::default());
        let summary = summarize_rows(&rows);
        assert!(summary.iter().all(|s| s.count == 1 && s.std.is_none()));
        // global rows are kept even though they have no electrode
        assert!(summary.iter().any(|s| s.metric_type == MetricType::Global));
        assert_eq!(summary.len(), rows.len());
    }

    #[test]
    fn test_per_recording_tables() {
        let rec = record("1", "rest", "T1", 2.0);
        let nodal = nodal_table(&rec);
        assert_eq!(nodal[0].electrode, "A");
        assert_eq!(nodal[0].category, NodeCategory::Sender);
        assert_eq!(pairwise_table(&rec).len(), 6);
        let (header, values) = global_table(&rec);
        assert_eq!(header.len(), values.len());
        assert_eq!(values[0], 2.0);
    }
}
