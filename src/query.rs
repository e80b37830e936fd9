//! Human-readable line rendering for the CLI.

use crate::aggregate::GroupStatistics;
use crate::batch::PipelineResult;
use crate::compare::{Comparison, MetricDelta};
use crate::db::{CacheStats, FileEntry};
use crate::graph::NetworkGraph;
use crate::loader::BatchReport;
use crate::registry::AnalysisRecord;

fn percent(v: f64) -> String {
    if v.is_infinite() {
        if v > 0.0 {
            "+inf%".to_string()
        } else {
            "-inf%".to_string()
        }
    } else {
        format!("{v:+.1}%")
    }
}

fn delta_line(name: &str, d: &MetricDelta) -> String {
    format!(
        "{name}: {:.6} → {:.6} ({:+.6}, {})",
        d.baseline,
        d.other,
        d.absolute_diff,
        percent(d.percent_change)
    )
}

/// Global metrics, then one line per channel, of a single recording.
pub fn record_lines(record: &AnalysisRecord) -> Vec<String> {
    let mut lines = vec![format!(
        "{} ({} channels)",
        record.key(),
        record.matrix.size()
    )];
    for (name, value) in record.global.named_values() {
        lines.push(format!("  {name} = {value:.6}"));
    }
    lines.push(String::new());
    for node in &record.nodal {
        lines.push(format!(
            "  {:<6} in {:.6}  out {:.6}  flow {:+.6}  [{}]",
            node.channel, node.in_strength, node.out_strength, node.causal_flow, node.category
        ));
    }
    lines
}

pub fn group_lines(stats: &GroupStatistics) -> Vec<String> {
    let mut lines = vec![format!("{} records ({})", stats.record_count, stats.filter)];
    for (name, s) in &stats.global {
        lines.push(format!(
            "  {name}: mean {:.6} ± {:.6} (min {:.6}, max {:.6})",
            s.mean, s.std, s.min, s.max
        ));
    }
    if !stats.nodal.is_empty() {
        lines.push(String::new());
        lines.push("Nodes:".to_string());
        for (channel, n) in &stats.nodal {
            lines.push(format!(
                "  {channel:<6} flow {:+.6} ± {:.6}  [{}]",
                n.causal_flow.mean, n.causal_flow.std, n.dominant_category
            ));
        }
    }
    lines
}

/// Global deltas, then channels whose dominant category changed.
pub fn comparison_lines(cmp: &Comparison) -> Vec<String> {
    let mut lines = vec![match &cmp.fixed {
        Some(fixed) => format!("{} {} vs {} ({fixed})", cmp.axis, cmp.baseline, cmp.other),
        None => format!("{} {} vs {}", cmp.axis, cmp.baseline, cmp.other),
    }];
    for (name, d) in &cmp.global {
        lines.push(format!("  {}", delta_line(name, d)));
    }
    let changed: Vec<_> = cmp
        .nodal
        .iter()
        .filter(|(_, n)| n.category.changed)
        .collect();
    if !changed.is_empty() {
        lines.push(String::new());
        lines.push("Category changes:".to_string());
        for (channel, n) in changed {
            lines.push(format!(
                "  {channel}: {} → {}",
                n.category.baseline, n.category.other
            ));
        }
    }
    lines
}

pub fn file_lines(files: &[FileEntry]) -> Vec<String> {
    files
        .iter()
        .map(|f| {
            format!(
                "{} | participant {} | {} | {} | updated {}",
                f.path.display(),
                f.metadata.participant_id,
                f.metadata.condition,
                f.metadata.timepoint,
                f.updated_at.format("%Y-%m-%d %H:%M:%S")
            )
        })
        .collect()
}

pub fn stats_lines(stats: &CacheStats) -> Vec<String> {
    vec![
        format!("Files:        {}", stats.total_files),
        format!("Analyses:     {}", stats.cached_analyses),
        format!("Participants: {}", stats.unique_participants),
        format!("Conditions:   {}", stats.unique_conditions),
        format!("DB size:      {}", stats.db_size),
    ]
}

pub fn report_lines(report: &BatchReport) -> Vec<String> {
    let mut lines = vec![format!(
        "{} files: {} from cache, {} computed, {} newly cached, {} failed",
        report.files,
        report.from_cache,
        report.fresh,
        report.newly_cached,
        report.failed.len()
    )];
    for (path, reason) in &report.failed {
        lines.push(format!("  ✗ {}: {reason}", path.display()));
    }
    lines
}

pub fn graph_lines(graph: &NetworkGraph) -> Vec<String> {
    let mut lines = vec![format!(
        "{} nodes, {} edges above {}",
        graph.nodes().len(),
        graph.edges().len(),
        graph.threshold
    )];
    for d in graph.degrees() {
        lines.push(format!(
            "  {:<6} in {} ({:.6})  out {} ({:.6})",
            d.node, d.in_degree, d.in_weight, d.out_degree, d.out_weight
        ));
    }
    lines
}

/// One line per pipeline plus a success count.
pub fn pipeline_lines(results: &[PipelineResult]) -> Vec<String> {
    let ok = results.iter().filter(|r| r.success).count();
    let mut lines = vec![format!("{ok}/{} pipelines succeeded", results.len())];
    for r in results {
        match &r.error {
            None => lines.push(format!(
                "  ✓ {:<9} {:.2}s, {} files",
                r.kind.as_str(),
                r.duration.as_secs_f64(),
                r.files_written.len()
            )),
            Some(e) => lines.push(format!(
                "  ✗ {:<9} {:.2}s: {e}",
                r.kind.as_str(),
                r.duration.as_secs_f64()
            )),
        }
    }
    lines
}
