use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::info;

use crate::compare::Comparison;
use crate::error::{Error, Result};
use crate::graph::NetworkGraph;
use crate::registry::AnalysisRecord;
use crate::tables::{global_table, nodal_table, pairwise_table, NamedTables, Table};

fn create_dir(dir: &Path) -> Result<()> {
    fs::create_dir_all(dir).map_err(|e| Error::io(dir, e))
}

/// Write serde rows as CSV with a header row.
pub fn write_csv<T: Serialize>(path: &Path, rows: &[T]) -> Result<()> {
    let mut wtr = csv::Writer::from_path(path)?;
    for row in rows {
        wtr.serialize(row)?;
    }
    wtr.flush().map_err(|e| Error::io(path, e))?;
    Ok(())
}

/// One `<name>.csv` per non-empty table. Returns the written paths.
pub fn export_tables_to_csv(tables: &NamedTables, output_dir: &Path) -> Result<Vec<PathBuf>> {
    create_dir(output_dir)?;
    let mut saved = Vec::new();
    for (name, table) in tables {
        if table.is_empty() {
            continue;
        }
        let path = output_dir.join(format!("{}.csv", file_safe(name)));
        match table {
            Table::Rows(rows) => write_csv(&path, rows)?,
            Table::Summary(rows) => write_csv(&path, rows)?,
        }
        info!(path = %path.display(), "table saved");
        saved.push(path);
    }
    Ok(saved)
}

/// Nodal, global and pairwise tables of one recording, named after its key.
pub fn export_record_tables(record: &AnalysisRecord, output_dir: &Path) -> Result<Vec<PathBuf>> {
    create_dir(output_dir)?;
    let stem = file_safe(&record.key().to_string());

    let nodal = output_dir.join(format!("{stem}_nodal.csv"));
    write_csv(&nodal, &nodal_table(record))?;

    let pairwise = output_dir.join(format!("{stem}_pairwise.csv"));
    write_csv(&pairwise, &pairwise_table(record))?;

    let global = output_dir.join(format!("{stem}_global.csv"));
    let (header, values) = global_table(record);
    let mut wtr = csv::Writer::from_path(&global)?;
    wtr.write_record(&header)?;
    wtr.write_record(values.iter().map(|v| v.to_string()))?;
    wtr.flush().map_err(|e| Error::io(&global, e))?;

    Ok(vec![nodal, global, pairwise])
}

pub fn comparison_to_json(cmp: &Comparison) -> Result<String> {
    Ok(serde_json::to_string_pretty(cmp)?)
}

pub fn write_text(path: &Path, text: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        create_dir(parent)?;
    }
    let mut f = File::create(path).map_err(|e| Error::io(path, e))?;
    f.write_all(text.as_bytes()).map_err(|e| Error::io(path, e))
}

pub fn to_graphml(graph: &NetworkGraph, id: &str) -> String {
    let mut xml = String::from(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>
<graphml xmlns=\"http://graphml.graphdrawing.org/xmlns\">
  <key id=\"weight\" for=\"edge\" attr.name=\"weight\" attr.type=\"double\"/>
",
    );
    xml.push_str(&format!(
        "  <graph id=\"{}\" edgedefault=\"directed\">\n",
        xml_escape(id)
    ));
    for node in graph.nodes() {
        xml.push_str(&format!("    <node id=\"{}\"/>\n", xml_escape(node)));
    }
    for (i, e) in graph.edges().iter().enumerate() {
        xml.push_str(&format!(
            "    <edge id=\"e{i}\" source=\"{}\" target=\"{}\">
      <data key=\"weight\">{}</data>
    </edge>
",
            xml_escape(&e.source),
            xml_escape(&e.target),
            e.weight
        ));
    }
    xml.push_str("  </graph>\n</graphml>\n");
    xml
}

fn xml_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

/// Replace path separators so table and recording names are usable as file
/// names.
pub(crate) fn file_safe(name: &str) -> String {
    name.chars()
        .map(|c| if matches!(c, '/' | '\\' | ':') { '_' } else { c })
        .collect()
}
