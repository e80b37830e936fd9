//! Shared fixtures for unit tests.

use std::path::{Path, PathBuf};

use crate::matrix::ConnectivityMatrix;
use crate::metadata::Metadata;
use crate::metrics::MetricsEngine;
use crate::registry::AnalysisRecord;

/// Channels A, B, C with `A→B = ab`, `B→A = ba` and every other cell 0.
pub fn matrix3(ab: f64, ba: f64) -> ConnectivityMatrix {
    ConnectivityMatrix::from_rows(
        vec!["A".into(), "B".into(), "C".into()],
        vec![vec![0.0, ab, 0.0], vec![ba, 0.0, 0.0], vec![0.0, 0.0, 0.0]],
    )
    .unwrap()
}

pub fn record_from(p: &str, c: &str, t: &str, matrix: ConnectivityMatrix) -> AnalysisRecord {
    let metrics = MetricsEngine::default().analyze(&matrix);
    AnalysisRecord::new(Metadata::new(p, c, t), matrix, metrics)
}

/// A record whose global strength is `ab` (only `A→B` is non-zero).
pub fn record(p: &str, c: &str, t: &str, ab: f64) -> AnalysisRecord {
    record_from(p, c, t, matrix3(ab, 0.0))
}

/// Write a labelled comma-separated matrix file.
pub fn write_matrix(dir: &Path, name: &str, channels: &[&str], rows: &[&[f64]]) -> PathBuf {
    let mut text = String::new();
    text.push('\\');
    for ch in channels {
        text.push(',');
        text.push_str(ch);
    }
    text.push('\n');
    for (ch, row) in channels.iter().zip(rows) {
        text.push_str(ch);
        for v in *row {
            text.push(',');
            text.push_str(&v.to_string());
        }
        text.push('\n');
    }
    let path = dir.join(name);
    std::fs::write(&path, text).unwrap();
    path
}

/// Write the same layout as [`write_matrix`] into the first sheet of an xlsx
/// workbook, with a blank marker cell.
pub fn write_workbook(dir: &Path, name: &str, channels: &[&str], rows: &[&[f64]]) -> PathBuf {
    let mut workbook = rust_xlsxwriter::Workbook::new();
    let sheet = workbook.add_worksheet();
    for (j, ch) in channels.iter().enumerate() {
        sheet.write_string(0, j as u16 + 1, *ch).unwrap();
    }
    for (i, (ch, row)) in channels.iter().zip(rows).enumerate() {
        let r = i as u32 + 1;
        sheet.write_string(r, 0, *ch).unwrap();
        for (j, v) in row.iter().enumerate() {
            sheet.write_number(r, j as u16 + 1, *v).unwrap();
        }
    }
    let path = dir.join(name);
    workbook.save(&path).unwrap();
    path
}
