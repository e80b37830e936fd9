//! Channel-labelled square connectivity matrices.
//!
//! Cell `(i, j)` is the directed influence from channel `i` to channel `j`.
//! Input files are delimited text or Excel workbooks; the cache stores
//! matrices as index-oriented JSON (`{row: {column: value}}`) next to an
//! explicit channel list that fixes the order.

use std::collections::{HashMap, HashSet};
use std::io::{Cursor, Read};
use std::path::Path;

use calamine::Reader;
use serde::ser::{Serialize, SerializeMap, Serializer};

use crate::error::{Error, Result};

const IN_MEMORY: &str = "<in-memory>";
const UTF8_BOM: char = '\u{feff}';

#[derive(Debug, Clone, PartialEq)]
pub struct ConnectivityMatrix {
    channels: Vec<String>,
    /// Row-major, `channels.len()²` cells.
    values: Vec<f64>,
}

impl ConnectivityMatrix {
    /// Build a matrix from labelled rows. `rows[i][j]` is the influence of
    /// `channels[i]` on `channels[j]`.
    pub fn from_rows(channels: Vec<String>, rows: Vec<Vec<f64>>) -> Result<Self> {
        Self::build(channels, rows).map_err(|reason| Error::malformed(IN_MEMORY, reason))
    }

    fn build(channels: Vec<String>, rows: Vec<Vec<f64>>) -> std::result::Result<Self, String> {
        let n = channels.len();
        if n < 2 {
            return Err(format!("need at least 2 channels, found {n}"));
        }
        if rows.len() != n {
            return Err(format!("{} rows for {n} channels", rows.len()));
        }
        let mut seen = HashSet::new();
        for ch in &channels {
            if !seen.insert(ch.as_str()) {
                return Err(format!("duplicate channel label {ch:?}"));
            }
        }
        let mut values = Vec::with_capacity(n * n);
        for (i, row) in rows.into_iter().enumerate() {
            if row.len() != n {
                return Err(format!(
                    "row {} has {} values, expected {n}",
                    channels[i],
                    row.len()
                ));
            }
            if let Some(j) = row.iter().position(|v| !v.is_finite()) {
                return Err(format!(
                    "non-finite value at ({}, {})",
                    channels[i], channels[j]
                ));
            }
            values.extend(row);
        }
        Ok(Self { channels, values })
    }

    pub fn channels(&self) -> &[String] {
        &self.channels
    }

    /// Number of channels.
    pub fn size(&self) -> usize {
        self.channels.len()
    }

    pub fn get(&self, row: usize, col: usize) -> f64 {
        self.values[row * self.size() + col]
    }

    pub fn index_of(&self, channel: &str) -> Option<usize> {
        self.channels.iter().position(|c| c == channel)
    }

    /// Directed value `source → target` looked up by label.
    pub fn value(&self, source: &str, target: &str) -> Option<f64> {
        Some(self.get(self.index_of(source)?, self.index_of(target)?))
    }

    /// Every off-diagonal cell as `(row, col, value)`, row-major.
    pub fn off_diagonal(&self) -> impl Iterator<Item = (usize, usize, f64)> + '_ {
        let n = self.size();
        (0..n)
            .flat_map(move |i| (0..n).map(move |j| (i, j)))
            .filter(|(i, j)| i != j)
            .map(move |(i, j)| (i, j, self.get(i, j)))
    }

    /// Index-oriented JSON. Keys are written in channel order.
    pub fn to_index_json(&self) -> Result<String> {
        Ok(serde_json::to_string(&IndexOriented(self))?)
    }

    /// Inverse of [`to_index_json`](Self::to_index_json); `channels` restores the order.
    pub fn from_index_json(json: &str, channels: &[String]) -> Result<Self> {
        let parsed: HashMap<String, HashMap<String, f64>> = serde_json::from_str(json)?;
        let mut rows = Vec::with_capacity(channels.len());
        for source in channels {
            let row = parsed
                .get(source)
                .ok_or_else(|| Error::malformed(IN_MEMORY, format!("missing row {source:?}")))?;
            let mut values = Vec::with_capacity(channels.len());
            for target in channels {
                let v = row.get(target).ok_or_else(|| {
                    Error::malformed(IN_MEMORY, format!("missing cell ({source}, {target})"))
                })?;
                values.push(*v);
            }
            rows.push(values);
        }
        if parsed.len() != channels.len() {
            return Err(Error::malformed(
                IN_MEMORY,
                format!(
                    "{} rows stored for {} channels",
                    parsed.len(),
                    channels.len()
                ),
            ));
        }
        Self::from_rows(channels.to_vec(), rows)
    }
}

struct IndexOriented<'a>(&'a ConnectivityMatrix);

struct RowRef<'a> {
    matrix: &'a ConnectivityMatrix,
    row: usize,
}

impl Serialize for IndexOriented<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let m = self.0;
        let mut map = serializer.serialize_map(Some(m.size()))?;
        for (i, ch) in m.channels.iter().enumerate() {
            map.serialize_entry(ch, &RowRef { matrix: m, row: i })?;
        }
        map.end()
    }
}

impl Serialize for RowRef<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let m = self.matrix;
        let mut map = serializer.serialize_map(Some(m.size()))?;
        for (j, ch) in m.channels.iter().enumerate() {
            map.serialize_entry(ch, &m.get(self.row, j))?;
        }
        map.end()
    }
}

/// Extensions read as Excel workbooks (first worksheet).
pub const WORKBOOK_EXTENSIONS: [&str; 2] = ["xlsx", "xls"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InputFormat {
    Delimited(u8),
    Workbook,
}

/// `.xlsx`/`.xls` → workbook, `.tsv` → tab, anything else → comma.
fn input_format(path: &Path) -> InputFormat {
    match path.extension().and_then(|e| e.to_str()) {
        Some(ext) if WORKBOOK_EXTENSIONS.iter().any(|w| w.eq_ignore_ascii_case(ext)) => {
            InputFormat::Workbook
        }
        Some(ext) if ext.eq_ignore_ascii_case("tsv") => InputFormat::Delimited(b'\t'),
        _ => InputFormat::Delimited(b','),
    }
}

/// Read a matrix file; the format follows the extension.
pub fn read_matrix_file(path: &Path) -> Result<ConnectivityMatrix> {
    let bytes = std::fs::read(path).map_err(|e| Error::io(path, e))?;
    parse_matrix_bytes(&bytes, path)
}

/// Parse file contents already in memory. `path` picks the format and
/// labels errors.
pub fn parse_matrix_bytes(bytes: &[u8], path: &Path) -> Result<ConnectivityMatrix> {
    match input_format(path) {
        InputFormat::Delimited(delimiter) => parse_matrix(bytes, delimiter, path),
        InputFormat::Workbook => parse_workbook(bytes, path),
    }
}

/// Parse a delimited matrix. Cell layout rules are those of
/// `matrix_from_cells`.
pub fn parse_matrix<R: Read>(reader: R, delimiter: u8, path: &Path) -> Result<ConnectivityMatrix> {
    let mut rdr = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .trim(csv::Trim::All)
        .delimiter(delimiter)
        .from_reader(reader);

    let mut records: Vec<Vec<String>> = Vec::new();
    for rec in rdr.records() {
        records.push(rec?.iter().map(str::to_string).collect());
    }
    matrix_from_cells(records, path)
}

/// Parse the first worksheet of an xlsx/xls workbook.
fn parse_workbook(bytes: &[u8], path: &Path) -> Result<ConnectivityMatrix> {
    let mut workbook = calamine::open_workbook_auto_from_rs(Cursor::new(bytes))
        .map_err(|e| Error::malformed(path, format!("unreadable workbook: {e}")))?;
    let range = workbook
        .worksheet_range_at(0)
        .ok_or_else(|| Error::malformed(path, "workbook has no worksheets"))?
        .map_err(|e| Error::malformed(path, format!("unreadable worksheet: {e}")))?;
    let records: Vec<Vec<String>> = range
        .rows()
        .map(|row| row.iter().map(|cell| cell.to_string().trim().to_string()).collect())
        .collect();
    matrix_from_cells(records, path)
}

/// Build a matrix from a grid of cell texts.
///
/// When the header row is one cell wider than the number of body rows, its
/// first cell is the index marker (`\`, `Source`, blank, ...) and is dropped.
/// Body rows carry their own label in the first cell unless they are exactly
/// as wide as the channel list, in which case they are labelled by position.
/// Blank rows are skipped.
fn matrix_from_cells(mut records: Vec<Vec<String>>, path: &Path) -> Result<ConnectivityMatrix> {
    records.retain(|rec| !rec.iter().all(|f| f.is_empty()));
    let Some((header, body)) = records.split_first() else {
        return Err(Error::malformed(path, "empty file"));
    };

    let mut header = header.clone();
    if let Some(first) = header.first_mut() {
        *first = first.trim_start_matches(UTF8_BOM).to_string();
    }
    let has_marker = header.len() == body.len() + 1;
    let columns: Vec<String> = if has_marker {
        header[1..].to_vec()
    } else {
        header
    };
    let n = columns.len();
    if body.len() != n {
        return Err(Error::malformed(
            path,
            format!("{} data rows for {n} columns", body.len()),
        ));
    }

    let mut labelled: Vec<(String, Vec<f64>)> = Vec::with_capacity(n);
    for (i, row) in body.iter().enumerate() {
        let (label, cells) = if row.len() == n + 1 {
            (row[0].clone(), &row[1..])
        } else if row.len() == n && !has_marker {
            (columns[i].clone(), &row[..])
        } else {
            return Err(Error::malformed(
                path,
                format!("row {} has {} cells, expected {}", i + 1, row.len(), n + 1),
            ));
        };
        let mut values = Vec::with_capacity(n);
        for (j, cell) in cells.iter().enumerate() {
            let v: f64 = cell.parse().map_err(|_| {
                Error::malformed(
                    path,
                    format!("non-numeric cell {cell:?} at ({label}, {})", columns[j]),
                )
            })?;
            values.push(v);
        }
        labelled.push((label, values));
    }

    // Channel order follows the row index; columns are realigned to it.
    let channels: Vec<String> = labelled.iter().map(|(l, _)| l.clone()).collect();
    let column_pos: HashMap<&str, usize> = columns
        .iter()
        .enumerate()
        .map(|(j, c)| (c.as_str(), j))
        .collect();
    if column_pos.len() != n {
        return Err(Error::malformed(path, "duplicate column labels"));
    }
    let mut order = Vec::with_capacity(n);
    for ch in &channels {
        match column_pos.get(ch.as_str()) {
            Some(&j) => order.push(j),
            None => {
                return Err(Error::malformed(
                    path,
                    format!("row label {ch:?} has no matching column"),
                ))
            }
        }
    }
    let rows = labelled
        .into_iter()
        .map(|(_, values)| order.iter().map(|&j| values[j]).collect())
        .collect();

    ConnectivityMatrix::build(channels, rows).map_err(|reason| Error::malformed(path, reason))
}
