//! In-memory store of loaded matrices and their computed analyses.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};
use crate::graph::NetworkGraph;
use crate::matrix::{read_matrix_file, ConnectivityMatrix};
use crate::metadata::{Metadata, MetadataExtractor};
use crate::metrics::{GlobalMetrics, MatrixMetrics, MetricsEngine, NodalMetric, PairwiseMetrics};

/// Identifies one recording. Ordered by participant, condition, timepoint.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RecordingKey {
    pub participant: String,
    pub condition: String,
    pub timepoint: String,
}

impl RecordingKey {
    pub fn new(
        participant: impl Into<String>,
        condition: impl Into<String>,
        timepoint: impl Into<String>,
    ) -> Self {
        Self {
            participant: participant.into(),
            condition: condition.into(),
            timepoint: timepoint.into(),
        }
    }
}

impl From<&Metadata> for RecordingKey {
    fn from(meta: &Metadata) -> Self {
        Self::new(&meta.participant_id, &meta.condition, &meta.timepoint)
    }
}

impl fmt::Display for RecordingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}_{}", self.participant, self.timepoint, self.condition)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AnalysisRecord {
    pub metadata: Metadata,
    pub matrix: ConnectivityMatrix,
    pub pairwise: PairwiseMetrics,
    pub nodal: Vec<NodalMetric>,
    pub global: GlobalMetrics,
}

impl AnalysisRecord {
    pub fn new(metadata: Metadata, matrix: ConnectivityMatrix, metrics: MatrixMetrics) -> Self {
        Self {
            metadata,
            matrix,
            pairwise: metrics.pairwise,
            nodal: metrics.nodal,
            global: metrics.global,
        }
    }

    pub fn key(&self) -> RecordingKey {
        RecordingKey::from(&self.metadata)
    }
}

#[derive(Debug, Clone)]
struct LoadedMatrix {
    metadata: Metadata,
    matrix: ConnectivityMatrix,
}

/// Owned by the caller; nothing here is global. Records are replaced, never
/// patched, when a recording is re-analysed.
pub struct AnalysisRegistry {
    engine: MetricsEngine,
    extractor: MetadataExtractor,
    loaded: BTreeMap<RecordingKey, LoadedMatrix>,
    analyses: BTreeMap<RecordingKey, AnalysisRecord>,
    participants: Vec<String>,
    conditions: Vec<String>,
    timepoints: Vec<String>,
}

impl Default for AnalysisRegistry {
    fn default() -> Self {
        Self::new(MetricsEngine::default())
    }
}

impl AnalysisRegistry {
    pub fn new(engine: MetricsEngine) -> Self {
        Self {
            engine,
            extractor: MetadataExtractor::default(),
            loaded: BTreeMap::new(),
            analyses: BTreeMap::new(),
            participants: Vec::new(),
            conditions: Vec::new(),
            timepoints: Vec::new(),
        }
    }

    pub fn with_extractor(mut self, extractor: MetadataExtractor) -> Self {
        self.extractor = extractor;
        self
    }

    pub fn engine(&self) -> &MetricsEngine {
        &self.engine
    }

    /// Stage a matrix for analysis. A later load under the same key replaces
    /// the staged matrix.
    pub fn load_matrix(&mut self, metadata: Metadata, matrix: ConnectivityMatrix) -> RecordingKey {
        let key = RecordingKey::from(&metadata);
        self.track(&metadata);
        debug!(%key, channels = matrix.size(), "matrix loaded");
        self.loaded.insert(key.clone(), LoadedMatrix { metadata, matrix });
        key
    }

    /// Read a matrix file and derive its metadata from the file name.
    pub fn load_file(&mut self, path: &Path) -> Result<RecordingKey> {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default();
        let metadata = self.extractor.extract(name);
        self.load_file_with_metadata(path, metadata)
    }

    pub fn load_file_with_metadata(
        &mut self,
        path: &Path,
        metadata: Metadata,
    ) -> Result<RecordingKey> {
        let matrix = read_matrix_file(path)?;
        Ok(self.load_matrix(metadata, matrix))
    }

    /// Insert a record computed elsewhere (e.g. rebuilt from the cache).
    pub fn insert_record(&mut self, record: AnalysisRecord) -> RecordingKey {
        let key = record.key();
        self.track(&record.metadata);
        self.analyses.insert(key.clone(), record);
        key
    }

    /// Analyse every loaded matrix, replacing existing records.
    pub fn analyze_all(&mut self) -> Vec<RecordingKey> {
        let keys: Vec<RecordingKey> = self.loaded.keys().cloned().collect();
        self.analyze_keys(&keys)
    }

    /// Analyse only the given loaded matrices. Keys with no loaded matrix are
    /// skipped; the returned keys are those that were analysed.
    pub fn analyze_keys(&mut self, keys: &[RecordingKey]) -> Vec<RecordingKey> {
        let mut done = Vec::with_capacity(keys.len());
        for key in keys {
            let Some(loaded) = self.loaded.get(key) else {
                continue;
            };
            let metrics = self.engine.analyze(&loaded.matrix);
            let record =
                AnalysisRecord::new(loaded.metadata.clone(), loaded.matrix.clone(), metrics);
            self.analyses.insert(key.clone(), record);
            done.push(key.clone());
        }
        debug!(count = done.len(), "analysis complete");
        done
    }

    pub fn get(&self, key: &RecordingKey) -> Option<&AnalysisRecord> {
        self.analyses.get(key)
    }

    /// Records in key order.
    pub fn records(&self) -> impl Iterator<Item = &AnalysisRecord> + '_ {
        self.analyses.values()
    }

    pub fn keys(&self) -> impl Iterator<Item = &RecordingKey> + '_ {
        self.analyses.keys()
    }

    pub fn loaded_matrix(&self, key: &RecordingKey) -> Option<&ConnectivityMatrix> {
        self.loaded.get(key).map(|l| &l.matrix)
    }

    /// Number of analysed recordings.
    pub fn len(&self) -> usize {
        self.analyses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.analyses.is_empty()
    }

    pub fn loaded_len(&self) -> usize {
        self.loaded.len()
    }

    pub fn participants(&self) -> &[String] {
        &self.participants
    }

    pub fn conditions(&self) -> &[String] {
        &self.conditions
    }

    pub fn timepoints(&self) -> &[String] {
        &self.timepoints
    }

    pub fn clear(&mut self) {
        self.loaded.clear();
        self.analyses.clear();
        self.participants.clear();
        self.conditions.clear();
        self.timepoints.clear();
    }

    pub fn create_network_graph(&self, key: &RecordingKey, threshold: f64) -> Result<NetworkGraph> {
        let record = self
            .get(key)
            .ok_or_else(|| Error::UnknownAnalysis(key.to_string()))?;
        Ok(NetworkGraph::from_matrix(&record.matrix, threshold))
    }

    fn track(&mut self, meta: &Metadata) {
        push_unique(&mut self.participants, &meta.participant_id);
        push_unique(&mut self.conditions, &meta.condition);
        push_unique(&mut self.timepoints, &meta.timepoint);
    }
}

fn push_unique(list: &mut Vec<String>, value: &str) {
    if !list.iter().any(|v| v == value) {
        list.push(value.to_string());
    }
}
