//! Cache-aware loading of matrix files into an [`AnalysisRegistry`].

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde_json::json;
use tracing::{debug, info, warn};

use crate::db::{CacheStore, CachedAnalysis};
use crate::error::{Error, Result};
use crate::matrix::parse_matrix_bytes;
use crate::metadata::{Metadata, MetadataExtractor};
use crate::metrics::MetricsEngine;
use crate::registry::{AnalysisRecord, AnalysisRegistry, RecordingKey};

/// Default `analysis_type` under which results are cached.
pub const GRANGER_CAUSALITY: &str = "granger_causality";

/// Files directly inside `dir` whose extension matches one of `extensions`
/// (case-insensitive), sorted by path.
pub fn find_input_files(dir: &Path, extensions: &[String]) -> Result<Vec<PathBuf>> {
    let entries = std::fs::read_dir(dir).map_err(|e| Error::io(dir, e))?;
    let mut files = Vec::new();
    for entry in entries {
        let path = entry.map_err(|e| Error::io(dir, e))?.path();
        if !path.is_file() {
            continue;
        }
        let matches = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|ext| extensions.iter().any(|want| want.eq_ignore_ascii_case(ext)));
        if matches {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadOutcome {
    /// Rebuilt from the cache; no metrics were computed.
    FromCache(RecordingKey),
    /// Parsed and staged; metrics are computed by the batch step.
    Loaded(RecordingKey),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchReport {
    pub files: usize,
    pub from_cache: usize,
    pub fresh: usize,
    pub newly_cached: usize,
    pub failed: Vec<(PathBuf, String)>,
}

impl BatchReport {
    pub fn loaded(&self) -> usize {
        self.from_cache + self.fresh
    }
}

/// Storage-level failures abort a batch; anything else is per-file.
fn is_fatal(err: &Error) -> bool {
    matches!(err, Error::Database(_) | Error::SchemaTooNew { .. })
}

pub struct CachedLoader {
    store: CacheStore,
    extractor: MetadataExtractor,
    analysis_type: String,
    params: serde_json::Value,
}

impl CachedLoader {
    /// Cached results are only reused when they were computed with the same
    /// density thresholds as `engine`.
    pub fn new(
        store: CacheStore,
        analysis_type: impl Into<String>,
        engine: &MetricsEngine,
    ) -> Self {
        Self {
            store,
            extractor: MetadataExtractor::default(),
            analysis_type: analysis_type.into(),
            params: json!({ "density_thresholds": engine.thresholds() }),
        }
    }

    pub fn with_extractor(mut self, extractor: MetadataExtractor) -> Self {
        self.extractor = extractor;
        self
    }

    pub fn store(&self) -> &CacheStore {
        &self.store
    }

    pub fn analysis_type(&self) -> &str {
        &self.analysis_type
    }

    /// Stored metadata if the file is registered, otherwise derived from
    /// its name.
    pub fn metadata_for(&self, path: &Path) -> Result<Metadata> {
        if let Some(meta) = self.store.get_file_metadata(path)? {
            return Ok(meta);
        }
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default();
        Ok(self.extractor.extract(name))
    }

    pub fn load_single_file_with_cache(
        &self,
        registry: &mut AnalysisRegistry,
        path: &Path,
        force_reload: bool,
    ) -> Result<LoadOutcome> {
        if !force_reload && self.store.is_file_cached(path, &self.analysis_type)? {
            if let Some(record) = self.cached_record(path)? {
                debug!(path = %path.display(), "loaded from cache");
                return Ok(LoadOutcome::FromCache(registry.insert_record(record)));
            }
        }

        let metadata = self.metadata_for(path)?;
        let file = self.store.read_stamped(path)?;
        let matrix = parse_matrix_bytes(&file.contents, path)?;
        self.store.register_stamped(&file, &metadata)?;
        let key = registry.load_matrix(metadata, matrix);
        debug!(path = %path.display(), %key, "loaded for analysis");
        Ok(LoadOutcome::Loaded(key))
    }

    /// `None` when the cached row cannot rebuild a full record.
    fn cached_record(&self, path: &Path) -> Result<Option<AnalysisRecord>> {
        let cached = match self.store.get_cached_analysis(path, &self.analysis_type) {
            Ok(Some(c)) => c,
            Ok(None) => return Ok(None),
            Err(e) if is_fatal(&e) => return Err(e),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "unreadable cache entry, recomputing");
                return Ok(None);
            }
        };
        if cached.params != self.params {
            debug!(path = %path.display(), "cached with different parameters");
            return Ok(None);
        }
        let (Some(nodal), Some(pairwise)) = (cached.nodal, cached.pairwise) else {
            debug!(path = %path.display(), "cache entry predates nodal metrics");
            return Ok(None);
        };
        let Some(metadata) = self.store.get_file_metadata(path)? else {
            return Ok(None);
        };
        Ok(Some(AnalysisRecord {
            metadata,
            matrix: cached.matrix,
            pairwise,
            nodal,
            global: cached.global,
        }))
    }

    /// Load every file in order, analyse the cache misses and write their
    /// results back. Per-file failures are recorded and skipped.
    pub fn load_and_analyze(
        &self,
        registry: &mut AnalysisRegistry,
        files: &[PathBuf],
        force_reload: bool,
    ) -> Result<BatchReport> {
        let mut report = BatchReport {
            files: files.len(),
            ..Default::default()
        };
        let mut pending: BTreeMap<RecordingKey, PathBuf> = BTreeMap::new();

        for path in files {
            match self.load_single_file_with_cache(registry, path, force_reload) {
                Ok(LoadOutcome::FromCache(_)) => report.from_cache += 1,
                Ok(LoadOutcome::Loaded(key)) => {
                    if let Some(previous) = pending.insert(key.clone(), path.clone()) {
                        warn!(
                            %key,
                            previous = %previous.display(),
                            path = %path.display(),
                            "two files map to the same recording, keeping the later one"
                        );
                    }
                }
                Err(e) if is_fatal(&e) => return Err(e),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "failed to load");
                    report.failed.push((path.clone(), e.to_string()));
                }
            }
        }

        let keys: Vec<RecordingKey> = pending.keys().cloned().collect();
        let analysed = registry.analyze_keys(&keys);
        report.fresh = analysed.len();

        for key in &analysed {
            let (Some(record), Some(path)) = (registry.get(key), pending.get(key)) else {
                continue;
            };
            let payload = CachedAnalysis {
                matrix: record.matrix.clone(),
                global: record.global.clone(),
                nodal: Some(record.nodal.clone()),
                pairwise: Some(record.pairwise.clone()),
                params: self.params.clone(),
            };
            match self
                .store
                .cache_analysis_result(path, &self.analysis_type, &payload)
            {
                Ok(()) => report.newly_cached += 1,
                Err(e) if is_fatal(&e) => return Err(e),
                Err(e) => warn!(path = %path.display(), error = %e, "failed to cache result"),
            }
        }

        info!(
            files = report.files,
            from_cache = report.from_cache,
            fresh = report.fresh,
            failed = report.failed.len(),
            "batch load complete"
        );
        Ok(report)
    }

    pub fn load_directory(
        &self,
        registry: &mut AnalysisRegistry,
        dir: &Path,
        extensions: &[String],
        force_reload: bool,
    ) -> Result<BatchReport> {
        let files = find_input_files(dir, extensions)?;
        if files.is_empty() {
            warn!(dir = %dir.display(), "no input files found");
        }
        self.load_and_analyze(registry, &files, force_reload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::RecordFilter;
    use crate::db::{ContentHasher, Sha256Hasher};
    use crate::testutil::{write_matrix, write_workbook};
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tempfile::TempDir;

    fn exts() -> Vec<String> {
        vec!["csv".into(), "tsv".into(), "xlsx".into()]
    }

    /// SHA-256 that overwrites `path` the first time it is asked for a digest,
    /// like a writer finishing while the loader is busy with the file.
    struct RewriteOnFirstDigest {
        path: PathBuf,
        replacement: &'static str,
        fired: AtomicBool,
    }

    impl ContentHasher for RewriteOnFirstDigest {
        fn name(&self) -> &str {
            "sha256"
        }

        fn digest(&self, reader: &mut dyn std::io::Read) -> std::io::Result<String> {
            if !self.fired.swap(true, Ordering::SeqCst) {
                std::fs::write(&self.path, self.replacement)?;
            }
            Sha256Hasher::default().digest(reader)
        }
    }

    fn loader() -> CachedLoader {
        CachedLoader::new(
            CacheStore::open_in_memory().unwrap(),
            GRANGER_CAUSALITY,
            &MetricsEngine::default(),
        )
    }

    fn inputs() -> TempDir {
        let dir = tempfile::tempdir().unwrap();
        write_matrix(
            dir.path(),
            "1_rest.csv",
            &["F3", "F4"],
            &[&[0.0, 0.002], &[0.001, 0.0]],
        );
        write_matrix(
            dir.path(),
            "2_rest.csv",
            &["F3", "F4"],
            &[&[0.0, 0.0004], &[0.003, 0.0]],
        );
        dir
    }

    #[test]
    fn test_find_input_files() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["b.CSV", "a.tsv", "c.txt", "d.csv"] {
            std::fs::write(dir.path().join(name), "x").unwrap();
        }
        std::fs::create_dir(dir.path().join("sub.csv")).unwrap();
        let files = find_input_files(dir.path(), &exts()).unwrap();
        let names: Vec<String> = files
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["a.tsv", "b.CSV", "d.csv"]);
    }

    #[test]
    fn test_first_run_computes_and_caches() {
        let dir = inputs();
        let loader = loader();
        let mut reg = AnalysisRegistry::default();
        let report = loader
            .load_directory(&mut reg, dir.path(), &exts(), false)
            .unwrap();
        assert_eq!(report.fresh, 2);
        assert_eq!(report.from_cache, 0);
        assert_eq!(report.newly_cached, 2);
        assert_eq!(reg.len(), 2);
        assert_eq!(loader.store().stats().unwrap().cached_analyses, 2);
    }

    #[test]
    fn test_second_run_served_from_cache() {
        let dir = inputs();
        let loader = loader();
        let mut first = AnalysisRegistry::default();
        loader
            .load_directory(&mut first, dir.path(), &exts(), false)
            .unwrap();

        let mut second = AnalysisRegistry::default();
        let report = loader
            .load_directory(&mut second, dir.path(), &exts(), false)
            .unwrap();
        assert_eq!(report.from_cache, 2);
        assert_eq!(report.fresh, 0);
        assert_eq!(second.loaded_len(), 0);
        let a: Vec<&AnalysisRecord> = first.records().collect();
        let b: Vec<&AnalysisRecord> = second.records().collect();
        assert_eq!(a, b);
    }

    #[test]
    fn test_force_reload_recomputes() {
        let dir = inputs();
        let loader = loader();
        let mut reg = AnalysisRegistry::default();
        loader.load_directory(&mut reg, dir.path(), &exts(), false).unwrap();
        let report = loader.load_directory(&mut reg, dir.path(), &exts(), true).unwrap();
        assert_eq!(report.fresh, 2);
        assert_eq!(report.from_cache, 0);
    }

    #[test]
    fn test_changed_file_is_recomputed() {
        let dir = inputs();
        let loader = loader();
        loader
            .load_directory(&mut AnalysisRegistry::default(), dir.path(), &exts(), false)
            .unwrap();
        write_matrix(
            dir.path(),
            "2_rest.csv",
            &["F3", "F4"],
            &[&[0.0, 0.5], &[0.25, 0.0]],
        );

        let mut reg = AnalysisRegistry::default();
        let report = loader
            .load_directory(&mut reg, dir.path(), &exts(), false)
            .unwrap();
        assert_eq!(report.from_cache, 1);
        assert_eq!(report.fresh, 1);
        let rec = reg.get(&RecordingKey::new("2", "rest", "T1")).unwrap();
        assert_eq!(rec.matrix.value("F3", "F4"), Some(0.5));
    }

    #[test]
    fn test_cached_stamp_matches_parsed_bytes() {
        let dir = inputs();
        let path = dir.path().join("1_rest.csv");
        let parsed_bytes = std::fs::read(&path).unwrap();
        let hasher = RewriteOnFirstDigest {
            path: path.clone(),
            replacement: "\\,F3,F4\nF3,0,0.5\nF4,0.25,0\n",
            fired: AtomicBool::new(false),
        };
        let loader = CachedLoader::new(
            CacheStore::open_in_memory().unwrap().with_hasher(Box::new(hasher)),
            GRANGER_CAUSALITY,
            &MetricsEngine::default(),
        );
        let key = RecordingKey::new("1", "rest", "T1");

        let mut first = AnalysisRegistry::default();
        loader
            .load_and_analyze(&mut first, &[path.clone()], false)
            .unwrap();
        assert_eq!(first.get(&key).unwrap().matrix.value("F3", "F4"), Some(0.002));
        let expected = Sha256Hasher::default()
            .hash_bytes(&parsed_bytes)
            .unwrap();
        let files = loader.store().get_all_files(&RecordFilter::all()).unwrap();
        assert_eq!(files[0].hash, expected);

        // the file now holds the replacement, so the stored result must not be reused
        let mut second = AnalysisRegistry::default();
        let report = loader
            .load_and_analyze(&mut second, &[path.clone()], false)
            .unwrap();
        assert_eq!(report.from_cache, 0);
        assert_eq!(report.fresh, 1);
        assert_eq!(second.get(&key).unwrap().matrix.value("F3", "F4"), Some(0.5));
    }

    #[test]
    fn test_workbook_inputs_load_and_cache() {
        let dir = inputs();
        write_workbook(
            dir.path(),
            "3_task.xlsx",
            &["F3", "F4"],
            &[&[0.0, 0.0008], &[0.002, 0.0]],
        );
        let loader = loader();
        let mut reg = AnalysisRegistry::default();
        let report = loader
            .load_directory(&mut reg, dir.path(), &exts(), false)
            .unwrap();
        assert_eq!(report.files, 3);
        assert_eq!(report.fresh, 3);
        assert!(report.failed.is_empty());
        let rec = reg.get(&RecordingKey::new("3", "task", "T1")).unwrap();
        assert_eq!(rec.matrix.value("F4", "F3"), Some(0.002));

        let report = loader
            .load_directory(&mut AnalysisRegistry::default(), dir.path(), &exts(), false)
            .unwrap();
        assert_eq!(report.from_cache, 3);
    }

    #[test]
    fn test_malformed_file_does_not_abort_batch() {
        let dir = inputs();
        std::fs::write(dir.path().join("3_rest.csv"), ",F3,F4\nF3,0,abc\nF4,1,0\n").unwrap();
        let loader = loader();
        let mut reg = AnalysisRegistry::default();
        let report = loader
            .load_directory(&mut reg, dir.path(), &exts(), false)
            .unwrap();
        assert_eq!(report.files, 3);
        assert_eq!(report.loaded(), 2);
        assert_eq!(report.failed.len(), 1);
        assert!(report.failed[0].0.ends_with("3_rest.csv"));
        assert_eq!(loader.store().stats().unwrap().total_files, 2);
    }

    #[test]
    fn test_different_thresholds_miss_the_cache() {
        let dir = inputs();
        let store_path = dir.path().join("cache").join("cache.db");
        {
            let loader = CachedLoader::new(
                CacheStore::open(&store_path).unwrap(),
                GRANGER_CAUSALITY,
                &MetricsEngine::default(),
            );
            loader
                .load_directory(&mut AnalysisRegistry::default(), dir.path(), &exts(), false)
                .unwrap();
        }
        let engine = MetricsEngine::new(vec![0.01]);
        let store = CacheStore::open(&store_path).unwrap();
        let loader = CachedLoader::new(store, GRANGER_CAUSALITY, &engine);
        let mut reg = AnalysisRegistry::new(engine);
        let report = loader
            .load_directory(&mut reg, dir.path(), &exts(), false)
            .unwrap();
        assert_eq!(report.fresh, 2);
        let rec = reg.records().next().unwrap();
        assert_eq!(rec.global.density.len(), 1);
    }

    #[test]
    fn test_stored_metadata_preferred() {
        let dir = inputs();
        let loader = loader();
        let path = dir.path().join("1_rest.csv");
        loader
            .store()
            .register_file(&path, &Metadata::new("P01", "eyes_closed", "T3"))
            .unwrap();
        let mut reg = AnalysisRegistry::default();
        let outcome = loader
            .load_single_file_with_cache(&mut reg, &path, false)
            .unwrap();
        assert_eq!(
            outcome,
            LoadOutcome::Loaded(RecordingKey::new("P01", "eyes_closed", "T3"))
        );
    }

    #[test]
    fn test_single_file_cache_hit_skips_engine() {
        let dir = inputs();
        let loader = loader();
        let path = dir.path().join("1_rest.csv");
        loader
            .load_and_analyze(&mut AnalysisRegistry::default(), &[path.clone()], false)
            .unwrap();
        let mut reg = AnalysisRegistry::default();
        let outcome = loader
            .load_single_file_with_cache(&mut reg, &path, false)
            .unwrap();
        assert!(matches!(outcome, LoadOutcome::FromCache(_)));
        assert_eq!(reg.len(), 1);
        assert_eq!(reg.loaded_len(), 0);
    }
}
