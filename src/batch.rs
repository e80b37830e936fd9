//! Concurrent output pipelines over one input directory.
//!
//! Every pipeline opens its own cache connection and registry, loads the
//! input directory through the cache, and writes under
//! `<output_dir>/<pipeline>/`. Pipelines run as blocking tasks; a semaphore
//! bounds how many run at once.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{error, info};

use crate::db::{CacheStore, Sha256Hasher};
use crate::error::{Error, Result};
use crate::export::{export_tables_to_csv, file_safe, to_graphml, write_csv, write_text};
use crate::loader::CachedLoader;
use crate::metrics::MetricsEngine;
use crate::registry::AnalysisRegistry;
use crate::tables::{nodal_table, pairwise_table, GroupBy, MetricType, TableFilter};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PipelineKind {
    Global,
    Nodal,
    Pairwise,
    Network,
    Tables,
}

impl PipelineKind {
    pub const ALL: [PipelineKind; 5] = [
        Self::Global,
        Self::Nodal,
        Self::Pairwise,
        Self::Network,
        Self::Tables,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Global => "global",
            Self::Nodal => "nodal",
            Self::Pairwise => "pairwise",
            Self::Network => "network",
            Self::Tables => "tables",
        }
    }
}

impl fmt::Display for PipelineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("unknown pipeline {0:?}, expected one of: global, nodal, pairwise, network, tables")]
pub struct UnknownPipeline(String);

impl FromStr for PipelineKind {
    type Err = UnknownPipeline;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|k| k.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| UnknownPipeline(s.to_string()))
    }
}

/// Everything a pipeline needs; cloned into each task.
#[derive(Debug, Clone)]
pub struct PipelineContext {
    pub input_dir: PathBuf,
    pub output_dir: PathBuf,
    pub cache_path: PathBuf,
    pub analysis_type: String,
    pub thresholds: Vec<f64>,
    pub network_threshold: f64,
    pub extensions: Vec<String>,
    pub hash_chunk_size: usize,
    pub force_reload: bool,
}

#[derive(Debug, Clone)]
pub struct PipelineResult {
    pub kind: PipelineKind,
    pub success: bool,
    pub duration: Duration,
    pub error: Option<String>,
    pub files_written: Vec<PathBuf>,
}

/// Load the input directory through the cache and write this pipeline's
/// outputs. Returns the written paths.
pub fn run_pipeline(kind: PipelineKind, ctx: &PipelineContext) -> Result<Vec<PathBuf>> {
    let store = CacheStore::open(&ctx.cache_path)?
        .with_hasher(Box::new(Sha256Hasher::new(ctx.hash_chunk_size)));
    let engine = MetricsEngine::new(ctx.thresholds.clone());
    let loader = CachedLoader::new(store, ctx.analysis_type.as_str(), &engine);
    let mut registry = AnalysisRegistry::new(engine);
    let report = loader.load_directory(
        &mut registry,
        &ctx.input_dir,
        &ctx.extensions,
        ctx.force_reload,
    )?;
    info!(
        pipeline = %kind,
        loaded = report.loaded(),
        failed = report.failed.len(),
        "pipeline input loaded"
    );

    let out = pipeline_dir(&ctx.output_dir, kind);
    let mut written = Vec::new();
    match kind {
        PipelineKind::Global => {
            let filter = TableFilter {
                metric_types: vec![MetricType::Global],
                ..Default::default()
            };
            if let Some(tables) = registry.create_group_tables(Some(GroupBy::Condition), &filter) {
                written.extend(export_tables_to_csv(&tables, &out)?);
            }
        }
        PipelineKind::Nodal => {
            for record in registry.records() {
                let stem = file_safe(&record.key().to_string());
                let path = out.join(format!("{stem}_nodal.csv"));
                write_rows(&path, &nodal_table(record))?;
                written.push(path);
            }
        }
        PipelineKind::Pairwise => {
            for record in registry.records() {
                let stem = file_safe(&record.key().to_string());
                let path = out.join(format!("{stem}_pairwise.csv"));
                write_rows(&path, &pairwise_table(record))?;
                written.push(path);
            }
        }
        PipelineKind::Network => {
            for key in registry.keys() {
                let graph = registry.create_network_graph(key, ctx.network_threshold)?;
                let stem = file_safe(&key.to_string());
                let graphml = out.join(format!("{stem}.graphml"));
                write_text(&graphml, &to_graphml(&graph, &stem))?;
                let degrees = out.join(format!("{stem}_degrees.csv"));
                write_rows(&degrees, &graph.degrees())?;
                written.push(graphml);
                written.push(degrees);
            }
        }
        PipelineKind::Tables => {
            let groupby = Some(GroupBy::ConditionTimepoint);
            if let Some(tables) = registry.create_group_tables(groupby, &TableFilter::default()) {
                written.extend(export_tables_to_csv(&tables, &out)?);
            }
        }
    }
    Ok(written)
}

/// Run `kinds` with at most `max_concurrent` in flight. Results come back in
/// the order of `kinds`; a failed pipeline does not stop the others.
pub async fn run_pipelines(
    kinds: &[PipelineKind],
    ctx: &PipelineContext,
    max_concurrent: usize,
) -> Vec<PipelineResult> {
    let semaphore = Arc::new(Semaphore::new(max_concurrent.max(1)));
    let mut handles = Vec::with_capacity(kinds.len());

    for &kind in kinds {
        let semaphore = Arc::clone(&semaphore);
        let ctx = ctx.clone();
        handles.push((
            kind,
            tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                info!(pipeline = %kind, "pipeline started");
                let started = Instant::now();
                let outcome = tokio::task::spawn_blocking(move || run_pipeline(kind, &ctx)).await;
                let duration = started.elapsed();
                match outcome {
                    Ok(Ok(files_written)) => PipelineResult {
                        kind,
                        success: true,
                        duration,
                        error: None,
                        files_written,
                    },
                    Ok(Err(e)) => failed(kind, duration, e.to_string()),
                    Err(e) => failed(kind, duration, e.to_string()),
                }
            }),
        ));
    }

    let mut results = Vec::with_capacity(handles.len());
    for (kind, handle) in handles {
        let result = match handle.await {
            Ok(r) => r,
            Err(e) => failed(kind, Duration::ZERO, e.to_string()),
        };
        if result.success {
            info!(
                pipeline = %kind,
                files = result.files_written.len(),
                secs = result.duration.as_secs_f64(),
                "pipeline finished"
            );
        } else {
            error!(
                pipeline = %kind,
                error = result.error.as_deref().unwrap_or(""),
                "pipeline failed"
            );
        }
        results.push(result);
    }
    results
}

fn write_rows<T: serde::Serialize>(path: &Path, rows: &[T]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
    }
    write_csv(path, rows)
}

fn failed(kind: PipelineKind, duration: Duration, error: String) -> PipelineResult {
    PipelineResult {
        kind,
        success: false,
        duration,
        error: Some(error),
        files_written: Vec::new(),
    }
}

/// Output directory of one pipeline.
pub fn pipeline_dir(output_dir: &Path, kind: PipelineKind) -> PathBuf {
    output_dir.join(kind.as_str())
}
