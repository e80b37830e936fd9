use anyhow::Context;
use clap::{Parser, Subcommand};
use gcnet::aggregate::RecordFilter;
use gcnet::batch::{run_pipelines, PipelineContext, PipelineKind};
use gcnet::config::{Config, LogFormat, LoggingConfig};
use gcnet::db::{CacheStore, Sha256Hasher};
use gcnet::export::{comparison_to_json, export_tables_to_csv, to_graphml, write_text};
use gcnet::loader::{BatchReport, CachedLoader};
use gcnet::metadata::MetadataExtractor;
use gcnet::metrics::MetricsEngine;
use gcnet::query;
use gcnet::registry::{AnalysisRegistry, RecordingKey};
use gcnet::tables::{GroupBy, TableFilter};
use std::path::{Path, PathBuf};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(
    name = "gcnet",
    version,
    about = "Directed connectivity metrics for Granger-causality matrices."
)]
struct Cli {
    /// Path to the cache database (overrides the config file)
    #[arg(long)]
    db: Option<PathBuf>,

    /// Config file path
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load a directory of matrices through the cache and print per-recording metrics
    Analyze {
        input: PathBuf,
        /// Recompute even when a valid cache entry exists
        #[arg(long)]
        force: bool,
        /// Also write combined/group tables as CSV into this directory
        #[arg(long)]
        tables: Option<PathBuf>,
        /// Partition the exported tables (condition, timepoint, participant, condition_timepoint)
        #[arg(long)]
        groupby: Option<GroupBy>,
    },
    /// Group statistics over a filtered set of recordings
    Group {
        input: PathBuf,
        #[arg(long)]
        condition: Option<String>,
        #[arg(long)]
        timepoint: Option<String>,
        #[arg(long)]
        participant: Option<String>,
    },
    /// Compare two conditions, optionally at one timepoint
    CompareConditions {
        input: PathBuf,
        baseline: String,
        other: String,
        #[arg(long)]
        timepoint: Option<String>,
        /// Write the full comparison as JSON
        #[arg(long)]
        json: Option<PathBuf>,
    },
    /// Compare two timepoints, optionally within one condition
    CompareTimepoints {
        input: PathBuf,
        baseline: String,
        other: String,
        #[arg(long)]
        condition: Option<String>,
        /// Write the full comparison as JSON
        #[arg(long)]
        json: Option<PathBuf>,
    },
    /// Thresholded network graph of one recording
    Graph {
        input: PathBuf,
        participant: String,
        condition: String,
        timepoint: String,
        /// Edge threshold (defaults to the configured network threshold)
        #[arg(long)]
        threshold: Option<f64>,
        /// Write the graph as GraphML
        #[arg(long)]
        graphml: Option<PathBuf>,
    },
    /// Run output pipelines concurrently
    Batch {
        input: PathBuf,
        /// Output directory (defaults to the configured one)
        #[arg(long)]
        output: Option<PathBuf>,
        /// Comma-separated pipelines (global, nodal, pairwise, network, tables)
        #[arg(long, value_delimiter = ',')]
        pipelines: Vec<PipelineKind>,
        /// Maximum pipelines running at once
        #[arg(long)]
        max_concurrent: Option<usize>,
        #[arg(long)]
        force: bool,
    },
    /// List registered files
    Files {
        #[arg(long)]
        condition: Option<String>,
        #[arg(long)]
        timepoint: Option<String>,
        #[arg(long)]
        participant: Option<String>,
    },
    /// Show cache statistics
    Stats,
    /// Drop cache rows of files that no longer exist, or all results of one file
    Cleanup {
        #[arg(long)]
        file: Option<PathBuf>,
    },
    /// Show the metadata extracted from a filename
    Metadata { filename: String },
    /// Generate default config at ~/.gcnet/config.toml
    Init,
}

fn initialize_tracing(logging: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));
    let registry = tracing_subscriber::registry().with(filter);
    match logging.format {
        LogFormat::Json => registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init(),
        LogFormat::Pretty => registry
            .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
            .init(),
    }
}

fn open_store(cfg: &Config, db_path: &Path) -> anyhow::Result<CacheStore> {
    let store = CacheStore::open(db_path)
        .with_context(|| format!("opening cache {}", db_path.display()))?;
    Ok(store.with_hasher(Box::new(Sha256Hasher::new(cfg.analysis.hash_chunk_size))))
}

/// Cached load of every input file in `input` into a fresh registry.
fn load(
    cfg: &Config,
    db_path: &Path,
    input: &Path,
    force: bool,
) -> anyhow::Result<(AnalysisRegistry, BatchReport)> {
    let engine = MetricsEngine::new(cfg.analysis.density_thresholds.clone());
    let store = open_store(cfg, db_path)?;
    let loader = CachedLoader::new(store, cfg.analysis.analysis_type.as_str(), &engine);
    let mut registry = AnalysisRegistry::new(engine);
    let report = loader
        .load_directory(&mut registry, input, &cfg.analysis.input_extensions, force)
        .with_context(|| format!("loading {}", input.display()))?;
    for line in query::report_lines(&report) {
        println!("   {line}");
    }
    Ok((registry, report))
}

fn print_lines(lines: Vec<String>) {
    for line in lines {
        println!("  {line}");
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Handle init before loading config (it creates the config file).
    if matches!(cli.command, Commands::Init) {
        let path = Config::write_default()?;
        println!("✅ Default config written to {}", path.display());
        return Ok(());
    }

    let cfg = match &cli.config {
        Some(p) => Config::load_from(p)?,
        None => Config::load()?,
    };
    initialize_tracing(&cfg.logging);
    let db_path = cli
        .db
        .clone()
        .unwrap_or_else(|| PathBuf::from(&cfg.cache_path));

    match cli.command {
        Commands::Analyze {
            input,
            force,
            tables,
            groupby,
        } => {
            println!("🧠 Analyzing {}", input.display());
            let (registry, _) = load(&cfg, &db_path, &input, force)?;
            if registry.is_empty() {
                println!("🤷 No recordings loaded.");
                return Ok(());
            }
            for record in registry.records() {
                println!();
                print_lines(query::record_lines(record));
            }
            if let Some(dir) = tables {
                let filter = TableFilter::default();
                if let Some(named) = registry.create_group_tables(groupby, &filter) {
                    let saved = export_tables_to_csv(&named, &dir)?;
                    println!("\n💾 Wrote {} tables to {}", saved.len(), dir.display());
                }
            }
        }
        Commands::Group {
            input,
            condition,
            timepoint,
            participant,
        } => {
            let (registry, _) = load(&cfg, &db_path, &input, false)?;
            let filter = RecordFilter {
                condition,
                timepoint,
                participant,
            };
            match registry.get_group_statistics(&filter) {
                Ok(stats) => {
                    println!("📊 Group statistics:\n");
                    print_lines(query::group_lines(&stats));
                }
                Err(e) => println!("🤷 {e}"),
            }
        }
        Commands::CompareConditions {
            input,
            baseline,
            other,
            timepoint,
            json,
        } => {
            let (registry, _) = load(&cfg, &db_path, &input, false)?;
            match registry.get_condition_comparison(&baseline, &other, timepoint.as_deref()) {
                Ok(cmp) => {
                    println!("⚖️  Comparison:\n");
                    print_lines(query::comparison_lines(&cmp));
                    if let Some(path) = json {
                        write_text(&path, &comparison_to_json(&cmp)?)?;
                        println!("\n💾 Saved {}", path.display());
                    }
                }
                Err(e) => println!("🤷 {e}"),
            }
        }
        Commands::CompareTimepoints {
            input,
            baseline,
            other,
            condition,
            json,
        } => {
            let (registry, _) = load(&cfg, &db_path, &input, false)?;
            match registry.get_timepoint_comparison(&baseline, &other, condition.as_deref()) {
                Ok(cmp) => {
                    println!("⚖️  Comparison:\n");
                    print_lines(query::comparison_lines(&cmp));
                    if let Some(path) = json {
                        write_text(&path, &comparison_to_json(&cmp)?)?;
                        println!("\n💾 Saved {}", path.display());
                    }
                }
                Err(e) => println!("🤷 {e}"),
            }
        }
        Commands::Graph {
            input,
            participant,
            condition,
            timepoint,
            threshold,
            graphml,
        } => {
            let (registry, _) = load(&cfg, &db_path, &input, false)?;
            let key = RecordingKey::new(participant, condition, timepoint);
            let threshold = threshold.unwrap_or(cfg.analysis.network_threshold);
            let graph = registry.create_network_graph(&key, threshold)?;
            println!("🕸️  Network of {key}:\n");
            print_lines(query::graph_lines(&graph));
            if let Some(path) = graphml {
                write_text(&path, &to_graphml(&graph, &key.to_string()))?;
                println!("\n💾 Saved {}", path.display());
            }
        }
        Commands::Batch {
            input,
            output,
            pipelines,
            max_concurrent,
            force,
        } => {
            let kinds = if pipelines.is_empty() {
                PipelineKind::ALL.to_vec()
            } else {
                pipelines
            };
            let ctx = PipelineContext {
                input_dir: input,
                output_dir: output.unwrap_or_else(|| PathBuf::from(&cfg.batch.output_dir)),
                cache_path: db_path,
                analysis_type: cfg.analysis.analysis_type.clone(),
                thresholds: cfg.analysis.density_thresholds.clone(),
                network_threshold: cfg.analysis.network_threshold,
                extensions: cfg.analysis.input_extensions.clone(),
                hash_chunk_size: cfg.analysis.hash_chunk_size,
                force_reload: force,
            };
            let cap = max_concurrent.unwrap_or(cfg.batch.max_concurrent);
            println!("🚀 Running {} pipelines (max {cap} at once)...", kinds.len());
            let results = run_pipelines(&kinds, &ctx, cap).await;
            println!();
            print_lines(query::pipeline_lines(&results));
            if results.iter().any(|r| !r.success) {
                anyhow::bail!("some pipelines failed");
            }
        }
        Commands::Files {
            condition,
            timepoint,
            participant,
        } => {
            let store = open_store(&cfg, &db_path)?;
            let files = store.get_all_files(&RecordFilter {
                condition,
                timepoint,
                participant,
            })?;
            if files.is_empty() {
                println!("🤷 No files registered yet. Try `gcnet analyze <dir>`!");
            } else {
                println!("📁 Registered files:\n");
                print_lines(query::file_lines(&files));
            }
        }
        Commands::Stats => {
            let stats = open_store(&cfg, &db_path)?.stats()?;
            println!("🗄️  Cache Statistics:\n");
            print_lines(query::stats_lines(&stats));
        }
        Commands::Cleanup { file } => {
            let store = open_store(&cfg, &db_path)?;
            match file {
                Some(path) => {
                    let n = store.clear_file_cache(&path)?;
                    println!("🧹 Cleared {n} cached results for {}", path.display());
                }
                None => {
                    let n = store.cleanup_orphaned_records()?;
                    println!("🧹 Removed {n} orphaned files");
                }
            }
        }
        Commands::Metadata { filename } => {
            let (meta, rule) = MetadataExtractor::default().extract_with_rule(&filename);
            println!("🏷️  {filename}:\n");
            println!("  Participant: {}", meta.participant_id);
            println!("  Condition:   {}", meta.condition);
            println!("  Timepoint:   {}", meta.timepoint);
            if !meta.group.is_empty() {
                println!("  Group:       {}", meta.group);
            }
            println!("  Rule:        {}", rule.unwrap_or("none"));
        }
        Commands::Init => unreachable!(),
    }
    Ok(())
}
