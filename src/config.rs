use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Path to the analysis cache database.
    #[serde(default = "default_cache_path")]
    pub cache_path: String,

    #[serde(default)]
    pub analysis: AnalysisConfig,

    #[serde(default)]
    pub batch: BatchConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisConfig {
    /// Key under which results are cached.
    #[serde(default = "default_analysis_type")]
    pub analysis_type: String,

    /// Network density is reported at each of these, in order.
    #[serde(default = "default_density_thresholds")]
    pub density_thresholds: Vec<f64>,

    /// Edge threshold for network graphs.
    #[serde(default = "default_network_threshold")]
    pub network_threshold: f64,

    /// Input file extensions (case-insensitive).
    #[serde(default = "default_input_extensions")]
    pub input_extensions: Vec<String>,

    /// Read buffer size when hashing input files (bytes).
    #[serde(default = "default_hash_chunk_size")]
    pub hash_chunk_size: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchConfig {
    /// Maximum pipelines running at once.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,

    #[serde(default = "default_output_dir")]
    pub output_dir: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive; `RUST_LOG` takes precedence.
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub format: LogFormat,
}

// ── defaults ──

fn default_cache_path() -> String {
    "granger_cache.db".to_string()
}
fn default_analysis_type() -> String {
    crate::loader::GRANGER_CAUSALITY.to_string()
}
fn default_density_thresholds() -> Vec<f64> {
    crate::metrics::DEFAULT_DENSITY_THRESHOLDS.to_vec()
}
fn default_network_threshold() -> f64 {
    0.0005
}
fn default_input_extensions() -> Vec<String> {
    ["csv", "tsv", "xlsx", "xls"]
        .into_iter()
        .map(String::from)
        .collect()
}
fn default_hash_chunk_size() -> usize {
    crate::db::DEFAULT_CHUNK_SIZE
}
fn default_max_concurrent() -> usize {
    2
}
fn default_output_dir() -> String {
    "output".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cache_path: default_cache_path(),
            analysis: AnalysisConfig::default(),
            batch: BatchConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            analysis_type: default_analysis_type(),
            density_thresholds: default_density_thresholds(),
            network_threshold: default_network_threshold(),
            input_extensions: default_input_extensions(),
            hash_chunk_size: default_hash_chunk_size(),
        }
    }
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            output_dir: default_output_dir(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

impl Config {
    /// Default config file path: `~/.gcnet/config.toml`.
    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".gcnet")
            .join("config.toml")
    }

    /// Load config from the default path, falling back to defaults if the file
    /// does not exist.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::default_path())
    }

    /// Load config from an explicit path (falls back to defaults when missing).
    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("reading config {}", path.display()))?;
            let cfg: Config =
                toml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
            Ok(cfg)
        } else {
            Ok(Config::default())
        }
    }

    /// Write the default config to `path`, creating the directory if needed.
    pub fn write_default_to(path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let text =
            toml::to_string_pretty(&Config::default()).context("serialising default config")?;
        std::fs::write(path, &text).with_context(|| format!("writing {}", path.display()))?;
        Ok(())
    }

    /// Write the default config to `~/.gcnet/config.toml`. Returns the path
    /// written.
    pub fn write_default() -> Result<PathBuf> {
        let path = Self::default_path();
        Self::write_default_to(&path)?;
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_round_trips() {
        let cfg = Config::default();
        let text = toml::to_string_pretty(&cfg).unwrap();
        let parsed: Config = toml::from_str(&text).unwrap();
        assert_eq!(parsed, cfg);
    }

    #[test]
    fn missing_file_gives_defaults() {
        let cfg = Config::load_from(Path::new("/tmp/__gcnet_nonexistent__")).unwrap();
        assert_eq!(cfg.batch.max_concurrent, 2);
        assert_eq!(cfg.analysis.density_thresholds, vec![0.0001, 0.0005, 0.001]);
        assert_eq!(
            cfg.analysis.input_extensions,
            vec!["csv", "tsv", "xlsx", "xls"]
        );
    }

    #[test]
    fn partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "cache_path = \"/data/cache.db\"\n[logging]\nformat = \"json\"\n",
        )
        .unwrap();
        let cfg = Config::load_from(&path).unwrap();
        assert_eq!(cfg.cache_path, "/data/cache.db");
        assert_eq!(cfg.logging.format, LogFormat::Json);
        assert_eq!(cfg.logging.level, "info");
        assert_eq!(cfg.analysis.analysis_type, "granger_causality");
    }

    #[test]
    fn write_default_creates_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        Config::write_default_to(&path).unwrap();
        assert_eq!(Config::load_from(&path).unwrap(), Config::default());
    }

    #[test]
    fn invalid_toml_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "cache_path = [").unwrap();
        let err = Config::load_from(&path).unwrap_err();
        assert!(format!("{err:#}").contains("parsing"));
    }
}
