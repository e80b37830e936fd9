//! SQLite cache of registered input files and their analysis results.
//!
//! A cached result is only valid while the file's content hash and mtime
//! match what was stored when it was registered. Re-registering a changed
//! file updates its row and deletes its results in the same transaction.

use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::{Duration, UNIX_EPOCH};

use chrono::{NaiveDateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Transaction, TransactionBehavior};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::aggregate::RecordFilter;
use crate::error::{Error, Result};
use crate::matrix::ConnectivityMatrix;
use crate::metadata::{Metadata, UNKNOWN};
use crate::metrics::{GlobalMetrics, NodalMetric, PairwiseMetrics};

/// Highest schema version this build reads and writes.
pub const SCHEMA_VERSION: i64 = 2;

const BUSY_TIMEOUT: Duration = Duration::from_secs(10);

pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Migration `i` brings the schema from version `i` to `i + 1`.
const MIGRATIONS: [&str; 2] = [
    "
    CREATE TABLE IF NOT EXISTS files (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        file_path TEXT NOT NULL UNIQUE,
        file_hash TEXT NOT NULL,
        file_size INTEGER NOT NULL,
        last_modified_ns INTEGER NOT NULL,
        participant_id TEXT,
        condition TEXT,
        timepoint TEXT,
        group_info TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );
    CREATE TABLE IF NOT EXISTS analysis_results (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        file_id INTEGER NOT NULL,
        analysis_type TEXT NOT NULL,
        connectivity_matrix TEXT NOT NULL,
        global_metrics TEXT NOT NULL,
        electrode_list TEXT NOT NULL,
        analysis_params TEXT NOT NULL,
        created_at TEXT NOT NULL,
        FOREIGN KEY(file_id) REFERENCES files(id) ON DELETE CASCADE,
        UNIQUE(file_id, analysis_type)
    );
    CREATE INDEX IF NOT EXISTS idx_files_participant ON files(participant_id);
    CREATE INDEX IF NOT EXISTS idx_files_condition ON files(condition);
    CREATE INDEX IF NOT EXISTS idx_results_file ON analysis_results(file_id);
    ",
    "
    ALTER TABLE analysis_results ADD COLUMN nodal_metrics TEXT;
    ALTER TABLE analysis_results ADD COLUMN pairwise_metrics TEXT;
    ",
];

/// Content digest of a file. Stored hashes carry the hasher's name as a
/// prefix, so switching hashers invalidates every entry.
pub trait ContentHasher: Send + Sync {
    fn name(&self) -> &str;

    /// Hex digest of everything `reader` yields.
    fn digest(&self, reader: &mut dyn Read) -> std::io::Result<String>;

    fn hash_file(&self, path: &Path) -> Result<String> {
        let mut file = File::open(path).map_err(|e| Error::io(path, e))?;
        let hex = self.digest(&mut file).map_err(|e| Error::io(path, e))?;
        Ok(format!("{}:{hex}", self.name()))
    }

    fn hash_bytes(&self, mut bytes: &[u8]) -> std::io::Result<String> {
        let hex = self.digest(&mut bytes)?;
        Ok(format!("{}:{hex}", self.name()))
    }
}

/// Streamed SHA-256; memory use is bounded by the chunk size.
#[derive(Debug, Clone)]
pub struct Sha256Hasher {
    chunk_size: usize,
}

impl Default for Sha256Hasher {
    fn default() -> Self {
        Self::new(DEFAULT_CHUNK_SIZE)
    }
}

impl Sha256Hasher {
    pub fn new(chunk_size: usize) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
        }
    }
}

impl ContentHasher for Sha256Hasher {
    fn name(&self) -> &str {
        "sha256"
    }

    fn digest(&self, reader: &mut dyn Read) -> std::io::Result<String> {
        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; self.chunk_size];
        loop {
            let n = reader.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        Ok(format!("{:x}", hasher.finalize()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterStatus {
    Inserted,
    Unchanged,
    /// Content changed; `purged` cached results were deleted.
    Updated { purged: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterOutcome {
    pub file_id: i64,
    pub status: RegisterStatus,
}

/// Payload of one cached analysis.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedAnalysis {
    pub matrix: ConnectivityMatrix,
    pub global: GlobalMetrics,
    /// Absent in rows written before schema version 2.
    pub nodal: Option<Vec<NodalMetric>>,
    pub pairwise: Option<PairwiseMetrics>,
    pub params: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FileEntry {
    pub id: i64,
    pub path: PathBuf,
    pub hash: String,
    pub size: i64,
    pub mtime_ns: i64,
    pub metadata: Metadata,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheStats {
    pub total_files: usize,
    pub cached_analyses: usize,
    pub unique_participants: usize,
    pub unique_conditions: usize,
    pub db_size: String,
}

#[derive(Debug, Clone)]
struct FileStamp {
    hash: String,
    size: i64,
    mtime_ns: i64,
}

/// A file's contents read once, together with the stamp of exactly those
/// bytes. Registering it ties cached results to what was actually parsed.
#[derive(Debug, Clone)]
pub struct StampedFile {
    /// Canonical path.
    pub path: PathBuf,
    pub contents: Vec<u8>,
    stamp: FileStamp,
}

impl StampedFile {
    pub fn hash(&self) -> &str {
        &self.stamp.hash
    }
}

pub struct CacheStore {
    conn: Connection,
    hasher: Box<dyn ContentHasher>,
}

impl CacheStore {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
        }
        Self::init(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.pragma_update(None, "foreign_keys", true)?;
        let store = CacheStore {
            conn,
            hasher: Box::new(Sha256Hasher::default()),
        };
        store.migrate()?;
        Ok(store)
    }

    pub fn with_hasher(mut self, hasher: Box<dyn ContentHasher>) -> Self {
        self.hasher = hasher;
        self
    }

    pub fn schema_version(&self) -> Result<i64> {
        Ok(self
            .conn
            .pragma_query_value(None, "user_version", |r| r.get(0))?)
    }

    /// Each step re-reads the version under the write lock, so two processes
    /// opening a fresh cache never apply the same migration twice.
    fn migrate(&self) -> Result<()> {
        loop {
            let tx = self.write_tx()?;
            let current: i64 = tx.pragma_query_value(None, "user_version", |r| r.get(0))?;
            if current > SCHEMA_VERSION {
                return Err(Error::SchemaTooNew {
                    found: current,
                    supported: SCHEMA_VERSION,
                });
            }
            let Some(sql) = MIGRATIONS.get(current as usize) else {
                tx.commit()?;
                return Ok(());
            };
            tx.execute_batch(sql)?;
            tx.pragma_update(None, "user_version", current + 1)?;
            tx.commit()?;
            debug!(version = current + 1, "cache schema migrated");
        }
    }

    fn write_tx(&self) -> Result<Transaction<'_>> {
        Ok(Transaction::new_unchecked(
            &self.conn,
            TransactionBehavior::Immediate,
        )?)
    }

    fn stamp(&self, path: &Path) -> Result<FileStamp> {
        let meta = fs::metadata(path).map_err(|e| Error::io(path, e))?;
        Ok(FileStamp {
            hash: self.hasher.hash_file(path)?,
            size: meta.len() as i64,
            mtime_ns: mtime_ns(path, &meta)?,
        })
    }

    /// Read `path` into memory and stamp those bytes. The mtime is taken
    /// before reading, so a write that lands mid-read leaves a stamp that no
    /// longer matches the file.
    pub fn read_stamped(&self, path: &Path) -> Result<StampedFile> {
        let path = fs::canonicalize(path).map_err(|_| Error::FileNotFound(path.to_path_buf()))?;
        let meta = fs::metadata(&path).map_err(|e| Error::io(&path, e))?;
        let mtime_ns = mtime_ns(&path, &meta)?;
        let contents = fs::read(&path).map_err(|e| Error::io(&path, e))?;
        let hash = self
            .hasher
            .hash_bytes(&contents)
            .map_err(|e| Error::io(&path, e))?;
        Ok(StampedFile {
            stamp: FileStamp {
                hash,
                size: contents.len() as i64,
                mtime_ns,
            },
            path,
            contents,
        })
    }

    /// Record a file and its metadata. Unchanged content is a no-op; changed
    /// content updates the row and purges its cached results.
    pub fn register_file(&self, path: &Path, metadata: &Metadata) -> Result<RegisterOutcome> {
        let path = fs::canonicalize(path).map_err(|_| Error::FileNotFound(path.to_path_buf()))?;
        let stamp = self.stamp(&path)?;
        self.register_with_stamp(&path, &stamp, metadata)
    }

    /// [`register_file`](Self::register_file) with the stamp of contents
    /// already read by [`read_stamped`](Self::read_stamped).
    pub fn register_stamped(
        &self,
        file: &StampedFile,
        metadata: &Metadata,
    ) -> Result<RegisterOutcome> {
        self.register_with_stamp(&file.path, &file.stamp, metadata)
    }

    fn register_with_stamp(
        &self,
        path: &Path,
        stamp: &FileStamp,
        metadata: &Metadata,
    ) -> Result<RegisterOutcome> {
        let key = path_key(path);
        let now = now();

        let tx = self.write_tx()?;
        let existing: Option<(i64, String, i64)> = tx
            .query_row(
                "SELECT id, file_hash, last_modified_ns FROM files WHERE file_path = ?1",
                params![key],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
            )
            .optional()?;

        let outcome = match existing {
            Some((file_id, hash, mtime)) if hash == stamp.hash && mtime == stamp.mtime_ns => {
                RegisterOutcome {
                    file_id,
                    status: RegisterStatus::Unchanged,
                }
            }
            Some((file_id, _, _)) => {
                tx.execute(
                    "UPDATE files SET file_hash = ?1, file_size = ?2, last_modified_ns = ?3,
                        participant_id = ?4, condition = ?5, timepoint = ?6, group_info = ?7,
                        updated_at = ?8
                     WHERE id = ?9",
                    params![
                        stamp.hash,
                        stamp.size,
                        stamp.mtime_ns,
                        metadata.participant_id,
                        metadata.condition,
                        metadata.timepoint,
                        metadata.group,
                        now,
                        file_id
                    ],
                )?;
                let purged = tx.execute(
                    "DELETE FROM analysis_results WHERE file_id = ?1",
                    params![file_id],
                )?;
                info!(path = %path.display(), purged, "file changed, cached results purged");
                RegisterOutcome {
                    file_id,
                    status: RegisterStatus::Updated { purged },
                }
            }
            None => {
                tx.execute(
                    "INSERT INTO files (file_path, file_hash, file_size, last_modified_ns,
                        participant_id, condition, timepoint, group_info, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)",
                    params![
                        key,
                        stamp.hash,
                        stamp.size,
                        stamp.mtime_ns,
                        metadata.participant_id,
                        metadata.condition,
                        metadata.timepoint,
                        metadata.group,
                        now
                    ],
                )?;
                let file_id = tx.last_insert_rowid();
                debug!(path = %path.display(), file_id, "file registered");
                RegisterOutcome {
                    file_id,
                    status: RegisterStatus::Inserted,
                }
            }
        };
        tx.commit()?;
        Ok(outcome)
    }

    /// True only if a result row exists and the file on disk still has the
    /// stored hash and mtime.
    pub fn is_file_cached(&self, path: &Path, analysis_type: &str) -> Result<bool> {
        let path = normalize(path);
        let stored: Option<(String, i64)> = self
            .conn
            .query_row(
                "SELECT f.file_hash, f.last_modified_ns
                 FROM files f JOIN analysis_results ar ON ar.file_id = f.id
                 WHERE f.file_path = ?1 AND ar.analysis_type = ?2",
                params![path_key(&path), analysis_type],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()?;
        let Some((hash, mtime)) = stored else {
            return Ok(false);
        };
        if !path.exists() {
            return Ok(false);
        }
        let stamp = self.stamp(&path)?;
        Ok(stamp.hash == hash && stamp.mtime_ns == mtime)
    }

    /// Insert or replace the result for `(file, analysis_type)`.
    pub fn cache_analysis_result(
        &self,
        path: &Path,
        analysis_type: &str,
        analysis: &CachedAnalysis,
    ) -> Result<()> {
        let path = normalize(path);
        let matrix_json = analysis.matrix.to_index_json()?;
        let global_json = serde_json::to_string(&analysis.global)?;
        let channels_json = serde_json::to_string(analysis.matrix.channels())?;
        let params_json = serde_json::to_string(&analysis.params)?;
        let nodal_json = analysis
            .nodal
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let pairwise_json = analysis
            .pairwise
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        let tx = self.write_tx()?;
        let file_id: Option<i64> = tx
            .query_row(
                "SELECT id FROM files WHERE file_path = ?1",
                params![path_key(&path)],
                |r| r.get(0),
            )
            .optional()?;
        let Some(file_id) = file_id else {
            return Err(Error::NotRegistered(path));
        };
        tx.execute(
            "INSERT INTO analysis_results (file_id, analysis_type, connectivity_matrix,
                global_metrics, electrode_list, analysis_params, nodal_metrics,
                pairwise_metrics, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(file_id, analysis_type) DO UPDATE SET
                connectivity_matrix = excluded.connectivity_matrix,
                global_metrics = excluded.global_metrics,
                electrode_list = excluded.electrode_list,
                analysis_params = excluded.analysis_params,
                nodal_metrics = excluded.nodal_metrics,
                pairwise_metrics = excluded.pairwise_metrics,
                created_at = excluded.created_at",
            params![
                file_id,
                analysis_type,
                matrix_json,
                global_json,
                channels_json,
                params_json,
                nodal_json,
                pairwise_json,
                now()
            ],
        )?;
        tx.commit()?;
        debug!(path = %path.display(), analysis_type, "analysis cached");
        Ok(())
    }

    /// The stored result, without re-checking the file on disk.
    pub fn get_cached_analysis(
        &self,
        path: &Path,
        analysis_type: &str,
    ) -> Result<Option<CachedAnalysis>> {
        type Raw = (String, String, String, String, Option<String>, Option<String>);
        let path = normalize(path);
        let raw: Option<Raw> = self
            .conn
            .query_row(
                "SELECT ar.connectivity_matrix, ar.global_metrics, ar.electrode_list,
                        ar.analysis_params, ar.nodal_metrics, ar.pairwise_metrics
                 FROM analysis_results ar JOIN files f ON ar.file_id = f.id
                 WHERE f.file_path = ?1 AND ar.analysis_type = ?2",
                params![path_key(&path), analysis_type],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?, r.get(5)?)),
            )
            .optional()?;
        let Some((matrix_json, global_json, channels_json, params_json, nodal, pairwise)) = raw
        else {
            return Ok(None);
        };
        let channels: Vec<String> = serde_json::from_str(&channels_json)?;
        Ok(Some(CachedAnalysis {
            matrix: ConnectivityMatrix::from_index_json(&matrix_json, &channels)?,
            global: serde_json::from_str(&global_json)?,
            nodal: nodal.as_deref().map(serde_json::from_str).transpose()?,
            pairwise: pairwise.as_deref().map(serde_json::from_str).transpose()?,
            params: serde_json::from_str(&params_json)?,
        }))
    }

    pub fn get_file_metadata(&self, path: &Path) -> Result<Option<Metadata>> {
        let path = normalize(path);
        let meta = self
            .conn
            .query_row(
                "SELECT participant_id, condition, timepoint, group_info
                 FROM files WHERE file_path = ?1",
                params![path_key(&path)],
                row_metadata(0),
            )
            .optional()?;
        Ok(meta)
    }

    /// Registered files, ordered by participant, condition, timepoint.
    pub fn get_all_files(&self, filter: &RecordFilter) -> Result<Vec<FileEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, file_path, file_hash, file_size, last_modified_ns,
                    participant_id, condition, timepoint, group_info, created_at, updated_at
             FROM files
             WHERE (?1 IS NULL OR condition = ?1)
               AND (?2 IS NULL OR participant_id = ?2)
               AND (?3 IS NULL OR timepoint = ?3)
             ORDER BY participant_id, condition, timepoint, file_path",
        )?;
        let rows = stmt.query_map(
            params![filter.condition, filter.participant, filter.timepoint],
            |row| {
                Ok(FileEntry {
                    id: row.get(0)?,
                    path: PathBuf::from(row.get::<_, String>(1)?),
                    hash: row.get(2)?,
                    size: row.get(3)?,
                    mtime_ns: row.get(4)?,
                    metadata: row_metadata(5)(row)?,
                    created_at: parse_dt(9, &row.get::<_, String>(9)?)?,
                    updated_at: parse_dt(10, &row.get::<_, String>(10)?)?,
                })
            },
        )?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Delete every cached result of one file.
    pub fn clear_file_cache(&self, path: &Path) -> Result<usize> {
        let path = normalize(path);
        let tx = self.write_tx()?;
        let n = tx.execute(
            "DELETE FROM analysis_results
             WHERE file_id IN (SELECT id FROM files WHERE file_path = ?1)",
            params![path_key(&path)],
        )?;
        tx.commit()?;
        Ok(n)
    }

    /// Remove files that no longer exist on disk, results first. Returns the
    /// number of file rows removed.
    pub fn cleanup_orphaned_records(&self) -> Result<usize> {
        let orphaned: Vec<(i64, String)> = {
            let mut stmt = self.conn.prepare("SELECT id, file_path FROM files")?;
            let rows = stmt.query_map([], |r| Ok((r.get(0)?, r.get(1)?)))?;
            rows.collect::<rusqlite::Result<Vec<(i64, String)>>>()?
                .into_iter()
                .filter(|(_, p)| !Path::new(p).exists())
                .collect()
        };
        if orphaned.is_empty() {
            return Ok(0);
        }
        let tx = self.write_tx()?;
        for (id, _) in &orphaned {
            tx.execute("DELETE FROM analysis_results WHERE file_id = ?1", params![id])?;
        }
        for (id, path) in &orphaned {
            tx.execute("DELETE FROM files WHERE id = ?1", params![id])?;
            debug!(path = %path, "orphaned file removed");
        }
        tx.commit()?;
        info!(removed = orphaned.len(), "orphaned cache records cleaned up");
        Ok(orphaned.len())
    }

    pub fn stats(&self) -> Result<CacheStats> {
        let count = |sql: &str| -> rusqlite::Result<usize> {
            self.conn.query_row(sql, [], |r| r.get(0))
        };
        let total_files = count("SELECT COUNT(*) FROM files")?;
        let cached_analyses = count("SELECT COUNT(*) FROM analysis_results")?;
        let unique_participants = count(
            "SELECT COUNT(DISTINCT participant_id) FROM files WHERE participant_id IS NOT NULL",
        )?;
        let unique_conditions =
            count("SELECT COUNT(DISTINCT condition) FROM files WHERE condition IS NOT NULL")?;
        let page_size: i64 = self.conn.query_row("PRAGMA page_size", [], |r| r.get(0))?;
        let page_count: i64 = self.conn.query_row("PRAGMA page_count", [], |r| r.get(0))?;
        let bytes = page_size * page_count;
        let db_size = if bytes > 1_048_576 {
            format!("{:.1} MB", bytes as f64 / 1_048_576.0)
        } else {
            format!("{:.1} KB", bytes as f64 / 1024.0)
        };
        Ok(CacheStats {
            total_files,
            cached_analyses,
            unique_participants,
            unique_conditions,
            db_size,
        })
    }
}

fn row_metadata(start: usize) -> impl Fn(&rusqlite::Row<'_>) -> rusqlite::Result<Metadata> {
    move |row| {
        let field = |i: usize| -> rusqlite::Result<String> {
            Ok(row
                .get::<_, Option<String>>(start + i)?
                .unwrap_or_else(|| UNKNOWN.to_string()))
        };
        Ok(Metadata {
            participant_id: field(0)?,
            condition: field(1)?,
            timepoint: field(2)?,
            group: row.get::<_, Option<String>>(start + 3)?.unwrap_or_default(),
        })
    }
}

/// Absolute form of `path`; canonical when the file exists.
fn normalize(path: &Path) -> PathBuf {
    fs::canonicalize(path).unwrap_or_else(|_| {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            std::env::current_dir()
                .map(|d| d.join(path))
                .unwrap_or_else(|_| path.to_path_buf())
        }
    })
}

fn path_key(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

fn now() -> String {
    Utc::now()
        .naive_utc()
        .format("%Y-%m-%d %H:%M:%S")
        .to_string()
}

fn mtime_ns(path: &Path, meta: &fs::Metadata) -> Result<i64> {
    Ok(meta
        .modified()
        .map_err(|e| Error::io(path, e))?
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0))
}

fn parse_dt(idx: usize, s: &str) -> rusqlite::Result<NaiveDateTime> {
    NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S").map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::MetricsEngine;
    use crate::testutil::write_matrix;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use tempfile::TempDir;

    const TYPE: &str = "granger_causality";

    fn test_store() -> CacheStore {
        CacheStore::open_in_memory().unwrap()
    }

    fn fixture(dir: &TempDir, name: &str) -> PathBuf {
        write_matrix(
            dir.path(),
            name,
            &["Pz", "Fz", "Cz"],
            &[
                &[0.0, 0.1 + 0.2, 0.000123456789],
                &[1e-17, 0.0, 0.7],
                &[0.5, 0.25, 0.0],
            ],
        )
    }

    fn analysis_for(path: &Path) -> CachedAnalysis {
        let matrix = crate::matrix::read_matrix_file(path).unwrap();
        let metrics = MetricsEngine::default().analyze(&matrix);
        CachedAnalysis {
            matrix,
            global: metrics.global,
            nodal: Some(metrics.nodal),
            pairwise: Some(metrics.pairwise),
            params: json!({ "density_thresholds": [0.0001, 0.0005, 0.001] }),
        }
    }

    #[test]
    fn test_schema_version_after_open() {
        assert_eq!(test_store().schema_version().unwrap(), SCHEMA_VERSION);
    }

    #[test]
    fn test_register_new_and_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = fixture(&dir, "1_rest.csv");
        let store = test_store();
        let meta = Metadata::new("1", "rest", "T1");

        let first = store.register_file(&path, &meta).unwrap();
        assert_eq!(first.status, RegisterStatus::Inserted);
        store
            .cache_analysis_result(&path, TYPE, &analysis_for(&path))
            .unwrap();

        let second = store.register_file(&path, &meta).unwrap();
        assert_eq!(second.file_id, first.file_id);
        assert_eq!(second.status, RegisterStatus::Unchanged);
        let stats = store.stats().unwrap();
        assert_eq!(stats.total_files, 1);
        assert_eq!(stats.cached_analyses, 1);
        assert!(store.is_file_cached(&path, TYPE).unwrap());
    }

    #[test]
    fn test_register_missing_file() {
        let store = test_store();
        let err = store
            .register_file(Path::new("/no/such/file.csv"), &Metadata::default())
            .unwrap_err();
        assert!(matches!(err, Error::FileNotFound(_)));
    }

    #[test]
    fn test_cache_round_trip_is_exact() {
        let dir = tempfile::tempdir().unwrap();
        let path = fixture(&dir, "1_rest.csv");
        let store = test_store();
        store
            .register_file(&path, &Metadata::new("1", "rest", "T1"))
            .unwrap();
        let original = analysis_for(&path);
        store.cache_analysis_result(&path, TYPE, &original).unwrap();

        let cached = store.get_cached_analysis(&path, TYPE).unwrap().unwrap();
        assert_eq!(cached.matrix.channels(), ["Pz", "Fz", "Cz"]);
        assert_eq!(cached, original);
        assert_eq!(cached.matrix.value("Pz", "Fz"), Some(0.1 + 0.2));
    }

    #[test]
    fn test_upsert_replaces_result() {
        let dir = tempfile::tempdir().unwrap();
        let path = fixture(&dir, "1_rest.csv");
        let store = test_store();
        store.register_file(&path, &Metadata::default()).unwrap();
        let mut analysis = analysis_for(&path);
        store.cache_analysis_result(&path, TYPE, &analysis).unwrap();
        analysis.params = json!({ "run": 2 });
        store.cache_analysis_result(&path, TYPE, &analysis).unwrap();
        assert_eq!(store.stats().unwrap().cached_analyses, 1);
        let cached = store.get_cached_analysis(&path, TYPE).unwrap().unwrap();
        assert_eq!(cached.params, json!({ "run": 2 }));
    }

    #[test]
    fn test_cache_unregistered_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = fixture(&dir, "1_rest.csv");
        let store = test_store();
        let err = store
            .cache_analysis_result(&path, TYPE, &analysis_for(&path))
            .unwrap_err();
        assert!(matches!(err, Error::NotRegistered(_)));
    }

    #[test]
    fn test_content_change_invalidates_and_purges() {
        let dir = tempfile::tempdir().unwrap();
        let path = fixture(&dir, "1_rest.csv");
        let store = test_store();
        let meta = Metadata::new("1", "rest", "T1");
        store.register_file(&path, &meta).unwrap();
        store
            .cache_analysis_result(&path, TYPE, &analysis_for(&path))
            .unwrap();
        assert!(store.is_file_cached(&path, TYPE).unwrap());

        write_matrix(
            dir.path(),
            "1_rest.csv",
            &["Pz", "Fz", "Cz"],
            &[&[0.0, 0.9, 0.0], &[0.0, 0.0, 0.0], &[0.0, 0.0, 0.0]],
        );
        assert!(!store.is_file_cached(&path, TYPE).unwrap());
        // the stale row is still there until re-registration
        assert!(store.get_cached_analysis(&path, TYPE).unwrap().is_some());

        let outcome = store.register_file(&path, &meta).unwrap();
        assert_eq!(outcome.status, RegisterStatus::Updated { purged: 1 });
        assert!(store.get_cached_analysis(&path, TYPE).unwrap().is_none());
        assert_eq!(store.stats().unwrap().total_files, 1);
    }

    #[test]
    fn test_mtime_only_change_invalidates() {
        let dir = tempfile::tempdir().unwrap();
        let path = fixture(&dir, "1_rest.csv");
        let store = test_store();
        let meta = Metadata::new("1", "rest", "T1");
        store.register_file(&path, &meta).unwrap();
        store
            .cache_analysis_result(&path, TYPE, &analysis_for(&path))
            .unwrap();
        let contents = fs::read(&path).unwrap();

        let file = File::options().write(true).open(&path).unwrap();
        file.set_modified(UNIX_EPOCH + Duration::from_secs(1_000_000_000))
            .unwrap();
        drop(file);
        assert_eq!(fs::read(&path).unwrap(), contents);

        assert!(!store.is_file_cached(&path, TYPE).unwrap());
        let outcome = store.register_file(&path, &meta).unwrap();
        assert_eq!(outcome.status, RegisterStatus::Updated { purged: 1 });
    }

    #[test]
    fn test_read_stamped_matches_register_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = fixture(&dir, "1_rest.csv");
        let store = test_store();
        let file = store.read_stamped(&path).unwrap();
        assert_eq!(file.contents, fs::read(&path).unwrap());
        assert_eq!(file.path, fs::canonicalize(&path).unwrap());

        let meta = Metadata::new("1", "rest", "T1");
        let first = store.register_stamped(&file, &meta).unwrap();
        assert_eq!(first.status, RegisterStatus::Inserted);
        let second = store.register_file(&path, &meta).unwrap();
        assert_eq!(second.status, RegisterStatus::Unchanged);
        let entry = &store.get_all_files(&RecordFilter::all()).unwrap()[0];
        assert_eq!(entry.hash, file.hash());
        assert_eq!(entry.size, file.contents.len() as i64);
    }

    #[test]
    fn test_read_stamped_missing_file() {
        let err = test_store()
            .read_stamped(Path::new("/no/such/file.csv"))
            .unwrap_err();
        assert!(matches!(err, Error::FileNotFound(_)));
    }

    #[test]
    fn test_corrupt_timestamp_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = fixture(&dir, "1_rest.csv");
        let store = test_store();
        store.register_file(&path, &Metadata::default()).unwrap();
        store
            .conn
            .execute("UPDATE files SET updated_at = 'yesterday'", [])
            .unwrap();
        let err = store.get_all_files(&RecordFilter::all()).unwrap_err();
        assert!(matches!(
            err,
            Error::Database(rusqlite::Error::FromSqlConversionFailure(10, _, _))
        ));
    }

    #[test]
    fn test_is_file_cached_requires_result_row() {
        let dir = tempfile::tempdir().unwrap();
        let path = fixture(&dir, "1_rest.csv");
        let store = test_store();
        store.register_file(&path, &Metadata::default()).unwrap();
        assert!(!store.is_file_cached(&path, TYPE).unwrap());
        assert!(!store.is_file_cached(&path, "other").unwrap());
    }

    #[test]
    fn test_cleanup_orphaned_records() {
        let dir = tempfile::tempdir().unwrap();
        let keep = fixture(&dir, "1_rest.csv");
        let gone = fixture(&dir, "2_rest.csv");
        let store = test_store();
        for p in [&keep, &gone] {
            store.register_file(p, &Metadata::default()).unwrap();
            store.cache_analysis_result(p, TYPE, &analysis_for(p)).unwrap();
        }
        fs::remove_file(&gone).unwrap();

        assert_eq!(store.cleanup_orphaned_records().unwrap(), 1);
        let stats = store.stats().unwrap();
        assert_eq!(stats.total_files, 1);
        assert_eq!(stats.cached_analyses, 1);
        assert!(!store.is_file_cached(&gone, TYPE).unwrap());
        assert_eq!(store.cleanup_orphaned_records().unwrap(), 0);
    }

    #[test]
    fn test_get_all_files_filter_and_order() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store();
        let files = [("a.csv", "2", "rest"), ("b.csv", "1", "task"), ("c.csv", "1", "rest")];
        for (name, p, c) in files {
            let path = fixture(&dir, name);
            store.register_file(&path, &Metadata::new(p, c, "T1")).unwrap();
        }
        let all = store.get_all_files(&RecordFilter::all()).unwrap();
        let order: Vec<(&str, &str)> = all
            .iter()
            .map(|f| (f.metadata.participant_id.as_str(), f.metadata.condition.as_str()))
            .collect();
        assert_eq!(order, vec![("1", "rest"), ("1", "task"), ("2", "rest")]);
        assert!(all[0].hash.starts_with("sha256:"));

        let rest = store
            .get_all_files(&RecordFilter::all().condition("rest"))
            .unwrap();
        assert_eq!(rest.len(), 2);
        let stats = store.stats().unwrap();
        assert_eq!(stats.unique_participants, 2);
        assert_eq!(stats.unique_conditions, 2);
        assert!(stats.db_size.ends_with("KB"));
    }

    #[test]
    fn test_file_metadata_and_clear() {
        let dir = tempfile::tempdir().unwrap();
        let path = fixture(&dir, "1_rest.csv");
        let store = test_store();
        let meta = Metadata::new("1", "rest", "T1").with_group("2");
        store.register_file(&path, &meta).unwrap();
        assert_eq!(store.get_file_metadata(&path).unwrap(), Some(meta));
        assert_eq!(
            store.get_file_metadata(&dir.path().join("x.csv")).unwrap(),
            None
        );

        store
            .cache_analysis_result(&path, TYPE, &analysis_for(&path))
            .unwrap();
        assert_eq!(store.clear_file_cache(&path).unwrap(), 1);
        assert!(!store.is_file_cached(&path, TYPE).unwrap());
    }

    #[test]
    fn test_hash_independent_of_chunk_size() {
        let data = b"0.1,0.2,0.3\n".repeat(1000);
        let small = Sha256Hasher::new(7).digest(&mut &data[..]).unwrap();
        let large = Sha256Hasher::new(1 << 20).digest(&mut &data[..]).unwrap();
        assert_eq!(small, large);
        assert_eq!(small.len(), 64);
    }

    #[test]
    fn test_migrates_v1_database() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("cache.db");
        let input = fixture(&dir, "1_rest.csv");
        let canonical = fs::canonicalize(&input).unwrap();
        {
            let conn = Connection::open(&db).unwrap();
            conn.execute_batch(MIGRATIONS[0]).unwrap();
            conn.pragma_update(None, "user_version", 1).unwrap();
            conn.execute(
                "INSERT INTO files (file_path, file_hash, file_size, last_modified_ns,
                    created_at, updated_at) VALUES (?1, 'sha256:x', 1, 1, ?2, ?2)",
                params![path_key(&canonical), now()],
            )
            .unwrap();
            let matrix = crate::matrix::read_matrix_file(&input).unwrap();
            let global = MetricsEngine::default().analyze(&matrix).global;
            conn.execute(
                "INSERT INTO analysis_results (file_id, analysis_type, connectivity_matrix,
                    global_metrics, electrode_list, analysis_params, created_at)
                 VALUES (1, ?1, ?2, ?3, ?4, '{}', ?5)",
                params![
                    TYPE,
                    matrix.to_index_json().unwrap(),
                    serde_json::to_string(&global).unwrap(),
                    serde_json::to_string(matrix.channels()).unwrap(),
                    now()
                ],
            )
            .unwrap();
        }

        let store = CacheStore::open(&db).unwrap();
        assert_eq!(store.schema_version().unwrap(), 2);
        let cached = store.get_cached_analysis(&input, TYPE).unwrap().unwrap();
        assert!(cached.nodal.is_none());
        assert!(cached.pairwise.is_none());
        assert_eq!(store.get_file_metadata(&input).unwrap(), Some(Metadata::default()));
    }

    #[test]
    fn test_rejects_newer_schema() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("cache.db");
        {
            let conn = Connection::open(&db).unwrap();
            conn.pragma_update(None, "user_version", 99).unwrap();
        }
        match CacheStore::open(&db) {
            Err(Error::SchemaTooNew { found, supported }) => {
                assert_eq!(found, 99);
                assert_eq!(supported, SCHEMA_VERSION);
            }
            Err(e) => panic!("unexpected error: {e}"),
            Ok(_) => panic!("expected SchemaTooNew"),
        }
    }
}
