//! SQLite-backed persistence of per-brand execution records.

use async_trait::async_trait;
use rusqlite::{params, Connection};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::engine::hooks::{PersistenceSink, RecordMetadata, SinkError};
use crate::engine::trace::now_epoch_ms;
use crate::engine::RawOutcome;

/// One saved (execution, brand) row.
#[derive(Debug, Clone)]
pub struct BrandRecord {
    pub execution_id: String,
    pub brand: String,
    pub outcomes: Vec<RawOutcome>,
    pub metadata: RecordMetadata,
    pub success_count: usize,
    pub updated_at_ms: i64,
}

#[derive(Debug, thiserror::Error)]
pub enum RecordError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("record store lock poisoned")]
    Poisoned,
    #[error("task join error: {0}")]
    Join(String),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl From<RecordError> for SinkError {
    fn from(err: RecordError) -> Self {
        match err {
            RecordError::Serde(e) => SinkError::Serde(e),
            other => SinkError::Storage(other.to_string()),
        }
    }
}

#[derive(Clone)]
pub struct SqliteRecordSink {
    path: PathBuf,
    conn: Arc<Mutex<Connection>>,
}

impl SqliteRecordSink {
    pub fn new(path: impl AsRef<Path>) -> Result<Self, RecordError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let conn = Connection::open(&path)?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;\
             PRAGMA synchronous=NORMAL;\
             CREATE TABLE IF NOT EXISTS brand_records (\
               execution_id TEXT NOT NULL,\
               brand TEXT NOT NULL,\
               outcomes_json TEXT NOT NULL,\
               metadata_json TEXT NOT NULL,\
               outcome_count INTEGER NOT NULL,\
               success_count INTEGER NOT NULL,\
               created_at INTEGER NOT NULL,\
               updated_at INTEGER NOT NULL,\
               PRIMARY KEY (execution_id, brand)\
             );",
        )?;
        Ok(Self {
            path,
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn with_conn<F, R>(&self, f: F) -> Result<R, RecordError>
    where
        F: FnOnce(&Connection) -> Result<R, RecordError>,
    {
        let guard = self.conn.lock().map_err(|_| RecordError::Poisoned)?;
        f(&guard)
    }

    /// All brand records of one execution, ordered by brand.
    pub async fn load_execution(&self, execution_id: &str) -> Result<Vec<BrandRecord>, RecordError> {
        let execution_id = execution_id.to_string();
        let conn = self.clone();
        tokio::task::spawn_blocking(move || {
            conn.with_conn(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT execution_id, brand, outcomes_json, metadata_json, success_count, updated_at \
                     FROM brand_records WHERE execution_id = ?1 ORDER BY brand",
                )?;
                let mut rows = stmt.query(params![execution_id])?;
                let mut records = Vec::new();
                while let Some(row) = rows.next()? {
                    let outcomes_json: String = row.get(2)?;
                    let metadata_json: String = row.get(3)?;
                    records.push(BrandRecord {
                        execution_id: row.get(0)?,
                        brand: row.get(1)?,
                        outcomes: serde_json::from_str(&outcomes_json)?,
                        metadata: serde_json::from_str(&metadata_json)?,
                        success_count: row.get::<_, i64>(4)? as usize,
                        updated_at_ms: row.get(5)?,
                    });
                }
                Ok(records)
            })
        })
        .await
        .map_err(|e| RecordError::Join(e.to_string()))?
    }
}

#[async_trait]
impl PersistenceSink for SqliteRecordSink {
    async fn save_record(
        &self,
        execution_id: &str,
        brand: &str,
        outcomes: &[RawOutcome],
        metadata: &RecordMetadata,
    ) -> Result<(), SinkError> {
        let outcomes_json = serde_json::to_string(outcomes)?;
        let metadata_json = serde_json::to_string(metadata)?;
        let outcome_count = outcomes.len() as i64;
        let success_count = outcomes.iter().filter(|o| o.success).count() as i64;
        let execution_id = execution_id.to_string();
        let brand = brand.to_string();
        let conn = self.clone();

        let saved = tokio::task::spawn_blocking(move || {
            conn.with_conn(|conn| {
                let now = now_epoch_ms();
                conn.execute(
                    "INSERT INTO brand_records ( \
                        execution_id, brand, outcomes_json, metadata_json,\
                        outcome_count, success_count, created_at, updated_at\
                     ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8) \
                     ON CONFLICT(execution_id, brand) DO UPDATE SET \
                        outcomes_json = excluded.outcomes_json,\
                        metadata_json = excluded.metadata_json,\
                        outcome_count = excluded.outcome_count,\
                        success_count = excluded.success_count,\
                        updated_at = excluded.updated_at",
                    params![
                        execution_id,
                        brand,
                        outcomes_json,
                        metadata_json,
                        outcome_count,
                        success_count,
                        now,
                        now,
                    ],
                )?;
                Ok(())
            })
        })
        .await
        .map_err(|e| RecordError::Join(e.to_string()))?;
        saved.map_err(SinkError::from)
    }
}
