use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use rusqlite::{params, Connection, OpenFlags};
use thiserror::Error;

use crate::platform::RawRecord;
use crate::sqlite::configure_connection;

const RESULTS_SCHEMA: &str = include_str!("../../sql/results.sql");

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("failed to open results database {path}: {source}")]
    Open {
        source: rusqlite::Error,
        path: PathBuf,
    },
    #[error("results database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("failed to encode record fields: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type SinkResult<T> = Result<T, SinkError>;

/// Persistence collaborator for extracted records.
#[async_trait]
pub trait ResultSink: Send + Sync {
    async fn save(&self, job_id: &str, platform_id: &str, records: &[RawRecord]) -> SinkResult<()>;
}

#[derive(Debug, Clone)]
pub struct SqliteResultSink {
    path: PathBuf,
    flags: OpenFlags,
}

impl SqliteResultSink {
    pub fn new(path: impl AsRef<Path>) -> SinkResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let sink = Self {
            path,
            flags: OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE,
        };
        let conn = sink.open()?;
        conn.execute_batch(RESULTS_SCHEMA)?;
        Ok(sink)
    }

    fn open(&self) -> SinkResult<Connection> {
        let conn = Connection::open_with_flags(&self.path, self.flags).map_err(|source| {
            SinkError::Open {
                source,
                path: self.path.clone(),
            }
        })?;
        configure_connection(&conn).map_err(|source| SinkError::Open {
            source,
            path: self.path.clone(),
        })?;
        Ok(conn)
    }

    pub fn count_for_job(&self, job_id: &str) -> SinkResult<i64> {
        let conn = self.open()?;
        let count = conn.query_row(
            "SELECT COUNT(*) FROM extracted_records WHERE job_id = ?1",
            params![job_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    fn save_blocking(&self, job_id: &str, platform_id: &str, records: &[RawRecord]) -> SinkResult<()> {
        let mut conn = self.open()?;
        let tx = conn.transaction()?;
        let stored_at = Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true);
        {
            let mut stmt = tx.prepare(
                "INSERT INTO extracted_records (job_id, platform_id, kind, external_id, fields, stored_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )?;
            for record in records {
                let fields = serde_json::to_string(&record.fields)?;
                stmt.execute(params![
                    job_id,
                    platform_id,
                    record.kind.as_str(),
                    record.external_id,
                    fields,
                    stored_at,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }
}

#[async_trait]
impl ResultSink for SqliteResultSink {
    async fn save(&self, job_id: &str, platform_id: &str, records: &[RawRecord]) -> SinkResult<()> {
        self.save_blocking(job_id, platform_id, records)
    }
}

#[derive(Debug, Clone)]
pub struct StoredBatch {
    pub job_id: String,
    pub platform_id: String,
    pub records: Vec<RawRecord>,
}

/// Keeps saved batches in memory.
#[derive(Debug, Default)]
pub struct MemoryResultSink {
    batches: Mutex<Vec<StoredBatch>>,
}

impl MemoryResultSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn batches(&self) -> Vec<StoredBatch> {
        match self.batches.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

#[async_trait]
impl ResultSink for MemoryResultSink {
    async fn save(&self, job_id: &str, platform_id: &str, records: &[RawRecord]) -> SinkResult<()> {
        let batch = StoredBatch {
            job_id: job_id.to_string(),
            platform_id: platform_id.to_string(),
            records: records.to_vec(),
        };
        match self.batches.lock() {
            Ok(mut guard) => guard.push(batch),
            Err(poisoned) => poisoned.into_inner().push(batch),
        }
        Ok(())
    }
}
