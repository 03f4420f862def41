use std::fs::{create_dir_all, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OpenFlags};
use serde::Serialize;
use thiserror::Error;

use crate::failure::{ErrorKind, ExtractionError, OperationKind};

use super::error::{BrowserError, BrowserResult};

/// Maps engine errors onto the job failure taxonomy.
pub struct ErrorCategorizer;

impl ErrorCategorizer {
    pub fn categorize(error: &BrowserError) -> ErrorKind {
        match error {
            BrowserError::Timeout(_) => ErrorKind::Timeout,
            BrowserError::Navigation(message) => classify_network_text(message),
            BrowserError::Cdp(err) => {
                let text = err.to_string().to_lowercase();
                if text.contains("timeout") || text.contains("timed out") {
                    ErrorKind::Timeout
                } else if is_network_text(&text) || error.is_engine_failure() {
                    ErrorKind::TransientNetwork
                } else {
                    ErrorKind::UnexpectedPageState
                }
            }
            BrowserError::Io(_) | BrowserError::Launch(_) | BrowserError::ProcessGone(_) => {
                ErrorKind::TransientNetwork
            }
            BrowserError::ElementNotFound(_) | BrowserError::Script(_) | BrowserError::State(_) => {
                ErrorKind::UnexpectedPageState
            }
            BrowserError::Popup(message) => {
                if message.to_lowercase().contains("within") {
                    ErrorKind::Timeout
                } else {
                    ErrorKind::UnexpectedPageState
                }
            }
            BrowserError::Configuration(_)
            | BrowserError::Profile(_)
            | BrowserError::Unexpected(_) => ErrorKind::UnexpectedPageState,
        }
    }

    pub fn to_extraction_error(error: &BrowserError, step: &str) -> ExtractionError {
        ExtractionError::new(Self::categorize(error), error.to_string()).at_step(step)
    }
}

fn is_network_text(text: &str) -> bool {
    text.contains("net::err")
        || text.contains("connection")
        || text.contains("dns")
        || text.contains("reset")
        || text.contains("unreachable")
}

fn classify_network_text(message: &str) -> ErrorKind {
    let lower = message.to_lowercase();
    if lower.contains("timeout") || lower.contains("timed out") {
        ErrorKind::Timeout
    } else if is_network_text(&lower) {
        ErrorKind::TransientNetwork
    } else {
        ErrorKind::UnexpectedPageState
    }
}

#[derive(Debug, Clone, Serialize)]
pub enum RemediationAction {
    RetryScheduled { delay_ms: u64 },
    GiveUp,
}

#[derive(Debug, Clone, Serialize)]
pub struct FailureContext {
    pub timestamp: DateTime<Utc>,
    pub job_id: String,
    pub platform: String,
    pub operation: OperationKind,
    pub kind: ErrorKind,
    pub step: Option<String>,
    pub error_message: String,
    pub attempt: u32,
    pub action: RemediationAction,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunContext {
    pub timestamp: DateTime<Utc>,
    pub job_id: String,
    pub platform: String,
    pub success: bool,
    pub kind: Option<ErrorKind>,
    pub record_count: usize,
    pub duration_ms: i64,
    pub used_cached_session: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolEventKind {
    Poisoned,
    Respawned,
    RespawnFailed,
    ProbeFailed,
    AcquireTimeout,
    Leaked,
}

impl PoolEventKind {
    fn as_str(&self) -> &'static str {
        match self {
            PoolEventKind::Poisoned => "poisoned",
            PoolEventKind::Respawned => "respawned",
            PoolEventKind::RespawnFailed => "respawn_failed",
            PoolEventKind::ProbeFailed => "probe_failed",
            PoolEventKind::AcquireTimeout => "acquire_timeout",
            PoolEventKind::Leaked => "leaked",
        }
    }
}

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl From<TelemetryError> for BrowserError {
    fn from(error: TelemetryError) -> Self {
        BrowserError::Unexpected(format!("telemetry: {error}"))
    }
}

#[derive(Debug)]
pub struct AutomationTelemetry {
    log: Mutex<File>,
    db_path: PathBuf,
    flags: OpenFlags,
}

impl AutomationTelemetry {
    pub fn new(
        log_path: impl AsRef<Path>,
        db_path: impl AsRef<Path>,
    ) -> Result<Self, TelemetryError> {
        let log_path = log_path.as_ref().to_path_buf();
        if let Some(parent) = log_path.parent() {
            create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)?;
        let db_path = db_path.as_ref().to_path_buf();
        if let Some(parent) = db_path.parent() {
            create_dir_all(parent)?;
        }
        let telemetry = Self {
            log: Mutex::new(file),
            db_path,
            flags: OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE,
        };
        telemetry.initialize_db()?;
        Ok(telemetry)
    }

    fn initialize_db(&self) -> Result<(), TelemetryError> {
        let conn = self.open_db()?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS auth_failures (
                ts DATETIME DEFAULT CURRENT_TIMESTAMP,
                job_id TEXT,
                platform TEXT,
                operation TEXT,
                kind TEXT,
                step TEXT,
                error_message TEXT,
                attempt INTEGER,
                remediation TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_auth_failures_ts ON auth_failures(ts DESC);
            CREATE TABLE IF NOT EXISTS job_runs (
                ts DATETIME DEFAULT CURRENT_TIMESTAMP,
                job_id TEXT,
                platform TEXT,
                success INTEGER,
                kind TEXT,
                record_count INTEGER,
                duration_ms INTEGER,
                cached_session INTEGER
            );
            CREATE INDEX IF NOT EXISTS idx_job_runs_ts ON job_runs(ts DESC);
            CREATE TABLE IF NOT EXISTS pool_events (
                ts DATETIME DEFAULT CURRENT_TIMESTAMP,
                event TEXT,
                process_id TEXT,
                detail TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_pool_events_ts ON pool_events(ts DESC);",
        )?;
        Ok(())
    }

    fn open_db(&self) -> Result<Connection, TelemetryError> {
        Ok(Connection::open_with_flags(&self.db_path, self.flags)?)
    }

    pub fn record_failure(&self, failure: &FailureContext) -> Result<(), TelemetryError> {
        let json = serde_json::to_string(failure)?;
        if let Ok(mut guard) = self.log.lock() {
            writeln!(guard, "{json}")?;
            guard.flush()?;
        }
        let conn = self.open_db()?;
        conn.execute(
            "INSERT INTO auth_failures (job_id, platform, operation, kind, step, error_message, attempt, remediation)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                failure.job_id,
                failure.platform,
                failure.operation.as_str(),
                failure.kind.as_str(),
                failure.step.clone().unwrap_or_default(),
                failure.error_message,
                failure.attempt as i64,
                format!("{:?}", failure.action),
            ],
        )?;
        Ok(())
    }

    pub fn record_run(&self, run: &RunContext) -> Result<(), TelemetryError> {
        let conn = self.open_db()?;
        conn.execute(
            "INSERT INTO job_runs (
                job_id, platform, success, kind, record_count, duration_ms, cached_session
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                run.job_id,
                run.platform,
                if run.success { 1 } else { 0 },
                run.kind.map(|kind| kind.as_str()).unwrap_or_default(),
                run.record_count as i64,
                run.duration_ms,
                if run.used_cached_session { 1 } else { 0 },
            ],
        )?;
        Ok(())
    }

    pub fn record_pool_event(
        &self,
        event: PoolEventKind,
        process_id: &str,
        detail: &str,
    ) -> Result<(), TelemetryError> {
        let conn = self.open_db()?;
        conn.execute(
            "INSERT INTO pool_events (event, process_id, detail) VALUES (?1, ?2, ?3)",
            params![event.as_str(), process_id, detail],
        )?;
        Ok(())
    }

    pub fn database_path(&self) -> &Path {
        &self.db_path
    }
}

pub fn map_category(error: &BrowserError) -> ErrorKind {
    ErrorCategorizer::categorize(error)
}

pub fn telemetry_failure(
    telemetry: &AutomationTelemetry,
    job_id: &str,
    platform: &str,
    operation: OperationKind,
    error: &ExtractionError,
    attempt: u32,
    action: RemediationAction,
) -> BrowserResult<()> {
    let entry = FailureContext {
        timestamp: Utc::now(),
        job_id: job_id.to_string(),
        platform: platform.to_string(),
        operation,
        kind: error.kind,
        step: error.step_at_failure.clone(),
        error_message: error.message.clone(),
        attempt,
        action,
    };
    telemetry.record_failure(&entry)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn categorize_engine_errors() {
        assert_eq!(
            ErrorCategorizer::categorize(&BrowserError::Timeout("login form".into())),
            ErrorKind::Timeout
        );
        assert_eq!(
            ErrorCategorizer::categorize(&BrowserError::Navigation(
                "https://mc.manuscriptcentral.com: net::ERR_CONNECTION_RESET".into()
            )),
            ErrorKind::TransientNetwork
        );
        assert_eq!(
            ErrorCategorizer::categorize(&BrowserError::ElementNotFound("#USERID".into())),
            ErrorKind::UnexpectedPageState
        );
        assert_eq!(
            ErrorCategorizer::categorize(&BrowserError::ProcessGone("crashed".into())),
            ErrorKind::TransientNetwork
        );
    }

    #[test]
    fn extraction_error_keeps_step() {
        let err = ErrorCategorizer::to_extraction_error(
            &BrowserError::ElementNotFound("#PASSWORD".into()),
            "fill-secret",
        );
        assert_eq!(err.kind, ErrorKind::UnexpectedPageState);
        assert_eq!(err.step_at_failure.as_deref(), Some("fill-secret"));
        assert!(!err.retryable);
    }

    #[test]
    fn telemetry_persists_entries() {
        let dir = tempdir().unwrap();
        let log_path = dir.path().join("failures.log");
        let db_path = dir.path().join("metrics.sqlite");
        let telemetry = AutomationTelemetry::new(&log_path, &db_path).unwrap();

        let error = ExtractionError::new(ErrorKind::SecondFactorTimeout, "no code in inbox")
            .at_step("second-factor");
        telemetry_failure(
            &telemetry,
            "job-1",
            "mf",
            OperationKind::Authentication,
            &error,
            1,
            RemediationAction::GiveUp,
        )
        .unwrap();
        telemetry
            .record_run(&RunContext {
                timestamp: Utc::now(),
                job_id: "job-1".into(),
                platform: "mf".into(),
                success: false,
                kind: Some(ErrorKind::SecondFactorTimeout),
                record_count: 0,
                duration_ms: 1200,
                used_cached_session: false,
            })
            .unwrap();
        telemetry
            .record_pool_event(PoolEventKind::Poisoned, "proc-1", "probe failed")
            .unwrap();

        let log_contents = std::fs::read_to_string(&log_path).unwrap();
        assert!(log_contents.contains("no code in inbox"));

        let conn = Connection::open(&db_path).unwrap();
        let count = |table: &str| -> i64 {
            conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))
                .unwrap()
        };
        assert_eq!(count("auth_failures"), 1);
        assert_eq!(count("job_runs"), 1);
        assert_eq!(count("pool_events"), 1);
        let kind: String = conn
            .query_row("SELECT kind FROM auth_failures", [], |row| row.get(0))
            .unwrap();
        assert_eq!(kind, "second-factor-timeout");
    }
}
