use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::failure::{ExtractionError, OperationKind};
use crate::platform::RawRecord;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for JobId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    AuthPending,
    Extracting,
    Succeeded,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::AuthPending => "auth_pending",
            JobStatus::Extracting => "extracting",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
        }
    }

    fn rank(&self) -> u8 {
        match self {
            JobStatus::Queued => 0,
            JobStatus::AuthPending => 1,
            JobStatus::Extracting => 2,
            JobStatus::Succeeded | JobStatus::Failed => 3,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Succeeded | JobStatus::Failed)
    }

    /// Forward only; any non-terminal status may jump straight to `Failed`.
    pub fn can_advance_to(&self, next: JobStatus) -> bool {
        !self.is_terminal() && next.rank() > self.rank()
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ExtractionResult {
    pub record_count: usize,
    pub records: Vec<RawRecord>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum JobOutcome {
    Succeeded(ExtractionResult),
    Failed(ExtractionError),
}

#[derive(Debug, Clone, Serialize)]
pub struct ExtractionJob {
    pub id: JobId,
    pub platform_id: String,
    pub requested_at: DateTime<Utc>,
    pub status: JobStatus,
    pub outcome: Option<JobOutcome>,
    pub attempts: BTreeMap<OperationKind, u32>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub used_cached_session: bool,
}

impl ExtractionJob {
    pub fn new(platform_id: impl Into<String>) -> Self {
        Self {
            id: JobId::new(),
            platform_id: platform_id.into(),
            requested_at: Utc::now(),
            status: JobStatus::Queued,
            outcome: None,
            attempts: BTreeMap::new(),
            started_at: None,
            finished_at: None,
            used_cached_session: false,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Returns false and leaves the job untouched when `next` would go backwards.
    pub(crate) fn advance(&mut self, next: JobStatus) -> bool {
        if !self.status.can_advance_to(next) || next.is_terminal() {
            return false;
        }
        if self.started_at.is_none() {
            self.started_at = Some(Utc::now());
        }
        self.status = next;
        true
    }

    pub(crate) fn finish(&mut self, outcome: Result<ExtractionResult, ExtractionError>) -> bool {
        let next = match outcome {
            Ok(_) => JobStatus::Succeeded,
            Err(_) => JobStatus::Failed,
        };
        if !self.status.can_advance_to(next) {
            return false;
        }
        self.status = next;
        self.finished_at = Some(Utc::now());
        self.outcome = Some(match outcome {
            Ok(result) => JobOutcome::Succeeded(result),
            Err(error) => JobOutcome::Failed(error),
        });
        true
    }

    pub fn error(&self) -> Option<&ExtractionError> {
        match &self.outcome {
            Some(JobOutcome::Failed(error)) => Some(error),
            _ => None,
        }
    }

    pub fn result(&self) -> Option<&ExtractionResult> {
        match &self.outcome {
            Some(JobOutcome::Succeeded(result)) => Some(result),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::failure::ErrorKind;

    #[test]
    fn status_only_moves_forward() {
        let mut job = ExtractionJob::new("mf");
        assert!(job.advance(JobStatus::AuthPending));
        assert!(job.advance(JobStatus::Extracting));
        assert!(!job.advance(JobStatus::AuthPending));
        assert!(job.finish(Ok(ExtractionResult {
            record_count: 0,
            records: Vec::new(),
            duration_ms: 5,
        })));
        assert!(!job.finish(Err(ExtractionError::new(ErrorKind::Timeout, "late"))));
        assert_eq!(job.status, JobStatus::Succeeded);
        assert!(job.result().is_some());
    }

    #[test]
    fn queued_job_can_fail_directly() {
        let mut job = ExtractionJob::new("jota");
        assert!(job.finish(Err(ExtractionError::cancelled("queue"))));
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error().unwrap().kind, ErrorKind::Cancelled);
        assert!(job.started_at.is_none());
    }
}
