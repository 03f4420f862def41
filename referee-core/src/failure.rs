//! Failure taxonomy shared by every stage of a job.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Classification assigned at the point of failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    TransientNetwork,
    Timeout,
    ResourceExhausted,
    CredentialRejected,
    SecondFactorTimeout,
    UnexpectedPageState,
    Cancelled,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::TransientNetwork => "transient-network",
            ErrorKind::Timeout => "timeout",
            ErrorKind::ResourceExhausted => "resource-exhausted",
            ErrorKind::CredentialRejected => "credential-rejected",
            ErrorKind::SecondFactorTimeout => "second-factor-timeout",
            ErrorKind::UnexpectedPageState => "unexpected-page-state",
            ErrorKind::Cancelled => "cancelled",
        }
    }

    /// Kinds that stop a job immediately, whatever the retry budget.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ErrorKind::CredentialRejected | ErrorKind::UnexpectedPageState | ErrorKind::Cancelled
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ErrorKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "transient-network" => Ok(ErrorKind::TransientNetwork),
            "timeout" => Ok(ErrorKind::Timeout),
            "resource-exhausted" => Ok(ErrorKind::ResourceExhausted),
            "credential-rejected" => Ok(ErrorKind::CredentialRejected),
            "second-factor-timeout" => Ok(ErrorKind::SecondFactorTimeout),
            "unexpected-page-state" => Ok(ErrorKind::UnexpectedPageState),
            "cancelled" => Ok(ErrorKind::Cancelled),
            other => Err(format!("unknown error kind: {other}")),
        }
    }
}

/// Operation families with independent retry ceilings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OperationKind {
    Navigation,
    ResourceAcquisition,
    Authentication,
    Extraction,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Navigation => "navigation",
            OperationKind::ResourceAcquisition => "resource-acquisition",
            OperationKind::Authentication => "authentication",
            OperationKind::Extraction => "extraction",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The only failure shape a job ever reports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractionError {
    pub kind: ErrorKind,
    pub message: String,
    pub retryable: bool,
    pub step_at_failure: Option<String>,
}

impl ExtractionError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            retryable: !kind.is_fatal() && kind != ErrorKind::ResourceExhausted,
            step_at_failure: None,
        }
    }

    pub fn at_step(mut self, step: impl Into<String>) -> Self {
        self.step_at_failure = Some(step.into());
        self
    }

    pub fn cancelled(step: impl Into<String>) -> Self {
        Self::new(ErrorKind::Cancelled, "job cancelled").at_step(step)
    }
}

impl fmt::Display for ExtractionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.step_at_failure {
            Some(step) => write!(f, "{} at {}: {}", self.kind, step, self.message),
            None => write!(f, "{}: {}", self.kind, self.message),
        }
    }
}

impl std::error::Error for ExtractionError {}
